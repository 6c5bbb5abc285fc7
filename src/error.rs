use std::path::PathBuf;

/// Errors in the definition of a network or training run.
///
/// These are detected while building the [`Network`](crate::network::Network) and are not
/// recoverable.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// The filter does not fit into the layer input.
    #[error("filter size {filter} is too big for layer {layer} with input side {input_side}")]
    FilterTooLarge {
        layer: usize,
        filter: usize,
        input_side: usize,
    },
    /// The pooling window does not tile the output of the filters.
    #[error("pool size {pool} does not divide the filter output side {conv_side} of layer {layer}")]
    PoolDoesNotDivide {
        layer: usize,
        pool: usize,
        conv_side: usize,
    },
    /// A per layer option array has the wrong length.
    #[error("need {expected} {what} values, found {found}")]
    DepthMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("the network has no layers")]
    NoLayers,
    /// Softmax is only valid on the top layer.
    #[error("softmax is only valid as the final layer, found on layer {layer}")]
    SoftmaxNotLast { layer: usize },
    /// The loss gradient assumes a softmax top layer.
    #[error("the final layer must use softmax")]
    FinalNotSoftmax,
    /// The top layer must reduce every sample to a single output vector.
    #[error("the final layer must have output side 1, found {side}")]
    FinalSpatialSize { side: usize },
    /// A preset architecture requires a specific input side.
    #[error("input side should be {expected}, found {found}")]
    InputSideMismatch { expected: usize, found: usize },
    #[error("{what} = {value} is out of range")]
    InvalidRate { what: &'static str, value: f32 },
}

/// Errors reading or writing weight checkpoints.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum CheckpointError {
    #[error("cannot find checkpoint {path:?}")]
    Missing { path: PathBuf },
    /// The checkpoint does not hold the expected number of floats.
    #[error("checkpoint holds {found} bytes, expected {expected}")]
    ShapeMismatch { expected: usize, found: usize },
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum DatasetError {
    /// A random picture was requested from an empty collection.
    #[error("cannot draw from an empty {0} collection")]
    Empty(&'static str),
    #[error("malformed dataset file: {0}")]
    Format(String),
}

/// Numerical invariants checked after the forward pass.
#[derive(Clone, Copy, Debug, PartialEq, thiserror::Error)]
pub enum NumericError {
    #[error("non finite activation in the output of layer {layer}")]
    NonFinite { layer: usize },
}

/// Operand shapes of a matrix multiply do not agree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("cannot multiply {a:?} by {b:?} into {c:?}")]
pub struct ShapeError {
    pub a: [usize; 2],
    pub b: [usize; 2],
    pub c: [usize; 2],
}
