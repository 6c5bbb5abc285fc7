use crate::{
    error::{CheckpointError, ConfigError},
    rng::Rng,
};
use anyhow::Result;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Side lengths of one layer.
///
/// The convolution is valid (no padding) with stride 1, pooling is non overlapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerGeometry {
    pub input_side: usize,
    pub filter_size: usize,
    /// `input_side - filter_size + 1`
    pub conv_side: usize,
    pub pool_size: usize,
    /// `conv_side / pool_size`
    pub output_side: usize,
}

impl LayerGeometry {
    /// Computes the geometry of a layer.
    ///
    /// **Errors**
    ///
    /// - [`ConfigError::FilterTooLarge`] if the filter is larger than the input.
    /// - [`ConfigError::PoolDoesNotDivide`] if the pool does not tile the convolution output.
    pub fn new(input_side: usize, filter_size: usize, pool_size: usize) -> Result<Self, ConfigError> {
        Self::for_layer(0, input_side, filter_size, pool_size)
    }
    pub(crate) fn for_layer(
        layer: usize,
        input_side: usize,
        filter_size: usize,
        pool_size: usize,
    ) -> Result<Self, ConfigError> {
        if filter_size == 0 || filter_size > input_side {
            return Err(ConfigError::FilterTooLarge {
                layer,
                filter: filter_size,
                input_side,
            });
        }
        let conv_side = input_side - filter_size + 1;
        if pool_size == 0 || conv_side % pool_size != 0 {
            return Err(ConfigError::PoolDoesNotDivide {
                layer,
                pool: pool_size,
                conv_side,
            });
        }
        Ok(Self {
            input_side,
            filter_size,
            conv_side,
            pool_size,
            output_side: conv_side / pool_size,
        })
    }
    /// The number of input cells seen by one filter.
    pub fn filter_area(&self) -> usize {
        self.filter_size * self.filter_size
    }
    pub fn pool_area(&self) -> usize {
        self.pool_size * self.pool_size
    }
}

/// The nonlinearity applied after pooling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    #[default]
    Identity,
    Logistic,
    RectifiedLinear,
    /// Clamps to `[-1, 1]`.
    Blocky,
    Tanh,
    /// Only valid for the final layer.
    Softmax,
}

impl Activation {
    /// Applies the elementwise nonlinearity. [`Softmax`](Self::Softmax) is computed per row by
    /// the engine and is the identity here.
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Self::Identity | Self::Softmax => x,
            Self::Logistic => 1. / (1. + (-x).exp()),
            Self::RectifiedLinear => x.max(0.),
            Self::Blocky => x.clamp(-1., 1.),
            Self::Tanh => x.tanh(),
        }
    }
    /// The derivative at the output value `y`.
    ///
    /// Softmax returns 1, its derivative is folded into the loss gradient.
    pub fn derivative(self, y: f32) -> f32 {
        match self {
            Self::Identity | Self::Softmax => 1.,
            Self::Logistic => y * (1. - y),
            Self::RectifiedLinear => (y > 0.) as u8 as f32,
            Self::Blocky => (-1. < y && y < 1.) as u8 as f32,
            Self::Tanh => 1. - y * y,
        }
    }
}

impl Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Identity => "identity",
            Self::Logistic => "logistic",
            Self::RectifiedLinear => "relu",
            Self::Blocky => "blocky",
            Self::Tanh => "tanh",
            Self::Softmax => "softmax",
        };
        f.write_str(name)
    }
}

/// The definition of one layer of a network.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub filter_size: usize,
    pub pool_size: usize,
    pub outputs: usize,
    pub activation: Activation,
    /// Probability of dropping an input channel while training.
    pub dropout: f32,
    /// Group size of the maxout units, 1 to disable.
    pub maxout: usize,
}

impl LayerSpec {
    /// Creates a new [`LayerSpec`].
    ///
    /// Defaults:
    /// - dropout: 0
    /// - maxout: 1
    pub fn new(filter_size: usize, pool_size: usize, outputs: usize, activation: Activation) -> Self {
        Self {
            filter_size,
            pool_size,
            outputs,
            activation,
            dropout: 0.,
            maxout: 1,
        }
    }
    /// Adds dropout on the input channels.
    pub fn with_dropout(self, dropout: f32) -> Self {
        Self { dropout, ..self }
    }
    /// Uses maxout units with `maxout` candidates each.
    ///
    /// Maxout layers use the identity nonlinearity.
    pub fn with_maxout(self, maxout: usize) -> Self {
        Self { maxout, ..self }
    }
    /// The activation actually used, see [`.with_maxout()`](Self::with_maxout).
    pub fn effective_activation(&self) -> Activation {
        if self.maxout > 1 {
            Activation::Identity
        } else {
            self.activation
        }
    }
}

/// The parameters of one sparse convolutional layer.
///
/// Weights are stored as a `[filter_size² · inputs, outputs · maxout]` matrix whose rows are
/// ordered by filter cell and then input channel. Maxout candidates of one unit are adjacent
/// columns. Momentum buffers have the shapes of the weights and the bias.
#[derive(Clone, Debug, PartialEq)]
pub struct ConvolutionalLayer {
    geometry: LayerGeometry,
    inputs: usize,
    spec: LayerSpec,
    weights: Array2<f32>,
    bias: Array1<f32>,
    weight_momentum: Array2<f32>,
    bias_momentum: Array1<f32>,
}

impl ConvolutionalLayer {
    /// Creates a layer with `inputs` channels.
    ///
    /// The weights are initialized with a uniform distribution of (-a, a) where
    /// a = sqrt(6 / (fan_in + fan_out)), fan_in = inputs · filter_size² and
    /// fan_out = outputs · filter_size² / pool_size². The bias is initialized with 0's.
    pub fn new(geometry: LayerGeometry, inputs: usize, spec: LayerSpec, rng: &mut Rng) -> Self {
        let rows = geometry.filter_area() * inputs;
        let columns = spec.outputs * spec.maxout.max(1);
        let fan_in = rows as f32;
        let fan_out = (spec.outputs * geometry.filter_area()) as f32 / geometry.pool_area() as f32;
        let a = (6. / (fan_in + fan_out)).sqrt();
        let weights = Array2::from_shape_simple_fn([rows, columns], || rng.uniform(-a, a));
        Self {
            geometry,
            inputs,
            spec,
            weights,
            bias: Array1::zeros(columns),
            weight_momentum: Array2::zeros([rows, columns]),
            bias_momentum: Array1::zeros(columns),
        }
    }
    pub fn geometry(&self) -> &LayerGeometry {
        &self.geometry
    }
    pub fn spec(&self) -> &LayerSpec {
        &self.spec
    }
    pub fn inputs(&self) -> usize {
        self.inputs
    }
    pub fn outputs(&self) -> usize {
        self.spec.outputs
    }
    pub fn maxout(&self) -> usize {
        self.spec.maxout.max(1)
    }
    pub fn activation(&self) -> Activation {
        self.spec.effective_activation()
    }
    pub fn weights(&self) -> &Array2<f32> {
        &self.weights
    }
    pub fn weights_mut(&mut self) -> &mut Array2<f32> {
        &mut self.weights
    }
    pub fn bias(&self) -> &Array1<f32> {
        &self.bias
    }
    pub fn bias_mut(&mut self) -> &mut Array1<f32> {
        &mut self.bias
    }
    pub(crate) fn parameters_mut(
        &mut self,
    ) -> (
        (&mut Array2<f32>, &mut Array2<f32>),
        (&mut Array1<f32>, &mut Array1<f32>),
    ) {
        (
            (&mut self.weights, &mut self.weight_momentum),
            (&mut self.bias, &mut self.bias_momentum),
        )
    }
    /// The size of the checkpoint block of this layer.
    pub fn byte_len(&self) -> usize {
        (self.weights.len() + self.bias.len()) * std::mem::size_of::<f32>()
    }
    /// Appends the weights and then the bias as native endian bytes.
    pub fn write_bytes(&self, bytes: &mut Vec<u8>) {
        bytes.reserve(self.byte_len());
        for x in self.weights.iter().chain(self.bias.iter()) {
            bytes.extend_from_slice(bytemuck::bytes_of(x));
        }
    }
    /// Reads a block written by [`.write_bytes()`](Self::write_bytes).
    ///
    /// Momentum is reset to 0.
    ///
    /// **Errors**
    ///
    /// [`CheckpointError::ShapeMismatch`] if `bytes` is not exactly [`.byte_len()`](Self::byte_len).
    pub fn read_bytes(&mut self, bytes: &[u8]) -> Result<(), CheckpointError> {
        if bytes.len() != self.byte_len() {
            return Err(CheckpointError::ShapeMismatch {
                expected: self.byte_len(),
                found: bytes.len(),
            });
        }
        let mut chunks = bytes.chunks_exact(std::mem::size_of::<f32>());
        for (x, chunk) in self
            .weights
            .iter_mut()
            .chain(self.bias.iter_mut())
            .zip(&mut chunks)
        {
            *x = bytemuck::pod_read_unaligned(chunk);
        }
        self.weight_momentum.fill(0.);
        self.bias_momentum.fill(0.);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn geometry_checks() {
        let geometry = LayerGeometry::new(12, 3, 2).unwrap();
        assert_eq!(geometry.conv_side, 10);
        assert_eq!(geometry.output_side, 5);
        assert_eq!(
            LayerGeometry::new(2, 3, 1),
            Err(ConfigError::FilterTooLarge {
                layer: 0,
                filter: 3,
                input_side: 2
            })
        );
        assert_eq!(
            LayerGeometry::for_layer(4, 12, 2, 2),
            Err(ConfigError::PoolDoesNotDivide {
                layer: 4,
                pool: 2,
                conv_side: 11
            })
        );
    }

    #[test]
    fn activation_derivatives() {
        for activation in [
            Activation::Logistic,
            Activation::Tanh,
            Activation::RectifiedLinear,
            Activation::Blocky,
        ] {
            let x = 0.3f32;
            let h = 1e-3;
            let numeric = (activation.apply(x + h) - activation.apply(x - h)) / (2. * h);
            let analytic = activation.derivative(activation.apply(x));
            assert_relative_eq!(numeric, analytic, max_relative = 1e-2);
        }
        assert_eq!(Activation::RectifiedLinear.derivative(0.), 0.);
        assert_eq!(Activation::Blocky.apply(3.), 1.);
        assert_eq!(Activation::Blocky.derivative(1.), 0.);
    }

    #[test]
    fn maxout_forces_identity() {
        let spec = LayerSpec::new(2, 1, 8, Activation::RectifiedLinear).with_maxout(3);
        assert_eq!(spec.effective_activation(), Activation::Identity);
    }

    #[test]
    fn init_range() {
        let geometry = LayerGeometry::new(10, 3, 2).unwrap();
        let spec = LayerSpec::new(3, 2, 16, Activation::RectifiedLinear).with_maxout(2);
        let layer = ConvolutionalLayer::new(geometry, 4, spec, &mut Rng::from_seed(0));
        assert_eq!(layer.weights().dim(), (36, 32));
        let a = (6f32 / (36. + 16. * 9. / 4.)).sqrt();
        assert!(layer.weights().iter().all(|w| w.abs() <= a));
        assert!(layer.bias().iter().all(|b| *b == 0.));
    }

    #[test]
    fn bytes_round_trip() {
        let geometry = LayerGeometry::new(4, 2, 1).unwrap();
        let spec = LayerSpec::new(2, 1, 3, Activation::Tanh);
        let mut rng = Rng::from_seed(1);
        let mut layer = ConvolutionalLayer::new(geometry, 2, spec, &mut rng);
        layer.bias_mut().fill(0.5);
        let mut bytes = Vec::new();
        layer.write_bytes(&mut bytes);
        assert_eq!(bytes.len(), layer.byte_len());
        let mut other = ConvolutionalLayer::new(geometry, 2, spec, &mut rng);
        other.read_bytes(&bytes).unwrap();
        assert_eq!(layer, other);
        assert!(other.read_bytes(&bytes[1..]).is_err());
    }
}
