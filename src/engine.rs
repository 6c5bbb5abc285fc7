use crate::{
    batch::BatchKind,
    error::NumericError,
    gemm::Gemm,
    layer::{Activation, ConvolutionalLayer, LayerGeometry},
    optimizer::{LayerGradients, Sgd},
    rng::Rng,
    rules::LayerRules,
};
use anyhow::Result;
use ndarray::{Array2, Axis};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

mod kernels;

/// Per batch buffers of one layer, released when the pass is dropped.
#[derive(Debug)]
pub struct LayerPass {
    input_rows: usize,
    dropout: Option<Array2<f32>>,
    unfolded: Array2<f32>,
    maxout_choice: Option<Array2<usize>>,
    pool_choice: Option<Array2<usize>>,
    output: Array2<f32>,
}

impl LayerPass {
    /// `[output vectors, outputs]` activations.
    pub fn output(&self) -> &Array2<f32> {
        &self.output
    }
    pub(crate) fn output_mut(&mut self) -> &mut Array2<f32> {
        &mut self.output
    }
}

/// Executes the forward and backward passes of one [`ConvolutionalLayer`].
///
/// The layer is behind a lock, passes read it concurrently and [`.update()`](Self::update) is
/// exclusive.
#[derive(Debug)]
pub struct LayerEngine {
    index: usize,
    geometry: LayerGeometry,
    layer: RwLock<ConvolutionalLayer>,
    gemm: Gemm,
}

impl LayerEngine {
    pub fn new(index: usize, layer: ConvolutionalLayer, gemm: Gemm) -> Self {
        Self {
            index,
            geometry: *layer.geometry(),
            layer: RwLock::new(layer),
            gemm,
        }
    }
    /// The position of the layer in the network.
    pub fn index(&self) -> usize {
        self.index
    }
    pub fn geometry(&self) -> &LayerGeometry {
        &self.geometry
    }
    pub fn layer(&self) -> RwLockReadGuard<ConvolutionalLayer> {
        self.layer.read()
    }
    pub fn layer_mut(&self) -> RwLockWriteGuard<ConvolutionalLayer> {
        self.layer.write()
    }
    /// Computes the layer output.
    ///
    /// - `input`: `[input vectors, inputs]`, scaled in place by dropout.
    /// - `input_owners`: the sample of each input vector.
    /// - `rules`: the rules of this layer for the batch.
    ///
    /// Train batches draw one dropout mask per sample and input channel from `rng`, other batches
    /// are scaled by the keep probability.
    ///
    /// **Errors**
    ///
    /// [`NumericError::NonFinite`] if the output is not finite.
    pub fn forward(
        &self,
        input: &mut Array2<f32>,
        input_owners: &[usize],
        rules: &LayerRules,
        kind: BatchKind,
        rng: &mut Rng,
    ) -> Result<LayerPass> {
        self.gemm
            .install(|| self.forward_impl(input, input_owners, rules, kind, rng))
    }
    fn forward_impl(
        &self,
        input: &mut Array2<f32>,
        input_owners: &[usize],
        rules: &LayerRules,
        kind: BatchKind,
        rng: &mut Rng,
    ) -> Result<LayerPass> {
        let layer = self.layer.read();
        let dropout = layer.spec().dropout;
        let mask = if dropout > 0. {
            if kind == BatchKind::Train {
                let samples = rules.middle.sample_count();
                let keep = Array2::from_shape_simple_fn([samples, layer.inputs()], || {
                    rng.bernoulli(1. - dropout) as u8 as f32
                });
                kernels::scale_rows(input.view_mut(), keep.view(), input_owners);
                Some(keep)
            } else {
                input.par_mapv_inplace(|x| x * (1. - dropout));
                None
            }
        } else {
            None
        };
        let unfolded = kernels::gather(input.view(), &rules.conv, self.geometry.filter_area());
        let bias = layer.bias();
        let mut z = Array2::from_shape_fn([unfolded.nrows(), bias.len()], |(_, j)| bias[j]);
        self.gemm.gemm(1., &unfolded, layer.weights(), 1., &mut z)?;
        let (z, maxout_choice) = if layer.maxout() > 1 {
            let (z, choice) = kernels::maxout(z.view(), layer.maxout());
            (z, Some(choice))
        } else {
            (z, None)
        };
        let (mut output, pool_choice) = if self.geometry.pool_size > 1 {
            let (output, choice) = kernels::max_pool(z.view(), &rules.pool, self.geometry.pool_area());
            (output, Some(choice))
        } else {
            (z, None)
        };
        let activation = layer.activation();
        kernels::activate(output.view_mut(), activation);
        if !output.iter().all(|x| x.is_finite()) {
            return Err(NumericError::NonFinite { layer: self.index }.into());
        }
        Ok(LayerPass {
            input_rows: input.nrows(),
            dropout: mask,
            unfolded,
            maxout_choice,
            pool_choice,
            output,
        })
    }
    /// Computes the gradients of the layer from `delta`, the gradient of the loss with respect to
    /// the output of `pass`.
    ///
    /// Returns the gradient with respect to the (dropped out) input if `propagate` is true.
    pub fn backward(
        &self,
        pass: &LayerPass,
        rules: &LayerRules,
        input_owners: &[usize],
        delta: Array2<f32>,
        propagate: bool,
    ) -> Result<(LayerGradients, Option<Array2<f32>>)> {
        self.gemm
            .install(|| self.backward_impl(pass, rules, input_owners, delta, propagate))
    }
    fn backward_impl(
        &self,
        pass: &LayerPass,
        rules: &LayerRules,
        input_owners: &[usize],
        mut delta: Array2<f32>,
        propagate: bool,
    ) -> Result<(LayerGradients, Option<Array2<f32>>)> {
        let layer = self.layer.read();
        let activation = layer.activation();
        kernels::activate_backward(delta.view_mut(), pass.output.view(), activation);
        let delta = match pass.pool_choice.as_ref() {
            Some(choice) => kernels::unpool(delta.view(), choice.view(), pass.unfolded.nrows()),
            None => delta,
        };
        let delta = match pass.maxout_choice.as_ref() {
            Some(choice) => kernels::unmaxout(delta.view(), choice.view(), layer.maxout()),
            None => delta,
        };
        let bias = delta.sum_axis(Axis(0));
        let mut weights = Array2::zeros(layer.weights().raw_dim());
        self.gemm
            .gemm(1., &pass.unfolded.t(), &delta, 0., &mut weights)?;
        let input_delta = if propagate {
            let mut unfolded_delta = Array2::zeros(pass.unfolded.raw_dim());
            self.gemm
                .gemm(1., &delta, &layer.weights().t(), 0., &mut unfolded_delta)?;
            let mut input_delta = Array2::zeros([pass.input_rows, layer.inputs()]);
            kernels::scatter_add(
                input_delta.view_mut(),
                unfolded_delta.view(),
                &rules.conv,
                self.geometry.filter_area(),
            );
            if let Some(keep) = pass.dropout.as_ref() {
                kernels::scale_rows(input_delta.view_mut(), keep.view(), input_owners);
            }
            Some(input_delta)
        } else {
            None
        };
        Ok((LayerGradients { weights, bias }, input_delta))
    }
    /// Applies `gradients` after `batches_completed` training batches.
    pub fn update(&self, sgd: &Sgd, batches_completed: usize, gradients: &mut LayerGradients) {
        let mut guard = self.layer.write();
        let layer = &mut *guard;
        self.gemm
            .install(|| sgd.update(batches_completed, layer, gradients));
    }
    /// The activation of the layer after maxout.
    pub fn activation(&self) -> Activation {
        self.layer.read().activation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        batch::SparseBatch,
        layer::LayerSpec,
        rules::SparseGrids,
    };
    use approx::assert_relative_eq;

    fn engine(input_side: usize, inputs: usize, spec: LayerSpec) -> LayerEngine {
        let geometry =
            LayerGeometry::new(input_side, spec.filter_size, spec.pool_size).unwrap();
        let layer = ConvolutionalLayer::new(geometry, inputs, spec, &mut Rng::from_seed(0));
        LayerEngine::new(0, layer, Gemm::new(1).unwrap())
    }

    fn features(batch: &SparseBatch) -> Array2<f32> {
        Array2::from_shape_vec(
            [batch.vector_count(), batch.feature_width()],
            batch.features().to_vec(),
        )
        .unwrap()
    }

    #[test]
    fn identity_filter_copies_input() {
        let engine = engine(3, 1, LayerSpec::new(1, 1, 1, Activation::Identity));
        engine.layer_mut().weights_mut().fill(2.);
        engine.layer_mut().bias_mut().fill(0.5);
        let mut batch = SparseBatch::new(BatchKind::Test, 3, 1);
        batch.push_sample(None, |w| w.write(4, [3.]));
        let rules = LayerRules::new(engine.geometry(), &SparseGrids::from_batch(&batch));
        let mut input = features(&batch);
        let pass = engine
            .forward(
                &mut input,
                batch.owner_of_vector(),
                &rules,
                BatchKind::Test,
                &mut Rng::from_seed(0),
            )
            .unwrap();
        assert_eq!(pass.output().nrows(), 2);
        assert_relative_eq!(pass.output()[(0, 0)], 0.5);
        assert_relative_eq!(pass.output()[(1, 0)], 6.5);
    }

    #[test]
    fn background_rows_are_computed_once() {
        let engine = engine(6, 1, LayerSpec::new(3, 2, 4, Activation::Tanh));
        let mut batch = SparseBatch::new(BatchKind::Train, 6, 1);
        batch.push_sample(Some(0), |_| {});
        let rules = LayerRules::new(engine.geometry(), &SparseGrids::from_batch(&batch));
        let mut input = features(&batch);
        let pass = engine
            .forward(
                &mut input,
                batch.owner_of_vector(),
                &rules,
                BatchKind::Train,
                &mut Rng::from_seed(0),
            )
            .unwrap();
        assert_eq!(pass.unfolded.nrows(), 1);
        assert_eq!(pass.output().dim(), (1, 4));
        // zero input and zero bias
        assert!(pass.output().iter().all(|x| *x == 0.));
    }

    #[test]
    fn dropout_masks_whole_channels() {
        let spec = LayerSpec::new(1, 1, 2, Activation::Identity).with_dropout(0.5);
        let engine = engine(2, 3, spec);
        let mut batch = SparseBatch::new(BatchKind::Train, 2, 3);
        batch.push_sample(Some(0), |w| {
            for cell in 0..4 {
                w.write(cell, [1., 1., 1.]);
            }
        });
        let rules = LayerRules::new(engine.geometry(), &SparseGrids::from_batch(&batch));
        let mut input = features(&batch);
        let pass = engine
            .forward(
                &mut input,
                batch.owner_of_vector(),
                &rules,
                BatchKind::Train,
                &mut Rng::from_seed(3),
            )
            .unwrap();
        let keep = pass.dropout.as_ref().unwrap();
        for row in input.rows().into_iter().skip(1) {
            assert_eq!(row, keep.row(0));
        }
        let mut test_input = features(&batch);
        engine
            .forward(
                &mut test_input,
                batch.owner_of_vector(),
                &rules,
                BatchKind::Test,
                &mut Rng::from_seed(3),
            )
            .unwrap();
        assert!(test_input.rows().into_iter().skip(1).flatten().all(|x| *x == 0.5));
    }

    #[test]
    fn dropout_masks_input_gradient() {
        let spec = LayerSpec::new(2, 1, 3, Activation::Identity);
        let dropped = engine(2, 8, spec.with_dropout(0.5));
        let reference = engine(2, 8, spec);
        *reference.layer_mut().weights_mut() = dropped.layer().weights().clone();
        let mut batch = SparseBatch::new(BatchKind::Train, 2, 8);
        for sample in 0..2 {
            batch.push_sample(Some(sample), |w| {
                for cell in 0..4 {
                    w.write(cell, (0..8).map(|c| (cell + c) as f32 / 8.));
                }
            });
        }
        let rules = LayerRules::new(dropped.geometry(), &SparseGrids::from_batch(&batch));
        let owners = batch.owner_of_vector();
        let run = |engine: &LayerEngine, rng: &mut Rng| {
            let pass = engine
                .forward(&mut features(&batch), owners, &rules, BatchKind::Train, rng)
                .unwrap();
            let delta = Array2::from_shape_fn(pass.output().raw_dim(), |(i, j)| {
                (i + 2 * j) as f32 - 1.5
            });
            let (_, input_delta) = engine
                .backward(&pass, &rules, owners, delta, true)
                .unwrap();
            (pass.dropout.clone(), input_delta.unwrap())
        };
        let (keep, input_delta) = run(&dropped, &mut Rng::from_seed(7));
        let (no_mask, expected) = run(&reference, &mut Rng::from_seed(7));
        let keep = keep.unwrap();
        assert!(no_mask.is_none());
        assert!(keep.iter().any(|x| *x == 0.) && keep.iter().any(|x| *x == 1.));
        assert_eq!(input_delta.dim(), expected.dim());
        for ((v, c), x) in input_delta.indexed_iter() {
            if keep[(owners[v], c)] == 0. {
                assert_eq!(*x, 0.);
            } else {
                assert_eq!(*x, expected[(v, c)]);
            }
        }
    }

    #[test]
    fn non_finite_output_is_an_error() {
        let engine = engine(2, 1, LayerSpec::new(1, 1, 1, Activation::Identity));
        engine.layer_mut().bias_mut().fill(f32::NAN);
        let mut batch = SparseBatch::new(BatchKind::Test, 2, 1);
        batch.push_sample(None, |_| {});
        let rules = LayerRules::new(engine.geometry(), &SparseGrids::from_batch(&batch));
        let error = engine
            .forward(
                &mut features(&batch),
                batch.owner_of_vector(),
                &rules,
                BatchKind::Test,
                &mut Rng::from_seed(0),
            )
            .unwrap_err();
        assert_eq!(
            error.downcast_ref::<NumericError>(),
            Some(&NumericError::NonFinite { layer: 0 })
        );
    }
}
