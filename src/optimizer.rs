use crate::{error::ConfigError, layer::ConvolutionalLayer};
use anyhow::Result;
use ndarray::{Array1, Array2, Zip};
use serde::{Deserialize, Serialize};

/// Optimizer builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`Sgd`].
    pub struct SgdBuilder {
        learning_rate: f32,
        learning_rate_decay: f32,
        momentum_decay_rate: f32,
        weight_decay_rate: f32,
    }

    impl SgdBuilder {
        pub(super) fn new() -> Self {
            Self {
                learning_rate: 0.003,
                learning_rate_decay: 0.,
                momentum_decay_rate: 0.1,
                weight_decay_rate: 0.,
            }
        }
        /// Base learning rate. Default is 0.003.
        pub fn learning_rate(self, learning_rate: f32) -> Self {
            Self {
                learning_rate,
                ..self
            }
        }
        /// Exponential decay of the learning rate per completed batch. Default is 0.
        pub fn learning_rate_decay(self, learning_rate_decay: f32) -> Self {
            Self {
                learning_rate_decay,
                ..self
            }
        }
        /// Weight of the new gradient in the momentum. Default is 0.1.
        pub fn momentum_decay_rate(self, momentum_decay_rate: f32) -> Self {
            Self {
                momentum_decay_rate,
                ..self
            }
        }
        /// L2 weight decay. Default is 0.
        pub fn weight_decay_rate(self, weight_decay_rate: f32) -> Self {
            Self {
                weight_decay_rate,
                ..self
            }
        }
        /// Builds the optimizer.
        ///
        /// **Errors**
        ///
        /// [`ConfigError::InvalidRate`] if a rate is negative or not finite, or if the momentum
        /// decay rate is greater than 1.
        pub fn build(self) -> Result<Sgd> {
            let Self {
                learning_rate,
                learning_rate_decay,
                momentum_decay_rate,
                weight_decay_rate,
            } = self;
            for (what, value) in [
                ("learning_rate", learning_rate),
                ("learning_rate_decay", learning_rate_decay),
                ("momentum_decay_rate", momentum_decay_rate),
                ("weight_decay_rate", weight_decay_rate),
            ] {
                if !value.is_finite() || value < 0. {
                    return Err(ConfigError::InvalidRate { what, value }.into());
                }
            }
            if momentum_decay_rate > 1. {
                return Err(ConfigError::InvalidRate {
                    what: "momentum_decay_rate",
                    value: momentum_decay_rate,
                }
                .into());
            }
            Ok(Sgd {
                learning_rate,
                learning_rate_decay,
                momentum_decay_rate,
                weight_decay_rate,
            })
        }
    }
}
use builder::SgdBuilder;

/// Gradients of one layer for one batch.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerGradients {
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
}

/// Gradient descent with momentum and weight decay.
///
/// For every weight `w` with gradient `dw` and momentum `m`:
/// ```text
/// m = m · (1 - momentum_decay_rate) + dw · momentum_decay_rate
/// w = w - learning_rate · (m + w · weight_decay_rate)
/// dw = 0
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sgd {
    learning_rate: f32,
    learning_rate_decay: f32,
    momentum_decay_rate: f32,
    weight_decay_rate: f32,
}

impl Sgd {
    /// A builder for creating a [`Sgd`].
    pub fn builder() -> SgdBuilder {
        SgdBuilder::new()
    }
    /// The learning rate after `batches_completed` training batches.
    pub fn learning_rate(&self, batches_completed: usize) -> f32 {
        self.learning_rate * (-self.learning_rate_decay * batches_completed as f32).exp()
    }
    pub fn momentum_decay_rate(&self) -> f32 {
        self.momentum_decay_rate
    }
    pub fn weight_decay_rate(&self) -> f32 {
        self.weight_decay_rate
    }
    /// Applies `gradients` to `layer` and zeroes them.
    pub fn update(
        &self,
        batches_completed: usize,
        layer: &mut ConvolutionalLayer,
        gradients: &mut LayerGradients,
    ) {
        let learning_rate = self.learning_rate(batches_completed);
        let ((weights, weight_momentum), (bias, bias_momentum)) = layer.parameters_mut();
        Zip::from(weights)
            .and(&mut gradients.weights)
            .and(weight_momentum)
            .par_for_each(|w, dw, m| {
                kernels::gradient_descent(
                    w,
                    dw,
                    learning_rate,
                    self.momentum_decay_rate,
                    self.weight_decay_rate,
                    m,
                )
            });
        Zip::from(bias)
            .and(&mut gradients.bias)
            .and(bias_momentum)
            .for_each(|w, dw, m| {
                kernels::gradient_descent(
                    w,
                    dw,
                    learning_rate,
                    self.momentum_decay_rate,
                    self.weight_decay_rate,
                    m,
                )
            });
    }
}

mod kernels {
    pub fn gradient_descent(w: &mut f32, dw: &mut f32, lr: f32, mdr: f32, wdr: f32, m: &mut f32) {
        *m = *m * (1. - mdr) + *dw * mdr;
        *w -= lr * (*m + *w * wdr);
        *dw = 0.;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layer::{Activation, LayerGeometry, LayerSpec},
        rng::Rng,
    };
    use approx::assert_relative_eq;

    #[test]
    fn momentum_step() {
        let (mut w, mut dw, mut m) = (1f32, 2f32, 0f32);
        kernels::gradient_descent(&mut w, &mut dw, 0.1, 0.5, 0., &mut m);
        assert_relative_eq!(m, 1.);
        assert_relative_eq!(w, 0.9);
        assert_eq!(dw, 0.);
    }

    #[test]
    fn weight_decay_pulls_to_zero() {
        let (mut w, mut dw, mut m) = (2f32, 0f32, 0f32);
        kernels::gradient_descent(&mut w, &mut dw, 0.5, 0.1, 0.1, &mut m);
        assert_relative_eq!(w, 1.9);
    }

    #[test]
    fn learning_rate_schedule() {
        let sgd = Sgd::builder()
            .learning_rate(0.1)
            .learning_rate_decay(0.01)
            .build()
            .unwrap();
        assert_relative_eq!(sgd.learning_rate(0), 0.1);
        assert_relative_eq!(sgd.learning_rate(100), 0.1 * (-1f32).exp());
    }

    #[test]
    fn invalid_rates() {
        assert!(Sgd::builder().learning_rate(-1.).build().is_err());
        assert!(Sgd::builder().momentum_decay_rate(1.5).build().is_err());
        assert!(Sgd::builder().weight_decay_rate(f32::NAN).build().is_err());
    }

    #[test]
    fn update_layer() {
        let geometry = LayerGeometry::new(2, 2, 1).unwrap();
        let spec = LayerSpec::new(2, 1, 1, Activation::Identity);
        let mut layer = ConvolutionalLayer::new(geometry, 1, spec, &mut Rng::from_seed(0));
        layer.weights_mut().fill(1.);
        let mut gradients = LayerGradients {
            weights: Array2::from_elem([4, 1], 2.),
            bias: Array1::from_elem(1, 2.),
        };
        let sgd = Sgd::builder()
            .learning_rate(0.1)
            .momentum_decay_rate(0.5)
            .build()
            .unwrap();
        sgd.update(0, &mut layer, &mut gradients);
        for w in layer.weights().iter() {
            assert_relative_eq!(*w, 0.9);
        }
        assert_relative_eq!(layer.bias()[0], -0.1);
        assert!(gradients.weights.iter().all(|x| *x == 0.));
    }
}
