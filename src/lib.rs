/*!
# sparsecnn
Convolutional networks over sparse grids, for handwritten characters and other small images
where most cells are empty.

Every sample is a grid of feature vectors in which empty cells share one background vector. Each
layer computes only the distinct receptive fields of the batch: a convolution window that covers
nothing but background is computed once per sample and shared by all such windows, so
background stays collapsed through the depth of the network.

# Example
```no_run
# use sparsecnn::{
#     config::TrainConfig,
#     dataset::Dataset,
#     network::{Architecture, Network},
#     trainer::Trainer,
# };
# fn main() -> anyhow::Result<()> {
# let dataset = Dataset::default();
let architecture = Architecture::DeepCNet { l: 5, k: 60 };
let layers = architecture.layers(96, 10, &[], &[])?;
let config = TrainConfig::default();
let network = Network::builder(96, 1)
    .layers(layers)
    .sgd(config.sgd()?)
    .checkpoints(config.checkpoints())
    .build()?;
let mut trainer = Trainer::new(network, dataset, config)?;
trainer.initialize()?;
trainer.train_test(100_000)?;
# Ok(())
# }
```
*/
#![cfg_attr(doc_cfg, feature(doc_auto_cfg))]

/// Random number generation.
pub mod rng;
/// Sparse mini-batches.
pub mod batch;
/// Pictures and their encoding into batches.
pub mod picture;
/// Training and test collections.
pub mod dataset;
/// Rule generation.
pub mod rules;
/// Matrix multiplication.
pub mod gemm;
/// Layers.
pub mod layer;
/// Optimizers.
pub mod optimizer;
/// Forward and backward passes.
pub mod engine;
/// Networks.
pub mod network;
/// Batch production.
pub mod pipeline;
/// Training and evaluation loops.
pub mod trainer;
/// Configuration.
pub mod config;
/// Errors.
pub mod error;
