use anyhow::Result;
use clap::Parser;
use sparsecnn::{
    config::TrainConfig,
    dataset::{
        mnist::{Mnist, MnistKind},
        LoadDataset,
    },
    network::{Architecture, Network},
    picture::Distortion,
    trainer::Trainer,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Trains a DeepCNet on MNIST.")]
struct Options {
    /// Folder containing the "mnist" or "fashion-mnist" folder.
    #[arg(long, default_value = "Data")]
    data: PathBuf,
    /// Use FashionMNIST.
    #[arg(long)]
    fashion: bool,
    /// Training options as JSON.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Pooling layers, the input side is 3 · 2^l.
    #[arg(short, long, default_value_t = 5)]
    l: usize,
    /// Filters of the first layer.
    #[arg(short, long, default_value_t = 20)]
    k: usize,
    /// Dropout per layer, comma separated.
    #[arg(long, value_delimiter = ',')]
    dropout: Vec<f32>,
    /// Translate training pictures by up to this many pixels.
    #[arg(long)]
    jiggle: Option<i32>,
    /// Training batches to run.
    #[arg(long, default_value_t = 100_000)]
    batches: usize,
    /// Hold out 20% of the training set instead of testing on the test set.
    #[arg(long)]
    validation: bool,
    /// Resume from the checkpoint of this epoch.
    #[arg(long)]
    start_epoch: Option<usize>,
    /// GEMM threads, 0 for one per core.
    #[arg(long, default_value_t = 0)]
    threads: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();
    let options = Options::parse();
    info!("{options:#?}");
    let mut config = match options.config.as_ref() {
        Some(path) => TrainConfig::from_json_file(path)?,
        None => TrainConfig {
            checkpoint_name: "mnist".into(),
            ..TrainConfig::default()
        },
    };
    if let Some(radius) = options.jiggle {
        config = config.with_distortion(Distortion::Jiggle { radius });
    }
    if let Some(start_epoch) = options.start_epoch {
        config = config.with_start_epoch(start_epoch);
    }
    let kind = if options.fashion {
        MnistKind::Fashion
    } else {
        MnistKind::Digits
    };
    let mut dataset = Mnist::builder()
        .path(&options.data)
        .kind(kind)
        .build()
        .load()?;
    if options.validation {
        dataset.replace_test_with_validation(0.8);
    }
    let architecture = Architecture::DeepCNet {
        l: options.l,
        k: options.k,
    };
    let side = 3 << options.l;
    let layers = architecture.layers(side, dataset.classes(), &options.dropout, &[])?;
    let network = Network::builder(side, 1)
        .layers(layers)
        .sgd(config.sgd()?)
        .threads(options.threads)
        .seed(config.seed)
        .checkpoints(config.checkpoints())
        .build()?;
    let mut trainer = Trainer::new(network, dataset, config)?;
    trainer.initialize()?;
    let stats = trainer.train_test(options.batches)?;
    info!(
        "Trained {} batches, {:.2}% mistakes.",
        stats.batches,
        stats.error_rate()
    );
    trainer.test()?;
    Ok(())
}
