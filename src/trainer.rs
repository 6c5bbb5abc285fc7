use crate::{
    batch::BatchKind,
    config::TrainConfig,
    dataset::Dataset,
    network::{BatchOutcome, Network},
    picture::Picture,
    pipeline::BatchProducer,
    rng::SeedSequence,
};
use anyhow::Result;
use std::{ops::AddAssign, sync::Arc};
use tracing::info;

/// Running totals over processed batches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub batches: usize,
    pub samples: usize,
    pub mistakes: usize,
}

impl Stats {
    /// Mistakes as a percentage of the samples, 0 if there are none.
    pub fn error_rate(&self) -> f32 {
        if self.samples == 0 {
            0.
        } else {
            self.mistakes as f32 * 100. / self.samples as f32
        }
    }
}

impl AddAssign<&BatchOutcome> for Stats {
    fn add_assign(&mut self, outcome: &BatchOutcome) {
        self.batches += 1;
        self.samples += outcome.samples;
        self.mistakes += outcome.mistakes;
    }
}

impl AddAssign for Stats {
    fn add_assign(&mut self, other: Self) {
        self.batches += other.batches;
        self.samples += other.samples;
        self.mistakes += other.mistakes;
    }
}

/// Drives a [`Network`] with batches produced from a [`Dataset`].
#[derive(Debug)]
pub struct Trainer {
    network: Network,
    dataset: Dataset,
    config: TrainConfig,
    seeds: SeedSequence,
}

impl Trainer {
    /// **Errors**
    ///
    /// If `config` is invalid.
    pub fn new(network: Network, dataset: Dataset, config: TrainConfig) -> Result<Self> {
        config.validate()?;
        let seeds = SeedSequence::new(config.seed);
        Ok(Self {
            network,
            dataset,
            config,
            seeds,
        })
    }
    pub fn network(&self) -> &Network {
        &self.network
    }
    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.network
    }
    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }
    pub fn dataset_mut(&mut self) -> &mut Dataset {
        &mut self.dataset
    }
    pub fn config(&self) -> &TrainConfig {
        &self.config
    }
    /// Loads the checkpoint of [`TrainConfig::start_epoch`], or estimates the regularizing
    /// constants from the training set when starting from scratch.
    pub fn initialize(&mut self) -> Result<()> {
        self.network.initialize(
            self.dataset.train(),
            self.config.start_epoch,
            self.config.regularizing_samples,
        )
    }
    fn training_producer(&self) -> Result<BatchProducer> {
        BatchProducer::builder(self.dataset.train().clone(), self.network.encoding().clone())
            .batch_size(self.config.batch_size)
            .threads(self.config.producer_threads)
            .capacity(self.config.queue_capacity)
            .distortion(self.config.distortion)
            .training(&self.seeds)
    }
    fn report(&self, stats: &mut Stats) {
        info!(
            "Training batch: {} Mistakes: {:.2}%",
            self.network.batches_completed(),
            stats.error_rate()
        );
        *stats = Stats::default();
    }
    fn train_impl(&self, batches: usize, test: bool) -> Result<Stats> {
        let producer = self.training_producer()?;
        let mut total = Stats::default();
        let mut window = Stats::default();
        for batch in producer.iter().take(batches) {
            let outcome = self.network.process_batch(&batch)?;
            total += &outcome;
            window += &outcome;
            let epoch = self.network.batches_completed();
            if self.config.report_interval > 0 && epoch % self.config.report_interval == 0 {
                self.report(&mut window);
            }
            if test && self.config.test_interval > 0 && epoch % self.config.test_interval == 0 {
                self.test()?;
            }
        }
        Ok(total)
    }
    /// Trains on `batches` random batches, reporting the training error every
    /// [`TrainConfig::report_interval`] batches.
    ///
    /// **Errors**
    ///
    /// If the training set is empty or a batch fails, see [`Network::process_batch()`].
    pub fn train(&self, batches: usize) -> Result<Stats> {
        self.train_impl(batches, false)
    }
    /// Like [`.train()`](Self::train), and runs [`.test()`](Self::test) every
    /// [`TrainConfig::test_interval`] batches.
    pub fn train_test(&self, batches: usize) -> Result<Stats> {
        self.train_impl(batches, true)
    }
    /// Counts the mistakes over the whole test set.
    pub fn test(&self) -> Result<Stats> {
        let producer =
            BatchProducer::builder(self.dataset.test().clone(), self.network.encoding().clone())
                .batch_size(self.config.batch_size)
                .threads(self.config.producer_threads)
                .capacity(self.config.queue_capacity)
                .sequential(BatchKind::Test)?;
        let mut stats = Stats::default();
        for batch in producer.iter() {
            stats += &self.network.process_batch(&batch)?;
        }
        info!(
            "Test set size: {} Test error: {:.2}%",
            stats.samples,
            stats.error_rate()
        );
        Ok(stats)
    }
    /// The top guesses for each of `pictures`, most likely class first.
    pub fn predict(&self, pictures: Arc<Vec<Picture>>) -> Result<Vec<Vec<usize>>> {
        // one worker keeps the batches in order
        let producer = BatchProducer::builder(pictures, self.network.encoding().clone())
            .batch_size(self.config.batch_size)
            .threads(1)
            .capacity(self.config.queue_capacity)
            .sequential(BatchKind::Unlabelled)?;
        let mut guesses = Vec::new();
        for batch in producer.iter() {
            guesses.extend(self.network.process_batch(&batch)?.top_guesses);
        }
        Ok(guesses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layer::{Activation, LayerSpec},
        picture::{Pixel, PointPicture},
    };

    fn dataset() -> Dataset {
        let pictures = |n: usize| {
            (0..n)
                .map(|i| {
                    let label = i % 2;
                    let pixel = Pixel {
                        x: if label == 0 { -1 } else { 1 },
                        y: 0,
                        values: vec![1.],
                    };
                    Picture::new(Some(label), PointPicture::new(vec![pixel]))
                })
                .collect()
        };
        Dataset::new(pictures(40), pictures(10))
    }

    fn trainer() -> Trainer {
        let network = Network::builder(4, 1)
            .layer(LayerSpec::new(3, 1, 4, Activation::Tanh))
            .layer(LayerSpec::new(2, 1, 2, Activation::Softmax))
            .threads(1)
            .build()
            .unwrap();
        let config = TrainConfig {
            batch_size: 4,
            producer_threads: 2,
            queue_capacity: 4,
            report_interval: 5,
            test_interval: 5,
            regularizing_samples: 20,
            ..TrainConfig::default()
        };
        let mut trainer = Trainer::new(network, dataset(), config).unwrap();
        trainer.initialize().unwrap();
        trainer
    }

    #[test]
    fn stats_error_rate() {
        let mut stats = Stats::default();
        assert_eq!(stats.error_rate(), 0.);
        stats += &BatchOutcome {
            samples: 8,
            mistakes: 2,
            ..BatchOutcome::default()
        };
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.error_rate(), 25.);
    }

    #[test]
    fn train_counts_batches() {
        let trainer = trainer();
        let stats = trainer.train_test(10).unwrap();
        assert_eq!(stats.batches, 10);
        assert_eq!(stats.samples, 40);
        assert_eq!(trainer.network().batches_completed(), 10);
    }

    #[test]
    fn test_covers_the_test_set() {
        let trainer = trainer();
        let stats = trainer.test().unwrap();
        assert_eq!(stats.samples, 10);
        assert_eq!(stats.batches, 3);
        assert_eq!(trainer.network().batches_completed(), 0);
    }

    #[test]
    fn predict_keeps_order() {
        let trainer = trainer();
        let guesses = trainer.predict(trainer.dataset().test().clone()).unwrap();
        assert_eq!(guesses.len(), 10);
        assert!(guesses.iter().all(|guess| guess.len() == 2));
    }
}
