use crate::{picture::Picture, rng::Rng};
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// MNIST.
#[cfg(feature = "mnist")]
pub mod mnist;

/// Reads a [`Dataset`] from some external source.
pub trait LoadDataset {
    /// Loads the training and test pictures.
    ///
    /// **Errors**
    ///
    /// If the source cannot be read or is malformed.
    fn load(&self) -> Result<Dataset>;
}

/// Training and test pictures.
///
/// Collections are shared with [`BatchProducer`](crate::pipeline::BatchProducer) workers and
/// only replaced, never mutated in place.
#[derive(Clone, Debug, Default)]
pub struct Dataset {
    train: Arc<Vec<Picture>>,
    test: Arc<Vec<Picture>>,
}

impl Dataset {
    pub fn new(train: Vec<Picture>, test: Vec<Picture>) -> Self {
        Self {
            train: Arc::new(train),
            test: Arc::new(test),
        }
    }
    pub fn train(&self) -> &Arc<Vec<Picture>> {
        &self.train
    }
    pub fn test(&self) -> &Arc<Vec<Picture>> {
        &self.test
    }
    /// The largest label plus one, over both collections.
    pub fn classes(&self) -> usize {
        self.train
            .iter()
            .chain(self.test.iter())
            .filter_map(Picture::label)
            .max()
            .map_or(0, |label| label + 1)
    }
    /// Discards the test set and splits the training set, keeping each picture for training
    /// with probability `p`.
    ///
    /// Seeded with 0, so the split is the same on every run.
    pub fn replace_test_with_validation(&mut self, p: f32) {
        let mut rng = Rng::from_seed(0);
        let (train, validation): (Vec<_>, Vec<_>) = self
            .train
            .iter()
            .cloned()
            .partition(|_| rng.uniform(0., 1.) < p);
        self.train = Arc::new(train);
        self.test = Arc::new(validation);
        info!(
            "Replacing test set with validation set: {} training, {} validation pictures.",
            self.train.len(),
            self.test.len()
        );
    }
    /// Keeps each test picture with probability `p`.
    ///
    /// Seeded with 0, so the subset is the same on every run.
    pub fn shrink_test_set(&mut self, p: f32) {
        let mut rng = Rng::from_seed(0);
        let test = self
            .test
            .iter()
            .filter(|_| rng.uniform(0., 1.) < p)
            .cloned()
            .collect();
        self.test = Arc::new(test);
        info!("Reducing test set size to {}.", self.test.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picture::{Pixel, PointPicture};

    fn pictures(n: usize) -> Vec<Picture> {
        (0..n)
            .map(|i| {
                let pixel = Pixel {
                    x: 0,
                    y: 0,
                    values: vec![i as f32],
                };
                Picture::new(Some(i % 10), PointPicture::new(vec![pixel]))
            })
            .collect()
    }

    #[test]
    fn validation_split_is_deterministic() {
        let dataset = Dataset::new(pictures(1000), pictures(50));
        let mut a = dataset.clone();
        a.replace_test_with_validation(0.8);
        let mut b = dataset;
        b.replace_test_with_validation(0.8);
        assert_eq!(a.train().len() + a.test().len(), 1000);
        assert!((700..900).contains(&a.train().len()));
        assert_eq!(a.train(), b.train());
        assert_eq!(a.test(), b.test());
    }

    #[test]
    fn shrink_keeps_a_fraction() {
        let mut dataset = Dataset::new(Vec::new(), pictures(2000));
        dataset.shrink_test_set(0.03);
        assert!((20..120).contains(&dataset.test().len()));
        assert_eq!(dataset.classes(), 10);
    }
}
