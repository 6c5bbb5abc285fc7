use crate::{
    batch::{BatchKind, SparseBatch},
    error::DatasetError,
    picture::{Distortion, InputEncoding, Picture},
    rng::{Rng, SeedSequence},
};
use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};
use tracing::debug;

/// Producer builders.
pub mod builders {
    use super::*;

    /// Builder for creating a [`BatchProducer`].
    pub struct BatchProducerBuilder {
        pub(super) pictures: Arc<Vec<Picture>>,
        pub(super) encoding: Arc<InputEncoding>,
        pub(super) batch_size: usize,
        pub(super) threads: usize,
        pub(super) capacity: usize,
        pub(super) distortion: Distortion,
    }

    impl BatchProducerBuilder {
        /// Samples per batch. Default is 100.
        pub fn batch_size(self, batch_size: usize) -> Self {
            Self { batch_size, ..self }
        }
        /// Worker threads. Default is 8.
        pub fn threads(self, threads: usize) -> Self {
            Self { threads, ..self }
        }
        /// Maximum number of pending batches. Default is 20.
        pub fn capacity(self, capacity: usize) -> Self {
            Self { capacity, ..self }
        }
        /// Applied to every training picture. Default is [`Distortion::Identity`].
        pub fn distortion(self, distortion: Distortion) -> Self {
            Self { distortion, ..self }
        }
        /// Endless train batches of randomly drawn, distorted pictures.
        ///
        /// Each worker draws from its own stream seeded by `seeds`.
        ///
        /// **Errors**
        ///
        /// - [`DatasetError::Empty`] if there are no pictures.
        /// - If a worker thread cannot be spawned.
        pub fn training(self, seeds: &SeedSequence) -> Result<BatchProducer> {
            if self.pictures.is_empty() {
                return Err(DatasetError::Empty("training").into());
            }
            let rngs = (0..self.threads.max(1)).map(|_| seeds.rng()).collect();
            BatchProducer::spawn(self, Source::Random(rngs))
        }
        /// Batches of `kind` covering every picture once, in order within each batch.
        ///
        /// Batches may arrive out of order. The producer finishes when the pictures are exhausted.
        ///
        /// **Errors**
        ///
        /// If a worker thread cannot be spawned.
        pub fn sequential(self, kind: BatchKind) -> Result<BatchProducer> {
            BatchProducer::spawn(self, Source::Sequential(kind))
        }
    }
}
use builders::BatchProducerBuilder;

enum Source {
    Random(Vec<Rng>),
    Sequential(BatchKind),
}

struct Worker {
    pictures: Arc<Vec<Picture>>,
    encoding: Arc<InputEncoding>,
    batch_size: usize,
    sender: Sender<SparseBatch>,
    done: Arc<AtomicBool>,
}

impl Worker {
    fn random(&self, mut rng: Rng, distortion: Distortion) {
        while !self.done.load(Ordering::Relaxed) {
            let mut batch = self.encoding.batch(BatchKind::Train);
            for _ in 0..self.batch_size {
                let picture = &self.pictures[rng.randint(self.pictures.len())];
                picture
                    .distort(&distortion, &mut rng)
                    .codify(&mut batch, &self.encoding);
            }
            if self.sender.send(batch).is_err() {
                break;
            }
        }
    }
    fn sequential(&self, kind: BatchKind, counter: &AtomicUsize) {
        while !self.done.load(Ordering::Relaxed) {
            let start = counter.fetch_add(1, Ordering::Relaxed) * self.batch_size;
            if start >= self.pictures.len() {
                break;
            }
            let end = (start + self.batch_size).min(self.pictures.len());
            let mut batch = self.encoding.batch(kind);
            for picture in self.pictures[start..end].iter() {
                picture.codify(&mut batch, &self.encoding);
            }
            if self.sender.send(batch).is_err() {
                break;
            }
        }
    }
}

/// A bounded queue of batches filled by worker threads.
///
/// Workers block while [`.capacity()`](Self::capacity) batches are pending. Dropping the producer
/// disconnects the queue and joins the workers.
pub struct BatchProducer {
    receiver: Option<Receiver<SparseBatch>>,
    done: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    capacity: usize,
}

impl BatchProducer {
    /// A builder for batches of `pictures` codified with `encoding`.
    pub fn builder(pictures: Arc<Vec<Picture>>, encoding: InputEncoding) -> BatchProducerBuilder {
        BatchProducerBuilder {
            pictures,
            encoding: Arc::new(encoding),
            batch_size: 100,
            threads: 8,
            capacity: 20,
            distortion: Distortion::Identity,
        }
    }
    fn spawn(builder: BatchProducerBuilder, source: Source) -> Result<Self> {
        let BatchProducerBuilder {
            pictures,
            encoding,
            batch_size,
            threads,
            capacity,
            distortion,
        } = builder;
        let (sender, receiver) = bounded(capacity.max(1));
        let done = Arc::new(AtomicBool::default());
        let counter = Arc::new(AtomicUsize::default());
        let (mut rngs, kind) = match source {
            Source::Random(rngs) => (rngs, None),
            Source::Sequential(kind) => (Vec::new(), Some(kind)),
        };
        let mut workers = Vec::with_capacity(threads.max(1));
        for index in 0..threads.max(1) {
            let worker = Worker {
                pictures: pictures.clone(),
                encoding: encoding.clone(),
                batch_size: batch_size.max(1),
                sender: sender.clone(),
                done: done.clone(),
            };
            let task: Box<dyn FnOnce() + Send> = match kind {
                Some(kind) => {
                    let counter = counter.clone();
                    Box::new(move || worker.sequential(kind, &counter))
                }
                None => {
                    let rng = rngs.pop().unwrap_or_else(|| Rng::from_seed(index as u64));
                    Box::new(move || worker.random(rng, distortion))
                }
            };
            let handle = thread::Builder::new()
                .name(format!("sparsecnn::producer({index})"))
                .spawn(task)?;
            workers.push(handle);
        }
        debug!(
            "spawned {} producers of {batch_size} pictures, capacity {capacity}",
            workers.len()
        );
        Ok(Self {
            receiver: Some(receiver),
            done,
            workers,
            capacity,
        })
    }
    /// The maximum number of pending batches.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
    /// The number of batches waiting to be popped.
    pub fn pending(&self) -> usize {
        self.receiver.as_ref().map_or(0, Receiver::len)
    }
    /// Blocks until a batch is ready.
    ///
    /// Returns None once a sequential producer is exhausted.
    pub fn pop(&self) -> Option<SparseBatch> {
        self.receiver.as_ref()?.recv().ok()
    }
    /// Iterates over batches until the producer is exhausted.
    pub fn iter(&self) -> impl Iterator<Item = SparseBatch> + '_ {
        std::iter::from_fn(move || self.pop())
    }
}

impl Drop for BatchProducer {
    fn drop(&mut self) {
        self.done.store(true, Ordering::Relaxed);
        // unblocks workers waiting on a full queue
        self.receiver.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picture::{Pixel, PointPicture, RegularizingConstants};
    use std::time::Duration;

    fn pictures(n: usize) -> Arc<Vec<Picture>> {
        let pictures = (0..n)
            .map(|i| {
                let pixel = Pixel {
                    x: (i % 3) as i32 - 1,
                    y: 0,
                    values: vec![1.],
                };
                Picture::new(Some(i % 2), PointPicture::new(vec![pixel]))
            })
            .collect();
        Arc::new(pictures)
    }

    fn encoding() -> InputEncoding {
        InputEncoding::new(4, RegularizingConstants::ones(1))
    }

    #[test]
    fn sequential_covers_every_picture_once() {
        let producer = BatchProducer::builder(pictures(25), encoding())
            .batch_size(10)
            .threads(3)
            .sequential(BatchKind::Test)
            .unwrap();
        let mut sizes: Vec<_> = producer.iter().map(|batch| batch.sample_count()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, [5, 10, 10]);
        assert!(producer.pop().is_none());
    }

    #[test]
    fn training_is_endless() {
        let seeds = SeedSequence::new(0);
        let producer = BatchProducer::builder(pictures(3), encoding())
            .batch_size(7)
            .threads(2)
            .training(&seeds)
            .unwrap();
        for batch in producer.iter().take(10) {
            assert_eq!(batch.kind(), BatchKind::Train);
            assert_eq!(batch.sample_count(), 7);
        }
    }

    #[test]
    fn queue_is_bounded() {
        let seeds = SeedSequence::new(0);
        let producer = BatchProducer::builder(pictures(10), encoding())
            .batch_size(2)
            .threads(4)
            .capacity(3)
            .training(&seeds)
            .unwrap();
        let mut waited = 0;
        while producer.pending() < 3 && waited < 500 {
            thread::sleep(Duration::from_millis(10));
            waited += 1;
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(producer.pending(), producer.capacity());
        assert!(producer.pop().is_some());
    }

    #[test]
    fn empty_training_set() {
        let error = BatchProducer::builder(Arc::new(Vec::new()), encoding())
            .training(&SeedSequence::new(0))
            .err()
            .unwrap();
        assert_eq!(
            error.downcast_ref::<DatasetError>(),
            Some(&DatasetError::Empty("training"))
        );
    }
}
