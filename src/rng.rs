use crate::error::DatasetError;
use anyhow::Result;
use parking_lot::Mutex;
use rand::{rngs::StdRng, seq::index, Rng as _, RngCore, SeedableRng};

/// Hands out distinct seeds to independently owned [`Rng`] streams.
///
/// Shared between threads; every call to [`.next_seed()`](Self::next_seed) advances one
/// guarded generator, so streams created concurrently never share a seed.
#[derive(Debug)]
pub struct SeedSequence {
    generator: Mutex<StdRng>,
}

impl SeedSequence {
    /// Creates a sequence starting from `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            generator: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
    /// The next seed in the sequence.
    pub fn next_seed(&self) -> u64 {
        self.generator.lock().next_u64()
    }
    /// A new stream seeded with [`.next_seed()`](Self::next_seed).
    pub fn rng(&self) -> Rng {
        Rng::from_seed(self.next_seed())
    }
}

/// Deterministic random source.
#[derive(Clone, Debug)]
pub struct Rng {
    gen: StdRng,
}

impl Rng {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            gen: StdRng::seed_from_u64(seed),
        }
    }
    /// Uniform integer in `0 .. n`.
    ///
    /// # Panics
    /// If `n` is 0.
    pub fn randint(&mut self, n: usize) -> usize {
        self.gen.gen_range(0..n)
    }
    /// Uniform float in `[a, b)`.
    pub fn uniform(&mut self, a: f32, b: f32) -> f32 {
        a + (b - a) * self.gen.gen::<f32>()
    }
    /// True with probability `p`.
    pub fn bernoulli(&mut self, p: f32) -> bool {
        self.gen.gen::<f32>() < p
    }
    /// A uniformly chosen index into `items`.
    ///
    /// **Errors**
    ///
    /// [`DatasetError::Empty`] if `items` is empty.
    pub fn index<T>(&mut self, items: &[T]) -> Result<usize> {
        if items.is_empty() {
            return Err(DatasetError::Empty("picture").into());
        }
        Ok(self.randint(items.len()))
    }
    /// `m` distinct values from `0 .. n`, in increasing order.
    pub fn n_choose_m(&mut self, n: usize, m: usize) -> Vec<usize> {
        let mut chosen = index::sample(&mut self.gen, n, m.min(n)).into_vec();
        chosen.sort_unstable();
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, sync::Arc, thread};

    #[test]
    fn seeded_streams_repeat() {
        let mut a = Rng::from_seed(7);
        let mut b = Rng::from_seed(7);
        for _ in 0..100 {
            assert_eq!(a.randint(1000), b.randint(1000));
        }
    }

    #[test]
    fn concurrent_seeds_are_distinct() {
        let seeds = Arc::new(SeedSequence::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let seeds = seeds.clone();
                thread::spawn(move || (0..100).map(|_| seeds.next_seed()).collect::<Vec<_>>())
            })
            .collect();
        let mut all = HashSet::new();
        for handle in handles {
            for seed in handle.join().unwrap() {
                assert!(all.insert(seed));
            }
        }
        assert_eq!(all.len(), 800);
    }

    #[test]
    fn uniform_in_range() {
        let mut rng = Rng::from_seed(1);
        for _ in 0..1000 {
            let x = rng.uniform(-0.5, 0.25);
            assert!((-0.5..0.25).contains(&x));
        }
    }

    #[test]
    fn index_of_empty_is_error() {
        let mut rng = Rng::from_seed(1);
        let empty: [u8; 0] = [];
        assert!(rng.index(&empty).is_err());
        assert!(rng.index(&[1, 2, 3]).unwrap() < 3);
    }

    #[test]
    fn n_choose_m_sorted_distinct() {
        let mut rng = Rng::from_seed(3);
        let chosen = rng.n_choose_m(20, 5);
        assert_eq!(chosen.len(), 5);
        assert!(chosen.windows(2).all(|w| w[0] < w[1]));
        assert!(chosen.iter().all(|&x| x < 20));
    }
}
