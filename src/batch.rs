use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What a batch is used for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum BatchKind {
    /// Forward, backward and weight update.
    Train,
    /// Forward and mistake counting.
    Test,
    /// Forward only, labels unknown.
    Unlabelled,
}

/// A mini-batch of sparse feature vectors.
///
/// Built incrementally by [`Picture::codify()`](crate::picture::Picture::codify) through
/// [`.push_sample()`](Self::push_sample). Every sample owns a `grid_side × grid_side` grid of
/// vector indices. Empty cells share the sample's single background vector, which is all zeros.
#[derive(Clone, Debug)]
pub struct SparseBatch {
    kind: BatchKind,
    grid_side: usize,
    feature_width: usize,
    features: Vec<f32>,
    owner_of_vector: Vec<usize>,
    labels: Vec<Option<usize>>,
    grids: Vec<Vec<usize>>,
    backgrounds: Vec<Option<usize>>,
}

impl SparseBatch {
    /// An empty batch of `kind` for grids of `grid_side` with `feature_width` channels.
    pub fn new(kind: BatchKind, grid_side: usize, feature_width: usize) -> Self {
        Self {
            kind,
            grid_side,
            feature_width,
            features: Vec::new(),
            owner_of_vector: Vec::new(),
            labels: Vec::new(),
            grids: Vec::new(),
            backgrounds: Vec::new(),
        }
    }
    pub fn kind(&self) -> BatchKind {
        self.kind
    }
    pub fn grid_side(&self) -> usize {
        self.grid_side
    }
    pub fn feature_width(&self) -> usize {
        self.feature_width
    }
    /// The number of samples folded in so far.
    pub fn sample_count(&self) -> usize {
        self.grids.len()
    }
    /// The number of stored vectors, including background vectors.
    pub fn vector_count(&self) -> usize {
        self.owner_of_vector.len()
    }
    /// Row major `[vector_count, feature_width]` features.
    pub fn features(&self) -> &[f32] {
        &self.features
    }
    /// The sample each vector belongs to.
    pub fn owner_of_vector(&self) -> &[usize] {
        &self.owner_of_vector
    }
    pub fn labels(&self) -> &[Option<usize>] {
        &self.labels
    }
    pub fn grids(&self) -> &[Vec<usize>] {
        &self.grids
    }
    pub fn backgrounds(&self) -> &[Option<usize>] {
        &self.backgrounds
    }
    /// The number of distinct vector indices in the grid of `sample`.
    pub fn distinct_grid_values(&self, sample: usize) -> usize {
        self.grids[sample].iter().collect::<BTreeSet<_>>().len()
    }
    /// Appends one sample.
    ///
    /// The background vector is allocated first, then `f` writes the ink cells.
    pub fn push_sample<F>(&mut self, label: Option<usize>, f: F)
    where
        F: FnOnce(&mut SampleWriter),
    {
        let sample = self.sample_count();
        let background = self.push_vector(sample);
        let grid = vec![background; self.grid_side * self.grid_side];
        let mut writer = SampleWriter {
            batch: self,
            sample,
            background,
            grid,
        };
        f(&mut writer);
        let SampleWriter {
            grid, background, ..
        } = writer;
        self.grids.push(grid);
        self.backgrounds.push(Some(background));
        self.labels.push(label);
    }
    fn push_vector(&mut self, sample: usize) -> usize {
        let index = self.owner_of_vector.len();
        self.features
            .extend(std::iter::repeat(0f32).take(self.feature_width));
        self.owner_of_vector.push(sample);
        index
    }
}

/// Writes the ink cells of one sample into a [`SparseBatch`].
#[derive(Debug)]
pub struct SampleWriter<'a> {
    batch: &'a mut SparseBatch,
    sample: usize,
    background: usize,
    grid: Vec<usize>,
}

impl SampleWriter<'_> {
    pub fn grid_side(&self) -> usize {
        self.batch.grid_side
    }
    pub fn feature_width(&self) -> usize {
        self.batch.feature_width
    }
    /// Whether `cell` already holds an ink vector.
    pub fn is_ink(&self, cell: usize) -> bool {
        self.grid[cell] != self.background
    }
    /// The feature vector at `cell`, allocating a zeroed vector if the cell is background.
    ///
    /// # Panics
    /// If `cell` is outside the grid.
    pub fn vector_mut(&mut self, cell: usize) -> &mut [f32] {
        if self.grid[cell] == self.background {
            self.grid[cell] = self.batch.push_vector(self.sample);
        }
        let width = self.batch.feature_width;
        let start = self.grid[cell] * width;
        &mut self.batch.features[start..start + width]
    }
    /// Sets the features at `cell`, overwriting any previous vector for that cell.
    pub fn write(&mut self, cell: usize, features: impl IntoIterator<Item = f32>) {
        for (x, y) in self.vector_mut(cell).iter_mut().zip(features) {
            *x = y;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_is_shared() {
        let mut batch = SparseBatch::new(BatchKind::Train, 4, 2);
        batch.push_sample(Some(3), |w| {
            w.write(5, [1., 2.]);
            w.write(6, [3., 4.]);
        });
        batch.push_sample(Some(1), |_| {});
        assert_eq!(batch.sample_count(), 2);
        assert_eq!(batch.vector_count(), 4);
        assert_eq!(batch.owner_of_vector(), &[0, 0, 0, 1]);
        assert_eq!(batch.backgrounds(), &[Some(0), Some(3)]);
        assert_eq!(batch.distinct_grid_values(0), 3);
        assert_eq!(batch.distinct_grid_values(1), 1);
        assert_eq!(&batch.features()[..6], &[0., 0., 1., 2., 3., 4.]);
        assert_eq!(batch.labels(), &[Some(3), Some(1)]);
    }

    #[test]
    fn rewriting_a_cell_reuses_its_vector() {
        let mut batch = SparseBatch::new(BatchKind::Test, 3, 1);
        batch.push_sample(None, |w| {
            w.write(4, [1.]);
            w.vector_mut(4)[0] += 1.;
            assert!(w.is_ink(4));
            assert!(!w.is_ink(0));
        });
        assert_eq!(batch.vector_count(), 2);
        assert_eq!(batch.features(), &[0., 2.]);
    }
}
