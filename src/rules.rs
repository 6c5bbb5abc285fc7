/*!
Sparse rule generation.

For every layer and every sample, the input grid is scanned with the convolution window and then
the pooling window. An output position whose window holds only the input background vector is
collapsed into a single shared background vector for that sample. Every other position gets a
fresh vector, and its window's input indices are appended to the rules. The dense GEMM stage
reads these rules to fill one scratch row per computed vector.
*/
use crate::{batch::SparseBatch, layer::LayerGeometry};
use rayon::prelude::*;

/// The sparse layout of one level of the network.
///
/// Mirrors the shape fields of [`SparseBatch`]: a grid of vector indices per sample, an optional
/// background vector per sample and the owning sample of every vector.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SparseGrids {
    side: usize,
    grids: Vec<Vec<usize>>,
    backgrounds: Vec<Option<usize>>,
    owner_of_vector: Vec<usize>,
}

impl SparseGrids {
    /// The input level of `batch`.
    pub fn from_batch(batch: &SparseBatch) -> Self {
        Self {
            side: batch.grid_side(),
            grids: batch.grids().to_vec(),
            backgrounds: batch.backgrounds().to_vec(),
            owner_of_vector: batch.owner_of_vector().to_vec(),
        }
    }
    pub fn side(&self) -> usize {
        self.side
    }
    pub fn sample_count(&self) -> usize {
        self.grids.len()
    }
    /// The number of vectors, including background vectors.
    pub fn vector_count(&self) -> usize {
        self.owner_of_vector.len()
    }
    pub fn grids(&self) -> &[Vec<usize>] {
        &self.grids
    }
    /// The background vector of each sample, `None` if no cell of the sample is background.
    pub fn backgrounds(&self) -> &[Option<usize>] {
        &self.backgrounds
    }
    pub fn owner_of_vector(&self) -> &[usize] {
        &self.owner_of_vector
    }
    /// The vectors of `sample` that are not its background.
    pub fn computed_count(&self, sample: usize) -> usize {
        let owned = self
            .owner_of_vector
            .iter()
            .filter(|&&owner| owner == sample)
            .count();
        owned - self.backgrounds[sample].is_some() as usize
    }
}

/// The rules of one layer for one batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LayerRules {
    /// `filter_size²` input indices per vector of [`.middle`](Self::middle).
    pub conv: Vec<usize>,
    /// `pool_size²` middle indices per vector of [`.output`](Self::output).
    pub pool: Vec<usize>,
    /// Layout after the convolution.
    pub middle: SparseGrids,
    /// Layout after pooling.
    pub output: SparseGrids,
}

impl LayerRules {
    /// Computes the rules of a layer with `geometry` applied to `input`.
    pub fn new(geometry: &LayerGeometry, input: &SparseGrids) -> Self {
        debug_assert_eq!(input.side, geometry.input_side);
        let (middle, conv) = collapse(
            input,
            Window {
                output_side: geometry.conv_side,
                size: geometry.filter_size,
                stride: 1,
            },
        );
        let (output, pool) = collapse(
            &middle,
            Window {
                output_side: geometry.output_side,
                size: geometry.pool_size,
                stride: geometry.pool_size,
            },
        );
        Self {
            conv,
            pool,
            middle,
            output,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Window {
    output_side: usize,
    size: usize,
    stride: usize,
}

impl Window {
    fn cells(self, side: usize, i: usize, j: usize) -> impl Iterator<Item = usize> {
        (0..self.size).flat_map(move |ii| {
            (0..self.size).map(move |jj| (i * self.stride + ii) * side + j * self.stride + jj)
        })
    }
}

/// The layout of one sample with indices local to the sample.
struct SampleLayout {
    grid: Vec<usize>,
    background: Option<usize>,
    rules: Vec<usize>,
    count: usize,
}

fn collapse_sample(
    grid: &[usize],
    side: usize,
    background: Option<usize>,
    window: Window,
) -> SampleLayout {
    let positions = window.output_side * window.output_side;
    let collapsed: Vec<bool> = (0..positions)
        .map(|n| {
            let (i, j) = (n / window.output_side, n % window.output_side);
            background.map_or(false, |bg| {
                window.cells(side, i, j).all(|cell| grid[cell] == bg)
            })
        })
        .collect();
    let mut rules = Vec::new();
    let mut count = 0;
    let output_background = match background {
        Some(bg) if collapsed.iter().any(|x| *x) => {
            rules.extend(std::iter::repeat(bg).take(window.size * window.size));
            count += 1;
            Some(0)
        }
        _ => None,
    };
    let mut output_grid = Vec::with_capacity(positions);
    for (n, collapsed) in collapsed.into_iter().enumerate() {
        match output_background.filter(|_| collapsed) {
            Some(bg) => output_grid.push(bg),
            None => {
                let (i, j) = (n / window.output_side, n % window.output_side);
                output_grid.push(count);
                count += 1;
                rules.extend(window.cells(side, i, j).map(|cell| grid[cell]));
            }
        }
    }
    SampleLayout {
        grid: output_grid,
        background: output_background,
        rules,
        count,
    }
}

fn collapse(input: &SparseGrids, window: Window) -> (SparseGrids, Vec<usize>) {
    let layouts: Vec<SampleLayout> = input
        .grids
        .par_iter()
        .zip(input.backgrounds.par_iter())
        .map(|(grid, background)| collapse_sample(grid, input.side, *background, window))
        .collect();
    let vector_count = layouts.iter().map(|x| x.count).sum();
    let rule_count = layouts.iter().map(|x| x.rules.len()).sum();
    let mut output = SparseGrids {
        side: window.output_side,
        grids: Vec::with_capacity(layouts.len()),
        backgrounds: Vec::with_capacity(layouts.len()),
        owner_of_vector: Vec::with_capacity(vector_count),
    };
    let mut rules = Vec::with_capacity(rule_count);
    for (sample, layout) in layouts.into_iter().enumerate() {
        let offset = output.owner_of_vector.len();
        output
            .grids
            .push(layout.grid.into_iter().map(|x| x + offset).collect());
        output.backgrounds.push(layout.background.map(|x| x + offset));
        output
            .owner_of_vector
            .extend(std::iter::repeat(sample).take(layout.count));
        rules.extend(layout.rules);
    }
    (output, rules)
}
