//! Host kernels of the dense stage.
//!
//! Every kernel that scatters into shared rows is parallel over columns, so that each worker
//! owns the elements it accumulates into.
use crate::layer::Activation;
use ndarray::{s, Array2, ArrayView1, ArrayView2, ArrayViewMut2, Axis, Zip};
use rayon::prelude::*;

fn argmax(xs: impl IntoIterator<Item = f32>) -> (usize, f32) {
    xs.into_iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, x)| {
            if x > best.1 {
                (i, x)
            } else {
                best
            }
        })
}

/// Multiplies every row by the row of `keep` of its owning sample.
pub(super) fn scale_rows(mut features: ArrayViewMut2<f32>, keep: ArrayView2<f32>, owners: &[usize]) {
    Zip::from(features.rows_mut())
        .and(ArrayView1::from(owners))
        .par_for_each(|mut row, &owner| row *= &keep.row(owner));
}

/// Unfolds the receptive field of every rule block into one row.
///
/// `rules` holds `area` input vectors per row. The output row is ordered by filter cell, then
/// channel.
pub(super) fn gather(input: ArrayView2<f32>, rules: &[usize], area: usize) -> Array2<f32> {
    let inputs = input.ncols();
    let mut output = Array2::zeros([rules.len() / area, area * inputs]);
    output
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(rules.par_chunks_exact(area))
        .for_each(|(mut row, cells)| {
            for (k, &v) in cells.iter().enumerate() {
                row.slice_mut(s![k * inputs..(k + 1) * inputs])
                    .assign(&input.row(v));
            }
        });
    output
}

/// Adjoint of [`gather()`], accumulating into `input`.
pub(super) fn scatter_add(
    mut input: ArrayViewMut2<f32>,
    unfolded: ArrayView2<f32>,
    rules: &[usize],
    area: usize,
) {
    let inputs = input.ncols();
    Zip::indexed(input.columns_mut()).par_for_each(|channel, mut column| {
        for (row, cells) in unfolded.rows().into_iter().zip(rules.chunks_exact(area)) {
            for (k, &v) in cells.iter().enumerate() {
                column[v] += row[k * inputs + channel];
            }
        }
    });
}

/// Max over groups of `k` adjacent columns, with the winning member of each group.
pub(super) fn maxout(z: ArrayView2<f32>, k: usize) -> (Array2<f32>, Array2<usize>) {
    let (rows, columns) = z.dim();
    let units = columns / k;
    let mut output = Array2::zeros([rows, units]);
    let mut choice = Array2::zeros([rows, units]);
    Zip::from(output.rows_mut())
        .and(choice.rows_mut())
        .and(z.rows())
        .par_for_each(|mut output, mut choice, z| {
            for u in 0..units {
                let (g, x) = argmax(z.slice(s![u * k..(u + 1) * k]).iter().copied());
                output[u] = x;
                choice[u] = g;
            }
        });
    (output, choice)
}

/// Routes each unit gradient to the winning group member.
pub(super) fn unmaxout(
    delta: ArrayView2<f32>,
    choice: ArrayView2<usize>,
    k: usize,
) -> Array2<f32> {
    let (rows, units) = delta.dim();
    let mut output = Array2::zeros([rows, units * k]);
    Zip::from(output.rows_mut())
        .and(delta.rows())
        .and(choice.rows())
        .par_for_each(|mut output, delta, choice| {
            for u in 0..units {
                output[u * k + choice[u]] = delta[u];
            }
        });
    output
}

/// Max over each pooling window of `area` vectors, with the winning vector of each unit.
pub(super) fn max_pool(
    input: ArrayView2<f32>,
    rules: &[usize],
    area: usize,
) -> (Array2<f32>, Array2<usize>) {
    let units = input.ncols();
    let rows = rules.len() / area;
    let mut output = Array2::zeros([rows, units]);
    let mut choice = Array2::zeros([rows, units]);
    output
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(choice.axis_iter_mut(Axis(0)))
        .zip(rules.par_chunks_exact(area))
        .for_each(|((mut output, mut choice), cells)| {
            for u in 0..units {
                let (k, x) = argmax(cells.iter().map(|&v| input[(v, u)]));
                output[u] = x;
                choice[u] = cells[k];
            }
        });
    (output, choice)
}

/// Scatters pooled gradients back to the winning vectors of `input_rows` rows.
///
/// A vector that wins several windows receives the sum.
pub(super) fn unpool(
    delta: ArrayView2<f32>,
    choice: ArrayView2<usize>,
    input_rows: usize,
) -> Array2<f32> {
    let mut output = Array2::zeros([input_rows, delta.ncols()]);
    Zip::from(output.columns_mut())
        .and(delta.columns())
        .and(choice.columns())
        .par_for_each(|mut output, delta, choice| {
            for (d, &v) in delta.iter().zip(choice) {
                output[v] += d;
            }
        });
    output
}

pub(super) fn activate(mut x: ArrayViewMut2<f32>, activation: Activation) {
    match activation {
        Activation::Identity => (),
        Activation::Softmax => {
            Zip::from(x.rows_mut()).par_for_each(|mut row| {
                let max = row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
                row.mapv_inplace(|x| (x - max).exp());
                let sum = row.sum();
                row /= sum;
            });
        }
        _ => x.par_mapv_inplace(|x| activation.apply(x)),
    }
}

/// Multiplies `delta` by the derivative of `activation` at the forward output `y`.
pub(super) fn activate_backward(
    mut delta: ArrayViewMut2<f32>,
    y: ArrayView2<f32>,
    activation: Activation,
) {
    if matches!(activation, Activation::Identity | Activation::Softmax) {
        return;
    }
    Zip::from(&mut delta)
        .and(&y)
        .par_for_each(|d, &y| *d *= activation.derivative(y));
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn gather_scatter_adjoint() {
        let input = array![[1f32, 10.], [2., 20.], [3., 30.]];
        let rules = [0, 2, 2, 1];
        let unfolded = gather(input.view(), &rules, 2);
        assert_eq!(unfolded, array![[1f32, 10., 3., 30.], [3., 30., 2., 20.]]);
        let mut grad = Array2::zeros([3, 2]);
        scatter_add(grad.view_mut(), Array2::ones([2, 4]).view(), &rules, 2);
        assert_eq!(grad, array![[1f32, 1.], [1., 1.], [2., 2.]]);
    }

    #[test]
    fn maxout_routes_to_winner() {
        let z = array![[1f32, 3., -1., -2.]];
        let (m, choice) = maxout(z.view(), 2);
        assert_eq!(m, array![[3f32, -1.]]);
        assert_eq!(choice, array![[1usize, 0]]);
        let dz = unmaxout(array![[5f32, 7.]].view(), choice.view(), 2);
        assert_eq!(dz, array![[0f32, 5., 7., 0.]]);
    }

    #[test]
    fn pool_accumulates_shared_winner() {
        let input = array![[4f32], [1.], [2.]];
        let rules = [0, 1, 0, 2];
        let (pooled, choice) = max_pool(input.view(), &rules, 2);
        assert_eq!(pooled, array![[4f32], [4.]]);
        assert_eq!(choice, array![[0usize], [0]]);
        let delta = unpool(array![[1f32], [2.]].view(), choice.view(), 3);
        assert_eq!(delta, array![[3f32], [0.], [0.]]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let mut x = array![[1000f32, 1001., 999.], [0., 0., 0.]];
        activate(x.view_mut(), Activation::Softmax);
        for row in x.rows() {
            assert_relative_eq!(row.sum(), 1., epsilon = 1e-6);
        }
        assert!(x[(0, 1)] > x[(0, 0)]);
        assert_relative_eq!(x[(1, 2)], 1. / 3.);
    }

    #[test]
    fn scale_rows_by_owner() {
        let mut x = Array2::<f32>::ones([3, 2]);
        let keep = array![[1f32, 0.], [0., 1.]];
        scale_rows(x.view_mut(), keep.view(), &[0, 1, 1]);
        assert_eq!(x, array![[1f32, 0.], [0., 1.], [0., 1.]]);
    }
}
