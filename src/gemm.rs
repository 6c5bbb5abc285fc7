use crate::error::ShapeError;
use anyhow::Result;
use ndarray::{linalg::general_mat_mul, ArrayBase, Data, DataMut, Ix2};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::{fmt, sync::Arc};

/// Dense matrix multiply context shared by every layer of a network.
///
/// Owns the thread pool that runs the dense stage of every layer (GEMM, gather and scatter).
/// Clones share the pool.
#[derive(Clone)]
pub struct Gemm {
    pool: Arc<ThreadPool>,
}

impl Gemm {
    /// Creates a context with `threads` workers, 0 for one per core.
    pub fn new(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("sparsecnn-gemm-{i}"))
            .build()?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
    /// Runs `f` on the pool of this context.
    pub fn install<R, F>(&self, f: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.pool.install(f)
    }
    /// `c = alpha · a · b + beta · c`
    ///
    /// **Errors**
    ///
    /// [`ShapeError`] if `a` is `[m, k]`, `b` is `[k2, n]` and `c` is not `[m, n]` or `k != k2`.
    pub fn gemm<S1, S2, S3>(
        &self,
        alpha: f32,
        a: &ArrayBase<S1, Ix2>,
        b: &ArrayBase<S2, Ix2>,
        beta: f32,
        c: &mut ArrayBase<S3, Ix2>,
    ) -> Result<()>
    where
        S1: Data<Elem = f32> + Sync,
        S2: Data<Elem = f32> + Sync,
        S3: DataMut<Elem = f32> + Send,
    {
        let (m, k) = a.dim();
        let (k2, n) = b.dim();
        let (m2, n2) = c.dim();
        if m != m2 || k != k2 || n != n2 {
            return Err(ShapeError {
                a: [m, k],
                b: [k2, n],
                c: [m2, n2],
            }
            .into());
        }
        if m == 0 || n == 0 {
            return Ok(());
        }
        self.install(|| general_mat_mul(alpha, a, b, beta, c));
        Ok(())
    }
}

impl fmt::Debug for Gemm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Gemm")
            .field("threads", &self.threads())
            .finish()
    }
}
