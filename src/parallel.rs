//! Parallel execution dispatcher
//!
//! A blocking parallel-for over a unit count (batch samples or channels). The
//! number of workers grows with the element volume of the call and is capped by
//! the hardware concurrency and by the unit count. A single worker runs the
//! loop inline on the calling thread, which gives the same numbers as the
//! threaded path because every unit is computed by exactly one closure call.

use crate::error::{LayerError, Result};
use rayon::prelude::*;
use std::sync::Arc;

/// Elements of weighted work assigned to one worker before another is added.
pub const WORK_PER_THREAD: usize = 1 << 18;

/// Weight used by statistics-heavy training loops.
pub const TRAINING_WEIGHT: usize = 10;
/// Weight used by inference loops.
pub const INFERENCE_WEIGHT: usize = 5;

/// Thread pool plus the heuristic that decides how many of its workers a loop uses.
#[derive(Clone)]
pub struct Dispatcher {
    pool: Arc<rayon::ThreadPool>,
    max_threads: usize,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("max_threads", &self.max_threads)
            .finish()
    }
}

impl Dispatcher {
    /// Creates a dispatcher sized to the machine's logical CPU count.
    pub fn new() -> Result<Self> {
        Self::with_threads(num_cpus::get())
    }

    /// Creates a dispatcher with an explicit worker cap.
    pub fn with_threads(threads: usize) -> Result<Self> {
        let threads = threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("layer-engine-{}", i))
            .build()
            .map_err(|e| LayerError::backend("dispatcher", format!("failed to create thread pool: {}", e)))?;

        log::debug!("dispatcher initialized with {} threads", threads);

        Ok(Self {
            pool: Arc::new(pool),
            max_threads: threads,
        })
    }

    /// Upper bound on workers used by any call.
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Number of workers requested for `elements` values of work scaled by `weight`.
    ///
    /// Grows linearly with the weighted volume and never exceeds the hardware cap.
    pub fn threads_for(&self, elements: usize, weight: usize) -> usize {
        let wanted = elements
            .saturating_mul(weight.max(1))
            .div_ceil(WORK_PER_THREAD);
        wanted.clamp(1, self.max_threads)
    }

    fn workers(&self, units: usize, threads: usize) -> usize {
        threads.min(units).min(self.max_threads).max(1)
    }

    /// Calls `f(unit)` for every unit in `0..units`, blocking until all return.
    pub fn for_each<F>(&self, units: usize, threads: usize, f: F)
    where
        F: Fn(usize) + Sync + Send,
    {
        let workers = self.workers(units, threads);
        if workers == 1 {
            (0..units).for_each(f);
            return;
        }

        let min_len = units.div_ceil(workers);
        self.pool.install(|| {
            (0..units)
                .into_par_iter()
                .with_min_len(min_len)
                .for_each(f)
        });
    }

    /// Maps every unit to a value, preserving unit order in the result.
    pub fn map<T, F>(&self, units: usize, threads: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Sync + Send,
    {
        let workers = self.workers(units, threads);
        if workers == 1 {
            return (0..units).map(f).collect();
        }

        let min_len = units.div_ceil(workers);
        self.pool.install(|| {
            (0..units)
                .into_par_iter()
                .with_min_len(min_len)
                .map(f)
                .collect()
        })
    }

    /// Splits `data` into consecutive chunks of `chunk` values and calls
    /// `f(index, chunk)` on each. Chunks are disjoint, so no locking is needed.
    pub fn for_each_chunk<F>(&self, data: &mut [f32], chunk: usize, threads: usize, f: F)
    where
        F: Fn(usize, &mut [f32]) + Sync + Send,
    {
        if chunk == 0 || data.is_empty() {
            return;
        }
        let units = data.len().div_ceil(chunk);
        let workers = self.workers(units, threads);
        if workers == 1 {
            data.chunks_mut(chunk)
                .enumerate()
                .for_each(|(i, c)| f(i, c));
            return;
        }

        let min_len = units.div_ceil(workers);
        self.pool.install(|| {
            data.par_chunks_mut(chunk)
                .with_min_len(min_len)
                .enumerate()
                .for_each(|(i, c)| f(i, c))
        });
    }
}
