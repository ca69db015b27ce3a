//! Worker pool injected into the evaluator.
//!
//! The evaluator itself stays single-threaded over a parallel-map primitive;
//! the pool here is the only place a thread count appears. All parallelism is
//! confined to one evaluation call and completes before the call returns.

use anyhow::{ensure, Result};
use rayon::ThreadPool;

/// A fixed-size worker pool for splitting one evaluation across threads.
pub struct Executor {
    pool: ThreadPool,
    threads: usize,
}

impl Executor {
    /// Build a pool with exactly `threads` workers.
    pub fn new(threads: usize) -> Result<Self> {
        ensure!(threads > 0, "executor needs at least one thread");
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()?;
        Ok(Self { pool, threads })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run `op` inside the pool, blocking until it completes.
    pub fn install<R, F>(&self, op: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.pool.install(op)
    }

    /// Split `0..len` into at most `threads` contiguous ranges of near-equal size.
    pub fn row_ranges(&self, len: usize) -> Vec<(usize, usize)> {
        let chunk = len.div_ceil(self.threads).max(1);
        let mut ranges = Vec::new();
        let mut start = 0;
        while start < len {
            let take = chunk.min(len - start);
            ranges.push((start, take));
            start += take;
        }
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_threads_rejected() {
        assert!(Executor::new(0).is_err());
    }

    #[test]
    fn test_row_ranges_cover_everything() {
        let exec = Executor::new(3).unwrap();
        let ranges = exec.row_ranges(10);
        assert!(ranges.len() <= 3);
        let total: usize = ranges.iter().map(|&(_, len)| len).sum();
        assert_eq!(total, 10);
        // Contiguous and in order
        let mut next = 0;
        for &(start, len) in &ranges {
            assert_eq!(start, next);
            next = start + len;
        }
    }

    #[test]
    fn test_row_ranges_fewer_rows_than_threads() {
        let exec = Executor::new(8).unwrap();
        let ranges = exec.row_ranges(3);
        assert_eq!(ranges, vec![(0, 1), (1, 1), (2, 1)]);
    }

    #[test]
    fn test_install_runs_in_pool() {
        let exec = Executor::new(2).unwrap();
        let sum: usize = exec.install(|| (0..100).sum());
        assert_eq!(sum, 4950);
    }
}
