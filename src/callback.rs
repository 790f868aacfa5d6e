//! Per-iteration hooks for observing scan progress.

use crate::E;

/// A snapshot of the scan handed to hooks once per driver iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanProgress {
    pub iteration: u64,
    /// Optimizations completed so far, cache hits included.
    pub completed: u64,
    pub pending: usize,
    pub in_flight: usize,
    /// Lowest energy seen anywhere on the grid.
    pub best_energy: Option<E>,
    /// Grid points with a finite best energy.
    pub filled: usize,
    pub grid_size: usize,
}

/// Hook invoked once per scanner iteration for logging or monitoring.
pub trait ScanCallback {
    fn call(&mut self, progress: &ScanProgress);
}

/// A callback that does nothing. Use when no per-iteration output is needed.
pub struct NoOpCallback {}

impl ScanCallback for NoOpCallback {
    fn call(&mut self, _progress: &ScanProgress) {
        // Do nothing
    }
}

/// Logs one progress line per iteration.
pub struct ProgressOutput {}

impl ScanCallback for ProgressOutput {
    fn call(&mut self, progress: &ScanProgress) {
        let best = match progress.best_energy {
            Some(e) => format!("{e:<.10}"),
            None => "-".to_string(),
        };
        log::info!(
            "iter {:>5} | {:>6} done | {:>5} pending | {:>3} running | grid {:>4}/{:<4} | best {}",
            progress.iteration,
            progress.completed,
            progress.pending,
            progress.in_flight,
            progress.filled,
            progress.grid_size,
            best,
        );
    }
}
