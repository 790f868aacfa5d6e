//! Terminators for stopping a scan before the wavefront drains.
//!
//! This module provides several implementations of the [`Terminator`] trait:
//! - [`InterruptTerminator`]: Responds to Ctrl-C (SIGINT) or programmatic interrupts.
//! - [`TimeOutTerminator`]: Stops after a wall-time limit.
//! - [`JobBudgetTerminator`]: Stops after a number of completed optimizations.
//! - [`MultipleTerminators`]: Combines multiple terminators.
//!
//! Stopping a scan is not destructive: completed optimizations are already in
//! the scan log, and a resumed run replays them from the task cache.
//!
//! # Note
//! [`InterruptTerminator`] installs a global signal handler and **can only be
//! constructed once** per process. Attempting to create multiple instances
//! will result in a panic.

use std::sync::{Arc, atomic::AtomicBool};

use crate::Status;
use crate::callback::ScanProgress;

pub trait Terminator {
    fn initialize(&mut self) {}

    /// Returns the stopping status once the condition fires.
    fn terminate(&mut self, progress: &ScanProgress) -> Option<Status>;
}

/// A terminator that never fires.
pub struct NoOpTerminator {}

impl Terminator for NoOpTerminator {
    fn terminate(&mut self, _progress: &ScanProgress) -> Option<Status> {
        None
    }
}

/// Terminator that responds to Ctrl-C (SIGINT) or programmatic interrupts.
///
/// # Note
/// Only one instance of `InterruptTerminator` can be constructed per process,
/// as it installs a global signal handler. Creating more than one will panic.
pub struct InterruptTerminator {
    interrupted: Arc<AtomicBool>,
}

impl InterruptTerminator {
    pub fn new() -> Self {
        let interrupted = Arc::new(AtomicBool::new(false));
        ctrlc::set_handler({
            let interrupted_clone = interrupted.clone();
            move || {
                interrupted_clone.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        })
        .expect("Error setting Ctrl-C handler");
        Self { interrupted }
    }

    pub fn interrupt(&mut self) {
        self.interrupted.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Terminator for InterruptTerminator {
    fn terminate(&mut self, _progress: &ScanProgress) -> Option<Status> {
        if self.interrupted.load(std::sync::atomic::Ordering::SeqCst) {
            Some(Status::Interrupted)
        } else {
            None
        }
    }
}

/// Terminator that triggers after a specified number of seconds.
pub struct TimeOutTerminator {
    max_time_secs: u64,
    start_time: std::time::Instant,
}

impl TimeOutTerminator {
    pub fn new(max_time_secs: u64) -> Self {
        Self {
            max_time_secs,
            start_time: std::time::Instant::now(),
        }
    }
}

impl Terminator for TimeOutTerminator {
    fn initialize(&mut self) {
        self.start_time = std::time::Instant::now();
    }

    fn terminate(&mut self, _progress: &ScanProgress) -> Option<Status> {
        if self.start_time.elapsed().as_secs() >= self.max_time_secs {
            Some(Status::TimeLimit)
        } else {
            None
        }
    }
}

/// Terminator that triggers after a number of completed optimizations.
///
/// Cache hits count as completions, so a resumed scan spends its budget on
/// replayed work first.
pub struct JobBudgetTerminator {
    max_jobs: u64,
}

impl JobBudgetTerminator {
    pub fn new(max_jobs: u64) -> Self {
        Self { max_jobs }
    }
}

impl Terminator for JobBudgetTerminator {
    fn terminate(&mut self, progress: &ScanProgress) -> Option<Status> {
        if progress.completed >= self.max_jobs {
            Some(Status::JobLimit)
        } else {
            None
        }
    }
}

/// Terminator that combines multiple terminators and triggers if any of them do.
pub struct MultipleTerminators {
    terminators: Vec<Box<dyn Terminator>>,
}

impl MultipleTerminators {
    pub fn new(terminators: Vec<Box<dyn Terminator>>) -> Self {
        Self { terminators }
    }
}

impl Terminator for MultipleTerminators {
    fn initialize(&mut self) {
        for terminator in &mut self.terminators {
            terminator.initialize();
        }
    }

    fn terminate(&mut self, progress: &ScanProgress) -> Option<Status> {
        for terminator in &mut self.terminators {
            if let Some(status) = terminator.as_mut().terminate(progress) {
                return Some(status);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(completed: u64) -> ScanProgress {
        ScanProgress {
            iteration: 1,
            completed,
            pending: 0,
            in_flight: 0,
            best_energy: None,
            filled: 0,
            grid_size: 1,
        }
    }

    #[test]
    fn job_budget_fires_at_the_limit() {
        let mut terminator = JobBudgetTerminator::new(3);
        assert_eq!(terminator.terminate(&progress(2)), None);
        assert_eq!(terminator.terminate(&progress(3)), Some(Status::JobLimit));
    }

    #[test]
    fn multiple_reports_the_first_firing_member() {
        let mut terminator = MultipleTerminators::new(vec![
            Box::new(NoOpTerminator {}),
            Box::new(JobBudgetTerminator::new(1)),
        ]);
        assert_eq!(terminator.terminate(&progress(5)), Some(Status::JobLimit));
    }

    #[test]
    fn timeout_with_zero_budget_fires_immediately() {
        let mut terminator = TimeOutTerminator::new(0);
        terminator.initialize();
        assert_eq!(terminator.terminate(&progress(0)), Some(Status::TimeLimit));
    }
}
