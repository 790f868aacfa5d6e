//! The optimizer capability and its backends.
//!
//! The scanner only needs three operations: hand a job over, ask which
//! handles finished, and collect a result. How the constrained optimization
//! actually runs — a local QM process, the external geomeTRIC driver, a
//! remote work queue, or a scripted stand-in — is a backend detail behind
//! [`Optimizer`].

pub mod qm;
pub mod scripted;
pub mod wq;

use derive_more::{Display, Error, From};
use enum_dispatch::enum_dispatch;

use crate::grid::GridPoint;
use crate::scan::state::{Job, ResultRecord};

use qm::ProcessEngine;
use scripted::ScriptedEngine;
use wq::WorkQueueEngine;

/// Opaque ticket for one submitted optimization.
pub type JobHandle = u64;

#[derive(Debug, Display, Error, From)]
pub enum EngineError {
    #[display("engine i/o error: {source}")]
    Io { source: std::io::Error },
    #[display("could not spawn {program:?}: {source}")]
    #[from(ignore)]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[display("work queue error: {message}")]
    #[from(ignore)]
    WorkQueue { message: String },
}

/// Capability required of any optimization backend.
///
/// A failed optimization is reported inside the [`ResultRecord`], never as
/// an `Err`; no single job may halt the scan.
#[enum_dispatch]
pub trait Optimizer {
    /// Starts a constrained optimization: relax `job.start` with the scanned
    /// dihedrals fixed at `job.target`'s angles, everything else free.
    fn submit(&mut self, job: &Job) -> Result<JobHandle, EngineError>;

    /// Handles whose results can be collected without blocking.
    fn poll_ready(&mut self) -> Vec<JobHandle>;

    /// Consumes a ready handle and returns its result.
    fn collect(&mut self, handle: JobHandle) -> ResultRecord;

    /// Maximum number of outstanding submissions, `None` when unbounded.
    fn capacity(&self) -> Option<usize>;
}

/// The configured backends, dispatched statically.
#[enum_dispatch(Optimizer)]
pub enum Optimizers {
    Process(ProcessEngine),
    WorkQueue(WorkQueueEngine),
    Scripted(ScriptedEngine),
}

/// Renders the per-job constraints file: any user-supplied extra constraints
/// first, then a `$set` block pinning each scanned dihedral (one-based atom
/// indices) to its target grid angle.
pub fn job_constraints(
    dihedrals: &[[usize; 4]],
    target: &GridPoint,
    extra: Option<&str>,
) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    if let Some(extra) = extra {
        out.push_str(extra.trim_end());
        out.push('\n');
    }
    out.push_str("$set\n");
    for (idxs, value) in dihedrals.iter().zip(target.values()) {
        let [i, j, k, l] = *idxs;
        let _ = writeln!(
            out,
            "dihedral {} {} {} {} {:.4}",
            i + 1,
            j + 1,
            k + 1,
            l + 1,
            f64::from(*value)
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraints_pin_every_scanned_dihedral() {
        let text = job_constraints(
            &[[0, 1, 2, 3], [1, 2, 3, 4]],
            &GridPoint::new(vec![60, -120]),
            None,
        );
        assert_eq!(
            text,
            "$set\ndihedral 1 2 3 4 60.0000\ndihedral 2 3 4 5 -120.0000\n"
        );
    }

    #[test]
    fn extra_constraints_come_first() {
        let text = job_constraints(
            &[[0, 1, 2, 3]],
            &GridPoint::new(vec![0]),
            Some("$freeze\ndistance 5 6\n"),
        );
        assert!(text.starts_with("$freeze\ndistance 5 6\n$set\n"));
    }
}
