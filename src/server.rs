//! Request/response driver for callers that run the optimizations
//! themselves (a workflow service, a queueing system, a test harness).
//!
//! The caller holds a serializable [`ScanState`] and loops:
//!
//! 1. [`next_jobs`] — drain the pending queue into a batch of
//!    `grid-point-string -> start geometries`. An empty batch means the scan
//!    is finished. On a freshly created state the first batch is exactly the
//!    seed jobs.
//! 2. Run each job as a constrained optimization at the batch key's dihedral
//!    angles.
//! 3. [`update_state`] — report `(start, final geometry, final energy)`
//!    triples back, keyed by the same grid-point strings; the wavefront
//!    advances exactly as the in-process scanner would.
//!
//! Jobs handed out but never reported back are forgotten; the task cache
//! makes re-issuing them idempotent.

use std::collections::BTreeMap;

use derive_more::{Display, Error, From};

use crate::E;
use crate::config::{ConfigError, ScanConfig};
use crate::geometry::Geometry;
use crate::grid::{GridPoint, ParseGridPointError};
use crate::scan::Scanner;
use crate::scan::state::{Job, ResultRecord, ScanState};

/// One reported optimization: `(start, final geometry, final energy)`.
pub type JobResult = (Geometry, Geometry, E);

#[derive(Debug, Display, Error, From)]
pub enum ServerError {
    #[display("{_0}")]
    Config(#[error(source)] ConfigError),
    #[display("{_0}")]
    BadGridPoint(#[error(source)] ParseGridPointError),
}

/// Validates the configuration and seeds the pending queue.
pub fn create_initial_state(config: ScanConfig) -> Result<ScanState, ConfigError> {
    ScanState::new(config)
}

/// The next batch of jobs to run, grouped by target grid point. Empty means
/// the scan is complete.
pub fn next_jobs(state: &mut ScanState) -> Result<BTreeMap<String, Vec<Geometry>>, ServerError> {
    let mut scanner = Scanner::new(state.clone())?;
    let batch = scanner.drain_pending();
    *state = scanner.into_state();
    Ok(batch)
}

/// Integrates completed results, keyed by the grid-point strings that
/// [`next_jobs`] handed out.
pub fn update_state(
    state: &mut ScanState,
    results: &BTreeMap<String, Vec<JobResult>>,
) -> Result<(), ServerError> {
    let mut scanner = Scanner::new(state.clone())?;
    for (grid_id, completions) in results {
        let target: GridPoint = grid_id.parse()?;
        for (start, final_geometry, final_energy) in completions {
            let job = Job::new(start.clone(), target.clone());
            let record = ResultRecord::ok(start.clone(), final_geometry.clone(), *final_energy);
            scanner.integrate(&job, record);
        }
    }
    *state = scanner.into_state();
    Ok(())
}

/// Final (or interim) answer: best energy per grid point, finite entries
/// only. Points never reached are absent.
pub fn lowest_energies(state: &ScanState) -> BTreeMap<GridPoint, E> {
    state
        .grid_status
        .iter()
        .filter_map(|(point, status)| status.best().map(|best| (point.clone(), best.energy)))
        .collect()
}
