//! The serializable scan state: per-grid best records, the task cache, the
//! pending-job snapshot, and job identities.

use std::collections::BTreeMap;

use derive_more::{Display, Error, From};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::E;
use crate::config::{ConfigError, ScanConfig};
use crate::geometry::Geometry;
use crate::grid::GridPoint;

/// Version tag carried by every serialized state.
pub const SCHEMA_VERSION: u32 = 1;

/// Decimal places (bohr) geometries are rounded to before hashing, so that
/// floating-point noise maps to the same identity.
pub const IDENTITY_DECIMALS: i32 = 6;

/// Deterministic identity of one optimization: a SHA-256 over the rounded
/// start geometry and the target grid point. Raw float bits are never
/// hashed; coordinates go in as fixed-precision decimal strings.
pub fn fingerprint(start: &Geometry, target: &GridPoint) -> String {
    let quantum = (10f64).powi(IDENTITY_DECIMALS);
    let mut hasher = Sha256::new();
    for &c in start.coords() {
        let mut rounded = (c * quantum).round() / quantum;
        if rounded == 0.0 {
            rounded = 0.0; // collapse -0.0
        }
        hasher.update(format!("{rounded:.prec$};", prec = IDENTITY_DECIMALS as usize).as_bytes());
    }
    hasher.update(target.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// One constrained optimization to run: relax `start` with the dihedrals
/// fixed at `target`'s angles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub start: Geometry,
    pub target: GridPoint,
    pub id: String,
}

impl Job {
    pub fn new(start: Geometry, target: GridPoint) -> Self {
        let id = fingerprint(&start, &target);
        Job { start, target, id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Ok,
    Failed,
}

/// What came back from one optimization. A failure is data, not an error;
/// it never halts the scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub start: Geometry,
    pub final_geometry: Geometry,
    /// Present iff `status` is [`JobStatus::Ok`].
    pub final_energy: Option<E>,
    pub status: JobStatus,
}

impl ResultRecord {
    pub fn ok(start: Geometry, final_geometry: Geometry, final_energy: E) -> Self {
        ResultRecord {
            start,
            final_geometry,
            final_energy: Some(final_energy),
            status: JobStatus::Ok,
        }
    }

    pub fn failed(start: Geometry) -> Self {
        ResultRecord {
            final_geometry: start.clone(),
            start,
            final_energy: None,
            status: JobStatus::Failed,
        }
    }
}

/// A completed optimization, kept forever for deduplication. The target is
/// stored alongside so replayed entries can be checked against the current
/// grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub target: GridPoint,
    pub record: ResultRecord,
}

/// Best known energy and geometry at one grid point. The energy only ever
/// decreases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestRecord {
    pub energy: E,
    pub geometry: Geometry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum GridStatus {
    /// No optimization has landed here yet.
    Blank,
    Opt(BestRecord),
}

impl GridStatus {
    /// Best energy, `+inf` while blank.
    pub fn energy(&self) -> E {
        match self {
            GridStatus::Blank => E::INFINITY,
            GridStatus::Opt(best) => best.energy,
        }
    }

    pub fn best(&self) -> Option<&BestRecord> {
        match self {
            GridStatus::Blank => None,
            GridStatus::Opt(best) => Some(best),
        }
    }
}

/// A queue entry: jobs pop lowest priority energy first, insertion order
/// breaking ties. `None` priority means "no energy yet" and sorts last;
/// seed jobs use it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub energy: Option<E>,
    pub seq: u64,
    pub job: Job,
}

impl QueuedJob {
    pub fn priority(&self) -> E {
        self.energy.unwrap_or(E::INFINITY)
    }
}

// Energies are finite or absent, never NaN.
impl Eq for QueuedJob {}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority()
            .total_cmp(&other.priority())
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Display, Error, From)]
pub enum StateError {
    #[display("malformed scan state: {source}")]
    Json { source: serde_json::Error },
    #[display("scan state has schema version {found}, this build reads {}", SCHEMA_VERSION)]
    #[from(ignore)]
    SchemaVersion { found: u32 },
}

/// Everything a scan is: configuration, per-grid bests, the task cache, and
/// the pending queue. Collections only grow or improve monotonically;
/// nothing is deleted during a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanState {
    pub schema_version: u32,
    pub config: ScanConfig,
    pub grid_status: BTreeMap<GridPoint, GridStatus>,
    /// identity -> completed result; consulted before any submission.
    pub task_cache: BTreeMap<String, CachedResult>,
    /// Priority-queue snapshot, sorted by pop order.
    pub pending_jobs: Vec<QueuedJob>,
    /// Next insertion sequence number.
    pub next_seq: u64,
    /// Lowest energy seen anywhere, for convergence diagnostics.
    pub current_best_energy: Option<E>,
}

impl ScanState {
    /// Validates `config`, lays out a blank grid, and enqueues one seed job
    /// per starting geometry (priority "no energy yet", insertion order
    /// matching the seed order).
    pub fn new(config: ScanConfig) -> Result<Self, ConfigError> {
        let grid = config.validate()?;
        let grid_status = grid
            .enumerate()
            .into_iter()
            .map(|p| (p, GridStatus::Blank))
            .collect();

        let seeds = config.seed_points(&grid)?;
        let pending_jobs: Vec<QueuedJob> = seeds
            .into_iter()
            .zip(&config.init_coords)
            .enumerate()
            .map(|(seq, (target, start))| QueuedJob {
                energy: None,
                seq: seq as u64,
                job: Job::new(start.clone(), target),
            })
            .collect();
        let next_seq = pending_jobs.len() as u64;

        Ok(ScanState {
            schema_version: SCHEMA_VERSION,
            config,
            grid_status,
            task_cache: BTreeMap::new(),
            pending_jobs,
            next_seq,
            current_best_energy: None,
        })
    }

    pub fn to_json(&self) -> Result<String, StateError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, StateError> {
        let state: ScanState = serde_json::from_str(text)?;
        if state.schema_version != SCHEMA_VERSION {
            return Err(StateError::SchemaVersion {
                found: state.schema_version,
            });
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(offset: E) -> Geometry {
        Geometry::new(vec![
            -0.9,
            1.65,
            0.0,
            0.0,
            0.0,
            0.0,
            2.75,
            0.0,
            0.0,
            3.65,
            1.65,
            offset,
        ])
        .unwrap()
    }

    #[test]
    fn fingerprint_ignores_sub_rounding_noise() {
        let target = GridPoint::new(vec![60]);
        let a = fingerprint(&geometry(0.0), &target);
        let b = fingerprint(&geometry(4e-8), &target);
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_collapses_negative_zero() {
        let target = GridPoint::new(vec![60]);
        assert_eq!(
            fingerprint(&geometry(0.0), &target),
            fingerprint(&geometry(-4e-8), &target)
        );
    }

    #[test]
    fn fingerprint_separates_targets_and_geometries() {
        let geo = geometry(0.0);
        let a = fingerprint(&geo, &GridPoint::new(vec![60]));
        let b = fingerprint(&geo, &GridPoint::new(vec![-60]));
        assert_ne!(a, b);
        let c = fingerprint(&geometry(0.5), &GridPoint::new(vec![60]));
        assert_ne!(a, c);
    }

    #[test]
    fn queued_jobs_order_by_energy_then_sequence() {
        let job = Job::new(geometry(0.0), GridPoint::new(vec![0]));
        let mk = |energy, seq| QueuedJob {
            energy,
            seq,
            job: job.clone(),
        };
        assert!(mk(Some(-1.0), 5) < mk(Some(-0.5), 0));
        assert!(mk(Some(-1.0), 0) < mk(Some(-1.0), 1));
        assert!(mk(Some(1e9), 7) < mk(None, 0)); // no energy sorts last
    }

    #[test]
    fn state_round_trips_through_json() {
        let config = ScanConfig {
            dihedrals: vec![[0, 1, 2, 3]],
            grid_spacing: vec![90],
            dihedral_ranges: vec![None],
            elements: vec!["H".into(), "O".into(), "O".into(), "H".into()],
            init_coords: vec![geometry(0.0)],
            energy_decrease_thresh: 1e-5,
        };
        let state = ScanState::new(config).unwrap();
        let restored = ScanState::from_json(&state.to_json().unwrap()).unwrap();
        assert_eq!(state, restored);
    }

    #[test]
    fn unknown_schema_versions_are_rejected() {
        let config = ScanConfig {
            dihedrals: vec![[0, 1, 2, 3]],
            grid_spacing: vec![90],
            dihedral_ranges: vec![None],
            elements: vec!["H".into(), "O".into(), "O".into(), "H".into()],
            init_coords: vec![geometry(0.0)],
            energy_decrease_thresh: 1e-5,
        };
        let mut state = ScanState::new(config).unwrap();
        state.schema_version = 99;
        let text = serde_json::to_string(&state).unwrap();
        assert!(matches!(
            ScanState::from_json(&text),
            Err(StateError::SchemaVersion { found: 99 })
        ));
    }
}
