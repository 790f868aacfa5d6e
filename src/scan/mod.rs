//! The wavefront scanner.
//!
//! One logical owner drives the whole scan: pop the most promising pending
//! job, hand it to the optimizer, fold completed results back into the
//! per-grid bests, and push improved geometries onto every neighboring grid
//! point. The loop ends when the queue drains with nothing in flight.
//!
//! Parallelism lives entirely below the [`Optimizer`] boundary; the scanner
//! itself never shares mutable state and only blocks while waiting for at
//! least one completed optimization.

pub mod queue;
pub mod state;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use derive_more::{Display, Error, From};
use log::{debug, info, warn};

use crate::callback::ScanProgress;
use crate::config::ConfigError;
use crate::engine::{JobHandle, Optimizer};
use crate::geometry::Geometry;
use crate::grid::{GridPoint, TorsionGrid};
use crate::persistence::{LogRecord, PersistError, ScanLog};
use crate::terminators::Terminator;
use crate::{E, Status, callback::ScanCallback};

use queue::JobQueue;
use state::{BestRecord, CachedResult, GridStatus, Job, JobStatus, QueuedJob, ResultRecord, ScanState};

/// How often the collect phase polls a busy optimizer.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Observation hooks consulted once per driver iteration.
pub struct ScanHooks {
    pub callback: Box<dyn ScanCallback>,
    pub terminator: Box<dyn Terminator>,
}

impl ScanHooks {
    /// No output, no early stopping.
    pub fn silent() -> Self {
        ScanHooks {
            callback: Box::new(crate::callback::NoOpCallback {}),
            terminator: Box::new(crate::terminators::NoOpTerminator {}),
        }
    }
}

#[derive(Debug, Display, Error, From)]
pub enum ScanError {
    #[display("{_0}")]
    Config(#[error(source)] ConfigError),
    #[display("{_0}")]
    Persist(#[error(source)] PersistError),
}

/// The scan driver. Owns the [`ScanState`] exclusively; the optimizer only
/// ever sees plain [`Job`] and [`ResultRecord`] values.
pub struct Scanner {
    state: ScanState,
    grid: TorsionGrid,
    queue: JobQueue,
    /// Identities submitted during this run; an identity is never submitted
    /// twice in one run.
    submitted: HashSet<String>,
    log: Option<ScanLog>,
    completed: u64,
}

impl Scanner {
    pub fn new(mut state: ScanState) -> Result<Self, ConfigError> {
        let grid = state.config.validate()?;
        let queue = JobQueue::restore(std::mem::take(&mut state.pending_jobs));
        Ok(Scanner {
            state,
            grid,
            queue,
            submitted: HashSet::new(),
            log: None,
            completed: 0,
        })
    }

    pub fn from_config(config: crate::config::ScanConfig) -> Result<Self, ConfigError> {
        Scanner::new(ScanState::new(config)?)
    }

    /// Attaches an append-only scan log; every completed optimization is
    /// recorded before it is integrated.
    pub fn with_log(mut self, log: ScanLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Replays previously logged results into the task cache. Entries whose
    /// grid point does not exist under the current configuration (changed
    /// dihedrals or spacing) are discarded and their work re-run. Returns
    /// the number of records kept.
    pub fn replay(&mut self, records: Vec<LogRecord>) -> usize {
        let mut kept = 0;
        for record in records {
            let Ok(target) = record.grid.parse::<GridPoint>() else {
                warn!("discarding log record {}: bad grid id {:?}", short(&record.id), record.grid);
                continue;
            };
            if !self.grid.contains(&target) {
                warn!("discarding log record for {target}: not on the configured grid");
                continue;
            }
            let id = record.id.clone();
            self.state.task_cache.insert(
                id,
                CachedResult {
                    target,
                    record: record.into_result(),
                },
            );
            kept += 1;
        }
        info!("replayed {kept} completed optimization(s) from the scan log");
        kept
    }

    pub fn state(&self) -> &ScanState {
        &self.state
    }

    /// Consumes the scanner, folding the live queue back into the state
    /// snapshot.
    pub fn into_state(mut self) -> ScanState {
        self.state.pending_jobs = self.queue.snapshot();
        self.state
    }

    /// Runs the scan to completion (or until a terminator fires) against
    /// `optimizer`.
    pub fn run<O: Optimizer>(
        &mut self,
        optimizer: &mut O,
        hooks: &mut ScanHooks,
    ) -> Result<Status, ScanError> {
        let mut outstanding: HashMap<JobHandle, Job> = HashMap::new();
        let mut iteration = 0u64;
        hooks.terminator.initialize();

        loop {
            iteration += 1;

            // Dispatch: pop best-first until the optimizer is saturated or
            // the queue drains. Cached identities complete immediately.
            loop {
                if let Some(capacity) = optimizer.capacity() {
                    if outstanding.len() >= capacity {
                        break;
                    }
                }
                let Some(entry) = self.queue.pop() else { break };
                let job = entry.job;

                if let Some(cached) = self.state.task_cache.get(&job.id) {
                    let record = cached.record.clone();
                    debug!("cache hit for {} -> {}", short(&job.id), job.target);
                    self.integrate(&job, record);
                    continue;
                }
                if !self.submitted.insert(job.id.clone()) {
                    // An identical job is already in flight; its result will
                    // serve both.
                    continue;
                }
                match optimizer.submit(&job) {
                    Ok(handle) => {
                        debug!("submitted {} -> {}", short(&job.id), job.target);
                        outstanding.insert(handle, job);
                    }
                    Err(err) => {
                        warn!("submission for {} failed: {err}", job.target);
                        let record = ResultRecord::failed(job.start.clone());
                        self.record(&job, &record)?;
                        self.integrate(&job, record);
                    }
                }
            }

            if outstanding.is_empty() && self.queue.is_empty() {
                break;
            }

            // Collect: block until at least one optimization finishes,
            // still honoring the terminator while waiting.
            let ready = loop {
                let ready = optimizer.poll_ready();
                if !ready.is_empty() {
                    break ready;
                }
                let progress = self.progress(iteration, outstanding.len());
                if let Some(status) = hooks.terminator.terminate(&progress) {
                    info!("stopping while waiting on {} job(s): {status:?}", outstanding.len());
                    return Ok(status);
                }
                std::thread::sleep(POLL_INTERVAL);
            };

            for handle in ready {
                let Some(job) = outstanding.remove(&handle) else {
                    continue;
                };
                let record = optimizer.collect(handle);
                self.record(&job, &record)?;
                self.integrate(&job, record);
            }

            let progress = self.progress(iteration, outstanding.len());
            hooks.callback.call(&progress);
            if let Some(status) = hooks.terminator.terminate(&progress) {
                info!("stopping early: {status:?}");
                return Ok(status);
            }
        }

        Ok(Status::Converged)
    }

    /// Pops every pending job for an external runner, grouped by target grid
    /// point string. Cached identities complete in place (which may enqueue
    /// more work, also drained); duplicates within the batch collapse.
    pub fn drain_pending(&mut self) -> BTreeMap<String, Vec<Geometry>> {
        let mut batch: BTreeMap<String, Vec<Geometry>> = BTreeMap::new();
        let mut handed: HashSet<String> = HashSet::new();
        while let Some(entry) = self.queue.pop() {
            let job = entry.job;
            if let Some(cached) = self.state.task_cache.get(&job.id) {
                let record = cached.record.clone();
                self.integrate(&job, record);
                continue;
            }
            if !handed.insert(job.id.clone()) {
                continue;
            }
            batch
                .entry(job.target.to_string())
                .or_default()
                .push(job.start);
        }
        batch
    }

    /// Folds one completed optimization into the state. Failures only fill
    /// the task cache; successes update the best record at their *landing*
    /// grid point and fan out to its neighbors when they improve on the
    /// incumbent by more than the energy-decrease threshold.
    pub(crate) fn integrate(&mut self, job: &Job, record: ResultRecord) {
        self.completed += 1;
        self.state
            .task_cache
            .entry(job.id.clone())
            .or_insert_with(|| CachedResult {
                target: job.target.clone(),
                record: record.clone(),
            });

        if record.status == JobStatus::Failed {
            debug!("optimization targeting {} failed", job.target);
            return;
        }
        let Some(final_energy) = record.final_energy else {
            warn!("ok result for {} carries no energy; treating as failed", job.target);
            return;
        };
        // Non-converged QM runs can report a literal NaN energy; it must not
        // reach the accept gate (NaN fails every comparison).
        if !final_energy.is_finite() {
            warn!(
                "ok result for {} carries non-finite energy {final_energy}; treating as failed",
                job.target
            );
            return;
        }

        // The optimizer may have settled on a different grid point than
        // requested; only the landing point is updated.
        let angles = self.state.config.measure(&record.final_geometry);
        let Some(landed) = self.grid.quantize(&angles) else {
            debug!("result for {} landed outside the scanned range", job.target);
            return;
        };
        if landed != job.target {
            debug!("requested {} but landed on {landed}", job.target);
        }

        let incumbent = self
            .state
            .grid_status
            .get(&landed)
            .map(GridStatus::energy)
            .unwrap_or(E::INFINITY);
        if final_energy + self.state.config.energy_decrease_thresh >= incumbent {
            debug!(
                "rejected {final_energy:.10} at {landed} (incumbent {incumbent:.10})"
            );
            return;
        }

        assert!(
            final_energy <= incumbent,
            "best energy at {landed} would increase from {incumbent} to {final_energy}"
        );
        self.state.grid_status.insert(
            landed.clone(),
            GridStatus::Opt(BestRecord {
                energy: final_energy,
                geometry: record.final_geometry.clone(),
            }),
        );
        if self
            .state
            .current_best_energy
            .is_none_or(|best| final_energy < best)
        {
            self.state.current_best_energy = Some(final_energy);
        }
        debug!("accepted {final_energy:.10} at {landed}");

        // Fan out: every neighbor gets a job starting from the improved
        // geometry. Already-completed identities are enqueued too — dispatch
        // short-circuits them from the cache, which is what rebuilds the
        // wavefront after a restart; only already-pending duplicates are
        // dropped.
        for neighbor in self.grid.neighbors(&landed) {
            let successor = Job::new(record.final_geometry.clone(), neighbor);
            if self.queue.contains(&successor.id) {
                continue;
            }
            let seq = self.state.next_seq;
            self.state.next_seq += 1;
            self.queue.push(QueuedJob {
                energy: Some(final_energy),
                seq,
                job: successor,
            });
        }
    }

    fn record(&mut self, job: &Job, record: &ResultRecord) -> Result<(), PersistError> {
        if let Some(log) = &mut self.log {
            log.append(&LogRecord::new(job, record))?;
        }
        Ok(())
    }

    fn progress(&self, iteration: u64, in_flight: usize) -> ScanProgress {
        let filled = self
            .state
            .grid_status
            .values()
            .filter(|status| status.best().is_some())
            .count();
        ScanProgress {
            iteration,
            completed: self.completed,
            pending: self.queue.len(),
            in_flight,
            best_energy: self.state.current_best_energy,
            filled,
            grid_size: self.state.grid_status.len(),
        }
    }

    /// Final scan output: every grid point with a finite best energy.
    pub fn lowest_energies(&self) -> BTreeMap<GridPoint, E> {
        self.state
            .grid_status
            .iter()
            .filter_map(|(point, status)| status.best().map(|best| (point.clone(), best.energy)))
            .collect()
    }
}

fn short(id: &str) -> &str {
    &id[..12.min(id.len())]
}
