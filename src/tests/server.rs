use std::collections::BTreeMap;

use crate::grid::GridPoint;
use crate::scan::state::{Job, ResultRecord, ScanState};
use crate::scan::{ScanHooks, Scanner};
use crate::server::{self, JobResult};
use crate::{E, Status};

use super::{config_1d, hooh, snap};

fn quadratic(target: &GridPoint) -> E {
    let theta = E::from(target.values()[0]);
    (theta / 180.0) * (theta / 180.0)
}

/// Drives a server-style loop to completion, optionally bouncing the state
/// through JSON between rounds.
fn drive(mut state: ScanState, through_json: bool) -> (ScanState, usize) {
    let config = state.config.clone();
    let mut rounds = 0;
    loop {
        if through_json {
            state = ScanState::from_json(&state.to_json().unwrap()).unwrap();
        }
        let jobs = server::next_jobs(&mut state).unwrap();
        if jobs.is_empty() {
            return (state, rounds);
        }
        rounds += 1;

        let mut results: BTreeMap<String, Vec<JobResult>> = BTreeMap::new();
        for (grid_id, starts) in &jobs {
            let target: GridPoint = grid_id.parse().unwrap();
            let completions = starts
                .iter()
                .map(|start| {
                    let final_geometry = snap(&config, start, &target);
                    (start.clone(), final_geometry, quadratic(&target))
                })
                .collect();
            results.insert(grid_id.clone(), completions);
        }
        server::update_state(&mut state, &results).unwrap();
    }
}

#[test]
fn fresh_state_hands_out_the_seed_jobs() {
    let config = config_1d(60, None, 3.0);
    let mut state = server::create_initial_state(config).unwrap();
    let jobs = server::next_jobs(&mut state).unwrap();

    assert_eq!(jobs.len(), 1);
    let seeds = &jobs["0"];
    assert_eq!(seeds.len(), 1);
    assert_eq!(seeds[0], hooh(3.0));

    // Handing the batch out clears the queue; asking again without results
    // returns nothing (at-least-once semantics, the cache covers re-issue).
    assert!(server::next_jobs(&mut state).unwrap().is_empty());
}

#[test]
fn server_loop_matches_the_in_process_scanner() {
    let config = config_1d(60, None, 3.0);

    let reference = {
        let cfg = config.clone();
        let mut engine = crate::engine::scripted::ScriptedEngine::new(move |job: &Job| {
            let final_geometry = snap(&cfg, &job.start, &job.target);
            ResultRecord::ok(job.start.clone(), final_geometry, quadratic(&job.target))
        });
        let mut scanner = Scanner::from_config(config.clone()).unwrap();
        let status = scanner.run(&mut engine, &mut ScanHooks::silent()).unwrap();
        assert_eq!(status, Status::Converged);
        scanner.lowest_energies()
    };

    let state = server::create_initial_state(config).unwrap();
    let (final_state, rounds) = drive(state, false);
    assert!(rounds >= 2);
    assert_eq!(server::lowest_energies(&final_state), reference);
}

#[test]
fn json_round_trips_between_rounds_change_nothing() {
    let config = config_1d(60, None, 3.0);

    let (plain, _) = drive(server::create_initial_state(config.clone()).unwrap(), false);
    let (bounced, _) = drive(server::create_initial_state(config).unwrap(), true);

    assert_eq!(plain, bounced);
    assert_eq!(
        server::lowest_energies(&plain),
        server::lowest_energies(&bounced)
    );
}

#[test]
fn update_state_rejects_garbled_grid_ids() {
    let config = config_1d(60, None, 3.0);
    let mut state = server::create_initial_state(config).unwrap();
    let _ = server::next_jobs(&mut state).unwrap();

    let mut results: BTreeMap<String, Vec<JobResult>> = BTreeMap::new();
    results.insert("sixty".into(), vec![(hooh(0.0), hooh(60.0), 1.0)]);
    assert!(server::update_state(&mut state, &results).is_err());
}
