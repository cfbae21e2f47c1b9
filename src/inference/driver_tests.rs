//! Integration tests for the MCMC driver.
//!
//! These tests verify:
//! 1. The acceptance-probability identity for symmetric proposals
//! 2. Prior recovery under a parameter-blind simulator
//! 3. Persisted acceptance counters match their definition exactly
//! 4. The simulator failure budget aborts the slot
//! 5. A resumed two-block run replays the straight run bit for bit

use crate::inference::config::InferenceConfig;
use crate::inference::driver::{accept_probability, RunSettings, SlotRunner};
use crate::inference::error::{InferenceError, SimulatorError};
use crate::inference::observations::ObservationBundle;
use crate::inference::params::{ExpandedSpecs, ParamSample};
use crate::inference::paths::{ArtifactKind, ArtifactLayout, Stream};
use crate::inference::persistence::{ArtifactStore, LikelihoodRow};
use crate::inference::simulator::{
    FixedTrajectorySimulator, SimulationContext, Simulator, Trajectory,
};
use crate::inference::params::ModifierRow;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

#[test]
fn acceptance_probabilities_are_reciprocal() {
    let pairs = [(-10.0, -12.5), (-3.0, -3.0), (-100.0, -1.0), (0.5, -0.5)];
    for (a, b) in pairs {
        let forward = accept_probability(b, a);
        let backward = accept_probability(a, b);
        // Detailed balance for a symmetric kernel: e^a * α(a->b) = e^b * α(b->a).
        let lhs = a.exp() * forward;
        let rhs = b.exp() * backward;
        assert!((lhs - rhs).abs() < 1e-12 * lhs.abs().max(1.0), "pair ({}, {})", a, b);
    }
    assert_eq!(accept_probability(f64::NAN, -1.0), 0.0);
    assert_eq!(accept_probability(f64::NEG_INFINITY, -1.0), 0.0);
    assert_eq!(accept_probability(-1.0, f64::NEG_INFINITY), 1.0);
}

// -----------------------------------------------------------------------------
// Harness helpers
// -----------------------------------------------------------------------------

fn parse_config(src: &str) -> (InferenceConfig, ExpandedSpecs) {
    let config: InferenceConfig = toml::from_str(src).unwrap();
    config.validate().unwrap();
    let specs = ExpandedSpecs::from_config(&config).unwrap();
    (config, specs)
}

fn settings(iterations: u64, block: u64, resume: bool, seed: u64) -> RunSettings {
    RunSettings {
        run_id: "test".to_string(),
        block,
        iterations,
        resume,
        stochastic: false,
        master_seed: seed,
    }
}

fn read_rows<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> Vec<T> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    reader.deserialize().map(|r| r.unwrap()).collect()
}

/// Daily incidence `20 * (1 - m)` where `m` is the single modifier value.
struct LinearSimulator;

impl Simulator for LinearSimulator {
    fn simulate(
        &self,
        theta: &ParamSample,
        ctx: &mut SimulationContext<'_>,
    ) -> Result<Trajectory, SimulatorError> {
        let m = theta.seir_modifiers[0].value;
        let days = ctx.window.num_days();
        let mut traj = Trajectory::new(*ctx.window);
        for subpop in ctx.subpops {
            for target in ctx.targets {
                traj.set_outcome(subpop, target, vec![20.0 * (1.0 - m); days]);
            }
        }
        Ok(traj)
    }
}

const FLAT_CONFIG: &str = r#"
    start_date = "2020-03-01"
    end_date = "2020-03-07"

    [[subpopulations]]
    id = "A"
    population = 1000.0

    [[seir_modifiers]]
    name = "lockdown"
    value = 0.5
    lower = 0.0
    upper = 1.0
    perturbation = { dist = "normal", sd = 0.2 }
    prior = { dist = "uniform", low = 0.0, high = 1.0 }

    [inference]
    iterations_per_slot = 10
"#;

#[test]
fn fixed_simulator_samples_the_prior() {
    let (config, specs) = parse_config(FLAT_CONFIG);
    let obs = ObservationBundle::empty(config.window(), config.subpop_ids(), Vec::new());
    let simulator = FixedTrajectorySimulator { values: BTreeMap::new() };
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::new(ArtifactLayout::new(dir.path(), "model", "prior"));

    let k = 800;
    let mut runner = SlotRunner::new(
        &config,
        &specs,
        &obs,
        &simulator,
        &store,
        settings(k, 1, false, 42),
        0,
    )
    .unwrap();
    runner.run().unwrap();

    // With a Θ-blind simulator and a flat likelihood the global chain is a
    // draw from the uniform prior.
    let mut values = Vec::new();
    for iteration in 1..=k {
        let path =
            store
                .layout()
                .iteration_path(Stream::Global, ArtifactKind::SeirModifiers, 0, 1, iteration);
        let rows: Vec<ModifierRow> = read_rows(&path);
        values.push(rows[0].value);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    assert!((mean - 0.5).abs() < 0.15, "prior mean drifted: {}", mean);
    let below = values.iter().filter(|v| **v < 0.5).count() as f64 / values.len() as f64;
    assert!((0.25..=0.75).contains(&below), "prior mass lopsided: {}", below);
}

const POISSON_CONFIG: &str = r#"
    start_date = "2020-03-01"
    end_date = "2020-03-07"

    [[subpopulations]]
    id = "A"
    population = 100000.0

    [[seir_modifiers]]
    name = "lockdown"
    value = 0.5
    lower = 0.0
    upper = 1.0
    perturbation = { dist = "normal", sd = 0.1 }
    prior = { dist = "uniform", low = 0.0, high = 1.0 }

    [inference]
    iterations_per_slot = 20

    [[inference.statistics]]
    name = "incidC"
    likelihood = { family = "poisson" }
"#;

fn poisson_observations(config: &InferenceConfig) -> ObservationBundle {
    let mut obs = ObservationBundle::empty(
        config.window(),
        config.subpop_ids(),
        vec!["incidC".to_string()],
    );
    for day in 0..config.window().num_days() {
        obs.set("A", "incidC", day, 12.0);
    }
    obs
}

#[test]
fn persisted_counters_match_their_definition() {
    let (config, specs) = parse_config(POISSON_CONFIG);
    let obs = poisson_observations(&config);
    let simulator = LinearSimulator;
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::new(ArtifactLayout::new(dir.path(), "model", "counters"));

    let k = 20;
    SlotRunner::new(&config, &specs, &obs, &simulator, &store, settings(k, 1, false, 7), 0)
        .unwrap()
        .run()
        .unwrap();

    let mut last_accepts = 0u64;
    for iteration in 1..=k {
        let path = store
            .layout()
            .iteration_path(Stream::Global, ArtifactKind::Likelihood, 0, 1, iteration);
        let rows: Vec<LikelihoodRow> = read_rows(&path);
        let row = &rows[0];
        assert_eq!(row.iterations, iteration);
        assert!(row.accepts >= last_accepts);
        assert!(row.accepts - last_accepts <= 1);
        let expected = row.accepts as f64 / row.iterations as f64;
        assert_eq!(row.accept_avg, expected);
        last_accepts = row.accepts;
    }
}

/// Succeeds for the initial simulation, then fails every call.
struct FailAfterFirst {
    calls: AtomicU32,
}

impl Simulator for FailAfterFirst {
    fn simulate(
        &self,
        _theta: &ParamSample,
        ctx: &mut SimulationContext<'_>,
    ) -> Result<Trajectory, SimulatorError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            let days = ctx.window.num_days();
            let mut traj = Trajectory::new(*ctx.window);
            for subpop in ctx.subpops {
                for target in ctx.targets {
                    traj.set_outcome(subpop, target, vec![10.0; days]);
                }
            }
            Ok(traj)
        } else {
            Err(SimulatorError::Failed("synthetic outage".to_string()))
        }
    }
}

#[test]
fn failure_budget_aborts_the_slot() {
    let src = POISSON_CONFIG.replace(
        "iterations_per_slot = 20",
        "iterations_per_slot = 20\nsimulator_failure_limit = 2",
    );
    let (config, specs) = parse_config(&src);
    let obs = poisson_observations(&config);
    let simulator = FailAfterFirst { calls: AtomicU32::new(0) };
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::new(ArtifactLayout::new(dir.path(), "model", "failing"));

    let err = SlotRunner::new(
        &config,
        &specs,
        &obs,
        &simulator,
        &store,
        settings(20, 1, false, 7),
        0,
    )
    .unwrap()
    .run()
    .unwrap_err();
    match err {
        InferenceError::SimulatorLimit { failures, .. } => assert_eq!(failures, 3),
        other => panic!("expected SimulatorLimit, got {}", other),
    }
}

#[test]
fn resumed_blocks_replay_the_straight_run() {
    let (config, specs) = parse_config(POISSON_CONFIG);
    let obs = poisson_observations(&config);
    let simulator = LinearSimulator;
    let seed = 99;

    // Straight run: one block of 6.
    let dir_a = TempDir::new().unwrap();
    let store_a = ArtifactStore::new(ArtifactLayout::new(dir_a.path(), "model", "straight"));
    SlotRunner::new(&config, &specs, &obs, &simulator, &store_a, settings(6, 1, false, seed), 0)
        .unwrap()
        .run()
        .unwrap();

    // Two-phase run: 3 iterations, then resume for 3 more.
    let dir_b = TempDir::new().unwrap();
    let store_b = ArtifactStore::new(ArtifactLayout::new(dir_b.path(), "model", "phased"));
    SlotRunner::new(&config, &specs, &obs, &simulator, &store_b, settings(3, 1, false, seed), 0)
        .unwrap()
        .run()
        .unwrap();
    SlotRunner::new(&config, &specs, &obs, &simulator, &store_b, settings(3, 2, true, seed), 0)
        .unwrap()
        .run()
        .unwrap();

    for iteration in 1..=6u64 {
        let block = if iteration <= 3 { 1 } else { 2 };
        let path_a = store_a
            .layout()
            .iteration_path(Stream::Global, ArtifactKind::SeirModifiers, 0, 1, iteration);
        let path_b = store_b
            .layout()
            .iteration_path(Stream::Global, ArtifactKind::SeirModifiers, 0, block, iteration);
        let rows_a: Vec<ModifierRow> = read_rows(&path_a);
        let rows_b: Vec<ModifierRow> = read_rows(&path_b);
        assert_eq!(rows_a[0].value.to_bits(), rows_b[0].value.to_bits(), "iter {}", iteration);
    }
}
