//! End-to-end inference scenarios.
//!
//! Three calibration runs exercised through the public API, artifacts and
//! all:
//! 1. Single subpopulation, Poisson target: the posterior concentrates
//!    around the data-implied rate.
//! 2. Two subpopulations with a hierarchical pull: the posterior gap between
//!    their parameters collapses when the term is enabled.
//! 3. Resume: a 50+50 two-block run reproduces a straight 100-iteration run
//!    bit for bit.
//! 4. Ensemble back end smoke run against the in-memory archive.

use epifit::inference::{
    run_slots, ArtifactKind, ArtifactLayout, ArtifactStore, EnsembleArchive, EnsembleRunner,
    EnsembleSettings, ExpandedSpecs, InferenceConfig, ObservationBundle, ParamSample,
    RunSettings, SimulationContext, Simulator, SimulatorError, Stream, Trajectory,
};
use epifit::inference::params::ModifierRow;
use std::path::Path;
use tempfile::TempDir;

fn parse(src: &str) -> (InferenceConfig, ExpandedSpecs) {
    let config: InferenceConfig = toml::from_str(src).unwrap();
    config.validate().unwrap();
    let specs = ExpandedSpecs::from_config(&config).unwrap();
    (config, specs)
}

fn settings(iterations: u64, block: u64, resume: bool, seed: u64) -> RunSettings {
    RunSettings {
        run_id: "it".to_string(),
        block,
        iterations,
        resume,
        stochastic: false,
        master_seed: seed,
    }
}

fn modifier_values(
    store: &ArtifactStore,
    block: u64,
    iteration: u64,
) -> Vec<ModifierRow> {
    let path = store
        .layout()
        .iteration_path(Stream::Global, ArtifactKind::SeirModifiers, 0, block, iteration);
    read_rows(&path)
}

fn read_rows<T: serde::de::DeserializeOwned>(path: &Path) -> Vec<T> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    reader.deserialize().map(|r| r.unwrap()).collect()
}

// =============================================================================
// Scenario 1: single subpopulation, Poisson target
// =============================================================================

/// Deterministic forward model: `floor(r0 * 5)` cases per day.
struct StepSimulator;

impl Simulator for StepSimulator {
    fn simulate(
        &self,
        theta: &ParamSample,
        ctx: &mut SimulationContext<'_>,
    ) -> Result<Trajectory, SimulatorError> {
        let r0 = theta.seir_modifiers[0].value;
        let days = ctx.window.num_days();
        let mut traj = Trajectory::new(*ctx.window);
        for subpop in ctx.subpops {
            for target in ctx.targets {
                traj.set_outcome(subpop, target, vec![(r0 * 5.0).floor(); days]);
            }
        }
        Ok(traj)
    }
}

const SCENARIO_A: &str = r#"
    setup_name = "scenario_a"
    start_date = "2020-03-01"
    end_date = "2020-03-07"

    [[subpopulations]]
    id = "small_province"
    population = 100000.0

    [[seir_modifiers]]
    name = "r0"
    value = 2.0
    lower = 1.0
    upper = 3.0
    perturbation = { dist = "normal", sd = 0.1 }
    prior = { dist = "uniform", low = 1.0, high = 3.0 }

    [inference]
    iterations_per_slot = 1000

    [[inference.statistics]]
    name = "incidC"
    likelihood = { family = "poisson" }
"#;

fn scenario_a_observations(config: &InferenceConfig) -> ObservationBundle {
    let mut obs = ObservationBundle::empty(
        config.window(),
        config.subpop_ids(),
        vec!["incidC".to_string()],
    );
    for (day, value) in [10.0, 12.0, 11.0, 13.0, 14.0, 15.0, 16.0].iter().enumerate() {
        obs.set("small_province", "incidC", day, *value);
    }
    obs
}

#[test]
fn scenario_a_posterior_concentrates() {
    let (config, specs) = parse(SCENARIO_A);
    let obs = scenario_a_observations(&config);
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::new(ArtifactLayout::new(dir.path(), "scenario_a", "r1"));

    let k = 1000;
    let summaries = run_slots(
        &config,
        &specs,
        &obs,
        &StepSimulator,
        &store,
        &settings(k, 1, false, 1234),
        &[0],
        1,
    )
    .unwrap();
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].global_acceptance > 0.0);

    let burn_in = 100;
    let mut values = Vec::new();
    for iteration in burn_in + 1..=k {
        values.push(modifier_values(&store, 1, iteration)[0].value);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    assert!(
        (2.45..=2.85).contains(&mean),
        "posterior mean {} outside expected band",
        mean
    );
    let near_mode =
        values.iter().filter(|v| (2.2..=3.0).contains(*v)).count() as f64 / values.len() as f64;
    assert!(near_mode > 0.75, "only {} of mass near the mode", near_mode);
}

// =============================================================================
// Scenario 2: hierarchical pull between two subpopulations
// =============================================================================

/// Forward model: each subpopulation reports its own parameter value.
struct IdentitySimulator;

impl Simulator for IdentitySimulator {
    fn simulate(
        &self,
        theta: &ParamSample,
        ctx: &mut SimulationContext<'_>,
    ) -> Result<Trajectory, SimulatorError> {
        let days = ctx.window.num_days();
        let mut traj = Trajectory::new(*ctx.window);
        for subpop in ctx.subpops {
            let p = theta
                .seir_modifiers
                .iter()
                .find(|m| m.subpop == *subpop)
                .map(|m| m.value)
                .unwrap_or(0.0);
            for target in ctx.targets {
                traj.set_outcome(subpop, target, vec![p; days]);
            }
        }
        Ok(traj)
    }
}

fn scenario_b_config(hierarchical: bool) -> String {
    let tail = if hierarchical {
        r#"
        [[inference.hierarchical_stats_geo]]
        name = "pull_p"
        module = "seir_modifiers"
        parameter = "p"
        label = "region"
        "#
    } else {
        ""
    };
    format!(
        r#"
        setup_name = "scenario_b"
        start_date = "2020-03-01"
        end_date = "2020-03-01"

        [[subpopulations]]
        id = "A"
        population = 1000.0
        [subpopulations.groups]
        region = "main"

        [[subpopulations]]
        id = "B"
        population = 1000.0
        [subpopulations.groups]
        region = "main"

        [[seir_modifiers]]
        name = "p"
        value = 0.5
        lower = 0.0
        upper = 1.0
        perturbation = {{ dist = "normal", sd = 0.05 }}
        prior = {{ dist = "uniform", low = 0.0, high = 1.0 }}

        [inference]
        iterations_per_slot = 2000
        {tail}
        [[inference.statistics]]
        name = "obs"
        likelihood = {{ family = "normal_homoskedastic", sd = 0.05 }}
        "#
    )
}

fn scenario_b_gap(hierarchical: bool, seed: u64) -> f64 {
    let src = scenario_b_config(hierarchical);
    let (config, specs) = parse(&src);
    let mut obs = ObservationBundle::empty(
        config.window(),
        config.subpop_ids(),
        vec!["obs".to_string()],
    );
    obs.set("A", "obs", 0, 0.7);
    obs.set("B", "obs", 0, 0.8);

    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::new(ArtifactLayout::new(dir.path(), "scenario_b", "r1"));
    let k = 2000;
    run_slots(
        &config,
        &specs,
        &obs,
        &IdentitySimulator,
        &store,
        &settings(k, 1, false, seed),
        &[0],
        1,
    )
    .unwrap();

    let burn_in = 200;
    let (mut sum_a, mut sum_b, mut n) = (0.0, 0.0, 0.0);
    for iteration in burn_in + 1..=k {
        for row in modifier_values(&store, 1, iteration) {
            if row.subpop == "A" {
                sum_a += row.value;
            } else {
                sum_b += row.value;
            }
        }
        n += 1.0;
    }
    (sum_a / n - sum_b / n).abs()
}

#[test]
fn scenario_b_hierarchical_pull_closes_the_gap() {
    let gap_plain = scenario_b_gap(false, 77);
    let gap_pulled = scenario_b_gap(true, 77);
    assert!(
        (0.05..=0.15).contains(&gap_plain),
        "unpulled gap {} should sit near the data gap of 0.1",
        gap_plain
    );
    assert!(gap_pulled < 0.05, "hierarchical gap {} did not close", gap_pulled);
    assert!(gap_pulled < gap_plain);
}

// =============================================================================
// Scenario 3: resume reproduces the straight run bit for bit
// =============================================================================

#[test]
fn scenario_c_resume_is_bit_identical() {
    let src = SCENARIO_A.replace("iterations_per_slot = 1000", "iterations_per_slot = 100");
    let (config, specs) = parse(&src);
    let obs = scenario_a_observations(&config);
    let seed = 2026;

    let dir_straight = TempDir::new().unwrap();
    let straight =
        ArtifactStore::new(ArtifactLayout::new(dir_straight.path(), "scenario_c", "one"));
    run_slots(
        &config,
        &specs,
        &obs,
        &StepSimulator,
        &straight,
        &settings(100, 1, false, seed),
        &[0],
        1,
    )
    .unwrap();

    let dir_phased = TempDir::new().unwrap();
    let phased = ArtifactStore::new(ArtifactLayout::new(dir_phased.path(), "scenario_c", "two"));
    run_slots(
        &config,
        &specs,
        &obs,
        &StepSimulator,
        &phased,
        &settings(50, 1, false, seed),
        &[0],
        1,
    )
    .unwrap();
    run_slots(
        &config,
        &specs,
        &obs,
        &StepSimulator,
        &phased,
        &settings(50, 2, true, seed),
        &[0],
        1,
    )
    .unwrap();

    for iteration in 0..=100u64 {
        let (block_s, block_p) = (1, if iteration <= 50 { 1 } else { 2 });
        for kind in [ArtifactKind::SeirModifiers, ArtifactKind::Likelihood] {
            let a = straight
                .layout()
                .iteration_path(Stream::Global, kind, 0, block_s, iteration);
            let b = phased
                .layout()
                .iteration_path(Stream::Global, kind, 0, block_p, iteration);
            let bytes_a = std::fs::read(&a).unwrap();
            let bytes_b = std::fs::read(&b).unwrap();
            assert_eq!(
                bytes_a, bytes_b,
                "artifact {} diverged at iteration {}",
                kind.as_str(),
                iteration
            );
        }
    }
}

// =============================================================================
// Ensemble back end smoke run
// =============================================================================

#[test]
fn ensemble_smoke_run_records_every_walker() {
    let src = SCENARIO_A
        .replace("iterations_per_slot = 1000", "iterations_per_slot = 10\nmethod = \"emcee\"\nwalkers = 6");
    let (config, specs) = parse(&src);
    let obs = scenario_a_observations(&config);
    let archive = EnsembleArchive::in_memory().unwrap();

    let steps = 30;
    let summary = EnsembleRunner::new(
        &config,
        &specs,
        &obs,
        &StepSimulator,
        &archive,
        EnsembleSettings {
            run_id: "ens".to_string(),
            steps,
            stochastic: false,
            master_seed: 5,
        },
    )
    .unwrap()
    .run()
    .unwrap();

    assert_eq!(summary.walkers, 6);
    assert_eq!(summary.dims, 1);
    assert!(summary.acceptance > 0.05);
    assert!(summary.best_log_posterior.is_finite());
    assert_eq!(archive.sample_count().unwrap(), 6 * (steps + 1));
    let chain = archive.walker_positions(3).unwrap();
    assert_eq!(chain.len() as u64, steps + 1);
    assert!(chain.iter().all(|p| p.len() == 1 && (1.0..=3.0).contains(&p[0])));
}
