//! Epifit Inference Runner
//!
//! Single entry point for running one slot (or every slot) of a calibration:
//!
//! ```bash
//! epifit --config config.toml --run-id 20260801_1200 \
//!   --slot 0 --block 1 --iterations 500 --jobs 4 --artifact-root model_output
//! ```
//!
//! # Exit Codes
//!
//! - 0: Success
//! - 2: Configuration or observation error
//! - 3: Runtime error (simulator budget, persistence, resume)

use clap::Parser;
use epifit::inference::{
    open_archive, run_slots, simulator, ArtifactLayout, ArtifactStore, EnsembleRunner,
    EnsembleSettings, ExpandedSpecs, InferenceConfig, InferenceError, Method,
    ObservationBundle, RunSettings,
};
use std::path::PathBuf;
use tracing::info;

/// Metapopulation epidemic parameter inference.
#[derive(Parser, Debug)]
#[command(name = "epifit")]
#[command(about = "Run dual-chain MCMC or ensemble calibration for a configured model")]
struct Cli {
    /// Path to the TOML configuration.
    #[arg(short, long)]
    config: PathBuf,

    /// Run identifier; second component of every artifact path.
    #[arg(long)]
    run_id: String,

    /// Slot index to run. Omit to run every configured slot.
    #[arg(long)]
    slot: Option<usize>,

    /// Block index (1-based). Blocks after the first resume from the
    /// previous block's final artifacts when --resume is set.
    #[arg(long, default_value_t = 1)]
    block: u64,

    /// Iterations for this block; defaults to the configured
    /// iterations_per_slot.
    #[arg(long)]
    iterations: Option<u64>,

    /// Worker threads for running slots in parallel.
    #[arg(short, long, default_value_t = 1)]
    jobs: usize,

    /// Load chain state from the previous block's final artifacts.
    #[arg(long)]
    resume: bool,

    /// Stochastic simulator mode (integer seeding amounts).
    #[arg(long)]
    stochastic: bool,

    /// Root directory for all persisted artifacts.
    #[arg(long, default_value = "model_output")]
    artifact_root: PathBuf,

    /// Master seed; every RNG in the run derives from it.
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {}: {}", e.kind(), e);
        std::process::exit(e.exit_code());
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn run(cli: Cli) -> Result<(), InferenceError> {
    let config = InferenceConfig::from_path(&cli.config)?;
    let specs = ExpandedSpecs::from_config(&config)?;
    let observations = match &config.inference.gt_data_path {
        Some(path) => ObservationBundle::from_csv(path, &config)?,
        None => ObservationBundle::empty(
            config.window(),
            config.subpop_ids(),
            config.inference.statistics.iter().map(|s| s.name.clone()).collect(),
        ),
    };
    let sim = simulator::from_config(&config)
        .map_err(|e| InferenceError::SimulatorAtInit { slot: cli.slot.unwrap_or(0), source: e })?;
    let store = ArtifactStore::new(ArtifactLayout::new(
        cli.artifact_root.clone(),
        config.setup_name.clone(),
        cli.run_id.clone(),
    ));
    let iterations = cli.iterations.unwrap_or(config.inference.iterations_per_slot);
    info!(
        run_id = %cli.run_id,
        setup = %config.setup_name,
        block = cli.block,
        iterations,
        "starting inference run"
    );

    match config.inference.method {
        Method::Classic => {
            let slots: Vec<usize> = match cli.slot {
                Some(slot) => vec![slot],
                None => (0..config.inference.slots).collect(),
            };
            let settings = RunSettings {
                run_id: cli.run_id.clone(),
                block: cli.block,
                iterations,
                resume: cli.resume,
                stochastic: cli.stochastic,
                master_seed: cli.seed,
            };
            let summaries = run_slots(
                &config,
                &specs,
                &observations,
                sim.as_ref(),
                &store,
                &settings,
                &slots,
                cli.jobs,
            )?;
            for s in &summaries {
                println!(
                    "slot {:4}  iterations {:6}  accept {:.3}  total_posterior {:.4}  failures {}",
                    s.slot, s.iterations, s.global_acceptance, s.total_posterior,
                    s.simulator_failures
                );
            }
        }
        Method::Emcee => {
            let archive = open_archive(&store)
                .map_err(|e| InferenceError::Persistence { slot: 0, source: e })?;
            let summary = EnsembleRunner::new(
                &config,
                &specs,
                &observations,
                sim.as_ref(),
                &archive,
                EnsembleSettings {
                    run_id: cli.run_id.clone(),
                    steps: iterations,
                    stochastic: cli.stochastic,
                    master_seed: cli.seed,
                },
            )?
            .run()?;
            println!(
                "ensemble  walkers {:4}  steps {:6}  accept {:.3}  best_posterior {:.4}",
                summary.walkers, summary.steps, summary.acceptance, summary.best_log_posterior
            );
        }
    }
    Ok(())
}
