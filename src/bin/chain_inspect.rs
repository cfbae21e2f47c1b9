//! Chain Inspection Tool
//!
//! CLI tool to inspect and verify persisted inference artifacts: list the
//! slots of a run, print their final acceptance statistics, and check that
//! per-iteration artifact files are contiguous and parseable.
//!
//! Usage:
//!   chain_inspect --root model_output --setup flu_model --run-id r1 summary
//!   chain_inspect --root model_output --setup flu_model --run-id r1 verify --slot 0 --block 1

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use epifit::inference::{ArtifactKind, ArtifactLayout, ArtifactStore, LikelihoodRow, Stream};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Inspect persisted inference chains.
#[derive(Parser, Debug)]
#[command(name = "chain_inspect")]
#[command(about = "Inspect and verify persisted inference artifacts")]
struct Cli {
    /// Artifact root directory.
    #[arg(long, default_value = "model_output")]
    root: PathBuf,

    /// Setup name (first path component).
    #[arg(long)]
    setup: String,

    /// Run identifier (second path component).
    #[arg(long)]
    run_id: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Per-slot summary from the final likelihood artifacts.
    Summary,

    /// Check that one slot's iteration files are contiguous and parseable.
    Verify {
        #[arg(long)]
        slot: usize,
        #[arg(long, default_value_t = 1)]
        block: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let store = ArtifactStore::new(ArtifactLayout::new(
        cli.root.clone(),
        cli.setup.clone(),
        cli.run_id.clone(),
    ));
    match cli.command {
        Commands::Summary => summary(&store),
        Commands::Verify { slot, block } => verify(&store, slot, block),
    }
}

fn summary(store: &ArtifactStore) -> Result<()> {
    let final_dir = store
        .layout()
        .final_path(Stream::Global, ArtifactKind::Likelihood, 0)
        .parent()
        .map(PathBuf::from)
        .context("final likelihood directory")?;
    if !final_dir.exists() {
        bail!("no final artifacts under {}", final_dir.display());
    }
    let mut slots = BTreeSet::new();
    for entry in std::fs::read_dir(&final_dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if let Some(slot) = name.strip_prefix("slot").and_then(|s| s.strip_suffix(".csv")) {
            if let Ok(slot) = slot.parse::<usize>() {
                slots.insert(slot);
            }
        }
    }
    if slots.is_empty() {
        bail!("no finished slots under {}", final_dir.display());
    }
    println!("{:>6}  {:>10}  {:>10}  {:>16}", "slot", "iterations", "accept", "total_posterior");
    for slot in slots {
        let rows = store
            .load_final_likelihood(Stream::Global, slot)
            .with_context(|| format!("slot {}", slot))?;
        let row = rows.first().context("empty likelihood artifact")?;
        println!(
            "{:>6}  {:>10}  {:>10.3}  {:>16.4}",
            slot,
            row.iterations,
            row.accept_avg,
            row.total_posterior.unwrap_or(f64::NAN)
        );
    }
    Ok(())
}

fn verify(store: &ArtifactStore, slot: usize, block: u64) -> Result<()> {
    let dir = store
        .layout()
        .iteration_path(Stream::Global, ArtifactKind::Likelihood, slot, block, 0)
        .parent()
        .map(PathBuf::from)
        .context("likelihood directory")?;
    if !dir.exists() {
        bail!("no likelihood artifacts under {}", dir.display());
    }
    let prefix = format!("slot{:04}.block{:03}.iter", slot, block);
    let mut iterations = BTreeSet::new();
    for entry in std::fs::read_dir(&dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if let Some(rest) = name.strip_prefix(&prefix) {
            if let Some(iter) = rest.strip_suffix(".csv").and_then(|s| s.parse::<u64>().ok()) {
                iterations.insert(iter);
            }
        }
    }
    if iterations.is_empty() {
        bail!("no iterations found for slot {} block {}", slot, block);
    }
    let min = *iterations.iter().next().expect("nonempty");
    let max = *iterations.iter().last().expect("nonempty");
    for iter in min..=max {
        if !iterations.contains(&iter) {
            bail!("iteration {} missing between {} and {}", iter, min, max);
        }
        let path = store
            .layout()
            .iteration_path(Stream::Global, ArtifactKind::Likelihood, slot, block, iter);
        let mut reader = csv::Reader::from_path(&path)
            .with_context(|| format!("open {}", path.display()))?;
        for row in reader.deserialize::<LikelihoodRow>() {
            row.with_context(|| format!("parse {}", path.display()))?;
        }
    }
    println!(
        "slot {} block {}: iterations {}..{} contiguous, all likelihood tables parse",
        slot, block, min, max
    );
    Ok(())
}
