//! Artifact Path Scheme
//!
//! Deterministic layout keyed by `(setup, run_id, stream, kind, slot, block,
//! iteration)`:
//!
//! ```text
//! {root}/{setup}/{run_id}/{stream}/{kind}/slot0001.block001.iter000042.csv
//! {root}/{setup}/{run_id}/final/{stream}/{kind}/slot0001.csv
//! {root}/{setup}/{run_id}/logs/slot0001.jsonl
//! {root}/{setup}/{run_id}/ensemble.sqlite
//! ```
//!
//! Any run that can see a previous run's root can resume from it; nothing
//! else is shared between processes.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Global,
    Chimeric,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Chimeric => "chimeric",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    SeirModifiers,
    OutcomeModifiers,
    OutcomeParameters,
    Seeding,
    InitialConditions,
    Likelihood,
    TrajectoryOutcome,
    TrajectoryInfection,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SeirModifiers => "seir_modifiers",
            Self::OutcomeModifiers => "outcome_modifiers",
            Self::OutcomeParameters => "outcome_parameters",
            Self::Seeding => "seeding",
            Self::InitialConditions => "initial_conditions",
            Self::Likelihood => "likelihood",
            Self::TrajectoryOutcome => "trajectory_outcome",
            Self::TrajectoryInfection => "trajectory_infection",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
    setup: String,
    run_id: String,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>, setup: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self { root: root.into(), setup: setup.into(), run_id: run_id.into() }
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join(&self.setup).join(&self.run_id)
    }

    pub fn iteration_path(
        &self,
        stream: Stream,
        kind: ArtifactKind,
        slot: usize,
        block: u64,
        iteration: u64,
    ) -> PathBuf {
        self.run_dir()
            .join(stream.as_str())
            .join(kind.as_str())
            .join(format!("slot{:04}.block{:03}.iter{:06}.csv", slot, block, iteration))
    }

    pub fn final_path(&self, stream: Stream, kind: ArtifactKind, slot: usize) -> PathBuf {
        self.run_dir()
            .join("final")
            .join(stream.as_str())
            .join(kind.as_str())
            .join(format!("slot{:04}.csv", slot))
    }

    pub fn log_path(&self, slot: usize) -> PathBuf {
        self.run_dir().join("logs").join(format!("slot{:04}.jsonl", slot))
    }

    pub fn ensemble_path(&self) -> PathBuf {
        self.run_dir().join("ensemble.sqlite")
    }
}

/// Existing parent directory or a `PersistenceError` later; callers create
/// lazily via `std::fs::create_dir_all` on the parent.
pub fn parent_of(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new("."))
}
