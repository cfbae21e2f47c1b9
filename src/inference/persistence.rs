//! Persistence Layer
//!
//! CSV artifact tables under the deterministic path scheme, one file per
//! (stream, kind, slot, block, iteration), plus `final/` promotion at block
//! boundaries and a JSONL record stream for non-fatal per-iteration errors.
//!
//! Write policy is fail-loud: any I/O or serialization failure surfaces as a
//! `PersistenceError` and aborts the slot. Artifacts for iteration `k` are
//! fully flushed before iteration `k+1` starts, so the most recently
//! persisted iteration is always a valid recovery point.

use crate::inference::config::ParamModule;
use crate::inference::error::{PersistenceError, ResumeError};
use crate::inference::params::{
    InitialRow, ModifierRow, OutcomeParamRow, ParamSample, SeedingRow,
};
use crate::inference::paths::{parent_of, ArtifactKind, ArtifactLayout, Stream};
use crate::inference::simulator::{Trajectory, TrajectoryRow};
use crate::inference::window::FittingWindow;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::Path;
use tracing::debug;

// =============================================================================
// ROW TYPES
// =============================================================================

/// One persisted likelihood cell. Global rows carry the total posterior of
/// the simulation; chimeric rows leave it empty (the chimeric vector is a
/// mosaic and sums to no single simulation's total).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LikelihoodRow {
    pub subpop: String,
    pub ll: f64,
    pub accept: u8,
    pub accept_avg: f64,
    pub accepts: u64,
    pub iterations: u64,
    pub total_posterior: Option<f64>,
}

/// One structured non-fatal error record, appended to the slot's JSONL log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogRecord {
    pub iteration: u64,
    pub kind: String,
    pub subpop: Option<String>,
    pub detail: String,
}

// =============================================================================
// STORE
// =============================================================================

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    layout: ArtifactLayout,
}

impl ArtifactStore {
    pub fn new(layout: ArtifactLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    // -- generic table I/O ----------------------------------------------------

    fn write_rows<T: Serialize>(&self, path: &Path, rows: &[T]) -> Result<(), PersistenceError> {
        std::fs::create_dir_all(parent_of(path)).map_err(|e| PersistenceError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut writer = csv::Writer::from_path(path).map_err(|e| PersistenceError::Csv {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        for row in rows {
            writer.serialize(row).map_err(|e| PersistenceError::Csv {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        }
        writer.flush().map_err(|e| PersistenceError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(())
    }

    fn read_rows<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>, PersistenceError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(|e| PersistenceError::Csv {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        let mut rows = Vec::new();
        for row in reader.deserialize() {
            rows.push(row.map_err(|e| PersistenceError::Csv {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?);
        }
        Ok(rows)
    }

    // -- per-iteration writes -------------------------------------------------

    /// Persist the configured parameter groups of one sample.
    pub fn write_sample(
        &self,
        stream: Stream,
        slot: usize,
        block: u64,
        iteration: u64,
        sample: &ParamSample,
    ) -> Result<(), PersistenceError> {
        if !sample.seir_modifiers.is_empty() {
            self.write_rows(
                &self.layout.iteration_path(stream, ArtifactKind::SeirModifiers, slot, block, iteration),
                &sample.modifier_rows(ParamModule::SeirModifiers),
            )?;
        }
        if !sample.outcome_modifiers.is_empty() {
            self.write_rows(
                &self.layout.iteration_path(stream, ArtifactKind::OutcomeModifiers, slot, block, iteration),
                &sample.modifier_rows(ParamModule::OutcomeModifiers),
            )?;
        }
        if !sample.outcome_parameters.is_empty() {
            self.write_rows(
                &self.layout.iteration_path(stream, ArtifactKind::OutcomeParameters, slot, block, iteration),
                &sample.outcome_param_rows(),
            )?;
        }
        if !sample.seeding.is_empty() {
            self.write_rows(
                &self.layout.iteration_path(stream, ArtifactKind::Seeding, slot, block, iteration),
                &sample.seeding_rows(),
            )?;
        }
        if !sample.initial_conditions.is_empty() {
            self.write_rows(
                &self.layout.iteration_path(stream, ArtifactKind::InitialConditions, slot, block, iteration),
                &sample.initial_rows(),
            )?;
        }
        Ok(())
    }

    pub fn write_likelihood(
        &self,
        stream: Stream,
        slot: usize,
        block: u64,
        iteration: u64,
        rows: &[LikelihoodRow],
    ) -> Result<(), PersistenceError> {
        self.write_rows(
            &self.layout.iteration_path(stream, ArtifactKind::Likelihood, slot, block, iteration),
            rows,
        )
    }

    /// Trajectories are persisted on the global stream only; the chimeric
    /// sample never corresponds to one simulation.
    pub fn write_trajectory(
        &self,
        slot: usize,
        block: u64,
        iteration: u64,
        trajectory: &Trajectory,
    ) -> Result<(), PersistenceError> {
        self.write_rows(
            &self.layout.iteration_path(
                Stream::Global,
                ArtifactKind::TrajectoryOutcome,
                slot,
                block,
                iteration,
            ),
            &trajectory.outcome_rows(),
        )?;
        if trajectory.has_infections() {
            self.write_rows(
                &self.layout.iteration_path(
                    Stream::Global,
                    ArtifactKind::TrajectoryInfection,
                    slot,
                    block,
                    iteration,
                ),
                &trajectory.infection_rows(),
            )?;
        }
        Ok(())
    }

    // -- final promotion ------------------------------------------------------

    /// Copy the last written iteration file of `kind` into `final/`.
    pub fn promote_final(
        &self,
        stream: Stream,
        kind: ArtifactKind,
        slot: usize,
        block: u64,
        iteration: u64,
    ) -> Result<(), PersistenceError> {
        let from = self.layout.iteration_path(stream, kind, slot, block, iteration);
        if !from.exists() {
            return Ok(());
        }
        let to = self.layout.final_path(stream, kind, slot);
        std::fs::create_dir_all(parent_of(&to)).map_err(|e| PersistenceError::Io {
            path: to.clone(),
            source: e,
        })?;
        std::fs::copy(&from, &to).map_err(|e| PersistenceError::Io {
            path: to.clone(),
            source: e,
        })?;
        debug!(from = %from.display(), to = %to.display(), "promoted final artifact");
        Ok(())
    }

    // -- resume reads ---------------------------------------------------------

    /// Load one stream's sample from the `final/` set of a finished block.
    /// The template fixes the declared shape; mismatches are resume errors.
    pub fn load_final_sample(
        &self,
        stream: Stream,
        slot: usize,
        template: &ParamSample,
    ) -> Result<ParamSample, ResumeError> {
        let mut sample = template.clone();
        if !sample.seir_modifiers.is_empty() {
            let rows: Vec<ModifierRow> =
                self.read_final(stream, ArtifactKind::SeirModifiers, slot)?;
            sample
                .set_modifiers_from_rows(ParamModule::SeirModifiers, &rows)
                .map_err(|e| ResumeError::Inconsistent { detail: e.to_string() })?;
        }
        if !sample.outcome_modifiers.is_empty() {
            let rows: Vec<ModifierRow> =
                self.read_final(stream, ArtifactKind::OutcomeModifiers, slot)?;
            sample
                .set_modifiers_from_rows(ParamModule::OutcomeModifiers, &rows)
                .map_err(|e| ResumeError::Inconsistent { detail: e.to_string() })?;
        }
        if !sample.outcome_parameters.is_empty() {
            let rows: Vec<OutcomeParamRow> =
                self.read_final(stream, ArtifactKind::OutcomeParameters, slot)?;
            sample
                .set_outcome_params_from_rows(&rows)
                .map_err(|e| ResumeError::Inconsistent { detail: e.to_string() })?;
        }
        if !sample.seeding.is_empty() {
            let rows: Vec<SeedingRow> = self.read_final(stream, ArtifactKind::Seeding, slot)?;
            sample
                .set_seeding_from_rows(&rows)
                .map_err(|e| ResumeError::Inconsistent { detail: e.to_string() })?;
        }
        if !sample.initial_conditions.is_empty() {
            let rows: Vec<InitialRow> =
                self.read_final(stream, ArtifactKind::InitialConditions, slot)?;
            sample
                .set_initial_from_rows(&rows)
                .map_err(|e| ResumeError::Inconsistent { detail: e.to_string() })?;
        }
        Ok(sample)
    }

    pub fn load_final_likelihood(
        &self,
        stream: Stream,
        slot: usize,
    ) -> Result<Vec<LikelihoodRow>, ResumeError> {
        self.read_final(stream, ArtifactKind::Likelihood, slot)
    }

    pub fn load_final_trajectory(
        &self,
        slot: usize,
        window: FittingWindow,
    ) -> Result<Trajectory, ResumeError> {
        let rows: Vec<TrajectoryRow> =
            self.read_final(Stream::Global, ArtifactKind::TrajectoryOutcome, slot)?;
        Ok(Trajectory::from_outcome_rows(window, &rows))
    }

    fn read_final<T: DeserializeOwned>(
        &self,
        stream: Stream,
        kind: ArtifactKind,
        slot: usize,
    ) -> Result<Vec<T>, ResumeError> {
        let path = self.layout.final_path(stream, kind, slot);
        if !path.exists() {
            return Err(ResumeError::MissingArtifact { path });
        }
        self.read_rows(&path)
            .map_err(|e| ResumeError::Inconsistent { detail: e.to_string() })
    }

    // -- structured error log -------------------------------------------------

    pub fn append_log(&self, slot: usize, record: &RunLogRecord) -> Result<(), PersistenceError> {
        let path = self.layout.log_path(slot);
        std::fs::create_dir_all(parent_of(&path)).map_err(|e| PersistenceError::Io {
            path: path.clone(),
            source: e,
        })?;
        let line = serde_json::to_string(record).map_err(|e| PersistenceError::Csv {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PersistenceError::Io { path: path.clone(), source: e })?;
        writeln!(file, "{}", line)
            .map_err(|e| PersistenceError::Io { path: path.clone(), source: e })?;
        Ok(())
    }
}
