//! Ensemble Back End
//!
//! Affine-invariant ensemble sampler as an alternative to the dual-chain
//! algorithm: `W` walkers in one process, stretch moves drawn from the
//! current ensemble, standard acceptance rule
//! `min(1, z^(d-1) * exp(lp(Y) - lp(X_k)))` with `z = ((a-1)u + 1)^2 / a`.
//! The likelihood interface is unchanged; walker positions are the flattened
//! inferable scalar entries of Θ.
//!
//! Per-walker positions, log posteriors, and acceptance flags go into a
//! single SQLite archive rather than one file per iteration.
//!
//! # Archive Schema
//!
//! ```sql
//! CREATE TABLE schema_version (version INTEGER PRIMARY KEY);
//! CREATE TABLE ensemble_meta (
//!     run_id TEXT NOT NULL,
//!     walkers INTEGER NOT NULL,
//!     dims INTEGER NOT NULL,
//!     stretch_scale REAL NOT NULL,
//!     master_seed INTEGER NOT NULL,
//!     param_ids TEXT NOT NULL
//! );
//! CREATE TABLE ensemble_samples (
//!     step INTEGER NOT NULL,
//!     walker INTEGER NOT NULL,
//!     log_posterior REAL NOT NULL,
//!     accepted INTEGER NOT NULL,
//!     position TEXT NOT NULL,
//!     PRIMARY KEY (step, walker)
//! );
//! ```

use crate::inference::config::InferenceConfig;
use crate::inference::error::{InferenceError, PersistenceError};
use crate::inference::likelihood::LikelihoodEvaluator;
use crate::inference::observations::ObservationBundle;
use crate::inference::params::{ExpandedSpecs, ParamSample};
use crate::inference::persistence::ArtifactStore;
use crate::inference::prior::PriorEvaluator;
use crate::inference::rng::{rng_for, RngPurpose};
use crate::inference::simulator::{SimulationContext, Simulator};
use parking_lot::Mutex;
use rand::Rng;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const SCHEMA_VERSION: u32 = 1;

// =============================================================================
// ARCHIVE
// =============================================================================

pub struct EnsembleArchive {
    conn: Arc<Mutex<Connection>>,
}

impl EnsembleArchive {
    pub fn new(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PersistenceError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| PersistenceError::Archive(e.to_string()))?;
        let archive = Self { conn: Arc::new(Mutex::new(conn)) };
        archive.initialize_schema()?;
        Ok(archive)
    }

    /// In-memory archive for tests.
    pub fn in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PersistenceError::Archive(e.to_string()))?;
        let archive = Self { conn: Arc::new(Mutex::new(conn)) };
        archive.initialize_schema()?;
        Ok(archive)
    }

    fn initialize_schema(&self) -> Result<(), PersistenceError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);
            CREATE TABLE IF NOT EXISTS ensemble_meta (
                run_id TEXT NOT NULL,
                walkers INTEGER NOT NULL,
                dims INTEGER NOT NULL,
                stretch_scale REAL NOT NULL,
                master_seed INTEGER NOT NULL,
                param_ids TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS ensemble_samples (
                step INTEGER NOT NULL,
                walker INTEGER NOT NULL,
                log_posterior REAL NOT NULL,
                accepted INTEGER NOT NULL,
                position TEXT NOT NULL,
                PRIMARY KEY (step, walker)
            );
            "#,
        )
        .map_err(|e| PersistenceError::Archive(e.to_string()))?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )
        .map_err(|e| PersistenceError::Archive(e.to_string()))?;
        Ok(())
    }

    pub fn record_meta(
        &self,
        run_id: &str,
        walkers: usize,
        dims: usize,
        stretch_scale: f64,
        master_seed: u64,
        param_ids: &[String],
    ) -> Result<(), PersistenceError> {
        let ids = serde_json::to_string(param_ids)
            .map_err(|e| PersistenceError::Archive(e.to_string()))?;
        self.conn
            .lock()
            .execute(
                "INSERT INTO ensemble_meta (run_id, walkers, dims, stretch_scale, master_seed, param_ids)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![run_id, walkers as i64, dims as i64, stretch_scale, master_seed as i64, ids],
            )
            .map_err(|e| PersistenceError::Archive(e.to_string()))?;
        Ok(())
    }

    pub fn record_sample(
        &self,
        step: u64,
        walker: usize,
        log_posterior: f64,
        accepted: bool,
        position: &[f64],
    ) -> Result<(), PersistenceError> {
        let blob = serde_json::to_string(position)
            .map_err(|e| PersistenceError::Archive(e.to_string()))?;
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO ensemble_samples (step, walker, log_posterior, accepted, position)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![step as i64, walker as i64, log_posterior, accepted as i64, blob],
            )
            .map_err(|e| PersistenceError::Archive(e.to_string()))?;
        Ok(())
    }

    pub fn sample_count(&self) -> Result<u64, PersistenceError> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM ensemble_samples", [], |row| row.get(0))
            .map_err(|e| PersistenceError::Archive(e.to_string()))?;
        Ok(count as u64)
    }

    /// Positions of one walker across all recorded steps, in step order.
    pub fn walker_positions(&self, walker: usize) -> Result<Vec<Vec<f64>>, PersistenceError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT position FROM ensemble_samples WHERE walker = ?1 ORDER BY step ASC",
            )
            .map_err(|e| PersistenceError::Archive(e.to_string()))?;
        let rows = stmt
            .query_map(params![walker as i64], |row| row.get::<_, String>(0))
            .map_err(|e| PersistenceError::Archive(e.to_string()))?;
        let mut out = Vec::new();
        for blob in rows {
            let blob = blob.map_err(|e| PersistenceError::Archive(e.to_string()))?;
            let position: Vec<f64> = serde_json::from_str(&blob)
                .map_err(|e| PersistenceError::Archive(e.to_string()))?;
            out.push(position);
        }
        Ok(out)
    }
}

// =============================================================================
// RUNNER
// =============================================================================

#[derive(Debug, Clone)]
pub struct EnsembleSettings {
    pub run_id: String,
    pub steps: u64,
    pub stochastic: bool,
    pub master_seed: u64,
}

#[derive(Debug, Clone)]
pub struct EnsembleSummary {
    pub walkers: usize,
    pub steps: u64,
    pub dims: usize,
    pub acceptance: f64,
    pub best_log_posterior: f64,
}

pub struct EnsembleRunner<'a> {
    config: &'a InferenceConfig,
    specs: &'a ExpandedSpecs,
    evaluator: LikelihoodEvaluator<'a>,
    simulator: &'a dyn Simulator,
    archive: &'a EnsembleArchive,
    settings: EnsembleSettings,
    targets: Vec<String>,
}

impl<'a> EnsembleRunner<'a> {
    pub fn new(
        config: &'a InferenceConfig,
        specs: &'a ExpandedSpecs,
        observations: &'a ObservationBundle,
        simulator: &'a dyn Simulator,
        archive: &'a EnsembleArchive,
        settings: EnsembleSettings,
    ) -> Result<Self, InferenceError> {
        let evaluator = LikelihoodEvaluator::new(config, specs, observations)
            .map_err(InferenceError::Config)?;
        let targets = config.inference.statistics.iter().map(|s| s.name.clone()).collect();
        Ok(Self { config, specs, evaluator, simulator, archive, settings, targets })
    }

    pub fn run(&mut self) -> Result<EnsembleSummary, InferenceError> {
        let walkers = self.config.inference.walkers;
        let a = self.config.inference.stretch_scale;
        let template = ParamSample::from_specs(self.specs);
        let entries = template.inferable_scalars(self.specs);
        let dims = entries.len();
        if dims == 0 {
            return Err(InferenceError::Numeric {
                slot: 0,
                iteration: 0,
                detail: "ensemble method needs at least one inferable scalar entry".to_string(),
            });
        }
        let wrap = |e| InferenceError::Persistence { slot: 0, source: e };
        let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
        self.archive
            .record_meta(
                &self.settings.run_id,
                walkers,
                dims,
                a,
                self.settings.master_seed,
                &ids,
            )
            .map_err(wrap)?;

        // Initialize walkers from the prior (kernel jitter where no prior).
        let prior = PriorEvaluator::new(self.specs);
        let mut positions: Vec<Vec<f64>> = Vec::with_capacity(walkers);
        let mut log_posts: Vec<f64> = Vec::with_capacity(walkers);
        let mut failures = 0u32;
        for w in 0..walkers {
            let mut rng =
                rng_for(self.settings.master_seed, w as u64, 0, RngPurpose::WalkerInit);
            let theta = prior.draw_initial(&mut rng);
            let position: Vec<f64> =
                theta.inferable_scalars(self.specs).iter().map(|e| e.value).collect();
            let lp = self.log_posterior(&position, w as u64, 0, &mut failures)?;
            self.archive.record_sample(0, w, lp, true, &position).map_err(wrap)?;
            positions.push(position);
            log_posts.push(lp);
        }

        let mut accepted_total = 0u64;
        for step in 1..=self.settings.steps {
            for k in 0..walkers {
                let mut rng =
                    rng_for(self.settings.master_seed, k as u64, step, RngPurpose::WalkerMove);
                // Complementary walker drawn from the rest of the ensemble.
                let mut j = rng.gen_range(0..walkers - 1);
                if j >= k {
                    j += 1;
                }
                let u: f64 = rng.gen();
                let z = ((a - 1.0) * u + 1.0).powi(2) / a;
                let proposal: Vec<f64> = positions[j]
                    .iter()
                    .zip(&positions[k])
                    .map(|(xj, xk)| xj + z * (xk - xj))
                    .collect();

                let lp = if self.in_support(&proposal, &template) {
                    self.log_posterior(&proposal, k as u64, step, &mut failures)?
                } else {
                    f64::NEG_INFINITY
                };

                let log_accept = (dims as f64 - 1.0) * z.ln() + lp - log_posts[k];
                let accept_u: f64 = rng.gen();
                let accepted = lp > f64::NEG_INFINITY
                    && (log_accept >= 0.0 || accept_u.ln() < log_accept);
                if accepted {
                    positions[k] = proposal;
                    log_posts[k] = lp;
                    accepted_total += 1;
                }
                self.archive
                    .record_sample(step, k, log_posts[k], accepted, &positions[k])
                    .map_err(wrap)?;
            }
        }

        let best = log_posts.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let summary = EnsembleSummary {
            walkers,
            steps: self.settings.steps,
            dims,
            acceptance: accepted_total as f64 / (walkers as u64 * self.settings.steps) as f64,
            best_log_posterior: best,
        };
        info!(
            walkers,
            steps = self.settings.steps,
            acceptance = summary.acceptance,
            "ensemble run finished"
        );
        Ok(summary)
    }

    fn in_support(&self, position: &[f64], template: &ParamSample) -> bool {
        template
            .inferable_scalars(self.specs)
            .iter()
            .zip(position)
            .all(|(entry, value)| entry.support.contains(*value))
    }

    /// Simulate and score one flattened position. Simulator failures count
    /// against the shared failure budget and score `-inf`.
    fn log_posterior(
        &self,
        position: &[f64],
        walker: u64,
        step: u64,
        failures: &mut u32,
    ) -> Result<f64, InferenceError> {
        let mut theta = ParamSample::from_specs(self.specs);
        theta
            .set_inferable_scalars(self.specs, position)
            .map_err(InferenceError::Param)?;

        let mut rng =
            rng_for(self.settings.master_seed, walker, step, RngPurpose::Simulator);
        let roster = self.evaluator.roster().to_vec();
        let window = self.config.window();
        let mut ctx = SimulationContext {
            window: &window,
            subpops: &roster,
            targets: &self.targets,
            stochastic: self.settings.stochastic,
            rng: &mut rng,
        };
        let trajectory = match self
            .simulator
            .simulate(&theta, &mut ctx)
            .and_then(|t| t.validate(&roster, &self.targets, &window).map(|_| t))
        {
            Ok(t) => t,
            Err(e) => {
                *failures += 1;
                warn!(walker, step, error = %e, "simulator failed; walker proposal rejected");
                if *failures > self.config.inference.simulator_failure_limit {
                    return Err(InferenceError::SimulatorLimit {
                        slot: 0,
                        iteration: step,
                        failures: *failures,
                        last: e,
                    });
                }
                return Ok(f64::NEG_INFINITY);
            }
        };
        let score = self.evaluator.evaluate(&theta, &trajectory);
        if !score.is_usable() {
            return Ok(f64::NEG_INFINITY);
        }
        Ok(score.total_posterior)
    }
}

/// Open the run's ensemble archive at its canonical path.
pub fn open_archive(store: &ArtifactStore) -> Result<EnsembleArchive, PersistenceError> {
    EnsembleArchive::new(&store.layout().ensemble_path())
}
