//! Simulator Interface
//!
//! The forward simulator is an external collaborator behind one narrow
//! trait: sample in, dated trajectory out, invoked exactly once per MCMC
//! iteration. The engine never inspects simulator internals; the artifact
//! scheme is the only other shared surface (as the resume protocol).
//!
//! Two small built-in simulators ship with the crate for the CLI and the
//! test suite. They are deliberately simple; production simulators live in
//! the embedding application.

use crate::inference::config::{InferenceConfig, SimulatorConfig, SubpopId};
use crate::inference::error::SimulatorError;
use crate::inference::params::ParamSample;
use crate::inference::window::FittingWindow;
use chrono::NaiveDate;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// TRAJECTORY
// =============================================================================

/// Dense per-day outcome values for each (subpopulation, outcome), plus an
/// optional per-compartment table some simulators emit for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    window: FittingWindow,
    outcomes: BTreeMap<(SubpopId, String), Vec<f64>>,
    infections: Option<BTreeMap<(SubpopId, String), Vec<f64>>>,
}

impl Trajectory {
    pub fn new(window: FittingWindow) -> Self {
        Self { window, outcomes: BTreeMap::new(), infections: None }
    }

    pub fn window(&self) -> &FittingWindow {
        &self.window
    }

    pub fn set_outcome(&mut self, subpop: &str, outcome: &str, series: Vec<f64>) {
        self.outcomes.insert((subpop.to_string(), outcome.to_string()), series);
    }

    pub fn set_infection(&mut self, subpop: &str, compartment: &str, series: Vec<f64>) {
        self.infections
            .get_or_insert_with(BTreeMap::new)
            .insert((subpop.to_string(), compartment.to_string()), series);
    }

    pub fn outcome(&self, subpop: &str, outcome: &str) -> Option<&[f64]> {
        self.outcomes
            .get(&(subpop.to_string(), outcome.to_string()))
            .map(|v| v.as_slice())
    }

    pub fn has_infections(&self) -> bool {
        self.infections.is_some()
    }

    /// Point-wise sum of one outcome across all subpopulations.
    pub fn total_outcome(&self, outcome: &str) -> Vec<f64> {
        let mut out = vec![0.0; self.window.num_days()];
        for ((_, name), series) in &self.outcomes {
            if name == outcome {
                for (acc, v) in out.iter_mut().zip(series) {
                    *acc += v;
                }
            }
        }
        out
    }

    /// Check the trajectory covers every (subpopulation, target) pair with a
    /// full window of finite, non-negative values.
    pub fn validate(
        &self,
        roster: &[SubpopId],
        targets: &[String],
        window: &FittingWindow,
    ) -> Result<(), SimulatorError> {
        if self.window != *window {
            return Err(SimulatorError::MalformedTrajectory {
                detail: format!(
                    "window {}..{} does not match fitting window {}..{}",
                    self.window.start, self.window.end, window.start, window.end
                ),
            });
        }
        let days = window.num_days();
        for subpop in roster {
            for target in targets {
                let Some(series) = self.outcome(subpop, target) else {
                    return Err(SimulatorError::MalformedTrajectory {
                        detail: format!("missing series for ({}, {})", subpop, target),
                    });
                };
                if series.len() != days {
                    return Err(SimulatorError::MalformedTrajectory {
                        detail: format!(
                            "series ({}, {}) has {} days, expected {}",
                            subpop,
                            target,
                            series.len(),
                            days
                        ),
                    });
                }
                if series.iter().any(|v| !v.is_finite() || *v < 0.0) {
                    return Err(SimulatorError::MalformedTrajectory {
                        detail: format!("series ({}, {}) has non-finite or negative values", subpop, target),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn outcome_rows(&self) -> Vec<TrajectoryRow> {
        rows_of(&self.window, &self.outcomes)
    }

    pub fn infection_rows(&self) -> Vec<TrajectoryRow> {
        self.infections.as_ref().map(|m| rows_of(&self.window, m)).unwrap_or_default()
    }

    /// Rebuild from persisted rows (resume path).
    pub fn from_outcome_rows(window: FittingWindow, rows: &[TrajectoryRow]) -> Self {
        let days = window.num_days();
        let mut traj = Self::new(window);
        for row in rows {
            let key = (row.subpop.clone(), row.series.clone());
            let series = traj.outcomes.entry(key).or_insert_with(|| vec![0.0; days]);
            if let Some(idx) = window.index_of(row.date) {
                series[idx] = row.value;
            }
        }
        traj
    }
}

fn rows_of(
    window: &FittingWindow,
    table: &BTreeMap<(SubpopId, String), Vec<f64>>,
) -> Vec<TrajectoryRow> {
    let mut rows = Vec::new();
    for ((subpop, series_name), series) in table {
        for (idx, value) in series.iter().enumerate() {
            rows.push(TrajectoryRow {
                date: window.date_at(idx),
                subpop: subpop.clone(),
                series: series_name.clone(),
                value: *value,
            });
        }
    }
    rows
}

/// One persisted trajectory cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryRow {
    pub date: NaiveDate,
    pub subpop: String,
    /// Outcome name, or compartment name for infection tables.
    pub series: String,
    pub value: f64,
}

// =============================================================================
// SIMULATOR TRAIT
// =============================================================================

/// Per-invocation context handed to the simulator. The RNG is derived per
/// iteration by the driver; stochastic simulators draw from it and nothing
/// else.
pub struct SimulationContext<'a> {
    pub window: &'a FittingWindow,
    pub subpops: &'a [SubpopId],
    pub targets: &'a [String],
    pub stochastic: bool,
    pub rng: &'a mut ChaCha8Rng,
}

pub trait Simulator: Send + Sync {
    fn simulate(
        &self,
        theta: &ParamSample,
        ctx: &mut SimulationContext<'_>,
    ) -> Result<Trajectory, SimulatorError>;
}

// =============================================================================
// BUILT-IN SIMULATORS
// =============================================================================

/// Constant daily value per outcome, identical for every subpopulation and
/// independent of Θ. Under this simulator the chain samples the prior, which
/// is exactly what the calibration tests need.
pub struct FixedTrajectorySimulator {
    pub values: BTreeMap<String, f64>,
}

impl Simulator for FixedTrajectorySimulator {
    fn simulate(
        &self,
        _theta: &ParamSample,
        ctx: &mut SimulationContext<'_>,
    ) -> Result<Trajectory, SimulatorError> {
        let days = ctx.window.num_days();
        let mut traj = Trajectory::new(*ctx.window);
        for subpop in ctx.subpops {
            for target in ctx.targets {
                let v = self.values.get(target).copied().unwrap_or(0.0);
                traj.set_outcome(subpop, target, vec![v; days]);
            }
        }
        Ok(traj)
    }
}

/// Per-capita base incidence scaled down by active transmission-modifier
/// reductions, with seeded mass added on seed dates. A toy forward model
/// that still responds to every perturbable group.
pub struct ScaledIncidenceSimulator {
    /// Outcome -> daily events per 100k population.
    pub base_rates: BTreeMap<String, f64>,
    pub populations: BTreeMap<SubpopId, f64>,
}

impl Simulator for ScaledIncidenceSimulator {
    fn simulate(
        &self,
        theta: &ParamSample,
        ctx: &mut SimulationContext<'_>,
    ) -> Result<Trajectory, SimulatorError> {
        let days = ctx.window.num_days();
        let mut traj = Trajectory::new(*ctx.window);
        for subpop in ctx.subpops {
            let population = self.populations.get(subpop).copied().unwrap_or(0.0);
            for target in ctx.targets {
                let base = self.base_rates.get(target).copied().unwrap_or(0.0);
                let mut series = vec![0.0; days];
                for (idx, value) in series.iter_mut().enumerate() {
                    let date = ctx.window.date_at(idx);
                    let mut scale = 1.0;
                    for m in &theta.seir_modifiers {
                        if m.subpop == *subpop && date >= m.window_start && date <= m.window_end {
                            scale *= (1.0 - m.value).max(0.0);
                        }
                    }
                    *value = base * population / 100_000.0 * scale;
                }
                for event in &theta.seeding {
                    if event.subpop == *subpop {
                        if let Some(idx) = ctx.window.index_of(event.date) {
                            series[idx] += event.amount;
                        }
                    }
                }
                traj.set_outcome(subpop, target, series);
            }
        }
        Ok(traj)
    }
}

/// Instantiate a built-in simulator from the config's `[simulator]` section.
pub fn from_config(config: &InferenceConfig) -> Result<Box<dyn Simulator>, SimulatorError> {
    match &config.simulator {
        Some(SimulatorConfig::Fixed { values }) => {
            Ok(Box::new(FixedTrajectorySimulator { values: values.clone() }))
        }
        Some(SimulatorConfig::ScaledIncidence { base_rates }) => {
            Ok(Box::new(ScaledIncidenceSimulator {
                base_rates: base_rates.clone(),
                populations: config
                    .subpopulations
                    .iter()
                    .map(|s| (s.id.clone(), s.population))
                    .collect(),
            }))
        }
        None => Err(SimulatorError::Failed(
            "no [simulator] section configured and no external simulator supplied".to_string(),
        )),
    }
}
