//! Parameter Store
//!
//! One parameter sample Θ as five tagged groups with strict schemas, plus the
//! expanded per-entry specs (support, kernel, priors) the kernels and prior
//! evaluator work against. The sample itself is pure values with value
//! semantics: the driver clones it freely and group replacement validates
//! against the declared shape.
//!
//! The wide string-discriminated tables of the legacy artifact layout exist
//! only at the persistence boundary, as the `*Row` types here.

use crate::inference::config::{
    InferenceConfig, InitialConditionConfig, KernelConfig, OutcomeParamSpecConfig,
    OutcomeQuantity, ParamModule, PriorConfig, SeedingEventConfig, SeedingKernelConfig, SubpopId,
};
use crate::inference::error::{ConfigError, ParamError};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Closed/open support for one scalar entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Support {
    pub lower: f64,
    pub upper: f64,
}

impl Support {
    pub fn unbounded() -> Self {
        Self { lower: f64::NEG_INFINITY, upper: f64::INFINITY }
    }

    pub fn clamp(&self, x: f64) -> f64 {
        x.clamp(self.lower, self.upper)
    }

    pub fn contains(&self, x: f64) -> bool {
        x >= self.lower && x <= self.upper
    }
}

// =============================================================================
// EXPANDED SPECS
// =============================================================================

/// One modifier entry after subpopulation expansion.
#[derive(Debug, Clone)]
pub struct ModifierSpec {
    pub name: String,
    pub subpop: SubpopId,
    pub value: f64,
    pub support: Support,
    pub kernel: Option<KernelConfig>,
    /// Entry prior first (used for initial draws), extras appended.
    pub priors: Vec<PriorConfig>,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
}

/// One outcome-parameter entry after subpopulation expansion.
#[derive(Debug, Clone)]
pub struct OutcomeParamSpec {
    pub quantity: OutcomeQuantity,
    pub outcome: String,
    pub subpop: SubpopId,
    pub value: f64,
    pub support: Support,
    pub kernel: Option<KernelConfig>,
    pub priors: Vec<PriorConfig>,
}

/// All entry specs for a run, expanded from configuration.
#[derive(Debug, Clone, Default)]
pub struct ExpandedSpecs {
    pub seir_modifiers: Vec<ModifierSpec>,
    pub outcome_modifiers: Vec<ModifierSpec>,
    pub outcome_parameters: Vec<OutcomeParamSpec>,
    pub seeding: Vec<SeedingEventConfig>,
    pub seeding_kernel: Option<SeedingKernelConfig>,
    pub initial_conditions: Vec<InitialConditionConfig>,
}

/// Floor applied to delay/duration supports so they stay strictly positive.
const POSITIVE_FLOOR: f64 = 1e-9;

impl ExpandedSpecs {
    pub fn from_config(config: &InferenceConfig) -> Result<Self, ConfigError> {
        let window = config.window();
        let expand_modifiers = |specs: &[crate::inference::config::ModifierSpecConfig],
                                module: ParamModule|
         -> Vec<ModifierSpec> {
            let mut out = Vec::new();
            for spec in specs {
                for subpop in spec.subpops.resolve(&config.subpopulations) {
                    let mut priors = Vec::new();
                    if let Some(p) = spec.prior {
                        priors.push(p);
                    }
                    priors.extend(extra_priors(config, module, &spec.name, None, &subpop));
                    out.push(ModifierSpec {
                        name: spec.name.clone(),
                        subpop,
                        value: spec.value,
                        support: Support {
                            lower: spec.lower.unwrap_or(f64::NEG_INFINITY),
                            upper: spec.upper.unwrap_or(f64::INFINITY),
                        },
                        kernel: spec.perturbation,
                        priors,
                        window_start: spec.window_start.map_or(window.start, |d| window.clamp(d)),
                        window_end: spec.window_end.map_or(window.end, |d| window.clamp(d)),
                    });
                }
            }
            out
        };

        let mut outcome_parameters = Vec::new();
        for spec in &config.outcome_parameters {
            for subpop in spec.subpops.resolve(&config.subpopulations) {
                let mut priors = Vec::new();
                if let Some(p) = spec.prior {
                    priors.push(p);
                }
                priors.extend(extra_priors(
                    config,
                    ParamModule::OutcomeParameters,
                    &spec.outcome,
                    Some(spec.quantity),
                    &subpop,
                ));
                outcome_parameters.push(OutcomeParamSpec {
                    quantity: spec.quantity,
                    outcome: spec.outcome.clone(),
                    subpop,
                    value: spec.value,
                    support: default_outcome_support(spec),
                    kernel: spec.perturbation,
                    priors,
                });
            }
        }

        Ok(Self {
            seir_modifiers: expand_modifiers(&config.seir_modifiers, ParamModule::SeirModifiers),
            outcome_modifiers: expand_modifiers(
                &config.outcome_modifiers,
                ParamModule::OutcomeModifiers,
            ),
            outcome_parameters,
            seeding: config.seeding.clone(),
            seeding_kernel: config.seeding_perturbation,
            initial_conditions: config.initial_conditions.clone(),
        })
    }
}

fn default_outcome_support(spec: &OutcomeParamSpecConfig) -> Support {
    match spec.quantity {
        OutcomeQuantity::Probability => Support {
            lower: spec.lower.unwrap_or(0.0).max(0.0),
            upper: spec.upper.unwrap_or(1.0).min(1.0),
        },
        OutcomeQuantity::Delay | OutcomeQuantity::Duration => Support {
            lower: spec.lower.unwrap_or(POSITIVE_FLOOR).max(POSITIVE_FLOOR),
            upper: spec.upper.unwrap_or(f64::INFINITY),
        },
    }
}

fn extra_priors(
    config: &InferenceConfig,
    module: ParamModule,
    parameter: &str,
    quantity: Option<OutcomeQuantity>,
    subpop: &str,
) -> Vec<PriorConfig> {
    config
        .inference
        .priors
        .iter()
        .filter(|p| {
            p.module == module
                && p.parameter == parameter
                && (p.quantity.is_none() || p.quantity == quantity)
                && p.subpop.as_deref().map_or(true, |s| s == subpop)
        })
        .map(|p| p.prior)
        .collect()
}

// =============================================================================
// PARAMETER SAMPLE
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ModifierValue {
    pub name: String,
    pub subpop: SubpopId,
    pub value: f64,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeParamValue {
    pub quantity: OutcomeQuantity,
    pub outcome: String,
    pub subpop: SubpopId,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeedingEvent {
    pub date: NaiveDate,
    pub subpop: SubpopId,
    pub source: String,
    pub destination: String,
    pub amount: f64,
    pub no_perturb: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitialValue {
    pub subpop: SubpopId,
    pub compartment: String,
    pub amount: f64,
}

/// One parameter sample Θ. Entry order is fixed by the expanded specs: the
/// i-th entry of every group corresponds to the i-th spec of that group.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParamSample {
    pub seir_modifiers: Vec<ModifierValue>,
    pub outcome_modifiers: Vec<ModifierValue>,
    pub outcome_parameters: Vec<OutcomeParamValue>,
    pub seeding: Vec<SeedingEvent>,
    pub initial_conditions: Vec<InitialValue>,
}

impl ParamSample {
    /// Sample with every entry at its configured value.
    pub fn from_specs(specs: &ExpandedSpecs) -> Self {
        Self {
            seir_modifiers: specs.seir_modifiers.iter().map(modifier_value).collect(),
            outcome_modifiers: specs.outcome_modifiers.iter().map(modifier_value).collect(),
            outcome_parameters: specs
                .outcome_parameters
                .iter()
                .map(|s| OutcomeParamValue {
                    quantity: s.quantity,
                    outcome: s.outcome.clone(),
                    subpop: s.subpop.clone(),
                    value: s.value,
                })
                .collect(),
            seeding: specs
                .seeding
                .iter()
                .map(|e| SeedingEvent {
                    date: e.date,
                    subpop: e.subpop.clone(),
                    source: e.source.clone(),
                    destination: e.destination.clone(),
                    amount: e.amount,
                    no_perturb: e.no_perturb,
                })
                .collect(),
            initial_conditions: specs
                .initial_conditions
                .iter()
                .map(|c| InitialValue {
                    subpop: c.subpop.clone(),
                    compartment: c.compartment.clone(),
                    amount: c.amount,
                })
                .collect(),
        }
    }

    /// Replace every entry belonging to `subpop` with the values from
    /// `other`. Both samples must share the same shape; this is only called
    /// between a chain sample and a proposal derived from it.
    pub fn adopt_subpop(&mut self, other: &ParamSample, subpop: &str) {
        for (mine, theirs) in self.seir_modifiers.iter_mut().zip(&other.seir_modifiers) {
            if mine.subpop == subpop {
                mine.value = theirs.value;
            }
        }
        for (mine, theirs) in self.outcome_modifiers.iter_mut().zip(&other.outcome_modifiers) {
            if mine.subpop == subpop {
                mine.value = theirs.value;
            }
        }
        for (mine, theirs) in self.outcome_parameters.iter_mut().zip(&other.outcome_parameters) {
            if mine.subpop == subpop {
                mine.value = theirs.value;
            }
        }
        for (mine, theirs) in self.seeding.iter_mut().zip(&other.seeding) {
            if mine.subpop == subpop {
                mine.date = theirs.date;
                mine.amount = theirs.amount;
            }
        }
        for (mine, theirs) in self.initial_conditions.iter_mut().zip(&other.initial_conditions) {
            if mine.subpop == subpop {
                mine.amount = theirs.amount;
            }
        }
    }

    /// Look up a modifier value by name and subpopulation.
    pub fn modifier(&self, module: ParamModule, name: &str, subpop: &str) -> Option<f64> {
        let entries = match module {
            ParamModule::SeirModifiers => &self.seir_modifiers,
            ParamModule::OutcomeModifiers => &self.outcome_modifiers,
            ParamModule::OutcomeParameters => return None,
        };
        entries
            .iter()
            .find(|m| m.name == name && m.subpop == subpop)
            .map(|m| m.value)
    }
}

fn modifier_value(spec: &ModifierSpec) -> ModifierValue {
    ModifierValue {
        name: spec.name.clone(),
        subpop: spec.subpop.clone(),
        value: spec.value,
        window_start: spec.window_start,
        window_end: spec.window_end,
    }
}

// =============================================================================
// ARTIFACT ROW PROJECTION
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifierRow {
    pub name: String,
    pub subpop: String,
    pub value: f64,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeParamRow {
    pub quantity: String,
    pub outcome: String,
    pub subpop: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedingRow {
    pub date: NaiveDate,
    pub subpop: String,
    pub source: String,
    pub destination: String,
    pub amount: f64,
    pub no_perturb: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialRow {
    pub subpop: String,
    pub compartment: String,
    pub amount: f64,
}

impl ParamSample {
    pub fn modifier_rows(&self, module: ParamModule) -> Vec<ModifierRow> {
        let entries = match module {
            ParamModule::SeirModifiers => &self.seir_modifiers,
            ParamModule::OutcomeModifiers => &self.outcome_modifiers,
            ParamModule::OutcomeParameters => return Vec::new(),
        };
        entries
            .iter()
            .map(|m| ModifierRow {
                name: m.name.clone(),
                subpop: m.subpop.clone(),
                value: m.value,
                window_start: m.window_start,
                window_end: m.window_end,
            })
            .collect()
    }

    pub fn outcome_param_rows(&self) -> Vec<OutcomeParamRow> {
        self.outcome_parameters
            .iter()
            .map(|p| OutcomeParamRow {
                quantity: p.quantity.as_str().to_string(),
                outcome: p.outcome.clone(),
                subpop: p.subpop.clone(),
                value: p.value,
            })
            .collect()
    }

    pub fn seeding_rows(&self) -> Vec<SeedingRow> {
        self.seeding
            .iter()
            .map(|e| SeedingRow {
                date: e.date,
                subpop: e.subpop.clone(),
                source: e.source.clone(),
                destination: e.destination.clone(),
                amount: e.amount,
                no_perturb: e.no_perturb,
            })
            .collect()
    }

    pub fn initial_rows(&self) -> Vec<InitialRow> {
        self.initial_conditions
            .iter()
            .map(|c| InitialRow {
                subpop: c.subpop.clone(),
                compartment: c.compartment.clone(),
                amount: c.amount,
            })
            .collect()
    }

    /// Replace a modifier group from artifact rows, validating the shape.
    pub fn set_modifiers_from_rows(
        &mut self,
        module: ParamModule,
        rows: &[ModifierRow],
    ) -> Result<(), ParamError> {
        let (entries, group) = match module {
            ParamModule::SeirModifiers => (&mut self.seir_modifiers, "seir_modifiers"),
            ParamModule::OutcomeModifiers => (&mut self.outcome_modifiers, "outcome_modifiers"),
            ParamModule::OutcomeParameters => {
                return Err(ParamError::InvalidParameterShape {
                    group: "outcome_parameters",
                    detail: "not a modifier group".to_string(),
                })
            }
        };
        if rows.len() != entries.len() {
            return Err(ParamError::InvalidParameterShape {
                group,
                detail: format!("expected {} rows, got {}", entries.len(), rows.len()),
            });
        }
        for (entry, row) in entries.iter_mut().zip(rows) {
            if entry.name != row.name || entry.subpop != row.subpop {
                return Err(ParamError::InvalidParameterShape {
                    group,
                    detail: format!(
                        "row ({}, {}) does not match declared entry ({}, {})",
                        row.name, row.subpop, entry.name, entry.subpop
                    ),
                });
            }
            entry.value = row.value;
            entry.window_start = row.window_start;
            entry.window_end = row.window_end;
        }
        Ok(())
    }

    pub fn set_outcome_params_from_rows(
        &mut self,
        rows: &[OutcomeParamRow],
    ) -> Result<(), ParamError> {
        let group = "outcome_parameters";
        if rows.len() != self.outcome_parameters.len() {
            return Err(ParamError::InvalidParameterShape {
                group,
                detail: format!(
                    "expected {} rows, got {}",
                    self.outcome_parameters.len(),
                    rows.len()
                ),
            });
        }
        for (entry, row) in self.outcome_parameters.iter_mut().zip(rows) {
            if entry.quantity.as_str() != row.quantity
                || entry.outcome != row.outcome
                || entry.subpop != row.subpop
            {
                return Err(ParamError::InvalidParameterShape {
                    group,
                    detail: format!(
                        "row ({}, {}, {}) does not match declared entry",
                        row.quantity, row.outcome, row.subpop
                    ),
                });
            }
            entry.value = row.value;
        }
        Ok(())
    }

    pub fn set_seeding_from_rows(&mut self, rows: &[SeedingRow]) -> Result<(), ParamError> {
        let group = "seeding";
        if rows.len() != self.seeding.len() {
            return Err(ParamError::InvalidParameterShape {
                group,
                detail: format!("expected {} rows, got {}", self.seeding.len(), rows.len()),
            });
        }
        for (entry, row) in self.seeding.iter_mut().zip(rows) {
            if entry.subpop != row.subpop
                || entry.source != row.source
                || entry.destination != row.destination
            {
                return Err(ParamError::InvalidParameterShape {
                    group,
                    detail: format!(
                        "row ({}, {}->{}) does not match declared event",
                        row.subpop, row.source, row.destination
                    ),
                });
            }
            entry.date = row.date;
            entry.amount = row.amount;
            entry.no_perturb = row.no_perturb;
        }
        Ok(())
    }

    pub fn set_initial_from_rows(&mut self, rows: &[InitialRow]) -> Result<(), ParamError> {
        let group = "initial_conditions";
        if rows.len() != self.initial_conditions.len() {
            return Err(ParamError::InvalidParameterShape {
                group,
                detail: format!(
                    "expected {} rows, got {}",
                    self.initial_conditions.len(),
                    rows.len()
                ),
            });
        }
        for (entry, row) in self.initial_conditions.iter_mut().zip(rows) {
            if entry.subpop != row.subpop || entry.compartment != row.compartment {
                return Err(ParamError::InvalidParameterShape {
                    group,
                    detail: format!(
                        "row ({}, {}) does not match declared entry",
                        row.subpop, row.compartment
                    ),
                });
            }
            entry.amount = row.amount;
        }
        Ok(())
    }
}

// =============================================================================
// INFERABLE SCALAR VIEW
// =============================================================================

/// Flattened view of one inferable continuous entry; the ensemble back end
/// walks over these.
#[derive(Debug, Clone)]
pub struct ScalarEntry {
    /// Stable id, e.g. `seir_modifiers::lockdown::prov_a`.
    pub id: String,
    pub value: f64,
    pub support: Support,
    pub kernel: KernelConfig,
}

impl ParamSample {
    /// All continuous entries carrying a perturbation kernel, in group order.
    /// Seeding events and initial conditions are excluded: their kernels act
    /// on dates and joint proportions, not free scalars.
    pub fn inferable_scalars(&self, specs: &ExpandedSpecs) -> Vec<ScalarEntry> {
        let mut out = Vec::new();
        for (entry, spec) in self.seir_modifiers.iter().zip(&specs.seir_modifiers) {
            if let Some(kernel) = spec.kernel {
                out.push(ScalarEntry {
                    id: format!("seir_modifiers::{}::{}", entry.name, entry.subpop),
                    value: entry.value,
                    support: spec.support,
                    kernel,
                });
            }
        }
        for (entry, spec) in self.outcome_modifiers.iter().zip(&specs.outcome_modifiers) {
            if let Some(kernel) = spec.kernel {
                out.push(ScalarEntry {
                    id: format!("outcome_modifiers::{}::{}", entry.name, entry.subpop),
                    value: entry.value,
                    support: spec.support,
                    kernel,
                });
            }
        }
        for (entry, spec) in self.outcome_parameters.iter().zip(&specs.outcome_parameters) {
            if let Some(kernel) = spec.kernel {
                out.push(ScalarEntry {
                    id: format!(
                        "outcome_parameters::{}::{}::{}",
                        entry.quantity.as_str(),
                        entry.outcome,
                        entry.subpop
                    ),
                    value: entry.value,
                    support: spec.support,
                    kernel,
                });
            }
        }
        out
    }

    /// Write a flattened scalar vector (same order as `inferable_scalars`)
    /// back into the sample.
    pub fn set_inferable_scalars(
        &mut self,
        specs: &ExpandedSpecs,
        values: &[f64],
    ) -> Result<(), ParamError> {
        let mut it = values.iter();
        let mut take = |present: bool, slot: &mut f64| -> Result<(), ParamError> {
            if present {
                *slot = *it.next().ok_or(ParamError::InvalidParameterShape {
                    group: "inferable_scalars",
                    detail: "vector shorter than inferable entry count".to_string(),
                })?;
            }
            Ok(())
        };
        for (entry, spec) in self.seir_modifiers.iter_mut().zip(&specs.seir_modifiers) {
            take(spec.kernel.is_some(), &mut entry.value)?;
        }
        for (entry, spec) in self.outcome_modifiers.iter_mut().zip(&specs.outcome_modifiers) {
            take(spec.kernel.is_some(), &mut entry.value)?;
        }
        for (entry, spec) in self.outcome_parameters.iter_mut().zip(&specs.outcome_parameters) {
            take(spec.kernel.is_some(), &mut entry.value)?;
        }
        if it.next().is_some() {
            return Err(ParamError::InvalidParameterShape {
                group: "inferable_scalars",
                detail: "vector longer than inferable entry count".to_string(),
            });
        }
        Ok(())
    }
}
