//! Inference Configuration
//!
//! Parsed, validated settings for one inference run. The file format is TOML;
//! missing optional sections deserialize to empty collections and are treated
//! as "not fit". All validation happens up front in
//! [`InferenceConfig::validate`] so the driver can assume a well-formed
//! configuration from iteration 0 onward.

use crate::inference::error::ConfigError;
use crate::inference::window::FittingWindow;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Opaque subpopulation identifier.
pub type SubpopId = String;

// =============================================================================
// TOP-LEVEL CONFIG
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Name of the model setup; first component of every artifact path.
    #[serde(default = "default_setup_name")]
    pub setup_name: String,

    /// Inclusive fitting window.
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,

    /// Optional tighter window for ground-truth comparison. Observations
    /// outside it are treated as missing.
    #[serde(default)]
    pub start_date_groundtruth: Option<NaiveDate>,
    #[serde(default)]
    pub end_date_groundtruth: Option<NaiveDate>,

    pub subpopulations: Vec<SubpopulationConfig>,

    /// The five parameter groups. Absent group = not present in the sample.
    #[serde(default)]
    pub seir_modifiers: Vec<ModifierSpecConfig>,
    #[serde(default)]
    pub outcome_modifiers: Vec<ModifierSpecConfig>,
    #[serde(default)]
    pub outcome_parameters: Vec<OutcomeParamSpecConfig>,
    #[serde(default)]
    pub seeding: Vec<SeedingEventConfig>,
    #[serde(default)]
    pub initial_conditions: Vec<InitialConditionConfig>,

    /// Shared kernel for all perturbable seeding events.
    #[serde(default)]
    pub seeding_perturbation: Option<SeedingKernelConfig>,

    /// Built-in simulator selection for the CLI. Embedding applications
    /// supply their own `Simulator` and leave this unset.
    #[serde(default)]
    pub simulator: Option<SimulatorConfig>,

    pub inference: InferenceSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubpopulationConfig {
    pub id: SubpopId,
    pub population: f64,
    /// Grouping labels for hierarchical priors, e.g. `region = "north"`.
    #[serde(default)]
    pub groups: BTreeMap<String, String>,
}

// =============================================================================
// INFERENCE SECTION
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Classic,
    Emcee,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceSection {
    pub iterations_per_slot: u64,
    #[serde(default = "default_slots")]
    pub slots: usize,
    #[serde(default = "default_method")]
    pub method: Method,
    #[serde(default = "default_true")]
    pub reset_chimeric_on_accept: bool,
    #[serde(default)]
    pub gt_data_path: Option<PathBuf>,
    #[serde(default)]
    pub statistics: Vec<StatisticConfig>,
    #[serde(default)]
    pub hierarchical_stats_geo: Vec<HierarchicalConfig>,
    #[serde(default)]
    pub priors: Vec<ScalarPriorConfig>,
    /// Add a likelihood term on the summed-across-subpopulations series.
    #[serde(default)]
    pub incl_aggr_likelihood: bool,
    /// Weight of the aggregate term. Applies only to that term.
    #[serde(default = "default_one")]
    pub total_ll_multiplier: f64,
    /// Consecutive-failure budget before the slot aborts.
    #[serde(default = "default_failure_limit")]
    pub simulator_failure_limit: u32,
    /// Floor inside the heteroskedastic normal sd: `sd = cov * max(Z, floor)`.
    #[serde(default = "default_one")]
    pub variance_floor: f64,
    /// Ensemble back end: number of walkers.
    #[serde(default = "default_walkers")]
    pub walkers: usize,
    /// Ensemble back end: stretch-move scale `a`.
    #[serde(default = "default_stretch")]
    pub stretch_scale: f64,
}

// =============================================================================
// PARAMETER GROUP SPECS
// =============================================================================

/// Which subpopulations an entry spec expands over.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubpopSelector {
    Keyword(String),
    List(Vec<SubpopId>),
}

impl Default for SubpopSelector {
    fn default() -> Self {
        Self::Keyword("all".to_string())
    }
}

impl SubpopSelector {
    pub fn resolve<'a>(&'a self, roster: &'a [SubpopulationConfig]) -> Vec<SubpopId> {
        match self {
            Self::Keyword(_) => roster.iter().map(|s| s.id.clone()).collect(),
            Self::List(ids) => ids.clone(),
        }
    }
}

/// Symmetric perturbation kernel for one scalar entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "dist", rename_all = "snake_case")]
pub enum KernelConfig {
    /// Zero-mean normal step.
    Normal { sd: f64 },
    /// Centered uniform step on `[-half_width, half_width]`.
    Uniform { half_width: f64 },
}

/// Scalar prior on one entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "dist", rename_all = "snake_case")]
pub enum PriorConfig {
    Uniform { low: f64, high: f64 },
    Normal { mean: f64, sd: f64 },
    TruncatedNormal { mean: f64, sd: f64, low: f64, high: f64 },
}

/// SEIR or outcome modifier: a named reduction applying to a simulator
/// parameter, expanded to one entry per selected subpopulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifierSpecConfig {
    pub name: String,
    #[serde(default)]
    pub subpops: SubpopSelector,
    pub value: f64,
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
    #[serde(default)]
    pub perturbation: Option<KernelConfig>,
    #[serde(default)]
    pub prior: Option<PriorConfig>,
    /// Active window; defaults to the fitting window.
    #[serde(default)]
    pub window_start: Option<NaiveDate>,
    #[serde(default)]
    pub window_end: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeQuantity {
    Probability,
    Delay,
    Duration,
}

impl OutcomeQuantity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Probability => "probability",
            Self::Delay => "delay",
            Self::Duration => "duration",
        }
    }
}

/// Outcome-parameter triple member, expanded per subpopulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeParamSpecConfig {
    pub quantity: OutcomeQuantity,
    pub outcome: String,
    #[serde(default)]
    pub subpops: SubpopSelector,
    pub value: f64,
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
    #[serde(default)]
    pub perturbation: Option<KernelConfig>,
    #[serde(default)]
    pub prior: Option<PriorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedingEventConfig {
    pub date: NaiveDate,
    pub subpop: SubpopId,
    pub source: String,
    pub destination: String,
    pub amount: f64,
    #[serde(default)]
    pub no_perturb: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SeedingKernelConfig {
    pub date_sd: f64,
    pub amount_sd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialConditionConfig {
    pub subpop: SubpopId,
    pub compartment: String,
    pub amount: f64,
    /// Kernel on the within-subpopulation proportion scale. Absent = fixed.
    #[serde(default)]
    pub perturbation: Option<KernelConfig>,
}

// =============================================================================
// TARGETS (STATISTICS)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PeriodConfig {
    Named(String),
    Days { days: usize },
}

impl Default for PeriodConfig {
    fn default() -> Self {
        Self::Named("daily".to_string())
    }
}

impl PeriodConfig {
    /// Bin length in days; `None` means daily (identity).
    pub fn bin_days(&self) -> Result<Option<usize>, ConfigError> {
        match self {
            Self::Named(s) if s == "daily" => Ok(None),
            Self::Named(s) if s == "weekly" => Ok(Some(7)),
            Self::Named(s) => Err(ConfigError::InvalidField {
                field: "statistics.period".to_string(),
                reason: format!("unknown period `{}` (expected daily, weekly, or {{ days = n }})", s),
            }),
            Self::Days { days: 0 } => Err(ConfigError::InvalidField {
                field: "statistics.period".to_string(),
                reason: "bin length must be positive".to_string(),
            }),
            Self::Days { days } => Ok(Some(*days)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregator {
    Sum,
    Mean,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::Sum
    }
}

/// Likelihood family with its fixed nuisance parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum LikelihoodConfig {
    Poisson,
    NormalHomoskedastic { sd: f64 },
    NormalHeteroskedastic { cov: f64 },
    NegativeBinomial { dispersion: f64 },
    Rmse,
    AbsoluteError,
    SqrtNormal { scale: f64 },
    LogNormal { scale: f64 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegularizationConfig {
    /// Reweight the final `last_n` bins by `weight`.
    Forecast { last_n: usize, weight: f64 },
}

/// One named observable time series to fit against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticConfig {
    /// Target name; must match a ground-truth column and a trajectory outcome.
    pub name: String,
    #[serde(default)]
    pub period: PeriodConfig,
    #[serde(default)]
    pub aggregator: Aggregator,
    #[serde(default)]
    pub add_one: bool,
    pub likelihood: LikelihoodConfig,
    #[serde(default)]
    pub regularize: Vec<RegularizationConfig>,
}

// =============================================================================
// HIERARCHICAL TERMS AND EXTRA PRIORS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamModule {
    SeirModifiers,
    OutcomeModifiers,
    OutcomeParameters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HierarchicalTransform {
    None,
    Logit,
}

impl Default for HierarchicalTransform {
    fn default() -> Self {
        Self::None
    }
}

/// Group-normality pull: subpopulations sharing a label value are drawn
/// toward their empirical mean for one named parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchicalConfig {
    pub name: String,
    pub module: ParamModule,
    /// Modifier name, or outcome name for `outcome_parameters`.
    pub parameter: String,
    /// Required when `module = "outcome_parameters"`.
    #[serde(default)]
    pub quantity: Option<OutcomeQuantity>,
    /// Subpopulation group-label key to partition by.
    pub label: String,
    #[serde(default)]
    pub transform: HierarchicalTransform,
}

/// Additional scalar prior declared at the inference level, applied to every
/// matching entry (optionally narrowed to one subpopulation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalarPriorConfig {
    pub module: ParamModule,
    pub parameter: String,
    #[serde(default)]
    pub quantity: Option<OutcomeQuantity>,
    #[serde(default)]
    pub subpop: Option<SubpopId>,
    pub prior: PriorConfig,
}

// =============================================================================
// BUILT-IN SIMULATORS (CLI)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SimulatorConfig {
    /// Constant daily value per outcome, identical across subpopulations.
    Fixed { values: BTreeMap<String, f64> },
    /// Per-capita base rate per outcome, scaled by transmission-modifier
    /// reductions over their windows, plus seeded mass on seed dates.
    ScaledIncidence { base_rates: BTreeMap<String, f64> },
}

// =============================================================================
// DEFAULTS
// =============================================================================

fn default_setup_name() -> String {
    "model".to_string()
}

fn default_slots() -> usize {
    1
}

fn default_method() -> Method {
    Method::Classic
}

fn default_true() -> bool {
    true
}

fn default_one() -> f64 {
    1.0
}

fn default_failure_limit() -> u32 {
    10
}

fn default_walkers() -> usize {
    24
}

fn default_stretch() -> f64 {
    2.0
}

// =============================================================================
// LOADING AND VALIDATION
// =============================================================================

impl InferenceConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// The simulation/fitting window.
    pub fn window(&self) -> FittingWindow {
        // validate() guarantees the window is well-formed.
        FittingWindow::new(self.start_date, self.end_date).expect("validated window")
    }

    /// The ground-truth comparison window, clipped into the fitting window.
    pub fn groundtruth_window(&self) -> FittingWindow {
        let w = self.window();
        let start = self.start_date_groundtruth.map_or(w.start, |d| w.clamp(d));
        let end = self.end_date_groundtruth.map_or(w.end, |d| w.clamp(d));
        FittingWindow::new(start, end).unwrap_or(w)
    }

    pub fn subpop_ids(&self) -> Vec<SubpopId> {
        self.subpopulations.iter().map(|s| s.id.clone()).collect()
    }

    pub fn subpop(&self, id: &str) -> Option<&SubpopulationConfig> {
        self.subpopulations.iter().find(|s| s.id == id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.end_date < self.start_date {
            return Err(ConfigError::InvalidField {
                field: "end_date".to_string(),
                reason: "precedes start_date".to_string(),
            });
        }
        if self.subpopulations.is_empty() {
            return Err(ConfigError::MissingSection("subpopulations"));
        }
        let mut ids = BTreeSet::new();
        for sp in &self.subpopulations {
            if sp.population <= 0.0 {
                return Err(ConfigError::InvalidField {
                    field: format!("subpopulations.{}.population", sp.id),
                    reason: "must be positive".to_string(),
                });
            }
            if !ids.insert(sp.id.clone()) {
                return Err(ConfigError::InvalidField {
                    field: "subpopulations".to_string(),
                    reason: format!("duplicate id `{}`", sp.id),
                });
            }
        }

        for m in self.seir_modifiers.iter().chain(self.outcome_modifiers.iter()) {
            check_selector("modifier", &m.name, &m.subpops, &ids)?;
            check_kernel(&m.name, m.perturbation.as_ref())?;
            check_prior(&m.name, m.prior.as_ref())?;
            check_support(&m.name, m.lower, m.upper)?;
        }
        for p in &self.outcome_parameters {
            let label = format!("{}:{}", p.quantity.as_str(), p.outcome);
            check_selector("outcome parameter", &label, &p.subpops, &ids)?;
            check_kernel(&label, p.perturbation.as_ref())?;
            check_prior(&label, p.prior.as_ref())?;
            check_support(&label, p.lower, p.upper)?;
        }
        let window = FittingWindow::new(self.start_date, self.end_date).expect("checked above");
        for (i, ev) in self.seeding.iter().enumerate() {
            if !ids.contains(&ev.subpop) {
                return Err(ConfigError::UnknownSubpop {
                    context: format!("seeding event {}", i),
                    subpop: ev.subpop.clone(),
                });
            }
            if !window.contains(ev.date) {
                return Err(ConfigError::InvalidField {
                    field: format!("seeding[{}].date", i),
                    reason: "outside the fitting window".to_string(),
                });
            }
            if ev.amount < 0.0 {
                return Err(ConfigError::InvalidField {
                    field: format!("seeding[{}].amount", i),
                    reason: "must be non-negative".to_string(),
                });
            }
        }
        if self.seeding.iter().any(|e| !e.no_perturb) && !self.seeding.is_empty() {
            if let Some(k) = &self.seeding_perturbation {
                if k.date_sd < 0.0 || k.amount_sd < 0.0 {
                    return Err(ConfigError::InvalidField {
                        field: "seeding_perturbation".to_string(),
                        reason: "standard deviations must be non-negative".to_string(),
                    });
                }
            }
        }
        for (i, ic) in self.initial_conditions.iter().enumerate() {
            if !ids.contains(&ic.subpop) {
                return Err(ConfigError::UnknownSubpop {
                    context: format!("initial condition {}", i),
                    subpop: ic.subpop.clone(),
                });
            }
            if ic.amount < 0.0 {
                return Err(ConfigError::InvalidField {
                    field: format!("initial_conditions[{}].amount", i),
                    reason: "must be non-negative".to_string(),
                });
            }
            check_kernel(&format!("initial_conditions[{}]", i), ic.perturbation.as_ref())?;
        }

        let inf = &self.inference;
        if inf.iterations_per_slot == 0 {
            return Err(ConfigError::InvalidField {
                field: "inference.iterations_per_slot".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if inf.slots == 0 {
            return Err(ConfigError::InvalidField {
                field: "inference.slots".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if inf.total_ll_multiplier < 0.0 {
            return Err(ConfigError::InvalidField {
                field: "inference.total_ll_multiplier".to_string(),
                reason: "must be non-negative".to_string(),
            });
        }
        if inf.variance_floor <= 0.0 {
            return Err(ConfigError::InvalidField {
                field: "inference.variance_floor".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if inf.method == Method::Emcee {
            if inf.walkers < 4 {
                return Err(ConfigError::InvalidField {
                    field: "inference.walkers".to_string(),
                    reason: "ensemble method needs at least 4 walkers".to_string(),
                });
            }
            if inf.stretch_scale <= 1.0 {
                return Err(ConfigError::InvalidField {
                    field: "inference.stretch_scale".to_string(),
                    reason: "must exceed 1.0".to_string(),
                });
            }
        }
        let mut target_names = BTreeSet::new();
        for stat in &inf.statistics {
            stat.period.bin_days()?;
            check_likelihood(&stat.name, &stat.likelihood)?;
            for reg in &stat.regularize {
                let RegularizationConfig::Forecast { last_n, weight } = reg;
                if *last_n == 0 || *weight < 0.0 {
                    return Err(ConfigError::InvalidField {
                        field: format!("statistics.{}.regularize", stat.name),
                        reason: "forecast regularization needs last_n >= 1 and weight >= 0"
                            .to_string(),
                    });
                }
            }
            if !target_names.insert(stat.name.clone()) {
                return Err(ConfigError::InvalidField {
                    field: "inference.statistics".to_string(),
                    reason: format!("duplicate target `{}`", stat.name),
                });
            }
        }
        for h in &inf.hierarchical_stats_geo {
            if h.module == ParamModule::OutcomeParameters && h.quantity.is_none() {
                return Err(ConfigError::InvalidField {
                    field: format!("hierarchical_stats_geo.{}", h.name),
                    reason: "outcome_parameters terms need a `quantity`".to_string(),
                });
            }
        }
        for (i, sp) in inf.priors.iter().enumerate() {
            if let Some(subpop) = &sp.subpop {
                if !ids.contains(subpop) {
                    return Err(ConfigError::UnknownSubpop {
                        context: format!("inference.priors[{}]", i),
                        subpop: subpop.clone(),
                    });
                }
            }
            check_prior(&format!("inference.priors[{}]", i), Some(&sp.prior))?;
        }
        Ok(())
    }
}

fn check_selector(
    context: &str,
    name: &str,
    selector: &SubpopSelector,
    known: &BTreeSet<SubpopId>,
) -> Result<(), ConfigError> {
    match selector {
        SubpopSelector::Keyword(kw) if kw == "all" => Ok(()),
        SubpopSelector::Keyword(kw) => Err(ConfigError::InvalidField {
            field: format!("{} {}.subpops", context, name),
            reason: format!("unknown keyword `{}` (expected \"all\" or a list)", kw),
        }),
        SubpopSelector::List(list) => {
            for id in list {
                if !known.contains(id) {
                    return Err(ConfigError::UnknownSubpop {
                        context: format!("{} {}", context, name),
                        subpop: id.clone(),
                    });
                }
            }
            Ok(())
        }
    }
}

fn check_kernel(name: &str, kernel: Option<&KernelConfig>) -> Result<(), ConfigError> {
    match kernel {
        Some(KernelConfig::Normal { sd }) if *sd <= 0.0 => Err(ConfigError::InvalidField {
            field: format!("{}.perturbation.sd", name),
            reason: "must be positive".to_string(),
        }),
        Some(KernelConfig::Uniform { half_width }) if *half_width <= 0.0 => {
            Err(ConfigError::InvalidField {
                field: format!("{}.perturbation.half_width", name),
                reason: "must be positive".to_string(),
            })
        }
        _ => Ok(()),
    }
}

fn check_prior(name: &str, prior: Option<&PriorConfig>) -> Result<(), ConfigError> {
    match prior {
        Some(PriorConfig::Uniform { low, high }) if high <= low => {
            Err(ConfigError::InvalidField {
                field: format!("{}.prior", name),
                reason: "uniform prior needs high > low".to_string(),
            })
        }
        Some(PriorConfig::Normal { sd, .. }) if *sd <= 0.0 => Err(ConfigError::InvalidField {
            field: format!("{}.prior.sd", name),
            reason: "must be positive".to_string(),
        }),
        Some(PriorConfig::TruncatedNormal { sd, low, high, .. })
            if *sd <= 0.0 || high <= low =>
        {
            Err(ConfigError::InvalidField {
                field: format!("{}.prior", name),
                reason: "truncated normal needs sd > 0 and high > low".to_string(),
            })
        }
        _ => Ok(()),
    }
}

fn check_likelihood(target: &str, family: &LikelihoodConfig) -> Result<(), ConfigError> {
    let bad = |reason: &str| {
        Err(ConfigError::InvalidField {
            field: format!("statistics.{}.likelihood", target),
            reason: reason.to_string(),
        })
    };
    match family {
        LikelihoodConfig::NormalHomoskedastic { sd } if *sd <= 0.0 => bad("sd must be positive"),
        LikelihoodConfig::NormalHeteroskedastic { cov } if *cov <= 0.0 => {
            bad("cov must be positive")
        }
        LikelihoodConfig::NegativeBinomial { dispersion } if *dispersion <= 0.0 => {
            bad("dispersion must be positive")
        }
        LikelihoodConfig::SqrtNormal { scale } | LikelihoodConfig::LogNormal { scale }
            if *scale <= 0.0 =>
        {
            bad("scale must be positive")
        }
        _ => Ok(()),
    }
}

fn check_support(name: &str, lower: Option<f64>, upper: Option<f64>) -> Result<(), ConfigError> {
    if let (Some(lo), Some(hi)) = (lower, upper) {
        if hi < lo {
            return Err(ConfigError::InvalidField {
                field: format!("{}.upper", name),
                reason: "upper bound below lower bound".to_string(),
            });
        }
    }
    Ok(())
}
