//! Likelihood Evaluator
//!
//! Per-(subpopulation, target) log-likelihoods and the total log posterior:
//!
//! `total = Σ_i Σ_j log L_ij + log p(Θ) + H(Θ) + R`
//!
//! Two views are exposed: the per-subpopulation vector (consumed by chimeric
//! decisions, likelihood only) and the total (consumed by global decisions,
//! priors and regularization folded in). Observed series are aggregated once
//! at construction; only modeled series are re-aggregated per iteration.
//!
//! # Zero handling
//!
//! With a target's `add_one` flag set, a bin with `D = 0` and `Z = 0`
//! contributes exactly `0` for every family: empty bins neither penalize nor
//! reward a fit.
//!
//! # Pseudo-families
//!
//! `rmse` is evaluated per series (negated root-mean-square error over the
//! present bins); `absolute_error` is the negated absolute error sum. Both
//! are pseudo-log-likelihoods for targets where no count family applies.

use crate::inference::config::{
    InferenceConfig, LikelihoodConfig, RegularizationConfig, StatisticConfig, SubpopId,
};
use crate::inference::error::ConfigError;
use crate::inference::hierarchical::HierarchicalEvaluator;
use crate::inference::observations::{ObservationBundle, TOTAL_SUBPOP};
use crate::inference::params::{ExpandedSpecs, ParamSample};
use crate::inference::prior::PriorEvaluator;
use crate::inference::simulator::Trajectory;
use crate::inference::statistics::{extract_modeled, extract_observed, AggregatedSeries};
use crate::inference::window::FittingWindow;
use statrs::function::gamma::ln_gamma;
use std::collections::BTreeMap;

const LN_2PI: f64 = 1.837_877_066_409_345_5;

// =============================================================================
// SCORECARD
// =============================================================================

/// Evaluation result for one parameter sample against one trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct Scorecard {
    /// `Σ_j log L_ij`, aligned to the evaluator's roster order.
    pub by_subpop: Vec<f64>,
    pub log_prior: f64,
    pub hierarchical: f64,
    pub regularization: f64,
    /// `Σ_i by_subpop[i] + log_prior + hierarchical + regularization`.
    pub total_posterior: f64,
}

impl Scorecard {
    /// True when nothing evaluated to NaN. `-inf` is a legal score (it simply
    /// never wins an acceptance draw); NaN is not.
    pub fn is_usable(&self) -> bool {
        !self.total_posterior.is_nan() && self.by_subpop.iter().all(|v| !v.is_nan())
    }
}

// =============================================================================
// PER-POINT FAMILY TERMS
// =============================================================================

fn normal_ln_pdf(x: f64, mean: f64, sd: f64) -> f64 {
    if sd <= 0.0 {
        return f64::NAN;
    }
    let z = (x - mean) / sd;
    -0.5 * (LN_2PI + z * z) - sd.ln()
}

/// Per-bin log-likelihood term for the pointwise families.
/// `rmse` never reaches this function.
fn point_term(
    family: &LikelihoodConfig,
    add_one: bool,
    variance_floor: f64,
    d: f64,
    z: f64,
) -> f64 {
    if add_one && d == 0.0 && z == 0.0 {
        return 0.0;
    }
    match family {
        LikelihoodConfig::Poisson => {
            if d == 0.0 {
                -z
            } else if z <= 0.0 {
                f64::NEG_INFINITY
            } else {
                d * z.ln() - z - ln_gamma(d + 1.0)
            }
        }
        LikelihoodConfig::NormalHomoskedastic { sd } => normal_ln_pdf(d, z, *sd),
        LikelihoodConfig::NormalHeteroskedastic { cov } => {
            normal_ln_pdf(d, z, cov * z.max(variance_floor))
        }
        LikelihoodConfig::NegativeBinomial { dispersion } => {
            let k = *dispersion;
            if d == 0.0 {
                k * (k / (k + z)).ln()
            } else if z <= 0.0 {
                f64::NEG_INFINITY
            } else {
                ln_gamma(d + k) - ln_gamma(k) - ln_gamma(d + 1.0)
                    + k * (k / (k + z)).ln()
                    + d * (z / (k + z)).ln()
            }
        }
        LikelihoodConfig::AbsoluteError => -(d - z).abs(),
        LikelihoodConfig::SqrtNormal { scale } => {
            normal_ln_pdf(d.max(0.0).sqrt(), z.max(0.0).sqrt(), *scale)
        }
        LikelihoodConfig::LogNormal { scale } => {
            // Shifted by one so zero-valued bins stay finite.
            normal_ln_pdf((d + 1.0).ln(), (z + 1.0).ln(), *scale)
        }
        LikelihoodConfig::Rmse => f64::NAN,
    }
}

/// Log-likelihood of one aggregated series over a bin range. Bins where the
/// observed series is absent are skipped; a range with no present bin scores
/// exactly `0`.
pub fn series_log_likelihood(
    stat: &StatisticConfig,
    variance_floor: f64,
    observed: &AggregatedSeries,
    modeled: &AggregatedSeries,
    range: std::ops::Range<usize>,
) -> f64 {
    let lo = range.start.min(observed.bins.len());
    let hi = range.end.min(observed.bins.len()).min(modeled.bins.len());
    if lo >= hi {
        return 0.0;
    }
    let pairs = observed.bins[lo..hi]
        .iter()
        .zip(&modeled.bins[lo..hi])
        .filter(|(o, _)| o.present);

    match stat.likelihood {
        LikelihoodConfig::Rmse => {
            let mut sq = 0.0;
            let mut n = 0usize;
            for (o, m) in pairs {
                if stat.add_one && o.value == 0.0 && m.value == 0.0 {
                    continue;
                }
                let e = o.value - m.value;
                sq += e * e;
                n += 1;
            }
            if n == 0 {
                0.0
            } else {
                -(sq / n as f64).sqrt()
            }
        }
        ref family => pairs
            .map(|(o, m)| point_term(family, stat.add_one, variance_floor, o.value, m.value))
            .sum(),
    }
}

// =============================================================================
// EVALUATOR
// =============================================================================

/// Holds everything constant across iterations: aggregated observations,
/// resolved priors and hierarchical terms, the roster.
pub struct LikelihoodEvaluator<'a> {
    config: &'a InferenceConfig,
    window: FittingWindow,
    roster: Vec<SubpopId>,
    prior: PriorEvaluator<'a>,
    hierarchy: HierarchicalEvaluator,
    /// (subpop, target) -> aggregated observed series; `Total` included when
    /// the aggregate term is configured.
    observed: BTreeMap<(SubpopId, String), AggregatedSeries>,
}

impl<'a> LikelihoodEvaluator<'a> {
    pub fn new(
        config: &'a InferenceConfig,
        specs: &'a ExpandedSpecs,
        obs: &'a ObservationBundle,
    ) -> Result<Self, ConfigError> {
        let window = config.window();
        let roster = config.subpop_ids();
        let mut observed = BTreeMap::new();
        for stat in &config.inference.statistics {
            for subpop in &roster {
                let series = obs
                    .series(subpop, &stat.name)
                    .map(|s| s.to_vec())
                    .unwrap_or_else(|| vec![None; window.num_days()]);
                observed.insert(
                    (subpop.clone(), stat.name.clone()),
                    extract_observed(&series, &window, stat)?,
                );
            }
            if config.inference.incl_aggr_likelihood {
                let total = obs.total_series(&stat.name);
                observed.insert(
                    (TOTAL_SUBPOP.to_string(), stat.name.clone()),
                    extract_observed(&total, &window, stat)?,
                );
            }
        }
        Ok(Self {
            config,
            window,
            roster,
            prior: PriorEvaluator::new(specs),
            hierarchy: HierarchicalEvaluator::new(config),
            observed,
        })
    }

    pub fn roster(&self) -> &[SubpopId] {
        &self.roster
    }

    pub fn prior(&self) -> &PriorEvaluator<'a> {
        &self.prior
    }

    /// Prior restricted to one subpopulation's entries.
    pub fn local_log_prior(&self, theta: &ParamSample, subpop: &str) -> f64 {
        self.prior.log_prior_subpop(theta, subpop)
    }

    /// Score one sample against the trajectory it produced.
    pub fn evaluate(&self, theta: &ParamSample, trajectory: &Trajectory) -> Scorecard {
        let floor = self.config.inference.variance_floor;
        let mut by_subpop = vec![0.0_f64; self.roster.len()];
        let mut regularization = 0.0_f64;

        for stat in &self.config.inference.statistics {
            for (i, subpop) in self.roster.iter().enumerate() {
                let Some(observed) = self.observed.get(&(subpop.clone(), stat.name.clone()))
                else {
                    continue;
                };
                let modeled = match self.modeled_series(trajectory, subpop, stat) {
                    Some(m) => m,
                    None => {
                        by_subpop[i] = f64::NAN;
                        continue;
                    }
                };
                let n = observed.bins.len();
                by_subpop[i] += series_log_likelihood(stat, floor, observed, &modeled, 0..n);
                regularization += forecast_term(stat, floor, observed, &modeled);
            }
            if self.config.inference.incl_aggr_likelihood {
                regularization += self.aggregate_term(trajectory, stat, floor);
            }
        }

        let log_prior = self.prior.log_prior(theta);
        let hierarchical = self.hierarchy.log_term(theta);
        let total_posterior =
            by_subpop.iter().sum::<f64>() + log_prior + hierarchical + regularization;
        Scorecard { by_subpop, log_prior, hierarchical, regularization, total_posterior }
    }

    fn modeled_series(
        &self,
        trajectory: &Trajectory,
        subpop: &str,
        stat: &StatisticConfig,
    ) -> Option<AggregatedSeries> {
        let series = trajectory.outcome(subpop, &stat.name)?;
        extract_modeled(series, &self.window, stat).ok()
    }

    /// Likelihood of the summed-across-subpopulations series, scaled by the
    /// aggregate multiplier (the multiplier applies only to this term).
    fn aggregate_term(
        &self,
        trajectory: &Trajectory,
        stat: &StatisticConfig,
        floor: f64,
    ) -> f64 {
        let Some(observed) = self.observed.get(&(TOTAL_SUBPOP.to_string(), stat.name.clone()))
        else {
            return 0.0;
        };
        let total = trajectory.total_outcome(&stat.name);
        let Ok(modeled) = extract_modeled(&total, &self.window, stat) else {
            return f64::NAN;
        };
        let n = observed.bins.len();
        self.config.inference.total_ll_multiplier
            * series_log_likelihood(stat, floor, observed, &modeled, 0..n)
    }
}

/// Extra weight on the final bins: `(weight - 1) * loglik(tail)`, so a weight
/// of 1 is a no-op and the base term is never double-counted.
fn forecast_term(
    stat: &StatisticConfig,
    floor: f64,
    observed: &AggregatedSeries,
    modeled: &AggregatedSeries,
) -> f64 {
    let mut extra = 0.0;
    for reg in &stat.regularize {
        let RegularizationConfig::Forecast { last_n, weight } = reg;
        let n = observed.bins.len();
        let lo = n.saturating_sub(*last_n);
        extra += (weight - 1.0) * series_log_likelihood(stat, floor, observed, modeled, lo..n);
    }
    extra
}
