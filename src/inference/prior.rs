//! Scalar Priors
//!
//! Per-entry priors declared in configuration: uniform, normal, truncated
//! normal. The evaluator exposes the full log-prior and the restriction to a
//! single subpopulation (the chimeric decision consults only the latter).
//! Out-of-support values score `-inf`, which the driver treats as rejection.

use crate::inference::config::PriorConfig;
use crate::inference::params::{ExpandedSpecs, ParamSample};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use statrs::distribution::{Continuous, ContinuousCDF, Normal};

const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Log-density of one prior at `x`.
pub fn log_density(prior: &PriorConfig, x: f64) -> f64 {
    match prior {
        PriorConfig::Uniform { low, high } => {
            if x < *low || x > *high {
                f64::NEG_INFINITY
            } else {
                -(high - low).ln()
            }
        }
        PriorConfig::Normal { mean, sd } => {
            let z = (x - mean) / sd;
            -0.5 * (LN_2PI + z * z) - sd.ln()
        }
        PriorConfig::TruncatedNormal { mean, sd, low, high } => {
            if x < *low || x > *high {
                return f64::NEG_INFINITY;
            }
            // Normal parameters are validated at config load.
            let normal = Normal::new(*mean, *sd).expect("validated prior");
            let mass = normal.cdf(*high) - normal.cdf(*low);
            if mass <= 0.0 {
                return f64::NEG_INFINITY;
            }
            normal.ln_pdf(x) - mass.ln()
        }
    }
}

/// Draw one value from a prior.
pub fn sample(prior: &PriorConfig, rng: &mut ChaCha8Rng) -> f64 {
    match prior {
        PriorConfig::Uniform { low, high } => low + rng.gen::<f64>() * (high - low),
        PriorConfig::Normal { mean, sd } => {
            let normal = Normal::new(*mean, *sd).expect("validated prior");
            rng.sample(&normal)
        }
        PriorConfig::TruncatedNormal { mean, sd, low, high } => {
            let normal = Normal::new(*mean, *sd).expect("validated prior");
            let lo = normal.cdf(*low);
            let hi = normal.cdf(*high);
            let u = lo + rng.gen::<f64>() * (hi - lo);
            // Guard the open interval; inverse_cdf(0|1) is infinite.
            normal.inverse_cdf(u.clamp(1e-12, 1.0 - 1e-12)).clamp(*low, *high)
        }
    }
}

/// Evaluates the scalar-prior part of the posterior against the expanded
/// entry specs.
pub struct PriorEvaluator<'a> {
    specs: &'a ExpandedSpecs,
}

impl<'a> PriorEvaluator<'a> {
    pub fn new(specs: &'a ExpandedSpecs) -> Self {
        Self { specs }
    }

    /// `log p(Θ)`: sum of every declared per-entry prior.
    pub fn log_prior(&self, theta: &ParamSample) -> f64 {
        self.accumulate(theta, None)
    }

    /// `log p_i(Θ)`: the prior restricted to entries of one subpopulation.
    pub fn log_prior_subpop(&self, theta: &ParamSample, subpop: &str) -> f64 {
        self.accumulate(theta, Some(subpop))
    }

    fn accumulate(&self, theta: &ParamSample, subpop: Option<&str>) -> f64 {
        let mut total = 0.0;
        for (entry, spec) in theta.seir_modifiers.iter().zip(&self.specs.seir_modifiers) {
            if subpop.map_or(true, |s| s == entry.subpop) {
                for p in &spec.priors {
                    total += log_density(p, entry.value);
                }
            }
        }
        for (entry, spec) in theta.outcome_modifiers.iter().zip(&self.specs.outcome_modifiers) {
            if subpop.map_or(true, |s| s == entry.subpop) {
                for p in &spec.priors {
                    total += log_density(p, entry.value);
                }
            }
        }
        for (entry, spec) in theta.outcome_parameters.iter().zip(&self.specs.outcome_parameters) {
            if subpop.map_or(true, |s| s == entry.subpop) {
                for p in &spec.priors {
                    total += log_density(p, entry.value);
                }
            }
        }
        total
    }

    /// Draw the initial sample: entries with a declared prior sample from it
    /// (clamped to their support); everything else starts at its configured
    /// value.
    pub fn draw_initial(&self, rng: &mut ChaCha8Rng) -> ParamSample {
        let mut theta = ParamSample::from_specs(self.specs);
        for (entry, spec) in theta.seir_modifiers.iter_mut().zip(&self.specs.seir_modifiers) {
            if let Some(prior) = spec.priors.first() {
                entry.value = spec.support.clamp(sample(prior, rng));
            }
        }
        for (entry, spec) in theta.outcome_modifiers.iter_mut().zip(&self.specs.outcome_modifiers)
        {
            if let Some(prior) = spec.priors.first() {
                entry.value = spec.support.clamp(sample(prior, rng));
            }
        }
        for (entry, spec) in
            theta.outcome_parameters.iter_mut().zip(&self.specs.outcome_parameters)
        {
            if let Some(prior) = spec.priors.first() {
                entry.value = spec.support.clamp(sample(prior, rng));
            }
        }
        theta
    }
}
