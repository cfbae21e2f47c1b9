//! Hierarchical Group-Normality Term
//!
//! `H(Θ)`: for each declared (parameter, group-label) pair, subpopulations
//! sharing a label value are scored against a normal centered on their own
//! empirical mean with their empirical standard deviation, pulling the group
//! toward consensus. `H` is a first-class additive term of the total log
//! posterior, never a post-hoc correction.

use crate::inference::config::{
    HierarchicalConfig, HierarchicalTransform, InferenceConfig, ParamModule, SubpopId,
};
use crate::inference::params::ParamSample;
use statrs::distribution::{Continuous, Normal};

/// Values this close to degenerate spread contribute nothing rather than
/// blowing up the density.
const MIN_GROUP_SD: f64 = 1e-9;

pub fn logit(p: f64) -> f64 {
    let p = p.clamp(1e-9, 1.0 - 1e-9);
    (p / (1.0 - p)).ln()
}

#[derive(Debug, Clone)]
struct ResolvedTerm {
    config: HierarchicalConfig,
    /// Label value -> member subpopulations (only groups of two or more).
    groups: Vec<Vec<SubpopId>>,
}

/// Evaluates `H(Θ)` for all configured terms.
#[derive(Debug, Clone, Default)]
pub struct HierarchicalEvaluator {
    terms: Vec<ResolvedTerm>,
}

impl HierarchicalEvaluator {
    pub fn new(config: &InferenceConfig) -> Self {
        let mut terms = Vec::new();
        for term in &config.inference.hierarchical_stats_geo {
            let mut by_label: std::collections::BTreeMap<String, Vec<SubpopId>> =
                std::collections::BTreeMap::new();
            for sp in &config.subpopulations {
                if let Some(value) = sp.groups.get(&term.label) {
                    by_label.entry(value.clone()).or_default().push(sp.id.clone());
                }
            }
            let groups: Vec<Vec<SubpopId>> =
                by_label.into_values().filter(|members| members.len() >= 2).collect();
            if !groups.is_empty() {
                terms.push(ResolvedTerm { config: term.clone(), groups });
            }
        }
        Self { terms }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// `H(Θ)`. Finite unless a member value escapes the transform's domain.
    pub fn log_term(&self, theta: &ParamSample) -> f64 {
        let mut total = 0.0;
        for term in &self.terms {
            for members in &term.groups {
                let mut values = Vec::with_capacity(members.len());
                for subpop in members {
                    if let Some(v) = lookup(theta, &term.config, subpop) {
                        values.push(match term.config.transform {
                            HierarchicalTransform::None => v,
                            HierarchicalTransform::Logit => logit(v),
                        });
                    }
                }
                if values.len() < 2 {
                    continue;
                }
                let n = values.len() as f64;
                let mean = values.iter().sum::<f64>() / n;
                let var =
                    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0);
                let sd = var.sqrt();
                if sd < MIN_GROUP_SD {
                    continue;
                }
                let normal = Normal::new(mean, sd).expect("positive spread");
                total += values.iter().map(|v| normal.ln_pdf(*v)).sum::<f64>();
            }
        }
        total
    }
}

fn lookup(theta: &ParamSample, term: &HierarchicalConfig, subpop: &str) -> Option<f64> {
    match term.module {
        ParamModule::SeirModifiers | ParamModule::OutcomeModifiers => {
            theta.modifier(term.module, &term.parameter, subpop)
        }
        ParamModule::OutcomeParameters => theta
            .outcome_parameters
            .iter()
            .find(|p| {
                p.outcome == term.parameter
                    && Some(p.quantity) == term.quantity
                    && p.subpop == subpop
            })
            .map(|p| p.value),
    }
}
