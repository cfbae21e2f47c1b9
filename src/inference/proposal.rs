//! Proposal Kernels
//!
//! Symmetric perturbations per parameter group; a joint proposal perturbs
//! every inferable entry independently, always starting from the chimeric
//! sample. Only symmetric step distributions are offered (zero-mean normal,
//! centered uniform), so the acceptance rule carries no Hastings correction.
//!
//! Entries are visited in a fixed order (group order, then declaration
//! order), which pins the RNG consumption sequence and keeps proposals
//! reproducible from a derived per-iteration generator.

use crate::inference::config::KernelConfig;
use crate::inference::params::{ExpandedSpecs, ParamSample};
use crate::inference::window::FittingWindow;
use chrono::Duration;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use statrs::distribution::Normal;
use std::collections::BTreeMap;

pub struct ProposalKernel<'a> {
    specs: &'a ExpandedSpecs,
    window: FittingWindow,
    /// Stochastic runs round perturbed seeding amounts to whole units.
    stochastic: bool,
}

impl<'a> ProposalKernel<'a> {
    pub fn new(specs: &'a ExpandedSpecs, window: FittingWindow, stochastic: bool) -> Self {
        Self { specs, window, stochastic }
    }

    /// Draw Θ* from Θ.
    pub fn propose(&self, current: &ParamSample, rng: &mut ChaCha8Rng) -> ParamSample {
        let mut proposal = current.clone();

        for (entry, spec) in proposal.seir_modifiers.iter_mut().zip(&self.specs.seir_modifiers) {
            if let Some(kernel) = &spec.kernel {
                entry.value = spec.support.clamp(entry.value + step(kernel, rng));
            }
        }
        for (entry, spec) in
            proposal.outcome_modifiers.iter_mut().zip(&self.specs.outcome_modifiers)
        {
            if let Some(kernel) = &spec.kernel {
                entry.value = spec.support.clamp(entry.value + step(kernel, rng));
            }
        }
        for (entry, spec) in
            proposal.outcome_parameters.iter_mut().zip(&self.specs.outcome_parameters)
        {
            if let Some(kernel) = &spec.kernel {
                entry.value = spec.support.clamp(entry.value + step(kernel, rng));
            }
        }

        if let Some(kernel) = &self.specs.seeding_kernel {
            for event in proposal.seeding.iter_mut().filter(|e| !e.no_perturb) {
                let offset = normal_step(kernel.date_sd, rng).round() as i64;
                event.date = self.window.clamp(event.date + Duration::days(offset));
                let mut amount = (event.amount + normal_step(kernel.amount_sd, rng)).max(0.0);
                if self.stochastic {
                    amount = amount.round();
                }
                event.amount = amount;
            }
        }

        self.perturb_initial_conditions(&mut proposal, rng);
        proposal
    }

    /// Initial-condition kernels act on proportions of each subpopulation's
    /// total initial mass; the group is renormalized afterwards so the mass
    /// is preserved exactly.
    fn perturb_initial_conditions(&self, proposal: &mut ParamSample, rng: &mut ChaCha8Rng) {
        let mut by_subpop: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (idx, spec) in self.specs.initial_conditions.iter().enumerate() {
            by_subpop.entry(spec.subpop.as_str()).or_default().push(idx);
        }
        for indices in by_subpop.values() {
            let any_kernel =
                indices.iter().any(|&i| self.specs.initial_conditions[i].perturbation.is_some());
            if !any_kernel {
                continue;
            }
            let total: f64 =
                indices.iter().map(|&i| proposal.initial_conditions[i].amount).sum();
            if total <= 0.0 {
                continue;
            }
            let mut proportions: Vec<f64> = indices
                .iter()
                .map(|&i| proposal.initial_conditions[i].amount / total)
                .collect();
            for (slot, &i) in proportions.iter_mut().zip(indices.iter()) {
                if let Some(kernel) = &self.specs.initial_conditions[i].perturbation {
                    *slot = (*slot + step(kernel, rng)).clamp(0.0, 1.0);
                }
            }
            let mass: f64 = proportions.iter().sum();
            if mass <= 0.0 {
                continue;
            }
            for (slot, &i) in proportions.iter().zip(indices.iter()) {
                proposal.initial_conditions[i].amount = slot / mass * total;
            }
        }
    }
}

/// One symmetric step.
fn step(kernel: &KernelConfig, rng: &mut ChaCha8Rng) -> f64 {
    match kernel {
        KernelConfig::Normal { sd } => normal_step(*sd, rng),
        KernelConfig::Uniform { half_width } => (rng.gen::<f64>() * 2.0 - 1.0) * half_width,
    }
}

fn normal_step(sd: f64, rng: &mut ChaCha8Rng) -> f64 {
    if sd <= 0.0 {
        return 0.0;
    }
    // sd > 0 makes this constructor infallible.
    match Normal::new(0.0, sd) {
        Ok(normal) => rng.sample(&normal),
        Err(_) => 0.0,
    }
}
