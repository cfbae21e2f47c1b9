//! MCMC Driver
//!
//! The per-slot iteration loop: propose from the chimeric book, simulate,
//! score, decide globally, decide per-subpopulation, record, persist. Each
//! slot is one independent chain; slots share only read-only inputs and are
//! the unit of parallelism. Within a slot everything is strictly sequential
//! and every artifact for iteration `k` is flushed before `k+1` starts.
//!
//! # Decision structure
//!
//! The global arm updates Θ^G from the total log posterior (likelihood,
//! scalar priors, hierarchical term, regularization). The chimeric arm runs
//! per subpopulation against the local likelihood plus the subpop-restricted
//! prior, and may splice arbitrary subsets into Θ^C. The two arms interact
//! through exactly one switch: `reset_chimeric_on_accept`.
//!
//! # Failure semantics
//!
//! Simulator failure: one retry with the same proposal, then a recorded
//! rejection; the slot aborts once the failure budget is spent. Non-finite
//! scores: rejection. Persistence failure: fatal.

use crate::inference::chain::ChainState;
use crate::inference::config::{InferenceConfig, SubpopId};
use crate::inference::error::{InferenceError, SimulatorError};
use crate::inference::likelihood::{LikelihoodEvaluator, Scorecard};
use crate::inference::observations::ObservationBundle;
use crate::inference::params::{ExpandedSpecs, ParamSample};
use crate::inference::paths::{ArtifactKind, Stream};
use crate::inference::persistence::{ArtifactStore, LikelihoodRow, RunLogRecord};
use crate::inference::prior::PriorEvaluator;
use crate::inference::proposal::ProposalKernel;
use crate::inference::rng::{rng_for, RngPurpose};
use crate::inference::simulator::{SimulationContext, Simulator, Trajectory};
use crate::inference::window::FittingWindow;
use rand::Rng;
use rayon::prelude::*;
use tracing::{debug, info, warn};

/// Settings shared by every slot of one invocation.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub run_id: String,
    pub block: u64,
    pub iterations: u64,
    pub resume: bool,
    pub stochastic: bool,
    pub master_seed: u64,
}

#[derive(Debug, Clone)]
pub struct SlotSummary {
    pub slot: usize,
    pub iterations: u64,
    pub global_acceptance: f64,
    pub chimeric_acceptance: Vec<(SubpopId, f64)>,
    pub total_posterior: f64,
    pub simulator_failures: u32,
    pub last_accepted_iteration: u64,
}

/// Metropolis acceptance probability for a symmetric proposal. NaN on either
/// side rejects; a `-inf` incumbent always yields to a finite proposal.
pub fn accept_probability(log_post_new: f64, log_post_cur: f64) -> f64 {
    if log_post_new.is_nan() || log_post_cur.is_nan() {
        return 0.0;
    }
    if log_post_new == f64::NEG_INFINITY {
        return 0.0;
    }
    if log_post_cur == f64::NEG_INFINITY {
        return 1.0;
    }
    (log_post_new - log_post_cur).exp().min(1.0)
}

// =============================================================================
// SLOT RUNNER
// =============================================================================

pub struct SlotRunner<'a> {
    config: &'a InferenceConfig,
    specs: &'a ExpandedSpecs,
    evaluator: LikelihoodEvaluator<'a>,
    simulator: &'a dyn Simulator,
    store: &'a ArtifactStore,
    settings: RunSettings,
    slot: usize,
    window: FittingWindow,
    targets: Vec<String>,
}

impl<'a> SlotRunner<'a> {
    pub fn new(
        config: &'a InferenceConfig,
        specs: &'a ExpandedSpecs,
        observations: &'a ObservationBundle,
        simulator: &'a dyn Simulator,
        store: &'a ArtifactStore,
        settings: RunSettings,
        slot: usize,
    ) -> Result<Self, InferenceError> {
        let evaluator = LikelihoodEvaluator::new(config, specs, observations)
            .map_err(InferenceError::Config)?;
        let targets = config.inference.statistics.iter().map(|s| s.name.clone()).collect();
        Ok(Self {
            config,
            specs,
            evaluator,
            simulator,
            store,
            settings,
            slot,
            window: config.window(),
            targets,
        })
    }

    /// Run `iterations` MCMC iterations and promote final artifacts.
    pub fn run(&mut self) -> Result<SlotSummary, InferenceError> {
        let k = self.settings.iterations;
        let base = (self.settings.block - 1) * k;
        let mut state = if self.settings.resume && self.settings.block > 1 {
            self.resume_state(base)?
        } else {
            self.initial_state(base)?
        };
        info!(
            slot = self.slot,
            block = self.settings.block,
            iterations = k,
            resumed = self.settings.resume && self.settings.block > 1,
            "slot started"
        );

        for local in 1..=k {
            let iteration = base + local;
            state.iteration = iteration;
            self.step(&mut state, iteration)?;
        }

        self.promote_finals(&state)?;
        let summary = SlotSummary {
            slot: self.slot,
            iterations: state.decided(),
            global_acceptance: state.global_rate(),
            chimeric_acceptance: state
                .roster
                .iter()
                .enumerate()
                .map(|(i, s)| (s.clone(), state.chimeric_rate(i)))
                .collect(),
            total_posterior: state.global_score.total_posterior,
            simulator_failures: state.simulator_failures,
            last_accepted_iteration: state.last_accepted_iteration,
        };
        info!(
            slot = self.slot,
            acceptance = summary.global_acceptance,
            total_posterior = summary.total_posterior,
            "slot finished"
        );
        Ok(summary)
    }

    // -- one iteration --------------------------------------------------------

    fn step(&self, state: &mut ChainState, iteration: u64) -> Result<(), InferenceError> {
        let kernel = ProposalKernel::new(self.specs, self.window, self.settings.stochastic);
        let mut proposal_rng =
            rng_for(self.settings.master_seed, self.slot as u64, iteration, RngPurpose::Proposal);
        let proposal = kernel.propose(&state.chimeric, &mut proposal_rng);

        let trajectory = match self.simulate_with_retry(&proposal, iteration) {
            Ok(t) => t,
            Err(e) => return self.reject_failed_simulation(state, iteration, e),
        };

        let score = self.evaluator.evaluate(&proposal, &trajectory);
        if !score.is_usable() {
            self.log_record(iteration, "NumericError", "likelihood evaluated to NaN")?;
            state.record_global(false);
            return self.persist_iteration(state, false, &vec![false; state.roster.len()]);
        }

        let u: f64 = rng_for(
            self.settings.master_seed,
            self.slot as u64,
            iteration,
            RngPurpose::GlobalAccept,
        )
        .gen();
        let alpha =
            accept_probability(score.total_posterior, state.global_score.total_posterior);
        let globally_accepted = u < alpha;
        state.record_global(globally_accepted);

        let reset = self.config.inference.reset_chimeric_on_accept;
        let mut chimeric_flags = vec![false; state.roster.len()];

        if globally_accepted {
            debug!(slot = self.slot, iteration, total = score.total_posterior, "global accept");
            if reset {
                // Adoption counts as a chimeric accept for every subpop.
                for (i, flag) in chimeric_flags.iter_mut().enumerate() {
                    *flag = true;
                    state.record_chimeric(i, true);
                }
            }
            state.adopt_global(proposal.clone(), score.clone(), trajectory, reset);
            if !reset {
                self.chimeric_decisions(state, iteration, &proposal, &score, &mut chimeric_flags);
            }
        } else {
            self.chimeric_decisions(state, iteration, &proposal, &score, &mut chimeric_flags);
        }

        self.persist_iteration(state, globally_accepted, &chimeric_flags)
    }

    /// Per-subpopulation accept/reject on the chimeric book: local likelihood
    /// plus the subpop-restricted scalar prior, nothing else.
    fn chimeric_decisions(
        &self,
        state: &mut ChainState,
        iteration: u64,
        proposal: &ParamSample,
        score: &Scorecard,
        flags: &mut [bool],
    ) {
        let mut rng = rng_for(
            self.settings.master_seed,
            self.slot as u64,
            iteration,
            RngPurpose::ChimericAccept,
        );
        for i in 0..state.roster.len() {
            let subpop = state.roster[i].clone();
            let new = score.by_subpop[i] + self.evaluator.local_log_prior(proposal, &subpop);
            let cur =
                state.chimeric_ll[i] + self.evaluator.local_log_prior(&state.chimeric, &subpop);
            let u: f64 = rng.gen();
            let accepted = u < accept_probability(new, cur);
            state.record_chimeric(i, accepted);
            if accepted {
                state.adopt_chimeric_subpop(i, proposal, score.by_subpop[i]);
                flags[i] = true;
            }
        }
    }

    // -- simulation -----------------------------------------------------------

    fn simulate_once(
        &self,
        theta: &ParamSample,
        iteration: u64,
        purpose: RngPurpose,
    ) -> Result<Trajectory, SimulatorError> {
        let mut rng = rng_for(self.settings.master_seed, self.slot as u64, iteration, purpose);
        let roster = self.evaluator.roster();
        let mut ctx = SimulationContext {
            window: &self.window,
            subpops: roster,
            targets: &self.targets,
            stochastic: self.settings.stochastic,
            rng: &mut rng,
        };
        let trajectory = self.simulator.simulate(theta, &mut ctx)?;
        trajectory.validate(roster, &self.targets, &self.window)?;
        Ok(trajectory)
    }

    fn simulate_with_retry(
        &self,
        theta: &ParamSample,
        iteration: u64,
    ) -> Result<Trajectory, SimulatorError> {
        match self.simulate_once(theta, iteration, RngPurpose::Simulator) {
            Ok(t) => Ok(t),
            Err(first) => {
                warn!(slot = self.slot, iteration, error = %first, "simulator failed; retrying once");
                self.simulate_once(theta, iteration, RngPurpose::SimulatorRetry)
            }
        }
    }

    fn reject_failed_simulation(
        &self,
        state: &mut ChainState,
        iteration: u64,
        error: SimulatorError,
    ) -> Result<(), InferenceError> {
        state.simulator_failures += 1;
        self.log_record(iteration, "SimulatorError", &error.to_string())?;
        if state.simulator_failures > self.config.inference.simulator_failure_limit {
            return Err(InferenceError::SimulatorLimit {
                slot: self.slot,
                iteration,
                failures: state.simulator_failures,
                last: error,
            });
        }
        state.record_global(false);
        // Previous global artifacts are re-persisted at this index.
        self.persist_iteration(state, false, &vec![false; state.roster.len()])
    }

    // -- state construction ---------------------------------------------------

    fn initial_state(&self, base: u64) -> Result<ChainState, InferenceError> {
        let prior = PriorEvaluator::new(self.specs);
        let mut rng =
            rng_for(self.settings.master_seed, self.slot as u64, base, RngPurpose::Init);
        let theta = prior.draw_initial(&mut rng);

        let trajectory = self
            .simulate_with_retry(&theta, base)
            .map_err(|e| InferenceError::SimulatorAtInit { slot: self.slot, source: e })?;
        let score = self.evaluator.evaluate(&theta, &trajectory);
        if !score.is_usable() {
            return Err(InferenceError::Numeric {
                slot: self.slot,
                iteration: base,
                detail: "initial sample scored NaN".to_string(),
            });
        }

        let state = ChainState::initial(
            self.evaluator.roster().to_vec(),
            theta,
            score,
            trajectory,
            self.settings.block,
            base,
        );
        // Iteration 0 is conceptually accepted and persisted on both streams.
        if self.settings.block == 1 {
            self.persist_iteration(&state, true, &vec![true; state.roster.len()])?;
        }
        Ok(state)
    }

    fn resume_state(&self, base: u64) -> Result<ChainState, InferenceError> {
        let into = |e| InferenceError::Resume { slot: self.slot, source: e };
        let template = ParamSample::from_specs(self.specs);
        let global = self
            .store
            .load_final_sample(Stream::Global, self.slot, &template)
            .map_err(into)?;
        let chimeric = self
            .store
            .load_final_sample(Stream::Chimeric, self.slot, &template)
            .map_err(into)?;
        let global_rows = self
            .store
            .load_final_likelihood(Stream::Global, self.slot)
            .map_err(into)?;
        let chimeric_rows = self
            .store
            .load_final_likelihood(Stream::Chimeric, self.slot)
            .map_err(into)?;
        let trajectory = self
            .store
            .load_final_trajectory(self.slot, self.window)
            .map_err(into)?;

        let roster = self.evaluator.roster().to_vec();
        let find = |rows: &[LikelihoodRow], subpop: &str| -> Result<LikelihoodRow, InferenceError> {
            rows.iter().find(|r| r.subpop == subpop).cloned().ok_or_else(|| {
                InferenceError::Resume {
                    slot: self.slot,
                    source: crate::inference::error::ResumeError::Inconsistent {
                        detail: format!("no likelihood row for subpopulation `{}`", subpop),
                    },
                }
            })
        };

        let mut by_subpop = Vec::with_capacity(roster.len());
        let mut chimeric_ll = Vec::with_capacity(roster.len());
        let mut chimeric_accepts = Vec::with_capacity(roster.len());
        let mut total_posterior = None;
        let mut global_accepts = 0;
        let mut decided = 0;
        for subpop in &roster {
            let g = find(&global_rows, subpop)?;
            let c = find(&chimeric_rows, subpop)?;
            by_subpop.push(g.ll);
            total_posterior = total_posterior.or(g.total_posterior);
            global_accepts = g.accepts;
            decided = g.iterations;
            chimeric_ll.push(c.ll);
            chimeric_accepts.push(c.accepts);
        }
        let total_posterior = total_posterior.ok_or_else(|| InferenceError::Resume {
            slot: self.slot,
            source: crate::inference::error::ResumeError::Inconsistent {
                detail: "global likelihood artifact lacks a total posterior".to_string(),
            },
        })?;

        // Reconstruct the scorecard around the persisted totals; the residual
        // regularization component falls out of the persisted total.
        let prior = self.evaluator.prior().log_prior(&global);
        let sum: f64 = by_subpop.iter().sum();
        let score = Scorecard {
            by_subpop,
            log_prior: prior,
            hierarchical: 0.0,
            regularization: total_posterior - sum - prior,
            total_posterior,
        };

        let mut state = ChainState::initial(
            roster,
            global,
            score,
            trajectory,
            self.settings.block,
            base,
        );
        state.chimeric = chimeric;
        state.chimeric_ll = chimeric_ll;
        state.restore_counters(global_accepts, decided, chimeric_accepts);
        Ok(state)
    }

    // -- persistence ----------------------------------------------------------

    fn persist_iteration(
        &self,
        state: &ChainState,
        global_accept: bool,
        chimeric_flags: &[bool],
    ) -> Result<(), InferenceError> {
        let slot = self.slot;
        let block = self.settings.block;
        let iteration = state.iteration;
        let wrap = |e| InferenceError::Persistence { slot, source: e };

        self.store
            .write_sample(Stream::Global, slot, block, iteration, &state.global)
            .map_err(wrap)?;
        let global_rows: Vec<LikelihoodRow> = state
            .roster
            .iter()
            .enumerate()
            .map(|(i, subpop)| LikelihoodRow {
                subpop: subpop.clone(),
                ll: state.global_score.by_subpop[i],
                accept: u8::from(global_accept),
                accept_avg: state.global_rate(),
                accepts: state.global_accepts(),
                iterations: state.decided(),
                total_posterior: Some(state.global_score.total_posterior),
            })
            .collect();
        self.store
            .write_likelihood(Stream::Global, slot, block, iteration, &global_rows)
            .map_err(wrap)?;
        self.store
            .write_trajectory(slot, block, iteration, &state.global_trajectory)
            .map_err(wrap)?;

        self.store
            .write_sample(Stream::Chimeric, slot, block, iteration, &state.chimeric)
            .map_err(wrap)?;
        let chimeric_rows: Vec<LikelihoodRow> = state
            .roster
            .iter()
            .enumerate()
            .map(|(i, subpop)| LikelihoodRow {
                subpop: subpop.clone(),
                ll: state.chimeric_ll[i],
                accept: u8::from(chimeric_flags.get(i).copied().unwrap_or(false)),
                accept_avg: state.chimeric_rate(i),
                accepts: state.chimeric_accepts(i),
                iterations: state.decided(),
                total_posterior: None,
            })
            .collect();
        self.store
            .write_likelihood(Stream::Chimeric, slot, block, iteration, &chimeric_rows)
            .map_err(wrap)?;
        Ok(())
    }

    fn promote_finals(&self, state: &ChainState) -> Result<(), InferenceError> {
        let slot = self.slot;
        let block = self.settings.block;
        let iteration = state.iteration;
        let wrap = |e| InferenceError::Persistence { slot, source: e };
        let param_kinds = [
            ArtifactKind::SeirModifiers,
            ArtifactKind::OutcomeModifiers,
            ArtifactKind::OutcomeParameters,
            ArtifactKind::Seeding,
            ArtifactKind::InitialConditions,
        ];
        for kind in param_kinds {
            self.store
                .promote_final(Stream::Global, kind, slot, block, iteration)
                .map_err(wrap)?;
            self.store
                .promote_final(Stream::Chimeric, kind, slot, block, iteration)
                .map_err(wrap)?;
        }
        for kind in [
            ArtifactKind::Likelihood,
            ArtifactKind::TrajectoryOutcome,
            ArtifactKind::TrajectoryInfection,
        ] {
            self.store
                .promote_final(Stream::Global, kind, slot, block, iteration)
                .map_err(wrap)?;
        }
        self.store
            .promote_final(Stream::Chimeric, ArtifactKind::Likelihood, slot, block, iteration)
            .map_err(wrap)?;
        Ok(())
    }

    fn log_record(&self, iteration: u64, kind: &str, detail: &str) -> Result<(), InferenceError> {
        self.store
            .append_log(
                self.slot,
                &RunLogRecord {
                    iteration,
                    kind: kind.to_string(),
                    subpop: None,
                    detail: detail.to_string(),
                },
            )
            .map_err(|e| InferenceError::Persistence { slot: self.slot, source: e })
    }
}

// =============================================================================
// MULTI-SLOT ENTRY POINT
// =============================================================================

/// Run several slots, optionally in parallel. Slots share only read-only
/// inputs; each failure carries its slot index.
pub fn run_slots(
    config: &InferenceConfig,
    specs: &ExpandedSpecs,
    observations: &ObservationBundle,
    simulator: &dyn Simulator,
    store: &ArtifactStore,
    settings: &RunSettings,
    slots: &[usize],
    jobs: usize,
) -> Result<Vec<SlotSummary>, InferenceError> {
    let run_one = |&slot: &usize| -> Result<SlotSummary, InferenceError> {
        SlotRunner::new(config, specs, observations, simulator, store, settings.clone(), slot)?
            .run()
    };
    if jobs <= 1 || slots.len() <= 1 {
        return slots.iter().map(run_one).collect();
    }
    match rayon::ThreadPoolBuilder::new().num_threads(jobs).build() {
        Ok(pool) => pool.install(|| slots.par_iter().map(run_one).collect()),
        Err(e) => {
            warn!(error = %e, "thread pool unavailable; running slots sequentially");
            slots.iter().map(run_one).collect()
        }
    }
}
