//! Integration tests for chain state bookkeeping.

use crate::inference::chain::ChainState;
use crate::inference::config::InferenceConfig;
use crate::inference::likelihood::Scorecard;
use crate::inference::params::{ExpandedSpecs, ParamSample};
use crate::inference::simulator::Trajectory;

fn state_with_two_subpops() -> (ChainState, ParamSample, ExpandedSpecs) {
    let src = r#"
        start_date = "2020-03-01"
        end_date = "2020-03-05"

        [[subpopulations]]
        id = "A"
        population = 1000.0

        [[subpopulations]]
        id = "B"
        population = 1000.0

        [[seir_modifiers]]
        name = "lockdown"
        value = 0.5
        lower = 0.0
        upper = 1.0
        perturbation = { dist = "normal", sd = 0.1 }

        [inference]
        iterations_per_slot = 10
    "#;
    let config: InferenceConfig = toml::from_str(src).unwrap();
    config.validate().unwrap();
    let specs = ExpandedSpecs::from_config(&config).unwrap();
    let theta = ParamSample::from_specs(&specs);
    let score = Scorecard {
        by_subpop: vec![-10.0, -20.0],
        log_prior: 0.0,
        hierarchical: 0.0,
        regularization: 0.0,
        total_posterior: -30.0,
    };
    let trajectory = Trajectory::new(config.window());
    let state = ChainState::initial(
        config.subpop_ids(),
        theta.clone(),
        score,
        trajectory,
        1,
        0,
    );
    (state, theta, specs)
}

#[test]
fn running_rate_is_cumulative_accepts_over_iterations() {
    let (mut state, _, _) = state_with_two_subpops();
    let decisions = [true, false, true, true, false, false, true, false];
    let mut accepts = 0u64;
    for (k, accepted) in decisions.iter().enumerate() {
        state.record_global(*accepted);
        if *accepted {
            accepts += 1;
        }
        let expected = accepts as f64 / (k as f64 + 1.0);
        assert!((state.global_rate() - expected).abs() < 1e-15);
    }
    assert_eq!(state.global_accepts(), 4);
    assert_eq!(state.decided(), 8);
}

#[test]
fn chimeric_rates_track_per_subpop() {
    let (mut state, _, _) = state_with_two_subpops();
    for _ in 0..4 {
        state.record_global(false);
        state.record_chimeric(0, true);
        state.record_chimeric(1, false);
    }
    assert!((state.chimeric_rate(0) - 1.0).abs() < 1e-15);
    assert_eq!(state.chimeric_rate(1), 0.0);
}

#[test]
fn adopt_chimeric_splices_only_one_subpop() {
    let (mut state, theta, _) = state_with_two_subpops();
    let mut proposal = theta.clone();
    for m in &mut proposal.seir_modifiers {
        m.value = 0.9;
    }
    state.adopt_chimeric_subpop(0, &proposal, -5.0);

    let a = state.chimeric.seir_modifiers.iter().find(|m| m.subpop == "A").unwrap();
    let b = state.chimeric.seir_modifiers.iter().find(|m| m.subpop == "B").unwrap();
    assert_eq!(a.value, 0.9);
    assert_eq!(b.value, 0.5);
    assert_eq!(state.chimeric_ll, vec![-5.0, -20.0]);
    // The global book is untouched.
    assert!(state.global.seir_modifiers.iter().all(|m| m.value == 0.5));
}

#[test]
fn adopt_global_resets_chimeric_when_asked() {
    let (mut state, theta, _) = state_with_two_subpops();
    let mut proposal = theta.clone();
    for m in &mut proposal.seir_modifiers {
        m.value = 0.7;
    }
    let score = Scorecard {
        by_subpop: vec![-1.0, -2.0],
        log_prior: 0.0,
        hierarchical: 0.0,
        regularization: 0.0,
        total_posterior: -3.0,
    };
    let trajectory = state.global_trajectory.clone();
    state.adopt_global(proposal.clone(), score, trajectory, true);
    assert_eq!(state.chimeric, proposal);
    assert_eq!(state.chimeric_ll, vec![-1.0, -2.0]);
    assert_eq!(state.global_score.total_posterior, -3.0);
}

#[test]
fn adopt_global_can_leave_chimeric_alone() {
    let (mut state, theta, _) = state_with_two_subpops();
    let chimeric_before = state.chimeric.clone();
    let ll_before = state.chimeric_ll.clone();
    let mut proposal = theta;
    for m in &mut proposal.seir_modifiers {
        m.value = 0.7;
    }
    let score = Scorecard {
        by_subpop: vec![-1.0, -2.0],
        log_prior: 0.0,
        hierarchical: 0.0,
        regularization: 0.0,
        total_posterior: -3.0,
    };
    let trajectory = state.global_trajectory.clone();
    state.adopt_global(proposal, score, trajectory, false);
    assert_eq!(state.chimeric, chimeric_before);
    assert_eq!(state.chimeric_ll, ll_before);
}
