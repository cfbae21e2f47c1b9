//! Integration tests for the likelihood evaluator.
//!
//! These tests verify:
//! 1. Family terms against hand-computed values
//! 2. Zero handling: `add_one` bins contribute exactly 0
//! 3. Zero-data robustness: all-missing targets score 0, never NaN
//! 4. Regularization terms (forecast tail, aggregate series)
//! 5. The per-subpop vs total views stay consistent

use crate::inference::config::{InferenceConfig, StatisticConfig};
use crate::inference::likelihood::{series_log_likelihood, LikelihoodEvaluator};
use crate::inference::observations::ObservationBundle;
use crate::inference::params::{ExpandedSpecs, ParamSample};
use crate::inference::simulator::Trajectory;
use crate::inference::statistics::{AggregatedBin, AggregatedSeries};
use chrono::NaiveDate;

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 3, day).unwrap()
}

fn stat(toml_src: &str) -> StatisticConfig {
    toml::from_str(toml_src).unwrap()
}

fn series(values: &[(f64, bool)]) -> AggregatedSeries {
    AggregatedSeries {
        bins: values
            .iter()
            .enumerate()
            .map(|(i, (value, present))| AggregatedBin {
                start: d(1 + i as u32),
                end: d(1 + i as u32),
                value: *value,
                present: *present,
            })
            .collect(),
    }
}

fn modeled(values: &[f64]) -> AggregatedSeries {
    series(&values.iter().map(|v| (*v, true)).collect::<Vec<_>>())
}

#[test]
fn poisson_term_matches_hand_value() {
    let stat = stat(r#"
        name = "incidC"
        likelihood = { family = "poisson" }
    "#);
    let obs = series(&[(5.0, true)]);
    let model = modeled(&[6.0]);
    let got = series_log_likelihood(&stat, 1.0, &obs, &model, 0..1);
    let expected = 5.0 * 6.0_f64.ln() - 6.0 - 120.0_f64.ln(); // ln(5!) = ln 120
    assert!((got - expected).abs() < 1e-10, "got {} expected {}", got, expected);
}

#[test]
fn poisson_zero_data_nonzero_model_is_minus_rate() {
    let stat = stat(r#"
        name = "incidC"
        likelihood = { family = "poisson" }
    "#);
    let got = series_log_likelihood(&stat, 1.0, &series(&[(0.0, true)]), &modeled(&[3.5]), 0..1);
    assert!((got + 3.5).abs() < 1e-12);
}

#[test]
fn poisson_positive_data_zero_model_is_neg_infinity() {
    let stat = stat(r#"
        name = "incidC"
        likelihood = { family = "poisson" }
    "#);
    let got = series_log_likelihood(&stat, 1.0, &series(&[(2.0, true)]), &modeled(&[0.0]), 0..1);
    assert_eq!(got, f64::NEG_INFINITY);
}

#[test]
fn negative_binomial_term_matches_hand_value() {
    let stat = stat(r#"
        name = "incidC"
        likelihood = { family = "negative_binomial", dispersion = 5.0 }
    "#);
    let got = series_log_likelihood(&stat, 1.0, &series(&[(3.0, true)]), &modeled(&[2.0]), 0..1);
    // ln Γ(8) - ln Γ(5) - ln Γ(4) + 5 ln(5/7) + 3 ln(2/7)
    let expected = 5040.0_f64.ln() - 24.0_f64.ln() - 6.0_f64.ln()
        + 5.0 * (5.0_f64 / 7.0).ln()
        + 3.0 * (2.0_f64 / 7.0).ln();
    assert!((got - expected).abs() < 1e-9, "got {} expected {}", got, expected);
}

#[test]
fn heteroskedastic_sd_uses_floor_below_it() {
    let floored = stat(r#"
        name = "incidC"
        likelihood = { family = "normal_heteroskedastic", cov = 0.5 }
    "#);
    // Z = 0.25 is under the floor of 1.0, so sd = 0.5 * 1.0.
    let got =
        series_log_likelihood(&floored, 1.0, &series(&[(1.0, true)]), &modeled(&[0.25]), 0..1);
    let fixed = stat(r#"
        name = "incidC"
        likelihood = { family = "normal_homoskedastic", sd = 0.5 }
    "#);
    let expected =
        series_log_likelihood(&fixed, 1.0, &series(&[(1.0, true)]), &modeled(&[0.25]), 0..1);
    assert!((got - expected).abs() < 1e-12);
}

#[test]
fn add_one_makes_empty_bins_exactly_zero() {
    let stat = stat(r#"
        name = "incidC"
        add_one = true
        likelihood = { family = "normal_homoskedastic", sd = 0.1 }
    "#);
    let got = series_log_likelihood(&stat, 1.0, &series(&[(0.0, true)]), &modeled(&[0.0]), 0..1);
    assert_eq!(got, 0.0);
    // Without the flag the normal density at sd 0.1 is decidedly non-zero.
    let without = stat_clone_without_add_one();
    let base =
        series_log_likelihood(&without, 1.0, &series(&[(0.0, true)]), &modeled(&[0.0]), 0..1);
    assert!(base != 0.0);
}

fn stat_clone_without_add_one() -> StatisticConfig {
    stat(r#"
        name = "incidC"
        likelihood = { family = "normal_homoskedastic", sd = 0.1 }
    "#)
}

#[test]
fn missing_bins_are_skipped() {
    let stat = stat(r#"
        name = "incidC"
        likelihood = { family = "absolute_error" }
    "#);
    let obs = series(&[(10.0, true), (99.0, false), (12.0, true)]);
    let model = modeled(&[11.0, 11.0, 11.0]);
    let got = series_log_likelihood(&stat, 1.0, &obs, &model, 0..3);
    assert!((got + 2.0).abs() < 1e-12); // |10-11| + |12-11|, middle bin skipped
}

#[test]
fn rmse_over_present_bins_only() {
    let stat = stat(r#"
        name = "incidC"
        likelihood = { family = "rmse" }
    "#);
    let obs = series(&[(3.0, true), (0.0, false), (7.0, true)]);
    let model = modeled(&[0.0, 100.0, 3.0]);
    let got = series_log_likelihood(&stat, 1.0, &obs, &model, 0..3);
    let expected = -((9.0 + 16.0) / 2.0_f64).sqrt();
    assert!((got - expected).abs() < 1e-12);
}

#[test]
fn rmse_with_no_present_bins_is_zero() {
    let stat = stat(r#"
        name = "incidC"
        likelihood = { family = "rmse" }
    "#);
    let obs = series(&[(0.0, false), (0.0, false)]);
    let got = series_log_likelihood(&stat, 1.0, &obs, &modeled(&[1.0, 2.0]), 0..2);
    assert_eq!(got, 0.0);
}

// -----------------------------------------------------------------------------
// Evaluator-level tests
// -----------------------------------------------------------------------------

fn two_subpop_config(extra_inference: &str) -> InferenceConfig {
    let src = format!(
        r#"
        start_date = "2020-03-01"
        end_date = "2020-03-03"

        [[subpopulations]]
        id = "A"
        population = 100000.0

        [[subpopulations]]
        id = "B"
        population = 50000.0

        [inference]
        iterations_per_slot = 10
        {extra_inference}

        [[inference.statistics]]
        name = "incidC"
        likelihood = {{ family = "poisson" }}
        "#
    );
    let config: InferenceConfig = toml::from_str(&src).unwrap();
    config.validate().unwrap();
    config
}

fn constant_trajectory(config: &InferenceConfig, value: f64) -> Trajectory {
    let window = config.window();
    let mut traj = Trajectory::new(window);
    for sp in &config.subpopulations {
        traj.set_outcome(&sp.id, "incidC", vec![value; window.num_days()]);
    }
    traj
}

#[test]
fn all_missing_observations_score_exactly_zero() {
    let config = two_subpop_config("");
    let specs = ExpandedSpecs::from_config(&config).unwrap();
    let obs = ObservationBundle::empty(
        config.window(),
        config.subpop_ids(),
        vec!["incidC".to_string()],
    );
    let evaluator = LikelihoodEvaluator::new(&config, &specs, &obs).unwrap();
    let theta = ParamSample::from_specs(&specs);
    let score = evaluator.evaluate(&theta, &constant_trajectory(&config, 4.0));
    assert!(score.is_usable());
    assert_eq!(score.by_subpop, vec![0.0, 0.0]);
    assert_eq!(score.total_posterior, 0.0);
}

#[test]
fn total_is_sum_of_views_plus_terms() {
    let config = two_subpop_config("");
    let specs = ExpandedSpecs::from_config(&config).unwrap();
    let mut obs = ObservationBundle::empty(
        config.window(),
        config.subpop_ids(),
        vec!["incidC".to_string()],
    );
    for day in 0..3 {
        obs.set("A", "incidC", day, 4.0);
        obs.set("B", "incidC", day, 6.0);
    }
    let evaluator = LikelihoodEvaluator::new(&config, &specs, &obs).unwrap();
    let theta = ParamSample::from_specs(&specs);
    let score = evaluator.evaluate(&theta, &constant_trajectory(&config, 5.0));
    assert!(score.is_usable());
    let sum: f64 = score.by_subpop.iter().sum();
    let rebuilt = sum + score.log_prior + score.hierarchical + score.regularization;
    assert!((score.total_posterior - rebuilt).abs() < 1e-12);
    assert!(score.by_subpop[0] < 0.0 && score.by_subpop[1] < 0.0);
}

#[test]
fn aggregate_term_scales_with_multiplier_only() {
    let config_base = two_subpop_config("incl_aggr_likelihood = true\ntotal_ll_multiplier = 1.0");
    let config_double = two_subpop_config("incl_aggr_likelihood = true\ntotal_ll_multiplier = 2.0");
    let specs = ExpandedSpecs::from_config(&config_base).unwrap();
    let mut obs = ObservationBundle::empty(
        config_base.window(),
        config_base.subpop_ids(),
        vec!["incidC".to_string()],
    );
    for day in 0..3 {
        obs.set("A", "incidC", day, 4.0);
        obs.set("B", "incidC", day, 6.0);
    }
    let theta = ParamSample::from_specs(&specs);
    let traj = constant_trajectory(&config_base, 5.0);

    let base = LikelihoodEvaluator::new(&config_base, &specs, &obs)
        .unwrap()
        .evaluate(&theta, &traj);
    let double = LikelihoodEvaluator::new(&config_double, &specs, &obs)
        .unwrap()
        .evaluate(&theta, &traj);

    // Per-subpop views are untouched by the aggregate multiplier.
    assert_eq!(base.by_subpop, double.by_subpop);
    assert!((double.regularization - 2.0 * base.regularization).abs() < 1e-9);
}

#[test]
fn forecast_regularization_adds_weighted_tail() {
    let src = r#"
        start_date = "2020-03-01"
        end_date = "2020-03-03"

        [[subpopulations]]
        id = "A"
        population = 100000.0

        [inference]
        iterations_per_slot = 10

        [[inference.statistics]]
        name = "incidC"
        likelihood = { family = "poisson" }

        [[inference.statistics.regularize]]
        kind = "forecast"
        last_n = 1
        weight = 3.0
    "#;
    let config: InferenceConfig = toml::from_str(src).unwrap();
    config.validate().unwrap();
    let specs = ExpandedSpecs::from_config(&config).unwrap();
    let mut obs = ObservationBundle::empty(
        config.window(),
        config.subpop_ids(),
        vec!["incidC".to_string()],
    );
    for day in 0..3 {
        obs.set("A", "incidC", day, 4.0);
    }
    let evaluator = LikelihoodEvaluator::new(&config, &specs, &obs).unwrap();
    let theta = ParamSample::from_specs(&specs);
    let score = evaluator.evaluate(&theta, &constant_trajectory(&config, 5.0));

    // (weight - 1) times the last bin's own term.
    let last_term = 4.0 * 5.0_f64.ln() - 5.0 - 24.0_f64.ln();
    assert!((score.regularization - 2.0 * last_term).abs() < 1e-9);
}
