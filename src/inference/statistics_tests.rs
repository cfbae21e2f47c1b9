//! Integration tests for the statistic extractor.

use crate::inference::config::StatisticConfig;
use crate::inference::statistics::{extract_modeled, extract_observed};
use crate::inference::window::FittingWindow;
use chrono::NaiveDate;

fn window(days: u32) -> FittingWindow {
    let start = NaiveDate::from_ymd_opt(2020, 3, 1).unwrap();
    let end = NaiveDate::from_ymd_opt(2020, 3, days).unwrap();
    FittingWindow::new(start, end).unwrap()
}

fn stat(toml_src: &str) -> StatisticConfig {
    toml::from_str(toml_src).unwrap()
}

#[test]
fn daily_is_identity() {
    let w = window(4);
    let stat = stat(r#"
        name = "incidC"
        likelihood = { family = "poisson" }
    "#);
    let out = extract_modeled(&[1.0, 2.0, 3.0, 4.0], &w, &stat).unwrap();
    assert_eq!(out.len(), 4);
    assert_eq!(out.bins[2].value, 3.0);
    assert!(out.bins.iter().all(|b| b.present));
    assert_eq!(out.bins[0].start, out.bins[0].end);
}

#[test]
fn weekly_sums_and_drops_trailing_partial() {
    let w = window(10); // one full week + 3 days
    let stat = stat(r#"
        name = "incidC"
        period = "weekly"
        likelihood = { family = "poisson" }
    "#);
    let series: Vec<f64> = (1..=10).map(|v| v as f64).collect();
    let out = extract_modeled(&series, &w, &stat).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out.bins[0].value, 28.0); // 1+..+7
    assert_eq!(out.bins[0].start, w.start);
    assert_eq!(out.bins[0].end, w.date_at(6));
}

#[test]
fn custom_bins_with_mean_aggregator() {
    let w = window(6);
    let stat = stat(r#"
        name = "incidC"
        period = { days = 3 }
        aggregator = "mean"
        likelihood = { family = "poisson" }
    "#);
    let out = extract_modeled(&[3.0, 6.0, 9.0, 1.0, 2.0, 3.0], &w, &stat).unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(out.bins[0].value, 6.0);
    assert_eq!(out.bins[1].value, 2.0);
}

#[test]
fn observed_bin_with_any_missing_day_is_missing() {
    let w = window(6);
    let stat = stat(r#"
        name = "incidC"
        period = { days = 3 }
        likelihood = { family = "poisson" }
    "#);
    let series = vec![Some(1.0), None, Some(3.0), Some(1.0), Some(1.0), Some(1.0)];
    let out = extract_observed(&series, &w, &stat).unwrap();
    assert_eq!(out.len(), 2);
    assert!(!out.bins[0].present);
    assert!(out.bins[1].present);
    assert_eq!(out.bins[1].value, 3.0);
}

#[test]
fn identical_inputs_identical_outputs() {
    let w = window(7);
    let stat = stat(r#"
        name = "incidC"
        period = "weekly"
        likelihood = { family = "poisson" }
    "#);
    let series = vec![Some(2.0); 7];
    let a = extract_observed(&series, &w, &stat).unwrap();
    let b = extract_observed(&series, &w, &stat).unwrap();
    assert_eq!(a, b);
}
