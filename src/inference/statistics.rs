//! Statistic Extractor
//!
//! Projects a daily series (observed or modeled) onto a target's temporal
//! grid: identity for daily targets, fixed-length bins anchored at the window
//! start otherwise. Missingness propagates bin-wise for observed series; a
//! modeled series is never missing. Identical inputs yield identical outputs.

use crate::inference::config::{Aggregator, StatisticConfig};
use crate::inference::error::ConfigError;
use crate::inference::window::FittingWindow;
use chrono::NaiveDate;

/// One aggregated bin: `[start, end]` inclusive dates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatedBin {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub value: f64,
    /// False when any day of an observed bin was missing; always true for
    /// modeled bins.
    pub present: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AggregatedSeries {
    pub bins: Vec<AggregatedBin>,
}

impl AggregatedSeries {
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }
}

fn day_ranges(window: &FittingWindow, stat: &StatisticConfig) -> Result<Vec<(usize, usize)>, ConfigError> {
    Ok(match stat.period.bin_days()? {
        None => (0..window.num_days()).map(|i| (i, i + 1)).collect(),
        Some(days) => window.bin_ranges(days),
    })
}

fn reduce(values: &[f64], aggregator: Aggregator) -> f64 {
    let sum: f64 = values.iter().sum();
    match aggregator {
        Aggregator::Sum => sum,
        Aggregator::Mean => sum / values.len() as f64,
    }
}

/// Aggregate an observed series. A bin with any missing day is marked
/// not-present with value 0.
pub fn extract_observed(
    series: &[Option<f64>],
    window: &FittingWindow,
    stat: &StatisticConfig,
) -> Result<AggregatedSeries, ConfigError> {
    let mut bins = Vec::new();
    for (lo, hi) in day_ranges(window, stat)? {
        let slice = &series[lo..hi.min(series.len())];
        let complete = slice.iter().all(|v| v.is_some());
        let value = if complete {
            let days: Vec<f64> = slice.iter().map(|v| v.unwrap_or(0.0)).collect();
            reduce(&days, stat.aggregator)
        } else {
            0.0
        };
        bins.push(AggregatedBin {
            start: window.date_at(lo),
            end: window.date_at(hi - 1),
            value,
            present: complete,
        });
    }
    Ok(AggregatedSeries { bins })
}

/// Aggregate a modeled series. Every bin is present.
pub fn extract_modeled(
    series: &[f64],
    window: &FittingWindow,
    stat: &StatisticConfig,
) -> Result<AggregatedSeries, ConfigError> {
    let mut bins = Vec::new();
    for (lo, hi) in day_ranges(window, stat)? {
        let slice = &series[lo..hi.min(series.len())];
        bins.push(AggregatedBin {
            start: window.date_at(lo),
            end: window.date_at(hi - 1),
            value: reduce(slice, stat.aggregator),
            present: true,
        });
    }
    Ok(AggregatedSeries { bins })
}
