//! Ground-Truth Observations
//!
//! Loads the observed time series and holds them on the daily grid of the
//! fitting window. Loading is validate-at-the-door: unknown subpopulations
//! and duplicate rows are rejected outright, missing cells stay missing and
//! propagate as "skip this point" through the likelihood.
//!
//! Input format: CSV with columns `date, subpop, <target>...`; empty cells
//! are explicit nulls. Rows dated outside the fitting window are ignored
//! (ground-truth files routinely cover more than one fit). Days outside the
//! optional ground-truth sub-window are masked to missing after loading.

use crate::inference::config::{InferenceConfig, SubpopId};
use crate::inference::error::ObservationError;
use crate::inference::window::FittingWindow;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::warn;

/// Name reserved for the synthetic sum-across-subpopulations series.
pub const TOTAL_SUBPOP: &str = "Total";

#[derive(Debug, Clone)]
pub struct ObservationBundle {
    window: FittingWindow,
    subpops: Vec<SubpopId>,
    targets: Vec<String>,
    series: BTreeMap<(SubpopId, String), Vec<Option<f64>>>,
}

impl ObservationBundle {
    /// A bundle with every observation missing. Used by tests and by runs
    /// fit against a subset of targets.
    pub fn empty(window: FittingWindow, subpops: Vec<SubpopId>, targets: Vec<String>) -> Self {
        let days = window.num_days();
        let mut series = BTreeMap::new();
        for sp in &subpops {
            for t in &targets {
                series.insert((sp.clone(), t.clone()), vec![None; days]);
            }
        }
        Self { window, subpops, targets, series }
    }

    pub fn window(&self) -> &FittingWindow {
        &self.window
    }

    pub fn subpops(&self) -> &[SubpopId] {
        &self.subpops
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Set one observed value (test/builder convenience).
    pub fn set(&mut self, subpop: &str, target: &str, day: usize, value: f64) {
        if let Some(s) = self.series.get_mut(&(subpop.to_string(), target.to_string())) {
            if day < s.len() {
                s[day] = Some(value);
            }
        }
    }

    pub fn series(&self, subpop: &str, target: &str) -> Option<&[Option<f64>]> {
        self.series
            .get(&(subpop.to_string(), target.to_string()))
            .map(|v| v.as_slice())
    }

    /// Point-wise sum across all real subpopulations; a day is present only
    /// when no subpopulation is missing it.
    pub fn total_series(&self, target: &str) -> Vec<Option<f64>> {
        let days = self.window.num_days();
        let mut out = vec![Some(0.0); days];
        for sp in &self.subpops {
            let Some(series) = self.series(sp, target) else {
                return vec![None; days];
            };
            for (acc, v) in out.iter_mut().zip(series) {
                *acc = match (*acc, v) {
                    (Some(a), Some(b)) => Some(a + b),
                    _ => None,
                };
            }
        }
        out
    }

    /// Load observations for the declared subpopulations and targets.
    pub fn from_csv(path: &Path, config: &InferenceConfig) -> Result<Self, ObservationError> {
        let window = config.window();
        let subpops = config.subpop_ids();
        let targets: Vec<String> = config
            .inference
            .statistics
            .iter()
            .map(|s| s.name.clone())
            .collect();
        let known: BTreeSet<SubpopId> = subpops.iter().cloned().collect();
        let mut bundle = Self::empty(window, subpops, targets.clone());

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_path(path)
            .map_err(|e| ObservationError::Malformed {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;

        let headers = reader
            .headers()
            .map_err(|e| ObservationError::Malformed {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?
            .clone();
        let date_col = position_of(&headers, "date").ok_or_else(|| ObservationError::Malformed {
            path: path.to_path_buf(),
            detail: "missing `date` column".to_string(),
        })?;
        let subpop_col =
            position_of(&headers, "subpop").ok_or_else(|| ObservationError::Malformed {
                path: path.to_path_buf(),
                detail: "missing `subpop` column".to_string(),
            })?;
        let target_cols: Vec<(String, usize)> = targets
            .iter()
            .filter_map(|t| position_of(&headers, t).map(|i| (t.clone(), i)))
            .collect();
        for t in &targets {
            if !target_cols.iter().any(|(name, _)| name == t) {
                warn!(target = %t, "ground-truth file has no column for target; treating as all-missing");
            }
        }

        let mut seen: BTreeSet<(NaiveDate, String)> = BTreeSet::new();
        for (row_idx, record) in reader.records().enumerate() {
            let record = record.map_err(|e| ObservationError::Malformed {
                path: path.to_path_buf(),
                detail: format!("row {}: {}", row_idx + 1, e),
            })?;
            let date_raw = record.get(date_col).unwrap_or("");
            let date = NaiveDate::parse_from_str(date_raw, "%Y-%m-%d").map_err(|_| {
                ObservationError::Malformed {
                    path: path.to_path_buf(),
                    detail: format!("row {}: unparseable date `{}`", row_idx + 1, date_raw),
                }
            })?;
            let subpop = record.get(subpop_col).unwrap_or("").to_string();
            if !known.contains(&subpop) {
                return Err(ObservationError::UnknownSubpop { row: row_idx + 1, subpop });
            }
            let Some(day) = window.index_of(date) else {
                continue;
            };
            if !seen.insert((date, subpop.clone())) {
                return Err(ObservationError::DuplicateRow {
                    date: date.to_string(),
                    subpop,
                });
            }
            for (target, col) in &target_cols {
                let cell = record.get(*col).unwrap_or("").trim();
                if cell.is_empty() || cell.eq_ignore_ascii_case("na") {
                    continue;
                }
                let value: f64 = cell.parse().map_err(|_| ObservationError::Malformed {
                    path: path.to_path_buf(),
                    detail: format!(
                        "row {}: non-numeric value `{}` for target {}",
                        row_idx + 1,
                        cell,
                        target
                    ),
                })?;
                bundle.set(&subpop, target, day, value);
            }
        }

        // Mask days outside the ground-truth comparison window.
        let gt = config.groundtruth_window();
        if gt != window {
            for series in bundle.series.values_mut() {
                for (day, slot) in series.iter_mut().enumerate() {
                    if !gt.contains(window.date_at(day)) {
                        *slot = None;
                    }
                }
            }
        }
        Ok(bundle)
    }
}

fn position_of(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h == name)
}
