//! Fitting Window
//!
//! Inclusive daily date grid over `[start, end]`. Single source of truth for
//! all date<->index arithmetic: the simulator, the statistic extractor, and
//! the observation loader all work against this grid and never do their own
//! calendar math.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

/// Inclusive daily fitting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FittingWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl FittingWindow {
    /// Build a window. `end` must not precede `start`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        if end < start {
            None
        } else {
            Some(Self { start, end })
        }
    }

    /// Number of days in the window, inclusive of both endpoints.
    pub fn num_days(&self) -> usize {
        (self.end - self.start).num_days() as usize + 1
    }

    /// Day index of `date` within the window, if contained.
    pub fn index_of(&self, date: NaiveDate) -> Option<usize> {
        if date < self.start || date > self.end {
            None
        } else {
            Some((date - self.start).num_days() as usize)
        }
    }

    /// Date at day index `idx`. Panics are avoided by clamping to `end`.
    pub fn date_at(&self, idx: usize) -> NaiveDate {
        let d = self.start + Duration::days(idx as i64);
        if d > self.end {
            self.end
        } else {
            d
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Clamp a date into the window.
    pub fn clamp(&self, date: NaiveDate) -> NaiveDate {
        if date < self.start {
            self.start
        } else if date > self.end {
            self.end
        } else {
            date
        }
    }

    /// Iterator over all dates in the window, in order.
    pub fn iter_dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        let days = self.num_days();
        (0..days).map(move |i| self.start + Duration::days(i as i64))
    }

    /// Fixed-length bin edges anchored at `start`: `(start_idx, end_idx)`
    /// half-open day-index ranges of length `bin_days`. A trailing partial
    /// bin is dropped.
    pub fn bin_ranges(&self, bin_days: usize) -> Vec<(usize, usize)> {
        assert!(bin_days > 0, "bin length must be positive");
        let days = self.num_days();
        let mut out = Vec::with_capacity(days / bin_days);
        let mut lo = 0;
        while lo + bin_days <= days {
            out.push((lo, lo + bin_days));
            lo += bin_days;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn index_round_trip() {
        let w = FittingWindow::new(d(2020, 3, 1), d(2020, 3, 31)).unwrap();
        assert_eq!(w.num_days(), 31);
        assert_eq!(w.index_of(d(2020, 3, 1)), Some(0));
        assert_eq!(w.index_of(d(2020, 3, 31)), Some(30));
        assert_eq!(w.index_of(d(2020, 4, 1)), None);
        assert_eq!(w.date_at(15), d(2020, 3, 16));
    }

    #[test]
    fn rejects_inverted_window() {
        assert!(FittingWindow::new(d(2020, 3, 2), d(2020, 3, 1)).is_none());
    }

    #[test]
    fn weekly_bins_drop_trailing_partial() {
        let w = FittingWindow::new(d(2020, 3, 1), d(2020, 3, 31)).unwrap();
        let bins = w.bin_ranges(7);
        assert_eq!(bins.len(), 4); // 31 days -> 4 full weeks, 3 days dropped
        assert_eq!(bins[0], (0, 7));
        assert_eq!(bins[3], (21, 28));
    }

    #[test]
    fn clamp_is_inclusive() {
        let w = FittingWindow::new(d(2020, 3, 1), d(2020, 3, 10)).unwrap();
        assert_eq!(w.clamp(d(2020, 2, 1)), w.start);
        assert_eq!(w.clamp(d(2020, 3, 10)), w.end);
        assert_eq!(w.clamp(d(2020, 5, 1)), w.end);
    }
}
