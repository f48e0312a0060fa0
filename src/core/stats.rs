// SPDX-License-Identifier: MIT

//! Iteration statistics and trend classification

use super::session::{ExecutionStats, IterationStatus, Recommendation, Trend};

const TREND_WINDOW: usize = 3;

/// Accumulates iteration statuses and derives [`ExecutionStats`]
#[derive(Debug, Clone, Default)]
pub struct StatsAccumulator {
    statuses: Vec<IterationStatus>,
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, status: IterationStatus) {
        self.statuses.push(status);
    }

    pub fn reset(&mut self) {
        self.statuses.clear();
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Snapshot of the statistics over everything recorded so far
    pub fn snapshot(&self) -> ExecutionStats {
        compute_stats(&self.statuses)
    }
}

/// Compute statistics over a status history
pub fn compute_stats(statuses: &[IterationStatus]) -> ExecutionStats {
    if statuses.is_empty() {
        return ExecutionStats::default();
    }

    let count = |wanted: IterationStatus| statuses.iter().filter(|s| **s == wanted).count() as u32;

    let total_completed = statuses.len() as u32;
    let pass_count = count(IterationStatus::Pass);
    let fail_count = count(IterationStatus::Fail);
    let execution_fail_count = count(IterationStatus::ExecutionFail);
    let cancelled_count = count(IterationStatus::Cancelled);
    let valid_tests = total_completed - cancelled_count - execution_fail_count;

    let (pass_rate, fail_rate) = if valid_tests > 0 {
        (
            f64::from(pass_count) / f64::from(valid_tests) * 100.0,
            f64::from(fail_count) / f64::from(valid_tests) * 100.0,
        )
    } else {
        (0.0, 0.0)
    };

    ExecutionStats {
        total_completed,
        pass_count,
        fail_count,
        execution_fail_count,
        cancelled_count,
        valid_tests,
        pass_rate: round_tenth(pass_rate),
        fail_rate: round_tenth(fail_rate),
        recent_trend: recent_trend(statuses, pass_rate, fail_rate),
        recommendation: recommendation(pass_rate, fail_rate, total_completed),
    }
}

/// Enough iterations to draw conclusions from the rates
pub fn has_sufficient_data(pass_rate: f64, fail_rate: f64, total: u32) -> bool {
    total >= 5 || (total >= 3 && (pass_rate >= 95.0 || fail_rate >= 95.0))
}

fn recent_trend(statuses: &[IterationStatus], pass_rate: f64, fail_rate: f64) -> Trend {
    if !has_sufficient_data(pass_rate, fail_rate, statuses.len() as u32) {
        return Trend::InsufficientData;
    }

    let window = &statuses[statuses.len().saturating_sub(TREND_WINDOW)..];
    let fails = window.iter().filter(|s| **s == IterationStatus::Fail).count();
    let passes = window.iter().filter(|s| **s == IterationStatus::Pass).count();

    if fails == TREND_WINDOW && pass_rate < 5.0 {
        Trend::Repro
    } else if passes == TREND_WINDOW && fail_rate < 5.0 {
        Trend::NoRepro
    } else if fails > 1 && passes > 1 {
        Trend::Flaky
    } else if fails == 0 {
        Trend::NoRepro
    } else {
        Trend::Mixed
    }
}

fn recommendation(pass_rate: f64, fail_rate: f64, total: u32) -> Recommendation {
    if total < 3 {
        Recommendation::Continue
    } else if has_sufficient_data(pass_rate, fail_rate, total) {
        if pass_rate >= 90.0 {
            Recommendation::SufficientDataGood
        } else if fail_rate >= 90.0 {
            Recommendation::SufficientDataPoor
        } else {
            Recommendation::Continue
        }
    } else if pass_rate >= 95.0 {
        Recommendation::TrendingExcellent
    } else if fail_rate >= 95.0 {
        Recommendation::TrendingPoor
    } else {
        Recommendation::Continue
    }
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
