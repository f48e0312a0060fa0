// SPDX-License-Identifier: MIT

//! Decision policies
//!
//! Every iterative node variant answers two questions: after each iteration,
//! whether to continue, end or cancel ([`decide`]); and once the experiment
//! stopped, which output port the run classifies into ([`classify`]). The
//! hardware-failure override is applied before any variant rule in both.

use serde::{Deserialize, Serialize};

use crate::core::session::{
    ExecutionStats, ExperimentConfig, IterationStatus, Recommendation, Trend,
};
use crate::flow::tracker::{point_count, RecoveryPotential};

use super::types::{PolicyKind, Port};

/// Ratio of execution failures plus cancellations that forces port 3
pub const HARDWARE_FAILURE_THRESHOLD: f64 = 0.40;

/// Default loop count when a Loops experiment omits `Loops`
pub const DEFAULT_LOOPS: u32 = 10;
/// Iteration budget for shmoo experiments
pub const SHMOO_ITERATIONS: u32 = 50;
/// Iteration budget when the test type is not recognised
pub const DEFAULT_MAX_ITERATIONS: u32 = 20;

/// Zero-fail iterations needed before SingleFail calls a run clean
pub const SINGLE_FAIL_CLEAN_ITERATIONS: u32 = 8;
pub const MAJORITY_REPRO_RATE: f64 = 70.0;
pub const MAJORITY_NO_REPRO_RATE: f64 = 30.0;

/// Answer to the session after an iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Continue,
    End,
    Cancel,
}

/// Everything a policy looks at
#[derive(Debug, Clone, Copy)]
pub struct PolicyInput<'a> {
    pub stats: &'a ExecutionStats,
    /// Statuses the node recorded, oldest first
    pub statuses: &'a [IterationStatus],
    pub iteration_count: u32,
    pub max_iterations: u32,
    /// The session flagged an iteration as flow-stopping
    pub aborted: bool,
    pub recovery: RecoveryPotential,
}

impl PolicyInput<'_> {
    fn hardware_failure(&self) -> bool {
        self.stats.hardware_failure_ratio() > HARDWARE_FAILURE_THRESHOLD
    }

    fn total(&self) -> u32 {
        self.stats.total_completed
    }
}

/// Iteration budget derived from the node's test type
pub fn max_iterations(config: &ExperimentConfig) -> u32 {
    match config.get_str("Test Type").map(str::trim) {
        Some(t) if t.eq_ignore_ascii_case("loops") => config
            .get_f64("Loops")
            .filter(|n| *n >= 1.0)
            .map(|n| n as u32)
            .unwrap_or(DEFAULT_LOOPS),
        Some(t) if t.eq_ignore_ascii_case("sweep") => sweep_point_count(config),
        Some(t) if t.eq_ignore_ascii_case("shmoo") => SHMOO_ITERATIONS,
        _ => DEFAULT_MAX_ITERATIONS,
    }
}

/// Number of points a Start/End/Steps sweep visits, at least 1
pub fn sweep_point_count(config: &ExperimentConfig) -> u32 {
    let (Some(start), Some(end), Some(step)) = (
        config.get_f64("Start"),
        config.get_f64("End"),
        config.get_f64("Steps"),
    ) else {
        return 1;
    };
    point_count(start, end, step)
}

/// Continue / end / cancel after an iteration
pub fn decide(kind: PolicyKind, input: &PolicyInput<'_>) -> Decision {
    if kind.is_terminal() {
        return Decision::End;
    }
    if input.aborted {
        return Decision::Cancel;
    }
    if let Some(decision) = base_decision(kind, input) {
        return decision;
    }

    let total = input.total();
    let trend = input.stats.recent_trend;
    let stop = match kind {
        PolicyKind::SingleFail => {
            (input.stats.fail_count >= 1 && total >= 5)
                || (trend == Trend::Repro && total >= 3)
                || (input.stats.fail_count == 0 && total >= SINGLE_FAIL_CLEAN_ITERATIONS)
        }
        PolicyKind::AllFail => {
            (total >= 5 && matches!(trend, Trend::Repro | Trend::NoRepro))
                || (total >= 10 && matches!(trend, Trend::Flaky | Trend::Mixed))
                || total >= 15
        }
        PolicyKind::MajorityFail => {
            (total >= 10 && matches!(trend, Trend::Repro | Trend::NoRepro)) || total >= 15
        }
        PolicyKind::Adaptive => match input.recovery {
            RecoveryPotential::High => trend == Trend::NoRepro && total >= 3,
            RecoveryPotential::Low => trend == Trend::Repro && total >= 5,
            _ => false,
        },
        PolicyKind::Start | PolicyKind::End => true,
    };

    if stop {
        Decision::End
    } else {
        Decision::Continue
    }
}

fn base_decision(kind: PolicyKind, input: &PolicyInput<'_>) -> Option<Decision> {
    if input.hardware_failure() {
        log::warn!(
            "Hardware failure ratio {:.0}% exceeds threshold, ending experiment",
            input.stats.hardware_failure_ratio() * 100.0
        );
        return Some(Decision::End);
    }
    // SingleFail keeps going to reach its clean-iteration bar
    if kind != PolicyKind::SingleFail && input.stats.recommendation.is_sufficient() {
        return Some(Decision::End);
    }
    if input.iteration_count >= input.max_iterations {
        return Some(Decision::End);
    }
    None
}

/// Output port for a finished iterative run
pub fn classify(kind: PolicyKind, input: &PolicyInput<'_>) -> Port {
    if input.hardware_failure() || input.aborted || input.total() == 0 {
        return Port::HardwareFailure;
    }

    let stats = input.stats;
    match kind {
        PolicyKind::SingleFail => {
            if stats.fail_count > 0 && (stats.total_completed >= 5 || stats.recent_trend == Trend::Repro)
            {
                Port::Repro
            } else if stats.fail_count == 0 && stats.total_completed >= SINGLE_FAIL_CLEAN_ITERATIONS {
                Port::NoRepro
            } else {
                Port::Intermittent
            }
        }
        PolicyKind::AllFail => {
            let valid = stats.pass_count + stats.fail_count;
            if valid == 0 {
                Port::HardwareFailure
            } else if stats.fail_count == valid {
                Port::Repro
            } else if stats.pass_count == valid {
                Port::NoRepro
            } else {
                Port::Intermittent
            }
        }
        PolicyKind::MajorityFail => match fail_rate(stats, input.statuses) {
            None => Port::HardwareFailure,
            Some(rate) if rate >= MAJORITY_REPRO_RATE => Port::Repro,
            Some(rate) if rate <= MAJORITY_NO_REPRO_RATE => Port::NoRepro,
            Some(_) => Port::Intermittent,
        },
        PolicyKind::Adaptive => match (stats.recommendation, stats.recent_trend) {
            (Recommendation::SufficientDataPoor, _) | (_, Trend::Repro) => Port::Repro,
            (Recommendation::SufficientDataGood, _) | (_, Trend::NoRepro) => Port::NoRepro,
            _ => Port::Intermittent,
        },
        // terminal nodes are routed by the node itself
        PolicyKind::Start | PolicyKind::End => Port::Repro,
    }
}

/// Fail rate in percent of valid tests. Falls back to the recorded history when
/// the session's statistics carry no valid tests.
fn fail_rate(stats: &ExecutionStats, statuses: &[IterationStatus]) -> Option<f64> {
    if stats.valid_tests > 0 {
        return Some(stats.fail_rate);
    }
    let valid = statuses.iter().filter(|s| s.is_valid_test()).count();
    if valid == 0 {
        return None;
    }
    let fails = statuses
        .iter()
        .filter(|s| **s == IterationStatus::Fail)
        .count();
    Some(fails as f64 / valid as f64 * 100.0)
}
