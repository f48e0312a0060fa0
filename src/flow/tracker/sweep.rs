// SPDX-License-Identifier: MIT

//! Sweep configuration and sensitivity analysis

use serde::{Deserialize, Serialize};

use crate::core::session::{ExperimentConfig, IterationStatus};

use super::TrackedIteration;

/// What a sweep varies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepKind {
    Voltage,
    Frequency,
}

/// Sweep parameters read from an experiment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    pub kind: SweepKind,
    /// Lower-case domain name, `ia` or `cfc`
    pub domain: String,
    pub start: f64,
    pub end: f64,
    pub step: f64,
    pub voltage_type: Option<String>,
}

impl SweepConfig {
    /// Parse the sweep settings; `None` unless `Test Type` is Sweep
    pub fn from_config(config: &ExperimentConfig) -> Option<Self> {
        let test_type = config.get_str("Test Type")?;
        if !test_type.trim().eq_ignore_ascii_case("sweep") {
            return None;
        }

        let kind = match config.get_str("Type").map(|t| t.trim().to_ascii_lowercase()) {
            Some(t) if t == "frequency" => SweepKind::Frequency,
            _ => SweepKind::Voltage,
        };
        let domain = config
            .get_str("Domain")
            .map(|d| d.trim().to_ascii_lowercase())
            .unwrap_or_else(|| "ia".to_string());

        Some(Self {
            kind,
            domain,
            start: config.get_f64("Start")?,
            end: config.get_f64("End")?,
            step: config.get_f64("Steps")?,
            voltage_type: config.get_str("Voltage Type").map(str::to_string),
        })
    }

    /// Number of points the sweep visits, at least 1
    pub fn point_count(&self) -> u32 {
        point_count(self.start, self.end, self.step)
    }

    /// Value visited at 0-based `index`, `None` past the end of the sweep
    pub fn value_at(&self, index: u32) -> Option<f64> {
        if index >= self.point_count() {
            return None;
        }
        Some(round_millis(self.start + self.step * f64::from(index)))
    }

    /// Values visited by the sweep, in order
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.point_count()).filter_map(|i| self.value_at(i))
    }

    /// Configuration key the swept value lands in, e.g. `Voltage IA`
    pub fn parameter_key(&self) -> String {
        let kind = match self.kind {
            SweepKind::Voltage => "Voltage",
            SweepKind::Frequency => "Frequency",
        };
        format!("{} {}", kind, self.domain.to_ascii_uppercase())
    }
}

/// How failures relate to the swept value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepPattern {
    /// Nothing failed anywhere in the sweep
    NoSensitivity,
    /// Fails below a value, passes above it
    ThresholdSensitivity,
    /// Passes below a value, fails above it
    UpperThresholdSensitivity,
    MixedSensitivity,
}

/// Result of analysing a finished sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepInsights {
    pub parameter_key: String,
    pub pattern: SweepPattern,
    /// Lowest and highest passing value
    pub pass_range: Option<(f64, f64)>,
    /// Values that passed, ascending
    pub safe_values: Vec<f64>,
    pub recommendation: String,
}

impl SweepInsights {
    /// The value a follow-up experiment should use, when the pattern gives one
    pub fn recommended_value(&self) -> Option<f64> {
        match self.pattern {
            SweepPattern::ThresholdSensitivity => self.safe_values.first().copied(),
            SweepPattern::UpperThresholdSensitivity => self.safe_values.last().copied(),
            SweepPattern::NoSensitivity | SweepPattern::MixedSensitivity => None,
        }
    }
}

/// Classify pass/fail behaviour across the swept values
pub fn analyze(sweep: &SweepConfig, iterations: &[TrackedIteration]) -> Option<SweepInsights> {
    let mut passing = Vec::new();
    let mut failing = Vec::new();
    for it in iterations {
        let Some(value) = it.sweep_value else {
            continue;
        };
        match it.status {
            IterationStatus::Pass => passing.push(value),
            IterationStatus::Fail => failing.push(value),
            _ => {}
        }
    }
    if passing.is_empty() && failing.is_empty() {
        return None;
    }

    passing.sort_by(f64::total_cmp);
    passing.dedup();
    failing.sort_by(f64::total_cmp);

    let min_pass = passing.first().copied();
    let max_pass = passing.last().copied();
    let min_fail = failing.first().copied();
    let max_fail = failing.last().copied();

    let pattern = match (min_pass, max_pass, min_fail, max_fail) {
        (_, _, None, _) => SweepPattern::NoSensitivity,
        (Some(lo_pass), _, _, Some(hi_fail)) if lo_pass > hi_fail => {
            SweepPattern::ThresholdSensitivity
        }
        (_, Some(hi_pass), Some(lo_fail), _) if hi_pass < lo_fail => {
            SweepPattern::UpperThresholdSensitivity
        }
        _ => SweepPattern::MixedSensitivity,
    };

    let parameter_key = sweep.parameter_key();
    let recommendation = match pattern {
        SweepPattern::NoSensitivity => format!("No {} sensitivity observed", parameter_key),
        SweepPattern::ThresholdSensitivity => format!(
            "Failures below {:.3}; keep {} at or above the threshold",
            min_pass.unwrap_or_default(),
            parameter_key
        ),
        SweepPattern::UpperThresholdSensitivity => format!(
            "Failures above {:.3}; keep {} at or below the threshold",
            max_pass.unwrap_or_default(),
            parameter_key
        ),
        SweepPattern::MixedSensitivity => {
            format!("No clear {} threshold, failures are scattered", parameter_key)
        }
    };

    Some(SweepInsights {
        parameter_key,
        pattern,
        pass_range: min_pass.zip(max_pass),
        safe_values: passing,
        recommendation,
    })
}

/// Points from `start` to `end` inclusive in `step` increments, clamped to
/// `1..=u32::MAX`. A non-positive step or an inverted range is a single point.
pub fn point_count(start: f64, end: f64, step: f64) -> u32 {
    if [start, end, step].iter().any(|v| v.is_nan()) || step <= 0.0 || end < start {
        return 1;
    }
    // tolerate float noise such as (1.2 - 0.8) / 0.1 = 3.9999999
    let span = ((end - start) / step + 1e-9).floor();
    if !span.is_finite() || span >= f64::from(u32::MAX) {
        return u32::MAX;
    }
    span as u32 + 1
}

fn round_millis(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
