// SPDX-License-Identifier: MIT

//! Experiment session contract
//!
//! An [`ExperimentSession`] runs one test experiment at iteration granularity.
//! The flow engine never looks inside an iteration: it only consumes the
//! statuses and running statistics the session reports, and answers each
//! iteration with continue, end or cancel.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::error::SessionError;

/// Outcome of a single iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IterationStatus {
    Pass,
    Fail,
    /// The unit or the harness could not execute the test
    ExecutionFail,
    Cancelled,
    /// Status the session could not classify
    Unknown,
}

impl IterationStatus {
    /// PASS and FAIL are the only statuses that say something about the content
    pub fn is_valid_test(&self) -> bool {
        matches!(self, IterationStatus::Pass | IterationStatus::Fail)
    }

    /// Statuses counted against the hardware-failure ratio
    pub fn is_hardware_failure(&self) -> bool {
        matches!(
            self,
            IterationStatus::ExecutionFail | IterationStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IterationStatus::Pass => "PASS",
            IterationStatus::Fail => "FAIL",
            IterationStatus::ExecutionFail => "EXECUTION_FAIL",
            IterationStatus::Cancelled => "CANCELLED",
            IterationStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for IterationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IterationStatus {
    type Err = std::convert::Infallible;

    /// Lenient parse of the status strings test harnesses emit
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s.trim().to_ascii_uppercase().as_str() {
            "PASS" | "SUCCESS" | "*" => IterationStatus::Pass,
            "FAIL" => IterationStatus::Fail,
            "EXECUTION_FAIL" | "EXECUTIONFAIL" | "FAILED" | "ERROR" | "PYTHON_FAIL" => {
                IterationStatus::ExecutionFail
            }
            "CANCELLED" | "CANCELED" => IterationStatus::Cancelled,
            _ => IterationStatus::Unknown,
        };
        Ok(status)
    }
}

/// Short-window reading of the latest iterations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Trend {
    Repro,
    NoRepro,
    Flaky,
    Mixed,
    #[default]
    #[serde(rename = "insufficient_data")]
    InsufficientData,
}

/// What the session's statistics suggest doing next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    #[default]
    Continue,
    SufficientDataGood,
    SufficientDataPoor,
    TrendingExcellent,
    TrendingPoor,
}

impl Recommendation {
    pub fn is_sufficient(&self) -> bool {
        matches!(
            self,
            Recommendation::SufficientDataGood | Recommendation::SufficientDataPoor
        )
    }
}

/// Running statistics for the current experiment. Rates are percentages of
/// valid (PASS/FAIL) tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecutionStats {
    pub total_completed: u32,
    pub pass_count: u32,
    pub fail_count: u32,
    pub execution_fail_count: u32,
    pub cancelled_count: u32,
    pub valid_tests: u32,
    pub pass_rate: f64,
    pub fail_rate: f64,
    pub recent_trend: Trend,
    pub recommendation: Recommendation,
}

impl ExecutionStats {
    /// Fraction of completed iterations that were execution failures or cancellations
    pub fn hardware_failure_ratio(&self) -> f64 {
        if self.total_completed == 0 {
            return 0.0;
        }
        f64::from(self.execution_fail_count + self.cancelled_count)
            / f64::from(self.total_completed)
    }
}

/// Opaque experiment configuration handed to the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExperimentConfig {
    /// Key into the flows document
    pub key: String,
    /// Parameters as loaded from the flows document (plus overrides)
    pub parameters: Map<String, Value>,
}

impl ExperimentConfig {
    pub fn new(key: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Self {
            key: key.into(),
            parameters,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).and_then(Value::as_str)
    }

    /// Numeric parameter; numeric strings are accepted as well
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.parameters.get(name)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Display name used in events: `Test Name` when present
    pub fn test_name(&self) -> Option<&str> {
        self.get_str("Test Name")
    }
}

/// Per-iteration report from the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationReport {
    pub iteration: u32,
    pub status: IterationStatus,
    #[serde(default)]
    pub scratchpad: String,
    #[serde(default)]
    pub seed: String,
    /// Swept voltage/frequency value when the session knows it
    #[serde(default)]
    pub sweep_value: Option<f64>,
    /// The session classified this iteration as a flow-stopping hardware failure
    #[serde(default)]
    pub abort_flow: bool,
}

/// Events surfaced by [`ExperimentSession::wait_for_next_event`]
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    IterationComplete {
        report: IterationReport,
        stats: ExecutionStats,
    },
    ExperimentComplete,
    ExperimentFailed {
        reason: String,
    },
    Timeout,
}

/// Returned by a successful [`ExperimentSession::start`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionHandle {
    pub experiment_name: String,
    pub started_at: DateTime<Utc>,
}

/// One experiment, driven iteration by iteration
#[async_trait]
pub trait ExperimentSession: Send {
    /// Start the experiment described by `config`
    async fn start(&mut self, config: &ExperimentConfig) -> Result<SessionHandle, SessionError>;

    /// Block until the session has something to report. `None` waits indefinitely.
    async fn wait_for_next_event(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<SessionEvent, SessionError>;

    async fn continue_next_iteration(&mut self) -> Result<(), SessionError>;

    async fn end_current_experiment(&mut self) -> Result<(), SessionError>;

    async fn cancel_experiment(&mut self) -> Result<(), SessionError>;

    fn get_iteration_statistics(&self) -> ExecutionStats;
}

/// Creates one session per node run
pub trait ExperimentSessionFactory: Send + Sync {
    fn create(&self, config: &ExperimentConfig)
        -> Result<Box<dyn ExperimentSession>, SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_parse_is_lenient() {
        assert_eq!("pass".parse::<IterationStatus>().unwrap(), IterationStatus::Pass);
        assert_eq!("*".parse::<IterationStatus>().unwrap(), IterationStatus::Pass);
        assert_eq!(
            "PYTHON_FAIL".parse::<IterationStatus>().unwrap(),
            IterationStatus::ExecutionFail
        );
        assert_eq!(
            "Canceled".parse::<IterationStatus>().unwrap(),
            IterationStatus::Cancelled
        );
        assert_eq!(
            "boot hang".parse::<IterationStatus>().unwrap(),
            IterationStatus::Unknown
        );
    }

    #[test]
    fn test_status_classes() {
        assert!(IterationStatus::Fail.is_valid_test());
        assert!(!IterationStatus::Cancelled.is_valid_test());
        assert!(IterationStatus::Cancelled.is_hardware_failure());
        assert!(!IterationStatus::Unknown.is_hardware_failure());
    }

    #[test]
    fn test_trend_serializes_like_status_handler() {
        assert_eq!(serde_json::to_value(Trend::NoRepro).unwrap(), json!("no-repro"));
        assert_eq!(
            serde_json::to_value(Trend::InsufficientData).unwrap(),
            json!("insufficient_data")
        );
        assert_eq!(
            serde_json::to_value(Recommendation::SufficientDataPoor).unwrap(),
            json!("sufficient_data_poor")
        );
    }

    #[test]
    fn test_hardware_failure_ratio() {
        let stats = ExecutionStats {
            total_completed: 5,
            execution_fail_count: 1,
            cancelled_count: 1,
            ..Default::default()
        };
        assert!((stats.hardware_failure_ratio() - 0.4).abs() < f64::EPSILON);
        assert_eq!(ExecutionStats::default().hardware_failure_ratio(), 0.0);
    }

    #[test]
    fn test_config_numeric_lookup() {
        let params = json!({"Loops": 5, "Start": "0.8", "Test Name": "baseline"});
        let config = ExperimentConfig::new("cfg", params.as_object().unwrap().clone());
        assert_eq!(config.get_f64("Loops"), Some(5.0));
        assert_eq!(config.get_f64("Start"), Some(0.8));
        assert_eq!(config.get_f64("Missing"), None);
        assert_eq!(config.test_name(), Some("baseline"));
    }
}
