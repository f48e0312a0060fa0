// SPDX-License-Identifier: MIT

//! Cross-node experiment tracking
//!
//! The tracker keeps one record per executed node: configuration, iteration
//! history, final classification and routing port. Later nodes read it; the
//! Adaptive policy asks it for the strongest prior AllFail signal to seed its
//! own configuration from.

mod sweep;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::core::session::{ExecutionStats, ExperimentConfig, IterationReport, IterationStatus};
use crate::flow::graph::{PolicyKind, Port, HARDWARE_FAILURE_THRESHOLD};

pub use sweep::{point_count, SweepConfig, SweepInsights, SweepKind, SweepPattern};

/// Tracker shared between the executor and node runs
pub type SharedTracker = Arc<Mutex<ExperimentTracker>>;

/// Pass percentage at which a node counts as a recovery condition
const RECOVERY_PASS_RATE: f64 = 80.0;
/// Fail percentage (with at least 3 iterations) treated as a solid repro
const SOLID_REPRO_FAIL_RATE: f64 = 90.0;

/// Final classification of a node's experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalResult {
    NoData,
    HardwareFailure,
    NoValidResults,
    Stable,
    Flaky,
    MostlyFailing,
    SolidRepro,
}

impl FinalResult {
    pub fn from_stats(stats: &ExecutionStats) -> Self {
        if stats.total_completed == 0 {
            FinalResult::NoData
        } else if stats.hardware_failure_ratio() > HARDWARE_FAILURE_THRESHOLD {
            FinalResult::HardwareFailure
        } else if stats.valid_tests == 0 {
            FinalResult::NoValidResults
        } else if stats.pass_rate >= 80.0 {
            FinalResult::Stable
        } else if stats.pass_rate >= 50.0 {
            FinalResult::Flaky
        } else if stats.pass_rate > 0.0 {
            FinalResult::MostlyFailing
        } else {
            FinalResult::SolidRepro
        }
    }
}

/// How likely the failure is to recover under changed conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPotential {
    High,
    Medium,
    Low,
    #[default]
    Unknown,
}

impl RecoveryPotential {
    pub fn from_stats(stats: &ExecutionStats) -> Self {
        if stats.valid_tests == 0 {
            return RecoveryPotential::Unknown;
        }
        match stats.pass_rate / 100.0 {
            r if r >= 0.5 => RecoveryPotential::High,
            r if r >= 0.2 => RecoveryPotential::Medium,
            _ => RecoveryPotential::Low,
        }
    }
}

/// One iteration as the tracker stores it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedIteration {
    pub iteration: u32,
    pub status: IterationStatus,
    pub scratchpad: String,
    pub seed: String,
    pub sweep_value: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Everything recorded about one node's experiment
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentRecord {
    pub node_id: String,
    pub node_name: String,
    pub kind: PolicyKind,
    pub config: ExperimentConfig,
    pub sweep: Option<SweepConfig>,
    pub iterations: Vec<TrackedIteration>,
    pub stats: ExecutionStats,
    pub final_result: Option<FinalResult>,
    pub output_port: Option<Port>,
    /// FAIL counts keyed by `scratchpad:seed`
    pub failure_patterns: BTreeMap<String, u32>,
    pub recovery_indicator: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExperimentRecord {
    fn new(node_id: &str, node_name: &str, kind: PolicyKind, config: ExperimentConfig) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_name: node_name.to_string(),
            kind,
            sweep: SweepConfig::from_config(&config),
            config,
            iterations: Vec::new(),
            stats: ExecutionStats::default(),
            final_result: None,
            output_port: None,
            failure_patterns: BTreeMap::new(),
            recovery_indicator: false,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn sweep_insights(&self) -> Option<SweepInsights> {
        self.sweep
            .as_ref()
            .and_then(|s| sweep::analyze(s, &self.iterations))
    }

    fn is_solid_repro(&self) -> bool {
        self.final_result == Some(FinalResult::SolidRepro)
            || self.output_port == Some(Port::Repro)
            || (self.stats.fail_rate >= SOLID_REPRO_FAIL_RATE && self.stats.total_completed >= 3)
    }
}

/// Roll-up of a flow run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub nodes_executed: Vec<String>,
    /// Nodes that routed to port 0
    pub recovery_conditions: Vec<String>,
    /// Nodes that routed to port 1
    pub failure_conditions: Vec<String>,
    pub total_iterations: usize,
}

/// What the Adaptive policy learns from earlier nodes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdaptiveAnalysis {
    pub source_node_id: String,
    pub source_node_name: String,
    /// Configuration of the source experiment
    pub recommended_config: ExperimentConfig,
    pub sweep_insights: Option<SweepInsights>,
    pub recovery_potential: RecoveryPotential,
    pub fail_rate: f64,
    pub fail_count: u32,
    pub selection_reason: String,
}

/// Per-node experiment history for one flow run
#[derive(Debug, Default)]
pub struct ExperimentTracker {
    records: Vec<ExperimentRecord>,
}

impl ExperimentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedTracker {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Open a record for a node. A node visited again starts a fresh record.
    pub fn start_experiment(
        &mut self,
        node_id: &str,
        node_name: &str,
        kind: PolicyKind,
        config: &ExperimentConfig,
    ) {
        let record = ExperimentRecord::new(node_id, node_name, kind, config.clone());
        match self.position(node_id) {
            Some(i) => self.records[i] = record,
            None => self.records.push(record),
        }
        log::debug!("Tracking experiment for node {}", node_id);
    }

    pub fn track_iteration(&mut self, node_id: &str, report: &IterationReport, stats: &ExecutionStats) {
        let Some(i) = self.position(node_id) else {
            log::warn!("Iteration for untracked node {}", node_id);
            return;
        };
        let record = &mut self.records[i];

        let sweep_value = report.sweep_value.or_else(|| {
            record
                .sweep
                .as_ref()
                .and_then(|s| s.value_at(report.iteration.checked_sub(1)?))
        });

        if report.status == IterationStatus::Fail {
            let key = format!("{}:{}", report.scratchpad, report.seed);
            *record.failure_patterns.entry(key).or_insert(0) += 1;
        }

        record.iterations.push(TrackedIteration {
            iteration: report.iteration,
            status: report.status,
            scratchpad: report.scratchpad.clone(),
            seed: report.seed.clone(),
            sweep_value,
            timestamp: Utc::now(),
        });
        record.stats = stats.clone();
    }

    /// Close a node's record and return its final classification
    pub fn complete_experiment(
        &mut self,
        node_id: &str,
        stats: &ExecutionStats,
        port: Option<Port>,
    ) -> Option<FinalResult> {
        let i = self.position(node_id)?;
        let record = &mut self.records[i];
        let result = FinalResult::from_stats(stats);

        record.stats = stats.clone();
        record.final_result = Some(result);
        record.output_port = port;
        record.recovery_indicator = stats.valid_tests > 0 && stats.pass_rate >= RECOVERY_PASS_RATE;
        record.completed_at = Some(Utc::now());

        log::info!(
            "Node {} finished: {:?} (port {})",
            node_id,
            result,
            port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
        );
        Some(result)
    }

    pub fn record(&self, node_id: &str) -> Option<&ExperimentRecord> {
        self.records.iter().find(|r| r.node_id == node_id)
    }

    pub fn records(&self) -> &[ExperimentRecord] {
        &self.records
    }

    pub fn flow_summary(&self) -> FlowSummary {
        let ids_on = |port: Port| {
            self.records
                .iter()
                .filter(|r| r.output_port == Some(port))
                .map(|r| r.node_id.clone())
                .collect()
        };
        FlowSummary {
            nodes_executed: self.records.iter().map(|r| r.node_id.clone()).collect(),
            recovery_conditions: ids_on(Port::NoRepro),
            failure_conditions: ids_on(Port::Repro),
            total_iterations: self.records.iter().map(|r| r.iterations.len()).sum(),
        }
    }

    /// Pick the prior AllFail node an Adaptive node should learn from
    ///
    /// Solid repros win, highest fail count first. Without one, the flakiest
    /// node by fail rate is used. Ties keep the earliest node.
    pub fn adaptive_analysis(&self) -> Option<AdaptiveAnalysis> {
        let candidates: Vec<&ExperimentRecord> = self
            .records
            .iter()
            .filter(|r| r.kind == PolicyKind::AllFail && r.is_complete())
            .collect();

        let solid = candidates
            .iter()
            .copied()
            .filter(|r| r.is_solid_repro())
            .fold(None::<&ExperimentRecord>, |best, r| match best {
                Some(b) if b.stats.fail_count >= r.stats.fail_count => Some(b),
                _ => Some(r),
            });

        let (source, reason) = match solid {
            Some(r) => (
                r,
                format!(
                    "Solid repro on '{}' ({} fails, {:.1}% fail rate)",
                    r.node_name, r.stats.fail_count, r.stats.fail_rate
                ),
            ),
            None => {
                let flakiest = candidates
                    .iter()
                    .copied()
                    .filter(|r| r.stats.fail_count > 0)
                    .fold(None::<&ExperimentRecord>, |best, r| match best {
                        Some(b)
                            if (b.stats.fail_rate, b.stats.fail_count)
                                >= (r.stats.fail_rate, r.stats.fail_count) =>
                        {
                            Some(b)
                        }
                        _ => Some(r),
                    })?;
                (
                    flakiest,
                    format!(
                        "No solid repro; flakiest node '{}' ({:.1}% fail rate)",
                        flakiest.node_name, flakiest.stats.fail_rate
                    ),
                )
            }
        };

        Some(AdaptiveAnalysis {
            source_node_id: source.node_id.clone(),
            source_node_name: source.node_name.clone(),
            recommended_config: source.config.clone(),
            sweep_insights: source.sweep_insights(),
            recovery_potential: RecoveryPotential::from_stats(&source.stats),
            fail_rate: source.stats.fail_rate,
            fail_count: source.stats.fail_count,
            selection_reason: reason,
        })
    }

    pub fn reset(&mut self) {
        self.records.clear();
    }

    fn position(&self, node_id: &str) -> Option<usize> {
        self.records.iter().position(|r| r.node_id == node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stats::StatsAccumulator;
    use serde_json::json;

    fn config(key: &str, params: serde_json::Value) -> ExperimentConfig {
        ExperimentConfig::new(key, params.as_object().cloned().unwrap_or_default())
    }

    fn run_node(
        tracker: &mut ExperimentTracker,
        id: &str,
        kind: PolicyKind,
        cfg: ExperimentConfig,
        statuses: &[IterationStatus],
        port: Port,
    ) {
        tracker.start_experiment(id, &format!("{} node", id), kind, &cfg);
        let mut acc = StatsAccumulator::new();
        for (i, status) in statuses.iter().enumerate() {
            acc.record(*status);
            let report = IterationReport {
                iteration: i as u32 + 1,
                status: *status,
                scratchpad: "0xDEAD".to_string(),
                seed: "42".to_string(),
                sweep_value: None,
                abort_flow: false,
            };
            tracker.track_iteration(id, &report, &acc.snapshot());
        }
        tracker.complete_experiment(id, &acc.snapshot(), Some(port));
    }

    #[test]
    fn test_final_results() {
        use IterationStatus::*;
        let classify = |s: &[IterationStatus]| {
            let mut acc = StatsAccumulator::new();
            s.iter().for_each(|x| acc.record(*x));
            FinalResult::from_stats(&acc.snapshot())
        };
        assert_eq!(classify(&[]), FinalResult::NoData);
        assert_eq!(classify(&[ExecutionFail, Cancelled, Pass]), FinalResult::HardwareFailure);
        assert_eq!(classify(&[Unknown]), FinalResult::NoValidResults);
        assert_eq!(classify(&[Pass, Pass, Pass, Pass, Fail]), FinalResult::Stable);
        assert_eq!(classify(&[Pass, Fail]), FinalResult::Flaky);
        assert_eq!(classify(&[Pass, Fail, Fail]), FinalResult::MostlyFailing);
        assert_eq!(classify(&[Fail, Fail]), FinalResult::SolidRepro);
    }

    #[test]
    fn test_failure_patterns_and_summary() {
        let mut tracker = ExperimentTracker::new();
        run_node(
            &mut tracker,
            "a",
            PolicyKind::AllFail,
            config("cfgA", json!({})),
            &[IterationStatus::Fail, IterationStatus::Fail],
            Port::Repro,
        );
        run_node(
            &mut tracker,
            "b",
            PolicyKind::SingleFail,
            config("cfgB", json!({})),
            &[IterationStatus::Pass; 8],
            Port::NoRepro,
        );

        let record = tracker.record("a").unwrap();
        assert_eq!(record.failure_patterns.get("0xDEAD:42"), Some(&2));
        assert!(!record.recovery_indicator);
        assert!(tracker.record("b").unwrap().recovery_indicator);

        let summary = tracker.flow_summary();
        assert_eq!(summary.nodes_executed, vec!["a", "b"]);
        assert_eq!(summary.recovery_conditions, vec!["b"]);
        assert_eq!(summary.failure_conditions, vec!["a"]);
        assert_eq!(summary.total_iterations, 10);

        tracker.reset();
        assert!(tracker.records().is_empty());
    }

    #[test]
    fn test_adaptive_prefers_highest_fail_count_solid_repro() {
        use IterationStatus::*;
        let mut tracker = ExperimentTracker::new();
        run_node(&mut tracker, "a1", PolicyKind::AllFail, config("c1", json!({})), &[Fail, Fail, Fail], Port::Repro);
        run_node(&mut tracker, "a2", PolicyKind::AllFail, config("c2", json!({"Content": "Dragon"})), &[Fail; 5], Port::Repro);
        run_node(&mut tracker, "a3", PolicyKind::AllFail, config("c3", json!({})), &[Fail; 5], Port::Repro);
        // not an AllFail node, ignored
        run_node(&mut tracker, "s1", PolicyKind::SingleFail, config("c4", json!({})), &[Fail; 9], Port::Repro);

        let analysis = tracker.adaptive_analysis().unwrap();
        assert_eq!(analysis.source_node_id, "a2");
        assert_eq!(analysis.recommended_config.key, "c2");
        assert_eq!(analysis.fail_count, 5);
        assert_eq!(analysis.recovery_potential, RecoveryPotential::Low);
        assert!(analysis.selection_reason.contains("Solid repro"));
    }

    #[test]
    fn test_adaptive_falls_back_to_flakiest() {
        use IterationStatus::*;
        let mut tracker = ExperimentTracker::new();
        run_node(&mut tracker, "a1", PolicyKind::AllFail, config("c1", json!({})), &[Pass, Fail, Pass, Pass], Port::Intermittent);
        run_node(&mut tracker, "a2", PolicyKind::AllFail, config("c2", json!({})), &[Pass, Fail, Fail, Pass], Port::Intermittent);

        let analysis = tracker.adaptive_analysis().unwrap();
        assert_eq!(analysis.source_node_id, "a2");
        assert_eq!(analysis.recovery_potential, RecoveryPotential::High);
        assert!(analysis.selection_reason.contains("flakiest"));
    }

    #[test]
    fn test_adaptive_without_history() {
        let tracker = ExperimentTracker::new();
        assert!(tracker.adaptive_analysis().is_none());
    }

    #[test]
    fn test_sweep_value_from_config_index() {
        let mut tracker = ExperimentTracker::new();
        let cfg = config(
            "sweep",
            json!({"Test Type": "Sweep", "Type": "Voltage", "Domain": "CFC", "Start": 0.7, "End": 0.9, "Steps": 0.1}),
        );
        run_node(
            &mut tracker,
            "sw",
            PolicyKind::AllFail,
            cfg,
            &[IterationStatus::Fail, IterationStatus::Pass, IterationStatus::Pass],
            Port::Intermittent,
        );
        let record = tracker.record("sw").unwrap();
        let values: Vec<_> = record.iterations.iter().map(|i| i.sweep_value).collect();
        assert_eq!(values, vec![Some(0.7), Some(0.8), Some(0.9)]);

        let insights = record.sweep_insights().unwrap();
        assert_eq!(insights.parameter_key, "Voltage CFC");
        assert_eq!(insights.pattern, SweepPattern::ThresholdSensitivity);
        assert_eq!(insights.recommended_value(), Some(0.8));
    }
}
