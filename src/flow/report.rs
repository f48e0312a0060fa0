// SPDX-License-Identifier: MIT

//! Termination records, execution log and termination report

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::graph::Port;

/// Which of the four terminal outcomes ended a walk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationKind {
    HardwareFailure,
    UnwiredPort,
    UserAbort,
    NormalCompletion,
}

impl TerminationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationKind::HardwareFailure => "hardware_failure",
            TerminationKind::UnwiredPort => "unwired_port",
            TerminationKind::UserAbort => "user_abort",
            TerminationKind::NormalCompletion => "normal_completion",
        }
    }
}

impl fmt::Display for TerminationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of an unbound port a node routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnwiredReason {
    NoRepro,
    ReproFound,
    IntermittentResults,
    HardwareFailure,
}

impl From<Port> for UnwiredReason {
    fn from(port: Port) -> Self {
        match port {
            Port::NoRepro => UnwiredReason::NoRepro,
            Port::Repro => UnwiredReason::ReproFound,
            Port::Intermittent => UnwiredReason::IntermittentResults,
            Port::HardwareFailure => UnwiredReason::HardwareFailure,
        }
    }
}

impl UnwiredReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnwiredReason::NoRepro => "no_repro",
            UnwiredReason::ReproFound => "repro_found",
            UnwiredReason::IntermittentResults => "intermittent_results",
            UnwiredReason::HardwareFailure => "hardware_failure",
        }
    }
}

/// Flag a node sets when its chosen port has no target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnwiredPort {
    pub port: Port,
    pub reason: UnwiredReason,
}

impl UnwiredPort {
    pub fn new(port: Port) -> Self {
        Self {
            port,
            reason: port.into(),
        }
    }
}

/// How and where a walk ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationRecord {
    #[serde(rename = "type")]
    pub kind: TerminationKind,
    pub reason: String,
    pub node_id: Option<String>,
    pub node_name: Option<String>,
    pub port: Option<Port>,
    pub sub_reason: Option<UnwiredReason>,
    pub timestamp: DateTime<Utc>,
}

impl TerminationRecord {
    pub fn new(kind: TerminationKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            node_id: None,
            node_name: None,
            port: None,
            sub_reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn at_node(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.node_id = Some(id.into());
        self.node_name = Some(name.into());
        self
    }

    pub fn with_port(mut self, port: Port) -> Self {
        self.port = Some(port);
        self
    }

    pub fn unwired(mut self, unwired: UnwiredPort) -> Self {
        self.port = Some(unwired.port);
        self.sub_reason = Some(unwired.reason);
        self
    }
}

/// One timestamped line of the execution log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

/// Ordered, timestamped text log of a walk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    entries: Vec<LogEntry>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: impl Into<String>) -> &LogEntry {
        self.entries.push(LogEntry {
            timestamp: Local::now(),
            message: message.into(),
        });
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn lines(&self) -> Vec<String> {
        self.entries.iter().map(ToString::to_string).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl fmt::Display for ExecutionLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{}", entry)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationDetails {
    pub hardware_failure: bool,
    pub unwired_port: bool,
    pub user_abort: bool,
    #[serde(rename = "type")]
    pub kind: TerminationKind,
    pub terminating_node: Option<String>,
    pub terminating_node_name: Option<String>,
    pub output_port: Option<Port>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Wall-clock seconds
    pub total_time: f64,
    pub nodes_executed: usize,
    pub completed_normally: bool,
    pub hop_limit_reached: bool,
}

/// Structured report produced after every walk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationReport {
    /// False only for a normal completion at an End node
    pub termination_occurred: bool,
    pub termination_details: TerminationDetails,
    pub execution_summary: ExecutionSummary,
}

impl TerminationReport {
    pub fn new(
        record: &TerminationRecord,
        total_time: f64,
        nodes_executed: usize,
        hop_limit_reached: bool,
    ) -> Self {
        let normal = record.kind == TerminationKind::NormalCompletion;
        let completed_normally = normal && !hop_limit_reached;
        Self {
            termination_occurred: !completed_normally,
            termination_details: TerminationDetails {
                hardware_failure: record.kind == TerminationKind::HardwareFailure,
                unwired_port: record.kind == TerminationKind::UnwiredPort,
                user_abort: record.kind == TerminationKind::UserAbort,
                kind: record.kind,
                terminating_node: record.node_id.clone(),
                terminating_node_name: record.node_name.clone(),
                output_port: record.port,
                reason: record.reason.clone(),
                timestamp: record.timestamp,
            },
            execution_summary: ExecutionSummary {
                total_time,
                nodes_executed,
                completed_normally,
                hop_limit_reached,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_line_format() {
        let mut log = ExecutionLog::new();
        let line = log.push("Starting flow").to_string();
        assert!(line.starts_with('['));
        assert_eq!(&line[9..], "] Starting flow");
        assert_eq!(log.lines().len(), 1);
        assert!(log.to_string().ends_with("Starting flow\n"));
    }

    #[test]
    fn test_unwired_sub_reasons() {
        let names: Vec<_> = Port::ALL
            .iter()
            .map(|p| UnwiredReason::from(*p).as_str())
            .collect();
        assert_eq!(
            names,
            vec!["no_repro", "repro_found", "intermittent_results", "hardware_failure"]
        );
    }

    #[test]
    fn test_report_shape() {
        let record = TerminationRecord::new(TerminationKind::UnwiredPort, "port 1 not connected")
            .at_node("n2", "AllFail cfgX")
            .unwired(UnwiredPort::new(Port::Repro));
        let report = TerminationReport::new(&record, 1.5, 2, false);
        let value = serde_json::to_value(&report).unwrap();

        assert_eq!(value["termination_occurred"], true);
        assert_eq!(value["termination_details"]["type"], "unwired_port");
        assert_eq!(value["termination_details"]["unwired_port"], true);
        assert_eq!(value["termination_details"]["terminating_node"], "n2");
        assert_eq!(value["termination_details"]["output_port"], 1);
        assert_eq!(value["execution_summary"]["completed_normally"], false);
        assert_eq!(value["execution_summary"]["nodes_executed"], 2);
    }

    #[test]
    fn test_hop_limit_is_not_normal_completion() {
        let record = TerminationRecord::new(TerminationKind::NormalCompletion, "hop limit");
        let report = TerminationReport::new(&record, 0.1, 50, true);
        assert!(report.termination_occurred);
        assert!(!report.execution_summary.completed_normally);

        let report = TerminationReport::new(&record, 0.1, 3, false);
        assert!(!report.termination_occurred);
        assert!(report.execution_summary.completed_normally);
    }
}
