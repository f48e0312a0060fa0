// SPDX-License-Identifier: MIT

//! Flow graph executor
//!
//! Walks the graph from its root, one node at a time. After every node the
//! termination triggers are checked in priority order: an operator command
//! on the shared [`ExecutionState`], a hardware failure in the node just run,
//! then an unwired output port. A hop limit bounds cyclic graphs.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

use crate::core::error::FlowError;
use crate::core::session::{ExecutionStats, ExperimentSessionFactory, IterationStatus};
use crate::flow::events::{EventHub, FlowEvent, FlowEventKind, FlowObserver};
use crate::flow::report::{
    ExecutionLog, TerminationKind, TerminationRecord, TerminationReport, UnwiredPort,
};
use crate::flow::state::{ExecutionCommand, ExecutionState};
use crate::flow::tracker::{ExperimentTracker, SharedTracker};
use crate::flow::workflow::EngineSettings;

use super::node::{IterationResult, Node, NodeContext, NodeRun};
use super::policy::HARDWARE_FAILURE_THRESHOLD;
use super::types::{Graph, NodeIndex, PolicyKind, Port};

/// Lifecycle of an executor
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExecutorStatus {
    Idle,
    Running,
    Terminated { record: TerminationRecord },
}

/// One entry of the visit trail
#[derive(Debug, Clone, Serialize)]
pub struct NodeVisit {
    pub node_id: String,
    pub node_name: String,
    pub kind: PolicyKind,
    pub config_key: Option<String>,
    pub output_port: Option<Port>,
    pub status: IterationStatus,
    pub iterations: Vec<IterationResult>,
    pub stats: ExecutionStats,
    /// Node an Adaptive run was seeded from
    pub adaptive_source: Option<String>,
    pub unwired: Option<UnwiredPort>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

enum Outcome {
    Next(NodeIndex),
    Stop(TerminationRecord),
}

/// Walks a [`Graph`], driving one experiment session per node
pub struct FlowExecutor {
    graph: Arc<Graph>,
    factory: Arc<dyn ExperimentSessionFactory>,
    state: Arc<ExecutionState>,
    tracker: SharedTracker,
    settings: EngineSettings,
    events: EventHub,
    status: ExecutorStatus,
    visits: Vec<NodeVisit>,
    report: Option<TerminationReport>,
}

impl FlowExecutor {
    /// Create a new FlowExecutor
    pub fn new(graph: Arc<Graph>, factory: Arc<dyn ExperimentSessionFactory>) -> Self {
        Self {
            graph,
            factory,
            state: Arc::new(ExecutionState::new()),
            tracker: ExperimentTracker::shared(),
            settings: EngineSettings::default(),
            events: EventHub::new(),
            status: ExecutorStatus::Idle,
            visits: Vec::new(),
            report: None,
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Share an execution state with the operator side
    pub fn with_state(mut self, state: Arc<ExecutionState>) -> Self {
        self.state = state;
        self
    }

    pub fn with_tracker(mut self, tracker: SharedTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_observer<O: FlowObserver + 'static>(mut self, observer: O) -> Self {
        self.events.subscribe(Box::new(observer));
        self
    }

    /// Handle for issuing cancel / end commands
    pub fn execution_state(&self) -> Arc<ExecutionState> {
        self.state.clone()
    }

    pub fn tracker(&self) -> SharedTracker {
        self.tracker.clone()
    }

    pub fn status(&self) -> &ExecutorStatus {
        &self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == ExecutorStatus::Running
    }

    pub fn visits(&self) -> &[NodeVisit] {
        &self.visits
    }

    pub fn report(&self) -> Option<&TerminationReport> {
        self.report.as_ref()
    }

    pub fn execution_log(&self) -> ExecutionLog {
        self.events.log()
    }

    /// Run the walk on a tokio task; the executor is handed back when done
    pub fn spawn(mut self) -> JoinHandle<Self> {
        tokio::spawn(async move {
            self.execute().await;
            self
        })
    }

    /// Walk the graph until a termination trigger fires
    pub async fn execute(&mut self) -> TerminationReport {
        self.status = ExecutorStatus::Running;
        self.visits.clear();
        self.report = None;
        self.events.clear_log();
        self.tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();

        let clock = Instant::now();
        let graph = self.graph.clone();
        let hop_limit = self.settings.hop_limit.max(1);
        let mut current = graph.root();
        let mut hops = 0usize;
        let mut hop_limit_reached = false;

        self.events.status(format!(
            "Starting flow execution ({} node(s), hop limit {})",
            graph.len(),
            hop_limit
        ));

        let record = loop {
            let Some(node) = graph.node(current) else {
                break TerminationRecord::new(
                    TerminationKind::HardwareFailure,
                    format!("Node index {} is not part of the graph", current.0),
                );
            };

            if let Some(command) = self.state.command() {
                self.state.acknowledge();
                break user_abort(command, node);
            }

            hops += 1;
            let (visit, outcome) = self.run_node(node, current).await;
            self.visits.push(visit);

            match outcome {
                Outcome::Stop(record) => break record,
                Outcome::Next(next) if hops >= hop_limit => {
                    log::warn!(
                        "Hop limit {} reached before node {}",
                        hop_limit,
                        graph.node(next).map(|n| n.id.as_str()).unwrap_or("?")
                    );
                    hop_limit_reached = true;
                    break TerminationRecord::new(
                        TerminationKind::NormalCompletion,
                        format!("Hop limit of {} reached", hop_limit),
                    )
                    .at_node(&node.id, &node.name);
                }
                Outcome::Next(next) => current = next,
            }
        };

        let summary = self
            .tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .flow_summary();
        self.events.status(format!(
            "Flow terminated: {} ({}); {} node(s) executed, recovery conditions {:?}, failure conditions {:?}",
            record.kind,
            record.reason,
            self.visits.len(),
            summary.recovery_conditions,
            summary.failure_conditions
        ));

        let mut terminal = FlowEvent::new(FlowEventKind::FlowTerminated {
            record: record.clone(),
        });
        terminal.node_id = record.node_id.clone();
        terminal.node_name = record.node_name.clone();
        self.events.emit(terminal);

        let report = TerminationReport::new(
            &record,
            clock.elapsed().as_secs_f64(),
            self.visits.len(),
            hop_limit_reached,
        );
        self.status = ExecutorStatus::Terminated { record };
        self.report = Some(report.clone());
        report
    }

    async fn run_node(&self, node: &Node, index: NodeIndex) -> (NodeVisit, Outcome) {
        let experiment_name = node
            .config
            .as_ref()
            .and_then(|c| c.test_name())
            .map(str::to_string);
        self.events.emit(FlowEvent::for_node(
            FlowEventKind::CurrentNode { experiment_name },
            &node.id,
            &node.name,
        ));
        self.events.node_status(
            &node.id,
            &node.name,
            format!("Running node '{}' ({})", node.name, node.kind),
        );
        self.events.emit(FlowEvent::for_node(
            FlowEventKind::NodeRunning,
            &node.id,
            &node.name,
        ));

        let started_at = Utc::now();
        let clock = Instant::now();
        let mut run = NodeRun::new(index);
        let ctx = NodeContext {
            factory: self.factory.as_ref(),
            state: &self.state,
            tracker: &self.tracker,
            events: &self.events,
            wait_timeout: self.settings.wait_timeout(),
        };

        let result = AssertUnwindSafe(node.run_experiment(&ctx, &mut run))
            .catch_unwind()
            .await;
        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(panic) => Some(FlowError::NodePanicked {
                node_id: node.id.clone(),
                message: panic_message(panic.as_ref()),
            }),
        };

        let outcome = match failure {
            Some(error) => {
                log::error!("Node {} failed: {}", node.id, error);
                run.status = IterationStatus::ExecutionFail;
                run.output_port = Some(Port::HardwareFailure);
                self.events.emit(FlowEvent::for_node(
                    FlowEventKind::NodeExecutionFail {
                        reason: error.to_string(),
                    },
                    &node.id,
                    &node.name,
                ));
                run.emergency_cancel().await;
                Outcome::Stop(
                    TerminationRecord::new(
                        TerminationKind::HardwareFailure,
                        format!("Node execution failed: {}", error),
                    )
                    .at_node(&node.id, &node.name)
                    .with_port(Port::HardwareFailure),
                )
            }
            None => {
                self.events.emit(FlowEvent::for_node(
                    FlowEventKind::NodeCompleted {
                        output_port: run.output_port.map(u8::from),
                        status: run.status,
                        stats: run.stats.clone(),
                    },
                    &node.id,
                    &node.name,
                ));
                self.check_triggers(node, &mut run).await
            }
        };
        run.release_session();

        let visit = NodeVisit {
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            kind: node.kind,
            config_key: run.config.as_ref().map(|c| c.key.clone()),
            output_port: run.output_port,
            status: run.status,
            iterations: std::mem::take(&mut run.results),
            stats: run.stats.clone(),
            adaptive_source: run.adaptive.as_ref().map(|a| a.source_node_id.clone()),
            unwired: run.unwired,
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
        };
        (visit, outcome)
    }

    async fn check_triggers(&self, node: &Node, run: &mut NodeRun) -> Outcome {
        if let Some(command) = self.state.command() {
            self.state.acknowledge();
            return Outcome::Stop(user_abort(command, node));
        }

        let ratio = run.stats.hardware_failure_ratio();
        // start and end nodes route by wiring, port 3 there is not a hardware verdict
        let hardware_port =
            !node.kind.is_terminal() && run.output_port == Some(Port::HardwareFailure);
        if ratio > HARDWARE_FAILURE_THRESHOLD || hardware_port {
            run.emergency_cancel().await;
            let reason = if ratio > HARDWARE_FAILURE_THRESHOLD {
                format!(
                    "Hardware failure ratio {:.0}% exceeds {:.0}% threshold",
                    ratio * 100.0,
                    HARDWARE_FAILURE_THRESHOLD * 100.0
                )
            } else if let Some(failure) = &run.failure {
                format!("Experiment failed without results: {}", failure)
            } else if run.aborted {
                "Session flagged a flow-stopping failure".to_string()
            } else {
                "Node routed to hardware-failure port 3".to_string()
            };
            self.events.node_status(&node.id, &node.name, reason.clone());
            return Outcome::Stop(
                TerminationRecord::new(TerminationKind::HardwareFailure, reason)
                    .at_node(&node.id, &node.name)
                    .with_port(Port::HardwareFailure),
            );
        }

        if let Some(next) = node.get_next_node(run) {
            return Outcome::Next(next);
        }

        match run.unwired {
            Some(unwired) => {
                let reason = format!(
                    "Port {} ({}) on node '{}' is not connected",
                    unwired.port,
                    unwired.reason.as_str(),
                    node.name
                );
                self.events.node_status(&node.id, &node.name, reason.clone());
                Outcome::Stop(
                    TerminationRecord::new(TerminationKind::UnwiredPort, reason)
                        .at_node(&node.id, &node.name)
                        .unwired(unwired),
                )
            }
            None => Outcome::Stop(
                TerminationRecord::new(
                    TerminationKind::NormalCompletion,
                    format!("Reached end node '{}'", node.name),
                )
                .at_node(&node.id, &node.name),
            ),
        }
    }
}

fn user_abort(command: ExecutionCommand, node: &Node) -> TerminationRecord {
    let reason = match command {
        ExecutionCommand::Cancel => "Flow cancelled by user",
        ExecutionCommand::EndExperiment => "Flow ended by user request",
    };
    TerminationRecord::new(TerminationKind::UserAbort, reason).at_node(&node.id, &node.name)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
