// SPDX-License-Identifier: MIT

//! Lifecycle events and observers
//!
//! Delivery is best-effort: an observer that panics is logged and skipped,
//! and channel observers are unbounded so a slow consumer never stalls the
//! walk.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::core::session::{ExecutionStats, IterationStatus};

use super::report::{ExecutionLog, TerminationRecord};

/// Event payload, tagged by `event_type`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum FlowEventKind {
    CurrentNode {
        experiment_name: Option<String>,
    },
    NodeRunning,
    NodeCompleted {
        output_port: Option<u8>,
        status: IterationStatus,
        stats: ExecutionStats,
    },
    NodeExecutionFail {
        reason: String,
    },
    StatusUpdate {
        message: String,
    },
    FlowTerminated {
        record: TerminationRecord,
    },
}

/// A lifecycle event as observers receive it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowEvent {
    #[serde(flatten)]
    pub kind: FlowEventKind,
    pub node_id: Option<String>,
    pub node_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl FlowEvent {
    pub fn new(kind: FlowEventKind) -> Self {
        Self {
            kind,
            node_id: None,
            node_name: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_node(kind: FlowEventKind, id: &str, name: &str) -> Self {
        Self {
            node_id: Some(id.to_string()),
            node_name: Some(name.to_string()),
            ..Self::new(kind)
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self.kind {
            FlowEventKind::CurrentNode { .. } => "current_node",
            FlowEventKind::NodeRunning => "node_running",
            FlowEventKind::NodeCompleted { .. } => "node_completed",
            FlowEventKind::NodeExecutionFail { .. } => "node_execution_fail",
            FlowEventKind::StatusUpdate { .. } => "status_update",
            FlowEventKind::FlowTerminated { .. } => "flow_terminated",
        }
    }
}

/// Receives lifecycle events from the executor
pub trait FlowObserver: Send + Sync {
    fn on_event(&self, event: &FlowEvent);
}

impl FlowObserver for mpsc::UnboundedSender<FlowEvent> {
    fn on_event(&self, event: &FlowEvent) {
        if self.send(event.clone()).is_err() {
            log::debug!("Event receiver dropped, discarding {}", event.event_type());
        }
    }
}

/// Wraps a closure as an observer
pub struct CallbackObserver<F>(pub F);

impl<F> FlowObserver for CallbackObserver<F>
where
    F: Fn(&FlowEvent) + Send + Sync,
{
    fn on_event(&self, event: &FlowEvent) {
        (self.0)(event)
    }
}

/// Fans events out to observers and keeps the execution log
#[derive(Default)]
pub struct EventHub {
    observers: Vec<Box<dyn FlowObserver>>,
    log: Mutex<ExecutionLog>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: Box<dyn FlowObserver>) {
        self.observers.push(observer);
    }

    /// Deliver an event to every observer
    pub fn emit(&self, event: FlowEvent) {
        for observer in &self.observers {
            let delivered = catch_unwind(AssertUnwindSafe(|| observer.on_event(&event)));
            if delivered.is_err() {
                log::warn!(
                    "Observer panicked while handling {}, continuing",
                    event.event_type()
                );
            }
        }
    }

    /// Append a line to the execution log and mirror it as a status update
    pub fn status(&self, message: impl Into<String>) {
        self.status_for(None, message);
    }

    /// Like [`status`](Self::status), attributed to a node
    pub fn node_status(&self, id: &str, name: &str, message: impl Into<String>) {
        self.status_for(Some((id, name)), message);
    }

    fn status_for(&self, node: Option<(&str, &str)>, message: impl Into<String>) {
        let message = message.into();
        log::info!("{}", message);
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.clone());

        let kind = FlowEventKind::StatusUpdate { message };
        let event = match node {
            Some((id, name)) => FlowEvent::for_node(kind, id, name),
            None => FlowEvent::new(kind),
        };
        self.emit(event);
    }

    /// Snapshot of the execution log
    pub fn log(&self) -> ExecutionLog {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
