// SPDX-License-Identifier: MIT

//! The flow engine: documents, graph, policies, tracker and executor

pub mod events;
pub mod graph;
pub mod report;
pub mod server;
pub mod state;
pub mod tracker;
pub mod workflow;

pub use events::{CallbackObserver, EventHub, FlowEvent, FlowEventKind, FlowObserver};
pub use graph::{ExecutorStatus, FlowExecutor, Graph, NodeVisit, PolicyKind, Port};
pub use report::{ExecutionLog, TerminationKind, TerminationRecord, TerminationReport};
pub use state::{ExecutionCommand, ExecutionState};
pub use tracker::{ExperimentTracker, SharedTracker};
pub use workflow::{EngineSettings, FlowDefinition, FlowGraphBuilder, FlowLoader};
