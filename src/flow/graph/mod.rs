// SPDX-License-Identifier: MIT

//! Flow graph execution
//!
//! Arena graph types, node policies and the executor that walks the graph.

mod adaptive;
pub mod executor;
pub mod node;
pub mod policy;
pub mod types;

pub use adaptive::{is_experiment_parameter, seed_config};
pub use executor::{ExecutorStatus, FlowExecutor, NodeVisit};
pub use node::{IterationResult, Node, NodeContext, NodeRun};
pub use policy::{Decision, PolicyInput, HARDWARE_FAILURE_THRESHOLD};
pub use types::{Graph, NodeIndex, PolicyKind, Port, PortMap};
