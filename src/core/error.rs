// SPDX-License-Identifier: MIT

//! Typed error handling for flowbench
//!
//! Two disjoint universes live here: [`ConfigError`] for malformed graph or
//! configuration documents (raised at build time only) and [`SessionError`]
//! for collaborator failures while a node drives an experiment. Test outcomes
//! such as FAIL or EXECUTION_FAIL are never errors; they travel as
//! [`IterationStatus`](crate::core::session::IterationStatus) values.

use thiserror::Error;

/// Top-level error type for flowbench
#[derive(Debug, Error)]
pub enum FlowError {
    /// Graph or configuration document is malformed
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The experiment session collaborator failed
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// A node run panicked and was contained by the executor
    #[error("Node '{node_id}' panicked: {message}")]
    NodePanicked { node_id: String, message: String },

    /// Generic error wrapper
    #[error("{0}")]
    Other(String),
}

/// Build-time configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A node id is referenced but never defined
    #[error("Node '{0}' is referenced but not defined in the structure document")]
    UnknownNode(String),

    /// `instanceType` is not one of the supported policies
    #[error("Unknown instance type '{instance_type}' for node '{node_id}'")]
    UnknownPolicy {
        node_id: String,
        instance_type: String,
    },

    /// Experiment node without a `flow` assignment
    #[error("Node '{0}' requires a flow assignment")]
    MissingConfigKey(String),

    /// `flow` points at a key the flows document does not define
    #[error("Flow '{config_key}' not found in flows document for node '{node_id}'")]
    UndefinedConfigKey { node_id: String, config_key: String },

    /// Output port key outside 0..=3
    #[error("Invalid output port '{port}' on node '{node_id}' (expected 0-3)")]
    InvalidPort { node_id: String, port: String },

    /// A Start node is the target of another node's port
    #[error("Start node '{start_id}' is referenced as an output of '{from_id}'")]
    StartHasInbound { start_id: String, from_id: String },

    /// An End node declares outputs
    #[error("End node '{0}' must not define an outputNodeMap")]
    EndHasOutputs(String),

    /// Structure has no Start node
    #[error("Structure document defines no Start node")]
    NoStartNode,

    /// Structure has more than one Start node
    #[error("Structure document defines multiple Start nodes: {0:?}")]
    MultipleStartNodes(Vec<String>),

    /// Settings value out of range
    #[error("Invalid setting {name}: {message}")]
    InvalidSetting { name: String, message: String },

    /// File loading errors
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// Failures reported by an experiment session collaborator
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session refused to start the experiment
    #[error("Failed to start experiment '{experiment}': {message}")]
    Start { experiment: String, message: String },

    /// A continue/end/cancel command was not accepted
    #[error("Command '{command}' rejected: {message}")]
    Command { command: String, message: String },

    /// The session thread or connection went away
    #[error("Session disconnected: {0}")]
    Disconnected(String),
}

impl FlowError {
    /// Create from a generic message
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

impl SessionError {
    pub fn start(experiment: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Start {
            experiment: experiment.into(),
            message: message.into(),
        }
    }

    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: message.into(),
        }
    }
}
