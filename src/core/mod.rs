// SPDX-License-Identifier: MIT

//! Collaborator contracts and shared primitives

pub mod error;
pub mod scripted;
pub mod session;
pub mod stats;

pub use error::{ConfigError, FlowError, SessionError};
pub use session::{
    ExecutionStats, ExperimentConfig, ExperimentSession, ExperimentSessionFactory,
    IterationReport, IterationStatus, Recommendation, SessionEvent, SessionHandle, Trend,
};
