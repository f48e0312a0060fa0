// SPDX-License-Identifier: MIT

//! Shared execution state
//!
//! Carries cancel / end-experiment commands from outside the walk into the
//! running node. A command is issued, observed by the walk at the session
//! wait boundary, and then acknowledged, so an issuer can tell whether the
//! command landed before or after an iteration completed.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

/// Command an operator can send to a running flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionCommand {
    /// Abort the current experiment and the flow
    Cancel,
    /// Let the current experiment end gracefully, then stop the flow
    EndExperiment,
}

/// Issue/acknowledge channel between operators and the executor
#[derive(Debug)]
pub struct ExecutionState {
    command: watch::Sender<Option<ExecutionCommand>>,
    acknowledged: watch::Sender<bool>,
}

impl ExecutionState {
    pub fn new() -> Self {
        let (command, _) = watch::channel(None);
        let (acknowledged, _) = watch::channel(false);
        Self {
            command,
            acknowledged,
        }
    }

    /// Request cancellation of the flow
    pub fn cancel(&self) {
        self.issue(ExecutionCommand::Cancel);
    }

    /// Request a graceful stop after the current experiment ends
    pub fn end_experiment(&self) {
        self.issue(ExecutionCommand::EndExperiment);
    }

    fn issue(&self, command: ExecutionCommand) {
        log::info!("Execution command issued: {:?}", command);
        self.acknowledged.send_replace(false);
        self.command.send_replace(Some(command));
    }

    pub fn command(&self) -> Option<ExecutionCommand> {
        *self.command.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.command() == Some(ExecutionCommand::Cancel)
    }

    pub fn is_ended(&self) -> bool {
        self.command() == Some(ExecutionCommand::EndExperiment)
    }

    pub fn should_stop(&self) -> bool {
        self.command().is_some()
    }

    /// Mark the pending command as handled by the walk
    pub fn acknowledge(&self) {
        if self.should_stop() {
            log::debug!("Execution command acknowledged");
            self.acknowledged.send_replace(true);
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        *self.acknowledged.borrow()
    }

    /// Resolves once a command is pending
    pub async fn stopped(&self) -> ExecutionCommand {
        let mut rx = self.command.subscribe();
        loop {
            if let Some(command) = *rx.borrow_and_update() {
                return command;
            }
            // the sender lives in self, so the channel cannot close here
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Wait up to `timeout` for the walk to acknowledge the pending command
    pub async fn wait_for_acknowledgement(&self, timeout: Duration) -> bool {
        let mut rx = self.acknowledged.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|ack| *ack))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Clear any command so the state can be reused for another walk
    pub fn reset(&self) {
        self.command.send_replace(None);
        self.acknowledged.send_replace(false);
    }
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self::new()
    }
}
