// SPDX-License-Identifier: MIT

//! Scripted experiment sessions
//!
//! A [`ScriptedSession`] replays a fixed list of iteration statuses for a
//! configuration key instead of talking to hardware. The CLI dry run, the
//! HTTP surface and the tests all drive the engine through it.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::error::{ConfigError, SessionError};
use super::session::{
    ExecutionStats, ExperimentConfig, ExperimentSession, ExperimentSessionFactory,
    IterationReport, IterationStatus, SessionEvent, SessionHandle,
};
use super::stats::StatsAccumulator;

/// Replay script for one configuration key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "ScriptEntry")]
pub struct ExperimentScript {
    pub statuses: Vec<IterationStatus>,
    /// 1-based iterations reported with `abort_flow` set
    pub abort_at: Vec<u32>,
    /// Simulated iteration duration in milliseconds
    pub delay_ms: u64,
    /// Refuse to start with this message
    pub fail_start: Option<String>,
    /// Report `experiment_failed` once the statuses run out
    pub fail_with: Option<String>,
    /// Never finish once the statuses run out
    pub hang_when_exhausted: bool,
    /// Sweep value reported with each iteration, by index
    pub sweep_values: Vec<f64>,
    pub scratchpad: String,
    pub seed: String,
}

/// Accepted file shapes: a bare status list or the full object
#[derive(Deserialize)]
#[serde(untagged)]
enum ScriptEntry {
    Statuses(Vec<IterationStatus>),
    Full {
        #[serde(default)]
        statuses: Vec<IterationStatus>,
        #[serde(default)]
        abort_at: Vec<u32>,
        #[serde(default)]
        delay_ms: u64,
        #[serde(default)]
        fail_start: Option<String>,
        #[serde(default)]
        fail_with: Option<String>,
        #[serde(default)]
        hang_when_exhausted: bool,
        #[serde(default)]
        sweep_values: Vec<f64>,
        #[serde(default)]
        scratchpad: String,
        #[serde(default)]
        seed: String,
    },
}

impl From<ScriptEntry> for ExperimentScript {
    fn from(entry: ScriptEntry) -> Self {
        match entry {
            ScriptEntry::Statuses(statuses) => Self {
                statuses,
                ..Default::default()
            },
            ScriptEntry::Full {
                statuses,
                abort_at,
                delay_ms,
                fail_start,
                fail_with,
                hang_when_exhausted,
                sweep_values,
                scratchpad,
                seed,
            } => Self {
                statuses,
                abort_at,
                delay_ms,
                fail_start,
                fail_with,
                hang_when_exhausted,
                sweep_values,
                scratchpad,
                seed,
            },
        }
    }
}

impl ExperimentScript {
    pub fn new(statuses: Vec<IterationStatus>) -> Self {
        Self {
            statuses,
            ..Default::default()
        }
    }

    /// `count` copies of the same status
    pub fn repeat(status: IterationStatus, count: usize) -> Self {
        Self::new(vec![status; count])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_abort_at(mut self, iteration: u32) -> Self {
        self.abort_at.push(iteration);
        self
    }

    pub fn with_start_failure(mut self, message: impl Into<String>) -> Self {
        self.fail_start = Some(message.into());
        self
    }

    pub fn with_failure(mut self, reason: impl Into<String>) -> Self {
        self.fail_with = Some(reason.into());
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hang_when_exhausted = true;
        self
    }

    pub fn with_sweep_values(mut self, values: Vec<f64>) -> Self {
        self.sweep_values = values;
        self
    }

    pub fn with_identifiers(mut self, scratchpad: impl Into<String>, seed: impl Into<String>) -> Self {
        self.scratchpad = scratchpad.into();
        self.seed = seed.into();
        self
    }
}

/// Session that replays an [`ExperimentScript`]
pub struct ScriptedSession {
    script: ExperimentScript,
    cursor: usize,
    stats: StatsAccumulator,
    started: bool,
    finished: bool,
    cancelled: bool,
}

impl ScriptedSession {
    pub fn new(script: ExperimentScript) -> Self {
        Self {
            script,
            cursor: 0,
            stats: StatsAccumulator::new(),
            started: false,
            finished: false,
            cancelled: false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    fn next_report(&mut self) -> Option<IterationReport> {
        let status = *self.script.statuses.get(self.cursor)?;
        let iteration = self.cursor as u32 + 1;
        let report = IterationReport {
            iteration,
            status,
            scratchpad: self.script.scratchpad.clone(),
            seed: self.script.seed.clone(),
            sweep_value: self.script.sweep_values.get(self.cursor).copied(),
            abort_flow: self.script.abort_at.contains(&iteration),
        };
        self.cursor += 1;
        self.stats.record(status);
        Some(report)
    }
}

#[async_trait]
impl ExperimentSession for ScriptedSession {
    async fn start(&mut self, config: &ExperimentConfig) -> Result<SessionHandle, SessionError> {
        let experiment_name = config.test_name().unwrap_or(&config.key).to_string();
        if let Some(message) = &self.script.fail_start {
            return Err(SessionError::start(experiment_name, message.clone()));
        }

        log::debug!(
            "Scripted session starting '{}' with {} iteration(s)",
            experiment_name,
            self.script.statuses.len()
        );
        self.started = true;
        Ok(SessionHandle {
            experiment_name,
            started_at: Utc::now(),
        })
    }

    async fn wait_for_next_event(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<SessionEvent, SessionError> {
        if !self.started {
            return Err(SessionError::Disconnected(
                "session was never started".to_string(),
            ));
        }
        if self.finished {
            return Ok(SessionEvent::ExperimentComplete);
        }

        if self.cursor >= self.script.statuses.len() {
            if let Some(reason) = &self.script.fail_with {
                self.finished = true;
                return Ok(SessionEvent::ExperimentFailed {
                    reason: reason.clone(),
                });
            }
            if self.script.hang_when_exhausted {
                match timeout {
                    Some(limit) => {
                        tokio::time::sleep(limit).await;
                        return Ok(SessionEvent::Timeout);
                    }
                    None => std::future::pending::<()>().await,
                }
            }
            self.finished = true;
            return Ok(SessionEvent::ExperimentComplete);
        }

        if self.script.delay_ms > 0 {
            let delay = Duration::from_millis(self.script.delay_ms);
            match timeout {
                Some(limit) if limit < delay => {
                    tokio::time::sleep(limit).await;
                    return Ok(SessionEvent::Timeout);
                }
                _ => tokio::time::sleep(delay).await,
            }
        }

        match self.next_report() {
            Some(report) => Ok(SessionEvent::IterationComplete {
                report,
                stats: self.stats.snapshot(),
            }),
            None => Ok(SessionEvent::ExperimentComplete),
        }
    }

    async fn continue_next_iteration(&mut self) -> Result<(), SessionError> {
        if self.finished {
            return Err(SessionError::command("continue", "experiment already finished"));
        }
        Ok(())
    }

    async fn end_current_experiment(&mut self) -> Result<(), SessionError> {
        self.finished = true;
        Ok(())
    }

    async fn cancel_experiment(&mut self) -> Result<(), SessionError> {
        self.finished = true;
        self.cancelled = true;
        Ok(())
    }

    fn get_iteration_statistics(&self) -> ExecutionStats {
        self.stats.snapshot()
    }
}

/// Factory handing out [`ScriptedSession`]s by configuration key
#[derive(Clone, Default)]
pub struct ScriptedSessionFactory {
    scripts: HashMap<String, ExperimentScript>,
    created: Arc<Mutex<Vec<ExperimentConfig>>>,
}

impl ScriptedSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, key: impl Into<String>, script: ExperimentScript) -> Self {
        self.scripts.insert(key.into(), script);
        self
    }

    pub fn from_scripts(scripts: HashMap<String, ExperimentScript>) -> Self {
        Self {
            scripts,
            created: Arc::default(),
        }
    }

    /// Load a script book (`configKey -> script`) from JSON or YAML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let scripts = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };
        Ok(Self::from_scripts(scripts))
    }

    /// Configurations sessions were created for, in order
    pub fn created_configs(&self) -> Vec<ExperimentConfig> {
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ExperimentSessionFactory for ScriptedSessionFactory {
    fn create(
        &self,
        config: &ExperimentConfig,
    ) -> Result<Box<dyn ExperimentSession>, SessionError> {
        let script = self.scripts.get(&config.key).cloned().ok_or_else(|| {
            SessionError::start(&config.key, "no script registered for this configuration")
        })?;
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(config.clone());
        Ok(Box::new(ScriptedSession::new(script)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn config(key: &str) -> ExperimentConfig {
        ExperimentConfig::new(key, Map::new())
    }

    #[tokio::test]
    async fn test_replays_statuses_then_completes() {
        let mut session = ScriptedSession::new(ExperimentScript::new(vec![
            IterationStatus::Fail,
            IterationStatus::Pass,
        ]));
        session.start(&config("cfg")).await.unwrap();

        match session.wait_for_next_event(None).await.unwrap() {
            SessionEvent::IterationComplete { report, stats } => {
                assert_eq!(report.iteration, 1);
                assert_eq!(report.status, IterationStatus::Fail);
                assert_eq!(stats.fail_count, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
        session.continue_next_iteration().await.unwrap();
        assert!(matches!(
            session.wait_for_next_event(None).await.unwrap(),
            SessionEvent::IterationComplete { .. }
        ));
        assert_eq!(
            session.wait_for_next_event(None).await.unwrap(),
            SessionEvent::ExperimentComplete
        );
        assert_eq!(session.get_iteration_statistics().total_completed, 2);
    }

    #[tokio::test]
    async fn test_cancel_finishes_session() {
        let mut session = ScriptedSession::new(
            ExperimentScript::repeat(IterationStatus::Fail, 3)
                .with_identifiers("sp_2", "0x51")
                .with_sweep_values(vec![0.9]),
        );
        session.start(&config("cfg")).await.unwrap();
        assert!(!session.is_cancelled());

        match session.wait_for_next_event(None).await.unwrap() {
            SessionEvent::IterationComplete { report, .. } => {
                assert_eq!(report.scratchpad, "sp_2");
                assert_eq!(report.seed, "0x51");
                assert_eq!(report.sweep_value, Some(0.9));
            }
            other => panic!("unexpected event {:?}", other),
        }

        session.cancel_experiment().await.unwrap();
        assert!(session.is_cancelled());
        assert_eq!(
            session.wait_for_next_event(None).await.unwrap(),
            SessionEvent::ExperimentComplete
        );
        assert!(session.continue_next_iteration().await.is_err());
    }

    #[tokio::test]
    async fn test_start_failure() {
        let mut session =
            ScriptedSession::new(ExperimentScript::default().with_start_failure("no unit"));
        let err = session.start(&config("cfg")).await.unwrap_err();
        assert!(matches!(err, SessionError::Start { .. }));
    }

    #[tokio::test]
    async fn test_slow_iteration_times_out() {
        let script = ExperimentScript::repeat(IterationStatus::Pass, 1)
            .with_delay(Duration::from_millis(200));
        let mut session = ScriptedSession::new(script);
        session.start(&config("cfg")).await.unwrap();
        let event = session
            .wait_for_next_event(Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(event, SessionEvent::Timeout);
    }

    #[tokio::test]
    async fn test_end_finishes_session() {
        let mut session = ScriptedSession::new(ExperimentScript::repeat(IterationStatus::Pass, 5));
        session.start(&config("cfg")).await.unwrap();
        session.wait_for_next_event(None).await.unwrap();
        session.end_current_experiment().await.unwrap();
        assert_eq!(
            session.wait_for_next_event(None).await.unwrap(),
            SessionEvent::ExperimentComplete
        );
        assert!(session.continue_next_iteration().await.is_err());
    }

    #[test]
    fn test_factory_requires_script() {
        let factory = ScriptedSessionFactory::new()
            .with_script("cfgA", ExperimentScript::repeat(IterationStatus::Pass, 1));
        assert!(factory.create(&config("cfgA")).is_ok());
        assert!(factory.create(&config("cfgB")).is_err());
        assert_eq!(factory.created_configs().len(), 1);
    }

    #[test]
    fn test_script_book_shapes() {
        let yaml = r#"
cfgA: [FAIL, FAIL, PASS]
cfgB:
  statuses: [EXECUTION_FAIL]
  fail_with: "unit hung"
  abort_at: [1]
"#;
        let scripts: HashMap<String, ExperimentScript> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(scripts["cfgA"].statuses.len(), 3);
        assert_eq!(scripts["cfgB"].fail_with.as_deref(), Some("unit hung"));
        assert_eq!(scripts["cfgB"].abort_at, vec![1]);
    }
}
