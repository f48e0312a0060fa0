// SPDX-License-Identifier: MIT

//! Graph nodes and node runs
//!
//! A [`Node`] is immutable topology: id, policy, configuration and port map.
//! Each visit of a node produces a [`NodeRun`] holding the session, the
//! iteration history and the classification of that visit.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::core::error::FlowError;
use crate::core::session::{
    ExecutionStats, ExperimentConfig, ExperimentSession, ExperimentSessionFactory,
    IterationReport, IterationStatus, SessionEvent,
};
use crate::flow::events::EventHub;
use crate::flow::report::UnwiredPort;
use crate::flow::state::{ExecutionCommand, ExecutionState};
use crate::flow::tracker::{AdaptiveAnalysis, ExperimentTracker, RecoveryPotential, SharedTracker};

use super::adaptive;
use super::policy::{self, Decision, PolicyInput};
use super::types::{NodeIndex, PolicyKind, Port, PortMap};

/// A bound node of the flow graph
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub kind: PolicyKind,
    /// Experiment configuration; Start and End nodes may have none
    pub config: Option<ExperimentConfig>,
    pub ports: PortMap,
}

/// One recorded iteration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationResult {
    pub iteration: u32,
    pub status: IterationStatus,
    pub scratchpad: String,
    pub seed: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&IterationReport> for IterationResult {
    fn from(report: &IterationReport) -> Self {
        Self {
            iteration: report.iteration,
            status: report.status,
            scratchpad: report.scratchpad.clone(),
            seed: report.seed.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Collaborators a node run needs
pub struct NodeContext<'a> {
    pub factory: &'a dyn ExperimentSessionFactory,
    pub state: &'a ExecutionState,
    pub tracker: &'a SharedTracker,
    pub events: &'a EventHub,
    /// Bounded wait on the session; `None` waits indefinitely
    pub wait_timeout: Option<Duration>,
}

/// Outcome of one visit of a node
pub struct NodeRun {
    pub node: NodeIndex,
    /// Configuration the session actually ran with
    pub config: Option<ExperimentConfig>,
    pub results: Vec<IterationResult>,
    pub stats: ExecutionStats,
    pub max_iterations: u32,
    pub output_port: Option<Port>,
    /// Overall status the node reports
    pub status: IterationStatus,
    /// Operator command that interrupted the run
    pub interrupted: Option<ExecutionCommand>,
    /// The session flagged an iteration as flow-stopping
    pub aborted: bool,
    /// Reason the session gave for failing the experiment
    pub failure: Option<String>,
    pub adaptive: Option<AdaptiveAnalysis>,
    /// Set by [`Node::get_next_node`] when the chosen port is unbound
    pub unwired: Option<UnwiredPort>,
    session: Option<Box<dyn ExperimentSession>>,
}

impl NodeRun {
    pub fn new(node: NodeIndex) -> Self {
        Self {
            node,
            config: None,
            results: Vec::new(),
            stats: ExecutionStats::default(),
            max_iterations: 0,
            output_port: None,
            status: IterationStatus::Unknown,
            interrupted: None,
            aborted: false,
            failure: None,
            adaptive: None,
            unwired: None,
            session: None,
        }
    }

    pub fn iteration_count(&self) -> usize {
        self.results.len()
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Ask the session to abort. Used by the executor on hardware failures.
    pub async fn emergency_cancel(&mut self) {
        if let Some(session) = self.session.as_mut() {
            log::warn!("Emergency cancel of running session");
            if let Err(e) = session.cancel_experiment().await {
                log::error!("Emergency cancel failed: {}", e);
            }
        }
    }

    /// Drop the session once the executor is done with the visit
    pub fn release_session(&mut self) {
        self.session = None;
    }
}

enum Step {
    Interrupted(ExecutionCommand),
    Event(SessionEvent),
}

fn with_tracker<R>(tracker: &SharedTracker, f: impl FnOnce(&mut ExperimentTracker) -> R) -> R {
    let mut guard = tracker.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut guard)
}

impl Node {
    pub fn port(&self, port: Port) -> Option<NodeIndex> {
        self.ports[port.index()]
    }

    /// Port 1 when bound, otherwise the lowest bound port
    fn start_port(&self) -> Port {
        if self.port(Port::Repro).is_some() {
            return Port::Repro;
        }
        Port::ALL
            .into_iter()
            .find(|p| self.port(*p).is_some())
            .unwrap_or(Port::Repro)
    }

    /// Drive the experiment for this node and classify the result into `run`
    pub async fn run_experiment(
        &self,
        ctx: &NodeContext<'_>,
        run: &mut NodeRun,
    ) -> Result<(), FlowError> {
        match self.kind {
            PolicyKind::Start => {
                run.output_port = Some(self.start_port());
                run.status = IterationStatus::Pass;
                return Ok(());
            }
            PolicyKind::End => {
                run.status = IterationStatus::Pass;
                return Ok(());
            }
            _ => {}
        }

        let base = self.config.clone().ok_or_else(|| {
            FlowError::other(format!("Node '{}' has no experiment configuration", self.id))
        })?;

        let mut recovery = RecoveryPotential::Unknown;
        let config = if self.kind == PolicyKind::Adaptive {
            match with_tracker(ctx.tracker, |t| t.adaptive_analysis()) {
                Some(analysis) => {
                    ctx.events.node_status(
                        &self.id,
                        &self.name,
                        format!(
                            "Adaptive seed from '{}': {}",
                            analysis.source_node_name, analysis.selection_reason
                        ),
                    );
                    recovery = analysis.recovery_potential;
                    let seeded = adaptive::seed_config(&base, &analysis);
                    run.adaptive = Some(analysis);
                    seeded
                }
                None => {
                    log::warn!(
                        "No prior AllFail results for adaptive node {}, using its own configuration",
                        self.id
                    );
                    base
                }
            }
        } else {
            base
        };

        run.max_iterations = policy::max_iterations(&config);
        run.config = Some(config.clone());
        with_tracker(ctx.tracker, |t| {
            t.start_experiment(&self.id, &self.name, self.kind, &config)
        });

        let session = run.session.insert(ctx.factory.create(&config)?);
        let handle = session.start(&config).await?;
        ctx.events.node_status(
            &self.id,
            &self.name,
            format!(
                "Experiment '{}' started (max {} iterations)",
                handle.experiment_name, run.max_iterations
            ),
        );

        let mut iteration_count = 0u32;
        loop {
            let step = tokio::select! {
                biased;
                command = ctx.state.stopped() => Step::Interrupted(command),
                event = session.wait_for_next_event(ctx.wait_timeout) => Step::Event(event?),
            };

            match step {
                Step::Interrupted(command) => {
                    let sent = match command {
                        ExecutionCommand::Cancel => session.cancel_experiment().await,
                        ExecutionCommand::EndExperiment => session.end_current_experiment().await,
                    };
                    if let Err(e) = sent {
                        log::warn!("Session did not accept {:?}: {}", command, e);
                    }
                    run.interrupted = Some(command);
                    break;
                }
                Step::Event(SessionEvent::IterationComplete { report, stats }) => {
                    iteration_count += 1;
                    run.results.push(IterationResult::from(&report));
                    run.stats = stats;
                    run.aborted |= report.abort_flow;
                    with_tracker(ctx.tracker, |t| t.track_iteration(&self.id, &report, &run.stats));
                    ctx.events.node_status(
                        &self.id,
                        &self.name,
                        format!(
                            "Iteration {}: {} (pass {:.1}%, fail {:.1}%, trend {:?})",
                            report.iteration,
                            report.status,
                            run.stats.pass_rate,
                            run.stats.fail_rate,
                            run.stats.recent_trend
                        ),
                    );

                    let statuses: Vec<IterationStatus> =
                        run.results.iter().map(|r| r.status).collect();
                    let input = PolicyInput {
                        stats: &run.stats,
                        statuses: &statuses,
                        iteration_count,
                        max_iterations: run.max_iterations,
                        aborted: run.aborted,
                        recovery,
                    };
                    match policy::decide(self.kind, &input) {
                        Decision::Continue => session.continue_next_iteration().await?,
                        Decision::End => {
                            session.end_current_experiment().await?;
                            break;
                        }
                        Decision::Cancel => {
                            log::warn!("Session requested flow abort at iteration {}", report.iteration);
                            session.cancel_experiment().await?;
                            break;
                        }
                    }
                }
                Step::Event(SessionEvent::ExperimentComplete) => break,
                Step::Event(SessionEvent::ExperimentFailed { reason }) => {
                    log::error!("Experiment failed on node {}: {}", self.id, reason);
                    run.failure = Some(reason);
                    break;
                }
                Step::Event(SessionEvent::Timeout) => match ctx.wait_timeout {
                    Some(limit) => {
                        log::warn!("No session event within {:?} on node {}", limit, self.id);
                        session.cancel_experiment().await?;
                        run.failure = Some(format!("no session event within {:?}", limit));
                        break;
                    }
                    None => continue,
                },
            }
        }

        let statuses: Vec<IterationStatus> = run.results.iter().map(|r| r.status).collect();
        let input = PolicyInput {
            stats: &run.stats,
            statuses: &statuses,
            iteration_count,
            max_iterations: run.max_iterations,
            aborted: run.aborted,
            recovery,
        };
        let port = policy::classify(self.kind, &input);
        run.output_port = Some(port);
        run.status = match port {
            Port::NoRepro => IterationStatus::Pass,
            Port::Repro | Port::Intermittent => IterationStatus::Fail,
            Port::HardwareFailure => IterationStatus::ExecutionFail,
        };
        with_tracker(ctx.tracker, |t| {
            t.complete_experiment(&self.id, &run.stats, Some(port))
        });

        Ok(())
    }

    /// Follow the chosen port. An unbound port sets the run's unwired flag
    /// and returns `None`; End nodes always return `None`.
    pub fn get_next_node(&self, run: &mut NodeRun) -> Option<NodeIndex> {
        if self.kind == PolicyKind::End {
            return None;
        }
        let port = run.output_port?;
        match self.port(port) {
            Some(next) => Some(next),
            None => {
                log::warn!(
                    "Node {} routed to unbound port {} ({})",
                    self.id,
                    port,
                    port.label()
                );
                run.unwired = Some(UnwiredPort::new(port));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scripted::{ExperimentScript, ScriptedSessionFactory};
    use crate::flow::report::UnwiredReason;
    use serde_json::Map;
    use std::sync::Arc;

    fn node(kind: PolicyKind, ports: PortMap) -> Node {
        Node {
            id: "n1".to_string(),
            name: "Node 1".to_string(),
            kind,
            config: Some(ExperimentConfig::new("cfgX", Map::new())),
            ports,
        }
    }

    struct Fixture {
        factory: ScriptedSessionFactory,
        state: ExecutionState,
        tracker: SharedTracker,
        events: EventHub,
    }

    impl Fixture {
        fn new(script: ExperimentScript) -> Self {
            Self {
                factory: ScriptedSessionFactory::new().with_script("cfgX", script),
                state: ExecutionState::new(),
                tracker: ExperimentTracker::shared(),
                events: EventHub::new(),
            }
        }

        fn ctx(&self) -> NodeContext<'_> {
            NodeContext {
                factory: &self.factory,
                state: &self.state,
                tracker: &self.tracker,
                events: &self.events,
                wait_timeout: None,
            }
        }
    }

    #[tokio::test]
    async fn test_all_fail_run_routes_to_port_one() {
        let fixture = Fixture::new(ExperimentScript::repeat(IterationStatus::Fail, 5));
        let n = node(PolicyKind::AllFail, [None, Some(NodeIndex(1)), None, None]);
        let mut run = NodeRun::new(NodeIndex(0));

        n.run_experiment(&fixture.ctx(), &mut run).await.unwrap();

        // three straight fails are already sufficient data
        assert_eq!(run.iteration_count(), 3);
        assert_eq!(run.output_port, Some(Port::Repro));
        assert_eq!(run.status, IterationStatus::Fail);
        assert_eq!(n.get_next_node(&mut run), Some(NodeIndex(1)));
        assert!(run.unwired.is_none());

        let tracker = fixture.tracker.lock().unwrap();
        assert_eq!(tracker.record("n1").unwrap().iterations.len(), 3);
    }

    #[tokio::test]
    async fn test_unbound_port_sets_unwired_flag() {
        let fixture = Fixture::new(ExperimentScript::repeat(IterationStatus::Pass, 5));
        let n = node(PolicyKind::AllFail, [None, Some(NodeIndex(1)), None, None]);
        let mut run = NodeRun::new(NodeIndex(0));

        n.run_experiment(&fixture.ctx(), &mut run).await.unwrap();
        assert_eq!(run.output_port, Some(Port::NoRepro));
        assert_eq!(n.get_next_node(&mut run), None);

        let unwired = run.unwired.unwrap();
        assert_eq!(unwired.port, Port::NoRepro);
        assert_eq!(unwired.reason, UnwiredReason::NoRepro);
    }

    #[tokio::test]
    async fn test_start_prefers_port_one() {
        let fixture = Fixture::new(ExperimentScript::default());
        let mut run = NodeRun::new(NodeIndex(0));
        let start = node(PolicyKind::Start, [Some(NodeIndex(2)), Some(NodeIndex(1)), None, None]);
        start.run_experiment(&fixture.ctx(), &mut run).await.unwrap();
        assert_eq!(run.output_port, Some(Port::Repro));
        assert_eq!(run.status, IterationStatus::Pass);

        let mut run = NodeRun::new(NodeIndex(0));
        let start = node(PolicyKind::Start, [None, None, Some(NodeIndex(3)), None]);
        start.run_experiment(&fixture.ctx(), &mut run).await.unwrap();
        assert_eq!(run.output_port, Some(Port::Intermittent));
        assert_eq!(start.get_next_node(&mut run), Some(NodeIndex(3)));
        assert!(!run.has_session());
    }

    #[tokio::test]
    async fn test_end_node_has_no_next() {
        let fixture = Fixture::new(ExperimentScript::default());
        let end = node(PolicyKind::End, [None; 4]);
        let mut run = NodeRun::new(NodeIndex(0));
        end.run_experiment(&fixture.ctx(), &mut run).await.unwrap();
        assert_eq!(end.get_next_node(&mut run), None);
        assert!(run.unwired.is_none());
    }

    #[tokio::test]
    async fn test_abort_flag_forces_hardware_port() {
        let script = ExperimentScript::repeat(IterationStatus::Fail, 5).with_abort_at(2);
        let fixture = Fixture::new(script);
        let n = node(PolicyKind::MajorityFail, [None; 4]);
        let mut run = NodeRun::new(NodeIndex(0));
        n.run_experiment(&fixture.ctx(), &mut run).await.unwrap();

        assert!(run.aborted);
        assert_eq!(run.iteration_count(), 2);
        assert_eq!(run.output_port, Some(Port::HardwareFailure));
    }

    #[tokio::test]
    async fn test_failed_experiment_without_iterations() {
        let fixture = Fixture::new(ExperimentScript::default().with_failure("unit did not boot"));
        let n = node(PolicyKind::SingleFail, [None; 4]);
        let mut run = NodeRun::new(NodeIndex(0));
        n.run_experiment(&fixture.ctx(), &mut run).await.unwrap();

        assert_eq!(run.failure.as_deref(), Some("unit did not boot"));
        assert_eq!(run.output_port, Some(Port::HardwareFailure));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_waiting_node() {
        let fixture = Arc::new(Fixture::new(ExperimentScript::default().hanging()));
        let n = node(PolicyKind::AllFail, [None; 4]);

        let canceller = {
            let fixture = fixture.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                fixture.state.cancel();
            })
        };

        let mut run = NodeRun::new(NodeIndex(0));
        n.run_experiment(&fixture.ctx(), &mut run).await.unwrap();
        canceller.await.unwrap();

        assert_eq!(run.interrupted, Some(ExecutionCommand::Cancel));
        assert_eq!(run.iteration_count(), 0);
    }

    #[tokio::test]
    async fn test_bounded_wait_times_out() {
        let fixture = Fixture::new(ExperimentScript::default().hanging());
        let n = node(PolicyKind::AllFail, [None; 4]);
        let mut ctx = fixture.ctx();
        ctx.wait_timeout = Some(Duration::from_millis(10));

        let mut run = NodeRun::new(NodeIndex(0));
        n.run_experiment(&ctx, &mut run).await.unwrap();
        assert!(run.failure.unwrap().contains("no session event"));
        assert_eq!(run.output_port, Some(Port::HardwareFailure));
    }

    #[tokio::test]
    async fn test_session_start_failure_is_an_error() {
        let fixture = Fixture::new(ExperimentScript::default().with_start_failure("no unit"));
        let n = node(PolicyKind::AllFail, [None; 4]);
        let mut run = NodeRun::new(NodeIndex(0));
        let err = n.run_experiment(&fixture.ctx(), &mut run).await.unwrap_err();
        assert!(matches!(err, FlowError::Session(_)));
        assert!(run.has_session());
    }
}
