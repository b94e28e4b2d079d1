//! Operator - executes step plans.
//!
//! The operator keeps one [`ComponentWorker`] per component. Steps for the
//! same component run strictly in order on that worker; distinct components
//! run concurrently up to `max_parallel`.
//!
//! A plan runs in two waves: the leading teardown steps (removed
//! components) complete before anything else starts. When a newer plan
//! reaches a component whose previous steps are still in flight, the old
//! steps' cancellation token fires, unless the new steps end where the
//! queued ones already do; those then share the token and run afterwards.
//! Only artifact work observes cancellation; process start and stop always
//! run to completion.

mod worker;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use convoy_reconcile::{
    CancelToken, Classify, ComponentId, ComponentRegistry, ComponentRuntimeState, ErrorClass,
    Phase, ProgramName, Step, StepKind, TransitionError,
};
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::artifact::{Artifacts, DownloadError, InstallError, VerifyError};
use crate::runtime::{ProcessRuntime, SupervisionError};

use worker::{ComponentWorker, Footprints, WorkerContext, WorkerMessage};

// =============================================================================
// Errors and outcomes
// =============================================================================

/// Why a single step failed.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Download(DownloadError),

    #[error(transparent)]
    Verify(VerifyError),

    #[error(transparent)]
    Install(InstallError),

    #[error(transparent)]
    Supervision(#[from] SupervisionError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("unknown program '{0}'")]
    UnknownProgram(ProgramName),

    #[error("artifact {0} is not installed")]
    NotInstalled(String),

    #[error("no check-in within {0:?}")]
    NoCheckIn(Duration),

    #[error("process exited during start (code {0:?})")]
    ExitedDuringStart(Option<i32>),

    #[error("component must be stopped first (currently {0})")]
    NotStopped(Phase),

    #[error("step cancelled")]
    Cancelled,
}

impl From<DownloadError> for StepError {
    fn from(e: DownloadError) -> Self {
        match e.class() {
            ErrorClass::Cancelled => StepError::Cancelled,
            _ => StepError::Download(e),
        }
    }
}

impl From<VerifyError> for StepError {
    fn from(e: VerifyError) -> Self {
        match e.class() {
            ErrorClass::Cancelled => StepError::Cancelled,
            _ => StepError::Verify(e),
        }
    }
}

impl From<InstallError> for StepError {
    fn from(e: InstallError) -> Self {
        match e.class() {
            ErrorClass::Cancelled => StepError::Cancelled,
            _ => StepError::Install(e),
        }
    }
}

impl Classify for StepError {
    fn class(&self) -> ErrorClass {
        match self {
            StepError::Download(e) => e.class(),
            StepError::Verify(e) => e.class(),
            StepError::Install(e) => e.class(),
            StepError::Supervision(_)
            | StepError::NoCheckIn(_)
            | StepError::ExitedDuringStart(_) => ErrorClass::Supervision,
            StepError::Transition(_)
            | StepError::UnknownProgram(_)
            | StepError::NotInstalled(_)
            | StepError::NotStopped(_) => ErrorClass::Permanent,
            StepError::Cancelled => ErrorClass::Cancelled,
        }
    }
}

/// Result of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    Failed(String),
    /// Not attempted because an earlier step for the component failed.
    Skipped,
    /// Cancelled by a newer plan or shutdown.
    Cancelled,
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Succeeded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    pub component: ComponentId,
    pub kind: StepKind,
    /// Human-readable step, e.g. `install(logs@8.3.0)`.
    pub step: String,
    pub outcome: StepOutcome,
}

/// Outcome of every step in a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanReport {
    pub results: Vec<StepResult>,
}

impl PlanReport {
    pub fn is_success(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, StepOutcome::Failed(_)))
    }

    /// Outcome of the first step of `kind` for `component`.
    pub fn outcome(&self, component: &ComponentId, kind: StepKind) -> Option<&StepOutcome> {
        self.results
            .iter()
            .find(|r| &r.component == component && r.kind == kind)
            .map(|r| &r.outcome)
    }
}

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("operator is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Operator
// =============================================================================

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Grace period between the stop signal and a forced kill.
    pub failure_timeout: Duration,
    /// How long a started process may take to check in.
    pub start_timeout: Duration,
    /// Components operated on concurrently.
    pub max_parallel: usize,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            failure_timeout: Duration::from_secs(10),
            start_timeout: Duration::from_secs(30),
            max_parallel: 4,
        }
    }
}

struct WorkerEntry {
    tx: mpsc::Sender<WorkerMessage>,
    state: watch::Receiver<Option<ComponentRuntimeState>>,
    /// Cancels the most recently queued batch.
    supersede: watch::Sender<bool>,
    /// Final step of the most recently queued batch.
    target: Option<Step>,
    queued: usize,
    task: JoinHandle<()>,
}

pub struct Operator {
    ctx: WorkerContext,
    workers: Mutex<BTreeMap<ComponentId, WorkerEntry>>,
    limit: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
    changes: watch::Receiver<u64>,
}

impl Operator {
    pub fn new(
        config: OperatorConfig,
        artifacts: Artifacts,
        runtime: Arc<dyn ProcessRuntime>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (changes_tx, changes) = watch::channel(0u64);
        Self {
            ctx: WorkerContext {
                artifacts,
                runtime,
                failure_timeout: config.failure_timeout,
                start_timeout: config.start_timeout,
                changes: Arc::new(changes_tx),
                footprints: Arc::new(Footprints::default()),
            },
            workers: Mutex::new(BTreeMap::new()),
            limit: Arc::new(Semaphore::new(config.max_parallel.max(1))),
            shutdown,
            changes,
        }
    }

    /// Ticks whenever any component's state changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.clone()
    }

    /// Current state of every known component, ordered by id.
    ///
    /// A component whose worker has died is reported as failed.
    pub async fn snapshot(&self) -> Vec<ComponentRuntimeState> {
        let workers = self.workers.lock().await;
        workers
            .values()
            .filter_map(|entry| {
                let closed = entry.state.has_changed().is_err();
                let mut state = entry.state.borrow().clone()?;
                if closed {
                    state.phase = Phase::Failed;
                    state.last_error = Some("component worker stopped".to_string());
                }
                Some(state)
            })
            .collect()
    }

    /// Execute a plan resolved against `registry` and report the outcome of
    /// every step.
    ///
    /// Component-scoped failures never abort other components; a failed step
    /// only skips the remaining steps of its own component.
    pub async fn execute(
        &self,
        registry: Arc<ComponentRegistry>,
        plan: Vec<Step>,
    ) -> Result<PlanReport, OperatorError> {
        if *self.shutdown.borrow() {
            return Err(OperatorError::ShuttingDown);
        }
        if plan.is_empty() {
            return Ok(PlanReport::default());
        }

        let total = plan.len();
        let mut plan = plan;
        let teardown_len = plan.iter().take_while(|s| s.kind().is_teardown()).count();
        let rest = plan.split_off(teardown_len);

        let mut report = PlanReport::default();
        let mut failed = Vec::new();

        for wave in [plan, rest] {
            if wave.is_empty() {
                continue;
            }
            let results = self
                .run_wave(&registry, group_by_component(wave), &failed)
                .await;
            failed.extend(
                results
                    .iter()
                    .filter(|r| !r.outcome.is_success())
                    .map(|r| r.component.clone()),
            );
            report.results.extend(results);
        }

        self.reap().await;

        info!(
            steps = total,
            failed = report.failures().count(),
            "Plan executed"
        );
        Ok(report)
    }

    async fn run_wave(
        &self,
        registry: &Arc<ComponentRegistry>,
        groups: Vec<(ComponentId, Vec<Step>)>,
        failed: &[ComponentId],
    ) -> Vec<StepResult> {
        let mut batches = Vec::with_capacity(groups.len());
        let mut results_skipped = Vec::new();

        {
            let mut workers = self.workers.lock().await;
            for (id, steps) in groups {
                let labels: Vec<(StepKind, String)> =
                    steps.iter().map(|s| (s.kind(), s.to_string())).collect();

                if failed.contains(&id) {
                    results_skipped.extend(labels.into_iter().map(|(kind, step)| StepResult {
                        component: id.clone(),
                        kind,
                        step,
                        outcome: StepOutcome::Skipped,
                    }));
                    continue;
                }

                let entry = workers
                    .entry(id.clone())
                    .or_insert_with(|| self.spawn_worker(registry.clone(), &steps[0]));

                let target = steps.last().cloned();
                let superseded = if entry.queued > 0 && entry.target == target {
                    debug!(component_id = %id, "Queued steps already reach this target");
                    entry.supersede.subscribe()
                } else {
                    let (supersede, superseded) = watch::channel(false);
                    if entry.supersede.send(true).is_ok() {
                        debug!(component_id = %id, "Superseding in-flight steps");
                    }
                    entry.supersede = supersede;
                    superseded
                };
                entry.target = target;
                entry.queued += 1;

                let cancel = CancelToken::new(superseded).with(self.shutdown.clone());
                let (reply, outcomes) = oneshot::channel();
                batches.push((
                    id,
                    labels,
                    entry.tx.clone(),
                    WorkerMessage::Run {
                        steps,
                        registry: registry.clone(),
                        cancel,
                        reply,
                    },
                    outcomes,
                ));
            }
        }

        let runs = batches.into_iter().map(|(id, labels, tx, msg, outcomes)| {
            let limit = self.limit.clone();
            async move {
                let outcomes = match limit.acquire_owned().await {
                    Ok(_permit) => match tx.send(msg).await {
                        Ok(()) => outcomes.await.ok(),
                        Err(_) => None,
                    },
                    Err(_) => None,
                };
                let outcomes = outcomes.unwrap_or_else(|| {
                    warn!(component_id = %id, "Component worker unavailable");
                    vec![StepOutcome::Failed("component worker unavailable".to_string()); labels.len()]
                });

                labels
                    .into_iter()
                    .zip(outcomes)
                    .map(|((kind, step), outcome)| StepResult {
                        component: id.clone(),
                        kind,
                        step,
                        outcome,
                    })
                    .collect::<Vec<_>>()
            }
        });

        let mut results: Vec<StepResult> = join_all(runs).await.into_iter().flatten().collect();

        {
            let mut workers = self.workers.lock().await;
            for id in results.iter().map(|r| &r.component).collect::<std::collections::BTreeSet<_>>() {
                if let Some(entry) = workers.get_mut(id) {
                    entry.queued = entry.queued.saturating_sub(1);
                }
            }
        }

        results.extend(results_skipped);
        results
    }

    fn spawn_worker(&self, registry: Arc<ComponentRegistry>, first: &Step) -> WorkerEntry {
        let spec = match first {
            Step::Upgrade { from, .. } => from.clone(),
            other => other.spec().clone(),
        };
        let (worker, state) = ComponentWorker::new(self.ctx.clone(), registry, spec);
        let (tx, mailbox) = mpsc::channel(32);
        let (supersede, _) = watch::channel(false);
        let task = tokio::spawn(worker.run(mailbox));

        WorkerEntry {
            tx,
            state,
            supersede,
            target: None,
            queued: 0,
            task,
        }
    }

    /// Drop workers for components that were uninstalled and have nothing
    /// queued.
    async fn reap(&self) {
        let mut workers = self.workers.lock().await;
        workers.retain(|id, entry| {
            let keep = entry.queued > 0 || entry.state.borrow().is_some();
            if !keep {
                debug!(component_id = %id, "Discarding component worker");
            }
            keep
        });
    }

    /// Stop every component and wait for the workers to exit.
    pub async fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.workers.lock().await);
        info!(components = workers.len(), "Stopping components");

        let grace = self.ctx.failure_timeout + Duration::from_secs(5);
        let tasks = workers.into_values().map(|entry| {
            let _ = entry.supersede.send(true);
            drop(entry.tx);
            entry.task
        });

        for task in tasks.collect::<Vec<_>>() {
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("Component worker did not exit in time");
            }
        }
    }
}

/// Group steps by component, keeping first-appearance order and each
/// component's step order.
fn group_by_component(steps: Vec<Step>) -> Vec<(ComponentId, Vec<Step>)> {
    let mut groups: Vec<(ComponentId, Vec<Step>)> = Vec::new();
    for step in steps {
        match groups.iter_mut().find(|(id, _)| id == step.component_id()) {
            Some((_, steps)) => steps.push(step),
            None => groups.push((step.component_id().clone(), vec![step])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_reconcile::{ComponentSpec, ProgramName};

    fn spec(id: &str) -> ComponentSpec {
        ComponentSpec::new(
            ComponentId::parse(id).unwrap(),
            ProgramName::parse("filebeat").unwrap(),
            "1.0",
        )
    }

    #[test]
    fn test_group_by_component_keeps_order() {
        let groups = group_by_component(vec![
            Step::Stop(spec("b")),
            Step::Install(spec("a")),
            Step::Uninstall(spec("b")),
            Step::Start(spec("a")),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0.as_str(), "b");
        let kinds: Vec<_> = groups[0].1.iter().map(Step::kind).collect();
        assert_eq!(kinds, vec![StepKind::Stop, StepKind::Uninstall]);
        let kinds: Vec<_> = groups[1].1.iter().map(Step::kind).collect();
        assert_eq!(kinds, vec![StepKind::Install, StepKind::Start]);
    }

    #[test]
    fn test_cancelled_artifact_errors_become_cancelled_steps() {
        assert!(matches!(
            StepError::from(DownloadError::Cancelled),
            StepError::Cancelled
        ));
        assert!(matches!(
            StepError::from(InstallError::Cancelled),
            StepError::Cancelled
        ));
        assert!(matches!(
            StepError::from(DownloadError::NotFound {
                location: "x".into()
            }),
            StepError::Download(_)
        ));
    }

    #[test]
    fn test_report_helpers() {
        let id = ComponentId::parse("a").unwrap();
        let report = PlanReport {
            results: vec![
                StepResult {
                    component: id.clone(),
                    kind: StepKind::Install,
                    step: "install(a@1.0)".into(),
                    outcome: StepOutcome::Failed("boom".into()),
                },
                StepResult {
                    component: id.clone(),
                    kind: StepKind::Start,
                    step: "start(a@1.0)".into(),
                    outcome: StepOutcome::Skipped,
                },
            ],
        };
        assert!(!report.is_success());
        assert_eq!(report.failures().count(), 1);
        assert_eq!(
            report.outcome(&id, StepKind::Start),
            Some(&StepOutcome::Skipped)
        );
    }
}
