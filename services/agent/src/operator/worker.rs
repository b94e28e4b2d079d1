//! Component worker - owns a single component's lifecycle.
//!
//! The worker:
//! - Processes step batches sequentially (no internal concurrency)
//! - Exclusively owns the component's process handle
//! - Publishes a state snapshot after every change
//!
//! ## State Machine
//!
//! ```text
//! stopped -> starting -> running -> stopping -> stopped
//!               |           |          |
//!               +-------> failed <-----+
//! ```

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use convoy_reconcile::{
    with_retry, CancelToken, ComponentId, ComponentRegistry, ComponentRuntimeState, ComponentSpec,
    Health, Phase, ProgramSpec, RetryError, Step,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::{StepError, StepOutcome};
use crate::artifact::{ArtifactRef, Artifacts, InstallError};
use crate::runtime::{LaunchSpec, ProcessEvent, ProcessHandle, ProcessRuntime};

// =============================================================================
// Messages
// =============================================================================

/// Messages handled by a component worker.
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    /// Run steps in order; stop at the first failure.
    Run {
        steps: Vec<Step>,
        /// Registry the steps were resolved against.
        registry: Arc<ComponentRegistry>,
        cancel: CancelToken,
        reply: oneshot::Sender<Vec<StepOutcome>>,
    },
}

/// Dependencies shared by every worker.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub artifacts: Artifacts,
    pub runtime: Arc<dyn ProcessRuntime>,
    pub failure_timeout: Duration,
    pub start_timeout: Duration,
    /// Bumped after every published change, across all workers.
    pub changes: Arc<watch::Sender<u64>>,
    pub footprints: Arc<Footprints>,
}

/// Components using each install path.
///
/// Components on the same program and version share one unpacked tree; it is
/// only removed when the last of them lets go.
#[derive(Debug, Default)]
pub(crate) struct Footprints(Mutex<HashMap<PathBuf, BTreeSet<ComponentId>>>);

impl Footprints {
    pub(crate) fn claim(&self, path: PathBuf, id: &ComponentId) {
        let mut users = self.0.lock().unwrap_or_else(|e| e.into_inner());
        users.entry(path).or_default().insert(id.clone());
    }

    /// Drop `id`'s claim on `path`. Returns false while others still use it.
    pub(crate) fn release(&self, path: &Path, id: &ComponentId) -> bool {
        let mut users = self.0.lock().unwrap_or_else(|e| e.into_inner());
        let Some(set) = users.get_mut(path) else {
            return true;
        };
        set.remove(id);
        if set.is_empty() {
            users.remove(path);
            true
        } else {
            false
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

pub(crate) struct ComponentWorker {
    ctx: WorkerContext,
    registry: Arc<ComponentRegistry>,
    state: ComponentRuntimeState,
    /// `None` once the component has been uninstalled.
    publish: watch::Sender<Option<ComponentRuntimeState>>,
    retired: bool,
    process: Option<ProcessHandle>,
}

impl ComponentWorker {
    pub(crate) fn new(
        ctx: WorkerContext,
        registry: Arc<ComponentRegistry>,
        spec: ComponentSpec,
    ) -> (Self, watch::Receiver<Option<ComponentRuntimeState>>) {
        let state = ComponentRuntimeState::new(spec);
        let (publish, rx) = watch::channel(Some(state.clone()));
        (
            Self {
                ctx,
                registry,
                state,
                publish,
                retired: false,
                process: None,
            },
            rx,
        )
    }

    /// Run until the mailbox closes, then stop any live process.
    pub(crate) async fn run(mut self, mut mailbox: mpsc::Receiver<WorkerMessage>) {
        debug!(component_id = %self.state.id(), "Component worker started");

        loop {
            tokio::select! {
                msg = mailbox.recv() => match msg {
                    Some(WorkerMessage::Run { steps, registry, cancel, reply }) => {
                        self.registry = registry;
                        let outcomes = self.run_steps(steps, &cancel).await;
                        let _ = reply.send(outcomes);
                    }
                    None => break,
                },
                event = next_event(&mut self.process) => self.on_process_event(event),
            }
        }

        if let Some(handle) = self.process.take() {
            info!(component_id = %self.state.id(), "Stopping component on shutdown");
            if let Err(e) = self.ctx.runtime.stop(handle, self.ctx.failure_timeout).await {
                warn!(component_id = %self.state.id(), error = %e, "Failed to stop component");
            }
        }
        debug!(component_id = %self.state.id(), "Component worker exited");
    }

    async fn run_steps(&mut self, steps: Vec<Step>, cancel: &CancelToken) -> Vec<StepOutcome> {
        let mut outcomes = Vec::with_capacity(steps.len());
        let mut halted = false;

        for step in steps {
            if halted {
                debug!(step = %step, "Skipping step after earlier failure");
                outcomes.push(StepOutcome::Skipped);
                continue;
            }

            info!(component_id = %step.component_id(), step = %step, "Executing step");
            let outcome = match self.execute(&step, cancel).await {
                Ok(()) => StepOutcome::Succeeded,
                Err(StepError::Cancelled) => {
                    info!(step = %step, "Step cancelled");
                    StepOutcome::Cancelled
                }
                Err(e) => {
                    error!(component_id = %step.component_id(), step = %step, error = %e, "Step failed");
                    StepOutcome::Failed(e.to_string())
                }
            };
            halted = !outcome.is_success();
            outcomes.push(outcome);
        }

        outcomes
    }

    async fn execute(&mut self, step: &Step, cancel: &CancelToken) -> Result<(), StepError> {
        // Any step other than uninstall brings a retired component back.
        if self.retired && !matches!(step, Step::Uninstall(_)) {
            self.state = ComponentRuntimeState::new(step.spec().clone());
            self.retired = false;
        }

        match step {
            Step::Install(spec) => self.install(spec, cancel).await,
            Step::Start(spec) => self.start(spec).await,
            Step::Configure(spec) => self.configure(spec).await,
            Step::Stop(_) => self.stop().await,
            Step::Uninstall(spec) => self.uninstall(spec, cancel).await,
            Step::Upgrade { from, to } => self.upgrade(from, to, cancel).await,
        }
    }

    // -------------------------------------------------------------------------
    // Step handlers
    // -------------------------------------------------------------------------

    async fn install(&mut self, spec: &ComponentSpec, cancel: &CancelToken) -> Result<(), StepError> {
        let result = self.materialize(spec, cancel).await;
        match &result {
            Ok(()) => {
                if self.process.is_none() {
                    self.state.spec = spec.clone();
                }
                self.state.installed = true;
                self.state.last_error = None;
            }
            Err(StepError::Cancelled) => {
                self.state.last_error = Some("install superseded".to_string());
            }
            Err(e) => self.state.fail(format!("install failed: {e}")),
        }
        self.publish();
        result
    }

    /// Fetch -> verify -> (check) -> install.
    async fn materialize(&self, spec: &ComponentSpec, cancel: &CancelToken) -> Result<(), StepError> {
        let artifact = self.artifact_for(spec)?;
        let artifacts = &self.ctx.artifacts;

        let archive = artifacts.downloader.download(&artifact, cancel).await?;
        artifacts.verifier.verify(&artifact, &archive, cancel).await?;

        let installer = &artifacts.installer;
        let (target, archive_path) = (&artifact, archive.as_path());
        let installed = with_retry(&artifacts.retry, cancel, |_| async move {
            if installer.check(target).await? {
                debug!(artifact = %target, "Artifact already installed");
                return Ok::<(), InstallError>(());
            }
            installer.install(target, archive_path, cancel).await?;
            Ok(())
        })
        .await;
        match installed {
            Ok(()) => {}
            Err(RetryError::Cancelled) => return Err(StepError::Cancelled),
            Err(RetryError::Exhausted { source, .. }) | Err(RetryError::Permanent(source)) => {
                return Err(source.into())
            }
        }
        self.ctx
            .footprints
            .claim(artifacts.layout.install_path(&artifact), &spec.id);
        Ok(())
    }

    async fn start(&mut self, spec: &ComponentSpec) -> Result<(), StepError> {
        if self.process.is_some() && matches!(self.state.phase, Phase::Starting | Phase::Running) {
            debug!(component_id = %spec.id, "Already running");
            return Ok(());
        }

        let result = self.spawn(spec).await;
        if let Err(e) = &result {
            self.state.fail(format!("start failed: {e}"));
            self.state.reset_units(Health::Failed, &e.to_string());
        }
        self.publish();
        result
    }

    async fn spawn(&mut self, spec: &ComponentSpec) -> Result<(), StepError> {
        let program = self.program_for(spec)?;
        let artifact = self.ctx.artifacts.layout.artifact_for(spec, &program);
        if !self.ctx.artifacts.installer.check(&artifact).await? {
            return Err(StepError::NotInstalled(artifact.to_string()));
        }
        self.ctx
            .footprints
            .claim(self.ctx.artifacts.layout.install_path(&artifact), &spec.id);

        self.state.transition(Phase::Starting)?;
        self.state.spec = spec.clone();
        self.state.installed = true;
        self.state.last_error = None;
        self.state.reset_units(Health::Starting, "Starting");
        self.publish();

        let launch = LaunchSpec {
            spec: spec.clone(),
            install_path: self.ctx.artifacts.layout.install_path(&artifact),
            binary: program.binary_name().to_string(),
            args: program.args.clone(),
        };
        let mut handle = self.ctx.runtime.start(&launch).await?;
        self.state.pid = handle.pid;

        let first = tokio::time::timeout(self.ctx.start_timeout, handle.events.recv()).await;
        match first {
            Ok(Some(ProcessEvent::CheckIn { units, version_info })) => {
                self.process = Some(handle);
                for unit in units {
                    self.state.apply_unit_report(unit);
                }
                self.state.version_info = version_info;
                self.state.transition(Phase::Running)?;
                info!(component_id = %spec.id, version = %spec.version, "Component running");
                Ok(())
            }
            Ok(Some(ProcessEvent::Exited { code })) => {
                self.state.pid = None;
                Err(StepError::ExitedDuringStart(code))
            }
            Ok(None) => {
                self.state.pid = None;
                Err(StepError::ExitedDuringStart(None))
            }
            Err(_) => {
                self.state.pid = None;
                if let Err(e) = self.ctx.runtime.stop(handle, self.ctx.failure_timeout).await {
                    warn!(component_id = %spec.id, error = %e, "Failed to stop unresponsive process");
                }
                Err(StepError::NoCheckIn(self.ctx.start_timeout))
            }
        }
    }

    async fn configure(&mut self, spec: &ComponentSpec) -> Result<(), StepError> {
        let Some(handle) = self.process.as_ref() else {
            // Nothing running; the new spec applies on the next start.
            debug!(component_id = %spec.id, "Not running, recording configuration");
            self.state.spec = spec.clone();
            self.publish();
            return Ok(());
        };

        match self.ctx.runtime.configure(handle, spec).await {
            Ok(()) => {
                self.state.spec = spec.clone();
                self.state.last_error = None;
                self.state.reset_units(Health::Starting, "Configuring");
                self.publish();
                info!(component_id = %spec.id, "Component reconfigured");
                Ok(())
            }
            Err(e) => {
                // The process keeps running with its previous configuration.
                let message = format!("configuration rejected: {e}");
                self.state.last_error = Some(message.clone());
                for unit in &mut self.state.units {
                    unit.health = Health::Failed;
                    unit.message = message.clone();
                }
                self.publish();
                Err(e.into())
            }
        }
    }

    async fn stop(&mut self) -> Result<(), StepError> {
        let Some(handle) = self.process.take() else {
            if self.state.phase != Phase::Stopped {
                self.state.transition(Phase::Stopped)?;
            }
            self.state.pid = None;
            self.publish();
            return Ok(());
        };

        self.state.transition(Phase::Stopping)?;
        self.publish();

        let id = self.state.id().clone();
        match self.ctx.runtime.stop(handle, self.ctx.failure_timeout).await {
            Ok(outcome) => {
                debug!(component_id = %id, ?outcome, "Component stopped");
                self.state.transition(Phase::Stopped)?;
                self.state.pid = None;
                self.state.reset_units(Health::Stopped, "Stopped");
                self.publish();
                Ok(())
            }
            Err(e) => {
                self.state.fail(format!("stop failed: {e}"));
                self.state.pid = None;
                self.publish();
                Err(e.into())
            }
        }
    }

    async fn uninstall(&mut self, spec: &ComponentSpec, cancel: &CancelToken) -> Result<(), StepError> {
        let stopped = self.process.is_none()
            && matches!(self.state.phase, Phase::Stopped | Phase::Failed);
        if !stopped {
            return Err(StepError::NotStopped(self.state.phase));
        }

        let artifact = self.removal_artifact(spec);
        let path = self.ctx.artifacts.layout.install_path(&artifact);
        if self.ctx.footprints.release(&path, &spec.id) {
            self.ctx
                .artifacts
                .uninstaller
                .uninstall(&artifact, cancel)
                .await?;
        } else {
            debug!(component_id = %spec.id, path = %path.display(), "Install still in use, keeping it");
        }

        info!(component_id = %spec.id, "Component removed");
        self.retired = true;
        let _ = self.publish.send(None);
        self.bump();
        Ok(())
    }

    /// Stop -> install(new) -> start(new). No rollback on failure.
    async fn upgrade(
        &mut self,
        from: &ComponentSpec,
        to: &ComponentSpec,
        cancel: &CancelToken,
    ) -> Result<(), StepError> {
        self.stop().await?;
        self.install(to, cancel).await?;
        self.start(to).await?;

        info!(component_id = %to.id, from = %from.version, to = %to.version, "Component upgraded");
        self.cleanup_previous(from, to).await;
        Ok(())
    }

    /// Best-effort removal of the previous version's install.
    async fn cleanup_previous(&self, from: &ComponentSpec, to: &ComponentSpec) {
        let old = self.removal_artifact(from);
        let new = self.removal_artifact(to);
        let layout = &self.ctx.artifacts.layout;
        let old_path = layout.install_path(&old);
        if old_path == layout.install_path(&new) || !self.ctx.footprints.release(&old_path, &from.id) {
            return;
        }
        if let Err(e) = self
            .ctx
            .artifacts
            .uninstaller
            .uninstall(&old, &CancelToken::never())
            .await
        {
            warn!(component_id = %from.id, version = %from.version, error = %e, "Failed to remove previous install");
        }
    }

    // -------------------------------------------------------------------------
    // Process events
    // -------------------------------------------------------------------------

    fn on_process_event(&mut self, event: Option<ProcessEvent>) {
        match event {
            Some(ProcessEvent::CheckIn { units, version_info }) => {
                for unit in units {
                    self.state.apply_unit_report(unit);
                }
                if version_info.is_some() {
                    self.state.version_info = version_info;
                }
                if self.state.phase == Phase::Starting {
                    let _ = self.state.transition(Phase::Running);
                }
            }
            Some(ProcessEvent::Exited { code }) => {
                self.process = None;
                self.state.pid = None;
                warn!(component_id = %self.state.id(), ?code, "Component exited unexpectedly");
                let message = match code {
                    Some(code) => format!("process exited with code {code}"),
                    None => "process terminated by signal".to_string(),
                };
                self.state.fail(message.clone());
                self.state.reset_units(Health::Failed, &message);
            }
            None => {
                self.process = None;
                self.state.pid = None;
                self.state.fail("lost contact with process");
            }
        }
        self.publish();
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn program_for(&self, spec: &ComponentSpec) -> Result<ProgramSpec, StepError> {
        self.registry
            .get(&spec.program)
            .cloned()
            .ok_or_else(|| StepError::UnknownProgram(spec.program.clone()))
    }

    fn artifact_for(&self, spec: &ComponentSpec) -> Result<ArtifactRef, StepError> {
        let program = self.program_for(spec)?;
        Ok(self.ctx.artifacts.layout.artifact_for(spec, &program))
    }

    /// Like `artifact_for`, but components whose program has since left the
    /// registry can still be removed using default naming.
    fn removal_artifact(&self, spec: &ComponentSpec) -> ArtifactRef {
        let program = self
            .program_for(spec)
            .unwrap_or_else(|_| ProgramSpec::new(spec.program.clone()));
        self.ctx.artifacts.layout.artifact_for(spec, &program)
    }

    fn publish(&self) {
        if self.retired {
            return;
        }
        let _ = self.publish.send(Some(self.state.clone()));
        self.bump();
    }

    fn bump(&self) {
        self.ctx.changes.send_modify(|n| *n = n.wrapping_add(1));
    }
}

/// Next event from the process, or never when there is none.
async fn next_event(process: &mut Option<ProcessHandle>) -> Option<ProcessEvent> {
    match process {
        Some(handle) => handle.events.recv().await,
        None => std::future::pending().await,
    }
}
