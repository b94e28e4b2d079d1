//! Coordinator loop for converging the host.
//!
//! The coordinator:
//! - Watches the policy channel and resolves each new policy against the
//!   operator's current snapshot
//! - Turns control commands (restart, upgrade) into plans on the same path
//! - Hands plans to the operator without waiting, so a newer plan can
//!   supersede in-flight artifact work
//! - Re-resolves the latest policy once overlapping plans have all
//!   finished, since a plan resolved while another was in flight may have
//!   raced it

use std::sync::Arc;

use convoy_reconcile::{ComponentId, ComponentRegistry, Resolver, Step};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::control::ControlCommand;
use crate::operator::Operator;
use crate::source::Policy;

/// Copy of `policy` with every component moved to `version`.
///
/// Pinned checksums belong to the old version and are dropped.
pub fn with_version(policy: &Policy, version: &str) -> Policy {
    let mut next = policy.clone();
    for component in &mut next.components {
        if component.version != version {
            component.version = version.to_string();
            component.sha512 = None;
        }
    }
    next
}

pub struct Coordinator {
    operator: Arc<Operator>,
    policies: watch::Receiver<Option<Arc<Policy>>>,
    commands: mpsc::Receiver<ControlCommand>,
    desired: watch::Sender<Vec<ComponentId>>,
    /// Last policy that resolved cleanly.
    current: Option<Arc<Policy>>,
    registry: Arc<ComponentRegistry>,
    generation: u64,
    in_flight: usize,
    /// A plan was dispatched while another was still running.
    overlapped: bool,
    done_tx: mpsc::UnboundedSender<u64>,
    done_rx: mpsc::UnboundedReceiver<u64>,
}

impl Coordinator {
    pub fn new(
        operator: Arc<Operator>,
        policies: watch::Receiver<Option<Arc<Policy>>>,
        commands: mpsc::Receiver<ControlCommand>,
        desired: watch::Sender<Vec<ComponentId>>,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            operator,
            policies,
            commands,
            desired,
            current: None,
            registry: Arc::new(ComponentRegistry::new()),
            generation: 0,
            in_flight: 0,
            overlapped: false,
            done_tx,
            done_rx,
        }
    }

    /// Run until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting coordinator");

        // A policy published before we started still counts.
        let initial = self.policies.borrow_and_update().clone();
        if let Some(policy) = initial {
            self.apply(policy).await;
        }

        loop {
            tokio::select! {
                changed = self.policies.changed() => {
                    if changed.is_err() {
                        info!("Policy source closed");
                        break;
                    }
                    let policy = self.policies.borrow_and_update().clone();
                    if let Some(policy) = policy {
                        self.apply(policy).await;
                    }
                }
                Some(command) = self.commands.recv() => {
                    self.on_command(command).await;
                }
                Some(generation) = self.done_rx.recv() => {
                    self.in_flight = self.in_flight.saturating_sub(1);
                    if self.in_flight == 0 && std::mem::take(&mut self.overlapped) {
                        if let Some(policy) = self.current.clone() {
                            debug!(generation, "Re-resolving after overlapping plans");
                            self.apply(policy).await;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Coordinator shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn on_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Restart => {
                let resolver = Resolver::new(self.registry.clone());
                let current = self.operator.snapshot().await;
                match resolver.restart_plan(&current) {
                    Ok(plan) => self.dispatch(self.registry.clone(), plan),
                    Err(e) => error!(error = %e, "Failed to plan restart"),
                }
            }
            ControlCommand::Upgrade { version } => {
                let Some(policy) = self.current.clone() else {
                    warn!(version = %version, "No desired state to upgrade");
                    return;
                };
                self.apply(Arc::new(with_version(&policy, &version))).await;
            }
        }
    }

    /// Resolve `policy` against the current snapshot and dispatch the plan.
    ///
    /// Any resolve error aborts the pass before a single step runs.
    async fn apply(&mut self, policy: Arc<Policy>) {
        let registry = match policy.registry() {
            Ok(registry) => Arc::new(registry),
            Err(e) => {
                error!(error = %e, "Invalid program registry, skipping policy");
                return;
            }
        };

        let current = self.operator.snapshot().await;
        let plan = match Resolver::new(registry.clone()).resolve(&policy.components, &current) {
            Ok(plan) => plan,
            Err(e) => {
                error!(error = %e, "Failed to resolve policy, skipping");
                return;
            }
        };

        self.desired.send_replace(policy.component_ids());
        self.current = Some(policy);
        self.registry = registry.clone();

        if plan.is_empty() {
            debug!("Host already converged");
            return;
        }
        self.dispatch(registry, plan);
    }

    fn dispatch(&mut self, registry: Arc<ComponentRegistry>, plan: Vec<Step>) {
        if plan.is_empty() {
            return;
        }

        self.generation += 1;
        let generation = self.generation;
        if self.in_flight > 0 {
            self.overlapped = true;
        }
        self.in_flight += 1;
        info!(
            generation,
            steps = plan.len(),
            plan = %plan.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
            "Dispatching plan"
        );

        let operator = Arc::clone(&self.operator);
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            match operator.execute(registry, plan).await {
                Ok(report) => {
                    for failure in report.failures() {
                        warn!(component_id = %failure.component, step = %failure.step, outcome = ?failure.outcome, "Step failed");
                    }
                    debug!(generation, success = report.is_success(), "Plan finished");
                }
                Err(e) => warn!(generation, error = %e, "Plan not executed"),
            }
            let _ = done.send(generation);
        });
    }
}
