//! State resolver.
//!
//! Diffs a desired component set against the current one and produces an
//! ordered plan. Resolution is pure: the same inputs always yield the same
//! plan, and nothing is executed here.

use std::collections::BTreeMap;
use std::sync::Arc;

use convoy_id::ComponentId;
use tracing::debug;

use crate::error::ResolveError;
use crate::model::{ComponentRuntimeState, ComponentSpec, Phase};
use crate::registry::ComponentRegistry;
use crate::step::Step;

/// Produces step plans from desired and current component sets.
#[derive(Debug, Clone)]
pub struct Resolver {
    registry: Arc<ComponentRegistry>,
}

impl Resolver {
    pub fn new(registry: Arc<ComponentRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Compute the plan moving `current` to `desired`.
    ///
    /// The plan is grouped as removals, then changes to existing components,
    /// then additions. Within a group components are ordered by id. Every
    /// `Stop`/`Uninstall` of a removed component therefore precedes every
    /// `Install`/`Start` the plan contains.
    pub fn resolve(
        &self,
        desired: &[ComponentSpec],
        current: &[ComponentRuntimeState],
    ) -> Result<Vec<Step>, ResolveError> {
        let desired = self.index_desired(desired)?;
        let current = index_current(current)?;

        let mut removals = Vec::new();
        let mut changes = Vec::new();
        let mut additions = Vec::new();

        for (id, state) in &current {
            if !desired.contains_key(id) {
                removals.push(Step::Stop(state.spec.clone()));
                removals.push(Step::Uninstall(state.spec.clone()));
            }
        }

        for (id, spec) in &desired {
            match current.get(id) {
                Some(state) => changes.extend(plan_change(state, spec)),
                None => {
                    additions.push(Step::Install((*spec).clone()));
                    additions.push(Step::Start((*spec).clone()));
                }
            }
        }

        let mut plan = removals;
        plan.append(&mut changes);
        plan.append(&mut additions);

        debug!(
            desired = desired.len(),
            current = current.len(),
            steps = plan.len(),
            "Resolved plan"
        );

        Ok(plan)
    }

    /// Stop and start every component that is running or has failed after
    /// being installed. Components that were never installed are left alone.
    pub fn restart_plan(&self, current: &[ComponentRuntimeState]) -> Result<Vec<Step>, ResolveError> {
        let current = index_current(current)?;
        let mut plan = Vec::new();
        for state in current.values() {
            let restartable = matches!(state.phase, Phase::Running | Phase::Starting)
                || (state.phase == Phase::Failed && state.installed);
            if restartable {
                plan.push(Step::Stop(state.spec.clone()));
                plan.push(Step::Start(state.spec.clone()));
            }
        }
        Ok(plan)
    }

    fn index_desired<'a>(
        &self,
        desired: &'a [ComponentSpec],
    ) -> Result<BTreeMap<&'a ComponentId, &'a ComponentSpec>, ResolveError> {
        let mut index = BTreeMap::new();
        for spec in desired {
            spec.validate()?;
            if !self.registry.contains(&spec.program) {
                return Err(ResolveError::UnknownProgram {
                    component: spec.id.clone(),
                    program: spec.program.clone(),
                });
            }
            if index.insert(&spec.id, spec).is_some() {
                return Err(ResolveError::DuplicateComponent(spec.id.clone()));
            }
        }
        Ok(index)
    }
}

fn index_current(
    current: &[ComponentRuntimeState],
) -> Result<BTreeMap<&ComponentId, &ComponentRuntimeState>, ResolveError> {
    let mut index = BTreeMap::new();
    for state in current {
        if index.insert(state.id(), state).is_some() {
            return Err(ResolveError::DuplicateComponent(state.id().clone()));
        }
    }
    Ok(index)
}

/// Steps for a component present in both sets.
fn plan_change(state: &ComponentRuntimeState, desired: &ComponentSpec) -> Vec<Step> {
    let current = &state.spec;

    // A new artifact always means a restart, so unit changes ride along.
    if current.binary_differs(desired) {
        return vec![Step::Upgrade {
            from: current.clone(),
            to: desired.clone(),
        }];
    }

    let running = matches!(state.phase, Phase::Running | Phase::Starting);

    if current.config_differs(desired) {
        if running {
            return vec![Step::Configure(desired.clone())];
        }
        return bring_up(state, desired);
    }

    match state.phase {
        Phase::Stopped | Phase::Failed => bring_up(state, desired),
        Phase::Starting | Phase::Running | Phase::Stopping => Vec::new(),
    }
}

fn bring_up(state: &ComponentRuntimeState, desired: &ComponentSpec) -> Vec<Step> {
    let mut steps = Vec::with_capacity(2);
    if !state.installed {
        steps.push(Step::Install(desired.clone()));
    }
    steps.push(Step::Start(desired.clone()));
    steps
}
