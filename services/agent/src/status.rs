//! Status aggregation.
//!
//! Folds per-component and per-unit states into one [`AgentState`]. Severity
//! runs `Failed > Degraded > Starting > Healthy > Stopped`; every level takes
//! the most severe of its constituents. The fleet overlay is carried along
//! verbatim and never blended into the computed health.

use std::collections::BTreeMap;
use std::sync::Arc;

use convoy_reconcile::{
    ComponentId, ComponentRuntimeState, Health, Phase, ProgramName, UnitId, UnitKind, VersionInfo,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::operator::Operator;

/// Connection state to the fleet management service, supplied externally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetState {
    pub health: Health,
    pub message: String,
}

impl FleetState {
    pub fn new(health: Health, message: impl Into<String>) -> Self {
        Self {
            health,
            message: message.into(),
        }
    }

    /// Not managed by a fleet service.
    pub fn standalone() -> Self {
        Self::new(Health::Stopped, "Not enrolled in fleet")
    }
}

impl Default for FleetState {
    fn default() -> Self {
        Self::standalone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub kind: UnitKind,
    pub id: UnitId,
    pub health: Health,
    pub message: String,
    /// Passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub id: ComponentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<ProgramName>,
    pub health: Health,
    pub message: String,
    pub units: Vec<UnitStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_info: Option<VersionInfo>,
}

/// The reportable state of the whole agent. Always replaced wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub health: Health,
    pub message: String,
    pub fleet_health: Health,
    pub fleet_message: String,
    pub components: Vec<ComponentStatus>,
}

impl AgentState {
    pub fn component(&self, id: &ComponentId) -> Option<&ComponentStatus> {
        self.components.iter().find(|c| &c.id == id)
    }
}

/// Health implied by a lifecycle phase alone.
pub fn phase_health(phase: Phase) -> Health {
    match phase {
        Phase::Stopped => Health::Stopped,
        Phase::Starting | Phase::Stopping => Health::Starting,
        Phase::Running => Health::Healthy,
        Phase::Failed => Health::Failed,
    }
}

fn phase_message(state: &ComponentRuntimeState) -> String {
    match state.phase {
        Phase::Failed => state
            .last_error
            .clone()
            .unwrap_or_else(|| "Failed".to_string()),
        Phase::Stopped => "Stopped".to_string(),
        Phase::Starting => "Starting".to_string(),
        Phase::Running => "Running".to_string(),
        Phase::Stopping => "Stopping".to_string(),
    }
}

/// Status of one component from its runtime state.
pub fn component_status(state: &ComponentRuntimeState) -> ComponentStatus {
    let base = phase_health(state.phase);

    // First unit of the highest severity, in declaration order.
    let worst_unit = state
        .units
        .iter()
        .fold(None, |worst: Option<&convoy_reconcile::UnitState>, unit| match worst {
            Some(w) if w.health >= unit.health => Some(w),
            _ => Some(unit),
        });

    let (health, message) = match worst_unit {
        Some(unit) if unit.health > base || (unit.health == base && state.phase != Phase::Failed) => {
            (unit.health, unit.message.clone())
        }
        _ => (base, phase_message(state)),
    };

    ComponentStatus {
        id: state.spec.id.clone(),
        program: Some(state.spec.program.clone()),
        health,
        message,
        units: state
            .units
            .iter()
            .map(|u| UnitStatus {
                kind: u.key.kind,
                id: u.key.id.clone(),
                health: u.health,
                message: u.message.clone(),
                payload: u.payload.clone(),
            })
            .collect(),
        version_info: state.version_info.clone(),
    }
}

/// Merge component states and the fleet overlay into an [`AgentState`].
///
/// Components in `expected` without a state are reported as failed. Never
/// fails.
pub fn aggregate(
    expected: &[ComponentId],
    states: &[ComponentRuntimeState],
    fleet: &FleetState,
) -> AgentState {
    let mut components: BTreeMap<ComponentId, ComponentStatus> = states
        .iter()
        .map(|s| (s.spec.id.clone(), component_status(s)))
        .collect();

    for id in expected {
        components
            .entry(id.clone())
            .or_insert_with(|| ComponentStatus {
                id: id.clone(),
                program: None,
                health: Health::Failed,
                message: "Component state unavailable".to_string(),
                units: Vec::new(),
                version_info: None,
            });
    }

    let components: Vec<ComponentStatus> = components.into_values().collect();

    let worst = components
        .iter()
        .fold(None, |worst: Option<&ComponentStatus>, c| match worst {
            Some(w) if w.health >= c.health => Some(w),
            _ => Some(c),
        });

    // Only an agent with no components at all defaults to healthy.
    let (health, message) = match worst {
        Some(c) if c.health != Health::Healthy => (c.health, format!("{}: {}", c.id, c.message)),
        _ => (Health::Healthy, "Running".to_string()),
    };

    AgentState {
        health,
        message,
        fleet_health: fleet.health,
        fleet_message: fleet.message.clone(),
        components,
    }
}

// =============================================================================
// Reporter
// =============================================================================

/// Keeps the published [`AgentState`] current.
///
/// Recomputes on demand and whenever a component, the desired set or the
/// fleet overlay changes.
pub struct StatusReporter {
    operator: Arc<Operator>,
    desired: watch::Receiver<Vec<ComponentId>>,
    fleet: watch::Receiver<FleetState>,
    tx: watch::Sender<AgentState>,
}

impl StatusReporter {
    pub fn new(
        operator: Arc<Operator>,
        desired: watch::Receiver<Vec<ComponentId>>,
        fleet: watch::Receiver<FleetState>,
    ) -> Self {
        let initial = aggregate(&[], &[], &fleet.borrow());
        let (tx, _) = watch::channel(initial);
        Self {
            operator,
            desired,
            fleet,
            tx,
        }
    }

    /// Compute the current state and publish it.
    pub async fn refresh(&self) -> AgentState {
        let states = self.operator.snapshot().await;
        let expected = self.desired.borrow().clone();
        let fleet = self.fleet.borrow().clone();
        let state = aggregate(&expected, &states, &fleet);

        self.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state.clone();
            true
        });
        state
    }

    /// Last published state.
    pub fn current(&self) -> AgentState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.tx.subscribe()
    }

    /// Recompute on every change until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut changes = self.operator.subscribe();
        let mut desired = self.desired.clone();
        let mut fleet = self.fleet.clone();

        self.refresh().await;
        info!("Status reporter started");

        loop {
            tokio::select! {
                r = changes.changed() => if r.is_err() { break },
                r = desired.changed() => if r.is_err() { break },
                r = fleet.changed() => if r.is_err() { break },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            let state = self.refresh().await;
            debug!(health = %state.health, components = state.components.len(), "Agent state updated");
        }

        info!("Status reporter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_reconcile::{ComponentSpec, UnitKey, UnitSpec, UnitState};

    fn state(id: &str, phase: Phase, units: &[(&str, Health, &str)]) -> ComponentRuntimeState {
        let mut spec = ComponentSpec::new(
            ComponentId::parse(id).unwrap(),
            ProgramName::parse("filebeat").unwrap(),
            "1.0",
        );
        for (unit, _, _) in units {
            spec = spec.with_unit(UnitSpec {
                id: UnitId::parse(unit).unwrap(),
                kind: UnitKind::Input,
                config: serde_json::Value::Null,
            });
        }
        let mut s = ComponentRuntimeState::new(spec);
        s.phase = phase;
        s.units = units
            .iter()
            .map(|(unit, health, message)| {
                UnitState::new(
                    UnitKey {
                        kind: UnitKind::Input,
                        id: UnitId::parse(unit).unwrap(),
                    },
                    *health,
                    *message,
                )
            })
            .collect();
        s
    }

    #[test]
    fn test_failed_unit_fails_component() {
        let s = state(
            "a",
            Phase::Running,
            &[("u1", Health::Healthy, "ok"), ("u2", Health::Failed, "broken")],
        );
        let status = component_status(&s);
        assert_eq!(status.health, Health::Failed);
        assert_eq!(status.message, "broken");
    }

    #[test]
    fn test_first_most_severe_unit_message_wins() {
        let s = state(
            "a",
            Phase::Running,
            &[
                ("u1", Health::Degraded, "first"),
                ("u2", Health::Degraded, "second"),
                ("u3", Health::Healthy, "ok"),
            ],
        );
        let status = component_status(&s);
        assert_eq!(status.health, Health::Degraded);
        assert_eq!(status.message, "first");
    }

    #[test]
    fn test_failed_component_fails_agent_and_keeps_fleet() {
        let fleet = FleetState::new(Health::Healthy, "Connected");
        let agent = aggregate(
            &[],
            &[
                state("a", Phase::Running, &[("u", Health::Healthy, "ok")]),
                state("b", Phase::Running, &[("u", Health::Failed, "bad")]),
            ],
            &fleet,
        );
        assert_eq!(agent.health, Health::Failed);
        assert_eq!(agent.message, "b: bad");
        assert_eq!(agent.fleet_health, Health::Healthy);
        assert_eq!(agent.fleet_message, "Connected");
    }

    #[test]
    fn test_fleet_never_blended() {
        let fleet = FleetState::new(Health::Failed, "unreachable");
        let agent = aggregate(
            &[],
            &[state("a", Phase::Running, &[("u", Health::Healthy, "ok")])],
            &fleet,
        );
        assert_eq!(agent.health, Health::Healthy);
        assert_eq!(agent.fleet_health, Health::Failed);
    }

    #[test]
    fn test_missing_component_reported_failed() {
        let agent = aggregate(
            &[ComponentId::parse("ghost").unwrap()],
            &[],
            &FleetState::default(),
        );
        assert_eq!(agent.health, Health::Failed);
        assert_eq!(agent.components.len(), 1);
        assert_eq!(agent.components[0].health, Health::Failed);
    }

    #[test]
    fn test_stopped_components_report_stopped_agent() {
        let agent = aggregate(
            &[],
            &[state("a", Phase::Stopped, &[("u", Health::Stopped, "Stopped")])],
            &FleetState::default(),
        );
        assert_eq!(agent.components[0].health, Health::Stopped);
        assert_eq!(agent.health, Health::Stopped);
        assert_eq!(agent.message, "a: Stopped");

        // A healthy component outranks a stopped one.
        let agent = aggregate(
            &[],
            &[
                state("a", Phase::Stopped, &[]),
                state("b", Phase::Running, &[("u", Health::Healthy, "ok")]),
            ],
            &FleetState::default(),
        );
        assert_eq!(agent.health, Health::Healthy);
        assert_eq!(agent.message, "Running");
    }

    #[test]
    fn test_empty_agent_is_healthy() {
        let agent = aggregate(&[], &[], &FleetState::default());
        assert_eq!(agent.health, Health::Healthy);
        assert!(agent.components.is_empty());
    }

    #[test]
    fn test_failed_phase_uses_last_error() {
        let mut s = state("a", Phase::Failed, &[]);
        s.last_error = Some("install failed: not found".into());
        let status = component_status(&s);
        assert_eq!(status.health, Health::Failed);
        assert_eq!(status.message, "install failed: not found");
    }

    #[test]
    fn test_payload_passed_through_and_ignored_for_severity() {
        let mut s = state("a", Phase::Running, &[("u", Health::Healthy, "ok")]);
        s.units[0].payload = Some(serde_json::json!({"error": "looks bad", "health": "failed"}));
        let status = component_status(&s);
        assert_eq!(status.health, Health::Healthy);
        assert_eq!(status.units[0].payload, s.units[0].payload);
    }

    #[test]
    fn test_stopping_reports_starting() {
        assert_eq!(phase_health(Phase::Stopping), Health::Starting);
        assert_eq!(phase_health(Phase::Running), Health::Healthy);
    }
}
