//! Component model: specs, phases, health and runtime state.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use convoy_id::{ComponentId, ProgramName, UnitId};
use serde::{Deserialize, Serialize};

use crate::error::{ResolveError, TransitionError};
use crate::hash::SpecHash;

// =============================================================================
// Specs
// =============================================================================

/// Kind of a unit inside a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Input,
    Output,
}

impl UnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Input => "input",
            UnitKind::Output => "output",
        }
    }
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key identifying a unit within its component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitKey {
    pub kind: UnitKind,
    pub id: UnitId,
}

impl std::fmt::Display for UnitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// One input or output stream of a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSpec {
    pub id: UnitId,
    pub kind: UnitKind,
    /// Opaque unit configuration, forwarded to the process as-is.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl UnitSpec {
    pub fn key(&self) -> UnitKey {
        UnitKey {
            kind: self.kind,
            id: self.id.clone(),
        }
    }
}

/// Desired definition of one component.
///
/// Specs are never patched; a changed component arrives as a whole new spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub id: ComponentId,
    pub program: ProgramName,
    pub version: String,
    /// Pinned artifact checksum (hex SHA-512). Overrides the published sidecar.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha512: Option<String>,
    #[serde(default, alias = "unit")]
    pub units: Vec<UnitSpec>,
}

impl ComponentSpec {
    pub fn new(id: ComponentId, program: ProgramName, version: impl Into<String>) -> Self {
        Self {
            id,
            program,
            version: version.into(),
            sha512: None,
            units: Vec::new(),
        }
    }

    pub fn with_unit(mut self, unit: UnitSpec) -> Self {
        self.units.push(unit);
        self
    }

    /// `id@version`, used in logs and messages.
    pub fn label(&self) -> String {
        format!("{}@{}", self.id, self.version)
    }

    /// True when running `other` would need a different artifact.
    pub fn binary_differs(&self, other: &ComponentSpec) -> bool {
        self.program != other.program || self.version != other.version || self.sha512 != other.sha512
    }

    /// Hash over the unit definitions, insensitive to config key order.
    pub fn config_hash(&self) -> SpecHash {
        let units: Vec<serde_json::Value> = self
            .units
            .iter()
            .map(|u| {
                serde_json::json!({
                    "id": u.id.as_str(),
                    "kind": u.kind.as_str(),
                    "config": u.config,
                })
            })
            .collect();
        SpecHash::from_json(&serde_json::Value::Array(units))
    }

    pub fn config_differs(&self, other: &ComponentSpec) -> bool {
        self.config_hash() != other.config_hash()
    }

    /// Structural validation independent of any registry.
    pub fn validate(&self) -> Result<(), ResolveError> {
        let version = self.version.trim();
        if version.is_empty() {
            return Err(self.malformed("version is empty"));
        }
        if version != self.version || self.version.contains(['/', '\\']) {
            return Err(self.malformed(format!("invalid version '{}'", self.version)));
        }

        if let Some(sum) = &self.sha512 {
            if sum.len() != 128 || !sum.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(self.malformed("sha512 must be 128 hex characters"));
            }
        }

        let mut seen = HashSet::new();
        for unit in &self.units {
            if !seen.insert(unit.key()) {
                return Err(ResolveError::DuplicateUnit {
                    component: self.id.clone(),
                    unit: unit.id.clone(),
                });
            }
        }

        Ok(())
    }

    fn malformed(&self, reason: impl Into<String>) -> ResolveError {
        ResolveError::MalformedSpec {
            component: self.id.clone(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Phases and health
// =============================================================================

/// Lifecycle phase of a component process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Stopped => "stopped",
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
            Phase::Failed => "failed",
        }
    }

    /// Whether a process is expected to exist in this phase.
    pub fn is_live(&self) -> bool {
        matches!(self, Phase::Starting | Phase::Running | Phase::Stopping)
    }

    /// Legal phase transitions. `Failed` is reachable from anywhere and left
    /// only by a new start or stop.
    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (_, Failed) => true,
            (from, to) if *from == to => true,
            (Stopped, Starting) => true,
            (Starting, Running | Stopping) => true,
            (Running, Stopping) => true,
            (Stopping, Stopped) => true,
            (Failed, Starting | Stopping | Stopped) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reported health, ordered by severity (`Stopped` least, `Failed` most).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    #[default]
    Stopped,
    Healthy,
    Starting,
    Degraded,
    Failed,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Stopped => "stopped",
            Health::Healthy => "healthy",
            Health::Starting => "starting",
            Health::Degraded => "degraded",
            Health::Failed => "failed",
        }
    }

    /// Returns the more severe of two healths.
    pub fn worst(self, other: Health) -> Health {
        self.max(other)
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Runtime state
// =============================================================================

/// Observed state of one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitState {
    pub key: UnitKey,
    pub health: Health,
    pub message: String,
    /// Arbitrary attributes reported by the unit; never interpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl UnitState {
    pub fn new(key: UnitKey, health: Health, message: impl Into<String>) -> Self {
        Self {
            key,
            health,
            message: message.into(),
            payload: None,
        }
    }
}

/// Version metadata a component reports about itself.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

/// Snapshot of one component's operational state.
///
/// The process handle itself is not part of the snapshot; only the task that
/// owns the component holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentRuntimeState {
    /// Spec the component is currently installed/running with.
    pub spec: ComponentSpec,
    pub phase: Phase,
    /// Whether the artifact for `spec` is materialized on disk.
    pub installed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Unit states in declaration order.
    #[serde(default)]
    pub units: Vec<UnitState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_info: Option<VersionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

impl ComponentRuntimeState {
    /// Initial state for a newly planned component.
    pub fn new(spec: ComponentSpec) -> Self {
        Self {
            spec,
            phase: Phase::Stopped,
            installed: false,
            last_error: None,
            units: Vec::new(),
            version_info: None,
            pid: None,
            updated_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &ComponentId {
        &self.spec.id
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: Phase) -> Result<(), TransitionError> {
        if !self.phase.can_transition_to(next) {
            return Err(TransitionError {
                component: self.spec.id.clone(),
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a failure; always legal.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.phase = Phase::Failed;
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
    }

    pub fn unit(&self, key: &UnitKey) -> Option<&UnitState> {
        self.units.iter().find(|u| &u.key == key)
    }

    /// Reset unit states to one entry per declared unit with the given health.
    pub fn reset_units(&mut self, health: Health, message: &str) {
        self.units = self
            .spec
            .units
            .iter()
            .map(|u| UnitState::new(u.key(), health, message))
            .collect();
        self.updated_at = Utc::now();
    }

    /// Fold a reported unit state in, keeping declaration order. Reports for
    /// undeclared units are appended after the declared ones.
    pub fn apply_unit_report(&mut self, report: UnitState) {
        match self.units.iter_mut().find(|u| u.key == report.key) {
            Some(existing) => *existing = report,
            None => self.units.push(report),
        }
        self.updated_at = Utc::now();
    }
}
