//! Typed name definitions.

use crate::define_name;

define_name!(ComponentId, "component");
define_name!(UnitId, "unit");
define_name!(ProgramName, "program");
define_name!(AgentId, "agent");

impl AgentId {
    /// Generate a fresh agent id of the form `agent-{ulid}`.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("agent-{}", ulid::Ulid::new().to_string().to_lowercase()))
    }
}
