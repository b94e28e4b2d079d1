//! Plan steps produced by the resolver and consumed by the operator.

use convoy_id::ComponentId;

use crate::model::ComponentSpec;

/// The kind of a [`Step`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Install,
    Start,
    Configure,
    Stop,
    Uninstall,
    Upgrade,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Install => "install",
            StepKind::Start => "start",
            StepKind::Configure => "configure",
            StepKind::Stop => "stop",
            StepKind::Uninstall => "uninstall",
            StepKind::Upgrade => "upgrade",
        }
    }

    /// Steps that tear a component down rather than bring it up.
    pub fn is_teardown(&self) -> bool {
        matches!(self, StepKind::Stop | StepKind::Uninstall)
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work in a plan.
///
/// Steps carry the full spec they act on so the operator never has to look
/// anything up. A plan is consumed exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Install(ComponentSpec),
    Start(ComponentSpec),
    Configure(ComponentSpec),
    Stop(ComponentSpec),
    Uninstall(ComponentSpec),
    Upgrade {
        from: ComponentSpec,
        to: ComponentSpec,
    },
}

impl Step {
    pub fn kind(&self) -> StepKind {
        match self {
            Step::Install(_) => StepKind::Install,
            Step::Start(_) => StepKind::Start,
            Step::Configure(_) => StepKind::Configure,
            Step::Stop(_) => StepKind::Stop,
            Step::Uninstall(_) => StepKind::Uninstall,
            Step::Upgrade { .. } => StepKind::Upgrade,
        }
    }

    pub fn component_id(&self) -> &ComponentId {
        &self.spec().id
    }

    /// The spec this step leaves the component with.
    pub fn spec(&self) -> &ComponentSpec {
        match self {
            Step::Install(s)
            | Step::Start(s)
            | Step::Configure(s)
            | Step::Stop(s)
            | Step::Uninstall(s) => s,
            Step::Upgrade { to, .. } => to,
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Upgrade { from, to } => {
                write!(f, "upgrade({} {} -> {})", to.id, from.version, to.version)
            }
            other => write!(f, "{}({})", other.kind(), other.spec().label()),
        }
    }
}
