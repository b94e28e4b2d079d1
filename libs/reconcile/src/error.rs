//! Resolution errors.

use convoy_id::{ComponentId, ProgramName, UnitId};
use thiserror::Error;

use crate::model::Phase;

/// Structural problems with a desired or current component set.
///
/// These abort a reconciliation pass before any step runs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The same component identity appears twice in one set.
    #[error("duplicate component '{0}'")]
    DuplicateComponent(ComponentId),

    /// The same unit key appears twice in one component.
    #[error("component '{component}': duplicate unit '{unit}'")]
    DuplicateUnit { component: ComponentId, unit: UnitId },

    /// A program is registered twice.
    #[error("duplicate program '{0}'")]
    DuplicateProgram(ProgramName),

    /// The spec references a program the registry does not know.
    #[error("component '{component}': unknown program '{program}'")]
    UnknownProgram {
        component: ComponentId,
        program: ProgramName,
    },

    /// Some other field of the spec is malformed.
    #[error("component '{component}': malformed spec: {reason}")]
    MalformedSpec {
        component: ComponentId,
        reason: String,
    },
}

/// An attempt to move a component through an illegal phase transition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("component '{component}': illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub component: ComponentId,
    pub from: Phase,
    pub to: Phase,
}
