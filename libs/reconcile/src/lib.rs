//! Reconciliation primitives for the convoy agent.
//!
//! This library holds everything needed to decide *what* has to happen on a
//! host, without doing any of it:
//!
//! - **Model**: component specs, unit specs, runtime phases and health.
//! - **Registry**: the set of installable programs, passed in explicitly.
//! - **Resolver**: diffs desired components against current runtime state
//!   and emits an ordered plan of [`Step`]s.
//! - **Retry**: a bounded-retry wrapper with capped backoff and cancellation.
//!
//! # Invariants
//!
//! - Resolution is deterministic given the same inputs
//! - Resolution never touches disk or network
//! - Teardown of removed components always precedes admission of new ones

mod error;
mod hash;
mod model;
mod registry;
mod resolver;
pub mod retry;
mod step;

pub use error::{ResolveError, TransitionError};
pub use hash::SpecHash;
pub use model::{
    ComponentRuntimeState, ComponentSpec, Health, Phase, UnitKey, UnitKind, UnitSpec, UnitState,
    VersionInfo,
};
pub use registry::{ComponentRegistry, ProgramSpec};
pub use resolver::Resolver;
pub use retry::{with_retry, CancelToken, Classify, ErrorClass, RetryConfig, RetryError};
pub use step::{Step, StepKind};

pub use convoy_id::{ComponentId, ProgramName, UnitId};
