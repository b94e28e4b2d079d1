//! convoy Agent Library
//!
//! The agent runs on each host and keeps a set of supervised components
//! (programs with input/output units) converged to a desired policy. It
//! fetches, verifies and unpacks component artifacts, runs the processes,
//! and reports one aggregated health state.
//!
//! ## Architecture
//!
//! ```text
//! ConfigSource ──policy──> Coordinator ──plan──> Operator
//!                              ^                ├── ComponentWorker(id)
//! ControlService ─command──────┘                └── ComponentWorker(id)
//!       ^                                              │
//!       └──────── StatusReporter <──── snapshots ──────┘
//! ```
//!
//! ## Modules
//!
//! - `artifact`: downloader chain, checksum verifier, tar.gz installer
//! - `runtime`: process runtime capability (local processes or mock)
//! - `operator`: per-component workers executing plan steps
//! - `status`: health aggregation and the published agent state
//! - `source`: desired-state policy inputs
//! - `coordinator`: policy/command loop feeding the operator
//! - `control`: control service and its HTTP transport

pub mod artifact;
pub mod control;
pub mod coordinator;
pub mod operator;
pub mod runtime;
pub mod source;
pub mod status;

// Internal modules exposed for integration tests
pub mod config;

// Re-export commonly used types
pub use artifact::{ArtifactConfig, Artifacts};
pub use control::{ControlCommand, ControlService};
pub use coordinator::Coordinator;
pub use operator::{Operator, OperatorConfig, PlanReport, StepOutcome};
pub use runtime::{LocalRuntime, MockRuntime, ProcessRuntime};
pub use source::{ConfigSource, Policy};
pub use status::{AgentState, FleetState, StatusReporter};
