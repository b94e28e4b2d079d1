//! Process runtime interface.
//!
//! The runtime abstracts how component processes are launched, reconfigured
//! and stopped:
//! - [`LocalRuntime`] runs components as child processes
//! - [`MockRuntime`] simulates them for tests and development
//!
//! Each started process yields a [`ProcessHandle`]. The handle is owned by
//! exactly one task; liveness and health reach that task through the
//! handle's event channel.

mod local;
mod mock;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use convoy_reconcile::{Classify, ComponentSpec, ErrorClass, UnitState, VersionInfo};
use thiserror::Error;
use tokio::sync::mpsc;

pub use local::{LocalRuntime, LocalRuntimeConfig};
pub use mock::{MockBehavior, MockRuntime};

/// Everything needed to launch one component.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub spec: ComponentSpec,
    pub install_path: PathBuf,
    /// Binary file name inside `install_path`.
    pub binary: String,
    pub args: Vec<String>,
}

/// Signals a running process sends back to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// The process reported its unit states.
    CheckIn {
        units: Vec<UnitState>,
        version_info: Option<VersionInfo>,
    },
    /// The process is gone.
    Exited { code: Option<i32> },
}

/// Handle to a started process.
#[derive(Debug)]
pub struct ProcessHandle {
    /// Runtime-local identifier.
    pub id: u64,
    /// OS process id, when there is one.
    pub pid: Option<u32>,
    pub events: mpsc::Receiver<ProcessEvent>,
}

/// How a stop request concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited after the graceful stop signal.
    Graceful,
    /// Killed after the failure timeout elapsed.
    Forced,
    /// The process had already exited.
    AlreadyExited,
}

#[derive(Debug, Error)]
pub enum SupervisionError {
    #[error("failed to spawn {binary}: {reason}")]
    Spawn { binary: String, reason: String },

    #[error("unknown process {0}")]
    UnknownProcess(u64),

    #[error("configuration rejected: {0}")]
    Configure(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for SupervisionError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Supervision
    }
}

/// Process lifecycle operations.
#[async_trait]
pub trait ProcessRuntime: Send + Sync {
    /// Launch the component. Health arrives later through the handle.
    async fn start(&self, launch: &LaunchSpec) -> Result<ProcessHandle, SupervisionError>;

    /// Push a new configuration to a running process without restarting it.
    async fn configure(
        &self,
        handle: &ProcessHandle,
        spec: &ComponentSpec,
    ) -> Result<(), SupervisionError>;

    /// Ask the process to exit, forcing it after `timeout`.
    async fn stop(
        &self,
        handle: ProcessHandle,
        timeout: Duration,
    ) -> Result<ExitOutcome, SupervisionError>;
}

/// The configuration document handed to a component process.
pub fn component_config(spec: &ComponentSpec) -> serde_json::Value {
    serde_json::json!({
        "id": spec.id.as_str(),
        "program": spec.program.as_str(),
        "version": spec.version,
        "units": spec.units,
    })
}

/// Consume events until the process reports its exit or the channel closes.
pub(crate) async fn wait_for_exit(events: &mut mpsc::Receiver<ProcessEvent>) -> Option<i32> {
    while let Some(event) = events.recv().await {
        if let ProcessEvent::Exited { code } = event {
            return code;
        }
    }
    None
}
