//! Simulated runtime for testing and development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use convoy_reconcile::{ComponentSpec, Health, UnitState, VersionInfo};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use super::{ExitOutcome, LaunchSpec, ProcessEvent, ProcessHandle, ProcessRuntime, SupervisionError};

/// Knobs controlling how mock processes behave.
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// Every start fails.
    pub fail_starts: bool,
    /// Every reconfiguration is rejected.
    pub fail_configure: bool,
    /// Processes exit with code 1 this long after starting.
    pub crash_after: Option<Duration>,
    /// Processes never check in.
    pub silent: bool,
    /// Versions whose starts fail.
    pub fail_versions: Vec<String>,
}

struct MockProcess {
    spec: ComponentSpec,
    events: mpsc::Sender<ProcessEvent>,
}

/// Mock runtime that checks in as healthy immediately after start.
pub struct MockRuntime {
    behavior: MockBehavior,
    counter: AtomicU64,
    processes: RwLock<HashMap<u64, MockProcess>>,
    history: RwLock<Vec<String>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::default())
    }

    /// A mock runtime that fails all starts.
    pub fn failing() -> Self {
        Self::with_behavior(MockBehavior {
            fail_starts: true,
            ..MockBehavior::default()
        })
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            counter: AtomicU64::new(0),
            processes: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
        }
    }

    /// Operations performed so far, e.g. `start(logs@1.0)`.
    pub async fn history(&self) -> Vec<String> {
        self.history.read().await.clone()
    }

    /// Number of processes currently alive.
    pub async fn running(&self) -> usize {
        self.processes.read().await.len()
    }

    async fn record(&self, op: &str, spec: &ComponentSpec) {
        self.history
            .write()
            .await
            .push(format!("{op}({})", spec.label()));
    }

    fn check_in(spec: &ComponentSpec, message: &str) -> ProcessEvent {
        ProcessEvent::CheckIn {
            units: spec
                .units
                .iter()
                .map(|u| UnitState::new(u.key(), Health::Healthy, message))
                .collect(),
            version_info: Some(VersionInfo {
                name: spec.program.to_string(),
                version: spec.version.clone(),
                meta: Default::default(),
            }),
        }
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessRuntime for MockRuntime {
    async fn start(&self, launch: &LaunchSpec) -> Result<ProcessHandle, SupervisionError> {
        let spec = &launch.spec;
        self.record("start", spec).await;

        if self.behavior.fail_starts || self.behavior.fail_versions.contains(&spec.version) {
            return Err(SupervisionError::Spawn {
                binary: launch.binary.clone(),
                reason: "mock runtime configured to fail".to_string(),
            });
        }

        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);

        info!(component_id = %spec.id, version = %spec.version, id, "[MOCK] Starting process");

        if !self.behavior.silent {
            let _ = tx.try_send(Self::check_in(spec, "Healthy"));
        }

        if let Some(after) = self.behavior.crash_after {
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = tx.send(ProcessEvent::Exited { code: Some(1) }).await;
            });
        }

        self.processes.write().await.insert(
            id,
            MockProcess {
                spec: spec.clone(),
                events: tx,
            },
        );

        Ok(ProcessHandle {
            id,
            pid: Some(10_000 + id as u32),
            events: rx,
        })
    }

    async fn configure(
        &self,
        handle: &ProcessHandle,
        spec: &ComponentSpec,
    ) -> Result<(), SupervisionError> {
        self.record("configure", spec).await;

        let mut processes = self.processes.write().await;
        let process = processes
            .get_mut(&handle.id)
            .ok_or(SupervisionError::UnknownProcess(handle.id))?;

        if self.behavior.fail_configure {
            return Err(SupervisionError::Configure(
                "mock runtime configured to reject configuration".to_string(),
            ));
        }

        process.spec = spec.clone();
        if !self.behavior.silent {
            let _ = process.events.try_send(Self::check_in(spec, "Configured"));
        }
        debug!(component_id = %spec.id, id = handle.id, "[MOCK] Process reconfigured");
        Ok(())
    }

    async fn stop(
        &self,
        handle: ProcessHandle,
        _timeout: Duration,
    ) -> Result<ExitOutcome, SupervisionError> {
        let Some(process) = self.processes.write().await.remove(&handle.id) else {
            return Ok(ExitOutcome::AlreadyExited);
        };
        self.record("stop", &process.spec).await;

        info!(component_id = %process.spec.id, id = handle.id, "[MOCK] Stopping process");
        Ok(ExitOutcome::Graceful)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_reconcile::{ComponentId, ProgramName, UnitId, UnitKind, UnitSpec};
    use std::path::PathBuf;

    fn launch(version: &str) -> LaunchSpec {
        LaunchSpec {
            spec: ComponentSpec::new(
                ComponentId::parse("logs").unwrap(),
                ProgramName::parse("filebeat").unwrap(),
                version,
            )
            .with_unit(UnitSpec {
                id: UnitId::parse("in").unwrap(),
                kind: UnitKind::Input,
                config: serde_json::Value::Null,
            }),
            install_path: PathBuf::from("/tmp/filebeat"),
            binary: "filebeat".into(),
            args: vec![],
        }
    }

    #[tokio::test]
    async fn test_start_checks_in_healthy() {
        let runtime = MockRuntime::new();
        let mut handle = runtime.start(&launch("1.0")).await.unwrap();

        match handle.events.recv().await.unwrap() {
            ProcessEvent::CheckIn {
                units,
                version_info,
            } => {
                assert_eq!(units.len(), 1);
                assert_eq!(units[0].health, Health::Healthy);
                assert_eq!(version_info.unwrap().version, "1.0");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(runtime.running().await, 1);
    }

    #[tokio::test]
    async fn test_failing_start() {
        let runtime = MockRuntime::failing();
        assert!(matches!(
            runtime.start(&launch("1.0")).await,
            Err(SupervisionError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn test_fail_versions() {
        let runtime = MockRuntime::with_behavior(MockBehavior {
            fail_versions: vec!["2.0".into()],
            ..Default::default()
        });
        assert!(runtime.start(&launch("1.0")).await.is_ok());
        assert!(runtime.start(&launch("2.0")).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_and_history() {
        let runtime = MockRuntime::new();
        let handle = runtime.start(&launch("1.0")).await.unwrap();
        let outcome = runtime
            .stop(handle, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(outcome, ExitOutcome::Graceful);
        assert_eq!(runtime.running().await, 0);
        assert_eq!(
            runtime.history().await,
            vec!["start(logs@1.0)".to_string(), "stop(logs@1.0)".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_after() {
        let runtime = MockRuntime::with_behavior(MockBehavior {
            crash_after: Some(Duration::from_secs(5)),
            silent: true,
            ..Default::default()
        });
        let mut handle = runtime.start(&launch("1.0")).await.unwrap();
        assert_eq!(
            handle.events.recv().await,
            Some(ProcessEvent::Exited { code: Some(1) })
        );
    }
}
