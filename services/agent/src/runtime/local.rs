//! Child-process runtime.
//!
//! Components run as direct children of the agent. Configuration is written
//! to a JSON file in the component's own directory and reloaded on `SIGHUP`;
//! stopping sends `SIGTERM` and kills the process if it outlives the failure
//! timeout.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use convoy_reconcile::{ComponentSpec, Health, UnitState};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use super::{
    component_config, wait_for_exit, ExitOutcome, LaunchSpec, ProcessEvent, ProcessHandle,
    ProcessRuntime, SupervisionError,
};

/// File name of the component configuration inside its component directory.
pub const CONFIG_FILE: &str = "convoy-component.json";

#[derive(Debug, Clone)]
pub struct LocalRuntimeConfig {
    /// How long a process must stay up before it is reported healthy.
    pub checkin_grace: Duration,
    /// Holds one directory per component id. Installs are shared between
    /// components on the same version, so per-component files live here.
    pub components_dir: PathBuf,
}

impl LocalRuntimeConfig {
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            checkin_grace: Duration::from_secs(2),
            components_dir: data_dir.as_ref().join("components"),
        }
    }

    /// Configuration file of one component.
    pub fn config_path(&self, spec: &ComponentSpec) -> PathBuf {
        self.components_dir.join(spec.id.as_str()).join(CONFIG_FILE)
    }
}

enum Control {
    Reconfigured(ComponentSpec),
    Kill,
}

struct LocalProcess {
    pid: Option<u32>,
    config_path: PathBuf,
    control: mpsc::Sender<Control>,
}

pub struct LocalRuntime {
    config: LocalRuntimeConfig,
    counter: AtomicU64,
    processes: RwLock<HashMap<u64, LocalProcess>>,
}

impl LocalRuntime {
    pub fn new(config: LocalRuntimeConfig) -> Self {
        Self {
            config,
            counter: AtomicU64::new(0),
            processes: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ProcessRuntime for LocalRuntime {
    async fn start(&self, launch: &LaunchSpec) -> Result<ProcessHandle, SupervisionError> {
        let spec = &launch.spec;
        let binary = launch.install_path.join(&launch.binary);
        let config_path = self.config.config_path(spec);
        write_config(&config_path, spec).await?;

        let child = Command::new(&binary)
            .args(&launch.args)
            .current_dir(&launch.install_path)
            .env("CONVOY_COMPONENT_ID", spec.id.as_str())
            .env("CONVOY_COMPONENT_CONFIG", &config_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisionError::Spawn {
                binary: binary.display().to_string(),
                reason: e.to_string(),
            })?;

        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let pid = child.id();
        let (event_tx, event_rx) = mpsc::channel(16);
        let (control_tx, control_rx) = mpsc::channel(4);

        info!(component_id = %spec.id, version = %spec.version, pid, "Process started");

        tokio::spawn(supervise(
            child,
            spec.clone(),
            self.config.checkin_grace,
            event_tx,
            control_rx,
        ));

        let mut processes = self.processes.write().await;
        processes.retain(|_, p| !p.control.is_closed());
        processes.insert(
            id,
            LocalProcess {
                pid,
                config_path,
                control: control_tx,
            },
        );

        Ok(ProcessHandle {
            id,
            pid,
            events: event_rx,
        })
    }

    async fn configure(
        &self,
        handle: &ProcessHandle,
        spec: &ComponentSpec,
    ) -> Result<(), SupervisionError> {
        let processes = self.processes.read().await;
        let process = processes
            .get(&handle.id)
            .ok_or(SupervisionError::UnknownProcess(handle.id))?;

        write_config(&process.config_path, spec).await?;
        if let Some(pid) = process.pid {
            signal(pid, libc::SIGHUP)?;
        }
        process
            .control
            .send(Control::Reconfigured(spec.clone()))
            .await
            .map_err(|_| SupervisionError::Configure("process has exited".to_string()))?;

        debug!(component_id = %spec.id, pid = process.pid, "Sent reload signal");
        Ok(())
    }

    async fn stop(
        &self,
        mut handle: ProcessHandle,
        timeout: Duration,
    ) -> Result<ExitOutcome, SupervisionError> {
        let Some(process) = self.processes.write().await.remove(&handle.id) else {
            return Ok(ExitOutcome::AlreadyExited);
        };

        let Some(pid) = process.pid else {
            return Ok(ExitOutcome::AlreadyExited);
        };

        if let Err(e) = signal(pid, libc::SIGTERM) {
            if e.raw_os_error() == Some(libc::ESRCH) {
                return Ok(ExitOutcome::AlreadyExited);
            }
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, wait_for_exit(&mut handle.events)).await {
            Ok(code) => {
                debug!(pid, code, "Process exited after SIGTERM");
                Ok(ExitOutcome::Graceful)
            }
            Err(_) => {
                warn!(pid, timeout_secs = timeout.as_secs(), "Process did not exit in time, killing");
                let _ = process.control.send(Control::Kill).await;
                wait_for_exit(&mut handle.events).await;
                Ok(ExitOutcome::Forced)
            }
        }
    }
}

/// Own the child: report check-ins and its exit, apply kill requests.
async fn supervise(
    mut child: Child,
    mut spec: ComponentSpec,
    grace: Duration,
    events: mpsc::Sender<ProcessEvent>,
    mut control: mpsc::Receiver<Control>,
) {
    let checkin = tokio::time::sleep(grace);
    tokio::pin!(checkin);
    let mut checked_in = false;

    loop {
        tokio::select! {
            status = child.wait() => {
                let code = status.ok().and_then(|s| s.code());
                let _ = events.send(ProcessEvent::Exited { code }).await;
                return;
            }
            _ = &mut checkin, if !checked_in => {
                checked_in = true;
                let _ = events.send(healthy(&spec, "Running")).await;
            }
            msg = control.recv() => match msg {
                Some(Control::Reconfigured(next)) => {
                    spec = next;
                    if checked_in {
                        let _ = events.send(healthy(&spec, "Configured")).await;
                    }
                }
                Some(Control::Kill) => {
                    let _ = child.start_kill();
                }
                None => {
                    let _ = child.start_kill();
                    let code = child.wait().await.ok().and_then(|s| s.code());
                    let _ = events.send(ProcessEvent::Exited { code }).await;
                    return;
                }
            },
        }
    }
}

fn healthy(spec: &ComponentSpec, message: &str) -> ProcessEvent {
    ProcessEvent::CheckIn {
        units: spec
            .units
            .iter()
            .map(|u| UnitState::new(u.key(), Health::Healthy, message))
            .collect(),
        version_info: None,
    }
}

/// Write the component configuration to `path`, atomically.
async fn write_config(path: &Path, spec: &ComponentSpec) -> io::Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    tokio::fs::create_dir_all(dir).await?;
    let tmp = dir.join(format!(".{CONFIG_FILE}.{}.tmp", uuid::Uuid::new_v4().simple()));
    let body = serde_json::to_vec_pretty(&component_config(spec))?;

    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn signal(pid: u32, sig: libc::c_int) -> io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
