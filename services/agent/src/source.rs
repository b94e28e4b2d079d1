//! Desired-state sources.
//!
//! A source produces [`Policy`] documents on a watch channel. Only the latest
//! policy matters, so a slow consumer simply sees the newest one.
//!
//! - [`FileSource`]: polls a local TOML file, publishing when its content
//!   hash changes
//! - [`RemoteSource`]: polls a policy URL and reports the outcome of every
//!   check-in as the fleet overlay
//! - [`NoopSource`]: never yields; used when the agent is driven purely
//!   through the control API

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use convoy_reconcile::{ComponentId, ComponentRegistry, ComponentSpec, Health, ProgramSpec, ResolveError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::status::FleetState;

// =============================================================================
// Policy
// =============================================================================

/// A desired-state document: the program registry plus the component set.
///
/// ```toml
/// [[program]]
/// name = "filebeat"
/// artifact = "beats/filebeat"
///
/// [[component]]
/// id = "logs"
/// program = "filebeat"
/// version = "8.3.0"
///
/// [[component.unit]]
/// id = "logs-in"
/// kind = "input"
/// config = { paths = ["/var/log/*.log"] }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default, rename = "program")]
    pub programs: Vec<ProgramSpec>,
    #[serde(default, rename = "component")]
    pub components: Vec<ComponentSpec>,
}

impl Policy {
    pub fn parse_toml(text: &str) -> Result<Self, SourceError> {
        toml::from_str(text).map_err(|e| SourceError::Parse(e.to_string()))
    }

    pub fn parse_json(bytes: &[u8]) -> Result<Self, SourceError> {
        serde_json::from_slice(bytes).map_err(|e| SourceError::Parse(e.to_string()))
    }

    /// Build the program registry declared by this policy.
    pub fn registry(&self) -> Result<ComponentRegistry, ResolveError> {
        ComponentRegistry::from_programs(self.programs.iter().cloned())
    }

    pub fn component_ids(&self) -> Vec<ComponentId> {
        self.components.iter().map(|c| c.id.clone()).collect()
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read policy: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid policy: {0}")]
    Parse(String),

    #[error("policy request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("policy request returned {status}")]
    Status { status: u16 },
}

/// Latest policy, `None` until the first one arrives.
pub type PolicyTx = watch::Sender<Option<Arc<Policy>>>;

fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// A producer of desired state.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    fn name(&self) -> &str;

    /// Publish policies to `updates` until shutdown.
    async fn run(&self, updates: PolicyTx, shutdown: watch::Receiver<bool>);
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

// =============================================================================
// File source
// =============================================================================

pub struct FileSource {
    path: PathBuf,
    interval: Duration,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
        }
    }

    async fn read(&self) -> Result<(String, Policy), SourceError> {
        let bytes = tokio::fs::read(&self.path).await?;
        let hash = content_hash(&bytes);
        let text = String::from_utf8(bytes).map_err(|e| SourceError::Parse(e.to_string()))?;
        Ok((hash, Policy::parse_toml(&text)?))
    }
}

#[async_trait]
impl ConfigSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn run(&self, updates: PolicyTx, mut shutdown: watch::Receiver<bool>) {
        info!(path = %self.path.display(), interval_ms = self.interval.as_millis() as u64, "Watching policy file");

        let mut last_hash: Option<String> = None;
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }

            match self.read().await {
                Ok((hash, policy)) => {
                    if last_hash.as_deref() == Some(hash.as_str()) {
                        continue;
                    }
                    info!(hash = %hash, components = policy.components.len(), "Policy changed");
                    last_hash = Some(hash);
                    updates.send_replace(Some(Arc::new(policy)));
                }
                Err(e) => {
                    // Keep the last good policy in effect.
                    warn!(path = %self.path.display(), error = %e, "Failed to load policy");
                }
            }
        }

        debug!("File source stopped");
    }
}

// =============================================================================
// Remote source
// =============================================================================

/// Polls a policy URL. JSON bodies are accepted when served as
/// `application/json`; anything else is parsed as TOML.
pub struct RemoteSource {
    client: reqwest::Client,
    url: String,
    interval: Duration,
    fleet: watch::Sender<FleetState>,
}

impl RemoteSource {
    pub fn new(
        url: impl Into<String>,
        interval: Duration,
        timeout: Duration,
        fleet: watch::Sender<FleetState>,
    ) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            interval,
            fleet,
        })
    }

    async fn fetch(&self) -> Result<(String, Policy), SourceError> {
        debug!(url = %self.url, "Fetching policy");
        let response = self.client.get(&self.url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
            });
        }

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));
        let body = response.bytes().await?;
        let hash = content_hash(&body);

        let policy = if is_json {
            Policy::parse_json(&body)?
        } else {
            let text = std::str::from_utf8(&body).map_err(|e| SourceError::Parse(e.to_string()))?;
            Policy::parse_toml(text)?
        };
        Ok((hash, policy))
    }

    fn set_fleet(&self, health: Health, message: impl Into<String>) {
        let next = FleetState::new(health, message);
        self.fleet.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

#[async_trait]
impl ConfigSource for RemoteSource {
    fn name(&self) -> &str {
        "remote"
    }

    async fn run(&self, updates: PolicyTx, mut shutdown: watch::Receiver<bool>) {
        info!(url = %self.url, interval_ms = self.interval.as_millis() as u64, "Polling remote policy");
        self.set_fleet(Health::Starting, "Connecting");

        let mut last_hash: Option<String> = None;
        let mut consecutive_failures = 0u32;
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }

            match self.fetch().await {
                Ok((hash, policy)) => {
                    consecutive_failures = 0;
                    self.set_fleet(Health::Healthy, "Connected");
                    if last_hash.as_deref() == Some(hash.as_str()) {
                        continue;
                    }
                    info!(hash = %hash, components = policy.components.len(), "Remote policy changed");
                    last_hash = Some(hash);
                    updates.send_replace(Some(Arc::new(policy)));
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(url = %self.url, error = %e, consecutive_failures, "Policy check-in failed");
                    self.set_fleet(Health::Failed, e.to_string());
                }
            }
        }

        debug!("Remote source stopped");
    }
}

// =============================================================================
// Noop source
// =============================================================================

/// Yields nothing.
pub struct NoopSource;

#[async_trait]
impl ConfigSource for NoopSource {
    fn name(&self) -> &str {
        "none"
    }

    async fn run(&self, _updates: PolicyTx, mut shutdown: watch::Receiver<bool>) {
        wait_for_shutdown(&mut shutdown).await;
    }
}
