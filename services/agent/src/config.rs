//! Configuration for the agent.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use convoy_id::AgentId;
use convoy_reconcile::RetryConfig;

use crate::artifact::ArtifactConfig;
use crate::operator::OperatorConfig;
use crate::runtime::LocalRuntimeConfig;

/// Where desired state comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceMode {
    /// Poll a local TOML policy file.
    File { path: PathBuf, interval: Duration },
    /// Poll a policy URL; its check-ins drive the fleet state.
    Remote { url: String, interval: Duration },
    /// No policy input; components change only through the control API.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// Real processes.
    Local,
    /// In-memory processes that always check in healthy.
    Mock,
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity reported by the control API.
    pub agent_id: AgentId,

    /// Root for downloads, installs and the default policy file.
    pub data_dir: PathBuf,

    pub artifacts: ArtifactConfig,

    /// Retry policy for artifact downloads.
    pub retry: RetryConfig,

    pub operator: OperatorConfig,

    pub local_runtime: LocalRuntimeConfig,

    pub runtime: RuntimeMode,

    pub source: SourceMode,

    /// Listen address of the control API.
    pub control_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error) used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Config {
    /// Load configuration from `CONVOY_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which returns the value of a
    /// variable if it is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let agent_id = match get("CONVOY_AGENT_ID") {
            Some(id) => AgentId::parse(&id).context("invalid CONVOY_AGENT_ID")?,
            None => AgentId::generate(),
        };

        let data_dir = PathBuf::from(get("CONVOY_DATA_DIR").unwrap_or_else(|| "/var/lib/convoy".to_string()));

        let mut artifacts = ArtifactConfig::with_data_dir(&data_dir);
        if let Some(dir) = get("CONVOY_DOWNLOAD_DIR") {
            artifacts.download_dir = dir.into();
        }
        if let Some(dir) = get("CONVOY_INSTALL_DIR") {
            artifacts.install_dir = dir.into();
        }
        if let Some(dir) = get("CONVOY_DROP_DIR") {
            artifacts.drop_dir = dir.into();
        }
        if let Some(os) = get("CONVOY_OS") {
            artifacts.os = os;
        }
        if let Some(arch) = get("CONVOY_ARCH") {
            artifacts.arch = arch;
        }
        if let Some(uri) = get("CONVOY_SOURCE_URI") {
            artifacts.source_uri = uri;
        }
        artifacts.snapshot_uri = get("CONVOY_SNAPSHOT_URI");
        artifacts.snapshot = parse_bool(&get, "CONVOY_SNAPSHOT", false)?;
        artifacts.http_timeout =
            Duration::from_secs(parse_or(&get, "CONVOY_HTTP_TIMEOUT_SECS", 120)?);

        let defaults = RetryConfig::default();
        let retry = RetryConfig {
            enabled: parse_bool(&get, "CONVOY_RETRY_ENABLED", defaults.enabled)?,
            retries_count: parse_or(&get, "CONVOY_RETRY_COUNT", defaults.retries_count)?,
            delay: Duration::from_millis(parse_or(
                &get,
                "CONVOY_RETRY_DELAY_MS",
                defaults.delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(parse_or(
                &get,
                "CONVOY_RETRY_MAX_DELAY_MS",
                defaults.max_delay.as_millis() as u64,
            )?),
        };
        if retry.delay > retry.max_delay {
            bail!("CONVOY_RETRY_DELAY_MS must not exceed CONVOY_RETRY_MAX_DELAY_MS");
        }

        let operator_defaults = OperatorConfig::default();
        let operator = OperatorConfig {
            failure_timeout: Duration::from_secs(parse_or(
                &get,
                "CONVOY_FAILURE_TIMEOUT_SECS",
                operator_defaults.failure_timeout.as_secs(),
            )?),
            start_timeout: Duration::from_secs(parse_or(
                &get,
                "CONVOY_START_TIMEOUT_SECS",
                operator_defaults.start_timeout.as_secs(),
            )?),
            max_parallel: parse_or(&get, "CONVOY_MAX_PARALLEL", operator_defaults.max_parallel)?,
        };
        if operator.max_parallel == 0 {
            bail!("CONVOY_MAX_PARALLEL must be at least 1");
        }

        let mut local_runtime = LocalRuntimeConfig::with_data_dir(&data_dir);
        local_runtime.checkin_grace = Duration::from_millis(parse_or(
            &get,
            "CONVOY_CHECKIN_GRACE_MS",
            local_runtime.checkin_grace.as_millis() as u64,
        )?);

        let runtime = match get("CONVOY_RUNTIME").as_deref() {
            None | Some("local") => RuntimeMode::Local,
            Some("mock") => RuntimeMode::Mock,
            Some(other) => bail!("unknown CONVOY_RUNTIME '{other}' (expected local or mock)"),
        };

        let interval = Duration::from_secs(parse_or(&get, "CONVOY_POLICY_INTERVAL_SECS", 10)?);
        let source = match get("CONVOY_POLICY_SOURCE").as_deref() {
            None | Some("file") => SourceMode::File {
                path: get("CONVOY_POLICY_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| data_dir.join("policy.toml")),
                interval,
            },
            Some("remote") => SourceMode::Remote {
                url: get("CONVOY_POLICY_URL")
                    .context("CONVOY_POLICY_URL is required for the remote policy source")?,
                interval,
            },
            Some("none") => SourceMode::None,
            Some(other) => {
                bail!("unknown CONVOY_POLICY_SOURCE '{other}' (expected file, remote or none)")
            }
        };

        let control_addr: SocketAddr = get("CONVOY_CONTROL_ADDR")
            .unwrap_or_else(|| "127.0.0.1:6791".to_string())
            .parse()
            .context("invalid CONVOY_CONTROL_ADDR")?;

        let log_level = get("CONVOY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            agent_id,
            data_dir,
            artifacts,
            retry,
            operator,
            local_runtime,
            runtime,
            source,
            control_addr,
            log_level,
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {key} '{raw}'")),
        None => Ok(default),
    }
}

fn parse_bool(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool> {
    match get(key).map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => bail!("invalid {key} '{other}' (expected true or false)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert!(config.agent_id.as_str().starts_with("agent-"));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/convoy"));
        assert_eq!(
            config.artifacts.install_dir,
            PathBuf::from("/var/lib/convoy/install")
        );
        assert_eq!(
            config.local_runtime.components_dir,
            PathBuf::from("/var/lib/convoy/components")
        );
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.operator.max_parallel, 4);
        assert_eq!(config.runtime, RuntimeMode::Local);
        assert_eq!(
            config.source,
            SourceMode::File {
                path: PathBuf::from("/var/lib/convoy/policy.toml"),
                interval: Duration::from_secs(10),
            }
        );
        assert_eq!(config.control_addr.port(), 6791);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("CONVOY_AGENT_ID", "edge-01"),
            ("CONVOY_DATA_DIR", "/tmp/convoy"),
            ("CONVOY_DROP_DIR", "/mnt/drop"),
            ("CONVOY_ARCH", "arm64"),
            ("CONVOY_SNAPSHOT", "true"),
            ("CONVOY_RETRY_COUNT", "2"),
            ("CONVOY_RETRY_DELAY_MS", "3000"),
            ("CONVOY_RETRY_MAX_DELAY_MS", "10000"),
            ("CONVOY_MAX_PARALLEL", "8"),
            ("CONVOY_RUNTIME", "mock"),
            ("CONVOY_POLICY_SOURCE", "remote"),
            ("CONVOY_POLICY_URL", "https://fleet.example/policy"),
            ("CONVOY_POLICY_INTERVAL_SECS", "30"),
        ])
        .unwrap();

        assert_eq!(config.agent_id.as_str(), "edge-01");
        assert_eq!(config.artifacts.download_dir, PathBuf::from("/tmp/convoy/downloads"));
        assert_eq!(config.artifacts.drop_dir, PathBuf::from("/mnt/drop"));
        assert_eq!(config.artifacts.arch, "arm64");
        assert!(config.artifacts.snapshot);
        assert_eq!(config.retry.retries_count, 2);
        assert_eq!(config.retry.delay, Duration::from_secs(3));
        assert_eq!(config.retry.max_delay, Duration::from_secs(10));
        assert_eq!(config.operator.max_parallel, 8);
        assert_eq!(config.runtime, RuntimeMode::Mock);
        assert_eq!(
            config.source,
            SourceMode::Remote {
                url: "https://fleet.example/policy".into(),
                interval: Duration::from_secs(30),
            }
        );
    }

    #[test]
    fn test_empty_values_fall_back_to_defaults() {
        let config = load(&[("CONVOY_LOG_LEVEL", ""), ("CONVOY_MAX_PARALLEL", " ")]).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.operator.max_parallel, 4);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(load(&[("CONVOY_RETRY_COUNT", "many")]).is_err());
        assert!(load(&[("CONVOY_SNAPSHOT", "maybe")]).is_err());
        assert!(load(&[("CONVOY_MAX_PARALLEL", "0")]).is_err());
        assert!(load(&[("CONVOY_POLICY_SOURCE", "carrier-pigeon")]).is_err());
        assert!(load(&[("CONVOY_POLICY_SOURCE", "remote")]).is_err());
        assert!(load(&[("CONVOY_AGENT_ID", "not/valid")]).is_err());
        assert!(load(&[
            ("CONVOY_RETRY_DELAY_MS", "20000"),
            ("CONVOY_RETRY_MAX_DELAY_MS", "10000"),
        ])
        .is_err());
    }
}
