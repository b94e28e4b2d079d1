//! Artifact naming and on-disk layout.

use std::path::PathBuf;
use std::time::Duration;

use convoy_reconcile::{ComponentId, ComponentSpec, ProgramSpec};

/// Version suffix carried by snapshot builds.
pub const SNAPSHOT_SUFFIX: &str = "-SNAPSHOT";

/// Extension of the checksum sidecar published next to each artifact.
pub const CHECKSUM_EXT: &str = "sha512";

/// Marker written into an install directory once unpacking completed.
pub const INSTALLED_MARKER: &str = ".installed";

/// Where artifacts come from and where they land.
///
/// Built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct ArtifactConfig {
    /// Target operating system, as used in artifact names.
    pub os: String,
    /// Target architecture, as used in artifact names.
    pub arch: String,
    /// Cache of fetched archives.
    pub download_dir: PathBuf,
    /// Root of unpacked installs.
    pub install_dir: PathBuf,
    /// Directory checked for pre-staged archives before any remote source.
    pub drop_dir: PathBuf,
    /// Base URL of the release source.
    pub source_uri: String,
    /// Base URL of the snapshot source.
    pub snapshot_uri: Option<String>,
    /// Whether snapshot builds are requested.
    pub snapshot: bool,
    pub http_timeout: Duration,
}

impl ArtifactConfig {
    /// Layout rooted at `data_dir` with host OS/arch and the default release source.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            os: host_os().to_string(),
            arch: host_arch().to_string(),
            download_dir: data_dir.join("downloads"),
            install_dir: data_dir.join("install"),
            drop_dir: data_dir.join("drop"),
            source_uri: DEFAULT_SOURCE_URI.to_string(),
            snapshot_uri: None,
            snapshot: false,
            http_timeout: Duration::from_secs(120),
        }
    }

    /// `{binary}-{version}-{os}-{arch}`
    pub fn base_name(&self, artifact: &ArtifactRef) -> String {
        format!(
            "{}-{}-{}-{}",
            artifact.binary, artifact.version, self.os, self.arch
        )
    }

    /// Archive file name.
    pub fn file_name(&self, artifact: &ArtifactRef) -> String {
        format!("{}.tar.gz", self.base_name(artifact))
    }

    pub fn checksum_file_name(&self, artifact: &ArtifactRef) -> String {
        format!("{}.{}", self.file_name(artifact), CHECKSUM_EXT)
    }

    /// Where a fetched archive is cached.
    pub fn download_path(&self, artifact: &ArtifactRef) -> PathBuf {
        self.download_dir.join(self.file_name(artifact))
    }

    pub fn checksum_path(&self, artifact: &ArtifactRef) -> PathBuf {
        self.download_dir.join(self.checksum_file_name(artifact))
    }

    /// Where the archive is unpacked.
    pub fn install_path(&self, artifact: &ArtifactRef) -> PathBuf {
        self.install_dir.join(self.base_name(artifact))
    }

    /// Remote location of the archive below a source root.
    pub fn remote_path(&self, artifact: &ArtifactRef) -> String {
        format!(
            "{}/{}",
            artifact.remote_dir.trim_matches('/'),
            self.file_name(artifact)
        )
    }

    /// Resolve the artifact a component spec refers to.
    pub fn artifact_for(&self, spec: &ComponentSpec, program: &ProgramSpec) -> ArtifactRef {
        let version = if self.snapshot && !spec.version.ends_with(SNAPSHOT_SUFFIX) {
            format!("{}{}", spec.version, SNAPSHOT_SUFFIX)
        } else {
            spec.version.clone()
        };

        ArtifactRef {
            component: spec.id.clone(),
            binary: program.binary_name().to_string(),
            remote_dir: program.artifact_path().to_string(),
            version,
            sha512: spec.sha512.clone(),
        }
    }
}

pub const DEFAULT_SOURCE_URI: &str = "https://artifacts.convoy.dev/downloads";

/// Identity of one artifact for one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub component: ComponentId,
    pub binary: String,
    pub remote_dir: String,
    /// Effective version, including any snapshot suffix.
    pub version: String,
    /// Pinned checksum from the spec, if any.
    pub sha512: Option<String>,
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.binary, self.version)
    }
}

/// Host OS in artifact naming.
pub fn host_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

/// Host architecture in artifact naming.
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm64",
        other => other,
    }
}
