//! Installing and removing unpacked artifacts.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use convoy_reconcile::{CancelToken, Classify, ErrorClass};
use flate2::read::GzDecoder;
use tar::Archive;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::layout::{ArtifactConfig, ArtifactRef, INSTALLED_MARKER};

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid archive {path}: {reason}")]
    InvalidArchive { path: PathBuf, reason: String },

    #[error("install task failed: {0}")]
    Task(String),

    #[error("install cancelled")]
    Cancelled,
}

impl Classify for InstallError {
    fn class(&self) -> ErrorClass {
        match self {
            InstallError::Io(_) => ErrorClass::Transient,
            InstallError::InvalidArchive { .. } | InstallError::Task(_) => ErrorClass::Permanent,
            InstallError::Cancelled => ErrorClass::Cancelled,
        }
    }
}

#[async_trait]
pub trait Installer: Send + Sync {
    /// Whether the artifact is already fully installed. Never mutates disk.
    async fn check(&self, artifact: &ArtifactRef) -> Result<bool, InstallError>;

    /// Unpack `archive` into the artifact's install path. Installing an
    /// already-installed artifact is a no-op.
    async fn install(
        &self,
        artifact: &ArtifactRef,
        archive: &Path,
        cancel: &CancelToken,
    ) -> Result<PathBuf, InstallError>;
}

#[async_trait]
pub trait Uninstaller: Send + Sync {
    /// Remove the artifact's install footprint. Absent installs succeed.
    async fn uninstall(&self, artifact: &ArtifactRef, cancel: &CancelToken)
        -> Result<(), InstallError>;
}

/// Unpacks `.tar.gz` archives into per-version directories.
///
/// Unpacking happens in a hidden staging directory which is renamed into
/// place once complete, so a half-written install is never visible.
pub struct TarGzInstaller {
    layout: Arc<ArtifactConfig>,
}

impl TarGzInstaller {
    pub fn new(layout: Arc<ArtifactConfig>) -> Self {
        Self { layout }
    }

    pub fn install_path(&self, artifact: &ArtifactRef) -> PathBuf {
        self.layout.install_path(artifact)
    }
}

#[async_trait]
impl Installer for TarGzInstaller {
    async fn check(&self, artifact: &ArtifactRef) -> Result<bool, InstallError> {
        let target = self.layout.install_path(artifact);
        Ok(tokio::fs::try_exists(target.join(INSTALLED_MARKER)).await?)
    }

    async fn install(
        &self,
        artifact: &ArtifactRef,
        archive: &Path,
        cancel: &CancelToken,
    ) -> Result<PathBuf, InstallError> {
        let target = self.layout.install_path(artifact);
        if self.check(artifact).await? {
            debug!(artifact = %artifact, "Already installed");
            return Ok(target);
        }
        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }

        let archive = archive.to_path_buf();
        let install_dir = self.layout.install_dir.clone();
        let dest = target.clone();
        tokio::task::spawn_blocking(move || unpack_into(&archive, &install_dir, &dest))
            .await
            .map_err(|e| InstallError::Task(e.to_string()))??;

        info!(artifact = %artifact, path = %target.display(), "Artifact installed");
        Ok(target)
    }
}

#[async_trait]
impl Uninstaller for TarGzInstaller {
    async fn uninstall(
        &self,
        artifact: &ArtifactRef,
        cancel: &CancelToken,
    ) -> Result<(), InstallError> {
        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }

        let target = self.layout.install_path(artifact);
        match tokio::fs::remove_dir_all(&target).await {
            Ok(()) => {
                info!(artifact = %artifact, path = %target.display(), "Artifact uninstalled");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(artifact = %artifact, "Nothing to uninstall");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn unpack_into(archive: &Path, install_dir: &Path, target: &Path) -> Result<(), InstallError> {
    fs::create_dir_all(install_dir)?;

    let staging = install_dir.join(format!(".staging-{}", uuid::Uuid::new_v4().simple()));
    fs::create_dir(&staging)?;

    let result = extract(archive, &staging).and_then(|()| {
        let root = single_root(&staging)?.unwrap_or_else(|| staging.clone());
        File::create(root.join(INSTALLED_MARKER))?;

        let marker = target.join(INSTALLED_MARKER);
        if marker.exists() {
            return Ok(());
        }
        // A leftover target without a marker is a failed earlier attempt.
        if target.exists() {
            fs::remove_dir_all(target)?;
        }
        match fs::rename(&root, target) {
            Ok(()) => Ok(()),
            // Another component installed the same artifact first.
            Err(_) if marker.exists() => Ok(()),
            Err(e) => Err(e.into()),
        }
    });

    if staging.exists() {
        let _ = fs::remove_dir_all(&staging);
    }
    result
}

fn extract(archive_path: &Path, dest: &Path) -> Result<(), InstallError> {
    let file = File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));

    let entries = archive.entries().map_err(|e| invalid(archive_path, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| invalid(archive_path, e))?;
        let path = entry.path().map_err(|e| invalid(archive_path, e))?.into_owned();

        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            warn!(path = %path.display(), "Skipping archive entry outside install root");
            continue;
        }

        entry.unpack_in(dest).map_err(|e| invalid(archive_path, e))?;
    }

    Ok(())
}

/// If `dir` holds exactly one entry and it is a directory, return it.
fn single_root(dir: &Path) -> io::Result<Option<PathBuf>> {
    let mut entries = fs::read_dir(dir)?;
    let Some(first) = entries.next().transpose()? else {
        return Ok(None);
    };
    if entries.next().is_some() || !first.file_type()?.is_dir() {
        return Ok(None);
    }
    Ok(Some(first.path()))
}

fn invalid(path: &Path, e: io::Error) -> InstallError {
    InstallError::InvalidArchive {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}
