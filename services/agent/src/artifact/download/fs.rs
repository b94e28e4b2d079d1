//! Local filesystem source.
//!
//! Serves archives already in the download cache, or copies pre-staged
//! archives out of the drop directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use convoy_reconcile::CancelToken;
use tracing::debug;

use super::{temp_path, DownloadError, Downloader};
use crate::artifact::layout::{ArtifactConfig, ArtifactRef};

pub struct FsDownloader {
    layout: Arc<ArtifactConfig>,
}

impl FsDownloader {
    pub fn new(layout: Arc<ArtifactConfig>) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl Downloader for FsDownloader {
    fn name(&self) -> &str {
        "fs"
    }

    async fn download(
        &self,
        artifact: &ArtifactRef,
        cancel: &CancelToken,
    ) -> Result<PathBuf, DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let dest = self.layout.download_path(artifact);
        if tokio::fs::try_exists(&dest).await? {
            // Without a checksum the cached copy cannot be verified; fetch it again.
            if artifact.sha512.is_some()
                || tokio::fs::try_exists(self.layout.checksum_path(artifact)).await?
            {
                debug!(artifact = %artifact, path = %dest.display(), "Artifact already cached");
                return Ok(dest);
            }
            debug!(artifact = %artifact, "Cached artifact has no checksum, ignoring it");
        }

        let staged = self.layout.drop_dir.join(self.layout.file_name(artifact));
        if !tokio::fs::try_exists(&staged).await? {
            return Err(DownloadError::NotFound {
                location: staged.display().to_string(),
            });
        }

        tokio::fs::create_dir_all(&self.layout.download_dir).await?;
        copy_atomic(&staged, &dest).await?;

        let staged_sum = self
            .layout
            .drop_dir
            .join(self.layout.checksum_file_name(artifact));
        if tokio::fs::try_exists(&staged_sum).await? {
            copy_atomic(&staged_sum, &self.layout.checksum_path(artifact)).await?;
        }

        debug!(artifact = %artifact, from = %staged.display(), "Artifact copied from drop directory");
        Ok(dest)
    }
}

async fn copy_atomic(src: &Path, dest: &Path) -> Result<(), DownloadError> {
    let tmp = temp_path(dest);
    if let Err(e) = tokio::fs::copy(src, &tmp).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    tokio::fs::rename(&tmp, dest).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_reconcile::ComponentId;

    fn setup(root: &Path) -> (Arc<ArtifactConfig>, ArtifactRef) {
        let mut cfg = ArtifactConfig::with_data_dir(root);
        cfg.os = "linux".into();
        cfg.arch = "x86_64".into();
        let artifact = ArtifactRef {
            component: ComponentId::parse("logs").unwrap(),
            binary: "filebeat".into(),
            remote_dir: "beats/filebeat".into(),
            version: "8.3.0".into(),
            sha512: None,
        };
        (Arc::new(cfg), artifact)
    }

    #[tokio::test]
    async fn test_missing_everywhere_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, artifact) = setup(dir.path());

        let err = FsDownloader::new(cfg)
            .download(&artifact, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_copies_from_drop_dir_with_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, artifact) = setup(dir.path());
        std::fs::create_dir_all(&cfg.drop_dir).unwrap();
        std::fs::write(cfg.drop_dir.join(cfg.file_name(&artifact)), b"archive").unwrap();
        std::fs::write(
            cfg.drop_dir.join(cfg.checksum_file_name(&artifact)),
            b"abc  filebeat",
        )
        .unwrap();

        let path = FsDownloader::new(cfg.clone())
            .download(&artifact, &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(path, cfg.download_path(&artifact));
        assert_eq!(std::fs::read(&path).unwrap(), b"archive");
        assert!(cfg.checksum_path(&artifact).exists());

        let leftovers: Vec<_> = std::fs::read_dir(&cfg.download_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_cached_archive_returned() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, artifact) = setup(dir.path());
        std::fs::create_dir_all(&cfg.download_dir).unwrap();
        std::fs::write(cfg.download_path(&artifact), b"cached").unwrap();
        std::fs::write(cfg.checksum_path(&artifact), b"abc  filebeat").unwrap();

        let path = FsDownloader::new(cfg.clone())
            .download(&artifact, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"cached");
    }

    #[tokio::test]
    async fn test_cached_archive_without_checksum_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, artifact) = setup(dir.path());
        std::fs::create_dir_all(&cfg.download_dir).unwrap();
        std::fs::write(cfg.download_path(&artifact), b"cached").unwrap();

        let err = FsDownloader::new(cfg.clone())
            .download(&artifact, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::NotFound { .. }));

        // A pinned checksum makes the cached copy usable as is.
        let mut pinned = artifact.clone();
        pinned.sha512 = Some("00".repeat(64));
        let path = FsDownloader::new(cfg)
            .download(&pinned, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"cached");
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, artifact) = setup(dir.path());
        let (tx, token) = CancelToken::pair();
        tx.send(true).unwrap();

        let err = FsDownloader::new(cfg)
            .download(&artifact, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled));
    }
}
