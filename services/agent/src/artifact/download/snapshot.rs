//! Snapshot build source.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use convoy_reconcile::CancelToken;

use super::{DownloadError, Downloader, HttpDownloader};
use crate::artifact::layout::{ArtifactConfig, ArtifactRef};

/// HTTP source rooted at the snapshot repository.
///
/// Only consulted when the agent runs in snapshot mode.
pub struct SnapshotDownloader {
    inner: HttpDownloader,
}

impl SnapshotDownloader {
    pub fn new(layout: Arc<ArtifactConfig>) -> Result<Self, DownloadError> {
        let base = layout
            .snapshot_uri
            .clone()
            .ok_or_else(|| DownloadError::InvalidConfig("snapshot uri not set".to_string()))?;
        let inner = HttpDownloader::with_base("snapshot", &base, layout)?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl Downloader for SnapshotDownloader {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn download(
        &self,
        artifact: &ArtifactRef,
        cancel: &CancelToken,
    ) -> Result<PathBuf, DownloadError> {
        self.inner.download(artifact, cancel).await
    }
}
