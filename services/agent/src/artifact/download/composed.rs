//! Ordered chain of downloaders.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use convoy_reconcile::{with_retry, CancelToken, RetryConfig, RetryError};
use tracing::{debug, error, warn};

use super::{
    DownloadError, Downloader, FsDownloader, HttpDownloader, SnapshotDownloader, SourceFailure,
};
use crate::artifact::layout::{ArtifactConfig, ArtifactRef};

/// Tries each source in order; the first success wins.
///
/// Every source call runs under the retry policy. Cancellation stops the
/// chain immediately instead of falling through to the next source.
pub struct DownloaderChain {
    sources: Vec<Arc<dyn Downloader>>,
    retry: RetryConfig,
}

impl DownloaderChain {
    pub fn new(sources: Vec<Arc<dyn Downloader>>, retry: RetryConfig) -> Self {
        Self { sources, retry }
    }

    /// Local filesystem, then snapshot (snapshot mode only), then release.
    pub fn from_config(
        layout: Arc<ArtifactConfig>,
        retry: RetryConfig,
    ) -> Result<Self, DownloadError> {
        let mut sources: Vec<Arc<dyn Downloader>> = Vec::with_capacity(3);
        sources.push(Arc::new(FsDownloader::new(layout.clone())));

        if layout.snapshot {
            match SnapshotDownloader::new(layout.clone()) {
                Ok(snapshot) => sources.push(Arc::new(snapshot)),
                Err(e) => error!(error = %e, "Snapshot source unavailable, skipping"),
            }
        }

        sources.push(Arc::new(HttpDownloader::new(layout)?));
        Ok(Self::new(sources, retry))
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl Downloader for DownloaderChain {
    fn name(&self) -> &str {
        "chain"
    }

    async fn download(
        &self,
        artifact: &ArtifactRef,
        cancel: &CancelToken,
    ) -> Result<PathBuf, DownloadError> {
        let mut failures = Vec::with_capacity(self.sources.len());

        for source in &self.sources {
            let result = with_retry(&self.retry, cancel, |_| source.download(artifact, cancel)).await;

            let err = match result {
                Ok(path) => {
                    debug!(source = source.name(), artifact = %artifact, "Artifact fetched");
                    return Ok(path);
                }
                Err(RetryError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(RetryError::Exhausted { source: e, .. }) | Err(RetryError::Permanent(e)) => e,
            };

            warn!(
                source = source.name(),
                artifact = %artifact,
                error = %err,
                "Source failed, trying next"
            );
            failures.push(SourceFailure {
                downloader: source.name().to_string(),
                error: err.to_string(),
            });
        }

        Err(DownloadError::AllSourcesFailed(failures))
    }
}
