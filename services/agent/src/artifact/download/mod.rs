//! Artifact downloaders.
//!
//! Every source implements [`Downloader`]; [`DownloaderChain`] composes
//! them in priority order and is itself a [`Downloader`].

mod composed;
mod fs;
mod http;
mod snapshot;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use convoy_reconcile::{CancelToken, Classify, ErrorClass};
use thiserror::Error;

pub use composed::DownloaderChain;
pub use fs::FsDownloader;
pub use http::HttpDownloader;
pub use snapshot::SnapshotDownloader;

use super::layout::ArtifactRef;

/// Errors from fetching an artifact.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("artifact not found at {location}")]
    NotFound { location: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid source configuration: {0}")]
    InvalidConfig(String),

    #[error("download cancelled")]
    Cancelled,

    #[error("all sources failed: {}", format_failures(.0))]
    AllSourcesFailed(Vec<SourceFailure>),
}

impl Classify for DownloadError {
    fn class(&self) -> ErrorClass {
        match self {
            DownloadError::Http(_) | DownloadError::Io(_) => ErrorClass::Transient,
            DownloadError::Status { status, .. } if *status == 429 || *status >= 500 => {
                ErrorClass::Transient
            }
            DownloadError::Status { .. }
            | DownloadError::NotFound { .. }
            | DownloadError::InvalidConfig(_)
            | DownloadError::AllSourcesFailed(_) => ErrorClass::Permanent,
            DownloadError::Cancelled => ErrorClass::Cancelled,
        }
    }
}

/// One source's failure inside a [`DownloadError::AllSourcesFailed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub downloader: String,
    pub error: String,
}

impl std::fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.downloader, self.error)
    }
}

fn format_failures(failures: &[SourceFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A source of artifact archives.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Short source name used in logs and aggregated errors.
    fn name(&self) -> &str;

    /// Fetch the archive into the download directory and return its path.
    async fn download(
        &self,
        artifact: &ArtifactRef,
        cancel: &CancelToken,
    ) -> Result<PathBuf, DownloadError>;
}

/// Temporary sibling path for an atomic write of `dest`.
pub(crate) fn temp_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            DownloadError::NotFound {
                location: "x".into()
            }
            .class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            DownloadError::Status {
                status: 503,
                url: "x".into()
            }
            .class(),
            ErrorClass::Transient
        );
        assert_eq!(
            DownloadError::Status {
                status: 403,
                url: "x".into()
            }
            .class(),
            ErrorClass::Permanent
        );
        assert_eq!(DownloadError::Cancelled.class(), ErrorClass::Cancelled);
    }

    #[test]
    fn test_all_sources_failed_names_each_source() {
        let err = DownloadError::AllSourcesFailed(vec![
            SourceFailure {
                downloader: "fs".into(),
                error: "not found".into(),
            },
            SourceFailure {
                downloader: "http".into(),
                error: "timeout".into(),
            },
        ]);
        assert_eq!(
            err.to_string(),
            "all sources failed: fs: not found; http: timeout"
        );
    }

    #[test]
    fn test_temp_path_is_hidden_sibling() {
        let tmp = temp_path(Path::new("/d/filebeat.tar.gz"));
        assert_eq!(tmp.parent(), Some(Path::new("/d")));
        let name = tmp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".filebeat.tar.gz."));
        assert!(name.ends_with(".tmp"));
    }
}
