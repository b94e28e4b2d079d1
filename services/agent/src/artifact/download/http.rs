//! Remote HTTP source.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use convoy_reconcile::CancelToken;
use reqwest::{Client, StatusCode, Url};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{temp_path, DownloadError, Downloader};
use crate::artifact::layout::{ArtifactConfig, ArtifactRef, CHECKSUM_EXT};

/// Downloads archives from `{base}/{remote_dir}/{file_name}`.
pub struct HttpDownloader {
    name: String,
    base: Url,
    client: Client,
    layout: Arc<ArtifactConfig>,
}

impl HttpDownloader {
    /// Release source rooted at `layout.source_uri`.
    pub fn new(layout: Arc<ArtifactConfig>) -> Result<Self, DownloadError> {
        let base = layout.source_uri.clone();
        Self::with_base("http", &base, layout)
    }

    pub fn with_base(
        name: impl Into<String>,
        base: &str,
        layout: Arc<ArtifactConfig>,
    ) -> Result<Self, DownloadError> {
        let mut base = Url::parse(base)
            .map_err(|e| DownloadError::InvalidConfig(format!("source uri '{base}': {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .timeout(layout.http_timeout)
            .build()
            .map_err(DownloadError::Http)?;

        Ok(Self {
            name: name.into(),
            base,
            client,
            layout,
        })
    }

    fn url_for(&self, artifact: &ArtifactRef) -> Result<Url, DownloadError> {
        self.base
            .join(&self.layout.remote_path(artifact))
            .map_err(|e| DownloadError::InvalidConfig(e.to_string()))
    }

    /// Stream `url` into a temporary file beside `dest`.
    ///
    /// The caller publishes the returned file by renaming it onto `dest`.
    async fn fetch_tmp(
        &self,
        url: &Url,
        dest: &Path,
        cancel: &CancelToken,
    ) -> Result<(PathBuf, u64), DownloadError> {
        let mut response = tokio::select! {
            r = self.client.get(url.clone()).send() => r?,
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        };

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(DownloadError::NotFound {
                    location: url.to_string(),
                })
            }
            status => {
                return Err(DownloadError::Status {
                    status: status.as_u16(),
                    url: url.to_string(),
                })
            }
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = temp_path(dest);
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut total: u64 = 0;

        let result: Result<(), DownloadError> = async {
            loop {
                let chunk = tokio::select! {
                    c = response.chunk() => c?,
                    _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                };
                let Some(chunk) = chunk else { break };
                total += chunk.len() as u64;
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        drop(file);
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }

        Ok((tmp, total))
    }
}

async fn discard(paths: &[&Path]) {
    for path in paths {
        let _ = tokio::fs::remove_file(path).await;
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    fn name(&self) -> &str {
        &self.name
    }

    async fn download(
        &self,
        artifact: &ArtifactRef,
        cancel: &CancelToken,
    ) -> Result<PathBuf, DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let url = self.url_for(artifact)?;
        let dest = self.layout.download_path(artifact);

        debug!(source = %self.name, url = %url, dest = %dest.display(), "Downloading artifact");
        let (archive_tmp, size) = self.fetch_tmp(&url, &dest, cancel).await?;

        // The sidecar is optional when the spec pins a checksum.
        let sum_dest = self.layout.checksum_path(artifact);
        let sum_tmp = match Url::parse(&format!("{url}.{CHECKSUM_EXT}")) {
            Ok(sum_url) => match self.fetch_tmp(&sum_url, &sum_dest, cancel).await {
                Ok((tmp, _)) => Some(tmp),
                Err(DownloadError::NotFound { .. }) if artifact.sha512.is_some() => {
                    debug!(url = %sum_url, "No checksum sidecar, using pinned checksum");
                    None
                }
                Err(e) => {
                    discard(&[&archive_tmp]).await;
                    return Err(e);
                }
            },
            Err(e) => {
                discard(&[&archive_tmp]).await;
                return Err(DownloadError::InvalidConfig(e.to_string()));
            }
        };

        // Sidecar first: a cached archive always has its checksum beside it.
        if let Some(sum_tmp) = &sum_tmp {
            if let Err(e) = tokio::fs::rename(sum_tmp, &sum_dest).await {
                discard(&[sum_tmp, &archive_tmp]).await;
                return Err(e.into());
            }
        }
        if let Err(e) = tokio::fs::rename(&archive_tmp, &dest).await {
            discard(&[&archive_tmp]).await;
            return Err(e.into());
        }

        info!(source = %self.name, artifact = %artifact, size, "Artifact downloaded");
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_reconcile::ComponentId;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn setup(root: &Path, base: &str) -> (HttpDownloader, Arc<ArtifactConfig>, ArtifactRef) {
        let mut cfg = ArtifactConfig::with_data_dir(root);
        cfg.os = "linux".into();
        cfg.arch = "x86_64".into();
        cfg.source_uri = base.to_string();
        let cfg = Arc::new(cfg);
        let artifact = ArtifactRef {
            component: ComponentId::parse("logs").unwrap(),
            binary: "filebeat".into(),
            remote_dir: "beats/filebeat".into(),
            version: "8.3.0".into(),
            sha512: None,
        };
        (HttpDownloader::new(cfg.clone()).unwrap(), cfg, artifact)
    }

    #[tokio::test]
    async fn test_downloads_archive_and_sidecar() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/downloads/beats/filebeat/filebeat-8.3.0-linux-x86_64.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"archive-bytes".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(
                "/downloads/beats/filebeat/filebeat-8.3.0-linux-x86_64.tar.gz.sha512",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_string("deadbeef  filebeat"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (downloader, cfg, artifact) =
            setup(dir.path(), &format!("{}/downloads", server.uri()));

        let path = downloader
            .download(&artifact, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"archive-bytes");
        assert_eq!(
            std::fs::read_to_string(cfg.checksum_path(&artifact)).unwrap(),
            "deadbeef  filebeat"
        );
    }

    #[tokio::test]
    async fn test_missing_archive_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (downloader, cfg, artifact) = setup(dir.path(), &server.uri());

        let err = downloader
            .download(&artifact, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::NotFound { .. }));
        assert!(!cfg.download_path(&artifact).exists());
    }

    #[tokio::test]
    async fn test_server_error_is_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (downloader, _cfg, artifact) = setup(dir.path(), &server.uri());

        let err = downloader
            .download(&artifact, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_missing_sidecar_tolerated_when_pinned() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/beats/filebeat/filebeat-8.3.0-linux-x86_64.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (downloader, _cfg, mut artifact) = setup(dir.path(), &server.uri());
        artifact.sha512 = Some("00".repeat(64));

        assert!(downloader
            .download(&artifact, &CancelToken::never())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_sidecar_failure_leaves_nothing_cached() {
        let server = MockServer::start().await;
        let archive_path = "/beats/filebeat/filebeat-8.3.0-linux-x86_64.tar.gz";
        Mock::given(method("GET"))
            .and(path(archive_path))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"archive-bytes".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{archive_path}.sha512")))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{archive_path}.sha512")))
            .respond_with(ResponseTemplate::new(200).set_body_string("cafe  filebeat"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (downloader, cfg, artifact) = setup(dir.path(), &server.uri());

        let err = downloader
            .download(&artifact, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Status { status: 503, .. }));
        assert!(!cfg.download_path(&artifact).exists());
        assert!(!cfg.checksum_path(&artifact).exists());
        let leftovers = std::fs::read_dir(&cfg.download_dir).unwrap().count();
        assert_eq!(leftovers, 0);

        // The next attempt fetches both again.
        let path = downloader
            .download(&artifact, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"archive-bytes");
        assert_eq!(
            std::fs::read_to_string(cfg.checksum_path(&artifact)).unwrap(),
            "cafe  filebeat"
        );
    }

    #[test]
    fn test_invalid_base_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Arc::new(ArtifactConfig::with_data_dir(dir.path()));
        assert!(matches!(
            HttpDownloader::with_base("http", "not a url", cfg),
            Err(DownloadError::InvalidConfig(_))
        ));
    }
}
