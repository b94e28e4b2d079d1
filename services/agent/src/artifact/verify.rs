//! Artifact integrity verification.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use convoy_reconcile::{CancelToken, Classify, ErrorClass};
use sha2::{Digest, Sha512};
use thiserror::Error;
use tracing::{debug, warn};

use super::layout::{ArtifactConfig, ArtifactRef};

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("no checksum available for {artifact} (looked for {path})")]
    MissingChecksum { artifact: String, path: PathBuf },

    #[error("malformed checksum for {artifact}")]
    MalformedChecksum { artifact: String },

    #[error("checksum mismatch for {artifact}: expected {expected}, got {actual}")]
    Mismatch {
        artifact: String,
        expected: String,
        actual: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("verification cancelled")]
    Cancelled,
}

impl Classify for VerifyError {
    /// A failed verification never gets better by retrying.
    fn class(&self) -> ErrorClass {
        match self {
            VerifyError::Cancelled => ErrorClass::Cancelled,
            _ => ErrorClass::Permanent,
        }
    }
}

#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(
        &self,
        artifact: &ArtifactRef,
        archive: &Path,
        cancel: &CancelToken,
    ) -> Result<(), VerifyError>;
}

/// Checks archives against a hex SHA-512.
///
/// A checksum pinned in the spec wins over the downloaded sidecar. An archive
/// that fails verification, or has nothing to verify against, is removed from
/// the cache so the next attempt fetches it again.
pub struct Sha512Verifier {
    layout: Arc<ArtifactConfig>,
}

impl Sha512Verifier {
    pub fn new(layout: Arc<ArtifactConfig>) -> Self {
        Self { layout }
    }

    async fn expected(&self, artifact: &ArtifactRef) -> Result<String, VerifyError> {
        if let Some(pinned) = &artifact.sha512 {
            return Ok(pinned.to_ascii_lowercase());
        }

        let path = self.layout.checksum_path(artifact);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(VerifyError::MissingChecksum {
                    artifact: artifact.to_string(),
                    path,
                })
            }
            Err(e) => return Err(e.into()),
        };

        parse_checksum(&contents).ok_or_else(|| VerifyError::MalformedChecksum {
            artifact: artifact.to_string(),
        })
    }
}

#[async_trait]
impl Verifier for Sha512Verifier {
    async fn verify(
        &self,
        artifact: &ArtifactRef,
        archive: &Path,
        cancel: &CancelToken,
    ) -> Result<(), VerifyError> {
        if cancel.is_cancelled() {
            return Err(VerifyError::Cancelled);
        }

        let expected = match self.expected(artifact).await {
            Ok(expected) => expected,
            Err(e @ (VerifyError::MissingChecksum { .. } | VerifyError::MalformedChecksum { .. })) => {
                warn!(artifact = %artifact, error = %e, "Unverifiable archive, discarding it");
                let _ = tokio::fs::remove_file(archive).await;
                let _ = tokio::fs::remove_file(self.layout.checksum_path(artifact)).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let path = archive.to_path_buf();
        let hashing = tokio::task::spawn_blocking(move || hash_file(&path));
        let actual = tokio::select! {
            r = hashing => r.map_err(|e| io::Error::other(e.to_string()))??,
            _ = cancel.cancelled() => return Err(VerifyError::Cancelled),
        };

        if actual != expected {
            warn!(artifact = %artifact, "Checksum mismatch, discarding archive");
            let _ = tokio::fs::remove_file(archive).await;
            return Err(VerifyError::Mismatch {
                artifact: artifact.to_string(),
                expected,
                actual,
            });
        }

        debug!(artifact = %artifact, "Artifact verified");
        Ok(())
    }
}

/// First token of a sidecar (`<hex>  <file name>`), if it is a SHA-512.
fn parse_checksum(contents: &str) -> Option<String> {
    let sum = contents.split_whitespace().next()?;
    if sum.len() == 128 && sum.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(sum.to_ascii_lowercase())
    } else {
        None
    }
}

fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha512::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_reconcile::ComponentId;

    fn setup(root: &Path) -> (Arc<ArtifactConfig>, ArtifactRef, PathBuf) {
        let cfg = Arc::new(ArtifactConfig::with_data_dir(root));
        let artifact = ArtifactRef {
            component: ComponentId::parse("logs").unwrap(),
            binary: "filebeat".into(),
            remote_dir: "filebeat".into(),
            version: "8.3.0".into(),
            sha512: None,
        };
        std::fs::create_dir_all(&cfg.download_dir).unwrap();
        let archive = cfg.download_path(&artifact);
        std::fs::write(&archive, b"archive-bytes").unwrap();
        (cfg, artifact, archive)
    }

    fn sum(data: &[u8]) -> String {
        hex::encode(Sha512::digest(data))
    }

    #[tokio::test]
    async fn test_sidecar_match() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, artifact, archive) = setup(dir.path());
        std::fs::write(
            cfg.checksum_path(&artifact),
            format!("{}  filebeat-8.3.0.tar.gz\n", sum(b"archive-bytes")),
        )
        .unwrap();

        Sha512Verifier::new(cfg)
            .verify(&artifact, &archive, &CancelToken::never())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mismatch_is_permanent_and_discards_archive() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, artifact, archive) = setup(dir.path());
        std::fs::write(cfg.checksum_path(&artifact), sum(b"other")).unwrap();

        let err = Sha512Verifier::new(cfg)
            .verify(&artifact, &archive, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Mismatch { .. }));
        assert_eq!(err.class(), ErrorClass::Permanent);
        assert!(!archive.exists());
    }

    #[tokio::test]
    async fn test_pinned_checksum_overrides_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, mut artifact, archive) = setup(dir.path());
        std::fs::write(cfg.checksum_path(&artifact), sum(b"other")).unwrap();
        artifact.sha512 = Some(sum(b"archive-bytes").to_uppercase());

        Sha512Verifier::new(cfg)
            .verify(&artifact, &archive, &CancelToken::never())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, artifact, archive) = setup(dir.path());

        let err = Sha512Verifier::new(cfg)
            .verify(&artifact, &archive, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::MissingChecksum { .. }));
        assert_eq!(err.class(), ErrorClass::Permanent);
        assert!(!archive.exists());
    }

    #[tokio::test]
    async fn test_malformed_sidecar_discards_both() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, artifact, archive) = setup(dir.path());
        std::fs::write(cfg.checksum_path(&artifact), "not-a-sum").unwrap();

        let err = Sha512Verifier::new(cfg.clone())
            .verify(&artifact, &archive, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::MalformedChecksum { .. }));
        assert!(!archive.exists());
        assert!(!cfg.checksum_path(&artifact).exists());
    }

    #[test]
    fn test_parse_checksum() {
        let hex = "a".repeat(128);
        assert_eq!(parse_checksum(&format!("{hex}  file")), Some(hex.clone()));
        assert_eq!(parse_checksum(&hex.to_uppercase()), Some(hex));
        assert_eq!(parse_checksum("abc file"), None);
        assert_eq!(parse_checksum(""), None);
    }
}
