//! Artifact handling: fetching, verifying, installing and removing the
//! archives that components run from.
//!
//! ```text
//! DownloaderChain (fs -> snapshot -> http) -> Sha512Verifier -> TarGzInstaller
//! ```

pub mod download;
pub mod install;
pub mod layout;
pub mod verify;

use std::sync::Arc;

use convoy_reconcile::RetryConfig;

pub use download::{DownloadError, Downloader, DownloaderChain};
pub use install::{InstallError, Installer, TarGzInstaller, Uninstaller};
pub use layout::{ArtifactConfig, ArtifactRef};
pub use verify::{Sha512Verifier, VerifyError, Verifier};

/// The artifact capabilities the operator drives.
#[derive(Clone)]
pub struct Artifacts {
    pub layout: Arc<ArtifactConfig>,
    pub downloader: Arc<dyn Downloader>,
    pub verifier: Arc<dyn Verifier>,
    pub installer: Arc<dyn Installer>,
    pub uninstaller: Arc<dyn Uninstaller>,
    /// Applied to each source fetch and to installation.
    pub retry: RetryConfig,
}

impl Artifacts {
    /// Production wiring for the given layout.
    pub fn from_config(layout: ArtifactConfig, retry: RetryConfig) -> Result<Self, DownloadError> {
        let layout = Arc::new(layout);
        let installer = Arc::new(TarGzInstaller::new(layout.clone()));
        Ok(Self {
            downloader: Arc::new(DownloaderChain::from_config(layout.clone(), retry.clone())?),
            verifier: Arc::new(Sha512Verifier::new(layout.clone())),
            installer: installer.clone(),
            uninstaller: installer,
            layout,
            retry,
        })
    }
}
