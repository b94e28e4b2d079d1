//! Shared fixtures: a temporary host with staged artifacts, the real
//! verifier and installer, and a mock process runtime.

#![allow(dead_code)]

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use convoy_agent::artifact::download::FsDownloader;
use convoy_agent::artifact::{
    ArtifactConfig, Artifacts, Downloader, DownloaderChain, Sha512Verifier, TarGzInstaller,
};
use convoy_agent::operator::{Operator, OperatorConfig};
use convoy_agent::runtime::MockRuntime;
use convoy_reconcile::{
    ComponentId, ComponentRegistry, ComponentRuntimeState, ComponentSpec, ProgramName,
    ProgramSpec, Resolver, RetryConfig, Step, UnitId, UnitKind, UnitSpec,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha512};
use tempfile::TempDir;
use tokio::sync::watch;

pub const PROGRAM: &str = "filebeat";

pub fn program() -> ProgramSpec {
    ProgramSpec::new(ProgramName::parse(PROGRAM).unwrap())
}

pub fn registry() -> Arc<ComponentRegistry> {
    Arc::new(ComponentRegistry::from_programs([program()]).unwrap())
}

pub fn id(s: &str) -> ComponentId {
    ComponentId::parse(s).unwrap()
}

/// A component with one input unit.
pub fn spec(component: &str, version: &str) -> ComponentSpec {
    ComponentSpec::new(id(component), ProgramName::parse(PROGRAM).unwrap(), version).with_unit(
        UnitSpec {
            id: UnitId::parse(&format!("{component}-in")).unwrap(),
            kind: UnitKind::Input,
            config: serde_json::json!({"paths": ["/var/log/*.log"]}),
        },
    )
}

pub struct Host {
    pub dir: TempDir,
    pub layout: Arc<ArtifactConfig>,
    pub runtime: Arc<MockRuntime>,
    pub operator: Arc<Operator>,
    pub shutdown: watch::Sender<bool>,
}

impl Host {
    pub fn new() -> Self {
        Self::with_runtime(MockRuntime::new())
    }

    pub fn with_runtime(runtime: MockRuntime) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let layout = Arc::new(ArtifactConfig::with_data_dir(dir.path()));
        std::fs::create_dir_all(&layout.drop_dir).unwrap();

        let fs: Arc<dyn Downloader> = Arc::new(FsDownloader::new(layout.clone()));
        let installer = Arc::new(TarGzInstaller::new(layout.clone()));
        let artifacts = Artifacts {
            layout: layout.clone(),
            downloader: Arc::new(DownloaderChain::new(vec![fs], RetryConfig::disabled())),
            verifier: Arc::new(Sha512Verifier::new(layout.clone())),
            installer: installer.clone(),
            uninstaller: installer,
            retry: RetryConfig::disabled(),
        };

        let runtime = Arc::new(runtime);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let config = OperatorConfig {
            failure_timeout: Duration::from_secs(1),
            start_timeout: Duration::from_secs(2),
            max_parallel: 4,
        };
        let operator = Arc::new(Operator::new(config, artifacts, runtime.clone(), shutdown_rx));

        Self {
            dir,
            layout,
            runtime,
            operator,
            shutdown,
        }
    }

    /// Place a valid archive and checksum sidecar for `version` in the drop
    /// directory.
    pub fn stage(&self, version: &str) {
        let artifact = self.layout.artifact_for(&spec("staged", version), &program());
        let archive = self.layout.drop_dir.join(self.layout.file_name(&artifact));

        let file = File::create(&archive).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        let root = format!("{PROGRAM}-{version}");
        for (name, data) in [
            (PROGRAM, b"#!/bin/sh\nexec sleep 600\n".as_slice()),
            ("README", b"staged for tests\n".as_slice()),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("{root}/{name}"), data)
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();

        let sum = hex::encode(Sha512::digest(std::fs::read(&archive).unwrap()));
        let sidecar = self
            .layout
            .drop_dir
            .join(self.layout.checksum_file_name(&artifact));
        std::fs::write(
            sidecar,
            format!("{sum}  {}\n", self.layout.file_name(&artifact)),
        )
        .unwrap();
    }

    /// Where `version` is unpacked.
    pub fn install_path(&self, version: &str) -> PathBuf {
        let artifact = self.layout.artifact_for(&spec("staged", version), &program());
        self.layout.install_path(&artifact)
    }

    /// Resolve `desired` against the operator's current snapshot.
    pub async fn plan(&self, desired: &[ComponentSpec]) -> Vec<Step> {
        let current = self.operator.snapshot().await;
        Resolver::new(registry()).resolve(desired, &current).unwrap()
    }

    pub async fn state(&self, component: &str) -> Option<ComponentRuntimeState> {
        let id = id(component);
        self.operator
            .snapshot()
            .await
            .into_iter()
            .find(|s| s.id() == &id)
    }

    /// Poll until `component` satisfies `predicate`, for up to five seconds.
    pub async fn wait_for(
        &self,
        component: &str,
        predicate: impl Fn(&ComponentRuntimeState) -> bool,
    ) -> ComponentRuntimeState {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(state) = self.state(component).await {
                if predicate(&state) {
                    return state;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "component {component} never reached the expected state"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
