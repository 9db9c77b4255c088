//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use warmpool_id::InstanceId;
use warmpool_manager::{MockPlatform, Provisioner, ProvisionerConfig};
use warmpool_naming::{InstanceName, NameCodec, Phase, VersionTag};

pub const PREFIX: &str = "cf";
pub const RELEASE: &str = "0.0.1";

/// Codec of the running generation (`001`).
pub fn codec() -> NameCodec {
    NameCodec::new(PREFIX, VersionTag::from_release(RELEASE).unwrap()).unwrap()
}

/// Encoded name of a fresh instance in `phase` and generation `version`.
pub fn pool_name(phase: Phase, version: &str) -> String {
    let name = InstanceName::new(InstanceId::random(), phase, VersionTag::parse(version).unwrap());
    codec().encode(&name)
}

/// A small instance template.
pub fn template() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("Procfile"), "web: bin/start\n").unwrap();
    fs::create_dir(dir.path().join("bin")).unwrap();
    fs::write(
        dir.path().join("bin/start"),
        "#!/bin/sh\necho \"{{ INSTANCE_NAME }} at {{ VERSION }}\"\n",
    )
    .unwrap();
    dir
}

pub fn provisioner_config(template: &TempDir) -> ProvisionerConfig {
    ProvisionerConfig {
        template_dir: template.path().to_path_buf(),
        release_version: RELEASE.to_string(),
        poll_interval: Duration::from_millis(10),
        ..ProvisionerConfig::default()
    }
}

pub fn provisioner(mock: &MockPlatform, template: &TempDir) -> Arc<Provisioner> {
    Arc::new(Provisioner::new(
        Arc::new(mock.clone()),
        codec(),
        provisioner_config(template),
    ))
}
