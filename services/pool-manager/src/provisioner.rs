//! Provisioning pipeline.
//!
//! Turns a freshly created instance into an Idle one:
//!
//! ```text
//! create (Building) -> tag -> bundle -> upload -> build -> scale 0 -> rename (Idle)
//! ```
//!
//! Any failure after creation deletes the instance through an
//! [`InstanceGuard`]. Every blocking step observes the caller's
//! cancellation token.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Span};
use warmpool_naming::{InstanceName, NameCodec};

use crate::bundle::{self, BundleError};
use crate::guard::InstanceGuard;
use crate::platform::{
    Build, BuildStatus, CreateInstance, Instance, NewBuild, Platform, PlatformError, WEB_PROCESS,
};

/// Config var holding the pool instance ID.
pub const TAG_INSTANCE_ID: &str = "POOL_INSTANCE_ID";
/// Config var holding the release version the instance was built from.
pub const TAG_VERSION: &str = "POOL_VERSION";
/// Config var holding the email of the provisioning account.
pub const TAG_PROVISIONED_BY: &str = "POOL_PROVISIONED_BY";

/// Default build status polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Errors from a provisioning run.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("account {0} has no verified email")]
    Account(String),

    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("bundle error: {0}")]
    Bundle(#[from] BundleError),

    #[error("build {build} failed")]
    BuildFailed { build: String },

    #[error("provisioning cancelled")]
    Cancelled,
}

impl ProvisionError {
    /// Returns true if the run stopped because its token was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProvisionError::Cancelled)
    }
}

/// Provisioner configuration.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Region new instances are created in.
    pub region: String,

    /// Stack new instances are created on.
    pub stack: String,

    /// Template directory packed into every source bundle.
    pub template_dir: PathBuf,

    /// Release version recorded on builds.
    pub release_version: String,

    /// Interval between build status polls.
    pub poll_interval: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            region: "us".to_string(),
            stack: "container".to_string(),
            template_dir: PathBuf::from("./template"),
            release_version: "0.0.1".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Receives build log lines.
pub trait BuildLogSink: Send + Sync {
    fn line(&self, instance: &str, line: &str);
}

/// Writes build log lines as tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl BuildLogSink for TracingSink {
    fn line(&self, instance: &str, line: &str) {
        info!(target: "build_log", instance, "{}", line);
    }
}

/// Drives instances from creation to the Idle phase.
pub struct Provisioner {
    platform: Arc<dyn Platform>,
    codec: NameCodec,
    config: ProvisionerConfig,
    sink: Arc<dyn BuildLogSink>,
}

impl Provisioner {
    /// Create a provisioner logging builds through [`TracingSink`].
    pub fn new(platform: Arc<dyn Platform>, codec: NameCodec, config: ProvisionerConfig) -> Self {
        Self {
            platform,
            codec,
            config,
            sink: Arc::new(TracingSink),
        }
    }

    /// Replace the build log sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn BuildLogSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Name codec of the running generation.
    pub fn codec(&self) -> &NameCodec {
        &self.codec
    }

    /// Provision one instance, returning it in the Idle phase.
    #[instrument(skip_all, fields(instance = tracing::field::Empty))]
    pub async fn provision(&self, cancel: &CancellationToken) -> Result<Instance, ProvisionError> {
        let account = until(cancel, self.platform.get_account()).await?;
        let email = account
            .verified_email()
            .ok_or_else(|| ProvisionError::Account(account.id.clone()))?
            .to_string();

        let name = self.codec.building_name();
        let building = self.codec.encode(&name);
        Span::current().record("instance", building.as_str());

        let instance = until(
            cancel,
            self.platform.create_instance(&CreateInstance {
                name: building,
                region: self.config.region.clone(),
                stack: self.config.stack.clone(),
            }),
        )
        .await?;
        info!(id = %instance.id, "Created building instance");

        let guard = InstanceGuard::arm(Arc::clone(&self.platform), &instance.id);

        match self.mature(cancel, &email, &name, &instance).await {
            Ok(idle) => {
                guard.disarm();
                info!(name = %idle.name, "Instance is idle");
                Ok(idle)
            }
            Err(e) => {
                if e.is_cancelled() {
                    info!("Provisioning cancelled, rolling back");
                } else {
                    warn!(error = %e, "Provisioning failed, rolling back");
                }
                // Cleanup failures are logged by the guard.
                let _ = guard.release().await;
                Err(e)
            }
        }
    }

    async fn mature(
        &self,
        cancel: &CancellationToken,
        email: &str,
        name: &InstanceName,
        instance: &Instance,
    ) -> Result<Instance, ProvisionError> {
        let tags = BTreeMap::from([
            (TAG_INSTANCE_ID.to_string(), name.id.to_string()),
            (TAG_VERSION.to_string(), self.config.release_version.clone()),
            (TAG_PROVISIONED_BY.to_string(), email.to_string()),
        ]);
        until(cancel, self.platform.update_config_vars(&instance.id, &tags)).await?;

        let vars = BTreeMap::from([
            (bundle::VAR_INSTANCE_ID.to_string(), name.id.to_string()),
            (bundle::VAR_INSTANCE_NAME.to_string(), instance.name.clone()),
            (bundle::VAR_VERSION.to_string(), self.config.release_version.clone()),
            (bundle::VAR_NAME_PREFIX.to_string(), self.codec.prefix().to_string()),
        ]);
        let source = until(
            cancel,
            bundle::build_bundle_blocking(self.config.template_dir.clone(), vars),
        )
        .await?;
        debug!(files = source.files, size = source.bytes.len(), "Packed source bundle");

        let upload = until(cancel, self.platform.create_source_upload()).await?;
        until(cancel, self.platform.put_source_blob(&upload.put_url, source.bytes)).await?;

        let build = until(
            cancel,
            self.platform.create_build(
                &instance.id,
                &NewBuild {
                    source_url: upload.get_url,
                    version: self.config.release_version.clone(),
                    checksum: Some(source.checksum),
                },
            ),
        )
        .await?;
        info!(build = %build.id, "Build started");

        let released = self.wait_for_release(cancel, instance, &build).await?;
        debug!(build = %released.id, release = ?released.release, "Build released");

        until(cancel, self.platform.scale_formation(&instance.id, WEB_PROCESS, 0)).await?;

        let idle = self.codec.idle_name(name);
        let renamed = until(cancel, self.platform.rename_instance(&instance.name, &idle)).await?;
        Ok(renamed)
    }

    /// Poll the build until it fails or produces a release, streaming its
    /// log to the sink meanwhile.
    async fn wait_for_release(
        &self,
        cancel: &CancellationToken,
        instance: &Instance,
        build: &Build,
    ) -> Result<Build, ProvisionError> {
        let logs = self.stream_logs(&instance.name, build);
        tokio::pin!(logs);
        let mut logs_done = false;

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProvisionError::Cancelled),
                _ = &mut logs, if !logs_done => logs_done = true,
                _ = ticker.tick() => {
                    match until(cancel, self.platform.get_build(&instance.id, &build.id)).await {
                        Ok(current) if current.status == BuildStatus::Failed => {
                            return Err(ProvisionError::BuildFailed { build: current.id });
                        }
                        Ok(current) if current.release.is_some() => return Ok(current),
                        Ok(current) => debug!(build = %current.id, status = %current.status, "Build in progress"),
                        Err(ProvisionError::Cancelled) => return Err(ProvisionError::Cancelled),
                        Err(e) => warn!(build = %build.id, error = %e, "Failed to poll build, will retry"),
                    }
                }
            }
        }
    }

    async fn stream_logs(&self, instance: &str, build: &Build) {
        let mut output = match self.platform.build_output(build).await {
            Ok(output) => output,
            Err(e) => {
                warn!(build = %build.id, error = %e, "Failed to open build output");
                return;
            }
        };

        let mut lines = LineBuffer::default();
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(bytes) => {
                    for line in lines.push(&bytes) {
                        self.sink.line(instance, &line);
                    }
                }
                Err(e) => {
                    warn!(build = %build.id, error = %e, "Build output stream broke");
                    break;
                }
            }
        }
        if let Some(rest) = lines.finish() {
            self.sink.line(instance, &rest);
        }
    }
}

/// Await `fut` unless `cancel` fires first.
async fn until<T, E, F>(cancel: &CancellationToken, fut: F) -> Result<T, ProvisionError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ProvisionError>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProvisionError::Cancelled),
        result = fut => result.map_err(Into::into),
    }
}

/// Splits a byte stream into lines.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
        }
        lines
    }

    fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&self.pending).trim_end().to_string())
    }
}
