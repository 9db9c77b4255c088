//! Pool reconciliation loop.
//!
//! Each tick:
//! - Lists the instances visible to the pool account
//! - Counts Idle instances of the current generation
//! - Launches up to `batch_size` provisioning runs to close the deficit
//!
//! Tick errors are logged and the next tick tries again.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use warmpool_naming::{InstanceName, Phase};
use warmpool_reconcile::{classify_by_version, FailurePolicy, PoolTarget, TaskGroup, DEFAULT_CHECK_INTERVAL};

use crate::platform::{Instance, Platform, PlatformError, OWNED_SCOPE};
use crate::provisioner::{ProvisionError, Provisioner};

/// Reconciler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Desired pool shape.
    pub target: PoolTarget,

    /// Interval between ticks.
    pub check_interval: Duration,

    /// How a tick's provisioning runs react to each other's failures.
    pub failure_policy: FailurePolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            target: PoolTarget::default(),
            check_interval: DEFAULT_CHECK_INTERVAL,
            failure_policy: FailurePolicy::default(),
        }
    }
}

/// What one tick observed and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Idle instances of the current generation.
    pub idle_current: usize,

    /// Idle instances of older generations.
    pub idle_other: usize,

    /// Provisioning runs launched.
    pub launched: u32,

    /// Runs that produced an Idle instance.
    pub succeeded: usize,

    /// Runs that failed, were cancelled or panicked.
    pub failed: usize,
}

/// Errors from a reconciliation tick.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to list instances: {0}")]
    List(#[from] PlatformError),

    #[error("{} of {} provisioning runs failed: {first}", .report.failed, .report.launched)]
    Provision {
        report: TickReport,
        #[source]
        first: ProvisionError,
    },

    #[error("a provisioning run panicked; {} of {} runs failed", .report.failed, .report.launched)]
    Panicked { report: TickReport },

    #[error("tick cancelled")]
    Cancelled,
}

impl ReconcileError {
    /// Report of the tick, when runs were launched.
    pub fn report(&self) -> Option<&TickReport> {
        match self {
            ReconcileError::Provision { report, .. } | ReconcileError::Panicked { report } => {
                Some(report)
            }
            _ => None,
        }
    }
}

/// Keeps the idle pool of the current generation at its target size.
pub struct PoolReconciler {
    platform: Arc<dyn Platform>,
    provisioner: Arc<Provisioner>,
    config: ReconcilerConfig,
}

impl PoolReconciler {
    /// Create a new reconciler.
    pub fn new(
        platform: Arc<dyn Platform>,
        provisioner: Arc<Provisioner>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            platform,
            provisioner,
            config,
        }
    }

    /// Run ticks until `shutdown` is cancelled, starting immediately.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            desired_idle = self.config.target.desired_idle,
            batch_size = self.config.target.batch_size,
            check_interval_secs = self.config.check_interval.as_secs(),
            failure_policy = %self.config.failure_policy,
            "Starting pool reconciler"
        );

        let mut interval = tokio::time::interval(self.config.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Pool reconciler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    match self.tick(&shutdown).await {
                        Ok(report) => debug!(?report, "Reconciliation tick complete"),
                        Err(e) if shutdown.is_cancelled() => {
                            info!(error = %e, "Reconciliation tick interrupted by shutdown");
                        }
                        Err(e) => error!(error = %e, "Reconciliation tick failed"),
                    }
                }
            }
        }
    }

    /// Perform one reconciliation pass.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickReport, ReconcileError> {
        let instances = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReconcileError::Cancelled),
            listed = self.platform.list_owned_instances(OWNED_SCOPE) => listed?,
        };

        let (current, other) = self.idle_inventory(&instances);
        let mut report = TickReport {
            idle_current: current.len(),
            idle_other: other.len(),
            ..TickReport::default()
        };

        let launch = self.config.target.launch_count(report.idle_current);
        if launch == 0 {
            debug!(idle = report.idle_current, "Pool is full");
            return Ok(report);
        }

        info!(
            idle = report.idle_current,
            older_idle = report.idle_other,
            deficit = self.config.target.deficit(report.idle_current),
            launch,
            "Filling pool"
        );

        let mut group = TaskGroup::new(cancel, self.config.failure_policy);
        for _ in 0..launch {
            let provisioner = Arc::clone(&self.provisioner);
            group.spawn(move |token| async move { provisioner.provision(&token).await });
        }
        report.launched = launch;

        let outcome = group.join().await;
        report.succeeded = outcome.succeeded.len();
        report.failed = outcome.failures.len() + outcome.panicked;

        if outcome.is_success() {
            info!(created = report.succeeded, "Pool filled");
            return Ok(report);
        }

        warn!(
            succeeded = report.succeeded,
            failed = report.failed,
            "Some provisioning runs did not finish"
        );
        // Siblings cancelled by a panic report Cancelled, not the cause
        if outcome.panicked_first {
            return Err(ReconcileError::Panicked { report });
        }
        match outcome.into_first_error() {
            Some(first) => Err(ReconcileError::Provision { report, first }),
            None => Err(ReconcileError::Panicked { report }),
        }
    }

    /// Decoded Idle instances, split into current and older generations.
    fn idle_inventory(&self, instances: &[Instance]) -> (Vec<InstanceName>, Vec<InstanceName>) {
        let codec = self.provisioner.codec();
        let idle = instances
            .iter()
            .filter_map(|instance| codec.decode(&instance.name))
            .filter(|name| name.phase == Phase::Idle);

        classify_by_version(idle, codec.current_version(), |name| &name.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.target.desired_idle, 5);
        assert_eq!(config.target.batch_size, 2);
        assert_eq!(config.check_interval, Duration::from_secs(60));
        assert_eq!(config.failure_policy, FailurePolicy::FailFast);
    }

    #[test]
    fn test_error_carries_report() {
        let report = TickReport {
            launched: 3,
            failed: 3,
            ..TickReport::default()
        };
        let err = ReconcileError::Provision {
            report: report.clone(),
            first: ProvisionError::BuildFailed { build: "b-1".into() },
        };

        assert_eq!(err.report(), Some(&report));
        assert_eq!(err.to_string(), "3 of 3 provisioning runs failed: build b-1 failed");
        assert!(ReconcileError::Cancelled.report().is_none());
    }
}
