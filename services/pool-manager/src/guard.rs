//! Scoped deletion of half-built instances.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::platform::{Platform, PlatformError};

/// Deletes an instance unless disarmed.
///
/// Armed once an instance exists on the platform. On the error path the
/// owner calls [`InstanceGuard::release`] and awaits the deletion; if the
/// guard is dropped while still armed (the owning future was dropped or
/// unwound) the deletion is spawned on the current runtime instead.
///
/// Deletion never observes any cancellation token: it always runs to
/// completion.
pub struct InstanceGuard {
    platform: Arc<dyn Platform>,
    instance: Option<String>,
}

impl InstanceGuard {
    /// Arm a guard for the instance with platform ID `instance_id`.
    pub fn arm(platform: Arc<dyn Platform>, instance_id: impl Into<String>) -> Self {
        Self {
            platform,
            instance: Some(instance_id.into()),
        }
    }

    /// ID of the guarded instance while armed.
    pub fn instance_id(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    /// Keep the instance.
    pub fn disarm(mut self) {
        self.instance = None;
    }

    /// Delete the instance now.
    pub async fn release(mut self) -> Result<(), PlatformError> {
        let Some(instance) = self.instance.take() else {
            return Ok(());
        };
        delete(self.platform.as_ref(), &instance).await
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        let Some(instance) = self.instance.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let platform = Arc::clone(&self.platform);
                handle.spawn(async move {
                    let _ = delete(platform.as_ref(), &instance).await;
                });
            }
            Err(_) => {
                error!(instance = %instance, "No runtime to delete abandoned instance; it must be removed by hand");
            }
        }
    }
}

async fn delete(platform: &dyn Platform, instance: &str) -> Result<(), PlatformError> {
    match platform.delete_instance(instance).await {
        Ok(()) => {
            info!(instance, "Rolled back instance");
            Ok(())
        }
        Err(e) => {
            warn!(instance, error = %e, "Failed to roll back instance");
            Err(e)
        }
    }
}
