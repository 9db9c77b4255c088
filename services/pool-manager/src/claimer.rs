//! Claim protocol.
//!
//! Hands one pooled instance to a recipient:
//!
//! 1. Select an explicit instance, or the first Idle one in listing order
//!    (current generation first, older generations as salvage)
//! 2. Rename Idle to Claimed; the rename addresses the Idle name, so a
//!    concurrent claim of the same instance loses with [`ClaimError::Contended`]
//! 3. Set `GIT_REPO` and scale `web` to 1
//! 4. Transfer ownership unless the recipient already owns the instance
//!
//! Failures after step 2 delete the instance. An explicitly requested
//! instance that is already Claimed is only reconfigured, and only for its
//! current owner.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use warmpool_naming::{InstanceName, NameCodec, Phase};
use warmpool_reconcile::classify_by_version;

use crate::guard::InstanceGuard;
use crate::platform::{Instance, Platform, PlatformError, Transfer, OWNED_SCOPE, WEB_PROCESS};

/// Config var holding the repository the recipient works on.
pub const GIT_REPO_VAR: &str = "GIT_REPO";

/// Folder the editor opens.
pub const EDITOR_FOLDER: &str = "/home/dyno/project";

/// Errors from a claim.
#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("no idle instance is available")]
    PoolEmpty,

    #[error("instance {0} is not claimable")]
    NotClaimable(String),

    #[error("instance {0} was claimed concurrently")]
    Contended(String),

    #[error("instance {0} has no domain")]
    NoDomain(String),

    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("claim cancelled")]
    Cancelled,
}

impl ClaimError {
    /// Returns true if the claim stopped because its token was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClaimError::Cancelled)
    }
}

/// Assigns pooled instances to users.
pub struct Claimer {
    platform: Arc<dyn Platform>,
    codec: NameCodec,
}

impl Claimer {
    /// Create a new claimer.
    pub fn new(platform: Arc<dyn Platform>, codec: NameCodec) -> Self {
        Self { platform, codec }
    }

    /// Claim an instance for `recipient` and point it at `repo`.
    ///
    /// `recipient` is an account email or ID. Returns the claimed instance
    /// owned by the recipient.
    #[instrument(skip(self, cancel))]
    pub async fn claim(
        &self,
        cancel: &CancellationToken,
        instance_id: Option<&str>,
        recipient: &str,
        repo: &str,
    ) -> Result<Instance, ClaimError> {
        let (selected, name) = self.select(cancel, instance_id).await?;

        if !name.phase.can_advance_to(Phase::Claimed) {
            // Already claimed: only its owner may reopen it
            if !selected.owner.matches(recipient) {
                return Err(ClaimError::NotClaimable(selected.name));
            }
            self.configure(cancel, &selected, repo).await?;
            info!(instance = %selected.name, "Reopened claimed instance");
            return Ok(selected);
        }

        let claimed = self.codec.claimed_name(&name);
        let instance =
            match until(cancel, self.platform.rename_instance(&selected.name, &claimed)).await {
                Ok(renamed) => renamed,
                Err(ClaimError::Platform(e)) if e.is_stale_target() => {
                    warn!(instance = %selected.name, error = %e, "Lost claim race");
                    return Err(ClaimError::Contended(selected.name));
                }
                Err(e) => return Err(e),
            };
        info!(instance = %instance.name, "Marked instance claimed");

        let guard = InstanceGuard::arm(Arc::clone(&self.platform), &instance.id);

        let transfer = match self.hand_over(cancel, &instance, recipient, repo).await {
            Ok(transfer) => transfer,
            Err(e) => {
                warn!(instance = %instance.name, error = %e, "Claim failed, rolling back");
                // Cleanup failures are logged by the guard.
                let _ = guard.release().await;
                return Err(e);
            }
        };
        guard.disarm();

        let Some(transfer) = transfer else {
            info!(instance = %instance.name, "Recipient already owns instance");
            return Ok(instance);
        };

        // Ownership has moved; a cancellation here leaves the previous
        // owner as a collaborator.
        match until(
            cancel,
            self.platform.remove_collaborator(&instance.id, &transfer.owner.id),
        )
        .await
        {
            Ok(()) => {}
            Err(ClaimError::Cancelled) => {
                warn!(instance = %instance.name, "Claim cancelled before removing previous owner");
                return Err(ClaimError::Cancelled);
            }
            Err(e) => {
                warn!(
                    instance = %instance.name,
                    owner = %transfer.owner.email,
                    error = %e,
                    "Failed to remove previous owner"
                );
            }
        }

        info!(instance = %instance.name, "Instance claimed");
        Ok(Instance {
            owner: transfer.recipient,
            ..instance
        })
    }

    /// Editor URL of a claimed instance.
    pub async fn instance_url(&self, instance: &Instance) -> Result<String, ClaimError> {
        let domains = self.platform.list_domains(&instance.id).await?;
        let domain = domains
            .first()
            .ok_or_else(|| ClaimError::NoDomain(instance.name.clone()))?;
        Ok(format!("https://{}/?folder={}", domain.hostname, EDITOR_FOLDER))
    }

    async fn select(
        &self,
        cancel: &CancellationToken,
        instance_id: Option<&str>,
    ) -> Result<(Instance, InstanceName), ClaimError> {
        if let Some(id) = instance_id {
            let instance = until(cancel, self.platform.get_instance(id)).await?;
            return match self.codec.decode(&instance.name) {
                Some(name) if name.phase != Phase::Building => Ok((instance, name)),
                _ => Err(ClaimError::NotClaimable(instance.name)),
            };
        }

        let instances = until(cancel, self.platform.list_owned_instances(OWNED_SCOPE)).await?;
        let idle: Vec<(Instance, InstanceName)> = instances
            .into_iter()
            .filter_map(|instance| {
                let name = self.codec.decode(&instance.name)?;
                (name.phase == Phase::Idle).then_some((instance, name))
            })
            .collect();

        let (current, older) =
            classify_by_version(idle, self.codec.current_version(), |(_, name)| &name.version);
        if current.is_empty() && !older.is_empty() {
            debug!(older = older.len(), "Salvaging an older generation instance");
        }

        current
            .into_iter()
            .chain(older)
            .next()
            .ok_or(ClaimError::PoolEmpty)
    }

    /// Point the instance at `repo` and start its web process.
    async fn configure(
        &self,
        cancel: &CancellationToken,
        instance: &Instance,
        repo: &str,
    ) -> Result<(), ClaimError> {
        let vars = BTreeMap::from([(GIT_REPO_VAR.to_string(), repo.to_string())]);
        until(cancel, self.platform.update_config_vars(&instance.id, &vars)).await?;
        until(cancel, self.platform.scale_formation(&instance.id, WEB_PROCESS, 1)).await?;
        Ok(())
    }

    /// Configure, wake and transfer the instance. Returns the accepted
    /// transfer, or `None` when the recipient already owns the instance.
    async fn hand_over(
        &self,
        cancel: &CancellationToken,
        instance: &Instance,
        recipient: &str,
        repo: &str,
    ) -> Result<Option<Transfer>, ClaimError> {
        self.configure(cancel, instance, repo).await?;

        if instance.owner.matches(recipient) {
            return Ok(None);
        }

        match until(cancel, self.platform.add_collaborator(&instance.id, recipient, true)).await {
            Ok(()) => {}
            Err(ClaimError::Platform(PlatformError::AlreadyCollaborator(_))) => {
                debug!(recipient, "Recipient is already a collaborator");
            }
            Err(e) => return Err(e),
        }

        let transfer = until(cancel, self.platform.create_transfer(&instance.id, recipient, true)).await?;
        until(cancel, self.platform.accept_transfer(&transfer.id)).await?;
        debug!(transfer = %transfer.id, "Transfer accepted");

        Ok(Some(transfer))
    }
}

/// Await `fut` unless `cancel` fires first.
async fn until<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, ClaimError>
where
    F: Future<Output = Result<T, PlatformError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ClaimError::Cancelled),
        result = fut => result.map_err(ClaimError::from),
    }
}
