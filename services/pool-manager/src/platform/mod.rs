//! Remote compute platform interface.
//!
//! The pool manager never keeps local state: every effect lands on the
//! platform through this interface. Two implementations are provided:
//!
//! - [`HttpPlatform`]: Heroku-compatible Platform API v3 client
//! - [`MockPlatform`]: in-memory platform for tests and development

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod http;
mod mock;

pub use http::HttpPlatform;
pub use mock::{BuildScript, Call, MockPlatform, Operation};

/// Listing scope for instances owned by or shared with the caller.
pub const OWNED_SCOPE: &str = "~";

/// Primary process type of an instance.
pub const WEB_PROCESS: &str = "web";

/// Errors from platform operations.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("already a collaborator: {0}")]
    AlreadyCollaborator(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("platform rejected request ({status} {id}): {message}")]
    Api {
        status: u16,
        id: String,
        message: String,
    },

    #[error("source upload failed with status {status}: {body}")]
    Upload { status: u16, body: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PlatformError {
    /// Returns true if the target no longer matched the request, either
    /// because it is gone or because it changed underneath us.
    pub fn is_stale_target(&self) -> bool {
        matches!(self, PlatformError::NotFound(_) | PlatformError::Conflict(_))
    }
}

/// Account reference attached to instances and transfers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub id: String,
    pub email: String,
}

impl Owner {
    /// Returns true if `who` names this owner by email or account ID.
    pub fn matches(&self, who: &str) -> bool {
        self.email == who || self.id == who
    }
}

/// The account a platform credential belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl Account {
    /// The account email, if it is present and non-blank.
    pub fn verified_email(&self) -> Option<&str> {
        self.email.as_deref().filter(|e| !e.trim().is_empty())
    }
}

/// A remote compute unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Platform-assigned identifier.
    pub id: String,

    /// Mutable name; carries the pool phase.
    pub name: String,

    /// Owning account.
    pub owner: Owner,

    /// Region the instance runs in.
    pub region: String,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Parameters for creating an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateInstance {
    pub name: String,
    pub region: String,
    pub stack: String,
}

/// Process formation after scaling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formation {
    pub process_type: String,
    pub quantity: u32,
}

/// Signed URLs for uploading and fetching a source blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUpload {
    pub put_url: String,
    pub get_url: String,
}

/// Parameters for creating a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBuild {
    /// Where the platform fetches the source blob.
    pub source_url: String,

    /// Version label recorded with the build.
    pub version: String,

    /// `SHA256:<hex>` checksum of the blob.
    pub checksum: Option<String>,
}

/// Build status as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Succeeded,
    Failed,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStatus::Pending => write!(f, "pending"),
            BuildStatus::Succeeded => write!(f, "succeeded"),
            BuildStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A build of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Build {
    pub id: String,
    pub instance_id: String,
    pub status: BuildStatus,

    /// Release produced by the build, once available.
    pub release: Option<String>,

    /// Streaming endpoint for the build log.
    pub output_stream_url: Option<String>,
}

/// Pending ownership transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub id: String,
    pub owner: Owner,
    pub recipient: Owner,
}

/// Hostname routed to an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    pub id: String,
    pub hostname: String,
}

/// Raw build log bytes.
pub type BuildOutput = BoxStream<'static, Result<Bytes, PlatformError>>;

/// Remote compute platform.
///
/// Every call may fail with a transport or platform-rejection error.
/// Instances may be addressed by platform ID or by current name.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Account the platform credential belongs to.
    async fn get_account(&self) -> Result<Account, PlatformError>;

    async fn create_instance(&self, spec: &CreateInstance) -> Result<Instance, PlatformError>;

    async fn get_instance(&self, instance: &str) -> Result<Instance, PlatformError>;

    async fn delete_instance(&self, instance: &str) -> Result<(), PlatformError>;

    /// Rename an instance addressed by its current name.
    ///
    /// Fails with `NotFound` or `Conflict` when no instance carries
    /// `current_name` any more, which makes the rename a compare-and-swap on
    /// the name.
    async fn rename_instance(
        &self,
        current_name: &str,
        new_name: &str,
    ) -> Result<Instance, PlatformError>;

    async fn update_config_vars(
        &self,
        instance: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<(), PlatformError>;

    async fn scale_formation(
        &self,
        instance: &str,
        process_type: &str,
        quantity: u32,
    ) -> Result<Formation, PlatformError>;

    async fn create_source_upload(&self) -> Result<SourceUpload, PlatformError>;

    /// Upload a source blob to a URL from [`Platform::create_source_upload`].
    async fn put_source_blob(&self, put_url: &str, blob: Bytes) -> Result<(), PlatformError>;

    async fn create_build(&self, instance: &str, build: &NewBuild) -> Result<Build, PlatformError>;

    async fn get_build(&self, instance: &str, build_id: &str) -> Result<Build, PlatformError>;

    /// Open the build log stream.
    async fn build_output(&self, build: &Build) -> Result<BuildOutput, PlatformError>;

    /// Instances visible in `scope`, in platform listing order.
    async fn list_owned_instances(&self, scope: &str) -> Result<Vec<Instance>, PlatformError>;

    async fn add_collaborator(
        &self,
        instance: &str,
        user: &str,
        silent: bool,
    ) -> Result<(), PlatformError>;

    async fn remove_collaborator(&self, instance: &str, user: &str) -> Result<(), PlatformError>;

    async fn create_transfer(
        &self,
        instance: &str,
        recipient: &str,
        silent: bool,
    ) -> Result<Transfer, PlatformError>;

    async fn accept_transfer(&self, transfer_id: &str) -> Result<(), PlatformError>;

    async fn list_domains(&self, instance: &str) -> Result<Vec<Domain>, PlatformError>;
}

/// Resolves a caller's bearer token to the account behind it.
#[async_trait]
pub trait AccountResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<Account, PlatformError>;
}
