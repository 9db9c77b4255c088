//! Warm pool manager library.
//!
//! Keeps a pool of pre-built, scaled-down instances on a remote compute
//! platform and hands them to users on request, so nobody waits through a
//! cold build.
//!
//! ## Architecture
//!
//! ```text
//! PoolReconciler ──(TaskGroup)──> N × Provisioner ──┐
//!                                                   ├──> Platform
//! POST /editor ──> Claimer ─────────────────────────┘
//! ```
//!
//! The instance name is the only persisted state: it carries the phase
//! (Building, Idle, Claimed), a random instance ID and the generation tag.
//! See `warmpool-naming` for the format.
//!
//! ## Modules
//!
//! - `platform`: platform interface, HTTP client and in-memory mock
//! - `bundle`: template rendering and source archive packing
//! - `provisioner`: creation-to-Idle pipeline with rollback
//! - `reconciler`: periodic pool refill
//! - `claimer`: claim and ownership transfer protocol
//! - `api`: claim HTTP endpoint

pub mod api;
pub mod bundle;
pub mod claimer;
pub mod config;
pub mod guard;
pub mod platform;
pub mod provisioner;
pub mod reconciler;
pub mod state;

// Re-export commonly used types
pub use claimer::{ClaimError, Claimer};
pub use config::Config;
pub use guard::InstanceGuard;
pub use platform::{HttpPlatform, MockPlatform, Platform, PlatformError};
pub use provisioner::{BuildLogSink, ProvisionError, Provisioner, ProvisionerConfig, TracingSink};
pub use reconciler::{PoolReconciler, ReconcileError, ReconcilerConfig, TickReport};
pub use state::AppState;
