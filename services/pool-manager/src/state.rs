//! Application state shared across request handlers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::claimer::Claimer;
use crate::platform::AccountResolver;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    claimer: Claimer,
    resolver: Arc<dyn AccountResolver>,
    allowed_users: Vec<String>,
    shutdown: CancellationToken,
}

impl AppState {
    /// Create a new application state.
    pub fn new(
        claimer: Claimer,
        resolver: Arc<dyn AccountResolver>,
        allowed_users: Vec<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                claimer,
                resolver,
                allowed_users,
                shutdown,
            }),
        }
    }

    /// The claimer behind `POST /editor`.
    pub fn claimer(&self) -> &Claimer {
        &self.inner.claimer
    }

    /// Resolves caller tokens to accounts.
    pub fn resolver(&self) -> &dyn AccountResolver {
        self.inner.resolver.as_ref()
    }

    /// Returns true if `email` may claim instances.
    ///
    /// An empty allow-list admits everyone; otherwise the email must contain
    /// one of the entries.
    pub fn is_allowed(&self, email: &str) -> bool {
        self.inner.allowed_users.is_empty()
            || self
                .inner
                .allowed_users
                .iter()
                .any(|entry| email.contains(entry.as_str()))
    }

    /// Token for a claim started by a request; cancelled on shutdown.
    pub fn claim_token(&self) -> CancellationToken {
        self.inner.shutdown.child_token()
    }
}
