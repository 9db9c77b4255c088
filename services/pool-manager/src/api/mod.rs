//! Claim HTTP API.

mod editor;
pub mod error;
mod health;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use editor::{parse_github_repo, CreateEditorRequest, CreateEditorResponse};

/// Create the API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(editor::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
