//! Editor claim endpoint.
//!
//! `POST /editor` claims an idle instance for the caller and returns the
//! editor URL. The caller is identified by the platform account behind
//! their bearer token.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::error::ApiError;
use crate::state::AppState;

/// Request body.
#[derive(Debug, Deserialize, Serialize)]
pub struct CreateEditorRequest {
    #[serde(rename = "gitRepo", alias = "GitRepo")]
    pub git_repo: String,
}

/// Response body.
#[derive(Debug, Deserialize, Serialize)]
pub struct CreateEditorResponse {
    pub url: String,
}

/// Create editor routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/editor", post(create_editor))
}

async fn create_editor(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CreateEditorRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateEditorResponse>), ApiError> {
    let token = bearer_token(&headers).ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;

    let account = state.resolver().resolve(token).await.map_err(|e| {
        warn!(error = %e, "Failed to resolve caller");
        ApiError::unauthorized("invalid credentials")
    })?;
    let email = account
        .verified_email()
        .ok_or_else(|| ApiError::unauthorized("account has no verified email"))?
        .to_string();
    if !state.is_allowed(&email) {
        warn!(email = %email, "Caller is not on the allow-list");
        return Err(ApiError::unauthorized("user is not allowed"));
    }

    let Json(request) = body.map_err(|rejection| ApiError::unprocessable(rejection.body_text()))?;
    let repo = parse_github_repo(&request.git_repo)
        .ok_or_else(|| ApiError::unprocessable("please provide a GitHub repository URL"))?;

    let claimer = state.claimer();
    let instance = claimer
        .claim(&state.claim_token(), None, &email, &repo)
        .await
        .map_err(|e| {
            warn!(email = %email, error = %e, "Claim failed");
            ApiError::unprocessable(e.to_string())
        })?;
    let url = claimer
        .instance_url(&instance)
        .await
        .map_err(|e| ApiError::unprocessable(e.to_string()))?;

    info!(email = %email, instance = %instance.name, "Editor claimed");
    Ok((StatusCode::CREATED, Json(CreateEditorResponse { url })))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then_some(token)
}

/// Normalize a GitHub repository URL to `https://github.com/<owner>/<repo>`.
pub fn parse_github_repo(raw: &str) -> Option<String> {
    let rest = raw.trim().strip_prefix("https://github.com/")?;
    let path = rest.split(['?', '#']).next().unwrap_or_default();

    let mut segments = path.split('/').filter(|s| !s.is_empty() && *s != ".");
    let owner = segments.next()?;
    let repo = segments.next()?;
    if owner == ".." || repo == ".." {
        return None;
    }

    Some(format!("https://github.com/{owner}/{repo}"))
}
