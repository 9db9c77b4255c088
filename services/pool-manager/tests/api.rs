//! Integration tests for the claim API.
//!
//! Serves the router on an ephemeral port and talks to it over HTTP.

mod common;

use std::sync::Arc;

use reqwest::StatusCode;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use warmpool_manager::api::{create_router, CreateEditorResponse};
use warmpool_manager::platform::{Account, Operation};
use warmpool_manager::{AppState, Claimer, MockPlatform};
use warmpool_naming::Phase;

const ALICE_TOKEN: &str = "alice-token";

struct ApiFixture {
    base_url: String,
    mock: MockPlatform,
    shutdown: CancellationToken,
}

impl Drop for ApiFixture {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_api(allowed_users: &[&str]) -> ApiFixture {
    let mock = MockPlatform::new();
    mock.register_token(
        ALICE_TOKEN,
        Account {
            id: "user-alice".to_string(),
            email: Some("alice@example.com".to_string()),
        },
    );
    mock.register_token(
        "anonymous-token",
        Account {
            id: "user-anon".to_string(),
            email: None,
        },
    );

    let shutdown = CancellationToken::new();
    let state = AppState::new(
        Claimer::new(Arc::new(mock.clone()), common::codec()),
        Arc::new(mock.clone()),
        allowed_users.iter().map(|s| s.to_string()).collect(),
        shutdown.clone(),
    );
    let app = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
            .unwrap();
    });

    ApiFixture {
        base_url: format!("http://{addr}"),
        mock,
        shutdown,
    }
}

async fn post_editor(
    fixture: &ApiFixture,
    token: Option<&str>,
    body: serde_json::Value,
) -> reqwest::Response {
    let mut request = reqwest::Client::new()
        .post(format!("{}/editor", fixture.base_url))
        .json(&body);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    request.send().await.unwrap()
}

async fn error_message(response: reqwest::Response) -> String {
    let body: serde_json::Value = response.json().await.unwrap();
    body["error"].as_str().unwrap_or_default().to_string()
}

#[tokio::test]
async fn test_healthz() {
    let fixture = start_api(&[]).await;

    let response = reqwest::get(format!("{}/healthz", fixture.base_url))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "pool-manager");
}

#[tokio::test]
async fn test_claim_returns_editor_url() {
    let fixture = start_api(&[]).await;
    let seeded = fixture
        .mock
        .seed_owned(&common::pool_name(Phase::Idle, "001"));

    let response = post_editor(
        &fixture,
        Some(ALICE_TOKEN),
        serde_json::json!({ "gitRepo": "https://github.com/acme/app/tree/main" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    let body: CreateEditorResponse = response.json().await.unwrap();

    let claimed = fixture.mock.instance(&seeded.id).unwrap();
    assert_eq!(claimed.owner.email, "alice@example.com");
    assert_eq!(
        body.url,
        format!(
            "https://{}.mock.example.app/?folder=/home/dyno/project",
            claimed.name
        )
    );
    assert_eq!(
        fixture
            .mock
            .config_vars(&seeded.id)
            .unwrap()
            .get("GIT_REPO")
            .map(String::as_str),
        Some("https://github.com/acme/app")
    );
}

#[tokio::test]
async fn test_legacy_field_name_is_accepted() {
    let fixture = start_api(&[]).await;
    fixture
        .mock
        .seed_owned(&common::pool_name(Phase::Idle, "001"));

    let response = post_editor(
        &fixture,
        Some(ALICE_TOKEN),
        serde_json::json!({ "GitRepo": "https://github.com/acme/app" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let fixture = start_api(&[]).await;

    let response = post_editor(
        &fixture,
        None,
        serde_json::json!({ "gitRepo": "https://github.com/acme/app" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(fixture.mock.count(Operation::ListOwnedInstances), 0);
}

#[tokio::test]
async fn test_unknown_token_is_unauthorized() {
    let fixture = start_api(&[]).await;

    let response = post_editor(
        &fixture,
        Some("stolen-token"),
        serde_json::json!({ "gitRepo": "https://github.com/acme/app" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_account_without_email_is_unauthorized() {
    let fixture = start_api(&[]).await;

    let response = post_editor(
        &fixture,
        Some("anonymous-token"),
        serde_json::json!({ "gitRepo": "https://github.com/acme/app" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_caller_outside_allow_list_is_unauthorized() {
    let fixture = start_api(&["@acme.com"]).await;
    fixture
        .mock
        .seed_owned(&common::pool_name(Phase::Idle, "001"));

    let response = post_editor(
        &fixture,
        Some(ALICE_TOKEN),
        serde_json::json!({ "gitRepo": "https://github.com/acme/app" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(fixture.mock.count(Operation::RenameInstance), 0);
}

#[tokio::test]
async fn test_non_github_repo_is_unprocessable() {
    let fixture = start_api(&[]).await;
    fixture
        .mock
        .seed_owned(&common::pool_name(Phase::Idle, "001"));

    let response = post_editor(
        &fixture,
        Some(ALICE_TOKEN),
        serde_json::json!({ "gitRepo": "https://gitlab.com/acme/app" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(error_message(response).await.contains("GitHub"));
    assert_eq!(fixture.mock.count(Operation::RenameInstance), 0);
}

#[tokio::test]
async fn test_malformed_body_is_unprocessable() {
    let fixture = start_api(&[]).await;

    let response = post_editor(&fixture, Some(ALICE_TOKEN), serde_json::json!({ "repo": 7 })).await;

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_empty_pool_is_unprocessable() {
    let fixture = start_api(&[]).await;

    let response = post_editor(
        &fixture,
        Some(ALICE_TOKEN),
        serde_json::json!({ "gitRepo": "https://github.com/acme/app" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(error_message(response).await.contains("no idle instance"));
}
