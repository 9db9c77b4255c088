//! Platform API v3 client.
//!
//! Talks to a Heroku-compatible Platform API. Instances are apps, source
//! uploads are source blobs and ownership moves through app transfers.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, RANGE};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    Account, AccountResolver, Build, BuildOutput, BuildStatus, CreateInstance, Domain, Formation,
    Instance, NewBuild, Owner, Platform, PlatformError, SourceUpload, Transfer,
};

/// Media type selecting API version 3.
pub const API_ACCEPT: &str = "application/vnd.heroku+json; version=3";

/// Largest page the API serves for list endpoints.
const PAGE_SIZE: u32 = 1000;

const NEXT_RANGE: &str = "Next-Range";

/// HTTP implementation of [`Platform`].
#[derive(Clone)]
pub struct HttpPlatform {
    client: reqwest::Client,
    uploader: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpPlatform {
    /// Create a client for the API at `base_url` authenticating with `api_key`.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, PlatformError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(PlatformError::Config("API key cannot be empty".to_string()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(API_ACCEPT));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()?;

        // Signed blob URLs reject extra auth headers.
        let uploader = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;

        Ok(Self {
            client,
            uploader,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Base URL of the API.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.client.request(method, url).bearer_auth(&self.api_key)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, PlatformError> {
        let response = handle_response(request.send().await?).await?;
        Ok(response.json().await?)
    }

    async fn send_empty(&self, request: RequestBuilder) -> Result<(), PlatformError> {
        handle_response(request.send().await?).await?;
        Ok(())
    }

    /// Fetch every page of a ranged list endpoint.
    async fn list_all<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, PlatformError> {
        let mut items = Vec::new();
        let mut range = format!("name ..; max={PAGE_SIZE}");

        loop {
            let response = self
                .request(Method::GET, path)
                .header(RANGE, &range)
                .send()
                .await?;
            let response = handle_response(response).await?;

            let next = if response.status() == StatusCode::PARTIAL_CONTENT {
                response
                    .headers()
                    .get(NEXT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            } else {
                None
            };

            let page: Vec<T> = response.json().await?;
            debug!(path, count = page.len(), "Fetched list page");
            items.extend(page);

            match next {
                Some(next) => range = next,
                None => break,
            }
        }

        Ok(items)
    }
}

/// Map a non-success response to a [`PlatformError`].
async fn handle_response(response: Response) -> Result<Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let (id, message) = match serde_json::from_str::<ErrorBody>(&body) {
        Ok(err) => (err.id, err.message),
        Err(_) => ("unknown".to_string(), body),
    };

    if message.to_ascii_lowercase().contains("already a collaborator") {
        return Err(PlatformError::AlreadyCollaborator(message));
    }

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PlatformError::Unauthorized(message),
        StatusCode::NOT_FOUND => PlatformError::NotFound(message),
        StatusCode::CONFLICT => PlatformError::Conflict(message),
        _ => PlatformError::Api {
            status: status.as_u16(),
            id,
            message,
        },
    })
}

#[async_trait]
impl Platform for HttpPlatform {
    async fn get_account(&self) -> Result<Account, PlatformError> {
        self.send_json(self.request(Method::GET, "/account")).await
    }

    async fn create_instance(&self, spec: &CreateInstance) -> Result<Instance, PlatformError> {
        let body = CreateAppRequest {
            name: &spec.name,
            region: &spec.region,
            stack: &spec.stack,
        };
        let app: AppRecord = self
            .send_json(self.request(Method::POST, "/apps").json(&body))
            .await?;
        Ok(app.into())
    }

    async fn get_instance(&self, instance: &str) -> Result<Instance, PlatformError> {
        let app: AppRecord = self
            .send_json(self.request(Method::GET, &format!("/apps/{instance}")))
            .await?;
        Ok(app.into())
    }

    async fn delete_instance(&self, instance: &str) -> Result<(), PlatformError> {
        self.send_empty(self.request(Method::DELETE, &format!("/apps/{instance}")))
            .await
    }

    async fn rename_instance(
        &self,
        current_name: &str,
        new_name: &str,
    ) -> Result<Instance, PlatformError> {
        let body = RenameAppRequest { name: new_name };
        let app: AppRecord = self
            .send_json(
                self.request(Method::PATCH, &format!("/apps/{current_name}"))
                    .json(&body),
            )
            .await?;
        Ok(app.into())
    }

    async fn update_config_vars(
        &self,
        instance: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<(), PlatformError> {
        self.send_empty(
            self.request(Method::PATCH, &format!("/apps/{instance}/config-vars"))
                .json(vars),
        )
        .await
    }

    async fn scale_formation(
        &self,
        instance: &str,
        process_type: &str,
        quantity: u32,
    ) -> Result<Formation, PlatformError> {
        let record: FormationRecord = self
            .send_json(
                self.request(
                    Method::PATCH,
                    &format!("/apps/{instance}/formation/{process_type}"),
                )
                .json(&ScaleRequest { quantity }),
            )
            .await?;
        Ok(Formation {
            process_type: record.process_type,
            quantity: record.quantity,
        })
    }

    async fn create_source_upload(&self) -> Result<SourceUpload, PlatformError> {
        let record: SourceRecord = self
            .send_json(self.request(Method::POST, "/sources"))
            .await?;
        Ok(SourceUpload {
            put_url: record.source_blob.put_url,
            get_url: record.source_blob.get_url,
        })
    }

    async fn put_source_blob(&self, put_url: &str, blob: Bytes) -> Result<(), PlatformError> {
        let size = blob.len();
        let response = self.uploader.put(put_url).body(blob).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PlatformError::Upload {
                status: status.as_u16(),
                body,
            });
        }

        debug!(size, "Uploaded source blob");
        Ok(())
    }

    async fn create_build(&self, instance: &str, build: &NewBuild) -> Result<Build, PlatformError> {
        let body = CreateBuildRequest {
            source_blob: SourceBlobRef {
                url: &build.source_url,
                version: &build.version,
                checksum: build.checksum.as_deref(),
            },
        };
        let record: BuildRecord = self
            .send_json(
                self.request(Method::POST, &format!("/apps/{instance}/builds"))
                    .json(&body),
            )
            .await?;
        Ok(record.into())
    }

    async fn get_build(&self, instance: &str, build_id: &str) -> Result<Build, PlatformError> {
        let record: BuildRecord = self
            .send_json(self.request(Method::GET, &format!("/apps/{instance}/builds/{build_id}")))
            .await?;
        Ok(record.into())
    }

    async fn build_output(&self, build: &Build) -> Result<BuildOutput, PlatformError> {
        let Some(url) = build.output_stream_url.as_deref() else {
            warn!(build = %build.id, "Build has no output stream");
            return Ok(futures_util::stream::empty().boxed());
        };

        let response = self.uploader.get(url).send().await?;
        let response = handle_response(response).await?;

        Ok(response.bytes_stream().map_err(PlatformError::from).boxed())
    }

    async fn list_owned_instances(&self, scope: &str) -> Result<Vec<Instance>, PlatformError> {
        let apps: Vec<AppRecord> = self.list_all(&format!("/users/{scope}/apps")).await?;
        Ok(apps.into_iter().map(Instance::from).collect())
    }

    async fn add_collaborator(
        &self,
        instance: &str,
        user: &str,
        silent: bool,
    ) -> Result<(), PlatformError> {
        self.send_empty(
            self.request(Method::POST, &format!("/apps/{instance}/collaborators"))
                .json(&CollaboratorRequest { user, silent }),
        )
        .await
    }

    async fn remove_collaborator(&self, instance: &str, user: &str) -> Result<(), PlatformError> {
        self.send_empty(self.request(
            Method::DELETE,
            &format!("/apps/{instance}/collaborators/{user}"),
        ))
        .await
    }

    async fn create_transfer(
        &self,
        instance: &str,
        recipient: &str,
        silent: bool,
    ) -> Result<Transfer, PlatformError> {
        let body = TransferRequest {
            app: instance,
            recipient,
            silent,
        };
        let record: TransferRecord = self
            .send_json(
                self.request(Method::POST, "/account/app-transfers")
                    .json(&body),
            )
            .await?;
        Ok(Transfer {
            id: record.id,
            owner: record.owner.into(),
            recipient: record.recipient.into(),
        })
    }

    async fn accept_transfer(&self, transfer_id: &str) -> Result<(), PlatformError> {
        self.send_empty(
            self.request(
                Method::PATCH,
                &format!("/account/app-transfers/{transfer_id}"),
            )
            .json(&TransferStateRequest { state: "accepted" }),
        )
        .await
    }

    async fn list_domains(&self, instance: &str) -> Result<Vec<Domain>, PlatformError> {
        let records: Vec<DomainRecord> = self
            .send_json(self.request(Method::GET, &format!("/apps/{instance}/domains")))
            .await?;
        Ok(records
            .into_iter()
            .map(|d| Domain {
                id: d.id,
                hostname: d.hostname,
            })
            .collect())
    }
}

#[async_trait]
impl AccountResolver for HttpPlatform {
    async fn resolve(&self, token: &str) -> Result<Account, PlatformError> {
        let url = format!("{}/account", self.base_url);
        self.send_json(self.client.get(url).bearer_auth(token)).await
    }
}

// Wire records

#[derive(Debug, Deserialize)]
struct ErrorBody {
    id: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct OwnerRecord {
    id: String,
    #[serde(default)]
    email: String,
}

impl From<OwnerRecord> for Owner {
    fn from(r: OwnerRecord) -> Self {
        Owner {
            id: r.id,
            email: r.email,
        }
    }
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct IdRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct AppRecord {
    id: String,
    name: String,
    owner: OwnerRecord,
    region: NamedRef,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl From<AppRecord> for Instance {
    fn from(r: AppRecord) -> Self {
        Instance {
            id: r.id,
            name: r.name,
            owner: r.owner.into(),
            region: r.region.name,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateAppRequest<'a> {
    name: &'a str,
    region: &'a str,
    stack: &'a str,
}

#[derive(Debug, Serialize)]
struct RenameAppRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct ScaleRequest {
    quantity: u32,
}

#[derive(Debug, Deserialize)]
struct FormationRecord {
    #[serde(rename = "type")]
    process_type: String,
    quantity: u32,
}

#[derive(Debug, Deserialize)]
struct SourceRecord {
    source_blob: SourceBlobUrls,
}

#[derive(Debug, Deserialize)]
struct SourceBlobUrls {
    get_url: String,
    put_url: String,
}

#[derive(Debug, Serialize)]
struct CreateBuildRequest<'a> {
    source_blob: SourceBlobRef<'a>,
}

#[derive(Debug, Serialize)]
struct SourceBlobRef<'a> {
    url: &'a str,
    version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    checksum: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct BuildRecord {
    id: String,
    app: IdRef,
    status: BuildStatus,
    #[serde(default)]
    release: Option<IdRef>,
    #[serde(default)]
    output_stream_url: Option<String>,
}

impl From<BuildRecord> for Build {
    fn from(r: BuildRecord) -> Self {
        Build {
            id: r.id,
            instance_id: r.app.id,
            status: r.status,
            release: r.release.map(|rel| rel.id),
            output_stream_url: r.output_stream_url,
        }
    }
}

#[derive(Debug, Serialize)]
struct CollaboratorRequest<'a> {
    user: &'a str,
    silent: bool,
}

#[derive(Debug, Serialize)]
struct TransferRequest<'a> {
    app: &'a str,
    recipient: &'a str,
    silent: bool,
}

#[derive(Debug, Deserialize)]
struct TransferRecord {
    id: String,
    owner: OwnerRecord,
    recipient: OwnerRecord,
}

#[derive(Debug, Serialize)]
struct TransferStateRequest {
    state: &'static str,
}

#[derive(Debug, Deserialize)]
struct DomainRecord {
    id: String,
    hostname: String,
}
