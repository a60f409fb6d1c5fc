//! HTTP client for the remote copy service.
//!
//! The copy service runs next to the cloud account and owns all of the
//! image mechanics: snapshotting the source instance into a machine image,
//! relaunching a new instance from it, and tearing it down again.
//!
//! The broker only relays: it starts copies, polls their state, fetches
//! connection credentials and deletes them.
//!
//! API: POST /copies, GET /copies/{id}, GET /copies/{id}/credentials,
//! DELETE /copies/{id}, GET /health

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::ProviderError;
use super::provider::CopyProvider;
use super::Credentials;

// ── Request / Response types ────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CopyCreateRequest {
    pub source_instance_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteCopyState {
    /// Image is being created or the copy is booting.
    Pending,
    Running,
    Failed,
    Terminated,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CopyResponse {
    pub copy_id: String,
    pub source_instance_id: String,
    pub state: RemoteCopyState,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_copies: u32,
}

// ── Client ──────────────────────────────────────────────────────────

/// HTTP client for the copy service REST API.
#[derive(Debug, Clone)]
pub struct CopyServiceClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl CopyServiceClient {
    pub fn new(base_url: String, api_key: Option<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            base_url,
            api_key,
            client,
        }
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    /// Check copy service health.
    pub async fn health(&self) -> Result<HealthResponse, ProviderError> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ProviderError::Backend(format!("copy service health check failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Backend(format!(
                "copy service health check returned {status}: {body}"
            )));
        }

        resp.json::<HealthResponse>()
            .await
            .map_err(|e| ProviderError::Serde(format!("failed to parse health response: {e}")))
    }

    /// Start a new copy.
    pub async fn create_copy(&self, req: &CopyCreateRequest) -> Result<CopyResponse, ProviderError> {
        let url = format!("{}/copies", self.base_url);

        tracing::info!(
            source_instance_id = %req.source_instance_id,
            "starting copy via copy service"
        );

        let resp = self
            .authorized(self.client.post(&url))
            .json(req)
            .send()
            .await
            .map_err(|e| ProviderError::Begin(format!("copy service create failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Begin(format!(
                "copy service create returned {status}: {body}"
            )));
        }

        let copy = resp
            .json::<CopyResponse>()
            .await
            .map_err(|e| ProviderError::Serde(format!("failed to parse copy response: {e}")))?;

        tracing::info!(
            copy_id = %copy.copy_id,
            source_instance_id = %copy.source_instance_id,
            state = ?copy.state,
            "copy started"
        );

        Ok(copy)
    }

    /// Get a specific copy by id.
    pub async fn get_copy(&self, copy_id: &str) -> Result<CopyResponse, ProviderError> {
        let url = format!("{}/copies/{}", self.base_url, copy_id);
        let resp = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ProviderError::Backend(format!("copy service get_copy failed: {e}")))?;

        if resp.status().as_u16() == 404 {
            return Err(ProviderError::NotFound(format!("copy {copy_id} not found")));
        }

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Backend(format!(
                "copy service get_copy returned {status}: {body}"
            )));
        }

        resp.json::<CopyResponse>()
            .await
            .map_err(|e| ProviderError::Serde(format!("failed to parse copy response: {e}")))
    }

    /// Fetch connection credentials for a copy.
    pub async fn get_credentials(&self, copy_id: &str) -> Result<Credentials, ProviderError> {
        let url = format!("{}/copies/{}/credentials", self.base_url, copy_id);
        let resp = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ProviderError::Credentials(format!("copy service credentials failed: {e}")))?;

        if resp.status().as_u16() == 404 {
            return Err(ProviderError::NotFound(format!("copy {copy_id} not found")));
        }

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Credentials(format!(
                "copy service credentials returned {status}: {body}"
            )));
        }

        resp.json::<Credentials>()
            .await
            .map_err(|e| ProviderError::Serde(format!("failed to parse credentials: {e}")))
    }

    /// Delete a copy.
    pub async fn delete_copy(&self, copy_id: &str) -> Result<(), ProviderError> {
        let url = format!("{}/copies/{}", self.base_url, copy_id);

        tracing::info!(copy_id = %copy_id, "deleting copy via copy service");

        let resp = self
            .authorized(self.client.delete(&url))
            .send()
            .await
            .map_err(|e| ProviderError::Delete(format!("copy service delete failed: {e}")))?;

        if resp.status().as_u16() == 404 {
            tracing::warn!(copy_id = %copy_id, "copy already deleted");
            return Ok(());
        }

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Delete(format!(
                "copy service delete returned {status}: {body}"
            )));
        }

        tracing::info!(copy_id = %copy_id, "copy deleted");
        Ok(())
    }
}

// ── Provider ────────────────────────────────────────────────────────

/// `CopyProvider` backed by the remote copy service.
pub struct RemoteCopyProvider {
    client: CopyServiceClient,
}

impl RemoteCopyProvider {
    pub fn new(client: CopyServiceClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CopyProvider for RemoteCopyProvider {
    fn kind(&self) -> &'static str {
        "remote"
    }

    async fn begin_copy(&self, source_instance_id: &str) -> Result<String, ProviderError> {
        let req = CopyCreateRequest {
            source_instance_id: source_instance_id.to_string(),
        };
        let copy = self.client.create_copy(&req).await?;
        Ok(copy.copy_id)
    }

    async fn is_ready(&self, copy_id: &str) -> Result<bool, ProviderError> {
        let copy = self.client.get_copy(copy_id).await?;
        match copy.state {
            RemoteCopyState::Pending => Ok(false),
            RemoteCopyState::Running => Ok(true),
            RemoteCopyState::Failed | RemoteCopyState::Terminated => {
                Err(ProviderError::CopyFailed(copy.reason.unwrap_or_else(|| {
                    format!("copy {copy_id} entered state {:?}", copy.state)
                })))
            }
        }
    }

    async fn get_creds(&self, copy_id: &str) -> Result<Credentials, ProviderError> {
        self.client.get_credentials(copy_id).await
    }

    async fn delete_copy(&self, copy_id: &str) -> Result<(), ProviderError> {
        self.client.delete_copy(copy_id).await
    }
}

// ── Tests ───────────────────────────────────────────────────────────
