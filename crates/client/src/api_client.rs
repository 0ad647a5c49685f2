//! HTTP client for the billing backend's project endpoints.

use async_trait::async_trait;
use billsync_shared::{ApiError, ProjectId, ProjectView};
use reqwest::{header, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;

use crate::config::SyncConfig;

/// Anything that can produce a full project view on demand.
///
/// The poller and manual refreshes go through this seam rather than through
/// [`ApiClient`] directly.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn fetch_snapshot(&self, project_id: &ProjectId) -> Result<ProjectView, ApiError>;
}

/// HTTP client for bearer-authenticated requests to the billing backend.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    config: SyncConfig,
}

impl ApiClient {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn authorized(&self, rb: RequestBuilder) -> RequestBuilder {
        match &self.config.auth_token {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        }
    }

    /// Make an authorized GET request and decode the JSON body
    pub async fn get_json<TRes: DeserializeOwned>(&self, url: &str) -> Result<TRes, ApiError> {
        let rb = self
            .authorized(self.client.get(url))
            .header(header::ACCEPT, "application/json");

        let resp = rb.send().await.map_err(|e| ApiError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();

        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("failed to read body: {e}")))?;

        if !is_success {
            return Err(ApiError::Http { status, body: text });
        }

        serde_json::from_str(&text).map_err(|e| ApiError::Deserialize(e.to_string()))
    }

    /// Open the project's server-sent event stream.
    ///
    /// Returns the streaming response once headers arrive; the body is read
    /// incrementally by the SSE transport.
    pub async fn open_event_stream(&self, project_id: &ProjectId) -> Result<Response, ApiError> {
        let url = self.config.events_url(project_id);
        let rb = self
            .authorized(self.client.get(&url))
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache");

        let resp = rb.send().await.map_err(|e| ApiError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Http { status, body });
        }

        Ok(resp)
    }
}

#[async_trait]
impl SnapshotSource for ApiClient {
    async fn fetch_snapshot(&self, project_id: &ProjectId) -> Result<ProjectView, ApiError> {
        self.get_json(&self.config.snapshot_url(project_id)).await
    }
}
