// SPDX-License-Identifier: MIT
//! Stateless HTTP surface towards the ingest service and object store.
//!
//! Exactly three operations: presign a blob upload, ingest an event batch,
//! and PUT bytes to a presigned URL. Non-2xx responses are surfaced as
//! errors; retry policy belongs to the callers, not this layer.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::event::{Event, Metadata};

/// Request timeout applied to every call.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// `POST /api/v1/presign` request body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignRequest {
    pub data_id: String,
    pub trace_id: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// `POST /api/v1/presign` response body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignResponse {
    pub presigned_url: String,
    #[serde(default)]
    pub data_path: Option<String>,
}

/// The transport seam the upload pipelines talk through.
///
/// Production uses [`IngestClient`]; tests and custom transports provide
/// their own implementation via [`crate::Xray::init_with_ingest`].
#[async_trait]
pub trait IngestApi: Send + Sync {
    /// Obtain a short-lived capability URL for a direct object-store PUT.
    async fn presign(&self, request: &PresignRequest) -> Result<PresignResponse>;

    /// Deliver a batch of events.
    async fn ingest(&self, events: &[Event]) -> Result<()>;

    /// PUT serialized bytes to a presigned URL.
    async fn put_object(&self, url: &str, bytes: Vec<u8>) -> Result<()>;
}

/// reqwest-backed implementation of [`IngestApi`].
pub struct IngestClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl IngestClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build HTTP client")?;
        let base_url = base_url.into();
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl IngestApi for IngestClient {
    async fn presign(&self, request: &PresignRequest) -> Result<PresignResponse> {
        let url = format!("{}/api/v1/presign", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .json(request)
            .send()
            .await
            .context("presign request")?;
        let status = response.status();
        if !status.is_success() {
            bail!("presign returned {status}");
        }
        response.json().await.context("decode presign response")
    }

    async fn ingest(&self, events: &[Event]) -> Result<()> {
        let url = format!("{}/api/v1/ingest", self.base_url);
        let body = serde_json::json!({ "events": events });
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("ingest request")?;
        let status = response.status();
        if !status.is_success() {
            bail!("ingest returned {status}");
        }
        Ok(())
    }

    async fn put_object(&self, url: &str, bytes: Vec<u8>) -> Result<()> {
        let response = self
            .http
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(bytes)
            .send()
            .await
            .context("object store PUT")?;
        let status = response.status();
        if !status.is_success() {
            bail!("object store PUT returned {status}");
        }
        Ok(())
    }
}
