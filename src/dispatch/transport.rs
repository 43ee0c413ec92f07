//! Transports carrying render batches to the authority.

use super::wire::{RenderRequest, RenderResponse};
use crate::authority::RenderAuthority;
use crate::error::{RefreshError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Request/response RPC to the render authority. Dropping the returned
/// future aborts the call.
#[async_trait]
pub trait RenderTransport: Send + Sync {
    /// Transport name for logs.
    fn name(&self) -> &str;

    /// Send one batch.
    ///
    /// Batch-level rejections come back as `Ok(RenderResponse::Error)`;
    /// `Err` is reserved for transport failures.
    async fn send(&self, request: RenderRequest) -> Result<RenderResponse>;
}

/// Calls an authority living in the same process.
pub struct LocalTransport {
    authority: Arc<RenderAuthority>,
}

impl LocalTransport {
    #[must_use]
    pub fn new(authority: Arc<RenderAuthority>) -> Self {
        Self { authority }
    }
}

#[async_trait]
impl RenderTransport for LocalTransport {
    fn name(&self) -> &str {
        "local"
    }

    async fn send(&self, request: RenderRequest) -> Result<RenderResponse> {
        Ok(self.authority.process(request))
    }
}

/// JSON POST to an authority served over HTTP.
pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport posting to `url` (the authority's render route).
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RenderTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, request: RenderRequest) -> Result<RenderResponse> {
        debug!(url = %self.url, partials = request.requests.len(), "posting render batch");
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RefreshError::Network(format!("render request failed: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RefreshError::Network(format!("failed to read render response: {e}")))?;

        // Batch-level rejections arrive with 4xx statuses but a regular
        // error envelope.
        match serde_json::from_str::<RenderResponse>(&body) {
            Ok(parsed) => Ok(parsed),
            Err(_) if !status.is_success() => Err(RefreshError::Network(format!(
                "HTTP {status}: {}",
                body.chars().take(200).collect::<String>()
            ))),
            Err(e) => Err(RefreshError::Validation(format!(
                "unparsable render response: {e}"
            ))),
        }
    }
}
