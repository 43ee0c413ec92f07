//! HTTP front end for the render authority.
//!
//! ## Endpoints
//!
//! - `POST <route>` (default `/partials`): render a batch
//! - `GET /health`: liveness check

use super::RenderAuthority;
use crate::config::AuthorityConfig;
use crate::dispatch::wire::{RenderRequest, RenderResponse};
use crate::error::{ErrorCode, RefreshError};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Render authority served over HTTP in a background task.
pub struct AuthorityServer {
    addr: SocketAddr,
    route: String,
    handle: JoinHandle<()>,
}

impl AuthorityServer {
    /// Bind to `{config.host}:{config.port}` (port `0` auto-assigns) and
    /// start serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP listener cannot bind.
    pub async fn start(
        authority: Arc<RenderAuthority>,
        config: &AuthorityConfig,
    ) -> crate::error::Result<Self> {
        let app = router(authority, &config.route);

        let bind_addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| RefreshError::Network(format!("authority bind failed: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| RefreshError::Network(format!("failed to get local addr: {e}")))?;

        info!("render authority listening on http://{addr}{}", config.route);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("render authority server error: {e}");
            }
        });

        Ok(Self {
            addr,
            route: config.route.clone(),
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Full URL of the render route.
    pub fn url(&self) -> String {
        format!("http://{}{}", self.addr, self.route)
    }

    /// Abort the server task.
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for AuthorityServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Router exposing the authority at `route`.
pub fn router(authority: Arc<RenderAuthority>, route: &str) -> Router {
    Router::new()
        .route(route, post(handle_render))
        .route("/health", get(handle_health))
        .with_state(authority)
}

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn handle_render(
    State(authority): State<Arc<RenderAuthority>>,
    body: Bytes,
) -> impl IntoResponse {
    let request: RenderRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "malformed render batch");
            return (
                StatusCode::BAD_REQUEST,
                Json(RenderResponse::error(ErrorCode::MalformedPartials)),
            );
        }
    };
    let response = authority.process(request);
    let status = match &response {
        RenderResponse::Error { error } => status_for(*error),
        RenderResponse::Contents { .. } => StatusCode::OK,
    };
    (status, Json(response))
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::CustomizeNotAllowed => StatusCode::FORBIDDEN,
        _ => StatusCode::BAD_REQUEST,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_statuses() {
        assert_eq!(status_for(ErrorCode::BadNonce), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorCode::CustomizeNotAllowed), StatusCode::FORBIDDEN);
        assert_eq!(status_for(ErrorCode::MissingPartials), StatusCode::BAD_REQUEST);
    }
}
