//! Relaying render batches preview → pane → authority over the messenger.
//!
//! A sandboxed preview may have no route to the authority of its own. It
//! sends `render-batch-request` to the pane, which forwards the batch over
//! its own transport and answers with `render-batch-response`, correlated by
//! `request_id`.

use super::transport::RenderTransport;
use super::wire::{RenderRequest, RenderResponse};
use crate::error::{RefreshError, Result};
use crate::messenger::contract::{RelayRequest, RelayResponse};
use crate::messenger::{MessageKind, Messenger};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<RelayResponse>>>>;

/// Preview-side transport that relays through the pane.
pub struct MessengerTransport {
    messenger: Arc<Messenger>,
    pending: Pending,
}

impl MessengerTransport {
    /// Bind the response handler on `messenger` and return the transport.
    #[must_use]
    pub fn new(messenger: Arc<Messenger>) -> Self {
        let pending: Pending = Arc::default();
        let responses = Arc::clone(&pending);
        messenger.bind(MessageKind::RenderBatchResponse, move |payload| {
            let response: RelayResponse = match serde_json::from_value(payload) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "malformed render-batch-response");
                    return;
                }
            };
            let waiter = responses
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&response.request_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => debug!(request_id = %response.request_id, "response for abandoned relay request"),
            }
        });
        Self { messenger, pending }
    }
}

/// Removes the pending entry when the caller stops waiting.
struct PendingGuard {
    pending: Pending,
    request_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.request_id);
    }
}

#[async_trait]
impl RenderTransport for MessengerTransport {
    fn name(&self) -> &str {
        "messenger"
    }

    async fn send(&self, request: RenderRequest) -> Result<RenderResponse> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id.clone(), tx);
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            request_id: request_id.clone(),
        };

        let relay = RelayRequest {
            request_id,
            request,
        };
        if !self.messenger.send_json(MessageKind::RenderBatchRequest, &relay) {
            return Err(RefreshError::Network("pane is not reachable".to_owned()));
        }
        let response = rx
            .await
            .map_err(|_| RefreshError::Network("relay closed before responding".to_owned()))?;
        match (response.response, response.error) {
            (Some(response), _) => Ok(response),
            (None, Some(error)) => Err(RefreshError::Network(error)),
            (None, None) => Err(RefreshError::Validation(
                "empty render-batch-response".to_owned(),
            )),
        }
    }
}

/// Serve relayed batches arriving on `messenger` through `transport`.
pub fn serve_relay(messenger: &Arc<Messenger>, transport: Arc<dyn RenderTransport>) {
    let weak = Arc::downgrade(messenger);
    messenger.bind(MessageKind::RenderBatchRequest, move |payload| {
        let relay: RelayRequest = match serde_json::from_value(payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "malformed render-batch-request");
                return;
            }
        };
        let transport = Arc::clone(&transport);
        let weak = weak.clone();
        tokio::spawn(async move {
            let reply = match transport.send(relay.request).await {
                Ok(response) => RelayResponse {
                    request_id: relay.request_id,
                    response: Some(response),
                    error: None,
                },
                Err(e) => RelayResponse {
                    request_id: relay.request_id,
                    response: None,
                    error: Some(e.to_string()),
                },
            };
            if let Some(messenger) = weak.upgrade() {
                messenger.send_json(MessageKind::RenderBatchResponse, &reply);
            }
        });
    });
}
