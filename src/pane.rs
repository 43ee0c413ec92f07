//! The pane side of a customization session.
//!
//! The pane owns the authoritative settings, tracks whether the preview is
//! ready, forwards changes according to the preview's transport
//! advertisement and relays render batches to the authority. Reloads go
//! through a [`ReloadGate`] so a burst of failures reloads the preview once.

use crate::dispatch::relay::serve_relay;
use crate::dispatch::transport::RenderTransport;
use crate::fallback::FullRefreshGate;
use crate::messenger::contract::{
    FallbackPayload, FullRefreshPayload, NoncePayload, SettingPayload, TransportsPayload,
};
use crate::messenger::{MessageKind, Messenger};
use crate::resolver::TransportMode;
use crate::settings::{SettingEvent, SettingsStore};
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reloads the whole preview.
pub trait PreviewReloader: Send + Sync {
    fn reload(&self, reason: &str);
}

/// Lets one reload through per preview lifetime.
pub struct ReloadGate {
    gate: FullRefreshGate,
    reloader: Arc<dyn PreviewReloader>,
}

impl ReloadGate {
    pub fn new(reloader: Arc<dyn PreviewReloader>) -> Self {
        Self {
            gate: FullRefreshGate::new(),
            reloader,
        }
    }

    /// Reload unless a reload is already pending. Returns whether this call
    /// reloaded.
    pub fn request(&self, reason: &str) -> bool {
        if !self.gate.trigger() {
            debug!(reason, "reload already pending");
            return false;
        }
        info!(reason, "reloading preview");
        self.reloader.reload(reason);
        true
    }

    pub fn is_pending(&self) -> bool {
        self.gate.is_triggered()
    }

    /// Re-arm once the reloaded preview is ready.
    pub fn reset(&self) {
        self.gate.reset();
    }
}

/// The pane half of a session.
pub struct PaneSession {
    messenger: Arc<Messenger>,
    gate: ReloadGate,
    ready: watch::Sender<bool>,
    transports: RwLock<TransportsPayload>,
}

impl PaneSession {
    /// Bind the preview's messages on `messenger`. Relayed render batches
    /// are served through `transport`. Must be called inside a tokio
    /// runtime.
    pub fn new(
        messenger: Arc<Messenger>,
        reloader: Arc<dyn PreviewReloader>,
        transport: Arc<dyn RenderTransport>,
    ) -> Arc<Self> {
        let (ready, _rx) = watch::channel(false);
        let session = Arc::new(Self {
            messenger: Arc::clone(&messenger),
            gate: ReloadGate::new(reloader),
            ready,
            transports: RwLock::default(),
        });

        let weak = Arc::downgrade(&session);
        messenger.bind(MessageKind::Ready, move |_| {
            if let Some(session) = weak.upgrade() {
                session.on_ready();
            }
        });
        let weak = Arc::downgrade(&session);
        messenger.bind(MessageKind::Transports, move |payload| {
            let Some(session) = weak.upgrade() else {
                return;
            };
            match serde_json::from_value::<TransportsPayload>(payload) {
                Ok(map) => {
                    debug!(settings = map.len(), "received transport advertisement");
                    *session
                        .transports
                        .write()
                        .unwrap_or_else(|e| e.into_inner()) = map;
                }
                Err(e) => warn!(error = %e, "ignoring malformed transports message"),
            }
        });
        let weak = Arc::downgrade(&session);
        messenger.bind(MessageKind::RequestFullRefresh, move |payload| {
            let Some(session) = weak.upgrade() else {
                return;
            };
            let reason = serde_json::from_value::<FullRefreshPayload>(payload)
                .map(|p| p.reason)
                .unwrap_or_else(|_| "preview requested a full refresh".to_owned());
            session.gate.request(&reason);
        });
        messenger.bind(MessageKind::PartialFallback, |payload| {
            if let Ok(fallback) = serde_json::from_value::<FallbackPayload>(payload) {
                warn!(partial_id = %fallback.partial_id, error = %fallback.error, "preview partial fell back");
            }
        });
        serve_relay(&messenger, transport);
        session
    }

    fn on_ready(&self) {
        info!("preview ready");
        self.gate.reset();
        self.ready.send_replace(true);
        self.messenger
            .send(MessageKind::RequestTransports, Value::Null);
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the preview has reported ready.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Mark the preview as gone, as when it is being reloaded.
    pub fn preview_unloaded(&self) {
        self.ready.send_replace(false);
        self.transports
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Advertised transport for a setting. Unknown settings reload.
    pub fn transport_for(&self, setting_id: &str) -> TransportMode {
        self.transports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(setting_id)
            .copied()
            .unwrap_or(TransportMode::Refresh)
    }

    pub fn reload_gate(&self) -> &ReloadGate {
        &self.gate
    }

    /// Deliver one setting change to the preview.
    pub fn forward(&self, event: &SettingEvent) {
        let id = event.id();
        if !self.is_ready() {
            debug!(setting = id, "preview not ready; change picked up on load");
            return;
        }
        match self.transport_for(id) {
            TransportMode::Selective => {
                let payload = match event {
                    SettingEvent::Added { id, value } | SettingEvent::Changed { id, value, .. } => {
                        SettingPayload {
                            id: id.clone(),
                            value: value.clone(),
                            removed: false,
                        }
                    }
                    SettingEvent::Removed { id } => SettingPayload {
                        id: id.clone(),
                        value: Value::Null,
                        removed: true,
                    },
                };
                self.messenger.send_json(MessageKind::Setting, &payload);
            }
            TransportMode::Refresh => {
                self.gate
                    .request(&format!("setting {id} has no selective transport"));
            }
        }
    }

    /// Hand the preview a new auth token for its next render batches.
    pub fn refresh_nonce(&self, auth_token: impl Into<String>) {
        debug!("forwarding refreshed auth token");
        self.messenger.send_json(
            MessageKind::NonceRefresh,
            &NoncePayload {
                auth_token: auth_token.into(),
            },
        );
    }

    /// Tell the preview the changeset was saved.
    pub fn notify_saved(&self) {
        info!("changeset saved");
        self.messenger.send(MessageKind::Saved, Value::Null);
    }

    /// Forward every change published by `store` until it closes or the
    /// session is dropped.
    pub fn watch_settings(self: &Arc<Self>, store: &dyn SettingsStore) -> JoinHandle<()> {
        let mut rx = store.subscribe();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(session) = weak.upgrade() else {
                            break;
                        };
                        session.forward(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "setting changes dropped; reloading preview");
                        if let Some(session) = weak.upgrade() {
                            session.gate.request("setting changes were dropped");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
