//! Versioned envelopes and payloads exchanged between pane and preview.

use crate::dispatch::wire::{RenderRequest, RenderResponse};
use crate::resolver::TransportMode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Contract version for messenger envelopes.
pub const ENVELOPE_VERSION: u32 = 1;

/// Named message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// Preview finished bootstrapping and accepts refresh traffic.
    Ready,
    /// Preview asks the pane to reload it.
    RequestFullRefresh,
    /// Pane asks for the per-setting transport advertisement.
    RequestTransports,
    /// Preview advertises per-setting transport modes.
    Transports,
    /// Preview asks the pane to relay a render batch.
    RenderBatchRequest,
    /// Pane answers a relayed render batch.
    RenderBatchResponse,
    /// A partial's placement was re-rendered.
    ContentRendered,
    /// A list member container was moved.
    ContentMoved,
    /// Pane forwards a setting value.
    Setting,
    /// A partial fell back after a failed refresh.
    PartialFallback,
    /// Pane hands the preview a fresh auth token.
    NonceRefresh,
    /// Pane saved the changeset; nothing is dirty any more.
    Saved,
}

impl MessageKind {
    /// Render the kind to its wire format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::RequestFullRefresh => "request-full-refresh",
            Self::RequestTransports => "request-transports",
            Self::Transports => "transports",
            Self::RenderBatchRequest => "render-batch-request",
            Self::RenderBatchResponse => "render-batch-response",
            Self::ContentRendered => "content-rendered",
            Self::ContentMoved => "content-moved",
            Self::Setting => "setting",
            Self::PartialFallback => "partial-fallback",
            Self::NonceRefresh => "nonce-refresh",
            Self::Saved => "saved",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    /// Per-sender sequence number.
    pub seq: u64,
    pub kind: MessageKind,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    #[must_use]
    pub fn new(seq: u64, kind: MessageKind, payload: Value) -> Self {
        Self {
            v: ENVELOPE_VERSION,
            seq,
            kind,
            payload,
        }
    }
}

/// `setting` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingPayload {
    pub id: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub removed: bool,
}

/// `transports` payload: setting id to mode.
pub type TransportsPayload = BTreeMap<String, TransportMode>;

/// `request-full-refresh` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullRefreshPayload {
    pub reason: String,
}

/// `render-batch-request` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRequest {
    pub request_id: String,
    pub request: RenderRequest,
}

/// `render-batch-response` payload. Exactly one of `response` and `error`
/// is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayResponse {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<RenderResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `content-rendered` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedPayload {
    pub partial_id: String,
    #[serde(default)]
    pub context: Option<Value>,
}

/// `content-moved` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovedPayload {
    pub partial_id: String,
}

/// `nonce-refresh` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoncePayload {
    pub auth_token: String,
}

/// `partial-fallback` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackPayload {
    pub partial_id: String,
    pub error: String,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use serde_json::json;

    #[test]
    fn kinds_use_wire_names() {
        for kind in [
            MessageKind::Ready,
            MessageKind::RequestFullRefresh,
            MessageKind::RenderBatchResponse,
            MessageKind::PartialFallback,
            MessageKind::NonceRefresh,
            MessageKind::Saved,
        ] {
            assert_eq!(serde_json::to_value(kind).unwrap(), json!(kind.as_str()));
        }
    }

    #[test]
    fn envelope_json_shape() {
        let env = Envelope::new(4, MessageKind::Setting, json!({"id": "title", "value": "Hi"}));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({"v": 1, "seq": 4, "kind": "setting", "payload": {"id": "title", "value": "Hi"}})
        );
        let payload: SettingPayload = serde_json::from_value(env.payload).unwrap();
        assert!(!payload.removed);
    }

    #[test]
    fn payload_defaults_to_null() {
        let env: Envelope = serde_json::from_str(r#"{"v":1,"seq":0,"kind":"ready"}"#).unwrap();
        assert_eq!(env.payload, Value::Null);
    }
}
