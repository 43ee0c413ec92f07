//! JSON payloads exchanged with the render authority.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One render batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    /// Absent tokens decode as empty and are rejected as `bad_nonce`.
    #[serde(default)]
    pub auth_token: String,
    /// Every dirty setting, snapshotted once at dispatch.
    #[serde(default)]
    pub dirty_settings: BTreeMap<String, Value>,
    /// Container contexts per partial id, one entry per placement.
    #[serde(default)]
    pub requests: BTreeMap<String, Vec<Option<Value>>>,
}

/// Result of rendering one container context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedItem {
    pub content: Option<String>,
    pub error: Option<ErrorCode>,
}

impl RenderedItem {
    #[must_use]
    pub fn content(html: impl Into<String>) -> Self {
        Self {
            content: Some(html.into()),
            error: None,
        }
    }

    #[must_use]
    pub fn error(code: ErrorCode) -> Self {
        Self {
            content: None,
            error: Some(code),
        }
    }
}

/// Authority reply: per-partial contents aligned with the request, or a
/// batch-level error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RenderResponse {
    Error { error: ErrorCode },
    Contents { contents: BTreeMap<String, Vec<RenderedItem>> },
}

impl RenderResponse {
    #[must_use]
    pub fn error(code: ErrorCode) -> Self {
        Self::Error { error: code }
    }
}
