//! Partials: independently refreshable regions of the preview document.

pub mod kinds;
pub mod registry;

pub use kinds::{ChangeAction, ChangeContext, KindTable, PartialType};
pub use registry::PartialRegistry;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, RwLock};

/// Registration input for a partial. Unset fields take type defaults, and
/// on re-registration leave the existing value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialDescriptor {
    /// Selector locating containers.
    pub selector: Option<String>,
    /// Related setting ids, in order.
    pub settings: Vec<String>,
    /// Setting whose control gets focus on edit shortcuts.
    pub primary_setting: Option<String>,
    /// Type name; `default` when unset.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Whether a failed refresh reloads the whole preview.
    pub fallback_refresh: Option<bool>,
    /// Whether rendered content carries its own wrapper element.
    pub container_inclusive: Option<bool>,
    /// Type-specific parameters.
    pub params: Map<String, Value>,
}

impl PartialDescriptor {
    /// Descriptor with an explicit type.
    #[must_use]
    pub fn of_kind(kind: &str) -> Self {
        Self {
            kind: Some(kind.to_owned()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    #[must_use]
    pub fn with_settings<I, S>(mut self, settings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings = settings.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.params.insert(key.to_owned(), value);
        self
    }

    #[must_use]
    pub fn without_fallback(mut self) -> Self {
        self.fallback_refresh = Some(false);
        self
    }
}

/// Resolved parameters of a registered partial.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialParams {
    pub selector: String,
    pub settings: Vec<String>,
    pub primary_setting: String,
    pub kind: String,
    pub fallback_refresh: bool,
    pub container_inclusive: bool,
    pub params: Map<String, Value>,
}

struct PartialState {
    params: PartialParams,
    behavior: Arc<dyn PartialType>,
}

/// A registered partial. Handles stay valid across re-registration, which
/// merges new fields into the same instance.
pub struct Partial {
    id: String,
    seq: u64,
    state: RwLock<PartialState>,
}

impl std::fmt::Debug for Partial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partial")
            .field("id", &self.id)
            .field("seq", &self.seq)
            .field("params", &self.params())
            .finish()
    }
}

impl Partial {
    pub(crate) fn new(id: String, seq: u64, params: PartialParams, behavior: Arc<dyn PartialType>) -> Self {
        Self {
            id,
            seq,
            state: RwLock::new(PartialState { params, behavior }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Registration order.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Snapshot of the current parameters.
    pub fn params(&self) -> PartialParams {
        self.read().params.clone()
    }

    /// The type implementation selected at registration.
    pub fn behavior(&self) -> Arc<dyn PartialType> {
        Arc::clone(&self.read().behavior)
    }

    pub fn settings(&self) -> Vec<String> {
        self.read().params.settings.clone()
    }

    pub fn selector(&self) -> String {
        self.read().params.selector.clone()
    }

    pub fn kind(&self) -> String {
        self.read().params.kind.clone()
    }

    pub fn fallback_refresh(&self) -> bool {
        self.read().params.fallback_refresh
    }

    pub fn container_inclusive(&self) -> bool {
        self.read().params.container_inclusive
    }

    /// A type-specific string parameter.
    pub fn param_str(&self, key: &str) -> Option<String> {
        self.read()
            .params
            .params
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_owned)
    }

    /// Whether `setting_id` is one of the partial's related settings.
    pub fn is_related_setting(&self, setting_id: &str) -> bool {
        self.read().params.settings.iter().any(|s| s == setting_id)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PartialState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn merge(&self, descriptor: PartialDescriptor, behavior: Option<Arc<dyn PartialType>>) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let params = &mut state.params;
        if let Some(selector) = descriptor.selector {
            params.selector = selector;
        }
        if !descriptor.settings.is_empty() {
            params.settings = descriptor.settings;
            if descriptor.primary_setting.is_none()
                && !params.settings.contains(&params.primary_setting)
            {
                params.primary_setting = params.settings[0].clone();
            }
        }
        if let Some(primary) = descriptor.primary_setting {
            params.primary_setting = primary;
        }
        if let Some(fallback) = descriptor.fallback_refresh {
            params.fallback_refresh = fallback;
        }
        if let Some(inclusive) = descriptor.container_inclusive {
            params.container_inclusive = inclusive;
        }
        params.params.extend(descriptor.params);
        if let Some(behavior) = behavior {
            params.kind = behavior.name().to_owned();
            state.behavior = behavior;
        }
    }
}

/// Extract `<inner>` from ids shaped like `<prefix>[<inner>]`.
#[must_use]
pub fn bracketed<'a>(id: &'a str, prefix: &str) -> Option<&'a str> {
    id.strip_prefix(prefix)?
        .strip_prefix('[')?
        .strip_suffix(']')
        .filter(|inner| !inner.is_empty())
}
