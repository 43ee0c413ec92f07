//! Maps setting changes onto the partials they affect.

use crate::partial::{Partial, PartialRegistry};
use crate::settings::SettingChange;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// How the pane should deliver a setting's changes to the preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Forward the value; the preview refreshes affected partials itself.
    Selective,
    /// Reload the whole preview.
    Refresh,
}

/// Outcome of resolving one setting change.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// These partials are related, in registration order.
    Partials(Vec<Arc<Partial>>),
    /// Nothing is related although a region was expected.
    FullRefresh(String),
    /// The change does not concern any partial.
    Unrelated,
}

/// Resolves related partials against an injected registry.
#[derive(Clone)]
pub struct DependencyResolver {
    registry: Arc<PartialRegistry>,
}

impl DependencyResolver {
    #[must_use]
    pub fn new(registry: Arc<PartialRegistry>) -> Self {
        Self { registry }
    }

    /// Partials related to a change, by each partial's type predicate.
    pub fn related_partials(&self, change: &SettingChange) -> Vec<Arc<Partial>> {
        self.registry
            .all()
            .into_iter()
            .filter(|p| p.behavior().is_related(p, change))
            .collect()
    }

    /// Related partials, or a full-refresh verdict when a type expected a
    /// region for this setting and none is registered.
    pub fn resolve(&self, change: &SettingChange) -> Resolution {
        let related = self.related_partials(change);
        if !related.is_empty() {
            debug!(setting = %change.id, count = related.len(), "resolved related partials");
            return Resolution::Partials(related);
        }
        if self.registry.kinds().claims(&change.id) {
            return Resolution::FullRefresh(format!(
                "no partial is registered for claimed setting {}",
                change.id
            ));
        }
        Resolution::Unrelated
    }

    /// Transport advertised for a setting: selective when some partial lists
    /// it or some type claims it.
    pub fn transport_for(&self, setting_id: &str) -> TransportMode {
        let listed = self
            .registry
            .all()
            .iter()
            .any(|p| p.is_related_setting(setting_id));
        if listed || self.registry.kinds().claims(setting_id) {
            TransportMode::Selective
        } else {
            TransportMode::Refresh
        }
    }
}
