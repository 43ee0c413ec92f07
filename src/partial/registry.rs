//! Explicitly owned catalog of registered partials.

use super::{KindTable, Partial, PartialDescriptor, PartialParams};
use crate::error::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Callback run after a partial is removed.
pub type RemovalHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Inner {
    partials: HashMap<String, Arc<Partial>>,
    next_seq: u64,
}

/// Registry of partials for one preview session.
pub struct PartialRegistry {
    kinds: Arc<KindTable>,
    inner: RwLock<Inner>,
    removal_hooks: RwLock<Vec<RemovalHook>>,
}

impl PartialRegistry {
    #[must_use]
    pub fn new(kinds: Arc<KindTable>) -> Self {
        Self {
            kinds,
            inner: RwLock::new(Inner::default()),
            removal_hooks: RwLock::new(Vec::new()),
        }
    }

    /// The type table partials are resolved against.
    pub fn kinds(&self) -> &Arc<KindTable> {
        &self.kinds
    }

    /// Register a partial, or merge the descriptor into an existing one with
    /// the same id. Existing handles stay valid either way.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the id is illegal for the type.
    pub fn register(&self, id: &str, mut descriptor: PartialDescriptor) -> Result<Arc<Partial>> {
        if let Some(existing) = self.get(id) {
            let behavior = match descriptor.kind.as_deref() {
                Some(kind) if kind != existing.kind() => {
                    let behavior = self.kinds.resolve(Some(kind));
                    behavior.prepare(id, &mut descriptor)?;
                    Some(behavior)
                }
                _ => None,
            };
            existing.merge(descriptor, behavior);
            debug!(partial_id = id, "merged partial registration");
            return Ok(existing);
        }

        let behavior = self.kinds.resolve(descriptor.kind.as_deref());
        behavior.prepare(id, &mut descriptor)?;
        let settings = if descriptor.settings.is_empty() {
            vec![id.to_owned()]
        } else {
            descriptor.settings
        };
        let primary_setting = descriptor
            .primary_setting
            .unwrap_or_else(|| settings[0].clone());
        let params = PartialParams {
            selector: descriptor
                .selector
                .unwrap_or_else(|| crate::placement::id_selector(id)),
            settings,
            primary_setting,
            kind: behavior.name().to_owned(),
            fallback_refresh: descriptor.fallback_refresh.unwrap_or(true),
            container_inclusive: descriptor.container_inclusive.unwrap_or(false),
            params: descriptor.params,
        };

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        // Another writer may have raced us between `get` and here.
        if let Some(existing) = inner.partials.get(id) {
            return Ok(Arc::clone(existing));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let partial = Arc::new(Partial::new(id.to_owned(), seq, params, behavior));
        inner.partials.insert(id.to_owned(), Arc::clone(&partial));
        debug!(partial_id = id, kind = %partial.kind(), "registered partial");
        Ok(partial)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Partial>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .partials
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Unregister a partial. Removal hooks cancel any queued or in-flight
    /// refresh for it.
    pub fn remove(&self, id: &str) -> Option<Arc<Partial>> {
        let removed = self
            .inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .partials
            .remove(id);
        if removed.is_some() {
            debug!(partial_id = id, "removed partial");
            let hooks = self
                .removal_hooks
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            for hook in hooks {
                hook(id);
            }
        }
        removed
    }

    /// Run `hook` after every removal.
    pub fn on_remove(&self, hook: RemovalHook) {
        self.removal_hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    /// Every partial in registration order.
    pub fn all(&self) -> Vec<Arc<Partial>> {
        let mut partials: Vec<_> = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .partials
            .values()
            .cloned()
            .collect();
        partials.sort_by_key(|p| p.seq());
        partials
    }

    /// Visit every partial in registration order.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Partial>)) {
        for partial in self.all() {
            f(&partial);
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .partials
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
