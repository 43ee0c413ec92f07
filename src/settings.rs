//! Live-editable settings: the store the pane edits and the preview mirrors.
//!
//! The refresh core only reads ids, values, and dirty flags. `InMemorySettings`
//! is the store used by sessions and tests; hosts with their own store
//! implement [`SettingsStore`].

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::RwLock;
use tokio::sync::broadcast;

/// Buffered change notifications per subscriber.
const CHANGE_CAPACITY: usize = 256;

/// A change observed in a settings store.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingEvent {
    /// A setting was created.
    Added { id: String, value: Value },
    /// A setting's value changed.
    Changed {
        id: String,
        value: Value,
        old: Value,
    },
    /// A setting was deleted.
    Removed { id: String },
}

impl SettingEvent {
    /// Id of the affected setting.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Added { id, .. } | Self::Changed { id, .. } | Self::Removed { id } => id,
        }
    }

    /// The value transition carried by an add or change.
    #[must_use]
    pub fn to_change(&self) -> Option<SettingChange> {
        match self {
            Self::Added { id, value } => Some(SettingChange {
                id: id.clone(),
                value: value.clone(),
                old: None,
            }),
            Self::Changed { id, value, old } => Some(SettingChange {
                id: id.clone(),
                value: value.clone(),
                old: Some(old.clone()),
            }),
            Self::Removed { .. } => None,
        }
    }
}

/// A setting's new value alongside its previous one.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingChange {
    pub id: String,
    pub value: Value,
    pub old: Option<Value>,
}

impl SettingChange {
    #[must_use]
    pub fn new(id: impl Into<String>, value: Value, old: Option<Value>) -> Self {
        Self {
            id: id.into(),
            value,
            old,
        }
    }
}

/// Read side of a settings store, as consumed by the refresh core.
pub trait SettingsStore: Send + Sync {
    /// Current value of a setting.
    fn get(&self, id: &str) -> Option<Value>;

    /// Whether the setting changed since the last sync.
    fn is_dirty(&self, id: &str) -> bool;

    /// Atomic snapshot of every dirty setting's value.
    fn dirty_values(&self) -> BTreeMap<String, Value>;

    /// Ids of every known setting.
    fn ids(&self) -> Vec<String>;

    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<SettingEvent>;
}

#[derive(Debug, Clone)]
struct SettingEntry {
    value: Value,
    dirty: bool,
}

/// Thread-safe in-memory settings store with dirty tracking.
pub struct InMemorySettings {
    entries: RwLock<BTreeMap<String, SettingEntry>>,
    events: broadcast::Sender<SettingEvent>,
}

impl InMemorySettings {
    /// Create an empty store.
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            entries: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// Create a store seeded with clean (persisted) values.
    pub fn with_values<I, K>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let store = Self::new();
        {
            let mut entries = store.write();
            for (id, value) in values {
                entries.insert(
                    id.into(),
                    SettingEntry {
                        value,
                        dirty: false,
                    },
                );
            }
        }
        store
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, SettingEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, SettingEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Set a value, marking it dirty. Returns the emitted event, or `None`
    /// when the value is unchanged.
    pub fn set(&self, id: impl Into<String>, value: Value) -> Option<SettingEvent> {
        self.update(id.into(), value, true)
    }

    /// Set a value with an explicit dirty flag (used when mirroring another
    /// store).
    pub fn set_with_dirty(
        &self,
        id: impl Into<String>,
        value: Value,
        dirty: bool,
    ) -> Option<SettingEvent> {
        self.update(id.into(), value, dirty)
    }

    fn update(&self, id: String, value: Value, dirty: bool) -> Option<SettingEvent> {
        let event = {
            let mut entries = self.write();
            match entries.get_mut(&id) {
                Some(entry) if entry.value == value => {
                    entry.dirty |= dirty;
                    return None;
                }
                Some(entry) => {
                    let old = std::mem::replace(&mut entry.value, value.clone());
                    entry.dirty |= dirty;
                    SettingEvent::Changed { id, value, old }
                }
                None => {
                    entries.insert(
                        id.clone(),
                        SettingEntry {
                            value: value.clone(),
                            dirty,
                        },
                    );
                    SettingEvent::Added { id, value }
                }
            }
        };
        let _ = self.events.send(event.clone());
        Some(event)
    }

    /// Delete a setting.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.write().remove(id).is_some();
        if removed {
            let _ = self.events.send(SettingEvent::Removed { id: id.to_owned() });
        }
        removed
    }

    /// Clear every dirty flag, as after a save.
    pub fn mark_saved(&self) {
        for entry in self.write().values_mut() {
            entry.dirty = false;
        }
    }
}

impl Default for InMemorySettings {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsStore for InMemorySettings {
    fn get(&self, id: &str) -> Option<Value> {
        self.read().get(id).map(|e| e.value.clone())
    }

    fn is_dirty(&self, id: &str) -> bool {
        self.read().get(id).is_some_and(|e| e.dirty)
    }

    fn dirty_values(&self) -> BTreeMap<String, Value> {
        self.read()
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(id, e)| (id.clone(), e.value.clone()))
            .collect()
    }

    fn ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<SettingEvent> {
        self.events.subscribe()
    }
}
