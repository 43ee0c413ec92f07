//! Partial types: relation rules, placement strategies, and change handling.
//!
//! A type is selected once, at registration. The built-ins are `default`,
//! `list`, `list_item`, and `menu`; hosts add their own through
//! [`KindTable::register`].

use super::{Partial, PartialDescriptor, PartialRegistry, bracketed};
use crate::document::Document;
use crate::error::{RefreshError, Result};
use crate::placement::{self, Anchor, Placement};
use crate::reconcile::{self, Notice};
use crate::settings::{SettingChange, SettingsStore};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// What the preview should do after a related setting changed.
#[derive(Debug, Clone)]
pub enum ChangeAction {
    /// Refresh the partial itself.
    Refresh,
    /// The type handled the change locally; refresh these partials instead
    /// (possibly none).
    Delegate(Vec<Arc<Partial>>),
    /// The change cannot be applied selectively.
    FullRefresh(String),
}

/// Mutable preview state handed to [`PartialType::on_setting_change`].
pub struct ChangeContext<'a> {
    pub doc: &'a mut Document,
    pub registry: &'a PartialRegistry,
    pub notices: &'a mut Vec<Notice>,
}

/// Behavior of one partial type.
pub trait PartialType: Send + Sync {
    /// Registered type name.
    fn name(&self) -> &str;

    /// Validate the id and fill type defaults before registration.
    fn prepare(&self, _id: &str, _descriptor: &mut PartialDescriptor) -> Result<()> {
        Ok(())
    }

    /// Whether a setting change concerns this partial.
    fn is_related(&self, partial: &Partial, change: &SettingChange) -> bool {
        partial.is_related_setting(&change.id)
    }

    /// Whether changes to `setting_id` are expected to have a region of this
    /// type. A claimed change that relates to no partial forces a full refresh.
    fn claims_setting(&self, _setting_id: &str) -> bool {
        false
    }

    /// Current placements of the partial.
    ///
    /// # Errors
    ///
    /// Fails when the partial's container cannot be addressed, e.g. an
    /// unparsable selector.
    fn placements(
        &self,
        partial: &Partial,
        doc: &Document,
        _settings: &dyn SettingsStore,
    ) -> Result<Vec<Placement>> {
        placement::selector_placements(doc, partial.id(), &partial.selector())
    }

    /// Reaction to a related setting change.
    fn on_setting_change(
        &self,
        _ctx: &mut ChangeContext<'_>,
        _partial: &Arc<Partial>,
        _change: &SettingChange,
    ) -> ChangeAction {
        ChangeAction::Refresh
    }
}

/// Selector-addressed partial related by id membership.
#[derive(Debug, Default)]
pub struct DefaultType;

impl PartialType for DefaultType {
    fn name(&self) -> &str {
        "default"
    }
}

/// An ordered collection of members rendered between boundary comments.
#[derive(Debug, Default)]
pub struct ListType;

/// Marker prefix for list regions.
pub const LIST_MARKER: &str = "list";

impl PartialType for ListType {
    fn name(&self) -> &str {
        "list"
    }

    fn prepare(&self, id: &str, descriptor: &mut PartialDescriptor) -> Result<()> {
        let list_id = bracketed(id, "list")
            .ok_or_else(|| RefreshError::Validation(format!("illegal id for list partial: {id}")))?;
        descriptor
            .params
            .insert("list_id".to_owned(), Value::String(list_id.to_owned()));
        descriptor
            .params
            .entry("member_before")
            .or_insert_with(|| json!(r#"<li id="%1$s" class="%2$s">"#));
        descriptor
            .params
            .entry("member_after")
            .or_insert_with(|| json!("</li>"));
        Ok(())
    }

    fn claims_setting(&self, setting_id: &str) -> bool {
        bracketed(setting_id, "list").is_some()
    }

    fn placements(
        &self,
        partial: &Partial,
        doc: &Document,
        _settings: &dyn SettingsStore,
    ) -> Result<Vec<Placement>> {
        let Some(list_id) = partial.param_str("list_id") else {
            return Ok(Vec::new());
        };
        Ok(placement::marker_pairs(doc, LIST_MARKER, &list_id)
            .into_iter()
            .map(|pair| Placement {
                partial_id: partial.id().to_owned(),
                anchor: Anchor::Markers {
                    start: pair.start,
                    end: pair.end,
                },
                context: Some(json!({
                    "list_id": list_id,
                    "instance_number": pair.instance_number,
                })),
                instance_number: Some(pair.instance_number),
            })
            .collect())
    }

    fn on_setting_change(
        &self,
        ctx: &mut ChangeContext<'_>,
        partial: &Arc<Partial>,
        change: &SettingChange,
    ) -> ChangeAction {
        if change.id != partial.id() {
            return ChangeAction::Refresh;
        }
        reconcile::list::reconcile_members(ctx, partial, change)
    }
}

/// A list member whose rendered markup includes its own wrapper element.
#[derive(Debug, Default)]
pub struct ListItemType;

impl PartialType for ListItemType {
    fn name(&self) -> &str {
        "list_item"
    }

    fn prepare(&self, id: &str, descriptor: &mut PartialDescriptor) -> Result<()> {
        let member = bracketed(id, "list_item").ok_or_else(|| {
            RefreshError::Validation(format!("illegal id for list_item partial: {id}"))
        })?;
        descriptor
            .params
            .insert("member_id".to_owned(), Value::String(member.to_owned()));
        if descriptor.selector.is_none() {
            descriptor.selector = Some(placement::id_selector(id));
        }
        descriptor.container_inclusive.get_or_insert(true);
        Ok(())
    }

    fn claims_setting(&self, setting_id: &str) -> bool {
        bracketed(setting_id, "list_item").is_some()
    }
}

/// A navigation menu; its placements carry signed contexts emitted by the
/// authority.
#[derive(Debug, Default)]
pub struct MenuType;

/// Selector shared by every menu container.
pub const MENU_CONTAINER_SELECTOR: &str = r#"[data-menu-container="true"]"#;

/// Integer view of a JSON number or numeric string.
fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn menu_id(partial: &Partial) -> Option<i64> {
    partial.param_str("menu_id").and_then(|s| s.parse().ok())
}

impl PartialType for MenuType {
    fn name(&self) -> &str {
        "menu"
    }

    fn prepare(&self, id: &str, descriptor: &mut PartialDescriptor) -> Result<()> {
        let menu_id = bracketed(id, "menu")
            .and_then(|n| n.parse::<i64>().ok())
            .ok_or_else(|| RefreshError::Validation(format!("illegal id for menu partial: {id}")))?;
        descriptor
            .params
            .insert("menu_id".to_owned(), Value::String(menu_id.to_string()));
        if descriptor.selector.is_none() {
            descriptor.selector = Some(MENU_CONTAINER_SELECTOR.to_owned());
        }
        Ok(())
    }

    fn is_related(&self, partial: &Partial, change: &SettingChange) -> bool {
        if partial.is_related_setting(&change.id) {
            return true;
        }
        let Some(n) = menu_id(partial) else {
            return false;
        };
        let values = std::iter::once(&change.value).chain(change.old.as_ref());
        if bracketed(&change.id, "menu_item").is_some() {
            return values
                .filter_map(|v| v.get("menu_id"))
                .any(|v| as_int(v) == Some(n));
        }
        if bracketed(&change.id, "menu_location").is_some() {
            return values.into_iter().any(|v| as_int(v) == Some(n));
        }
        false
    }

    fn claims_setting(&self, setting_id: &str) -> bool {
        bracketed(setting_id, "menu_location").is_some()
    }

    fn placements(
        &self,
        partial: &Partial,
        doc: &Document,
        settings: &dyn SettingsStore,
    ) -> Result<Vec<Placement>> {
        let Some(n) = menu_id(partial) else {
            return Ok(Vec::new());
        };
        Ok(placement::selector_placements(doc, partial.id(), &partial.selector())?
            .into_iter()
            .filter(|p| {
                let Some(context) = &p.context else {
                    return false;
                };
                if context.get("menu_id").and_then(as_int) == Some(n) {
                    return true;
                }
                context
                    .get("location")
                    .and_then(Value::as_str)
                    .and_then(|loc| settings.get(&format!("menu_location[{loc}]")))
                    .and_then(|v| as_int(&v))
                    == Some(n)
            })
            .collect())
    }
}

/// Registration table mapping type names to implementations.
pub struct KindTable {
    kinds: RwLock<HashMap<String, Arc<dyn PartialType>>>,
}

impl KindTable {
    /// A table holding only `default`.
    #[must_use]
    pub fn new() -> Self {
        let table = Self {
            kinds: RwLock::new(HashMap::new()),
        };
        table.register(Arc::new(DefaultType));
        table
    }

    /// A table holding every built-in type.
    #[must_use]
    pub fn with_builtins() -> Self {
        let table = Self::new();
        table.register(Arc::new(ListType));
        table.register(Arc::new(ListItemType));
        table.register(Arc::new(MenuType));
        table
    }

    /// Add or replace a type.
    pub fn register(&self, kind: Arc<dyn PartialType>) {
        self.kinds
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind.name().to_owned(), kind);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PartialType>> {
        self.kinds
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Look up a type, falling back to `default` for unknown names.
    pub fn resolve(&self, name: Option<&str>) -> Arc<dyn PartialType> {
        let name = name.unwrap_or("default");
        if let Some(kind) = self.get(name) {
            return kind;
        }
        warn!(kind = name, "unknown partial type, using default");
        self.get("default")
            .unwrap_or_else(|| Arc::new(DefaultType) as Arc<dyn PartialType>)
    }

    /// Whether any type claims the setting.
    pub fn claims(&self, setting_id: &str) -> bool {
        self.kinds
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|k| k.claims_setting(setting_id))
    }
}

impl Default for KindTable {
    fn default() -> Self {
        Self::with_builtins()
    }
}
