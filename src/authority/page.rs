//! Helpers for the authority's normal (non-preview) page render.
//!
//! Emits what the preview later relies on: numbered list boundary markers,
//! placement attributes, and signed structural contexts.

use crate::document::escape_html;
use crate::partial::kinds::LIST_MARKER;
use crate::placement::{ATTR_CONTEXT, ATTR_ID, ATTR_TYPE};
use crate::signature::ContextSigner;
use serde_json::{Value, json};
use std::collections::HashMap;

/// Per-page emission state.
#[derive(Debug)]
pub struct PageEmitter {
    signer: ContextSigner,
    list_instances: HashMap<String, u32>,
}

impl PageEmitter {
    #[must_use]
    pub fn new(signer: ContextSigner) -> Self {
        Self {
            signer,
            list_instances: HashMap::new(),
        }
    }

    /// Opening marker for the next invocation of a list on this page.
    pub fn list_start(&mut self, list_id: &str) -> String {
        let n = self.list_instances.entry(list_id.to_owned()).or_insert(0);
        *n += 1;
        format!("<!--{LIST_MARKER}_before:{list_id}:{n}-->")
    }

    /// Closing marker for the current invocation of a list.
    #[must_use]
    pub fn list_end(&self, list_id: &str) -> String {
        let n = self.instance_number(list_id);
        format!("<!--{LIST_MARKER}_after:{list_id}:{n}-->")
    }

    /// Invocations of a list emitted so far.
    #[must_use]
    pub fn instance_number(&self, list_id: &str) -> u32 {
        self.list_instances.get(list_id).copied().unwrap_or(0)
    }

    /// Context for a member rendered inside the current list invocation.
    #[must_use]
    pub fn member_context(&self, list_id: &str) -> Value {
        json!({
            "list_id": list_id,
            "instance_number": self.instance_number(list_id),
        })
    }

    /// Placement attributes carrying an unsigned context.
    #[must_use]
    pub fn placement_attrs(partial_id: &str, kind: Option<&str>, context: Option<&Value>) -> String {
        let mut out = format!(" {ATTR_ID}=\"{}\"", escape_html(partial_id));
        if let Some(kind) = kind {
            out.push_str(&format!(" {ATTR_TYPE}=\"{}\"", escape_html(kind)));
        }
        if let Some(context) = context {
            out.push_str(&format!(
                " {ATTR_CONTEXT}=\"{}\"",
                escape_html(&context.to_string())
            ));
        }
        out
    }

    /// Placement attributes carrying a signed context.
    #[must_use]
    pub fn signed_placement_attrs(
        &self,
        partial_id: &str,
        kind: Option<&str>,
        context: &Value,
    ) -> String {
        Self::placement_attrs(partial_id, kind, Some(&self.signer.sign(context)))
    }

    /// Attributes for a menu container; the context is signed.
    #[must_use]
    pub fn menu_container_attrs(&self, menu_id: i64, context: &Value) -> String {
        let mut context = context.clone();
        if let Value::Object(map) = &mut context {
            map.entry("menu_id").or_insert(json!(menu_id));
        }
        format!(
            " data-menu-container=\"true\"{}",
            self.signed_placement_attrs(&format!("menu[{menu_id}]"), Some("menu"), &context)
        )
    }
}
