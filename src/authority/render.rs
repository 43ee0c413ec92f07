//! Renderer implementations the authority dispatches to.

use super::{PreviewState, RenderCall, RenderOutcome, Renderer};
use crate::document::escape_html;
use crate::error::ErrorCode;
use crate::partial::bracketed;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Renderer backed by a closure.
pub struct CallbackRenderer<F> {
    render: F,
    signed: bool,
}

impl<F> CallbackRenderer<F>
where
    F: Fn(&RenderCall<'_>) -> RenderOutcome + Send + Sync,
{
    pub fn new(render: F) -> Self {
        Self {
            render,
            signed: false,
        }
    }

    /// Require contexts to carry a valid signature.
    #[must_use]
    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }
}

impl<F> Renderer for CallbackRenderer<F>
where
    F: Fn(&RenderCall<'_>) -> RenderOutcome + Send + Sync,
{
    fn requires_signed_context(&self) -> bool {
        self.signed
    }

    fn render(&self, call: &RenderCall<'_>) -> RenderOutcome {
        (self.render)(call)
    }
}

/// Markup with `{{setting_id}}` placeholders filled from the preview state.
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    template: String,
}

impl TemplateRenderer {
    #[must_use]
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Fill every placeholder. Unknown settings render empty.
    #[must_use]
    pub fn fill(&self, state: &PreviewState<'_>) -> String {
        let mut out = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();
        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            let Some(close) = after.find("}}") else {
                out.push_str(&rest[open..]);
                return out;
            };
            let id = after[..close].trim();
            out.push_str(&escape_html(&display_value(state.get(id).as_ref())));
            rest = &after[close + 2..];
        }
        out.push_str(rest);
        out
    }
}

fn display_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

impl Renderer for TemplateRenderer {
    fn render(&self, call: &RenderCall<'_>) -> RenderOutcome {
        Ok(Some(self.fill(call.state)))
    }
}

/// Wraps a list member renderer, checking client-derived contexts against
/// the authority's own view of the lists.
///
/// A `list_item[<member>]` context names `list_id`; the member must appear
/// in the preview value of setting `list[<list_id>]`.
pub struct ListMemberRenderer {
    inner: Arc<dyn Renderer>,
}

impl ListMemberRenderer {
    #[must_use]
    pub fn new(inner: Arc<dyn Renderer>) -> Self {
        Self { inner }
    }
}

impl Renderer for ListMemberRenderer {
    fn render(&self, call: &RenderCall<'_>) -> RenderOutcome {
        if let Some(context) = call.context {
            let member = bracketed(&call.partial.id, "list_item").ok_or(ErrorCode::UnknownPartial)?;
            let list_id = context
                .get("list_id")
                .and_then(Value::as_str)
                .ok_or(ErrorCode::MissingContainer)?;
            let listed = call
                .state
                .get(&format!("list[{list_id}]"))
                .and_then(|v| v.as_array().cloned())
                .is_some_and(|members| members.iter().any(|m| m.as_str() == Some(member)));
            if !listed {
                debug!(member, list_id, "member is not in the named list");
                return Err(ErrorCode::MissingContainer);
            }
        }
        self.inner.render(call)
    }
}
