//! Applies rendered content to placements in the live document.

pub mod list;

use crate::document::{Document, NodeId};
use crate::error::{ErrorCode, RefreshError, Result};
use crate::partial::Partial;
use crate::placement::{ATTR_CONTEXT, ATTR_ID, ATTR_TYPE, Anchor, Placement};
use serde_json::Value;
use tracing::debug;

/// Rendered output paired with the placement it was requested for.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPlacement {
    pub placement: Placement,
    pub content: Option<String>,
    pub error: Option<ErrorCode>,
}

/// Notifications emitted while mutating the document.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// A placement's region was replaced.
    ContentRendered {
        partial_id: String,
        context: Option<Value>,
        /// The container before the update.
        old_container: Option<NodeId>,
        /// The container after the update; differs from `old_container`
        /// for container-inclusive partials.
        container: Option<NodeId>,
        /// Top-level nodes inserted.
        nodes: Vec<NodeId>,
    },
    /// A list member container changed position.
    ContentMoved { partial_id: String, node: NodeId },
}

impl Notice {
    pub fn partial_id(&self) -> &str {
        match self {
            Self::ContentRendered { partial_id, .. } | Self::ContentMoved { partial_id, .. } => {
                partial_id
            }
        }
    }
}

fn check(doc: &Document, partial: &Partial, rendered: &RenderedPlacement) -> Result<()> {
    if !rendered.placement.is_resolvable(doc) {
        return Err(RefreshError::MissingContainer(partial.id().to_owned()));
    }
    if let Some(code) = rendered.error {
        return Err(RefreshError::from_code(partial.id(), code));
    }
    if rendered.content.is_none() {
        return Err(RefreshError::Render {
            partial: partial.id().to_owned(),
            code: ErrorCode::RenderFailed,
        });
    }
    Ok(())
}

/// Apply every rendered placement of one partial.
///
/// All pairs are checked before anything is mutated, so a failure leaves
/// the partial's regions untouched.
///
/// # Errors
///
/// Returns the first unresolvable container or failed render.
pub fn apply_rendered(
    doc: &mut Document,
    partial: &Partial,
    rendered: &[RenderedPlacement],
) -> Result<Vec<Notice>> {
    for r in rendered {
        check(doc, partial, r)?;
    }
    let inclusive = partial.container_inclusive();
    let mut notices = Vec::with_capacity(rendered.len());
    for r in rendered {
        let content = r.content.as_deref().unwrap_or_default();
        let notice = match r.placement.anchor {
            Anchor::Element(el) if inclusive => replace_container(doc, partial, r, el, content),
            Anchor::Element(el) => {
                let nodes = doc.set_inner_html(el, content);
                Notice::ContentRendered {
                    partial_id: partial.id().to_owned(),
                    context: r.placement.context.clone(),
                    old_container: Some(el),
                    container: Some(el),
                    nodes,
                }
            }
            Anchor::Markers { start, end } => {
                for node in doc.siblings_between(start, end) {
                    doc.detach(node);
                }
                let nodes = doc.parse_fragment(content);
                for node in &nodes {
                    doc.insert_before(end, *node);
                }
                Notice::ContentRendered {
                    partial_id: partial.id().to_owned(),
                    context: r.placement.context.clone(),
                    old_container: None,
                    container: None,
                    nodes,
                }
            }
        };
        notices.push(notice);
    }
    debug!(partial_id = partial.id(), placements = rendered.len(), "applied rendered content");
    Ok(notices)
}

/// Replace the container element itself, carrying over the attributes
/// later lookups depend on.
fn replace_container(
    doc: &mut Document,
    partial: &Partial,
    rendered: &RenderedPlacement,
    el: NodeId,
    content: &str,
) -> Notice {
    let carried: Vec<(&str, String)> = [ATTR_ID, ATTR_TYPE, ATTR_CONTEXT]
        .into_iter()
        .filter_map(|name| doc.attr(el, name).map(|v| (name, v.to_owned())))
        .collect();
    let nodes = doc.replace_with_html(el, content);
    let container = nodes.iter().copied().find(|n| doc.is_element(*n));
    if let Some(new_el) = container {
        for (name, value) in carried {
            if doc.attr(new_el, name).is_none() {
                doc.set_attr(new_el, name, value);
            }
        }
        if doc.attr(new_el, ATTR_ID).is_none() {
            doc.set_attr(new_el, ATTR_ID, partial.id());
        }
    }
    Notice::ContentRendered {
        partial_id: partial.id().to_owned(),
        context: rendered.placement.context.clone(),
        old_container: Some(el),
        container,
        nodes,
    }
}
