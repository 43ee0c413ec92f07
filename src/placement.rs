//! Placements: where a partial currently lives in the preview document.
//!
//! Placements are recomputed from the document on every pass and never cached
//! across mutations.

use crate::document::{Document, NodeId};
use crate::error::Result;
use serde_json::Value;
use tracing::warn;

/// Attribute naming the partial an element hosts.
pub const ATTR_ID: &str = "data-partial-id";
/// Attribute naming the partial's type.
pub const ATTR_TYPE: &str = "data-partial-type";
/// Attribute carrying the related setting ids as a JSON array.
pub const ATTR_SETTINGS: &str = "data-partial-settings";
/// Attribute carrying the placement's context as JSON.
pub const ATTR_CONTEXT: &str = "data-partial-context";

/// How a placement is anchored in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// A container element.
    Element(NodeId),
    /// A region bracketed by two sibling boundary comments.
    Markers { start: NodeId, end: NodeId },
}

/// One concrete location hosting a partial's output.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub partial_id: String,
    pub anchor: Anchor,
    /// Structural context sent back to the authority.
    pub context: Option<Value>,
    /// Disambiguates repeated invocations of a marker-addressed region.
    pub instance_number: Option<u32>,
}

impl Placement {
    /// Whether the anchor is still attached to the document.
    #[must_use]
    pub fn is_resolvable(&self, doc: &Document) -> bool {
        match self.anchor {
            Anchor::Element(el) => doc.is_attached(el),
            Anchor::Markers { start, end } => {
                doc.is_attached(start)
                    && doc.is_attached(end)
                    && doc.parent(start) == doc.parent(end)
            }
        }
    }

    /// The container element, for element-anchored placements.
    #[must_use]
    pub fn element(&self) -> Option<NodeId> {
        match self.anchor {
            Anchor::Element(el) => Some(el),
            Anchor::Markers { .. } => None,
        }
    }
}

/// Parse an element's `data-partial-context` attribute.
pub fn element_context(doc: &Document, el: NodeId) -> Option<Value> {
    let raw = doc.attr(el, ATTR_CONTEXT)?;
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "ignoring unparsable placement context");
            None
        }
    }
}

/// Selector addressing the elements that declare `partial_id`.
#[must_use]
pub fn id_selector(partial_id: &str) -> String {
    format!("[{ATTR_ID}=\"{partial_id}\"]")
}

/// Selector-addressed placements for a partial.
///
/// # Errors
///
/// Returns [`RefreshError::Document`] when the selector does not parse.
pub fn selector_placements(doc: &Document, partial_id: &str, selector: &str) -> Result<Vec<Placement>> {
    let nodes = doc.select(selector).inspect_err(|e| {
        warn!(partial_id, error = %e, "bad partial selector");
    })?;
    Ok(nodes
        .into_iter()
        .map(|el| Placement {
            partial_id: partial_id.to_owned(),
            anchor: Anchor::Element(el),
            context: element_context(doc, el),
            instance_number: None,
        })
        .collect())
}

/// A pair of boundary comments `<prefix>_before:<id>:<n>` / `<prefix>_after:<id>:<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerPair {
    pub instance_number: u32,
    pub start: NodeId,
    pub end: NodeId,
}

/// Find every complete marker pair for `region_id`, in document order.
///
/// Unmatched markers are ignored.
#[must_use]
pub fn marker_pairs(doc: &Document, prefix: &str, region_id: &str) -> Vec<MarkerPair> {
    let before = format!("{prefix}_before:{region_id}:");
    let after = format!("{prefix}_after:{region_id}:");
    let comments = doc.comments();
    let mut pairs = Vec::new();
    for (start, text) in &comments {
        let Some(n) = text.trim().strip_prefix(&before) else {
            continue;
        };
        let Ok(instance_number) = n.parse::<u32>() else {
            continue;
        };
        let end_text = format!("{after}{instance_number}");
        if let Some((end, _)) = comments
            .iter()
            .find(|(id, t)| t.trim() == end_text && doc.parent(*id) == doc.parent(*start))
        {
            pairs.push(MarkerPair {
                instance_number,
                start: *start,
                end: *end,
            });
        }
    }
    pairs
}
