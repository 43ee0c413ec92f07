//! Owned, mutable preview document.
//!
//! The preview's live DOM is the source of truth for where partials are
//! placed. It is a `scraper::Html` tree: queries go through
//! `scraper::Selector`, serialization through html5ever, and mutations
//! through the underlying `ego_tree` nodes. Detached nodes stay in the tree
//! as orphans until the document is dropped, so node ids are never reused.

use crate::error::{RefreshError, Result};
use ego_tree::NodeRef;
use html5ever::tendril::StrTendril;
use html5ever::{Attribute, LocalName, Namespace, QualName};
use scraper::node::Element;
use scraper::{ElementRef, Html, Node, Selector};

pub use ego_tree::NodeId;

const HTML_NAMESPACE: &str = "http://www.w3.org/1999/xhtml";

/// A parsed HTML document that the reconciler can mutate in place.
#[derive(Debug, Clone)]
pub struct Document {
    html: Html,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Create an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self {
            html: Html::new_document(),
        }
    }

    /// Parse a full HTML document.
    #[must_use]
    pub fn parse(html: &str) -> Self {
        Self {
            html: Html::parse_document(html),
        }
    }

    /// Parse markup into detached top-level nodes owned by this document.
    pub fn parse_fragment(&mut self, markup: &str) -> Vec<NodeId> {
        let fragment = Html::parse_fragment(markup);
        let root = self.html.tree.extend_tree(fragment.tree).id();
        // html5ever parses fragments inside an implicit <html> element.
        let top_level: Vec<NodeId> = self
            .node(root)
            .and_then(|r| r.children().find(|c| c.value().is_element()))
            .map(|wrapper| wrapper.children().map(|c| c.id()).collect())
            .unwrap_or_default();
        for id in &top_level {
            self.detach(*id);
        }
        top_level
    }

    fn node(&self, id: NodeId) -> Option<NodeRef<'_, Node>> {
        self.html.tree.get(id)
    }

    /// The document root.
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.html.tree.root().id()
    }

    /// Create a detached element.
    pub fn create_element<I>(&mut self, name: &str, attrs: I) -> NodeId
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let name = QualName::new(
            None,
            Namespace::from(HTML_NAMESPACE),
            LocalName::from(name.to_ascii_lowercase().as_str()),
        );
        let attrs = attrs
            .into_iter()
            .map(|(k, v)| attribute(&k, StrTendril::from(v)))
            .collect();
        self.html
            .tree
            .orphan(Node::Element(Element::new(name, attrs)))
            .id()
    }

    /// Whether the node is an element.
    #[must_use]
    pub fn is_element(&self, id: NodeId) -> bool {
        self.node(id).is_some_and(|n| n.value().is_element())
    }

    /// Attribute value on an element node.
    #[must_use]
    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.node(id)?.value().as_element()?.attr(name)
    }

    /// Set (or replace) an attribute on an element node.
    pub fn set_attr(&mut self, id: NodeId, name: &str, value: impl Into<String>) {
        let Some(mut node) = self.html.tree.get_mut(id) else {
            return;
        };
        let Node::Element(el) = node.value() else {
            return;
        };
        // Rebuilt rather than edited in place: `Element` caches its id and
        // classes on first use.
        let mut attrs: Vec<Attribute> = el
            .attrs
            .iter()
            .filter(|(k, _)| k.local.as_ref() != name)
            .map(|(k, v)| Attribute {
                name: k.clone(),
                value: StrTendril::from_slice(v),
            })
            .collect();
        attrs.push(attribute(name, StrTendril::from(value.into())));
        *el = Element::new(el.name.clone(), attrs);
    }

    /// Parent node.
    #[must_use]
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id)?.parent().map(|p| p.id())
    }

    /// Whether the node is reachable from the root.
    #[must_use]
    pub fn is_attached(&self, id: NodeId) -> bool {
        let root = self.root();
        self.node(id)
            .is_some_and(|n| n.id() == root || n.ancestors().any(|a| a.id() == root))
    }

    /// Detach a node (and its subtree) from its parent.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(mut node) = self.html.tree.get_mut(id) {
            node.detach();
        }
    }

    /// Append `child` as the last child of `parent`, moving it if attached.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        if parent == child || self.node(child).is_none() {
            return;
        }
        if let Some(mut node) = self.html.tree.get_mut(parent) {
            node.append_id(child);
        }
    }

    /// Insert `node` immediately before `reference`, moving it if attached.
    /// Returns `false` when `reference` has no parent.
    pub fn insert_before(&mut self, reference: NodeId, node: NodeId) -> bool {
        if node == reference {
            return true;
        }
        if self.parent(reference).is_none() || self.node(node).is_none() {
            return false;
        }
        match self.html.tree.get_mut(reference) {
            Some(mut anchor) => {
                anchor.insert_id_before(node);
                true
            }
            None => false,
        }
    }

    /// Replace the children of `id` with parsed markup. Returns the new
    /// top-level nodes.
    pub fn set_inner_html(&mut self, id: NodeId, html: &str) -> Vec<NodeId> {
        let old: Vec<NodeId> = self
            .node(id)
            .map(|n| n.children().map(|c| c.id()).collect())
            .unwrap_or_default();
        for child in old {
            self.detach(child);
        }
        let fresh = self.parse_fragment(html);
        for node in &fresh {
            self.append_child(id, *node);
        }
        fresh
    }

    /// Replace `id` itself with parsed markup. Returns the new top-level nodes,
    /// or an empty list when `id` is detached.
    pub fn replace_with_html(&mut self, id: NodeId, html: &str) -> Vec<NodeId> {
        if self.parent(id).is_none() {
            return Vec::new();
        }
        let fresh = self.parse_fragment(html);
        for node in &fresh {
            self.insert_before(id, *node);
        }
        self.detach(id);
        fresh
    }

    /// Siblings strictly between two nodes sharing a parent, in order.
    #[must_use]
    pub fn siblings_between(&self, start: NodeId, end: NodeId) -> Vec<NodeId> {
        let (Some(first), Some(last)) = (self.node(start), self.node(end)) else {
            return Vec::new();
        };
        let parent = first.parent().map(|p| p.id());
        if parent.is_none() || parent != last.parent().map(|p| p.id()) {
            return Vec::new();
        }
        let mut between = Vec::new();
        for sibling in first.next_siblings() {
            if sibling.id() == end {
                return between;
            }
            between.push(sibling.id());
        }
        Vec::new()
    }

    /// Attached elements matching a CSS selector, in document order.
    ///
    /// # Errors
    ///
    /// Returns [`RefreshError::Document`] when the selector does not parse.
    pub fn select(&self, selector: &str) -> Result<Vec<NodeId>> {
        let parsed = Selector::parse(selector)
            .map_err(|e| RefreshError::Document(format!("invalid selector {selector:?}: {e}")))?;
        Ok(self
            .html
            .tree
            .root()
            .descendants()
            .filter_map(ElementRef::wrap)
            .filter(|el| parsed.matches(el))
            .map(|el| el.id())
            .collect())
    }

    /// Attached comment nodes in document order.
    #[must_use]
    pub fn comments(&self) -> Vec<(NodeId, &str)> {
        self.html
            .tree
            .root()
            .descendants()
            .filter_map(|n| n.value().as_comment().map(|c| (n.id(), &**c)))
            .collect()
    }

    /// Concatenated text below a node.
    #[must_use]
    pub fn text_content(&self, id: NodeId) -> String {
        self.node(id)
            .and_then(ElementRef::wrap)
            .map(|el| el.text().collect())
            .unwrap_or_default()
    }

    /// Serialized children of an element.
    #[must_use]
    pub fn inner_html(&self, id: NodeId) -> String {
        self.node(id)
            .and_then(ElementRef::wrap)
            .map(|el| el.inner_html())
            .unwrap_or_default()
    }

    /// Serialized element including itself.
    #[must_use]
    pub fn outer_html(&self, id: NodeId) -> String {
        self.node(id)
            .and_then(ElementRef::wrap)
            .map(|el| el.html())
            .unwrap_or_default()
    }

    /// Serialized document.
    #[must_use]
    pub fn to_html(&self) -> String {
        self.html.html()
    }
}

fn attribute(name: &str, value: StrTendril) -> Attribute {
    Attribute {
        name: QualName::new(None, Namespace::from(""), LocalName::from(name)),
        value,
    }
}

/// Escape a string for inclusion in markup text or a quoted attribute.
#[must_use]
pub fn escape_html(raw: &str) -> String {
    v_htmlescape::escape(raw).to_string()
}
