//! Member reconciliation for marker-addressed list partials.
//!
//! Each list invocation on the page is a region between
//! `list_before:<id>:<n>` and `list_after:<id>:<n>` comments. When the
//! list's setting changes, every region is brought in line with the new
//! member order independently: dropped members are removed, missing ones get
//! a fresh container built from the list's wrapper templates, and only the
//! containers that are out of order are moved.

use super::Notice;
use crate::document::{Document, NodeId};
use crate::partial::kinds::{ChangeAction, ChangeContext, LIST_MARKER};
use crate::partial::{Partial, PartialDescriptor, bracketed};
use crate::placement::{self, ATTR_CONTEXT, ATTR_ID, ATTR_TYPE, MarkerPair};
use crate::settings::SettingChange;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Member ids held by a list setting value.
#[must_use]
pub fn member_ids(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

/// Member containers directly inside a region, in document order.
#[must_use]
pub fn member_containers(doc: &Document, region: &MarkerPair) -> Vec<(String, NodeId)> {
    doc.siblings_between(region.start, region.end)
        .into_iter()
        .filter_map(|node| {
            let member = bracketed(doc.attr(node, ATTR_ID)?, "list_item")?;
            Some((member.to_owned(), node))
        })
        .collect()
}

/// Reconcile every invocation of `partial`'s list against a change to its
/// member setting. Newly created member partials are returned for refresh.
pub fn reconcile_members(
    ctx: &mut ChangeContext<'_>,
    partial: &Arc<Partial>,
    change: &SettingChange,
) -> ChangeAction {
    let new_ids = member_ids(&change.value);
    let old_ids = change.old.as_ref().map(member_ids).unwrap_or_default();
    if new_ids.is_empty() != old_ids.is_empty() {
        return ChangeAction::FullRefresh(format!(
            "{} changed between empty and non-empty",
            partial.id()
        ));
    }
    let Some(list_id) = partial.param_str("list_id") else {
        return ChangeAction::Refresh;
    };
    let member_before = partial.param_str("member_before").unwrap_or_default();
    let member_after = partial.param_str("member_after").unwrap_or_default();

    let mut created = Vec::new();
    let mut seen = HashSet::new();
    for region in placement::marker_pairs(ctx.doc, LIST_MARKER, &list_id) {
        for (member, node) in member_containers(ctx.doc, &region) {
            if !new_ids.contains(&member) {
                debug!(list_id = %list_id, member = %member, "removing member container");
                ctx.doc.detach(node);
            }
        }

        let present: HashSet<String> = member_containers(ctx.doc, &region)
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        for member in new_ids.iter().filter(|m| !present.contains(*m)) {
            let html = format!(
                "{}{}",
                member_before
                    .replace("%1$s", member)
                    .replace("%2$s", "list-item"),
                member_after
            );
            insert_member(ctx.doc, &region, &list_id, member, &html);
            let partial_id = format!("list_item[{member}]");
            match ctx
                .registry
                .register(&partial_id, PartialDescriptor::of_kind("list_item"))
            {
                Ok(member_partial) => {
                    if seen.insert(partial_id) {
                        created.push(member_partial);
                    }
                }
                Err(e) => warn!(partial_id = %partial_id, error = %e, "cannot register list member"),
            }
        }

        reorder(ctx.doc, &region, &new_ids, ctx.notices);
    }
    ChangeAction::Delegate(created)
}

/// Build an empty member container and insert it before the region's end
/// marker.
fn insert_member(doc: &mut Document, region: &MarkerPair, list_id: &str, member: &str, html: &str) {
    let el = doc
        .parse_fragment(html)
        .into_iter()
        .find(|n| doc.is_element(*n))
        .unwrap_or_else(|| doc.create_element("div", std::iter::empty::<(String, String)>()));
    doc.set_attr(el, ATTR_ID, format!("list_item[{member}]"));
    doc.set_attr(el, ATTR_TYPE, "list_item");
    doc.set_attr(
        el,
        ATTR_CONTEXT,
        json!({"list_id": list_id, "instance_number": region.instance_number}).to_string(),
    );
    doc.insert_before(region.end, el);
}

/// Move only the containers outside the longest run already in order.
fn reorder(doc: &mut Document, region: &MarkerPair, order: &[String], notices: &mut Vec<Notice>) {
    let current = member_containers(doc, region);
    let rank = |member: &str| order.iter().position(|m| m == member);
    let ranks: Vec<usize> = current.iter().filter_map(|(m, _)| rank(m)).collect();
    let ranked: Vec<&(String, NodeId)> = current.iter().filter(|(m, _)| rank(m).is_some()).collect();
    let keep: HashSet<NodeId> = longest_increasing_subsequence(&ranks)
        .into_iter()
        .map(|i| ranked[i].1)
        .collect();

    let mut anchor = region.end;
    for member in order.iter().rev() {
        let Some((_, node)) = ranked.iter().find(|(m, _)| m == member) else {
            continue;
        };
        if !keep.contains(node) {
            doc.insert_before(anchor, *node);
            notices.push(Notice::ContentMoved {
                partial_id: format!("list_item[{member}]"),
                node: *node,
            });
        }
        anchor = *node;
    }
}

/// Indices of one longest strictly increasing subsequence.
fn longest_increasing_subsequence(seq: &[usize]) -> Vec<usize> {
    // tails[k]: index of the smallest tail of an increasing run of length k+1
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; seq.len()];
    for (i, &value) in seq.iter().enumerate() {
        let k = tails.partition_point(|&t| seq[t] < value);
        prev[i] = k.checked_sub(1).map(|j| tails[j]);
        if k == tails.len() {
            tails.push(i);
        } else {
            tails[k] = i;
        }
    }
    let mut out = Vec::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        out.push(i);
        cursor = prev[i];
    }
    out.reverse();
    out
}
