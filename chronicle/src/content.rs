//! The canonical rich-document model. A document's content is a
//! ProseMirror-shaped JSON tree (`doc`) plus a derived legacy projection
//! (title, subtitle, purpose, tiers, enforce) kept for indexing, compare and
//! compatibility reads. When `doc` is present it is the source of truth and
//! the legacy fields are derived from it; when absent, the legacy fields
//! drive the content.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Content payload carried by every commit.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    /// Canonical rich-document tree: `{ "type": "doc", "content": [...] }`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub tiers: String,
    #[serde(default)]
    pub enforce: String,
}

impl Content {
    /// Compute the next content from an incoming payload over the current
    /// head. A present canonical `doc` wins and the legacy projection is
    /// derived from it, with blanks filled from head; without a `doc` the
    /// incoming legacy fields drive, again filling blanks from head.
    pub fn next(incoming: &Content, head: &Content) -> Content {
        if let Some(doc) = incoming.doc.clone().and_then(normalize) {
            let mut next = derive(&doc, head);
            next.doc = Some(doc);
            return next;
        }
        let mut next = head.clone();
        for (theirs, ours) in [
            (&incoming.title, &mut next.title),
            (&incoming.subtitle, &mut next.subtitle),
            (&incoming.purpose, &mut next.purpose),
            (&incoming.tiers, &mut next.tiers),
            (&incoming.enforce, &mut next.enforce),
        ] {
            if !theirs.is_empty() {
                *ours = theirs.clone();
            }
        }
        next
    }

    /// Structural inequality: a commit happens only when any of the legacy
    /// fields or the canonical doc differs from head.
    pub fn differs(&self, other: &Content) -> bool {
        if self.title != other.title
            || self.subtitle != other.subtitle
            || self.purpose != other.purpose
            || self.tiers != other.tiers
            || self.enforce != other.enforce
        {
            return true;
        }
        canonical_json(self.doc.as_ref()) != canonical_json(other.doc.as_ref())
    }
}

/// Canonicalize an incoming doc through a JSON round-trip. Anything that is
/// not a `{"type": "doc"}` object yields `None` and the write falls back to
/// the legacy fields.
pub fn normalize(doc: Value) -> Option<Value> {
    if doc.get("type").and_then(Value::as_str) != Some("doc") {
        return None;
    }
    let raw = serde_json::to_string(&doc).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Derive the legacy projection from a canonical doc. Walks the top-level
/// content: an H1 fills `title`; the first paragraph after it fills
/// `subtitle` when empty; each H2 whose text mentions "purpose", "tier" or
/// "enforce" binds to the following paragraph. Missing sections retain the
/// value they had in `previous`.
pub fn derive(doc: &Value, previous: &Content) -> Content {
    let mut next = previous.clone();
    next.doc = None;

    let Some(nodes) = doc.get("content").and_then(Value::as_array) else {
        return next;
    };
    let mut titled = false;

    for (ix, node) in nodes.iter().enumerate() {
        match (node_type(node), heading_level(node)) {
            ("heading", 1) if !titled => {
                titled = true;
                next.title = text_of(node);

                if next.subtitle.is_empty() {
                    if let Some(para) = following_paragraph(nodes, ix) {
                        next.subtitle = text_of(para);
                    }
                }
            }
            ("heading", 2) => {
                let heading = text_of(node).to_lowercase();
                let Some(para) = following_paragraph(nodes, ix) else {
                    continue;
                };
                if heading.contains("purpose") {
                    next.purpose = text_of(para);
                } else if heading.contains("tier") {
                    next.tiers = text_of(para);
                } else if heading.contains("enforce") {
                    next.enforce = text_of(para);
                }
            }
            _ => {}
        }
    }
    next
}

/// Collect every `attrs.nodeId` in the tree. Drives orphan detection.
pub fn node_ids(doc: &Value) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    collect_node_ids(doc, &mut ids);
    ids
}

/// Concatenated text of a node's leaves.
pub fn text_of(node: &Value) -> String {
    let mut out = String::new();
    collect_text(node, &mut out);
    out
}

fn canonical_json(doc: Option<&Value>) -> Option<String> {
    doc.and_then(|d| serde_json::to_string(d).ok())
}

fn node_type(node: &Value) -> &str {
    node.get("type").and_then(Value::as_str).unwrap_or_default()
}

fn heading_level(node: &Value) -> u64 {
    node.get("attrs")
        .and_then(|a| a.get("level"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// The first paragraph after `ix`, stopping at the next heading.
fn following_paragraph(nodes: &[Value], ix: usize) -> Option<&Value> {
    for node in &nodes[ix + 1..] {
        match node_type(node) {
            "paragraph" => return Some(node),
            "heading" => return None,
            _ => {}
        }
    }
    None
}

fn collect_node_ids(node: &Value, ids: &mut BTreeSet<String>) {
    if let Some(id) = node
        .get("attrs")
        .and_then(|a| a.get("nodeId"))
        .and_then(Value::as_str)
    {
        if !id.is_empty() {
            ids.insert(id.to_owned());
        }
    }
    if let Some(children) = node.get("content").and_then(Value::as_array) {
        for child in children {
            collect_node_ids(child, ids);
        }
    }
}

fn collect_text(node: &Value, out: &mut String) {
    if let Some(text) = node.get("text").and_then(Value::as_str) {
        out.push_str(text);
    }
    if let Some(children) = node.get("content").and_then(Value::as_array) {
        for child in children {
            collect_text(child, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::fixtures::{doc, heading, paragraph};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_derivation() {
        let doc = doc(vec![
            heading(1, "n-1", "Access Control ADR"),
            paragraph("n-2", "A short summary."),
            heading(2, "n-3", "Purpose"),
            paragraph("n-4", "Why this exists."),
            heading(2, "n-5", "Service tiers"),
            paragraph("n-6", "Gold and silver."),
            heading(2, "n-7", "Enforcement"),
            paragraph("n-8", "At the gateway."),
        ]);
        let derived = derive(&doc, &Content::default());

        assert_eq!(derived.title, "Access Control ADR");
        assert_eq!(derived.subtitle, "A short summary.");
        assert_eq!(derived.purpose, "Why this exists.");
        assert_eq!(derived.tiers, "Gold and silver.");
        assert_eq!(derived.enforce, "At the gateway.");
    }

    #[test]
    fn test_derivation_retains_previous_sections() {
        let previous = Content {
            purpose: "Old purpose.".to_owned(),
            subtitle: "Existing subtitle.".to_owned(),
            ..Content::default()
        };
        let doc = doc(vec![
            heading(1, "n-1", "Title only"),
            paragraph("n-2", "Would-be subtitle."),
        ]);
        let derived = derive(&doc, &previous);

        assert_eq!(derived.title, "Title only");
        // Subtitle only fills when empty.
        assert_eq!(derived.subtitle, "Existing subtitle.");
        assert_eq!(derived.purpose, "Old purpose.");
    }

    #[test]
    fn test_heading_does_not_bind_across_headings() {
        let doc = doc(vec![
            heading(2, "n-1", "Purpose"),
            heading(2, "n-2", "Tiers"),
            paragraph("n-3", "Tier text."),
        ]);
        let derived = derive(&doc, &Content::default());

        assert_eq!(derived.purpose, "");
        assert_eq!(derived.tiers, "Tier text.");
    }

    #[test]
    fn test_normalize_rejects_non_doc() {
        assert!(normalize(json!({ "type": "paragraph" })).is_none());
        assert!(normalize(json!("nonsense")).is_none());
        assert!(normalize(json!({ "type": "doc", "content": [] })).is_some());
    }

    #[test]
    fn test_node_ids() {
        let doc = doc(vec![
            heading(1, "n-1", "T"),
            json!({
                "type": "bulletList",
                "content": [paragraph("n-9", "deep")]
            }),
            paragraph("", "anonymous"),
        ]);
        let ids = node_ids(&doc);

        assert_eq!(
            ids.into_iter().collect::<Vec<_>>(),
            vec!["n-1".to_owned(), "n-9".to_owned()]
        );
    }

    #[test]
    fn test_next_without_doc_fills_blanks_from_head() {
        let head = Content {
            title: "Head title".to_owned(),
            purpose: "Head purpose".to_owned(),
            ..Content::default()
        };
        let incoming = Content {
            title: "New title".to_owned(),
            ..Content::default()
        };
        let next = Content::next(&incoming, &head);

        assert_eq!(next.title, "New title");
        assert_eq!(next.purpose, "Head purpose");
    }

    #[test]
    fn test_differs() {
        let a = Content {
            doc: Some(doc(vec![heading(1, "n-1", "A")])),
            title: "A".to_owned(),
            ..Content::default()
        };
        let mut b = a.clone();
        assert!(!a.differs(&b));

        b.doc = Some(doc(vec![heading(1, "n-1", "B")]));
        assert!(a.differs(&b));
    }
}
