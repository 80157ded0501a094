use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

pub const RETRIEVAL_SPAN_TYPE: &str = "Retrieval";

#[derive(Debug, Clone, Deserialize)]
struct RawSpan {
    span_id: String,
    #[serde(default)]
    span_type: String,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    attributes: Option<String>,
    #[serde(default)]
    children: Vec<RawSpan>,
}

#[derive(Debug, Clone)]
pub struct Span {
    pub span_id: String,
    pub span_type: String,
    pub parent_id: Option<String>,
    attributes: Option<String>,
}

impl Span {
    /// The span's attributes are stored as a serialized JSON object.
    pub fn attributes_json(&self) -> Result<serde_json::Value> {
        let raw = self
            .attributes
            .as_deref()
            .with_context(|| format!("span {} has no attributes", self.span_id))?;
        serde_json::from_str(raw)
            .with_context(|| format!("failed to parse attributes of span {}", self.span_id))
    }
}

/// Flattened span tree with lookup by span id. Spans are stored in an arena
/// in depth-first order; duplicated span ids keep the first occurrence.
#[derive(Debug)]
pub struct SpanTree {
    spans: Vec<Span>,
    by_id: HashMap<String, usize>,
}

impl SpanTree {
    pub fn from_json(raw: &str) -> Result<Self> {
        let root: RawSpan =
            serde_json::from_str(raw).context("failed to parse span tree json")?;

        let mut spans = Vec::new();
        let mut by_id = HashMap::new();
        let mut seen = HashSet::new();
        let mut pending = vec![root];

        while let Some(node) = pending.pop() {
            if !seen.insert(node.span_id.clone()) {
                warn!(span_id = %node.span_id, "duplicate span id in trace, keeping first occurrence");
                continue;
            }

            by_id.insert(node.span_id.clone(), spans.len());
            spans.push(Span {
                span_id: node.span_id,
                span_type: node.span_type,
                parent_id: node.parent_id,
                attributes: node.attributes,
            });
            pending.extend(node.children);
        }

        Ok(Self { spans, by_id })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Span> {
        self.spans.iter()
    }

    pub fn get(&self, span_id: &str) -> Option<&Span> {
        self.by_id.get(span_id).map(|index| &self.spans[*index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_json() -> String {
        serde_json::json!({
            "span_id": "root",
            "span_type": "LLM",
            "parent_id": null,
            "attributes": "{}",
            "children": [
                {
                    "span_id": "lookup-1",
                    "span_type": "Embedding",
                    "parent_id": "root",
                    "attributes": "{\"inputs\": \"{}\"}",
                    "children": [
                        {
                            "span_id": "retrieval-1",
                            "span_type": "Retrieval",
                            "parent_id": "lookup-1",
                            "attributes": "{\"retrieval.query\": \"q\"}",
                            "children": []
                        }
                    ]
                }
            ]
        })
        .to_string()
    }

    #[test]
    fn parses_nested_spans_and_indexes_by_id() {
        let tree = SpanTree::from_json(&tree_json()).unwrap();
        assert_eq!(tree.iter().count(), 3);

        let retrieval = tree.get("retrieval-1").unwrap();
        assert_eq!(retrieval.span_type, RETRIEVAL_SPAN_TYPE);
        assert_eq!(retrieval.parent_id.as_deref(), Some("lookup-1"));

        let lookup = tree.get("lookup-1").unwrap();
        let attributes = lookup.attributes_json().unwrap();
        assert!(attributes.get("inputs").is_some());
    }

    #[test]
    fn duplicate_span_ids_keep_first_occurrence() {
        let raw = serde_json::json!({
            "span_id": "a",
            "span_type": "LLM",
            "children": [
                {"span_id": "a", "span_type": "Retrieval", "children": []},
                {"span_id": "b", "span_type": "Tool", "children": []}
            ]
        })
        .to_string();

        let tree = SpanTree::from_json(&raw).unwrap();
        assert_eq!(tree.iter().count(), 2);
        assert_eq!(tree.get("a").unwrap().span_type, "LLM");
        assert!(tree.get("b").is_some());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(SpanTree::from_json("not json").is_err());
        assert!(SpanTree::from_json("{\"children\": []}").is_err());
    }

    #[test]
    fn missing_attributes_is_an_error_on_access() {
        let raw = serde_json::json!({
            "span_id": "a",
            "span_type": "Retrieval",
            "children": []
        })
        .to_string();

        let tree = SpanTree::from_json(&raw).unwrap();
        assert!(tree.get("a").unwrap().attributes_json().is_err());
    }
}
