//! Records shared by the ingestion and retrieval paths.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Separator used when a single string field holds several values
/// (descriptions, keywords, source chunk ids).
pub const GRAPH_FIELD_SEP: &str = "<SEP>";

/// Entity type assigned to nodes created implicitly by a relationship.
pub const UNKNOWN_ENTITY_TYPE: &str = "UNKNOWN";

/// Strip surrounding whitespace and one layer of quotes.
pub fn clean_str(value: &str) -> String {
    let trimmed = value.trim();
    let is_quote = |c: char| c == '"' || c == '\'';
    let trimmed = trimmed.strip_prefix(is_quote).unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix(is_quote).unwrap_or(trimmed);
    trimmed.trim().to_string()
}

/// Canonical graph key for an entity: cleaned, uppercased and quote-wrapped.
///
/// `canonical_name("  'Tim Cook' ")` and `canonical_name("\"TIM COOK\"")`
/// both yield `"\"TIM COOK\""`.
pub fn canonical_name(raw: &str) -> String {
    format!("\"{}\"", clean_str(raw).to_uppercase())
}

/// `prefix` + hex md5 of `content`.
pub fn compute_mdhash_id(content: &str, prefix: &str) -> String {
    format!("{}{:x}", prefix, md5::compute(content.as_bytes()))
}

/// Split a `GRAPH_FIELD_SEP` joined field into its non-empty parts.
pub fn split_field(value: &str) -> Vec<String> {
    value
        .split(GRAPH_FIELD_SEP)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join distinct values in first-seen order.
pub fn join_unique<I, S>(values: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut parts = Vec::new();
    for value in values {
        let value = value.as_ref().trim();
        if value.is_empty() {
            continue;
        }
        if seen.insert(value.to_string()) {
            parts.push(value.to_string());
        }
    }
    parts.join(GRAPH_FIELD_SEP)
}

/// Node payload stored in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_type: String,
    pub description: String,
    pub source_id: String,
}

/// Edge payload stored in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationRecord {
    pub weight: f64,
    pub description: String,
    pub keywords: String,
    pub source_id: String,
}

/// Committed entity as returned by the merge engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub name: String,
    pub entity_type: String,
    pub description: String,
    pub source_id: String,
}

impl Entity {
    pub fn source_ids(&self) -> Vec<String> {
        split_field(&self.source_id)
    }
}

/// Committed relationship as returned by the merge engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Relationship {
    pub src: String,
    pub tgt: String,
    pub weight: f64,
    pub description: String,
    pub keywords: String,
    pub source_id: String,
}

/// A stored source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullDocument {
    pub content: String,
}

/// Token-bounded slice of a document, content addressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    pub id: String,
    pub content: String,
    pub tokens: usize,
    pub chunk_order_index: usize,
    pub full_doc_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_name_normalizes_case_quotes_and_whitespace() {
        assert_eq!(canonical_name("Tim Cook"), "\"TIM COOK\"");
        assert_eq!(canonical_name("  \"tim cook\" "), "\"TIM COOK\"");
        assert_eq!(canonical_name("'Tim Cook'"), "\"TIM COOK\"");
        assert_eq!(canonical_name("\"TIM COOK\""), canonical_name("tim cook"));
    }

    #[test]
    fn clean_str_only_strips_one_layer() {
        assert_eq!(clean_str("\"entity\""), "entity");
        assert_eq!(clean_str("  plain  "), "plain");
        assert_eq!(clean_str("\"\"nested\"\""), "\"nested\"");
    }

    #[test]
    fn mdhash_id_is_stable_and_prefixed() {
        let a = compute_mdhash_id("hello", "doc-");
        let b = compute_mdhash_id("hello", "doc-");
        assert_eq!(a, b);
        assert!(a.starts_with("doc-"));
        assert_eq!(a.len(), 4 + 32);
        assert_ne!(a, compute_mdhash_id("hello!", "doc-"));
    }

    #[test]
    fn split_and_join_round_trip_as_set() {
        let joined = join_unique(["b", "a", "b", " ", "c"]);
        assert_eq!(joined, format!("b{sep}a{sep}c", sep = GRAPH_FIELD_SEP));
        assert_eq!(split_field(&joined), vec!["b", "a", "c"]);
        assert!(split_field("").is_empty());
    }
}
