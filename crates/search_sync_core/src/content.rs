//! Denormalized search content.
//!
//! Flattens a root document (the row plus its loaded relations) into the
//! sorted, de-duplicated token string stored in `search_content`.

use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::SyncError;
use crate::schema::RootEntity;

// =============================================================================
// TOKEN PATTERNS
// =============================================================================

/// ISO-8601 timestamps, removed whole before tokenising.
static ISO_TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\d{4}-\d{2}-\d{2}[t ]\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:z|[+-]\d{2}:?\d{2})?")
        .unwrap()
});

/// Latin and Cyrillic words and digit runs.
static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-zа-яё0-9]+").unwrap());

/// Keys that never contribute to search content.
const ALWAYS_SKIPPED: &[&str] = &["search_content", "search_vector", "search_generation"];

const MIN_TOKEN_LEN: usize = 3;
const MAX_IDENTIFIER_LEN: usize = 10;
const DEFAULT_MAX_DEPTH: usize = 32;

/// Bare years and long mixed alphanumeric identifiers (hashes, image ids).
fn is_noise(token: &str) -> bool {
    let has_digit = token.chars().any(|c| c.is_ascii_digit());
    let has_alpha = token.chars().any(char::is_alphabetic);
    if token.chars().count() > MAX_IDENTIFIER_LEN && has_digit && has_alpha {
        return true;
    }
    token.len() == 4
        && token.chars().all(|c| c.is_ascii_digit())
        && (token.starts_with("19") || token.starts_with("20"))
}

// =============================================================================
// BUILDER
// =============================================================================

#[derive(Debug, Clone)]
pub struct SearchContentBuilder {
    skip_keys: HashSet<String>,
    max_depth: usize,
}

impl Default for SearchContentBuilder {
    fn default() -> Self {
        Self {
            skip_keys: ALWAYS_SKIPPED.iter().map(|k| k.to_string()).collect(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl SearchContentBuilder {
    pub fn for_root(root: &RootEntity) -> Self {
        let mut builder = Self::default();
        builder.skip_keys.extend(root.skip_keys.iter().cloned());
        builder
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Build the content string for one document.
    pub fn build(&self, document: &Value) -> Result<String, SyncError> {
        if !document.is_object() {
            return Err(SyncError::InvalidInput(
                "search document must be a JSON object".into(),
            ));
        }
        let mut tokens = BTreeSet::new();
        self.walk(document, 0, &mut tokens)?;
        Ok(tokens.into_iter().collect::<Vec<_>>().join(" "))
    }

    fn walk(&self, value: &Value, depth: usize, out: &mut BTreeSet<String>) -> Result<(), SyncError> {
        if depth > self.max_depth {
            return Err(SyncError::InvalidInput(format!(
                "search document nested deeper than {}",
                self.max_depth
            )));
        }
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    if key.starts_with('_') || self.skip_keys.contains(key) {
                        continue;
                    }
                    self.walk(child, depth + 1, out)?;
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.walk(item, depth + 1, out)?;
                }
            }
            Value::String(s) => collect_tokens(&ISO_TIMESTAMP_RE.replace_all(s, " "), out),
            Value::Number(n) => collect_tokens(&n.to_string(), out),
            Value::Bool(_) | Value::Null => {}
        }
        Ok(())
    }
}

fn collect_tokens(text: &str, out: &mut BTreeSet<String>) {
    let lowered = text.to_lowercase();
    for word in WORD_RE.find_iter(&lowered) {
        let token = word.as_str();
        if token.chars().count() >= MIN_TOKEN_LEN && !is_noise(token) {
            out.insert(token.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn build(doc: Value) -> String {
        SearchContentBuilder::default().build(&doc).unwrap()
    }

    #[test]
    fn nested_relations_are_flattened() {
        let doc = json!({
            "id": 1,
            "drink": {
                "title": "Sassicaia",
                "subregion": { "name": "Bolgheri", "region": { "name": "Tuscany" } },
                "foods": [{ "name": "Lamb" }, { "name": "Game" }]
            }
        });
        assert_eq!(build(doc), "bolgheri game lamb sassicaia tuscany");
    }

    #[test]
    fn tokens_are_sorted_and_deduplicated() {
        let doc = json!({ "a": "Shiraz shiraz", "b": ["Barossa Valley", "shiraz"] });
        assert_eq!(build(doc), "barossa shiraz valley");
    }

    #[test]
    fn timestamps_years_and_identifiers_are_noise() {
        let doc = json!({
            "created_at": "2024-05-01T10:00:00.123Z",
            "note": "Vintage 2015 bottled 1998, lot a1b2c3d4e5f6g7",
            "price": 12000,
            "vol": 0.75
        });
        assert_eq!(build(doc), "12000 bottled lot vintage");
    }

    #[test]
    fn short_tokens_and_internal_keys_are_skipped() {
        let doc = json!({
            "_sa_instance_state": "internal",
            "search_content": "stale content",
            "name": "Le Pin de la Cave",
            "flag": true,
            "nothing": null
        });
        assert_eq!(build(doc), "cave pin");
    }

    #[test]
    fn root_skip_keys_apply() {
        let root = RootEntity::new("item").with_skip_keys(["image_path"]);
        let doc = json!({ "image_path": "/images/bottle.png", "name": "Brunello" });
        let content = SearchContentBuilder::for_root(&root).build(&doc).unwrap();
        assert_eq!(content, "brunello");
    }

    #[test]
    fn cyrillic_words_survive() {
        let doc = json!({ "name": "Красное сухое" });
        assert_eq!(build(doc), "красное сухое");
    }

    #[test]
    fn rejects_non_object_and_excessive_depth() {
        let builder = SearchContentBuilder::default();
        assert!(builder.build(&json!(["not", "an", "object"])).is_err());

        let deep = json!({ "a": { "b": { "c": { "d": "word" } } } });
        assert!(builder.clone().with_max_depth(2).build(&deep).is_err());
        assert_eq!(builder.build(&deep).unwrap(), "word");
    }
}
