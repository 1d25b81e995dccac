//! Full-text search over an inverted index.
//!
//! Two auxiliary stores mirror each other:
//! - `fts_words`: `(store, term)` -> sorted document ids containing the term
//! - `fts_ids`: `(store, doc_id)` -> sorted terms the document contributed
//!
//! The reverse entry is what lets an update or delete retract terms the
//! document no longer has. Entries are namespaced by primary store.

pub mod maintainer;
pub mod query;
pub mod tokenizer;

pub use maintainer::Maintainer;
pub use query::{find_many_by_terms, rank};
pub use tokenizer::{document_terms, tokenize};

use crate::schema::{FieldType, IndexSpec};
use crate::storage::{Key, KeyRange};
use serde::{Deserialize, Serialize};

pub const WORDS_STORE: &str = "fts_words";
pub const IDS_STORE: &str = "fts_ids";
pub const WORDS_INDEX: &str = "store,term";
pub const IDS_INDEX: &str = "store,doc_id";

/// `fts_words` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Key>,
    pub store: String,
    pub term: String,
    pub ids: Vec<Key>,
}

/// `fts_ids` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdsEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Key>,
    pub store: String,
    pub doc_id: Key,
    pub terms: Vec<String>,
}

/// Adds the two auxiliary stores to `spec`.
pub fn with_fts_stores(spec: IndexSpec) -> IndexSpec {
    spec.with_store(WORDS_STORE, [(WORDS_INDEX, FieldType::UniqueSingle)])
        .with_store(IDS_STORE, [(IDS_INDEX, FieldType::UniqueSingle)])
}

pub(crate) fn word_key(store: &str, term: &str) -> KeyRange {
    KeyRange::only(Key::Array(vec![Key::from(store), Key::from(term)]))
}

pub(crate) fn doc_key(store: &str, doc_id: &Key) -> KeyRange {
    KeyRange::only(Key::Array(vec![Key::from(store), doc_id.clone()]))
}

/// Every `(store, _)` compound key: arrays sort after numbers and strings.
pub(crate) fn store_range(store: &str) -> KeyRange {
    KeyRange::bound(
        Key::Array(vec![Key::from(store)]),
        Key::Array(vec![Key::from(store), Key::Array(Vec::new())]),
        false,
        false,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_range_covers_only_its_store() {
        let range = store_range("notes");
        assert!(range.contains(&Key::Array(vec![Key::from("notes"), Key::from("term")])));
        assert!(range.contains(&Key::Array(vec![Key::from("notes"), Key::from(42)])));
        assert!(!range.contains(&Key::Array(vec![Key::from("notes2"), Key::from("x")])));
        assert!(!range.contains(&Key::Array(vec![Key::from("note"), Key::from("x")])));
    }

    #[test]
    fn test_with_fts_stores_validates() {
        let spec = with_fts_stores(IndexSpec::new());
        assert!(spec.validate().is_ok());
        assert!(spec.contains_store(WORDS_STORE));
        assert!(spec.contains_store(IDS_STORE));
    }
}
