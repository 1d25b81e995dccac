//! Term extraction.

use crate::schema::delta::PRIMARY_KEY;
use crate::storage::key::resolve_path;
use serde_json::Value;
use std::collections::BTreeSet;
use unicode_segmentation::UnicodeSegmentation;

/// Splits `text` into its distinct lower-cased terms.
///
/// Word boundaries follow Unicode segmentation, so whitespace and
/// punctuation separate terms while apostrophes inside a word do not.
/// Membership is all that is indexed: repeats collapse to one term.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.unicode_words()
        .map(|word| word.to_lowercase())
        .filter(|word| !word.is_empty())
        .collect()
}

/// Terms of every indexed field of `doc`.
///
/// With `fields = None` every top-level string (or array of strings) is
/// indexed except the primary key; otherwise only the listed dot paths.
pub fn document_terms(doc: &Value, fields: Option<&[String]>) -> BTreeSet<String> {
    let mut terms = BTreeSet::new();
    match fields {
        Some(paths) => {
            for path in paths {
                if let Some(value) = resolve_path(doc, path) {
                    collect_text(value, &mut terms);
                }
            }
        }
        None => {
            if let Value::Object(map) = doc {
                for (name, value) in map {
                    if name != PRIMARY_KEY {
                        collect_text(value, &mut terms);
                    }
                }
            }
        }
    }
    terms
}

fn collect_text(value: &Value, terms: &mut BTreeSet<String>) {
    match value {
        Value::String(text) => terms.extend(tokenize(text)),
        Value::Array(items) => {
            for item in items.iter().filter(|i| i.is_string()) {
                collect_text(item, terms);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set(words: &[&str]) -> BTreeSet<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_tokenize_dedups_and_lowercases() {
        assert_eq!(tokenize("Foo foo FOO bar"), set(&["bar", "foo"]));
    }

    #[test]
    fn test_tokenize_splits_on_punctuation() {
        assert_eq!(
            tokenize("hello, world! (again)\tnew-line"),
            set(&["again", "hello", "line", "new", "world"])
        );
        assert!(tokenize("  ... ,, ").is_empty());
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn test_document_terms_default_fields() {
        let doc = json!({
            "id": 12,
            "title": "Rust Book",
            "tags": ["Systems", 3, "book"],
            "pages": 500,
            "meta": {"note": "nested is skipped"}
        });
        assert_eq!(
            document_terms(&doc, None),
            set(&["book", "rust", "systems"])
        );
    }

    #[test]
    fn test_document_terms_selected_paths() {
        let doc = json!({"title": "Alpha", "meta": {"note": "Beta gamma"}});
        let fields = vec!["meta.note".to_string(), "missing".to_string()];
        assert_eq!(
            document_terms(&doc, Some(&fields)),
            set(&["beta", "gamma"])
        );
    }
}
