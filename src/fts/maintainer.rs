//! Keeps `fts_words` and `fts_ids` in step with document mutations.
//!
//! All three hooks reduce to one reconciliation of a document's term set:
//! terms it lost are retracted, terms it gained are added, and terms it kept
//! are not written at all. A term whose id set empties is deleted.

use super::{
    doc_key, store_range, word_key, IdsEntry, WordEntry, IDS_INDEX, IDS_STORE, WORDS_INDEX,
    WORDS_STORE,
};
use crate::error::{DbError, Result};
use crate::fts::tokenizer::document_terms;
use crate::storage::{Key, Transaction};
use serde_json::Value;
use std::collections::BTreeSet;

/// Index maintenance for one `Database`.
#[derive(Debug, Clone, Default)]
pub struct Maintainer {
    fields: Option<Vec<String>>,
}

impl Maintainer {
    /// `fields = None` indexes every top-level string field.
    pub fn new(fields: Option<Vec<String>>) -> Self {
        Self { fields }
    }

    pub fn terms(&self, doc: &Value) -> BTreeSet<String> {
        document_terms(doc, self.fields.as_deref())
    }

    /// Indexes a newly created document.
    pub async fn on_create<T: Transaction>(
        &self,
        tx: &T,
        store: &str,
        doc_id: &Key,
        doc: &Value,
    ) -> Result<()> {
        self.sync(tx, store, doc_id, self.terms(doc)).await
    }

    /// Re-indexes a document from its new contents.
    pub async fn on_update<T: Transaction>(
        &self,
        tx: &T,
        store: &str,
        doc_id: &Key,
        new_doc: &Value,
    ) -> Result<()> {
        self.sync(tx, store, doc_id, self.terms(new_doc)).await
    }

    /// Retracts a deleted document. Its terms come from the reverse entry,
    /// not from the document.
    pub async fn on_delete<T: Transaction>(&self, tx: &T, store: &str, doc_id: &Key) -> Result<()> {
        self.sync(tx, store, doc_id, BTreeSet::new()).await
    }

    async fn sync<T: Transaction>(
        &self,
        tx: &T,
        store: &str,
        doc_id: &Key,
        new_terms: BTreeSet<String>,
    ) -> Result<()> {
        let previous = read_ids_entry(tx, store, doc_id).await?;
        let old_terms: BTreeSet<String> = previous
            .as_ref()
            .map(|e| e.terms.iter().cloned().collect())
            .unwrap_or_default();

        for term in old_terms.difference(&new_terms) {
            retract(tx, store, term, doc_id).await?;
        }
        for term in new_terms.difference(&old_terms) {
            extend(tx, store, term, doc_id).await?;
        }

        match previous {
            Some(entry) if new_terms.is_empty() => {
                tx.delete(IDS_STORE, &entry_id(entry.id)?).await?;
            }
            Some(mut entry) => {
                if old_terms != new_terms {
                    entry.terms = new_terms.into_iter().collect();
                    tx.put(IDS_STORE, &serde_json::to_value(&entry)?).await?;
                }
            }
            None if !new_terms.is_empty() => {
                let entry = IdsEntry {
                    id: None,
                    store: store.to_string(),
                    doc_id: doc_id.clone(),
                    terms: new_terms.into_iter().collect(),
                };
                tx.add(IDS_STORE, &serde_json::to_value(&entry)?).await?;
            }
            None => {}
        }
        Ok(())
    }
}

async fn extend<T: Transaction>(tx: &T, store: &str, term: &str, doc_id: &Key) -> Result<()> {
    match read_word_entry(tx, store, term).await? {
        Some(mut entry) => {
            if let Err(pos) = entry.ids.binary_search(doc_id) {
                entry.ids.insert(pos, doc_id.clone());
                tx.put(WORDS_STORE, &serde_json::to_value(&entry)?).await?;
            }
        }
        None => {
            let entry = WordEntry {
                id: None,
                store: store.to_string(),
                term: term.to_string(),
                ids: vec![doc_id.clone()],
            };
            tx.add(WORDS_STORE, &serde_json::to_value(&entry)?).await?;
        }
    }
    Ok(())
}

async fn retract<T: Transaction>(tx: &T, store: &str, term: &str, doc_id: &Key) -> Result<()> {
    let Some(mut entry) = read_word_entry(tx, store, term).await? else {
        return Ok(());
    };
    let Ok(pos) = entry.ids.binary_search(doc_id) else {
        return Ok(());
    };
    entry.ids.remove(pos);
    if entry.ids.is_empty() {
        tx.delete(WORDS_STORE, &entry_id(entry.id)?).await?;
    } else {
        tx.put(WORDS_STORE, &serde_json::to_value(&entry)?).await?;
    }
    Ok(())
}

fn entry_id(id: Option<Key>) -> Result<Key> {
    id.ok_or_else(|| DbError::Serialization("index entry without id".to_string()))
}

pub(crate) async fn read_word_entry<T: Transaction>(
    tx: &T,
    store: &str,
    term: &str,
) -> Result<Option<WordEntry>> {
    let value = tx.index_get(WORDS_STORE, WORDS_INDEX, &word_key(store, term)).await?;
    Ok(value.map(serde_json::from_value).transpose()?)
}

pub(crate) async fn read_ids_entry<T: Transaction>(
    tx: &T,
    store: &str,
    doc_id: &Key,
) -> Result<Option<IdsEntry>> {
    let value = tx.index_get(IDS_STORE, IDS_INDEX, &doc_key(store, doc_id)).await?;
    Ok(value.map(serde_json::from_value).transpose()?)
}

/// Removes every entry belonging to `store` from both auxiliary stores.
pub async fn purge_store<T: Transaction>(tx: &T, store: &str) -> Result<usize> {
    let mut removed = 0;
    for (aux, index) in [(WORDS_STORE, WORDS_INDEX), (IDS_STORE, IDS_INDEX)] {
        let entries = tx.index_get_all(aux, index, Some(&store_range(store)), None).await?;
        for entry in entries {
            if let Some(id) = entry.get("id").and_then(Key::from_value) {
                tx.delete(aux, &id).await?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionManager;
    use crate::fts::tokenizer::tokenize;
    use crate::fts::with_fts_stores;
    use crate::schema::IndexSpec;
    use crate::storage::{Connection, MemoryBackend, TxMode};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn setup() -> ConnectionManager<MemoryBackend> {
        let manager = ConnectionManager::new(MemoryBackend::new());
        let spec = with_fts_stores(IndexSpec::new());
        drop(pollster::block_on(manager.open_av("db", &spec)).unwrap());
        manager
    }

    /// Runs `f` inside one read-write transaction over both FTS stores.
    fn apply<F, Fut>(manager: &ConnectionManager<MemoryBackend>, f: F)
    where
        F: FnOnce(crate::storage::memory::MemoryTransaction) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        pollster::block_on(async {
            let handle = manager.reopen().await.unwrap();
            let tx = handle
                .transaction(&[WORDS_STORE, IDS_STORE], TxMode::ReadWrite)
                .unwrap();
            f(tx).await;
        });
    }

    /// Both stores for one primary store, as plain maps.
    fn snapshot(
        manager: &ConnectionManager<MemoryBackend>,
        store: &str,
    ) -> (BTreeMap<String, Vec<Key>>, BTreeMap<Key, Vec<String>>) {
        pollster::block_on(async {
            let handle = manager.reopen().await.unwrap();
            let tx = handle
                .transaction(&[WORDS_STORE, IDS_STORE], TxMode::ReadOnly)
                .unwrap();
            let words = tx
                .index_get_all(WORDS_STORE, WORDS_INDEX, Some(&store_range(store)), None)
                .await
                .unwrap()
                .into_iter()
                .map(|v| serde_json::from_value::<WordEntry>(v).unwrap())
                .map(|e| (e.term, e.ids))
                .collect();
            let ids = tx
                .index_get_all(IDS_STORE, IDS_INDEX, Some(&store_range(store)), None)
                .await
                .unwrap()
                .into_iter()
                .map(|v| serde_json::from_value::<IdsEntry>(v).unwrap())
                .map(|e| (e.doc_id, e.terms))
                .collect();
            (words, ids)
        })
    }

    /// Every term -> id pair is mirrored by id -> term, and vice versa, and
    /// no entry is empty.
    fn assert_consistent(
        words: &BTreeMap<String, Vec<Key>>,
        ids: &BTreeMap<Key, Vec<String>>,
    ) {
        for (term, docs) in words {
            assert!(!docs.is_empty(), "empty id set for {}", term);
            for doc in docs {
                assert!(ids[doc].contains(term), "{} missing from fts_ids[{}]", term, doc);
            }
        }
        for (doc, terms) in ids {
            assert!(!terms.is_empty());
            for term in terms {
                assert!(words[term].contains(doc), "{} missing from fts_words[{}]", doc, term);
            }
        }
    }

    #[test]
    fn test_create_update_delete_consistency() {
        let manager = setup();
        let maintainer = Maintainer::default();
        let one = Key::from(1);
        let two = Key::from(2);

        apply(&manager, |tx| async move {
            let m = Maintainer::default();
            m.on_create(&tx, "notes", &Key::from(1), &json!({"id": 1, "body": "red green blue"}))
                .await
                .unwrap();
            m.on_create(&tx, "notes", &Key::from(2), &json!({"id": 2, "body": "green yellow"}))
                .await
                .unwrap();
        });
        let (words, ids) = snapshot(&manager, "notes");
        assert_consistent(&words, &ids);
        assert_eq!(words["green"], vec![one.clone(), two.clone()]);
        assert_eq!(ids[&one], vec!["blue", "green", "red"]);

        apply(&manager, |tx| async move {
            let m = Maintainer::default();
            m.on_update(&tx, "notes", &Key::from(1), &json!({"id": 1, "body": "green purple"}))
                .await
                .unwrap();
        });
        let (words, ids) = snapshot(&manager, "notes");
        assert_consistent(&words, &ids);
        assert!(!words.contains_key("red"));
        assert!(!words.contains_key("blue"));
        assert_eq!(words["purple"], vec![one.clone()]);
        assert_eq!(ids[&one], vec!["green", "purple"]);

        apply(&manager, |tx| async move {
            let m = Maintainer::default();
            m.on_delete(&tx, "notes", &Key::from(2)).await.unwrap();
        });
        let (words, ids) = snapshot(&manager, "notes");
        assert_consistent(&words, &ids);
        assert!(!words.contains_key("yellow"));
        assert!(!ids.contains_key(&two));
        assert_eq!(words["green"], vec![one.clone()]);

        assert!(maintainer.terms(&json!({"id": 3})).is_empty());
    }

    #[test]
    fn test_last_reference_removes_term() {
        let manager = setup();
        apply(&manager, |tx| async move {
            let m = Maintainer::default();
            m.on_create(&tx, "notes", &Key::from(1), &json!({"body": "only"}))
                .await
                .unwrap();
            m.on_delete(&tx, "notes", &Key::from(1)).await.unwrap();
        });
        let (words, ids) = snapshot(&manager, "notes");
        assert!(words.is_empty());
        assert!(ids.is_empty());
    }

    #[test]
    fn test_stores_do_not_share_id_sets() {
        let manager = setup();
        apply(&manager, |tx| async move {
            let m = Maintainer::default();
            m.on_create(&tx, "a", &Key::from(1), &json!({"t": "shared"})).await.unwrap();
            m.on_create(&tx, "b", &Key::from(1), &json!({"t": "shared"})).await.unwrap();
            m.on_delete(&tx, "a", &Key::from(1)).await.unwrap();
        });
        let (a_words, _) = snapshot(&manager, "a");
        let (b_words, b_ids) = snapshot(&manager, "b");
        assert!(a_words.is_empty());
        assert_eq!(b_words["shared"], vec![Key::from(1)]);
        assert_consistent(&b_words, &b_ids);
    }

    #[test]
    fn test_arbitrary_sequence_stays_mirrored() {
        let manager = setup();
        let bodies = [
            "alpha beta", "beta gamma", "gamma delta alpha", "", "delta", "alpha alpha alpha",
        ];
        let steps: Vec<(usize, Key, &str)> = (0..24usize)
            .map(|step| {
                let id = Key::from((step % 4) as i64 + 1);
                (step % 3, id, bodies[(step * 7) % bodies.len()])
            })
            .collect();

        let mut current: BTreeMap<Key, &str> = BTreeMap::new();
        for (op, id, body) in &steps {
            match op {
                0 | 1 => current.insert(id.clone(), *body),
                _ => current.remove(id),
            };
        }

        apply(&manager, |tx| async move {
            let m = Maintainer::default();
            for (op, id, body) in &steps {
                match op {
                    0 => m.on_create(&tx, "s", id, &json!({ "body": body })).await.unwrap(),
                    1 => m.on_update(&tx, "s", id, &json!({ "body": body })).await.unwrap(),
                    _ => m.on_delete(&tx, "s", id).await.unwrap(),
                }
            }
        });

        let (words, ids) = snapshot(&manager, "s");
        assert_consistent(&words, &ids);

        // Each live document holds exactly the terms of its latest body;
        // deleted and empty documents have no entry
        let expected: BTreeMap<Key, Vec<String>> = current
            .into_iter()
            .map(|(id, body)| (id, tokenize(body).into_iter().collect::<Vec<_>>()))
            .filter(|(_, terms)| !terms.is_empty())
            .collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_purge_store() {
        let manager = setup();
        apply(&manager, |tx| async move {
            let m = Maintainer::default();
            m.on_create(&tx, "a", &Key::from(1), &json!({"t": "one two"})).await.unwrap();
            m.on_create(&tx, "b", &Key::from(1), &json!({"t": "one"})).await.unwrap();
            assert_eq!(purge_store(&tx, "a").await.unwrap(), 3);
        });
        assert!(snapshot(&manager, "a").0.is_empty());
        assert_eq!(snapshot(&manager, "b").0.len(), 1);
    }
}
