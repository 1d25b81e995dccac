//! Term queries.

use super::maintainer::read_word_entry;
use super::WORDS_STORE;
use crate::error::Result;
use crate::fts::tokenizer::tokenize;
use crate::storage::{Connection, Key, Transaction, TxMode};
use futures_util::future::join_all;
use serde_json::Value;
use std::collections::BTreeMap;

/// Orders candidate ids by how many of the id sets contain them (highest
/// first), then by ascending id.
///
/// Scoring is a plain overlap count.
pub fn rank(id_sets: &[Vec<Key>]) -> Vec<(Key, usize)> {
    let mut scores: BTreeMap<&Key, usize> = BTreeMap::new();
    for ids in id_sets {
        for id in ids {
            *scores.entry(id).or_insert(0) += 1;
        }
    }

    let mut ranked: Vec<(Key, usize)> = scores
        .into_iter()
        .map(|(id, score)| (id.clone(), score))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

/// Documents of `store` matching any term of `query`, best match first.
///
/// Ids whose document no longer exists are skipped.
pub async fn find_many_by_terms<C: Connection>(
    conn: &C,
    store: &str,
    query: &str,
) -> Result<Vec<Value>> {
    let tx = conn.transaction(&[store, WORDS_STORE], TxMode::ReadOnly)?;

    let terms = tokenize(query);
    if terms.is_empty() {
        return Ok(Vec::new());
    }

    let entries = join_all(terms.iter().map(|term| read_word_entry(&tx, store, term))).await;
    let mut id_sets = Vec::with_capacity(entries.len());
    for entry in entries {
        if let Some(entry) = entry? {
            id_sets.push(entry.ids);
        }
    }

    let ranked = rank(&id_sets);
    let docs = join_all(ranked.iter().map(|(id, _)| tx.get(store, id))).await;

    let mut results = Vec::with_capacity(docs.len());
    for ((id, _), doc) in ranked.iter().zip(docs) {
        match doc? {
            Some(doc) => results.push(doc),
            None => log::debug!("Skipping stale index reference {} in {}", id, store),
        }
    }

    tx.done().await?;
    Ok(results)
}
