//! Operation history.
//!
//! One `op_hist` record per primary store lists the ids touched by each
//! kind of operation, oldest first, trimmed to `max_history` per kind.
//! History is a convenience log: it is written in the background and may
//! lag or miss entries if a write fails.

use crate::error::{DbError, Result};
use crate::schema::{FieldType, IndexSpec};
use crate::storage::{Key, KeyRange, Transaction};
use serde::{Deserialize, Serialize};

pub const HISTORY_STORE: &str = "op_hist";
pub const HISTORY_INDEX: &str = "store";

/// Kind of operation recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Create,
    Read,
    Update,
    Delete,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OpKind::Create => "create",
            OpKind::Read => "read",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        };
        write!(f, "{}", name)
    }
}

/// One recorded operation on one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpEntry {
    pub id: Key,
    /// Milliseconds since the Unix epoch.
    pub at: i64,
}

/// History of one store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpHistory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Key>,
    pub store: String,
    #[serde(default)]
    pub create: Vec<OpEntry>,
    #[serde(default)]
    pub read: Vec<OpEntry>,
    #[serde(default)]
    pub update: Vec<OpEntry>,
    #[serde(default)]
    pub delete: Vec<OpEntry>,
}

impl OpHistory {
    pub fn new(store: &str) -> Self {
        Self {
            store: store.to_string(),
            ..Self::default()
        }
    }

    pub fn entries(&self, kind: OpKind) -> &[OpEntry] {
        match kind {
            OpKind::Create => &self.create,
            OpKind::Read => &self.read,
            OpKind::Update => &self.update,
            OpKind::Delete => &self.delete,
        }
    }

    fn entries_mut(&mut self, kind: OpKind) -> &mut Vec<OpEntry> {
        match kind {
            OpKind::Create => &mut self.create,
            OpKind::Read => &mut self.read,
            OpKind::Update => &mut self.update,
            OpKind::Delete => &mut self.delete,
        }
    }

    /// Appends entries, dropping the oldest beyond `max`.
    pub fn record(&mut self, kind: OpKind, ids: &[Key], at: i64, max: usize) {
        let list = self.entries_mut(kind);
        list.extend(ids.iter().map(|id| OpEntry { id: id.clone(), at }));
        if list.len() > max {
            let excess = list.len() - max;
            list.drain(..excess);
        }
    }

    /// Up to `limit` most recent entries per kind, newest first.
    pub fn latest(&self, limit: usize) -> OpHistory {
        let newest =
            |list: &[OpEntry]| -> Vec<OpEntry> { list.iter().rev().take(limit).cloned().collect() };
        OpHistory {
            id: None,
            store: self.store.clone(),
            create: newest(&self.create),
            read: newest(&self.read),
            update: newest(&self.update),
            delete: newest(&self.delete),
        }
    }
}

/// Adds the history store to `spec`.
pub fn with_history_store(spec: IndexSpec) -> IndexSpec {
    spec.with_store(HISTORY_STORE, [(HISTORY_INDEX, FieldType::UniqueSingle)])
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub async fn load<T: Transaction>(tx: &T, store: &str) -> Result<Option<OpHistory>> {
    let value = tx
        .index_get(HISTORY_STORE, HISTORY_INDEX, &KeyRange::only(store))
        .await?;
    Ok(value.map(serde_json::from_value).transpose()?)
}

/// Appends `ids` under `kind` to the history of `store`.
pub async fn append<T: Transaction>(
    tx: &T,
    store: &str,
    kind: OpKind,
    ids: &[Key],
    max: usize,
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let mut history = load(tx, store).await?.unwrap_or_else(|| OpHistory::new(store));
    history.record(kind, ids, now_millis(), max);
    let value = serde_json::to_value(&history)?;
    if history.id.is_some() {
        tx.put(HISTORY_STORE, &value).await?;
    } else {
        tx.add(HISTORY_STORE, &value).await?;
    }
    Ok(())
}

/// Removes the history of `store`. Returns whether there was one.
pub async fn clear<T: Transaction>(tx: &T, store: &str) -> Result<bool> {
    let Some(history) = load(tx, store).await? else {
        return Ok(false);
    };
    let id = history
        .id
        .ok_or_else(|| DbError::Serialization("history record without id".to_string()))?;
    tx.delete(HISTORY_STORE, &id).await?;
    Ok(true)
}
