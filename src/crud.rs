//! Document API.
//!
//! Every call reopens the database, does its work in one transaction and
//! closes again; nothing holds a connection between calls. Index and history
//! maintenance for a mutation is queued on the background queue once the
//! primary transaction has committed.
//!
//! Conditions name indices, not raw fields: a `Cond` is an ordered list of
//! `(index, key range)` pairs. One pair is a single index lookup; several are
//! intersected by document id, keeping the order of the first lookup.

use crate::background::BackgroundQueue;
use crate::config::{DatabaseConfig, FtsConfig, HistoryConfig};
use crate::connection::{ConnectionManager, Handle, Reconciled};
use crate::error::{DbError, Result};
use crate::fts::{self, Maintainer, IDS_STORE, WORDS_STORE};
use crate::history::{self, OpHistory, OpKind, HISTORY_STORE};
use crate::schema::delta::{SchemaDelta, PRIMARY_KEY};
use crate::schema::IndexSpec;
use crate::storage::key::resolve_path;
use crate::storage::{Backend, Connection, EngineError, Key, KeyRange, Transaction, TxMode};
use futures_util::future::join_all;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

/// Index conditions, applied in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cond {
    terms: Vec<(String, KeyRange)>,
}

impl Cond {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `index` equals `key`.
    pub fn eq(index: impl Into<String>, key: impl Into<Key>) -> Self {
        Self::new().and(index, KeyRange::only(key))
    }

    /// Index `index` falls in `range`.
    pub fn range(index: impl Into<String>, range: KeyRange) -> Self {
        Self::new().and(index, range)
    }

    pub fn and(mut self, index: impl Into<String>, range: impl Into<KeyRange>) -> Self {
        self.terms.push((index.into(), range.into()));
        self
    }

    pub fn and_eq(self, index: impl Into<String>, key: impl Into<Key>) -> Self {
        self.and(index, KeyRange::only(key))
    }

    /// Parses `{ index: value, ... }` as equality conditions.
    pub fn from_json(value: &Value) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| DbError::Serialization("condition must be an object".to_string()))?;
        let mut cond = Cond::new();
        for (index, key) in map {
            let key = Key::from_value(key).ok_or_else(|| {
                DbError::Serialization(format!(
                    "condition on {} is not a valid key: {}",
                    index, key
                ))
            })?;
            cond = cond.and_eq(index.clone(), key);
        }
        Ok(cond)
    }

    pub fn terms(&self) -> &[(String, KeyRange)] {
        &self.terms
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

/// A committed change waiting for index maintenance.
enum Mutation {
    Created(Key, Value),
    Updated(Key, Value),
    Removed(Key),
}

struct Inner<B: Backend> {
    // Shared with queued tasks, which must not keep the queue itself alive
    manager: Rc<ConnectionManager<B>>,
    queue: BackgroundQueue,
    fts: RefCell<FtsConfig>,
    history: RefCell<HistoryConfig>,
}

/// A document database. Clones share state.
pub struct Database<B: Backend> {
    inner: Rc<Inner<B>>,
}

impl<B: Backend> Clone for Database<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> Database<B> {
    pub fn new(backend: B, config: DatabaseConfig) -> Self {
        Self {
            inner: Rc::new(Inner {
                manager: Rc::new(ConnectionManager::new(backend)),
                queue: BackgroundQueue::new(),
                fts: RefCell::new(config.fts),
                history: RefCell::new(config.history),
            }),
        }
    }

    pub fn manager(&self) -> &ConnectionManager<B> {
        &self.inner.manager
    }

    pub fn background(&self) -> &BackgroundQueue {
        &self.inner.queue
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Opens `name` with automatic versioning against `spec`.
    ///
    /// The auxiliary stores of enabled features are added to `spec`. Drop
    /// the returned handle promptly: an open handle blocks later upgrades.
    pub async fn open_av(&self, name: &str, spec: &IndexSpec) -> Result<Reconciled<B::Connection>> {
        let spec = self.effective_spec(spec.clone());
        self.inner.manager.open_av(name, &spec).await
    }

    /// Opens the last `open_av` database at its current version.
    pub async fn reopen(&self) -> Result<Handle<B::Connection>> {
        self.inner.manager.reopen().await
    }

    pub fn num_open(&self) -> usize {
        self.inner.manager.num_open()
    }

    /// Waits for queued index and history maintenance.
    pub async fn settle(&self) {
        self.inner.queue.settle().await;
    }

    fn effective_spec(&self, mut spec: IndexSpec) -> IndexSpec {
        if self.inner.fts.borrow().enabled {
            spec = fts::with_fts_stores(spec);
        }
        if self.inner.history.borrow().enabled {
            spec = history::with_history_store(spec);
        }
        spec
    }

    /// Re-runs `open_av` with the feature stores added, when already open.
    async fn extend_schema(&self) -> Result<()> {
        let (Some(name), Some(spec)) = (self.inner.manager.name(), self.inner.manager.spec()) else {
            return Ok(());
        };
        let extended = self.effective_spec(spec.clone());
        if extended != spec {
            drop(self.inner.manager.open_av(&name, &extended).await?);
        }
        Ok(())
    }

    // ========================================================================
    // Features
    // ========================================================================

    /// Turns on full-text indexing, creating its stores if needed.
    ///
    /// Only documents written from now on are indexed.
    pub async fn enable_fts(&self) -> Result<()> {
        self.inner.fts.borrow_mut().enabled = true;
        self.extend_schema().await
    }

    /// Stops index maintenance. Existing index entries are kept.
    pub fn disable_fts(&self) {
        self.inner.fts.borrow_mut().enabled = false;
    }

    pub fn fts_enabled(&self) -> bool {
        self.inner.fts.borrow().enabled
    }

    /// Changes which fields are tokenized for documents written from now on.
    pub fn set_fts_fields(&self, fields: Option<Vec<String>>) {
        self.inner.fts.borrow_mut().fields = fields;
    }

    pub async fn enable_op_hist(&self) -> Result<()> {
        self.inner.history.borrow_mut().enabled = true;
        self.extend_schema().await
    }

    pub fn disable_op_hist(&self) {
        self.inner.history.borrow_mut().enabled = false;
    }

    pub fn op_hist_status(&self) -> &'static str {
        if self.inner.history.borrow().enabled {
            "enabled"
        } else {
            "disabled"
        }
    }

    pub fn set_max_history(&self, max_history: usize) {
        self.inner.history.borrow_mut().max_history = max_history;
    }

    /// Up to `limit` most recent entries per operation kind, newest first.
    pub async fn get_op_hist(&self, store: &str, limit: usize) -> Result<OpHistory> {
        self.settle().await;
        let handle = self.reopen().await?;
        let tx = handle.transaction(&[HISTORY_STORE], TxMode::ReadOnly)?;
        let found = history::load(&tx, store).await?;
        tx.done().await?;
        Ok(found
            .map(|h| h.latest(limit))
            .unwrap_or_else(|| OpHistory::new(store)))
    }

    pub async fn clear_op_hist(&self, store: &str) -> Result<bool> {
        self.settle().await;
        let handle = self.reopen().await?;
        let tx = handle.transaction(&[HISTORY_STORE], TxMode::ReadWrite)?;
        let cleared = history::clear(&tx, store).await?;
        tx.done().await?;
        Ok(cleared)
    }

    /// Documents of `store` matching the terms of `query`, best first.
    ///
    /// Pending index maintenance is applied first, so every committed
    /// write is visible.
    pub async fn find_many_by_terms(&self, store: &str, query: &str) -> Result<Vec<Value>> {
        self.settle().await;
        let handle = self.reopen().await?;
        fts::find_many_by_terms(&*handle, store, query).await
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// Adds a document; any `id` it carries is replaced by a generated one.
    ///
    /// Returns `Ok(None)` when the store rejects the document.
    pub async fn insert_one(&self, store: &str, doc: &Value) -> Result<Option<Key>> {
        let handle = self.reopen().await?;
        let tx = handle.transaction(&[store], TxMode::ReadWrite)?;
        let doc = without_id(doc);

        let id = match tx.add(store, &doc).await {
            Ok(id) => id,
            Err(e) => {
                log::error!("Failed to insert into {}: {}", store, e);
                return Ok(None);
            }
        };
        tx.done().await?;

        self.record(store, OpKind::Create, vec![id.clone()]);
        self.maintain(store, vec![Mutation::Created(id.clone(), doc)]);
        Ok(Some(id))
    }

    /// Adds documents in one transaction; failed items are `None`.
    pub async fn insert_many(&self, store: &str, docs: &[Value]) -> Result<Vec<Option<Key>>> {
        let handle = self.reopen().await?;
        let tx = handle.transaction(&[store], TxMode::ReadWrite)?;
        let docs: Vec<Value> = docs.iter().map(without_id).collect();

        let results = join_all(docs.iter().map(|doc| tx.add(store, doc))).await;
        tx.done().await?;

        let mut ids = Vec::with_capacity(results.len());
        let mut mutations = Vec::new();
        for (doc, result) in docs.into_iter().zip(results) {
            match result {
                Ok(id) => {
                    mutations.push(Mutation::Created(id.clone(), doc));
                    ids.push(Some(id));
                }
                Err(e) => {
                    log::error!("Failed to insert into {}: {}", store, e);
                    ids.push(None);
                }
            }
        }

        self.maintain(store, mutations);
        Ok(ids)
    }

    // ========================================================================
    // Read
    // ========================================================================

    pub async fn exists(&self, store: &str, cond: &Cond) -> Result<bool> {
        let handle = self.reopen().await?;
        let tx = handle.transaction(&[store], TxMode::ReadOnly)?;
        Ok(!matching(&tx, store, cond, Some(1)).await?.is_empty())
    }

    pub async fn count(&self, store: &str, cond: &Cond) -> Result<usize> {
        let handle = self.reopen().await?;
        let tx = handle.transaction(&[store], TxMode::ReadOnly)?;
        match cond.terms() {
            [(index, range)] => {
                let n = tx
                    .index_count(store, index, Some(range))
                    .await
                    .map_err(index_error)?;
                Ok(n as usize)
            }
            _ => Ok(matching(&tx, store, cond, None).await?.len()),
        }
    }

    pub async fn count_all(&self, store: &str) -> Result<u64> {
        let handle = self.reopen().await?;
        let tx = handle.transaction(&[store], TxMode::ReadOnly)?;
        Ok(tx.count(store, None).await?)
    }

    pub async fn find_one(&self, store: &str, cond: &Cond) -> Result<Option<Value>> {
        let handle = self.reopen().await?;
        let tx = handle.transaction(&[store], TxMode::ReadOnly)?;
        let found = first_match(&tx, store, cond).await?;
        if let Some(id) = found.as_ref().and_then(doc_id) {
            self.record(store, OpKind::Read, vec![id]);
        }
        Ok(found)
    }

    pub async fn find_many(
        &self,
        store: &str,
        cond: &Cond,
        limit: Option<u32>,
    ) -> Result<Vec<Value>> {
        let handle = self.reopen().await?;
        let tx = handle.transaction(&[store], TxMode::ReadOnly)?;
        matching(&tx, store, cond, limit).await
    }

    pub async fn find_all(&self, store: &str) -> Result<Vec<Value>> {
        let handle = self.reopen().await?;
        let tx = handle.transaction(&[store], TxMode::ReadOnly)?;
        Ok(tx.get_all(store, None, None).await?)
    }

    /// Documents whose value at each dot path contains the needle in its
    /// JSON text. Every pair must match.
    pub async fn filter(
        &self,
        store: &str,
        conditions: &[(&str, &str)],
        limit: Option<usize>,
    ) -> Result<Vec<Value>> {
        let docs = self.find_all(store).await?;
        Ok(docs
            .into_iter()
            .filter(|doc| contains_all(doc, conditions))
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    // ========================================================================
    // Update
    // ========================================================================

    /// Merges `changes` into the first match. Returns the updated document.
    pub async fn update_one(
        &self,
        store: &str,
        cond: &Cond,
        changes: &Value,
    ) -> Result<Option<Value>> {
        let handle = self.reopen().await?;
        let tx = handle.transaction(&[store], TxMode::ReadWrite)?;

        let Some(doc) = first_match(&tx, store, cond).await? else {
            return Ok(None);
        };
        let updated = merge(doc, changes);
        let id = match tx.put(store, &updated).await {
            Ok(id) => id,
            Err(e) => {
                log::error!("Failed to update {} in {}: {}", cond_label(cond), store, e);
                return Ok(None);
            }
        };
        tx.done().await?;

        self.record(store, OpKind::Update, vec![id.clone()]);
        self.maintain(store, vec![Mutation::Updated(id, updated.clone())]);
        Ok(Some(updated))
    }

    /// Merges `changes` into up to `limit` matches in one transaction.
    pub async fn update_many(
        &self,
        store: &str,
        cond: &Cond,
        changes: &Value,
        limit: Option<u32>,
    ) -> Result<Vec<Option<Value>>> {
        let handle = self.reopen().await?;
        let tx = handle.transaction(&[store], TxMode::ReadWrite)?;

        let updated: Vec<Value> = matching(&tx, store, cond, limit)
            .await?
            .into_iter()
            .map(|doc| merge(doc, changes))
            .collect();
        let results = join_all(updated.iter().map(|doc| tx.put(store, doc))).await;
        tx.done().await?;

        let mut out = Vec::with_capacity(updated.len());
        let mut mutations = Vec::new();
        for (doc, result) in updated.into_iter().zip(results) {
            match result {
                Ok(id) => {
                    mutations.push(Mutation::Updated(id, doc.clone()));
                    out.push(Some(doc));
                }
                Err(e) => {
                    log::error!("Failed to update document in {}: {}", store, e);
                    out.push(None);
                }
            }
        }

        self.maintain(store, mutations);
        Ok(out)
    }

    /// Updates the first match, or inserts `changes` when nothing matches.
    pub async fn upsert_one(
        &self,
        store: &str,
        cond: &Cond,
        changes: &Value,
    ) -> Result<Option<Key>> {
        let handle = self.reopen().await?;
        let tx = handle.transaction(&[store], TxMode::ReadWrite)?;

        let (kind, doc, written) = match first_match(&tx, store, cond).await? {
            Some(doc) => {
                let updated = merge(doc, changes);
                let written = tx.put(store, &updated).await;
                (OpKind::Update, updated, written)
            }
            None => {
                let created = without_id(changes);
                let written = tx.add(store, &created).await;
                (OpKind::Create, created, written)
            }
        };

        let id = match written {
            Ok(id) => id,
            Err(e) => {
                log::error!("Failed to upsert into {}: {}", store, e);
                return Ok(None);
            }
        };
        tx.done().await?;

        self.record(store, kind, vec![id.clone()]);
        let mutation = match kind {
            OpKind::Create => Mutation::Created(id.clone(), doc),
            _ => Mutation::Updated(id.clone(), doc),
        };
        self.maintain(store, vec![mutation]);
        Ok(Some(id))
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Removes the first match. Returns whether a document was removed.
    pub async fn remove_one(&self, store: &str, cond: &Cond) -> Result<bool> {
        let handle = self.reopen().await?;
        let tx = handle.transaction(&[store], TxMode::ReadWrite)?;

        let Some(id) = first_match(&tx, store, cond).await?.as_ref().and_then(doc_id) else {
            return Ok(false);
        };
        if let Err(e) = tx.delete(store, &id).await {
            log::error!("Failed to remove {} from {}: {}", id, store, e);
            return Ok(false);
        }
        tx.done().await?;

        self.record(store, OpKind::Delete, vec![id.clone()]);
        self.maintain(store, vec![Mutation::Removed(id)]);
        Ok(true)
    }

    /// Removes every match in one transaction. Returns how many went.
    pub async fn remove_many(&self, store: &str, cond: &Cond) -> Result<usize> {
        let handle = self.reopen().await?;
        let tx = handle.transaction(&[store], TxMode::ReadWrite)?;

        let ids: Vec<Key> = matching(&tx, store, cond, None)
            .await?
            .iter()
            .filter_map(doc_id)
            .collect();
        let results = join_all(ids.iter().map(|id| tx.delete(store, id))).await;
        tx.done().await?;

        let mut mutations = Vec::new();
        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(()) => mutations.push(Mutation::Removed(id)),
                Err(e) => log::error!("Failed to remove {} from {}: {}", id, store, e),
            }
        }

        let removed = mutations.len();
        self.maintain(store, mutations);
        Ok(removed)
    }

    /// Deletes a store and forgets it in the remembered spec.
    pub async fn drop_store(&self, store: &str) -> Result<()> {
        self.settle().await;
        let mut spec = self.inner.manager.spec().ok_or(DbError::NotOpened)?;
        let live = self.reopen().await?.schema().await?;
        if live.store(store).is_none() {
            return Err(DbError::StoreNotFound(store.to_string()));
        }
        spec.remove_store(store);
        drop(
            self.inner
                .manager
                .apply(SchemaDelta::drop_store(store), spec)
                .await?,
        );
        log::info!("Dropped store {}", store);

        if self.fts_enabled() {
            let manager = self.inner.manager.clone();
            let name = store.to_string();
            self.inner.queue.spawn(format!("fts purge {}", store), async move {
                let handle = manager.reopen().await?;
                let tx = handle.transaction(&[WORDS_STORE, IDS_STORE], TxMode::ReadWrite)?;
                let removed = fts::maintainer::purge_store(&tx, &name).await?;
                tx.done().await?;
                log::debug!("Purged {} index entries of {}", removed, name);
                Ok(())
            });
        }
        if self.inner.history.borrow().enabled {
            let manager = self.inner.manager.clone();
            let name = store.to_string();
            self.inner.queue.spawn(format!("op_hist clear {}", store), async move {
                let handle = manager.reopen().await?;
                let tx = handle.transaction(&[HISTORY_STORE], TxMode::ReadWrite)?;
                history::clear(&tx, &name).await?;
                tx.done().await?;
                Ok(())
            });
        }
        Ok(())
    }

    /// Deletes the whole database once pending maintenance has run.
    pub async fn delete_database(&self) -> Result<()> {
        self.settle().await;
        self.inner.manager.delete_database().await
    }

    // ========================================================================
    // Background maintenance
    // ========================================================================

    fn maintain(&self, store: &str, mutations: Vec<Mutation>) {
        let fields = {
            let config = self.inner.fts.borrow();
            if !config.enabled || mutations.is_empty() {
                return;
            }
            config.fields.clone()
        };

        let manager = self.inner.manager.clone();
        let store = store.to_string();
        let maintainer = Maintainer::new(fields);
        self.inner.queue.spawn(format!("fts {}", store), async move {
            let handle = manager.reopen().await?;
            let tx = handle.transaction(&[WORDS_STORE, IDS_STORE], TxMode::ReadWrite)?;
            for mutation in &mutations {
                match mutation {
                    Mutation::Created(id, doc) => maintainer.on_create(&tx, &store, id, doc).await?,
                    Mutation::Updated(id, doc) => maintainer.on_update(&tx, &store, id, doc).await?,
                    Mutation::Removed(id) => maintainer.on_delete(&tx, &store, id).await?,
                }
            }
            tx.done().await?;
            Ok(())
        });
    }

    fn record(&self, store: &str, kind: OpKind, ids: Vec<Key>) {
        let max = {
            let config = self.inner.history.borrow();
            if !config.enabled {
                return;
            }
            config.max_history
        };

        let manager = self.inner.manager.clone();
        let store = store.to_string();
        self.inner.queue.spawn(format!("op_hist {} {}", kind, store), async move {
            let handle = manager.reopen().await?;
            let tx = handle.transaction(&[HISTORY_STORE], TxMode::ReadWrite)?;
            history::append(&tx, &store, kind, &ids, max).await?;
            tx.done().await?;
            Ok(())
        });
    }
}

/// First document matching `cond`.
async fn first_match<T: Transaction>(tx: &T, store: &str, cond: &Cond) -> Result<Option<Value>> {
    match cond.terms() {
        [(index, range)] => Ok(tx.index_get(store, index, range).await.map_err(index_error)?),
        _ => Ok(matching(tx, store, cond, Some(1)).await?.into_iter().next()),
    }
}

/// Documents matching every condition, in the order of the first one.
async fn matching<T: Transaction>(
    tx: &T,
    store: &str,
    cond: &Cond,
    limit: Option<u32>,
) -> Result<Vec<Value>> {
    let docs = match cond.terms() {
        [] => Vec::new(),
        [(index, range)] => tx
            .index_get_all(store, index, Some(range), limit)
            .await
            .map_err(index_error)?,
        terms => {
            let lookups = join_all(
                terms
                    .iter()
                    .map(|(index, range)| tx.index_get_all(store, index, Some(range), None)),
            )
            .await;

            let mut lookups = lookups.into_iter();
            let first = match lookups.next() {
                Some(found) => found.map_err(index_error)?,
                None => Vec::new(),
            };
            let mut others = Vec::new();
            for found in lookups {
                let ids: BTreeSet<Key> =
                    found.map_err(index_error)?.iter().filter_map(doc_id).collect();
                others.push(ids);
            }

            first
                .into_iter()
                .filter(|doc| {
                    doc_id(doc).is_some_and(|id| others.iter().all(|ids| ids.contains(&id)))
                })
                .collect()
        }
    };

    let mut seen = BTreeSet::new();
    Ok(docs
        .into_iter()
        .filter(|doc| doc_id(doc).map_or(true, |id| seen.insert(id)))
        .take(limit.map_or(usize::MAX, |l| l as usize))
        .collect())
}

fn index_error(err: EngineError) -> DbError {
    if let EngineError::IndexNotFound { store, index } = &err {
        log::error!("Index {}/{} not found, add it to the schema", store, index);
    }
    err.into()
}

fn doc_id(doc: &Value) -> Option<Key> {
    doc.get(PRIMARY_KEY).and_then(Key::from_value)
}

fn without_id(doc: &Value) -> Value {
    let mut doc = doc.clone();
    if let Value::Object(map) = &mut doc {
        map.remove(PRIMARY_KEY);
    }
    doc
}

/// Shallow merge of `changes` over `doc`; the document keeps its id.
fn merge(mut doc: Value, changes: &Value) -> Value {
    if let (Value::Object(target), Value::Object(changes)) = (&mut doc, changes) {
        for (field, value) in changes {
            if field != PRIMARY_KEY {
                target.insert(field.clone(), value.clone());
            }
        }
    }
    doc
}

fn contains_all(doc: &Value, conditions: &[(&str, &str)]) -> bool {
    conditions.iter().all(|(path, needle)| match resolve_path(doc, path) {
        None | Some(Value::Null) => false,
        Some(value) => value.to_string().contains(needle),
    })
}

fn cond_label(cond: &Cond) -> String {
    cond.terms()
        .iter()
        .map(|(index, _)| index.as_str())
        .collect::<Vec<_>>()
        .join("+")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;
    use crate::storage::MemoryBackend;
    use serde_json::json;

    fn spec() -> IndexSpec {
        IndexSpec::new().with_store(
            "people",
            [
                ("name", FieldType::UniqueSingle),
                ("city", FieldType::NonUniqueSingle),
                ("age", FieldType::NonUniqueSingle),
                ("tags", FieldType::NonUniqueMulti),
            ],
        )
    }

    fn open(config: DatabaseConfig) -> Database<MemoryBackend> {
        let db = Database::new(MemoryBackend::new(), config);
        drop(pollster::block_on(db.open_av("db", &spec())).unwrap());
        db
    }

    fn seed(db: &Database<MemoryBackend>) {
        let ids = pollster::block_on(db.insert_many(
            "people",
            &[
                json!({"name": "ann", "city": "oslo", "age": 30, "tags": ["a", "b"]}),
                json!({"name": "bob", "city": "rome", "age": 41, "tags": ["b"]}),
                json!({"name": "cat", "city": "oslo", "age": 25, "tags": ["c"]}),
            ],
        ))
        .unwrap();
        assert_eq!(ids, vec![Some(Key::from(1)), Some(Key::from(2)), Some(Key::from(3))]);
    }

    fn names(docs: &[Value]) -> Vec<&str> {
        docs.iter().filter_map(|d| d["name"].as_str()).collect()
    }

    #[test]
    fn test_insert_one_strips_id() {
        let db = open(DatabaseConfig::new());
        let id = pollster::block_on(db.insert_one("people", &json!({"id": 99, "name": "zed"})))
            .unwrap()
            .unwrap();
        assert_eq!(id, Key::from(1));
        let found = pollster::block_on(db.find_one("people", &Cond::eq("name", "zed")))
            .unwrap()
            .unwrap();
        assert_eq!(found, json!({"id": 1, "name": "zed"}));
        assert_eq!(db.num_open(), 0);
    }

    #[test]
    fn test_failed_writes_return_none() {
        let db = open(DatabaseConfig::new());
        seed(&db);
        assert_eq!(
            pollster::block_on(db.insert_one("people", &json!({"name": "ann"}))).unwrap(),
            None
        );

        let ids = pollster::block_on(db.insert_many(
            "people",
            &[json!({"name": "dan"}), json!({"name": "bob"}), json!({"name": "eve"})],
        ))
        .unwrap();
        assert!(ids[0].is_some());
        assert_eq!(ids[1], None);
        assert!(ids[2].is_some());
        assert_eq!(pollster::block_on(db.count_all("people")).unwrap(), 5);
    }

    #[test]
    fn test_single_and_intersected_conditions() {
        let db = open(DatabaseConfig::new());
        seed(&db);

        let oslo =
            pollster::block_on(db.find_many("people", &Cond::eq("city", "oslo"), None)).unwrap();
        assert_eq!(names(&oslo), vec!["ann", "cat"]);

        let cond = Cond::eq("city", "oslo").and("age", KeyRange::lower_bound(26, false));
        let found = pollster::block_on(db.find_many("people", &cond, None)).unwrap();
        assert_eq!(names(&found), vec!["ann"]);

        let tagged =
            pollster::block_on(db.find_many("people", &Cond::eq("tags", "b"), Some(1))).unwrap();
        assert_eq!(names(&tagged), vec!["ann"]);

        assert!(pollster::block_on(db.exists("people", &Cond::eq("tags", "c"))).unwrap());
        assert!(!pollster::block_on(db.exists("people", &Cond::eq("tags", "z"))).unwrap());
        assert_eq!(pollster::block_on(db.count("people", &Cond::eq("city", "oslo"))).unwrap(), 2);
        assert_eq!(pollster::block_on(db.count("people", &cond)).unwrap(), 1);
        assert_eq!(pollster::block_on(db.find_all("people")).unwrap().len(), 3);
        assert!(pollster::block_on(db.find_many("people", &Cond::new(), None))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_unknown_index_and_store() {
        let db = open(DatabaseConfig::new());
        seed(&db);
        assert!(matches!(
            pollster::block_on(db.find_one("people", &Cond::eq("shoe", 1))),
            Err(DbError::IndexNotFound { .. })
        ));
        assert!(matches!(
            pollster::block_on(db.find_all("nope")),
            Err(DbError::StoreNotFound(_))
        ));
    }

    #[test]
    fn test_filter_matches_json_text() {
        let db = open(DatabaseConfig::new());
        seed(&db);
        let needles = [("city", "os"), ("tags", "b")];
        let found = pollster::block_on(db.filter("people", &needles, None)).unwrap();
        assert_eq!(names(&found), vec!["ann"]);
        let none = pollster::block_on(db.filter("people", &[("missing", "x")], None)).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_update_and_upsert() {
        let db = open(DatabaseConfig::new());
        seed(&db);

        let updated = pollster::block_on(db.update_one(
            "people",
            &Cond::eq("name", "bob"),
            &json!({"id": 500, "city": "oslo"}),
        ))
        .unwrap()
        .unwrap();
        assert_eq!(updated["id"], 2);
        assert_eq!(updated["city"], "oslo");

        let many = pollster::block_on(db.update_many(
            "people",
            &Cond::eq("city", "oslo"),
            &json!({"city": "bergen"}),
            None,
        ))
        .unwrap();
        assert_eq!(many.len(), 3);
        assert!(many.iter().all(|d| d.as_ref().unwrap()["city"] == "bergen"));

        let existing = pollster::block_on(db.upsert_one(
            "people",
            &Cond::eq("name", "cat"),
            &json!({"age": 26}),
        ))
        .unwrap();
        assert_eq!(existing, Some(Key::from(3)));

        let created = pollster::block_on(db.upsert_one(
            "people",
            &Cond::eq("name", "dee"),
            &json!({"name": "dee", "age": 50}),
        ))
        .unwrap();
        assert_eq!(created, Some(Key::from(4)));

        assert_eq!(
            pollster::block_on(db.update_one("people", &Cond::eq("name", "nobody"), &json!({})))
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_remove() {
        let db = open(DatabaseConfig::new());
        seed(&db);
        assert!(pollster::block_on(db.remove_one("people", &Cond::eq("name", "bob"))).unwrap());
        assert!(!pollster::block_on(db.remove_one("people", &Cond::eq("name", "bob"))).unwrap());
        assert_eq!(
            pollster::block_on(db.remove_many("people", &Cond::eq("city", "oslo"))).unwrap(),
            2
        );
        assert_eq!(pollster::block_on(db.count_all("people")).unwrap(), 0);
    }

    #[test]
    fn test_fts_follows_mutations() {
        let db = open(DatabaseConfig::new().with_fts(FtsConfig::enabled().with_fields(["bio"])));
        let store = "people";
        pollster::block_on(async {
            db.insert_one(store, &json!({"name": "a", "bio": "foo bar foobar barfoo"}))
                .await
                .unwrap();
            db.insert_one(store, &json!({"name": "b", "bio": "foo foobar"})).await.unwrap();

            let found = db.find_many_by_terms(store, "foo foobar").await.unwrap();
            assert_eq!(names(&found), vec!["a", "b"]);
            assert!(db.find_many_by_terms(store, "zzz qqq").await.unwrap().is_empty());

            db.update_one(store, &Cond::eq("name", "b"), &json!({"bio": "barfoo"}))
                .await
                .unwrap();
            let found = db.find_many_by_terms(store, "barfoo").await.unwrap();
            assert_eq!(names(&found), vec!["a", "b"]);
            let found = db.find_many_by_terms(store, "foo").await.unwrap();
            assert_eq!(names(&found), vec!["a"]);

            db.remove_one(store, &Cond::eq("name", "a")).await.unwrap();
            let found = db.find_many_by_terms(store, "foo bar barfoo").await.unwrap();
            assert_eq!(names(&found), vec!["b"]);

            db.remove_many(store, &Cond::eq("name", "b")).await.unwrap();
            db.settle().await;
            assert_eq!(db.count_all(WORDS_STORE).await.unwrap(), 0);
            assert_eq!(db.count_all(IDS_STORE).await.unwrap(), 0);
        });
    }

    #[test]
    fn test_update_many_maintains_index() {
        let db = open(DatabaseConfig::new().with_fts(FtsConfig::enabled().with_fields(["city"])));
        seed(&db);
        pollster::block_on(async {
            db.update_many("people", &Cond::eq("city", "oslo"), &json!({"city": "tromso"}), None)
                .await
                .unwrap();
            assert!(db.find_many_by_terms("people", "oslo").await.unwrap().is_empty());
            let found = db.find_many_by_terms("people", "tromso").await.unwrap();
            assert_eq!(names(&found), vec!["ann", "cat"]);
        });
    }

    #[test]
    fn test_index_failure_does_not_fail_write() {
        let db = open(DatabaseConfig::new().with_fts(FtsConfig::enabled()));
        db.manager().backend().fail_writes(WORDS_STORE, true);

        let doc = json!({"name": "ann", "city": "oslo"});
        let id = pollster::block_on(db.insert_one("people", &doc)).unwrap();
        assert_eq!(id, Some(Key::from(1)));

        pollster::block_on(db.settle());
        assert_eq!(db.background().failures(), 1);
        assert_eq!(pollster::block_on(db.count_all("people")).unwrap(), 1);
        assert!(pollster::block_on(db.find_many_by_terms("people", "ann"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_find_many_by_terms_without_fts() {
        let db = open(DatabaseConfig::new());
        assert!(matches!(
            pollster::block_on(db.find_many_by_terms("people", "x")),
            Err(DbError::StoreNotFound(_))
        ));
    }

    #[test]
    fn test_enable_fts_after_open() {
        let db = open(DatabaseConfig::new());
        let before = db.manager().backend().database_version("db");
        pollster::block_on(db.enable_fts()).unwrap();
        assert_eq!(db.manager().backend().database_version("db"), before.map(|v| v + 1));
        assert!(db.fts_enabled());

        let doc = json!({"name": "ann", "city": "Oslo"});
        pollster::block_on(db.insert_one("people", &doc)).unwrap();
        let found = pollster::block_on(db.find_many_by_terms("people", "oslo")).unwrap();
        assert_eq!(names(&found), vec!["ann"]);

        // Already present: no further upgrade
        pollster::block_on(db.enable_fts()).unwrap();
        assert_eq!(db.manager().backend().database_version("db"), before.map(|v| v + 1));
    }

    #[test]
    fn test_op_history() {
        let db = open(DatabaseConfig::new().with_history(HistoryConfig::enabled()));
        assert_eq!(db.op_hist_status(), "enabled");
        db.set_max_history(2);
        pollster::block_on(async {
            for name in ["a", "b", "c"] {
                db.insert_one("people", &json!({ "name": name })).await.unwrap();
            }
            db.find_one("people", &Cond::eq("name", "a")).await.unwrap();
            db.update_one("people", &Cond::eq("name", "b"), &json!({"age": 1}))
                .await
                .unwrap();
            db.remove_one("people", &Cond::eq("name", "c")).await.unwrap();
            // Batch calls are not recorded
            db.insert_many("people", &[json!({"name": "d"})]).await.unwrap();

            let hist = db.get_op_hist("people", 10).await.unwrap();
            let created: Vec<_> = hist.create.iter().map(|e| e.id.clone()).collect();
            assert_eq!(created, vec![Key::from(3), Key::from(2)]);
            assert_eq!(hist.read[0].id, Key::from(1));
            assert_eq!(hist.update[0].id, Key::from(2));
            assert_eq!(hist.delete[0].id, Key::from(3));

            assert!(db.clear_op_hist("people").await.unwrap());
            assert!(db.get_op_hist("people", 10).await.unwrap().create.is_empty());
        });

        db.disable_op_hist();
        assert_eq!(db.op_hist_status(), "disabled");
    }

    #[test]
    fn test_drop_store() {
        let db = open(DatabaseConfig::new().with_fts(FtsConfig::enabled()));
        seed(&db);
        pollster::block_on(db.settle());
        pollster::block_on(db.drop_store("people")).unwrap();
        pollster::block_on(db.settle());

        assert!(matches!(
            pollster::block_on(db.count_all("people")),
            Err(DbError::StoreNotFound(_))
        ));
        assert!(!db.manager().spec().unwrap().contains_store("people"));
        assert_eq!(pollster::block_on(db.count_all(WORDS_STORE)).unwrap(), 0);

        // Reconciling the remembered spec does not bring it back
        let spec = db.manager().spec().unwrap();
        let again = pollster::block_on(db.open_av("db", &spec)).unwrap();
        assert!(!again.upgraded());
    }

    #[test]
    fn test_delete_database() {
        let db = open(DatabaseConfig::new());
        seed(&db);
        pollster::block_on(db.delete_database()).unwrap();
        assert_eq!(db.manager().backend().database_version("db"), None);
        assert!(matches!(
            pollster::block_on(db.find_all("people")),
            Err(DbError::NotOpened)
        ));
    }

    #[test]
    fn test_dropped_database_with_pending_work_is_freed() {
        let db = open(DatabaseConfig::new().with_fts(FtsConfig::enabled()));
        pollster::block_on(db.insert_one("people", &json!({"name": "ann"}))).unwrap();
        assert_eq!(db.background().pending(), 1);

        let weak = Rc::downgrade(&db.inner);
        drop(db);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_drop_missing_store() {
        let db = open(DatabaseConfig::new());
        assert!(matches!(
            pollster::block_on(db.drop_store("nope")),
            Err(DbError::StoreNotFound(_))
        ));
        assert_eq!(db.num_open(), 0);
    }

    #[test]
    fn test_cond_from_json() {
        let cond = Cond::from_json(&json!({"city": "oslo", "age": 30})).unwrap();
        assert_eq!(cond.terms().len(), 2);
        assert_eq!(cond.terms()[0].0, "city");
        assert!(Cond::from_json(&json!({"x": null})).is_err());
    }
}
