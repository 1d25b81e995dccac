//! In-process storage engine.
//!
//! Models the browser store closely enough that the document layer behaves
//! the same on both: databases carry a version, version changes are refused
//! while other connections are open, upgrades are all-or-nothing, and
//! indices honour unique / multi-entry flags. Data is not persisted across
//! process restarts.

use super::{Backend, Connection, EngineError, Key, KeyPath, KeyRange, Transaction, TxMode};
use crate::schema::delta::{apply_delta, SchemaDelta, SchemaEditor};
use crate::schema::live::{IndexInfo, LiveSchema, StoreInfo};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

/// In-memory backend. Clones share the same databases.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Rc<RefCell<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    databases: BTreeMap<String, MemDatabase>,
    next_connection: u64,
    #[cfg(test)]
    failing_stores: BTreeSet<String>,
}

#[derive(Clone, Default)]
struct MemDatabase {
    version: u32,
    stores: BTreeMap<String, MemStore>,
    open: BTreeSet<u64>,
}

#[derive(Clone)]
struct MemStore {
    key_path: Option<KeyPath>,
    auto_increment: bool,
    next_key: f64,
    records: BTreeMap<Key, Value>,
    indices: BTreeMap<String, IndexInfo>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version of a database, if it exists.
    pub fn database_version(&self, name: &str) -> Option<u32> {
        self.state.borrow().databases.get(name).map(|db| db.version)
    }

    /// Number of connections currently open on a database.
    pub fn open_connections(&self, name: &str) -> usize {
        self.state
            .borrow()
            .databases
            .get(name)
            .map(|db| db.open.len())
            .unwrap_or(0)
    }

    /// Makes every write to `store` fail until switched off again.
    #[cfg(test)]
    pub(crate) fn fail_writes(&self, store: &str, fail: bool) {
        let mut state = self.state.borrow_mut();
        if fail {
            state.failing_stores.insert(store.to_string());
        } else {
            state.failing_stores.remove(store);
        }
    }

    fn release(&self, name: &str, connection: u64) {
        if let Some(db) = self.state.borrow_mut().databases.get_mut(name) {
            db.open.remove(&connection);
        }
    }
}

impl Backend for MemoryBackend {
    type Connection = MemoryConnection;

    async fn open(
        &self,
        name: &str,
        version: Option<u32>,
        upgrade: Option<SchemaDelta>,
    ) -> Result<MemoryConnection, EngineError> {
        let mut state = self.state.borrow_mut();
        let connection = state.next_connection;
        state.next_connection += 1;

        let created = !state.databases.contains_key(name);
        let db = state.databases.entry(name.to_string()).or_default();
        let current = db.version;
        let target = version.unwrap_or(current.max(1));

        if target == 0 || target < current {
            return Err(EngineError::Version {
                requested: target,
                current,
            });
        }

        if target > current {
            if !db.open.is_empty() {
                log::warn!(
                    "Upgrade of {} to v{} blocked by {} open connection(s)",
                    name,
                    target,
                    db.open.len()
                );
                return Err(EngineError::Blocked);
            }

            let mut staged = db.clone();
            staged.version = target;
            if let Some(delta) = &upgrade {
                if let Err(e) = apply_delta(delta, &mut staged) {
                    if created {
                        state.databases.remove(name);
                    }
                    return Err(e);
                }
            }

            log::info!(
                "Upgraded in-memory database {} from v{} to v{}",
                name,
                current,
                target
            );
            *db = staged;
        }

        db.open.insert(connection);

        Ok(MemoryConnection {
            backend: self.clone(),
            name: name.to_string(),
            id: connection,
            version: target,
            closed: Cell::new(false),
        })
    }

    async fn delete_database(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.state.borrow_mut();
        if let Some(db) = state.databases.get(name) {
            if !db.open.is_empty() {
                return Err(EngineError::Blocked);
            }
        }
        state.databases.remove(name);
        Ok(())
    }
}

impl SchemaEditor for MemDatabase {
    fn create_store(
        &mut self,
        name: &str,
        key_path: Option<&KeyPath>,
        auto_increment: bool,
    ) -> Result<(), EngineError> {
        if self.stores.contains_key(name) {
            return Err(EngineError::Constraint(format!("store {} already exists", name)));
        }
        self.stores.insert(
            name.to_string(),
            MemStore {
                key_path: key_path.cloned(),
                auto_increment,
                next_key: 1.0,
                records: BTreeMap::new(),
                indices: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn delete_store(&mut self, name: &str) -> Result<(), EngineError> {
        self.stores
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::StoreNotFound(name.to_string()))
    }

    fn create_index(&mut self, store: &str, index: &IndexInfo) -> Result<(), EngineError> {
        let target = self
            .stores
            .get_mut(store)
            .ok_or_else(|| EngineError::StoreNotFound(store.to_string()))?;
        if target.indices.contains_key(&index.name) {
            return Err(EngineError::Constraint(format!(
                "index {} already exists on {}",
                index.name, store
            )));
        }
        if index.unique {
            let mut seen = BTreeSet::new();
            for value in target.records.values() {
                for key in index.key_path.index_keys(value, index.multi_entry) {
                    if !seen.insert(key.clone()) {
                        return Err(EngineError::Constraint(format!(
                            "existing data violates unique index {}/{} at {}",
                            store, index.name, key
                        )));
                    }
                }
            }
        }
        target.indices.insert(index.name.clone(), index.clone());
        Ok(())
    }

    fn delete_index(&mut self, store: &str, name: &str) -> Result<(), EngineError> {
        let target = self
            .stores
            .get_mut(store)
            .ok_or_else(|| EngineError::StoreNotFound(store.to_string()))?;
        target
            .indices
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::IndexNotFound {
                store: store.to_string(),
                index: name.to_string(),
            })
    }
}

impl MemStore {
    /// Resolves the primary key of `value`, generating one when allowed.
    fn primary_key(&mut self, value: &mut Value) -> Result<Key, EngineError> {
        let existing = self.key_path.as_ref().and_then(|path| path.extract(value));
        let key = match existing {
            Some(key) => key,
            None if self.auto_increment => {
                let key = Key::Number(self.next_key);
                if let Some(path) = &self.key_path {
                    if !path.inject(value, &key) {
                        return Err(EngineError::InvalidKey(format!(
                            "cannot write generated key at {}",
                            path
                        )));
                    }
                }
                key
            }
            None => {
                return Err(EngineError::InvalidKey(
                    "value has no primary key and store does not generate keys".to_string(),
                ))
            }
        };

        if let Some(n) = key.as_f64() {
            if self.auto_increment && n >= self.next_key {
                self.next_key = n.floor() + 1.0;
            }
        }
        Ok(key)
    }

    fn check_unique(&self, store: &str, primary: &Key, value: &Value) -> Result<(), EngineError> {
        for index in self.indices.values().filter(|i| i.unique) {
            let keys = index.key_path.index_keys(value, index.multi_entry);
            if keys.is_empty() {
                continue;
            }
            for (other_key, other) in &self.records {
                if other_key == primary {
                    continue;
                }
                let taken = index.key_path.index_keys(other, index.multi_entry);
                if let Some(dup) = keys.iter().find(|k| taken.contains(k)) {
                    return Err(EngineError::Constraint(format!(
                        "unique index {}/{} already holds {}",
                        store, index.name, dup
                    )));
                }
            }
        }
        Ok(())
    }

    /// `(index key, primary key, value)` triples in index order.
    fn index_entries(
        &self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
    ) -> Result<Vec<(Key, Key, &Value)>, EngineError> {
        let info = self.indices.get(index).ok_or_else(|| EngineError::IndexNotFound {
            store: store.to_string(),
            index: index.to_string(),
        })?;

        let mut entries = Vec::new();
        for (primary, value) in &self.records {
            for key in info.key_path.index_keys(value, info.multi_entry) {
                if range.map_or(true, |r| r.contains(&key)) {
                    entries.push((key, primary.clone(), value));
                }
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(entries)
    }
}

/// Connection to an in-memory database.
pub struct MemoryConnection {
    backend: MemoryBackend,
    name: String,
    id: u64,
    version: u32,
    closed: Cell<bool>,
}

impl Connection for MemoryConnection {
    type Transaction = MemoryTransaction;

    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    async fn schema(&self) -> Result<LiveSchema, EngineError> {
        let state = self.backend.state.borrow();
        let db = state
            .databases
            .get(&self.name)
            .ok_or_else(|| EngineError::InvalidState(format!("database {} deleted", self.name)))?;

        let stores = db
            .stores
            .iter()
            .map(|(name, store)| StoreInfo {
                name: name.clone(),
                key_path: store.key_path.clone(),
                auto_increment: store.auto_increment,
                indices: store.indices.values().cloned().collect(),
            })
            .collect();

        Ok(LiveSchema {
            version: db.version,
            stores,
        })
    }

    fn transaction(&self, stores: &[&str], mode: TxMode) -> Result<MemoryTransaction, EngineError> {
        if self.closed.get() {
            return Err(EngineError::InvalidState("connection is closed".to_string()));
        }

        let state = self.backend.state.borrow();
        let db = state
            .databases
            .get(&self.name)
            .ok_or_else(|| EngineError::InvalidState(format!("database {} deleted", self.name)))?;
        if let Some(missing) = stores.iter().find(|s| !db.stores.contains_key(**s)) {
            return Err(EngineError::StoreNotFound(missing.to_string()));
        }

        Ok(MemoryTransaction {
            backend: self.backend.clone(),
            database: self.name.clone(),
            scope: stores.iter().map(|s| s.to_string()).collect(),
            mode,
        })
    }

    fn close(&self) {
        if !self.closed.replace(true) {
            self.backend.release(&self.name, self.id);
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Transaction over an in-memory database.
///
/// Requests apply immediately; a failed request leaves earlier writes in
/// place and the transaction usable.
pub struct MemoryTransaction {
    backend: MemoryBackend,
    database: String,
    scope: Vec<String>,
    mode: TxMode,
}

impl MemoryTransaction {
    fn with_store<T>(
        &self,
        store: &str,
        write: bool,
        f: impl FnOnce(&mut MemStore) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        if !self.scope.iter().any(|s| s == store) {
            return Err(EngineError::StoreNotFound(store.to_string()));
        }
        if write && self.mode == TxMode::ReadOnly {
            return Err(EngineError::ReadOnly);
        }

        let mut state = self.backend.state.borrow_mut();
        #[cfg(test)]
        if write && state.failing_stores.contains(store) {
            return Err(EngineError::Provider(format!("injected write failure on {}", store)));
        }

        let db = state
            .databases
            .get_mut(&self.database)
            .ok_or_else(|| {
                EngineError::InvalidState(format!("database {} deleted", self.database))
            })?;
        let target = db
            .stores
            .get_mut(store)
            .ok_or_else(|| EngineError::StoreNotFound(store.to_string()))?;
        f(target)
    }
}

impl Transaction for MemoryTransaction {
    async fn add(&self, store: &str, value: &Value) -> Result<Key, EngineError> {
        let mut value = value.clone();
        self.with_store(store, true, |s| {
            let key = s.primary_key(&mut value)?;
            if s.records.contains_key(&key) {
                return Err(EngineError::Constraint(format!(
                    "key {} already exists in {}",
                    key, store
                )));
            }
            s.check_unique(store, &key, &value)?;
            s.records.insert(key.clone(), value);
            Ok(key)
        })
    }

    async fn put(&self, store: &str, value: &Value) -> Result<Key, EngineError> {
        let mut value = value.clone();
        self.with_store(store, true, |s| {
            let key = s.primary_key(&mut value)?;
            s.check_unique(store, &key, &value)?;
            s.records.insert(key.clone(), value);
            Ok(key)
        })
    }

    async fn get(&self, store: &str, key: &Key) -> Result<Option<Value>, EngineError> {
        self.with_store(store, false, |s| Ok(s.records.get(key).cloned()))
    }

    async fn get_all(
        &self,
        store: &str,
        range: Option<&KeyRange>,
        limit: Option<u32>,
    ) -> Result<Vec<Value>, EngineError> {
        self.with_store(store, false, |s| {
            Ok(s.records
                .iter()
                .filter(|(k, _)| range.map_or(true, |r| r.contains(k)))
                .take(limit.map_or(usize::MAX, |l| l as usize))
                .map(|(_, v)| v.clone())
                .collect())
        })
    }

    async fn delete(&self, store: &str, key: &Key) -> Result<(), EngineError> {
        self.with_store(store, true, |s| {
            s.records.remove(key);
            Ok(())
        })
    }

    async fn clear(&self, store: &str) -> Result<(), EngineError> {
        self.with_store(store, true, |s| {
            s.records.clear();
            Ok(())
        })
    }

    async fn count(&self, store: &str, range: Option<&KeyRange>) -> Result<u64, EngineError> {
        self.with_store(store, false, |s| {
            Ok(s.records
                .keys()
                .filter(|k| range.map_or(true, |r| r.contains(k)))
                .count() as u64)
        })
    }

    async fn index_get(
        &self,
        store: &str,
        index: &str,
        range: &KeyRange,
    ) -> Result<Option<Value>, EngineError> {
        self.with_store(store, false, |s| {
            Ok(s.index_entries(store, index, Some(range))?
                .into_iter()
                .next()
                .map(|(_, _, v)| v.clone()))
        })
    }

    async fn index_get_all(
        &self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
        limit: Option<u32>,
    ) -> Result<Vec<Value>, EngineError> {
        self.with_store(store, false, |s| {
            Ok(s.index_entries(store, index, range)?
                .into_iter()
                .take(limit.map_or(usize::MAX, |l| l as usize))
                .map(|(_, _, v)| v.clone())
                .collect())
        })
    }

    async fn index_count(
        &self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
    ) -> Result<u64, EngineError> {
        self.with_store(store, false, |s| {
            Ok(s.index_entries(store, index, range)?.len() as u64)
        })
    }

    async fn done(self) -> Result<(), EngineError> {
        Ok(())
    }
}
