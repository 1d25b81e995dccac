//! IndexedDB engine for WASM targets.
//!
//! Wraps the web-sys bindings in the `Backend` / `Connection` /
//! `Transaction` traits. Every request is bridged to a future through a
//! oneshot channel fed by the request's success/error callbacks.
//!
//! Failed requests call `preventDefault()` on their error event so that a
//! single failure (e.g. a unique constraint on one item of a batch) does not
//! abort the surrounding transaction.

use super::{Backend, Connection, EngineError, Key, KeyPath, KeyRange, Transaction, TxMode};
use crate::schema::delta::{apply_delta, SchemaDelta, SchemaEditor};
use crate::schema::live::{IndexInfo, LiveSchema, StoreInfo};
use js_sys::Array;
use serde::Serialize;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{
    DomException, DomStringList, IdbDatabase, IdbFactory, IdbIndex, IdbIndexParameters,
    IdbKeyRange, IdbObjectStore, IdbObjectStoreParameters, IdbOpenDbRequest, IdbRequest,
    IdbTransaction, IdbTransactionMode,
};

/// Backend over the browser's IndexedDB (window or worker global).
#[derive(Clone, Default)]
pub struct IdbBackend;

impl IdbBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for IdbBackend {
    type Connection = IdbConnection;

    async fn open(
        &self,
        name: &str,
        version: Option<u32>,
        upgrade: Option<SchemaDelta>,
    ) -> Result<IdbConnection, EngineError> {
        let factory = idb_factory()?;
        let request = match version {
            Some(v) => factory.open_with_u32(name, v),
            None => factory.open(name),
        }
        .map_err(js_error)?;

        let blocked = Rc::new(Cell::new(false));
        let failure: Rc<RefCell<Option<EngineError>>> = Rc::new(RefCell::new(None));

        let db_name = name.to_string();
        let blocked_upgrade = blocked.clone();
        let failure_upgrade = failure.clone();
        let onupgradeneeded = Closure::wrap(Box::new(move |event: web_sys::IdbVersionChangeEvent| {
            let Some(request) = event
                .target()
                .and_then(|t| t.dyn_into::<IdbOpenDbRequest>().ok())
            else {
                return;
            };
            let Some(tx) = request.transaction() else {
                return;
            };

            // A blocked open already reported failure; it must not upgrade late.
            if blocked_upgrade.get() {
                log::warn!("Discarding late upgrade of {} after it was blocked", db_name);
                let _ = tx.abort();
                return;
            }

            let db = match request.result().and_then(|r| r.dyn_into::<IdbDatabase>()) {
                Ok(db) => db,
                Err(e) => {
                    *failure_upgrade.borrow_mut() = Some(js_error(e));
                    let _ = tx.abort();
                    return;
                }
            };

            log::info!(
                "Upgrading IndexedDB {} from v{} to v{}",
                db_name,
                event.old_version(),
                event.new_version().unwrap_or_default()
            );

            if let Some(delta) = &upgrade {
                let mut editor = UpgradeEditor { db, tx: tx.clone() };
                if let Err(e) = apply_delta(delta, &mut editor) {
                    log::error!("Upgrade of {} failed: {}", db_name, e);
                    *failure_upgrade.borrow_mut() = Some(e);
                    let _ = tx.abort();
                }
            }
        }) as Box<dyn FnMut(_)>);

        request.set_onupgradeneeded(Some(onupgradeneeded.as_ref().unchecked_ref()));

        let result = wait_for_open(&request, blocked).await;

        match &result {
            // The request stays pending; its callbacks must outlive this call.
            Err(EngineError::Blocked) => onupgradeneeded.forget(),
            _ => {
                request.set_onupgradeneeded(None);
                drop(onupgradeneeded);
            }
        }

        let db: IdbDatabase = match result {
            Ok(value) => value
                .dyn_into()
                .map_err(|_| EngineError::Provider("Failed to cast to IdbDatabase".to_string()))?,
            Err(e) => return Err(failure.borrow_mut().take().unwrap_or(e)),
        };

        let version = db.version() as u32;
        log::info!("Opened IndexedDB database: {} v{}", name, version);

        Ok(IdbConnection {
            db,
            name: name.to_string(),
            version,
            closed: Cell::new(false),
        })
    }

    /// Deletes a database. When other connections are open this reports
    /// `Blocked`; the browser still deletes it once they close.
    async fn delete_database(&self, name: &str) -> Result<(), EngineError> {
        let request = idb_factory()?.delete_database(name).map_err(js_error)?;
        wait_for_open(&request, Rc::new(Cell::new(false))).await?;
        log::info!("Deleted IndexedDB database: {}", name);
        Ok(())
    }
}

/// An open IndexedDB connection.
pub struct IdbConnection {
    db: IdbDatabase,
    name: String,
    version: u32,
    closed: Cell<bool>,
}

impl Connection for IdbConnection {
    type Transaction = IdbTx;

    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    async fn schema(&self) -> Result<LiveSchema, EngineError> {
        let names = dom_strings(&self.db.object_store_names());
        let mut stores = Vec::with_capacity(names.len());

        if !names.is_empty() {
            let tx = self
                .db
                .transaction_with_str_sequence_and_mode(
                    &js_names(&names),
                    IdbTransactionMode::Readonly,
                )
                .map_err(js_error)?;

            for name in names {
                let store = tx.object_store(&name).map_err(js_error)?;
                let mut indices = Vec::new();
                for index_name in dom_strings(&store.index_names()) {
                    let index = store.index(&index_name).map_err(js_error)?;
                    let key_path = index
                        .key_path()
                        .ok()
                        .and_then(|kp| key_path_from_js(&kp))
                        .ok_or_else(|| {
                            EngineError::Provider(format!("index {} has no key path", index_name))
                        })?;
                    indices.push(IndexInfo {
                        name: index_name,
                        key_path,
                        unique: index.unique(),
                        multi_entry: index.multi_entry(),
                    });
                }

                stores.push(StoreInfo {
                    key_path: store.key_path().ok().and_then(|kp| key_path_from_js(&kp)),
                    auto_increment: store.auto_increment(),
                    name,
                    indices,
                });
            }
        }

        Ok(LiveSchema {
            version: self.version,
            stores,
        })
    }

    fn transaction(&self, stores: &[&str], mode: TxMode) -> Result<IdbTx, EngineError> {
        let existing = self.db.object_store_names();
        if let Some(missing) = stores.iter().find(|s| !existing.contains(s)) {
            return Err(EngineError::StoreNotFound(missing.to_string()));
        }

        let idb_mode = match mode {
            TxMode::ReadOnly => IdbTransactionMode::Readonly,
            TxMode::ReadWrite => IdbTransactionMode::Readwrite,
        };
        let names: Vec<String> = stores.iter().map(|s| s.to_string()).collect();
        let tx = self
            .db
            .transaction_with_str_sequence_and_mode(&js_names(&names), idb_mode)
            .map_err(js_error)?;

        Ok(IdbTx { tx })
    }

    fn close(&self) {
        if !self.closed.replace(true) {
            self.db.close();
        }
    }
}

impl Drop for IdbConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// An IndexedDB transaction.
pub struct IdbTx {
    tx: IdbTransaction,
}

impl IdbTx {
    fn object_store(&self, store: &str) -> Result<IdbObjectStore, EngineError> {
        self.tx.object_store(store).map_err(|e| match exception_name(&e).as_deref() {
            Some("NotFoundError") => EngineError::StoreNotFound(store.to_string()),
            _ => js_error(e),
        })
    }

    fn index(&self, store: &str, index: &str) -> Result<IdbIndex, EngineError> {
        self.object_store(store)?
            .index(index)
            .map_err(|e| match exception_name(&e).as_deref() {
                Some("NotFoundError") => EngineError::IndexNotFound {
                    store: store.to_string(),
                    index: index.to_string(),
                },
                _ => js_error(e),
            })
    }
}

impl Transaction for IdbTx {
    async fn add(&self, store: &str, value: &Value) -> Result<Key, EngineError> {
        let request = self.object_store(store)?.add(&to_js(value)?).map_err(js_error)?;
        key_from_js(wait_for_request(&request).await?)
    }

    async fn put(&self, store: &str, value: &Value) -> Result<Key, EngineError> {
        let request = self.object_store(store)?.put(&to_js(value)?).map_err(js_error)?;
        key_from_js(wait_for_request(&request).await?)
    }

    async fn get(&self, store: &str, key: &Key) -> Result<Option<Value>, EngineError> {
        let request = self
            .object_store(store)?
            .get(&to_js(&key.to_value())?)
            .map_err(js_error)?;
        optional_from_js(wait_for_request(&request).await?)
    }

    async fn get_all(
        &self,
        store: &str,
        range: Option<&KeyRange>,
        limit: Option<u32>,
    ) -> Result<Vec<Value>, EngineError> {
        let store = self.object_store(store)?;
        let query = range_to_js(range)?;
        let request = match limit {
            Some(limit) => store.get_all_with_key_and_limit(&query, limit),
            None => store.get_all_with_key(&query),
        }
        .map_err(js_error)?;
        values_from_js(wait_for_request(&request).await?)
    }

    async fn delete(&self, store: &str, key: &Key) -> Result<(), EngineError> {
        let request = self
            .object_store(store)?
            .delete(&to_js(&key.to_value())?)
            .map_err(js_error)?;
        wait_for_request(&request).await?;
        Ok(())
    }

    async fn clear(&self, store: &str) -> Result<(), EngineError> {
        let request = self.object_store(store)?.clear().map_err(js_error)?;
        wait_for_request(&request).await?;
        Ok(())
    }

    async fn count(&self, store: &str, range: Option<&KeyRange>) -> Result<u64, EngineError> {
        let request = self
            .object_store(store)?
            .count_with_key(&range_to_js(range)?)
            .map_err(js_error)?;
        count_from_js(wait_for_request(&request).await?)
    }

    async fn index_get(
        &self,
        store: &str,
        index: &str,
        range: &KeyRange,
    ) -> Result<Option<Value>, EngineError> {
        let request = self
            .index(store, index)?
            .get(&range_to_js(Some(range))?)
            .map_err(js_error)?;
        optional_from_js(wait_for_request(&request).await?)
    }

    async fn index_get_all(
        &self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
        limit: Option<u32>,
    ) -> Result<Vec<Value>, EngineError> {
        let index = self.index(store, index)?;
        let query = range_to_js(range)?;
        let request = match limit {
            Some(limit) => index.get_all_with_key_and_limit(&query, limit),
            None => index.get_all_with_key(&query),
        }
        .map_err(js_error)?;
        values_from_js(wait_for_request(&request).await?)
    }

    async fn index_count(
        &self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
    ) -> Result<u64, EngineError> {
        let request = self
            .index(store, index)?
            .count_with_key(&range_to_js(range)?)
            .map_err(js_error)?;
        count_from_js(wait_for_request(&request).await?)
    }

    async fn done(self) -> Result<(), EngineError> {
        wait_for_transaction(&self.tx).await
    }
}

/// Schema edits issued from inside `onupgradeneeded`.
struct UpgradeEditor {
    db: IdbDatabase,
    tx: IdbTransaction,
}

impl SchemaEditor for UpgradeEditor {
    fn create_store(
        &mut self,
        name: &str,
        key_path: Option<&KeyPath>,
        auto_increment: bool,
    ) -> Result<(), EngineError> {
        let params = IdbObjectStoreParameters::new();
        if let Some(key_path) = key_path {
            params.set_key_path(&key_path_to_js(key_path));
        }
        params.set_auto_increment(auto_increment);
        self.db
            .create_object_store_with_optional_parameters(name, &params)
            .map_err(js_error)?;
        log::info!("Created IndexedDB object store: {}", name);
        Ok(())
    }

    fn delete_store(&mut self, name: &str) -> Result<(), EngineError> {
        self.db.delete_object_store(name).map_err(js_error)?;
        log::info!("Deleted IndexedDB object store: {}", name);
        Ok(())
    }

    fn create_index(&mut self, store: &str, index: &IndexInfo) -> Result<(), EngineError> {
        let target = self.tx.object_store(store).map_err(js_error)?;
        let params = IdbIndexParameters::new();
        params.set_unique(index.unique);
        params.set_multi_entry(index.multi_entry);
        match &index.key_path {
            KeyPath::Single(path) => {
                target.create_index_with_str_and_optional_parameters(&index.name, path, &params)
            }
            KeyPath::Compound(_) => target.create_index_with_str_sequence_and_optional_parameters(
                &index.name,
                &key_path_to_js(&index.key_path),
                &params,
            ),
        }
        .map_err(js_error)?;
        Ok(())
    }

    fn delete_index(&mut self, store: &str, name: &str) -> Result<(), EngineError> {
        self.tx
            .object_store(store)
            .map_err(js_error)?
            .delete_index(name)
            .map_err(js_error)
    }
}

/// The IndexedDB factory of the window, or of the worker global scope.
fn idb_factory() -> Result<IdbFactory, EngineError> {
    if let Some(window) = web_sys::window() {
        return window
            .indexed_db()
            .map_err(js_error)?
            .ok_or_else(|| EngineError::Provider("IndexedDB not available".to_string()));
    }

    let scope: web_sys::WorkerGlobalScope = js_sys::global()
        .dyn_into()
        .map_err(|_| EngineError::Provider("No window or worker global".to_string()))?;
    scope
        .indexed_db()
        .map_err(js_error)?
        .ok_or_else(|| EngineError::Provider("IndexedDB not available".to_string()))
}

/// Waits for an open or delete request, reporting `Blocked` as soon as the
/// browser signals that other connections hold the database.
async fn wait_for_open(
    request: &IdbOpenDbRequest,
    blocked: Rc<Cell<bool>>,
) -> Result<JsValue, EngineError> {
    let (tx, rx) = futures_channel::oneshot::channel::<Result<JsValue, EngineError>>();
    let tx = Rc::new(RefCell::new(Some(tx)));

    let tx_success = tx.clone();
    let onsuccess = Closure::wrap(Box::new(move |event: web_sys::Event| {
        let Some(request) = event.target().and_then(|t| t.dyn_into::<IdbRequest>().ok()) else {
            return;
        };
        let result = request.result().unwrap_or(JsValue::UNDEFINED);
        match tx_success.borrow_mut().take() {
            Some(tx) => {
                let _ = tx.send(Ok(result));
            }
            // Succeeded after we gave up on it: release the connection.
            None => {
                if let Ok(db) = result.dyn_into::<IdbDatabase>() {
                    db.close();
                }
            }
        }
    }) as Box<dyn FnMut(_)>);

    let tx_error = tx.clone();
    let onerror = Closure::wrap(Box::new(move |event: web_sys::Event| {
        event.prevent_default();
        let error = event
            .target()
            .and_then(|t| t.dyn_into::<IdbRequest>().ok())
            .map(|r| request_error(&r))
            .unwrap_or_else(|| EngineError::Provider("Unknown error".to_string()));
        if let Some(tx) = tx_error.borrow_mut().take() {
            let _ = tx.send(Err(error));
        }
    }) as Box<dyn FnMut(_)>);

    let tx_blocked = tx;
    let onblocked = Closure::wrap(Box::new(move |_event: web_sys::Event| {
        blocked.set(true);
        if let Some(tx) = tx_blocked.borrow_mut().take() {
            let _ = tx.send(Err(EngineError::Blocked));
        }
    }) as Box<dyn FnMut(_)>);

    request.set_onsuccess(Some(onsuccess.as_ref().unchecked_ref()));
    request.set_onerror(Some(onerror.as_ref().unchecked_ref()));
    request.set_onblocked(Some(onblocked.as_ref().unchecked_ref()));

    let result = rx
        .await
        .map_err(|_| EngineError::Provider("Channel closed".to_string()))?;

    if matches!(result, Err(EngineError::Blocked)) {
        onsuccess.forget();
        onerror.forget();
        onblocked.forget();
    } else {
        request.set_onsuccess(None);
        request.set_onerror(None);
        request.set_onblocked(None);
        drop(onsuccess);
        drop(onerror);
        drop(onblocked);
    }

    result
}

/// Waits for an IDB request to complete and returns the result.
async fn wait_for_request(request: &IdbRequest) -> Result<JsValue, EngineError> {
    let (tx, rx) = futures_channel::oneshot::channel::<Result<JsValue, EngineError>>();
    let tx = Rc::new(RefCell::new(Some(tx)));

    let tx_success = tx.clone();
    let onsuccess = Closure::wrap(Box::new(move |event: web_sys::Event| {
        let result = event
            .target()
            .and_then(|t| t.dyn_into::<IdbRequest>().ok())
            .and_then(|r| r.result().ok())
            .unwrap_or(JsValue::UNDEFINED);
        if let Some(tx) = tx_success.borrow_mut().take() {
            let _ = tx.send(Ok(result));
        }
    }) as Box<dyn FnMut(_)>);

    let tx_error = tx;
    let onerror = Closure::wrap(Box::new(move |event: web_sys::Event| {
        // Keep the transaction alive; the caller decides what a failure means.
        event.prevent_default();
        event.stop_propagation();
        let error = event
            .target()
            .and_then(|t| t.dyn_into::<IdbRequest>().ok())
            .map(|r| request_error(&r))
            .unwrap_or_else(|| EngineError::Provider("Unknown error".to_string()));
        if let Some(tx) = tx_error.borrow_mut().take() {
            let _ = tx.send(Err(error));
        }
    }) as Box<dyn FnMut(_)>);

    request.set_onsuccess(Some(onsuccess.as_ref().unchecked_ref()));
    request.set_onerror(Some(onerror.as_ref().unchecked_ref()));

    let result = rx
        .await
        .map_err(|_| EngineError::Provider("Channel closed".to_string()))?;

    request.set_onsuccess(None);
    request.set_onerror(None);

    drop(onsuccess);
    drop(onerror);

    result
}

/// Waits for an IDB transaction to commit.
async fn wait_for_transaction(tx: &IdbTransaction) -> Result<(), EngineError> {
    let (sender, rx) = futures_channel::oneshot::channel::<Result<(), EngineError>>();
    let sender = Rc::new(RefCell::new(Some(sender)));

    let tx_complete = sender.clone();
    let oncomplete = Closure::wrap(Box::new(move |_: web_sys::Event| {
        if let Some(tx) = tx_complete.borrow_mut().take() {
            let _ = tx.send(Ok(()));
        }
    }) as Box<dyn FnMut(_)>);

    let tx_abort = sender;
    let onabort = Closure::wrap(Box::new(move |event: web_sys::Event| {
        let error = event
            .target()
            .and_then(|t| t.dyn_into::<IdbTransaction>().ok())
            .and_then(|t| t.error())
            .map(|e| exception_error(&e))
            .unwrap_or_else(|| EngineError::Provider("Transaction aborted".to_string()));
        if let Some(tx) = tx_abort.borrow_mut().take() {
            let _ = tx.send(Err(error));
        }
    }) as Box<dyn FnMut(_)>);

    tx.set_oncomplete(Some(oncomplete.as_ref().unchecked_ref()));
    tx.set_onabort(Some(onabort.as_ref().unchecked_ref()));

    let result = rx
        .await
        .map_err(|_| EngineError::Provider("Channel closed".to_string()))?;

    tx.set_oncomplete(None);
    tx.set_onabort(None);

    drop(oncomplete);
    drop(onabort);

    result
}

fn request_error(request: &IdbRequest) -> EngineError {
    request
        .error()
        .ok()
        .flatten()
        .map(|e| exception_error(&e))
        .unwrap_or_else(|| EngineError::Provider("Unknown error".to_string()))
}

fn exception_error(e: &DomException) -> EngineError {
    let message = e.message();
    match e.name().as_str() {
        "ConstraintError" => EngineError::Constraint(message),
        "ReadOnlyError" => EngineError::ReadOnly,
        "DataError" => EngineError::InvalidKey(message),
        "InvalidStateError" | "TransactionInactiveError" => EngineError::InvalidState(message),
        name => EngineError::Provider(format!("{}: {}", name, message)),
    }
}

fn exception_name(value: &JsValue) -> Option<String> {
    value.dyn_ref::<DomException>().map(|e| e.name())
}

fn js_error(value: JsValue) -> EngineError {
    match value.dyn_ref::<DomException>() {
        Some(e) => exception_error(e),
        None => EngineError::Provider(format!("{:?}", value)),
    }
}

fn to_js(value: &Value) -> Result<JsValue, EngineError> {
    value
        .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
        .map_err(|e| EngineError::Provider(e.to_string()))
}

fn optional_from_js(value: JsValue) -> Result<Option<Value>, EngineError> {
    if value.is_undefined() || value.is_null() {
        return Ok(None);
    }
    serde_wasm_bindgen::from_value(value)
        .map(Some)
        .map_err(|e| EngineError::Provider(e.to_string()))
}

fn values_from_js(value: JsValue) -> Result<Vec<Value>, EngineError> {
    serde_wasm_bindgen::from_value(value).map_err(|e| EngineError::Provider(e.to_string()))
}

fn key_from_js(value: JsValue) -> Result<Key, EngineError> {
    let value: Value =
        serde_wasm_bindgen::from_value(value).map_err(|e| EngineError::Provider(e.to_string()))?;
    Key::from_value(&value).ok_or_else(|| EngineError::InvalidKey(value.to_string()))
}

fn count_from_js(value: JsValue) -> Result<u64, EngineError> {
    value
        .as_f64()
        .map(|n| n as u64)
        .ok_or_else(|| EngineError::Provider("count did not return a number".to_string()))
}

fn range_to_js(range: Option<&KeyRange>) -> Result<JsValue, EngineError> {
    let Some(range) = range else {
        return Ok(JsValue::UNDEFINED);
    };
    let key_range = match (&range.lower, &range.upper) {
        (Some(lower), Some(upper)) => IdbKeyRange::bound_with_lower_open_and_upper_open(
            &to_js(&lower.to_value())?,
            &to_js(&upper.to_value())?,
            range.lower_open,
            range.upper_open,
        ),
        (Some(lower), None) => {
            IdbKeyRange::lower_bound_with_open(&to_js(&lower.to_value())?, range.lower_open)
        }
        (None, Some(upper)) => {
            IdbKeyRange::upper_bound_with_open(&to_js(&upper.to_value())?, range.upper_open)
        }
        (None, None) => return Ok(JsValue::UNDEFINED),
    }
    .map_err(js_error)?;
    Ok(key_range.into())
}

fn key_path_to_js(key_path: &KeyPath) -> JsValue {
    match key_path {
        KeyPath::Single(path) => JsValue::from_str(path),
        KeyPath::Compound(paths) => paths
            .iter()
            .map(|p| JsValue::from_str(p))
            .collect::<Array>()
            .into(),
    }
}

fn key_path_from_js(value: &JsValue) -> Option<KeyPath> {
    if let Some(path) = value.as_string() {
        return Some(KeyPath::Single(path));
    }
    if Array::is_array(value) {
        let paths = Array::from(value)
            .iter()
            .map(|p| p.as_string())
            .collect::<Option<Vec<_>>>()?;
        return Some(KeyPath::Compound(paths));
    }
    None
}

fn dom_strings(list: &DomStringList) -> Vec<String> {
    (0..list.length()).filter_map(|i| list.item(i)).collect()
}

fn js_names(names: &[String]) -> JsValue {
    names
        .iter()
        .map(|n| JsValue::from_str(n))
        .collect::<Array>()
        .into()
}
