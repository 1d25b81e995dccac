//! Open-with-automatic-versioning.
//!
//! ```text
//! Closed -> Probing -> UpToDate  -> Open
//!                   \-> Upgrading -> Open
//! ```
//!
//! Probing opens the database at whatever version it has (creating it at
//! version 1), reads the live schema and closes again. An empty delta opens
//! at the same version; anything else opens at `version + 1` with the delta
//! applied inside the upgrade. A blocked or failed upgrade is reported as
//! `SchemaUpgradeBlocked` and never retried.

use super::Handle;
use crate::error::{DbError, Result};
use crate::schema::delta::{compute_delta, SchemaDelta};
use crate::schema::live::LiveSchema;
use crate::schema::IndexSpec;
use crate::storage::{Backend, Connection, EngineError};
use std::cell::Cell;
use std::rc::Rc;

/// Reconciliation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Closed,
    Probing,
    UpToDate,
    Upgrading,
    Open,
}

/// Outcome of a successful reconciliation.
pub struct Reconciled<C: Connection> {
    pub handle: Handle<C>,
    /// Version found while probing.
    pub previous_version: u32,
    /// Version the handle is open at.
    pub version: u32,
    /// Operations applied; empty when the schema was already current.
    pub delta: SchemaDelta,
}

impl<C: Connection> Reconciled<C> {
    pub fn upgraded(&self) -> bool {
        !self.delta.is_empty()
    }
}

/// Drives the probe/upgrade protocol against one backend.
pub struct Reconciler<B: Backend> {
    backend: B,
    phase: Cell<Phase>,
    open: Rc<Cell<usize>>,
}

impl<B: Backend> Reconciler<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            phase: Cell::new(Phase::Closed),
            open: Rc::new(Cell::new(0)),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Phase reached by the most recent reconciliation.
    pub fn phase(&self) -> Phase {
        self.phase.get()
    }

    /// Handles currently alive.
    pub fn open_count(&self) -> usize {
        self.open.get()
    }

    fn transition(&self, name: &str, next: Phase) {
        log::debug!("{}: {:?} -> {:?}", name, self.phase.get(), next);
        self.phase.set(next);
    }

    pub(crate) fn handle(&self, conn: B::Connection) -> Handle<B::Connection> {
        Handle::new(conn, self.open.clone())
    }

    /// Brings `name` in line with `spec`, upgrading only when they differ.
    pub async fn reconcile(
        &self,
        name: &str,
        spec: &IndexSpec,
    ) -> Result<Reconciled<B::Connection>> {
        spec.validate()?;

        let (current, live) = self.probe(name, true).await?;
        let delta = compute_delta(spec, &live);
        self.finish(name, current, delta).await
    }

    /// Applies an explicit delta (e.g. a store drop) with a version bump.
    pub async fn apply(&self, name: &str, delta: SchemaDelta) -> Result<Reconciled<B::Connection>> {
        let (current, _) = self.probe(name, false).await?;
        self.finish(name, current, delta).await
    }

    /// Opens at the current version without ever upgrading.
    pub async fn open_current(&self, name: &str) -> Result<Handle<B::Connection>> {
        let conn = self.backend.open(name, None, None).await?;
        Ok(self.handle(conn))
    }

    async fn probe(&self, name: &str, read_schema: bool) -> Result<(u32, LiveSchema)> {
        self.transition(name, Phase::Probing);

        let probed = async {
            let conn = self.backend.open(name, None, None).await?;
            let version = conn.version();
            let live = if read_schema {
                conn.schema().await
            } else {
                Ok(LiveSchema::default())
            };
            conn.close();
            Ok::<_, EngineError>((version, live?))
        }
        .await;

        match probed {
            Ok(found) => Ok(found),
            Err(e) => {
                self.transition(name, Phase::Closed);
                Err(e.into())
            }
        }
    }

    async fn finish(
        &self,
        name: &str,
        current: u32,
        delta: SchemaDelta,
    ) -> Result<Reconciled<B::Connection>> {
        let start = web_time::Instant::now();
        let opened = if delta.is_empty() {
            self.transition(name, Phase::UpToDate);
            self.backend.open(name, Some(current), None).await
        } else {
            self.transition(name, Phase::Upgrading);
            self.backend
                .open(name, Some(current + 1), Some(delta.clone()))
                .await
        };

        match opened {
            Ok(conn) => {
                self.transition(name, Phase::Open);
                let version = conn.version();
                if !delta.is_empty() {
                    log::info!(
                        "Upgraded {} from v{} to v{} ({} schema operations) in {:.1}ms",
                        name,
                        current,
                        version,
                        delta.len(),
                        start.elapsed().as_secs_f64() * 1000.0
                    );
                }
                Ok(Reconciled {
                    handle: self.handle(conn),
                    previous_version: current,
                    version,
                    delta,
                })
            }
            Err(EngineError::Blocked) => {
                log::warn!(
                    "Schema upgrade of {} to v{} blocked by another connection",
                    name,
                    current + 1
                );
                self.transition(name, Phase::Closed);
                Err(DbError::SchemaUpgradeBlocked)
            }
            Err(e) if !delta.is_empty() => {
                log::warn!("Schema upgrade of {} to v{} failed: {}", name, current + 1, e);
                self.transition(name, Phase::Closed);
                Err(DbError::SchemaUpgradeBlocked)
            }
            Err(e) => {
                self.transition(name, Phase::Closed);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;
    use crate::storage::{MemoryBackend, Transaction, TxMode};

    fn spec() -> IndexSpec {
        IndexSpec::new().with_store(
            "my_store",
            [("foo", FieldType::NonUniqueSingle), ("bar", FieldType::NonUniqueMulti)],
        )
    }

    #[test]
    fn test_fresh_database_upgrades_to_two() {
        let reconciler = Reconciler::new(MemoryBackend::new());
        let done = pollster::block_on(reconciler.reconcile("db", &spec())).unwrap();
        assert_eq!(done.previous_version, 1);
        assert_eq!(done.version, 2);
        assert!(done.upgraded());
        assert_eq!(reconciler.phase(), Phase::Open);
    }

    #[test]
    fn test_second_reconcile_is_empty() {
        let reconciler = Reconciler::new(MemoryBackend::new());
        drop(pollster::block_on(reconciler.reconcile("db", &spec())).unwrap());

        let again = pollster::block_on(reconciler.reconcile("db", &spec())).unwrap();
        assert!(again.delta.is_empty());
        assert_eq!(again.previous_version, 2);
        assert_eq!(again.version, 2);
    }

    #[test]
    fn test_blocked_upgrade_surfaces_error() {
        let reconciler = Reconciler::new(MemoryBackend::new());
        let holder = pollster::block_on(reconciler.reconcile("db", &spec())).unwrap();

        let changed = spec().with_store("other", [("x", FieldType::UniqueSingle)]);
        let result = pollster::block_on(reconciler.reconcile("db", &changed));
        assert!(matches!(result, Err(DbError::SchemaUpgradeBlocked)));
        assert_eq!(reconciler.phase(), Phase::Closed);
        assert_eq!(reconciler.backend().database_version("db"), Some(2));

        drop(holder);
        let done = pollster::block_on(reconciler.reconcile("db", &changed)).unwrap();
        assert_eq!(done.version, 3);
    }

    #[test]
    fn test_failed_upgrade_surfaces_blocked() {
        let reconciler = Reconciler::new(MemoryBackend::new());
        let loose = IndexSpec::new().with_store("s", [("foo", FieldType::NonUniqueSingle)]);
        let done = pollster::block_on(reconciler.reconcile("db", &loose)).unwrap();
        pollster::block_on(async {
            let tx = done.handle.transaction(&["s"], TxMode::ReadWrite).unwrap();
            tx.add("s", &serde_json::json!({"foo": 1})).await.unwrap();
            tx.add("s", &serde_json::json!({"foo": 1})).await.unwrap();
            tx.done().await.unwrap();
        });
        drop(done);

        // Existing duplicates make the unique index creation fail
        let strict = IndexSpec::new().with_store("s", [("foo", FieldType::UniqueSingle)]);
        let result = pollster::block_on(reconciler.reconcile("db", &strict));
        assert!(matches!(result, Err(DbError::SchemaUpgradeBlocked)));
        assert_eq!(reconciler.phase(), Phase::Closed);
        assert_eq!(reconciler.backend().database_version("db"), Some(2));
    }

    #[test]
    fn test_invalid_spec_fails_before_probing() {
        let reconciler = Reconciler::new(MemoryBackend::new());
        let bad = IndexSpec::new().with_store("s", [("foo,bar", FieldType::UniqueMulti)]);
        assert!(matches!(
            pollster::block_on(reconciler.reconcile("db", &bad)),
            Err(DbError::InvalidSpec(_))
        ));
        assert_eq!(reconciler.backend().database_version("db"), None);
    }

    #[test]
    fn test_apply_explicit_drop() {
        let reconciler = Reconciler::new(MemoryBackend::new());
        drop(pollster::block_on(reconciler.reconcile("db", &spec())).unwrap());

        let delta = SchemaDelta::drop_store("my_store");
        let done = pollster::block_on(reconciler.apply("db", delta)).unwrap();
        assert_eq!(done.version, 3);
        let live = pollster::block_on(done.handle.schema()).unwrap();
        assert!(live.store("my_store").is_none());
    }

    #[test]
    fn test_handles_are_counted() {
        let reconciler = Reconciler::new(MemoryBackend::new());
        let first = pollster::block_on(reconciler.reconcile("db", &spec())).unwrap();
        let second = pollster::block_on(reconciler.open_current("db")).unwrap();
        assert_eq!(reconciler.open_count(), 2);
        drop(first);
        second.close();
        assert_eq!(reconciler.open_count(), 0);
    }
}
