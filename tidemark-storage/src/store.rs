//! Entity store: the source of truth the cache must never contradict.
//!
//! Rows are versioned. Writes are staged per transaction and take a row
//! lock that is held until commit or rollback; a competing writer waits for
//! at most the configured lock timeout. Version checks happen after the
//! lock is held, so a writer that waited out a committed delete or update
//! fails with an optimistic conflict rather than overwriting it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tidemark_core::{
    CoherenceResult, ConcurrencyError, EntityKey, Identifier, StorageError, StoreConfig, TxId,
    Version,
};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// Committed (or staged) state of one row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub version: Version,
    pub state: Value,
}

impl Row {
    pub fn new(version: Version, state: Value) -> Self {
        Self { version, state }
    }
}

/// Transactional, versioned entity storage.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Next value of the identifier sequence.
    fn next_identifier(&self) -> Identifier;

    /// Committed state of `key`.
    fn read(&self, key: &EntityKey) -> CoherenceResult<Option<Row>>;

    /// State of `key` as seen inside `tx`, its own staged writes included.
    fn read_in(&self, tx: TxId, key: &EntityKey) -> CoherenceResult<Option<Row>>;

    /// Start a transaction.
    fn begin(&self, tx: TxId) -> CoherenceResult<()>;

    async fn stage_insert(&self, tx: TxId, key: &EntityKey, state: Value) -> CoherenceResult<()>;

    /// Stage an update guarded by `expected_version`. Returns the new version.
    async fn stage_update(
        &self,
        tx: TxId,
        key: &EntityKey,
        expected_version: Version,
        state: Value,
    ) -> CoherenceResult<Version>;

    async fn stage_delete(
        &self,
        tx: TxId,
        key: &EntityKey,
        expected_version: Version,
    ) -> CoherenceResult<()>;

    /// Stage deletion of every row of `entity_name`. Returns the row count.
    async fn stage_delete_all(&self, tx: TxId, entity_name: &str) -> CoherenceResult<u64>;

    /// Apply the staged writes of `tx` atomically and release its locks.
    fn commit(&self, tx: TxId) -> CoherenceResult<()>;

    /// Discard the staged writes of `tx` and release its locks.
    fn rollback(&self, tx: TxId) -> CoherenceResult<()>;

    /// Committed row count of `entity_name`.
    fn count(&self, entity_name: &str) -> CoherenceResult<u64>;
}

#[derive(Default)]
struct TxWork {
    /// `None` stages a delete.
    writes: HashMap<EntityKey, Option<Row>>,
    locks: HashMap<EntityKey, OwnedMutexGuard<()>>,
}

/// In-memory entity store with row locks.
pub struct InMemoryEntityStore {
    config: StoreConfig,
    sequence: AtomicI64,
    rows: RwLock<HashMap<EntityKey, Row>>,
    row_locks: Mutex<HashMap<EntityKey, Arc<tokio::sync::Mutex<()>>>>,
    txs: Mutex<HashMap<TxId, TxWork>>,
}

impl std::fmt::Debug for InMemoryEntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEntityStore")
            .field("config", &self.config)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryEntityStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl InMemoryEntityStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            sequence: AtomicI64::new(1),
            rows: RwLock::new(HashMap::new()),
            row_locks: Mutex::new(HashMap::new()),
            txs: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Whether `tx` has been begun and not yet finished.
    pub fn is_active(&self, tx: TxId) -> bool {
        self.txs
            .lock()
            .map(|txs| txs.contains_key(&tx))
            .unwrap_or(false)
    }

    fn lock_txs(&self) -> CoherenceResult<MutexGuard<'_, HashMap<TxId, TxWork>>> {
        self.txs.lock().map_err(|_| StorageError::LockPoisoned.into())
    }

    fn with_work<R>(
        &self,
        tx: TxId,
        f: impl FnOnce(&mut TxWork) -> CoherenceResult<R>,
    ) -> CoherenceResult<R> {
        let mut txs = self.lock_txs()?;
        let work = txs.get_mut(&tx).ok_or_else(|| StorageError::TransactionFailed {
            reason: format!("transaction {tx} is not active"),
        })?;
        f(work)
    }

    fn committed(&self, key: &EntityKey) -> CoherenceResult<Option<Row>> {
        let rows = self.rows.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(rows.get(key).cloned())
    }

    /// Row as seen by `tx`: its own staged write first, then committed state.
    fn effective(&self, work: &TxWork, key: &EntityKey) -> CoherenceResult<Option<Row>> {
        match work.writes.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => self.committed(key),
        }
    }

    /// Take the row lock for `key` on behalf of `tx`, waiting at most the
    /// configured lock timeout. Re-entrant per transaction.
    async fn lock_row(&self, tx: TxId, key: &EntityKey) -> CoherenceResult<()> {
        if self.with_work(tx, |work| Ok(work.locks.contains_key(key)))? {
            return Ok(());
        }

        let mutex = {
            let mut locks = self
                .row_locks
                .lock()
                .map_err(|_| StorageError::LockPoisoned)?;
            locks.entry(key.clone()).or_default().clone()
        };

        let waited = self.config.lock_timeout();
        let guard = tokio::time::timeout(waited, mutex.lock_owned())
            .await
            .map_err(|_| ConcurrencyError::LockTimeout {
                key: key.clone(),
                waited,
            })?;

        self.with_work(tx, |work| {
            work.locks.insert(key.clone(), guard);
            Ok(())
        })?;
        debug!(%key, %tx, "Row lock acquired");
        Ok(())
    }

    fn check_version(
        key: &EntityKey,
        expected: Version,
        current: Option<&Row>,
    ) -> Result<(), ConcurrencyError> {
        match current {
            Some(row) if row.version == expected => Ok(()),
            other => Err(ConcurrencyError::OptimisticConflict {
                key: key.clone(),
                expected: Some(expected),
                actual: other.map(|row| row.version),
            }),
        }
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    fn next_identifier(&self) -> Identifier {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn read(&self, key: &EntityKey) -> CoherenceResult<Option<Row>> {
        self.committed(key)
    }

    fn read_in(&self, tx: TxId, key: &EntityKey) -> CoherenceResult<Option<Row>> {
        self.with_work(tx, |work| self.effective(work, key))
    }

    fn begin(&self, tx: TxId) -> CoherenceResult<()> {
        let mut txs = self.lock_txs()?;
        if txs.contains_key(&tx) {
            return Err(StorageError::TransactionFailed {
                reason: format!("transaction {tx} already active"),
            }
            .into());
        }
        txs.insert(tx, TxWork::default());
        Ok(())
    }

    async fn stage_insert(&self, tx: TxId, key: &EntityKey, state: Value) -> CoherenceResult<()> {
        self.lock_row(tx, key).await?;
        self.with_work(tx, |work| {
            if self.effective(work, key)?.is_some() {
                return Err(StorageError::InsertFailed {
                    key: key.clone(),
                    reason: "already exists".to_string(),
                }
                .into());
            }
            work.writes.insert(key.clone(), Some(Row::new(0, state)));
            Ok(())
        })?;
        debug!(%key, %tx, "Insert staged");
        Ok(())
    }

    async fn stage_update(
        &self,
        tx: TxId,
        key: &EntityKey,
        expected_version: Version,
        state: Value,
    ) -> CoherenceResult<Version> {
        self.lock_row(tx, key).await?;
        let version = self.with_work(tx, |work| {
            let current = self.effective(work, key)?;
            Self::check_version(key, expected_version, current.as_ref())?;
            let version = expected_version + 1;
            work.writes.insert(key.clone(), Some(Row::new(version, state)));
            Ok(version)
        })?;
        debug!(%key, %tx, version, "Update staged");
        Ok(version)
    }

    async fn stage_delete(
        &self,
        tx: TxId,
        key: &EntityKey,
        expected_version: Version,
    ) -> CoherenceResult<()> {
        self.lock_row(tx, key).await?;
        self.with_work(tx, |work| {
            let current = self.effective(work, key)?;
            Self::check_version(key, expected_version, current.as_ref())?;
            work.writes.insert(key.clone(), None);
            Ok(())
        })?;
        debug!(%key, %tx, "Delete staged");
        Ok(())
    }

    async fn stage_delete_all(&self, tx: TxId, entity_name: &str) -> CoherenceResult<u64> {
        let mut keys: Vec<EntityKey> = {
            let rows = self.rows.read().map_err(|_| StorageError::LockPoisoned)?;
            rows.keys()
                .filter(|key| key.entity_name() == entity_name)
                .cloned()
                .collect()
        };
        self.with_work(tx, |work| {
            keys.extend(
                work.writes
                    .iter()
                    .filter(|(key, row)| key.entity_name() == entity_name && row.is_some())
                    .map(|(key, _)| key.clone()),
            );
            Ok(())
        })?;
        keys.sort();
        keys.dedup();

        // Sorted acquisition keeps two bulk deletes from deadlocking.
        for key in &keys {
            self.lock_row(tx, key).await?;
        }

        let deleted = self.with_work(tx, |work| {
            let mut deleted = 0u64;
            for key in &keys {
                if self.effective(work, key)?.is_some() {
                    work.writes.insert(key.clone(), None);
                    deleted += 1;
                }
            }
            Ok(deleted)
        })?;
        debug!(entity = entity_name, %tx, deleted, "Bulk delete staged");
        Ok(deleted)
    }

    fn commit(&self, tx: TxId) -> CoherenceResult<()> {
        let work = self
            .lock_txs()?
            .remove(&tx)
            .ok_or_else(|| StorageError::TransactionFailed {
                reason: format!("transaction {tx} is not active"),
            })?;

        let mut rows = self.rows.write().map_err(|_| StorageError::LockPoisoned)?;
        for (key, staged) in work.writes {
            match staged {
                Some(row) => {
                    rows.insert(key, row);
                }
                None => {
                    rows.remove(&key);
                }
            }
        }
        drop(rows);
        debug!(%tx, released = work.locks.len(), "Transaction committed");
        Ok(())
    }

    fn rollback(&self, tx: TxId) -> CoherenceResult<()> {
        if let Some(work) = self.lock_txs()?.remove(&tx) {
            debug!(%tx, discarded = work.writes.len(), "Transaction rolled back");
        }
        Ok(())
    }

    fn count(&self, entity_name: &str) -> CoherenceResult<u64> {
        let rows = self.rows.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(rows
            .keys()
            .filter(|key| key.entity_name() == entity_name)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tidemark_core::CoherenceError;

    fn store() -> Arc<InMemoryEntityStore> {
        Arc::new(InMemoryEntityStore::new(
            StoreConfig::default().with_lock_timeout(Duration::from_millis(50)),
        ))
    }

    fn key(id: i64) -> EntityKey {
        EntityKey::new("Item", id)
    }

    async fn seed(store: &InMemoryEntityStore, id: i64) {
        let tx = TxId::new();
        store.begin(tx).unwrap();
        store
            .stage_insert(tx, &key(id), json!({ "name": "chris" }))
            .await
            .unwrap();
        store.commit(tx).unwrap();
    }

    #[tokio::test]
    async fn test_insert_visible_only_after_commit() {
        let store = store();
        let tx = TxId::new();
        store.begin(tx).unwrap();
        store.stage_insert(tx, &key(1), json!({})).await.unwrap();
        assert!(store.read(&key(1)).unwrap().is_none());

        store.commit(tx).unwrap();
        assert_eq!(store.read(&key(1)).unwrap().map(|r| r.version), Some(0));
        assert_eq!(store.count("Item").unwrap(), 1);
        assert!(!store.is_active(tx));
    }

    #[tokio::test]
    async fn test_duplicate_insert_fails() {
        let store = store();
        seed(&store, 1).await;
        let tx = TxId::new();
        store.begin(tx).unwrap();
        let err = store.stage_insert(tx, &key(1), json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            CoherenceError::Storage(StorageError::InsertFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_bumps_version() {
        let store = store();
        seed(&store, 1).await;
        let tx = TxId::new();
        store.begin(tx).unwrap();
        let version = store
            .stage_update(tx, &key(1), 0, json!({ "name": "a" }))
            .await
            .unwrap();
        assert_eq!(version, 1);
        store.commit(tx).unwrap();
        assert_eq!(store.read(&key(1)).unwrap().unwrap().state["name"], "a");
    }

    #[tokio::test]
    async fn test_stale_version_is_optimistic_conflict() {
        let store = store();
        seed(&store, 1).await;
        let tx = TxId::new();
        store.begin(tx).unwrap();
        let err = store
            .stage_update(tx, &key(1), 5, json!({}))
            .await
            .unwrap_err();
        assert_eq!(
            err.as_conflict(),
            Some(&ConcurrencyError::OptimisticConflict {
                key: key(1),
                expected: Some(5),
                actual: Some(0),
            })
        );
    }

    #[tokio::test]
    async fn test_competing_writer_times_out_on_row_lock() {
        let store = store();
        seed(&store, 1).await;
        let first = TxId::new();
        let second = TxId::new();
        store.begin(first).unwrap();
        store.begin(second).unwrap();

        store.stage_delete(first, &key(1), 0).await.unwrap();
        let err = store
            .stage_update(second, &key(1), 0, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoherenceError::Concurrency(ConcurrencyError::LockTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_writer_after_committed_delete_conflicts() {
        let store = store();
        seed(&store, 1).await;
        let first = TxId::new();
        let second = TxId::new();
        store.begin(first).unwrap();
        store.begin(second).unwrap();

        store.stage_delete(first, &key(1), 0).await.unwrap();
        store.commit(first).unwrap();

        let err = store
            .stage_update(second, &key(1), 0, json!({}))
            .await
            .unwrap_err();
        assert_eq!(
            err.as_conflict(),
            Some(&ConcurrencyError::OptimisticConflict {
                key: key(1),
                expected: Some(0),
                actual: None,
            })
        );
        assert!(store.read(&key(1)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rollback_releases_locks_and_discards_writes() {
        let store = store();
        seed(&store, 1).await;
        let first = TxId::new();
        store.begin(first).unwrap();
        store
            .stage_update(first, &key(1), 0, json!({ "name": "lost" }))
            .await
            .unwrap();
        store.rollback(first).unwrap();
        store.rollback(first).unwrap();

        let second = TxId::new();
        store.begin(second).unwrap();
        assert_eq!(
            store.stage_update(second, &key(1), 0, json!({})).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_stage_delete_all() {
        let store = store();
        seed(&store, 1).await;
        seed(&store, 2).await;
        let tx = TxId::new();
        store.begin(tx).unwrap();
        store.stage_insert(tx, &key(3), json!({})).await.unwrap();

        assert_eq!(store.stage_delete_all(tx, "Item").await.unwrap(), 3);
        store.commit(tx).unwrap();
        assert_eq!(store.count("Item").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_in_sees_own_staged_writes() {
        let store = store();
        seed(&store, 1).await;
        seed(&store, 2).await;
        let tx = TxId::new();
        store.begin(tx).unwrap();

        store
            .stage_update(tx, &key(1), 0, json!({ "name": "staged" }))
            .await
            .unwrap();
        store.stage_delete_all(tx, "Item").await.unwrap();
        store.stage_insert(tx, &key(3), json!({})).await.unwrap();

        assert!(store.read_in(tx, &key(1)).unwrap().is_none());
        assert!(store.read_in(tx, &key(2)).unwrap().is_none());
        assert_eq!(store.read_in(tx, &key(3)).unwrap().map(|r| r.version), Some(0));

        // Other readers keep seeing committed state.
        assert_eq!(store.read(&key(1)).unwrap().unwrap().state["name"], "chris");
        assert!(store.read(&key(3)).unwrap().is_none());
        assert!(store.read_in(TxId::new(), &key(1)).is_err());
    }

    #[tokio::test]
    async fn test_operations_require_active_transaction() {
        let store = store();
        let err = store
            .stage_insert(TxId::new(), &key(1), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoherenceError::Storage(StorageError::TransactionFailed { .. })
        ));
        assert!(store.commit(TxId::new()).is_err());
    }

    #[test]
    fn test_identifier_sequence_is_monotonic() {
        let store = InMemoryEntityStore::default();
        let first = store.next_identifier();
        assert!(store.next_identifier() > first);
    }
}
