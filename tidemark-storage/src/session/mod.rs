//! Transactional session facade.
//!
//! A [`Session`] is one unit of work: a persistence context, an action
//! queue flushed to the entity store, and one store transaction. Reads go
//! persistence context → second-level cache → store. Writes are queued and
//! hit the store at flush, each preceded by the cache strategy's pre-write
//! eviction.
//!
//! [`SessionFactory::with_tx_session`] turns lost write races into
//! [`TxOutcome::ConflictRolledBack`] instead of an error, so callers can
//! assert which concurrent writer won.

pub mod listener;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tidemark_core::{
    CoherenceError, CoherenceResult, ConcurrencyError, EntityKey, Identifier, PersistentEntity,
    StorageError, TxId, Version,
};
use tracing::{debug, info, warn};

pub use listener::TransactionListener;

use crate::cache::{CacheEntry, NonStrictInvalidationStrategy, RegionFactory};
use crate::mapping::PersistenceContextView;
use crate::store::{EntityStore, Row};

/// Future returned by a unit of work borrowing its session.
pub type SessionFuture<'s, T> = Pin<Box<dyn Future<Output = CoherenceResult<T>> + Send + 's>>;

/// How a unit of work ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TxOutcome<T> {
    Committed(T),
    /// The work completed but marked the transaction rollback-only.
    RolledBack(T),
    /// A write race was lost; the transaction was rolled back.
    ConflictRolledBack(ConcurrencyError),
}

impl<T> TxOutcome<T> {
    pub fn is_committed(&self) -> bool {
        matches!(self, TxOutcome::Committed(_))
    }

    /// The work's value, whether or not the transaction committed.
    pub fn value(self) -> Option<T> {
        match self {
            TxOutcome::Committed(value) | TxOutcome::RolledBack(value) => Some(value),
            TxOutcome::ConflictRolledBack(_) => None,
        }
    }

    pub fn conflict(&self) -> Option<&ConcurrencyError> {
        match self {
            TxOutcome::ConflictRolledBack(conflict) => Some(conflict),
            _ => None,
        }
    }
}

/// Creates sessions bound to one entity store and one set of cache regions.
pub struct SessionFactory {
    store: Arc<dyn EntityStore>,
    regions: Arc<RegionFactory>,
    strategies: RwLock<HashMap<String, Arc<NonStrictInvalidationStrategy>>>,
    listeners: RwLock<Vec<Arc<dyn TransactionListener>>>,
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("regions", &self.regions)
            .finish_non_exhaustive()
    }
}

impl SessionFactory {
    pub fn new(store: Arc<dyn EntityStore>, regions: Arc<RegionFactory>) -> Self {
        Self {
            store,
            regions,
            strategies: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn region_factory(&self) -> &Arc<RegionFactory> {
        &self.regions
    }

    /// Cache `entity_name` in a region of the same name. Idempotent.
    pub fn enable_caching(
        &self,
        entity_name: &str,
    ) -> CoherenceResult<Arc<NonStrictInvalidationStrategy>> {
        let mut strategies = self
            .strategies
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        if let Some(strategy) = strategies.get(entity_name) {
            return Ok(strategy.clone());
        }

        let region = self.regions.build_region(entity_name)?;
        let strategy = Arc::new(NonStrictInvalidationStrategy::new(region));
        strategies.insert(entity_name.to_string(), strategy.clone());
        self.add_listener(strategy.clone())?;
        info!(entity = entity_name, "Second-level caching enabled");
        Ok(strategy)
    }

    pub fn strategy_for(&self, entity_name: &str) -> Option<Arc<NonStrictInvalidationStrategy>> {
        self.strategies
            .read()
            .ok()
            .and_then(|strategies| strategies.get(entity_name).cloned())
    }

    /// Subscribe to every session opened from now on.
    pub fn add_listener(&self, listener: Arc<dyn TransactionListener>) -> CoherenceResult<()> {
        self.listeners
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .push(listener);
        Ok(())
    }

    /// Open a session with a fresh store transaction.
    pub fn open_session(&self) -> CoherenceResult<Session> {
        let tx = TxId::new();
        let strategies = self
            .strategies
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .clone();
        let listeners = self
            .listeners
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .clone();
        self.store.begin(tx)?;
        debug!(%tx, "Session opened");
        Ok(Session {
            tx,
            store: self.store.clone(),
            strategies,
            listeners,
            context: HashMap::new(),
            actions: Vec::new(),
            rollback_only: false,
            status: SessionStatus::Active,
        })
    }

    /// Run `work` in a new session, then commit, or roll back when the work
    /// marked the session rollback-only or lost a write race.
    ///
    /// Anything other than a concurrency failure is returned as `Err` after
    /// the rollback.
    pub async fn with_tx_session<T, F>(&self, work: F) -> CoherenceResult<TxOutcome<T>>
    where
        T: Send,
        F: for<'s> FnOnce(&'s mut Session) -> SessionFuture<'s, T> + Send,
    {
        let mut session = self.open_session()?;
        let tx = session.tx_id();
        let result = work(&mut session).await;

        match result {
            Ok(value) if session.is_rollback_only() => {
                session.rollback().await?;
                Ok(TxOutcome::RolledBack(value))
            }
            Ok(value) => match session.commit().await {
                Ok(()) => Ok(TxOutcome::Committed(value)),
                Err(CoherenceError::Concurrency(conflict)) => {
                    info!(%tx, key = %conflict.key(), error = %conflict, "Commit lost a write race");
                    Ok(TxOutcome::ConflictRolledBack(conflict))
                }
                Err(e) => Err(e),
            },
            Err(CoherenceError::Concurrency(conflict)) => {
                info!(%tx, key = %conflict.key(), error = %conflict, "Unit of work lost a write race");
                session.mark_rollback_only();
                session.rollback().await?;
                Ok(TxOutcome::ConflictRolledBack(conflict))
            }
            Err(e) => {
                if let Err(rollback_err) = session.rollback().await {
                    warn!(%tx, error = %rollback_err, "Rollback after failed unit of work failed");
                }
                Err(e)
            }
        }
    }

    /// Evict one entity from its region, outside any transaction.
    pub async fn evict_entity(&self, entity_name: &str, id: Identifier) {
        if let Some(strategy) = self.strategy_for(entity_name) {
            let key = EntityKey::new(entity_name, id);
            strategy.evict(&key).await;
            info!(%key, "Entity evicted");
        }
    }

    /// Evict every entity of `entity_name`.
    pub async fn evict_entity_region(&self, entity_name: &str) {
        if let Some(strategy) = self.strategy_for(entity_name) {
            strategy.evict_all().await;
            info!(entity = entity_name, "Entity region evicted");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone)]
struct ManagedEntry {
    version: Version,
    state: Value,
    deleted: bool,
}

#[derive(Debug)]
enum Action {
    Insert {
        key: EntityKey,
        state: Value,
    },
    Update {
        key: EntityKey,
        expected_version: Version,
        state: Value,
    },
    Delete {
        key: EntityKey,
        expected_version: Version,
    },
}

impl Action {
    fn key(&self) -> &EntityKey {
        match self {
            Action::Insert { key, .. } | Action::Update { key, .. } | Action::Delete { key, .. } => {
                key
            }
        }
    }
}

/// One unit of work against the entity store.
///
/// Dropping an active session rolls its transaction back.
pub struct Session {
    tx: TxId,
    store: Arc<dyn EntityStore>,
    strategies: HashMap<String, Arc<NonStrictInvalidationStrategy>>,
    listeners: Vec<Arc<dyn TransactionListener>>,
    context: HashMap<EntityKey, ManagedEntry>,
    actions: Vec<Action>,
    rollback_only: bool,
    status: SessionStatus,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tx", &self.tx)
            .field("status", &self.status)
            .field("rollback_only", &self.rollback_only)
            .field("managed", &self.context.len())
            .field("queued", &self.actions.len())
            .finish()
    }
}

impl Session {
    pub fn tx_id(&self) -> TxId {
        self.tx
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    pub fn mark_rollback_only(&mut self) {
        if !self.rollback_only {
            debug!(tx = %self.tx, "Transaction marked rollback-only");
        }
        self.rollback_only = true;
    }

    /// Whether `key` is managed by this session and not deleted.
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.context.get(key).is_some_and(|entry| !entry.deleted)
    }

    fn ensure_active(&self) -> CoherenceResult<()> {
        if self.status != SessionStatus::Active {
            return Err(StorageError::TransactionFailed {
                reason: format!("session for transaction {} is {:?}", self.tx, self.status),
            }
            .into());
        }
        Ok(())
    }

    fn strategy(&self, entity_name: &str) -> Option<Arc<NonStrictInvalidationStrategy>> {
        self.strategies.get(entity_name).cloned()
    }

    fn to_state<E: PersistentEntity>(entity: &E) -> CoherenceResult<Value> {
        serde_json::to_value(entity).map_err(|e| {
            StorageError::Serialization {
                entity_name: E::ENTITY_NAME.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn from_state<E: PersistentEntity>(
        key: &EntityKey,
        state: Value,
        version: Version,
    ) -> CoherenceResult<E> {
        let mut entity: E =
            serde_json::from_value(state).map_err(|e| StorageError::Serialization {
                entity_name: E::ENTITY_NAME.to_string(),
                reason: e.to_string(),
            })?;
        entity.set_id(key.identifier());
        entity.set_version(version);
        Ok(entity)
    }

    /// Make a new entity persistent. The identifier comes from the store
    /// sequence; the row is inserted at flush.
    pub fn persist<E: PersistentEntity>(&mut self, entity: &mut E) -> CoherenceResult<Identifier> {
        self.ensure_active()?;
        let id = self.store.next_identifier();
        entity.set_id(id);
        entity.set_version(0);

        let key = entity.entity_key();
        let state = Self::to_state(entity)?;
        self.context.insert(
            key.clone(),
            ManagedEntry {
                version: 0,
                state: state.clone(),
                deleted: false,
            },
        );
        self.actions.push(Action::Insert {
            key: key.clone(),
            state,
        });
        info!(%key, tx = %self.tx, "Entity persisted");
        Ok(id)
    }

    /// Load an entity: persistence context, then cache, then store.
    pub async fn load<E: PersistentEntity>(&mut self, id: Identifier) -> CoherenceResult<Option<E>> {
        self.ensure_active()?;
        let key = E::key_for(id);
        if let Some(entry) = self.context.get(&key) {
            if entry.deleted {
                return Ok(None);
            }
            return Self::from_state(&key, entry.state.clone(), entry.version).map(Some);
        }

        let Some(row) = self.fetch(&key).await? else {
            return Ok(None);
        };
        let entity = Self::from_state(&key, row.state.clone(), row.version)?;
        self.context.insert(
            key,
            ManagedEntry {
                version: row.version,
                state: row.state,
                deleted: false,
            },
        );
        Ok(Some(entity))
    }

    /// Read-through for a key not yet in the persistence context.
    async fn fetch(&self, key: &EntityKey) -> CoherenceResult<Option<Row>> {
        let Some(strategy) = self.strategy(key.entity_name()) else {
            return self.store.read_in(self.tx, key);
        };

        if let Some(entry) = strategy.get(self.tx, key).await {
            debug!(%key, version = entry.version(), "Second-level cache hit");
            return Ok(Some(Row::new(entry.version(), entry.into_state())));
        }

        let pending = strategy.before_load(self.tx, key).await;
        let row = self.store.read_in(self.tx, key);
        if let Some(pending) = pending {
            match &row {
                Ok(Some(row)) => {
                    let entry = CacheEntry::new(row.version, row.state.clone());
                    strategy.after_load(self.tx, &pending, entry).await;
                }
                Ok(None) | Err(_) => strategy.abandon_load(self.tx, &pending).await,
            }
        }
        row
    }

    /// Schedule an update of a managed or detached entity.
    ///
    /// The expected version is the one this session loaded, or the
    /// entity's own version when it is not managed here.
    pub fn update<E: PersistentEntity>(&mut self, entity: &E) -> CoherenceResult<()> {
        self.ensure_active()?;
        let key = entity.entity_key();
        let state = Self::to_state(entity)?;

        if let Some(queued) = self.actions.iter_mut().find(|a| a.key() == &key) {
            match queued {
                Action::Insert { state: queued, .. } | Action::Update { state: queued, .. } => {
                    *queued = state.clone();
                }
                Action::Delete { .. } => {
                    return Err(StorageError::TransactionFailed {
                        reason: format!("{key} is scheduled for deletion"),
                    }
                    .into());
                }
            }
        } else {
            let expected_version = self
                .context
                .get(&key)
                .map(|entry| entry.version)
                .unwrap_or_else(|| entity.version());
            self.actions.push(Action::Update {
                key: key.clone(),
                expected_version,
                state: state.clone(),
            });
        }

        let version = self
            .context
            .get(&key)
            .map(|entry| entry.version)
            .unwrap_or_else(|| entity.version());
        self.context.insert(
            key,
            ManagedEntry {
                version,
                state,
                deleted: false,
            },
        );
        Ok(())
    }

    /// Schedule deletion of an entity.
    pub fn delete<E: PersistentEntity>(&mut self, entity: &E) -> CoherenceResult<()> {
        self.ensure_active()?;
        let key = entity.entity_key();

        let queued_insert = self
            .actions
            .iter()
            .any(|a| matches!(a, Action::Insert { key: k, .. } if k == &key));
        self.actions.retain(|a| a.key() != &key);
        if queued_insert {
            self.context.remove(&key);
            return Ok(());
        }

        let expected_version = self
            .context
            .get(&key)
            .map(|entry| entry.version)
            .unwrap_or_else(|| entity.version());
        self.actions.push(Action::Delete {
            key: key.clone(),
            expected_version,
        });
        match self.context.get_mut(&key) {
            Some(entry) => entry.deleted = true,
            None => {
                self.context.insert(
                    key,
                    ManagedEntry {
                        version: expected_version,
                        state: Value::Null,
                        deleted: true,
                    },
                );
            }
        }
        Ok(())
    }

    /// Load then delete by identifier. Returns false when the row is absent.
    pub async fn delete_by_id<E: PersistentEntity>(&mut self, id: Identifier) -> CoherenceResult<bool> {
        match self.load::<E>(id).await? {
            Some(entity) => {
                self.delete(&entity)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Bulk delete of every row of `entity_name`, executed immediately.
    ///
    /// Pending actions are flushed first. The whole region is invalidated
    /// until this transaction completes.
    pub async fn execute_delete_all(&mut self, entity_name: &str) -> CoherenceResult<u64> {
        self.flush().await?;
        if let Some(strategy) = self.strategy(entity_name) {
            strategy.before_bulk_write(self.tx).await;
        }

        let deleted = match self.store.stage_delete_all(self.tx, entity_name).await {
            Ok(deleted) => deleted,
            Err(e) => {
                self.mark_rollback_only();
                return Err(e);
            }
        };
        for (_, entry) in self
            .context
            .iter_mut()
            .filter(|(key, _)| key.entity_name() == entity_name)
        {
            entry.deleted = true;
        }
        info!(entity = entity_name, deleted, tx = %self.tx, "Bulk delete executed");
        Ok(deleted)
    }

    /// Write queued actions to the store.
    ///
    /// On failure the transaction is marked rollback-only and the
    /// remaining actions are dropped.
    pub async fn flush(&mut self) -> CoherenceResult<()> {
        self.ensure_active()?;
        for listener in &self.listeners {
            listener.before_flush(self.tx).await;
        }

        let actions = std::mem::take(&mut self.actions);
        for action in actions {
            if let Err(e) = self.execute(action).await {
                self.mark_rollback_only();
                if let Some(conflict) = e.as_conflict() {
                    info!(tx = %self.tx, key = %conflict.key(), error = %conflict, "Flush lost a write race");
                }
                return Err(e);
            }
        }

        for listener in &self.listeners {
            listener.after_flush(self.tx).await;
        }
        Ok(())
    }

    async fn execute(&mut self, action: Action) -> CoherenceResult<()> {
        match action {
            Action::Insert { key, state } => {
                self.store.stage_insert(self.tx, &key, state).await?;
            }
            Action::Update {
                key,
                expected_version,
                state,
            } => {
                if let Some(strategy) = self.strategy(key.entity_name()) {
                    strategy.before_write(self.tx, &key).await;
                }
                let version = self
                    .store
                    .stage_update(self.tx, &key, expected_version, state)
                    .await?;
                if let Some(entry) = self.context.get_mut(&key) {
                    entry.version = version;
                }
            }
            Action::Delete {
                key,
                expected_version,
            } => {
                if let Some(strategy) = self.strategy(key.entity_name()) {
                    strategy.before_write(self.tx, &key).await;
                }
                self.store
                    .stage_delete(self.tx, &key, expected_version)
                    .await?;
            }
        }
        Ok(())
    }

    /// Flush and commit. A failed flush or commit rolls back.
    pub async fn commit(mut self) -> CoherenceResult<()> {
        self.ensure_active()?;
        if self.rollback_only {
            self.finish_rollback().await?;
            return Err(StorageError::TransactionFailed {
                reason: format!("transaction {} is marked rollback-only", self.tx),
            }
            .into());
        }

        let committed = match self.flush().await {
            Ok(()) => self.store.commit(self.tx),
            Err(e) => Err(e),
        };
        if let Err(e) = committed {
            if let Err(rollback_err) = self.finish_rollback().await {
                warn!(tx = %self.tx, error = %rollback_err, "Rollback after failed commit failed");
            }
            return Err(e);
        }

        self.status = SessionStatus::Committed;
        debug!(tx = %self.tx, "Transaction committed");
        for listener in &self.listeners {
            listener.after_commit(self.tx).await;
        }
        Ok(())
    }

    pub async fn rollback(mut self) -> CoherenceResult<()> {
        self.ensure_active()?;
        self.finish_rollback().await
    }

    async fn finish_rollback(&mut self) -> CoherenceResult<()> {
        let result = self.store.rollback(self.tx);
        self.status = SessionStatus::RolledBack;
        self.actions.clear();
        debug!(tx = %self.tx, "Transaction rolled back");
        for listener in &self.listeners {
            listener.after_rollback(self.tx).await;
        }
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.status != SessionStatus::Active {
            return;
        }
        let tx = self.tx;
        warn!(%tx, "Session dropped while active; rolling back");
        if let Err(e) = self.store.rollback(tx) {
            warn!(%tx, error = %e, "Rollback of dropped session failed");
        }
        self.status = SessionStatus::RolledBack;

        let listeners = std::mem::take(&mut self.listeners);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for listener in listeners {
                        listener.after_rollback(tx).await;
                    }
                });
            }
            Err(_) => {
                warn!(%tx, "No runtime to notify listeners of dropped session; windows close on max-idle");
            }
        }
    }
}

impl PersistenceContextView for Session {
    fn context_entity_identifier(&self, owner: &EntityKey) -> Option<Identifier> {
        self.contains(owner).then(|| owner.identifier())
    }

    fn is_property_null(&self, owner: &EntityKey, property: &str) -> bool {
        self.context
            .get(owner)
            .filter(|entry| !entry.deleted)
            .map(|entry| entry.state.get(property).map_or(true, Value::is_null))
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEntityStore;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tidemark_core::{RegionFactoryConfig, StoreConfig, TestTimeSource};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: Identifier,
        version: Version,
        text: String,
        #[serde(default)]
        parent: Option<Identifier>,
    }

    impl Note {
        fn new(text: &str) -> Self {
            Self {
                id: 0,
                version: 0,
                text: text.to_string(),
                parent: None,
            }
        }
    }

    impl PersistentEntity for Note {
        const ENTITY_NAME: &'static str = "Note";

        fn id(&self) -> Identifier {
            self.id
        }
        fn set_id(&mut self, id: Identifier) {
            self.id = id;
        }
        fn version(&self) -> Version {
            self.version
        }
        fn set_version(&mut self, version: Version) {
            self.version = version;
        }
    }

    fn factory() -> SessionFactory {
        let store = Arc::new(InMemoryEntityStore::new(
            StoreConfig::default().with_lock_timeout(Duration::from_millis(50)),
        ));
        let regions = Arc::new(
            RegionFactory::start(RegionFactoryConfig::new(), Arc::new(TestTimeSource::new()))
                .unwrap(),
        );
        let factory = SessionFactory::new(store, regions);
        factory.enable_caching(Note::ENTITY_NAME).unwrap();
        factory
    }

    async fn insert(factory: &SessionFactory, text: &str) -> Identifier {
        let mut note = Note::new(text);
        let outcome = factory
            .with_tx_session(move |s| Box::pin(async move { s.persist(&mut note) }))
            .await
            .unwrap();
        outcome.value().unwrap()
    }

    async fn cached_keys(factory: &SessionFactory) -> Vec<EntityKey> {
        factory
            .strategy_for(Note::ENTITY_NAME)
            .unwrap()
            .region()
            .keys()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_persist_then_load_populates_cache() {
        let factory = factory();
        let id = insert(&factory, "first").await;
        assert!(cached_keys(&factory).await.is_empty());

        let loaded = factory
            .with_tx_session(move |s| Box::pin(async move { s.load::<Note>(id).await }))
            .await
            .unwrap()
            .value()
            .flatten()
            .unwrap();
        assert_eq!(loaded.text, "first");
        assert_eq!(loaded.id, id);
        assert_eq!(cached_keys(&factory).await, vec![Note::key_for(id)]);
    }

    #[tokio::test]
    async fn test_update_evicts_and_commits_new_version() {
        let factory = factory();
        let id = insert(&factory, "first").await;

        let outcome = factory
            .with_tx_session(move |s| {
                Box::pin(async move {
                    let mut note = s.load::<Note>(id).await?.unwrap();
                    note.text = "second".to_string();
                    s.update(&note)?;
                    s.flush().await?;
                    Ok(())
                })
            })
            .await
            .unwrap();
        assert!(outcome.is_committed());
        assert!(cached_keys(&factory).await.is_empty());

        let row = factory.store().read(&Note::key_for(id)).unwrap().unwrap();
        assert_eq!(row.version, 1);
        assert_eq!(row.state["text"], "second");
    }

    #[tokio::test]
    async fn test_stale_update_is_conflict_rolled_back() {
        let factory = factory();
        let id = insert(&factory, "first").await;

        let mut stale = Note::new("stale");
        stale.id = id;
        stale.version = 7;
        let outcome = factory
            .with_tx_session(move |s| Box::pin(async move { s.update(&stale) }))
            .await
            .unwrap();

        assert!(matches!(
            outcome.conflict(),
            Some(ConcurrencyError::OptimisticConflict {
                expected: Some(7),
                actual: Some(0),
                ..
            })
        ));
        assert_eq!(
            factory.store().read(&Note::key_for(id)).unwrap().unwrap().version,
            0
        );
    }

    #[tokio::test]
    async fn test_rollback_only_discards_writes() {
        let factory = factory();
        let outcome = factory
            .with_tx_session(|s| {
                Box::pin(async move {
                    let mut note = Note::new("never");
                    let id = s.persist(&mut note)?;
                    s.flush().await?;
                    s.mark_rollback_only();
                    Ok(id)
                })
            })
            .await
            .unwrap();

        let id = match outcome {
            TxOutcome::RolledBack(id) => id,
            other => panic!("expected rollback, got {other:?}"),
        };
        assert!(factory.store().read(&Note::key_for(id)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_and_execute_delete_all() {
        let factory = factory();
        let first = insert(&factory, "a").await;
        insert(&factory, "b").await;

        factory
            .with_tx_session(move |s| {
                Box::pin(async move {
                    assert!(s.delete_by_id::<Note>(first).await?);
                    assert!(!s.delete_by_id::<Note>(first).await?);
                    Ok(())
                })
            })
            .await
            .unwrap();
        assert_eq!(factory.store().count(Note::ENTITY_NAME).unwrap(), 1);

        let deleted = factory
            .with_tx_session(|s| Box::pin(async move { s.execute_delete_all(Note::ENTITY_NAME).await }))
            .await
            .unwrap()
            .value()
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(factory.store().count(Note::ENTITY_NAME).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_load_after_delete_all_in_same_session_finds_nothing() {
        let factory = factory();
        let id = insert(&factory, "doomed").await;

        let outcome = factory
            .with_tx_session(move |s| {
                Box::pin(async move {
                    s.execute_delete_all(Note::ENTITY_NAME).await?;
                    let after_delete = s.load::<Note>(id).await?;

                    let mut fresh = Note::new("fresh");
                    s.persist(&mut fresh)?;
                    s.flush().await?;
                    let staged = s.load::<Note>(fresh.id).await?;
                    Ok((after_delete, staged.map(|note| note.text)))
                })
            })
            .await
            .unwrap();

        let (after_delete, staged) = outcome.value().unwrap();
        assert!(after_delete.is_none());
        assert_eq!(staged.as_deref(), Some("fresh"));
        assert!(cached_keys(&factory).await.is_empty());
        assert_eq!(factory.store().count(Note::ENTITY_NAME).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_persist_then_delete_in_same_session_is_noop() {
        let factory = factory();
        factory
            .with_tx_session(|s| {
                Box::pin(async move {
                    let mut note = Note::new("ephemeral");
                    s.persist(&mut note)?;
                    s.delete(&note)?;
                    Ok(())
                })
            })
            .await
            .unwrap();
        assert_eq!(factory.store().count(Note::ENTITY_NAME).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fatal_error_is_returned_after_rollback() {
        let factory = factory();
        let err = factory
            .with_tx_session(|s| {
                Box::pin(async move {
                    let mut note = Note::new("x");
                    s.persist(&mut note)?;
                    s.flush().await?;
                    Err::<(), _>(CoherenceError::from(StorageError::TransactionFailed {
                        reason: "boom".to_string(),
                    }))
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoherenceError::Storage(_)));
        assert_eq!(factory.store().count(Note::ENTITY_NAME).unwrap(), 0);
    }

    #[derive(Default)]
    struct CountingListener {
        flushes: AtomicUsize,
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TransactionListener for CountingListener {
        async fn after_flush(&self, _tx: TxId) {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }
        async fn after_commit(&self, _tx: TxId) {
            self.commits.fetch_add(1, Ordering::SeqCst);
        }
        async fn after_rollback(&self, _tx: TxId) {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_listeners_observe_lifecycle() {
        let factory = factory();
        let listener = Arc::new(CountingListener::default());
        factory.add_listener(listener.clone()).unwrap();

        insert(&factory, "a").await;
        factory
            .with_tx_session(|s| {
                Box::pin(async move {
                    s.mark_rollback_only();
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert_eq!(listener.commits.load(Ordering::SeqCst), 1);
        assert_eq!(listener.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(listener.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_session_rolls_back() {
        let factory = factory();
        let id = {
            let mut session = factory.open_session().unwrap();
            let mut note = Note::new("dropped");
            let id = session.persist(&mut note).unwrap();
            session.flush().await.unwrap();
            id
        };
        assert!(factory.store().read(&Note::key_for(id)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persistence_context_view() {
        let factory = factory();
        let mut session = factory.open_session().unwrap();
        let mut note = Note::new("owner");
        session.persist(&mut note).unwrap();
        let key = note.entity_key();

        assert_eq!(session.context_entity_identifier(&key), Some(note.id));
        assert!(session.is_property_null(&key, "parent"));
        assert!(!session.is_property_null(&key, "text"));
        assert!(session.is_property_null(&Note::key_for(999), "text"));
        assert_eq!(session.context_entity_identifier(&Note::key_for(999)), None);
        session.rollback().await.unwrap();
    }
}
