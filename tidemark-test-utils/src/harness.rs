//! Deterministic race harness for the non-invalidating cache protocol.
//!
//! The harness owns its collaborators instead of looking them up: a
//! multi-threaded executor whose threads are named `Executor-N`, a manual
//! clock, the session factory and the `Item` region. Test bodies are
//! synchronous and drive the executor with [`NonInvalidationHarness::block_on`];
//! concurrent sessions are spawned onto it and rendezvous through
//! [`LoadBarrier`] and [`CountdownLatch`].

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tidemark_core::{
    CoherenceResult, CoordinationError, EntityKey, Identifier, PersistentEntity, StorageError,
    TestTimeSource, TidemarkConfig,
};
use tidemark_storage::{
    CacheRegion, InMemoryEntityStore, InMemoryRegion, RegionFactory, Session, SessionFactory,
    TxOutcome,
};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::coordination::{CountdownLatch, LoadBarrier, WAIT_TIMEOUT};
use crate::{fixtures, init_test_tracing, Item};

/// Bound on joining a worker; covers several latch waits inside it.
pub const WORKER_TIMEOUT: Duration = Duration::from_millis(3 * WAIT_TIMEOUT.as_millis() as u64);

/// Handle to a spawned unit of work reporting whether it committed.
pub type WorkerHandle = JoinHandle<CoherenceResult<bool>>;

enum Mutation {
    Remove,
    Update(String),
}

/// Owns the executor, the clock and the session factory of one scenario.
pub struct NonInvalidationHarness {
    runtime: Runtime,
    time_source: Arc<TestTimeSource>,
    factory: Arc<SessionFactory>,
    region: Arc<InMemoryRegion>,
    item_id: Option<Identifier>,
}

impl std::fmt::Debug for NonInvalidationHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonInvalidationHarness")
            .field("item_id", &self.item_id)
            .field("pending_puts_timeout", &self.pending_puts_timeout())
            .finish_non_exhaustive()
    }
}

impl NonInvalidationHarness {
    /// Harness over [`fixtures::harness_config`].
    pub fn new() -> CoherenceResult<Self> {
        Self::with_config(fixtures::harness_config()?)
    }

    pub fn with_config(config: TidemarkConfig) -> CoherenceResult<Self> {
        init_test_tracing();
        config.validate()?;

        let counter = AtomicUsize::new(0);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .thread_name_fn(move || format!("Executor-{}", counter.fetch_add(1, Ordering::SeqCst) + 1))
            .enable_all()
            .build()
            .map_err(|e| CoordinationError::Interrupted {
                what: "executor".to_string(),
                reason: e.to_string(),
            })?;

        let time_source = Arc::new(TestTimeSource::new());
        let regions = Arc::new(RegionFactory::start(config.cache, time_source.clone())?);
        let store = Arc::new(InMemoryEntityStore::new(config.store));
        let factory = Arc::new(SessionFactory::new(store, regions.clone()));
        factory.enable_caching(Item::ENTITY_NAME)?;
        let region = regions.build_region(Item::ENTITY_NAME)?;

        Ok(Self {
            runtime,
            time_source,
            factory,
            region,
            item_id: None,
        })
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn factory(&self) -> &Arc<SessionFactory> {
        &self.factory
    }

    pub fn region(&self) -> &Arc<InMemoryRegion> {
        &self.region
    }

    pub fn time_source(&self) -> &Arc<TestTimeSource> {
        &self.time_source
    }

    /// Item inserted by the last [`Self::insert_and_clear_cache`].
    pub fn item_id(&self) -> Option<Identifier> {
        self.item_id
    }

    pub fn item_key(&self, id: Identifier) -> EntityKey {
        Item::key_for(id)
    }

    /// Max-idle of pending puts and invalidation windows.
    pub fn pending_puts_timeout(&self) -> Duration {
        self.factory.region_factory().pending_puts_max_idle()
    }

    /// Insert the scenario's item and start from an empty region.
    pub fn insert_and_clear_cache(&mut self) -> CoherenceResult<Identifier> {
        let mut item = fixtures::original_item();
        let outcome = self.block_on(
            self.factory
                .with_tx_session(move |s| Box::pin(async move { s.persist(&mut item) })),
        )?;
        let id = committed(outcome)?;

        self.block_on(self.region.clear())?;
        let keys = self.cached_keys()?;
        assert!(keys.is_empty(), "Cache is not empty: {keys:?}");

        self.item_id = Some(id);
        info!(item = id, "Insert and clear finished");
        Ok(id)
    }

    /// Bulk-delete every item.
    pub fn cleanup(&self) -> CoherenceResult<()> {
        let outcome = self.block_on(self.factory.with_tx_session(|s| {
            Box::pin(async move { s.execute_delete_all(Item::ENTITY_NAME).await })
        }))?;
        committed(outcome).map(|_| ())
    }

    /// Keys currently resident in the item region.
    pub fn cached_keys(&self) -> CoherenceResult<Vec<EntityKey>> {
        self.block_on(self.region.keys())
    }

    /// Load an item in its own committed session (read-through).
    pub fn load_item(&self, id: Identifier) -> CoherenceResult<Option<Item>> {
        let outcome = self.block_on(
            self.factory
                .with_tx_session(move |s| Box::pin(async move { s.load::<Item>(id).await })),
        )?;
        committed(outcome)
    }

    /// Committed row count of items.
    pub fn item_count(&self) -> CoherenceResult<u64> {
        self.factory.store().count(Item::ENTITY_NAME)
    }

    /// Load, rendezvous, delete, flush, then hold the transaction open until
    /// `commit_latch` opens. Resolves to `false` when the flush lost a write
    /// race.
    pub fn remove_flush_wait(
        &self,
        id: Identifier,
        load_barrier: Arc<LoadBarrier>,
        pre_flush_latch: Option<Arc<CountdownLatch>>,
        flush_latch: Option<Arc<CountdownLatch>>,
        commit_latch: Arc<CountdownLatch>,
    ) -> WorkerHandle {
        self.spawn_mutation(
            id,
            Mutation::Remove,
            load_barrier,
            pre_flush_latch,
            flush_latch,
            commit_latch,
        )
    }

    /// As [`Self::remove_flush_wait`], updating the description instead.
    pub fn update_flush_wait(
        &self,
        id: Identifier,
        load_barrier: Arc<LoadBarrier>,
        pre_flush_latch: Option<Arc<CountdownLatch>>,
        flush_latch: Option<Arc<CountdownLatch>>,
        commit_latch: Arc<CountdownLatch>,
    ) -> WorkerHandle {
        self.spawn_mutation(
            id,
            Mutation::Update(fixtures::UPDATED_DESCRIPTION.to_string()),
            load_barrier,
            pre_flush_latch,
            flush_latch,
            commit_latch,
        )
    }

    fn spawn_mutation(
        &self,
        id: Identifier,
        mutation: Mutation,
        load_barrier: Arc<LoadBarrier>,
        pre_flush_latch: Option<Arc<CountdownLatch>>,
        flush_latch: Option<Arc<CountdownLatch>>,
        commit_latch: Arc<CountdownLatch>,
    ) -> WorkerHandle {
        let factory = self.factory.clone();
        self.runtime.spawn(async move {
            let outcome = factory
                .with_tx_session(move |s| {
                    Box::pin(async move {
                        let flushed =
                            mutate_and_flush(s, id, mutation, &load_barrier, pre_flush_latch.as_deref())
                                .await;
                        if let Some(latch) = &flush_latch {
                            latch.count_down();
                        }
                        match flushed {
                            Ok(()) => {}
                            Err(e) if e.is_conflict() => {
                                info!(error = %e, "Exception thrown");
                                s.mark_rollback_only();
                                return Ok(false);
                            }
                            Err(e) => return Err(e),
                        }
                        commit_latch.wait().await?;
                        Ok(true)
                    })
                })
                .await?;
            Ok(committed_flag(outcome))
        })
    }

    /// Rendezvous at `load_barrier`, optionally wait for `pre_evict_latch`,
    /// then evict the item from outside any transaction.
    pub fn evict_wait(
        &self,
        id: Identifier,
        load_barrier: Arc<LoadBarrier>,
        pre_evict_latch: Option<Arc<CountdownLatch>>,
        post_evict_latch: Option<Arc<CountdownLatch>>,
    ) -> WorkerHandle {
        let factory = self.factory.clone();
        self.runtime.spawn(async move {
            let evicted = evict_after(&factory, id, &load_barrier, pre_evict_latch.as_deref()).await;
            if let Some(latch) = &post_evict_latch {
                latch.count_down();
            }
            evicted.map(|()| true)
        })
    }

    /// Rendezvous at `load_barrier`, optionally wait for `pre_load_latch`,
    /// then read the item in its own session. Resolves to whether it was
    /// found.
    pub fn load_wait(
        &self,
        id: Identifier,
        load_barrier: Arc<LoadBarrier>,
        pre_load_latch: Option<Arc<CountdownLatch>>,
    ) -> WorkerHandle {
        let factory = self.factory.clone();
        self.runtime.spawn(async move {
            load_barrier.wait().await?;
            if let Some(latch) = &pre_load_latch {
                latch.wait().await?;
            }
            let outcome = factory
                .with_tx_session(move |s| Box::pin(async move { s.load::<Item>(id).await }))
                .await?;
            committed(outcome).map(|item| item.is_some())
        })
    }

    /// Block until `latch` opens or [`WAIT_TIMEOUT`] passes.
    pub fn await_or_throw(&self, latch: &CountdownLatch) -> CoherenceResult<()> {
        self.block_on(latch.wait())
    }

    /// Join a worker, bounded by [`WORKER_TIMEOUT`].
    pub fn join(&self, handle: WorkerHandle) -> CoherenceResult<bool> {
        // The timer must be created inside the runtime.
        let joined = self.block_on(async { tokio::time::timeout(WORKER_TIMEOUT, handle).await });
        match joined {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(CoordinationError::Interrupted {
                what: "worker".to_string(),
                reason: e.to_string(),
            }
            .into()),
            Err(_) => Err(CoordinationError::Timeout {
                what: "worker".to_string(),
                waited: WORKER_TIMEOUT,
            }
            .into()),
        }
    }

    /// Stop the region factory. Idempotent; also run on drop.
    pub fn shutdown(&self) -> CoherenceResult<()> {
        self.factory.region_factory().stop()
    }
}

impl Drop for NonInvalidationHarness {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "Region factory stop failed");
        }
    }
}

async fn mutate_and_flush(
    s: &mut Session,
    id: Identifier,
    mutation: Mutation,
    load_barrier: &LoadBarrier,
    pre_flush_latch: Option<&CountdownLatch>,
) -> CoherenceResult<()> {
    let mut item = s
        .load::<Item>(id)
        .await?
        .ok_or_else(|| StorageError::NotFound {
            key: Item::key_for(id),
        })?;
    load_barrier.wait().await?;

    match mutation {
        Mutation::Remove => s.delete(&item)?,
        Mutation::Update(description) => {
            item.description = description;
            s.update(&item)?;
        }
    }
    if let Some(latch) = pre_flush_latch {
        latch.wait().await?;
    }
    s.flush().await
}

async fn evict_after(
    factory: &SessionFactory,
    id: Identifier,
    load_barrier: &LoadBarrier,
    pre_evict_latch: Option<&CountdownLatch>,
) -> CoherenceResult<()> {
    load_barrier.wait().await?;
    if let Some(latch) = pre_evict_latch {
        latch.wait().await?;
    }
    factory.evict_entity(Item::ENTITY_NAME, id).await;
    Ok(())
}

fn committed_flag(outcome: TxOutcome<bool>) -> bool {
    match outcome {
        TxOutcome::Committed(flag) | TxOutcome::RolledBack(flag) => flag,
        TxOutcome::ConflictRolledBack(_) => false,
    }
}

fn committed<T>(outcome: TxOutcome<T>) -> CoherenceResult<T> {
    match outcome {
        TxOutcome::Committed(value) => Ok(value),
        TxOutcome::RolledBack(_) => Err(StorageError::TransactionFailed {
            reason: "unit of work rolled back".to_string(),
        }
        .into()),
        TxOutcome::ConflictRolledBack(conflict) => Err(conflict.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_threads_are_named() {
        let harness = NonInvalidationHarness::new().unwrap();
        let name = harness
            .join(harness.runtime.spawn(async {
                Ok::<_, tidemark_core::CoherenceError>(
                    std::thread::current()
                        .name()
                        .is_some_and(|name| name.starts_with("Executor-")),
                )
            }))
            .unwrap();
        assert!(name);
    }

    #[test]
    fn test_join_returns_worker_result() {
        let mut harness = NonInvalidationHarness::new().unwrap();
        let id = harness.insert_and_clear_cache().unwrap();

        let found = harness.load_wait(id, Arc::new(LoadBarrier::new(1)), None);
        assert!(harness.join(found).unwrap());
        let missing = harness.load_wait(id + 1, Arc::new(LoadBarrier::new(1)), None);
        assert!(!harness.join(missing).unwrap());

        let failed = harness.runtime.spawn(async {
            Err::<bool, _>(tidemark_core::CoherenceError::from(StorageError::NotFound {
                key: Item::key_for(7),
            }))
        });
        assert!(harness.join(failed).is_err());
    }

    #[test]
    fn test_shutdown_stops_regions() {
        let harness = NonInvalidationHarness::new().unwrap();
        harness.shutdown().unwrap();
        harness.shutdown().unwrap();

        assert!(harness.region().is_stopped());
        assert!(harness.factory().region_factory().is_stopped());
        assert!(matches!(
            harness.cached_keys(),
            Err(tidemark_core::CoherenceError::Cache(
                tidemark_core::CacheError::RegionStopped { .. }
            ))
        ));
        assert!(harness
            .factory()
            .region_factory()
            .build_region(Item::ENTITY_NAME)
            .is_err());
    }

    #[test]
    fn test_insert_and_clear_then_cleanup() {
        let mut harness = NonInvalidationHarness::new().unwrap();
        let id = harness.insert_and_clear_cache().unwrap();
        assert_eq!(harness.item_id(), Some(id));
        assert_eq!(harness.item_count().unwrap(), 1);
        assert_eq!(harness.pending_puts_timeout(), WAIT_TIMEOUT * 30);

        harness.cleanup().unwrap();
        assert_eq!(harness.item_count().unwrap(), 0);
    }
}
