//! Non-strict invalidation strategy.
//!
//! Reads go through the cache with a pending-put fence. Writes never go
//! through the cache: every update or delete evicts the key and opens an
//! invalidation window *before* the row is written, and the window closes
//! when the transaction completes. The next reader repopulates the entry
//! from the store.
//!
//! Cache failures are best-effort. They are logged and turned into misses
//! or skipped installs; they never fail the transactional write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tidemark_core::{EntityKey, TxId};
use tracing::{debug, warn};

use super::pending_puts::PendingPut;
use super::traits::{CacheEntry, CacheRegion};
use crate::session::TransactionListener;

/// Where one transaction stands with respect to one cached key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TxCacheState {
    /// No cache interaction yet.
    #[default]
    Untouched,
    /// Load issued and marker registered.
    PendingPut(PendingPut),
    /// Load result installed.
    Cached,
    /// Evicted ahead of this transaction's write.
    Invalidated,
}

#[derive(Debug, Default)]
struct TxKeys {
    keys: HashMap<EntityKey, TxCacheState>,
    region_invalidated: bool,
}

/// Coherence protocol for one cache region.
pub struct NonStrictInvalidationStrategy {
    region: Arc<dyn CacheRegion>,
    txs: Mutex<HashMap<TxId, TxKeys>>,
}

impl std::fmt::Debug for NonStrictInvalidationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonStrictInvalidationStrategy")
            .field("region", &self.region.name())
            .finish_non_exhaustive()
    }
}

impl NonStrictInvalidationStrategy {
    pub fn new(region: Arc<dyn CacheRegion>) -> Self {
        Self {
            region,
            txs: Mutex::new(HashMap::new()),
        }
    }

    pub fn region(&self) -> &Arc<dyn CacheRegion> {
        &self.region
    }

    fn with_tx<R>(&self, tx: TxId, f: impl FnOnce(&mut TxKeys) -> R) -> R {
        let mut txs = self.txs.lock().unwrap_or_else(|e| e.into_inner());
        f(txs.entry(tx).or_default())
    }

    fn set_state(&self, tx: TxId, key: &EntityKey, state: TxCacheState) {
        self.with_tx(tx, |keys| {
            keys.keys.insert(key.clone(), state);
        });
    }

    /// Current state of `key` for `tx`.
    pub fn state_of(&self, tx: TxId, key: &EntityKey) -> TxCacheState {
        let txs = self.txs.lock().unwrap_or_else(|e| e.into_inner());
        txs.get(&tx)
            .and_then(|keys| keys.keys.get(key).cloned())
            .unwrap_or_default()
    }

    fn is_invalidated_by(&self, tx: TxId, key: &EntityKey) -> bool {
        let txs = self.txs.lock().unwrap_or_else(|e| e.into_inner());
        txs.get(&tx)
            .map(|keys| {
                keys.region_invalidated
                    || matches!(keys.keys.get(key), Some(TxCacheState::Invalidated))
            })
            .unwrap_or(false)
    }

    /// Cached entry for `key`, or `None` on a miss or a cache failure.
    pub async fn get(&self, tx: TxId, key: &EntityKey) -> Option<CacheEntry> {
        if self.is_invalidated_by(tx, key) {
            return None;
        }
        match self.region.get(key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(region = self.region.name(), %key, error = %e, "Cache read failed; treating as miss");
                None
            }
        }
    }

    /// Register a load of `key` about to hit the store.
    ///
    /// Returns `None` when the result must not be cached: the transaction
    /// has written the key itself, or the cache is unavailable.
    pub async fn before_load(&self, tx: TxId, key: &EntityKey) -> Option<PendingPut> {
        if self.is_invalidated_by(tx, key) {
            return None;
        }
        match self.region.mark_pending(key, tx).await {
            Ok(pending) => {
                self.set_state(tx, key, TxCacheState::PendingPut(pending.clone()));
                Some(pending)
            }
            Err(e) => {
                warn!(region = self.region.name(), %key, %tx, error = %e, "Could not register pending put");
                None
            }
        }
    }

    /// Offer a loaded row to the cache. Returns whether it was installed.
    pub async fn after_load(&self, tx: TxId, pending: &PendingPut, entry: CacheEntry) -> bool {
        let key = pending.key();
        let installed = match self.region.put_from_load(key, entry, pending).await {
            Ok(installed) => installed,
            Err(e) => {
                warn!(region = self.region.name(), %key, %tx, error = %e, "Put from load failed");
                false
            }
        };
        let state = if installed {
            TxCacheState::Cached
        } else {
            TxCacheState::Untouched
        };
        self.set_state(tx, key, state);
        installed
    }

    /// Drop a pending put whose load produced nothing to cache.
    pub async fn abandon_load(&self, tx: TxId, pending: &PendingPut) {
        if let Err(e) = self.region.release_pending(pending).await {
            debug!(region = self.region.name(), key = %pending.key(), error = %e, "Release of pending put failed");
        }
        self.set_state(tx, pending.key(), TxCacheState::Untouched);
    }

    /// Evict `key` ahead of `tx` writing it. Must run before the store write.
    pub async fn before_write(&self, tx: TxId, key: &EntityKey) {
        if let Err(e) = self.region.begin_invalidation(key, tx).await {
            warn!(region = self.region.name(), %key, %tx, error = %e, "Pre-write eviction failed");
        }
        self.set_state(tx, key, TxCacheState::Invalidated);
    }

    /// Region-wide variant of [`Self::before_write`] for bulk statements.
    pub async fn before_bulk_write(&self, tx: TxId) {
        if let Err(e) = self.region.begin_region_invalidation(tx).await {
            warn!(region = self.region.name(), %tx, error = %e, "Pre-write region invalidation failed");
        }
        self.with_tx(tx, |keys| keys.region_invalidated = true);
    }

    /// External eviction of one key.
    pub async fn evict(&self, key: &EntityKey) {
        if let Err(e) = self.region.evict(key).await {
            warn!(region = self.region.name(), %key, error = %e, "Eviction failed");
        }
    }

    /// External eviction of the whole region.
    pub async fn evict_all(&self) {
        if let Err(e) = self.region.clear().await {
            warn!(region = self.region.name(), error = %e, "Region eviction failed");
        }
    }

    /// Close every window `tx` opened and forget its per-key state.
    ///
    /// Runs on commit and on rollback alike. Entries were evicted before the
    /// write; closing a window only evicts what a load installed after the
    /// window expired.
    pub async fn complete(&self, tx: TxId, committed: bool) {
        let finished = {
            let mut txs = self.txs.lock().unwrap_or_else(|e| e.into_inner());
            txs.remove(&tx)
        };
        let Some(finished) = finished else {
            return;
        };

        for (key, state) in &finished.keys {
            match state {
                TxCacheState::Invalidated => {
                    if let Err(e) = self.region.end_invalidation(key, tx).await {
                        warn!(region = self.region.name(), %key, %tx, error = %e, "Closing invalidation failed");
                    }
                }
                TxCacheState::PendingPut(pending) => {
                    let _ = self.region.release_pending(pending).await;
                }
                TxCacheState::Untouched | TxCacheState::Cached => {}
            }
        }
        if finished.region_invalidated {
            if let Err(e) = self.region.end_region_invalidation(tx).await {
                warn!(region = self.region.name(), %tx, error = %e, "Closing region invalidation failed");
            }
        }
        debug!(
            region = self.region.name(),
            %tx,
            committed,
            keys = finished.keys.len(),
            "Transaction cache state released"
        );
    }
}

#[async_trait]
impl TransactionListener for NonStrictInvalidationStrategy {
    async fn after_commit(&self, tx: TxId) {
        self.complete(tx, true).await;
    }

    async fn after_rollback(&self, tx: TxId) {
        self.complete(tx, false).await;
    }
}
