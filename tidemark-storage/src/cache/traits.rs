//! Cache region traits and cached entry snapshot.
//!
//! This module defines the capability set every region backend provides.
//! The in-memory backend in [`super::region`] is the reference
//! implementation; a distributed backend implements the same trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tidemark_core::{CoherenceResult, EntityKey, RegionKind, TxId, Version};

use super::pending_puts::PendingPut;

/// Versioned snapshot of one entity's persistable state.
///
/// Entries are immutable once installed; a newer entry replaces an older
/// one wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    version: Version,
    state: Value,
}

impl CacheEntry {
    pub fn new(version: Version, state: Value) -> Self {
        Self { version, state }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    pub fn into_state(self) -> Value {
        self.state
    }

    /// Check if this entry is strictly newer than another.
    pub fn is_newer_than(&self, other: &CacheEntry) -> bool {
        self.version > other.version
    }
}

/// Cache region capability set.
///
/// Implementations must be safe under concurrent use from many sessions
/// and must never block indefinitely. Contention on writes is resolved by
/// the conditional semantics of [`CacheRegion::put_from_load`] and
/// [`CacheRegion::update`], not by locks held across calls.
#[async_trait]
pub trait CacheRegion: Send + Sync {
    /// Region name.
    fn name(&self) -> &str;

    /// What the region caches.
    fn kind(&self) -> RegionKind;

    /// Get the resident entry for `key`, if any.
    async fn get(&self, key: &EntityKey) -> CoherenceResult<Option<CacheEntry>>;

    /// Register a load in flight for `key`.
    async fn mark_pending(&self, key: &EntityKey, tx: TxId) -> CoherenceResult<PendingPut>;

    /// Drop a pending put without installing anything (e.g. the row was
    /// not found).
    async fn release_pending(&self, pending: &PendingPut) -> CoherenceResult<()>;

    /// Install a loaded entry.
    ///
    /// Returns `false` without changing anything when the pending put is no
    /// longer valid or when the resident entry is at least as new.
    async fn put_from_load(
        &self,
        key: &EntityKey,
        entry: CacheEntry,
        pending: &PendingPut,
    ) -> CoherenceResult<bool>;

    /// Compare-and-swap: replace the resident entry with `new` only if the
    /// resident entry equals `expected` (`None` meaning "absent").
    async fn update(
        &self,
        key: &EntityKey,
        expected: Option<&CacheEntry>,
        new: CacheEntry,
    ) -> CoherenceResult<bool>;

    /// Unconditionally remove `key` and invalidate its pending puts.
    async fn evict(&self, key: &EntityKey) -> CoherenceResult<()>;

    /// Evict `key` and keep its pending puts invalid until
    /// [`CacheRegion::end_invalidation`] is called for the same `tx`.
    async fn begin_invalidation(&self, key: &EntityKey, tx: TxId) -> CoherenceResult<()>;

    /// Close the window of `tx` on `key` and evict whatever was installed
    /// after the window expired.
    async fn end_invalidation(&self, key: &EntityKey, tx: TxId) -> CoherenceResult<()>;

    /// Region-wide variant of [`CacheRegion::begin_invalidation`].
    async fn begin_region_invalidation(&self, tx: TxId) -> CoherenceResult<()>;

    async fn end_region_invalidation(&self, tx: TxId) -> CoherenceResult<()>;

    /// Drop every entry and invalidate every pending put.
    async fn clear(&self) -> CoherenceResult<()>;

    /// Keys with a live entry.
    async fn keys(&self) -> CoherenceResult<Vec<EntityKey>>;

    /// Get region statistics.
    async fn stats(&self) -> CoherenceResult<RegionStats>;
}

/// Statistics about region usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries installed by put-from-load or update.
    pub puts: u64,
    /// Number of put-from-load calls rejected as stale or regressive.
    pub rejected_puts: u64,
    /// Number of entries removed by eviction or invalidation.
    pub evictions: u64,
    /// Number of entries currently resident.
    pub entry_count: u64,
}

impl RegionStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
