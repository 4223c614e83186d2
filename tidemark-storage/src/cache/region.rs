//! In-memory cache region.
//!
//! Reference backend for [`CacheRegion`]: a map of entries guarded by a
//! `RwLock`, paired with a [`PendingPutsRegistry`]. Every mutation that
//! must be atomic with pending-put validity runs inside a registry closure,
//! so the lock order is always registry → entries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use tidemark_core::{
    CacheError, CoherenceResult, EntityKey, RegionConfig, RegionKind, StorageError, TimeSource,
    Timestamp, TxId,
};
use tracing::{debug, info};

use super::pending_puts::{PendingPut, PendingPutsRegistry};
use super::traits::{CacheEntry, CacheRegion, RegionStats};

#[derive(Debug)]
struct StoredEntry {
    entry: CacheEntry,
    last_accessed: Timestamp,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    rejected_puts: AtomicU64,
    evictions: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Region backed by a process-local map.
#[derive(Debug)]
pub struct InMemoryRegion {
    name: String,
    kind: RegionKind,
    entry_max_idle: Option<Duration>,
    time_source: Arc<dyn TimeSource>,
    entries: RwLock<HashMap<EntityKey, StoredEntry>>,
    pending_puts: PendingPutsRegistry,
    counters: Counters,
    stopped: AtomicBool,
}

impl InMemoryRegion {
    /// Create a region from its config.
    pub fn new(
        config: &RegionConfig,
        pending_puts_max_idle: Duration,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            name: config.name.clone(),
            kind: config.kind,
            entry_max_idle: config.entry_max_idle(),
            pending_puts: PendingPutsRegistry::new(time_source.clone(), pending_puts_max_idle),
            time_source,
            entries: RwLock::new(HashMap::new()),
            counters: Counters::default(),
            stopped: AtomicBool::new(false),
        }
    }

    /// The region's pending-put registry.
    pub fn pending_puts(&self) -> &PendingPutsRegistry {
        &self.pending_puts
    }

    pub fn time_source(&self) -> &Arc<dyn TimeSource> {
        &self.time_source
    }

    /// Drop all state and refuse further use.
    pub fn stop(&self) -> CoherenceResult<()> {
        self.stopped.store(true, Ordering::SeqCst);
        self.pending_puts.invalidate_all(|| {
            self.write_entries()?.clear();
            Ok(())
        })?;
        info!(region = %self.name, "Region stopped");
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> CoherenceResult<()> {
        if self.is_stopped() {
            return Err(CacheError::RegionStopped {
                region: self.name.clone(),
            }
            .into());
        }
        Ok(())
    }

    fn write_entries(&self) -> CoherenceResult<RwLockWriteGuard<'_, HashMap<EntityKey, StoredEntry>>> {
        self.entries
            .write()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    fn is_expired(&self, stored: &StoredEntry) -> bool {
        self.entry_max_idle
            .map(|max_idle| self.time_source.is_expired(stored.last_accessed, max_idle))
            .unwrap_or(false)
    }

    /// Live resident entry, dropping it first if it has expired.
    fn live_entry<'a>(
        &self,
        entries: &'a mut HashMap<EntityKey, StoredEntry>,
        key: &EntityKey,
    ) -> Option<&'a mut StoredEntry> {
        let expired = entries.get(key).map(|s| self.is_expired(s)).unwrap_or(false);
        if expired {
            entries.remove(key);
            debug!(region = %self.name, %key, "Entry expired");
            return None;
        }
        entries.get_mut(key)
    }

    fn remove_entry(&self, key: &EntityKey) -> CoherenceResult<bool> {
        let removed = self.write_entries()?.remove(key).is_some();
        if removed {
            Counters::bump(&self.counters.evictions);
        }
        Ok(removed)
    }

    fn remove_all(&self) -> CoherenceResult<u64> {
        let mut entries = self.write_entries()?;
        let removed = entries.len() as u64;
        entries.clear();
        self.counters.evictions.fetch_add(removed, Ordering::Relaxed);
        Ok(removed)
    }
}

#[async_trait]
impl CacheRegion for InMemoryRegion {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RegionKind {
        self.kind
    }

    async fn get(&self, key: &EntityKey) -> CoherenceResult<Option<CacheEntry>> {
        self.ensure_running()?;
        let now = self.time_source.now();
        let mut entries = self.write_entries()?;
        match self.live_entry(&mut entries, key) {
            Some(stored) => {
                stored.last_accessed = now;
                Counters::bump(&self.counters.hits);
                Ok(Some(stored.entry.clone()))
            }
            None => {
                Counters::bump(&self.counters.misses);
                Ok(None)
            }
        }
    }

    async fn mark_pending(&self, key: &EntityKey, tx: TxId) -> CoherenceResult<PendingPut> {
        self.ensure_running()?;
        self.pending_puts.mark_pending(key, tx)
    }

    async fn release_pending(&self, pending: &PendingPut) -> CoherenceResult<()> {
        self.pending_puts.remove(pending)
    }

    async fn put_from_load(
        &self,
        key: &EntityKey,
        entry: CacheEntry,
        pending: &PendingPut,
    ) -> CoherenceResult<bool> {
        self.ensure_running()?;
        if pending.key() != key {
            self.pending_puts.remove(pending)?;
            Counters::bump(&self.counters.rejected_puts);
            return Ok(false);
        }

        let now = self.time_source.now();
        let version = entry.version();
        let installed = self.pending_puts.complete(pending, || {
            let mut entries = self.write_entries()?;
            if let Some(resident) = self.live_entry(&mut entries, key) {
                if !entry.is_newer_than(&resident.entry) {
                    return Ok(false);
                }
            }
            entries.insert(
                key.clone(),
                StoredEntry {
                    entry,
                    last_accessed: now,
                },
            );
            Ok(true)
        })?;

        match installed {
            Some(true) => {
                Counters::bump(&self.counters.puts);
                debug!(region = %self.name, %key, version, "Put from load");
                Ok(true)
            }
            Some(false) => {
                Counters::bump(&self.counters.rejected_puts);
                debug!(region = %self.name, %key, version, "Put from load rejected: resident entry is not older");
                Ok(false)
            }
            None => {
                Counters::bump(&self.counters.rejected_puts);
                debug!(region = %self.name, %key, version, "Put from load rejected: pending put no longer valid");
                Ok(false)
            }
        }
    }

    async fn update(
        &self,
        key: &EntityKey,
        expected: Option<&CacheEntry>,
        new: CacheEntry,
    ) -> CoherenceResult<bool> {
        self.ensure_running()?;
        let now = self.time_source.now();
        let swapped = self.pending_puts.when_quiescent(key, || {
            let mut entries = self.write_entries()?;
            let resident = self.live_entry(&mut entries, key).map(|s| &s.entry);
            if resident != expected {
                return Ok(false);
            }
            entries.insert(
                key.clone(),
                StoredEntry {
                    entry: new,
                    last_accessed: now,
                },
            );
            Ok(true)
        })?;

        let swapped = swapped.unwrap_or(false);
        if swapped {
            Counters::bump(&self.counters.puts);
        } else {
            debug!(region = %self.name, %key, "Conditional update lost");
        }
        Ok(swapped)
    }

    async fn evict(&self, key: &EntityKey) -> CoherenceResult<()> {
        self.ensure_running()?;
        let removed = self.pending_puts.invalidate(key, || self.remove_entry(key))?;
        debug!(region = %self.name, %key, removed, "Evicted");
        Ok(())
    }

    async fn begin_invalidation(&self, key: &EntityKey, tx: TxId) -> CoherenceResult<()> {
        self.ensure_running()?;
        let removed = self
            .pending_puts
            .begin_invalidation(key, tx, || self.remove_entry(key))?;
        debug!(region = %self.name, %key, %tx, removed, "Invalidation started");
        Ok(())
    }

    async fn end_invalidation(&self, key: &EntityKey, tx: TxId) -> CoherenceResult<()> {
        let removed = self
            .pending_puts
            .end_invalidation(key, tx, || self.remove_entry(key))?;
        debug!(region = %self.name, %key, %tx, removed, "Invalidation finished");
        Ok(())
    }

    async fn begin_region_invalidation(&self, tx: TxId) -> CoherenceResult<()> {
        self.ensure_running()?;
        let removed = self
            .pending_puts
            .begin_region_invalidation(tx, || self.remove_all())?;
        info!(region = %self.name, %tx, removed, "Region invalidation started");
        Ok(())
    }

    async fn end_region_invalidation(&self, tx: TxId) -> CoherenceResult<()> {
        let removed = self
            .pending_puts
            .end_region_invalidation(tx, || self.remove_all())?;
        info!(region = %self.name, %tx, removed, "Region invalidation finished");
        Ok(())
    }

    async fn clear(&self) -> CoherenceResult<()> {
        self.ensure_running()?;
        self.pending_puts.invalidate_all(|| {
            self.write_entries()?.clear();
            Ok(())
        })?;
        info!(region = %self.name, "Region cleared");
        Ok(())
    }

    async fn keys(&self) -> CoherenceResult<Vec<EntityKey>> {
        self.ensure_running()?;
        let mut entries = self.write_entries()?;
        entries.retain(|_, stored| !self.is_expired(stored));
        let mut keys: Vec<EntityKey> = entries.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn stats(&self) -> CoherenceResult<RegionStats> {
        let entry_count = self
            .entries
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .len() as u64;
        Ok(RegionStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            puts: self.counters.puts.load(Ordering::Relaxed),
            rejected_puts: self.counters.rejected_puts.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            entry_count,
        })
    }
}
