//! Pending-put registry: the fencing token between loads and writers.
//!
//! A load registers a [`PendingPut`] before it reads the entity store. When
//! the load result is ready, the region installs it only if the marker is
//! still valid. Markers are invalidated by:
//!
//! - evicting the key (explicitly or from a writer's pre-write evict)
//! - clearing the region
//! - an open invalidation window on the key or the whole region
//! - max-idle expiry, measured with the injected [`TimeSource`]
//!
//! A writer opens an invalidation window when it evicts before writing and
//! closes it when its transaction completes. A marker registered while a
//! window is open is fenced at birth and never becomes valid, even if the
//! window later expires: it may have read the row before the writer
//! committed. Closing a window bumps the key epoch and evicts whatever a
//! load slipped in after the window expired.
//!
//! Expired markers and windows are purged whenever a new marker or window is
//! registered, so abandoned loads and crashed writers do not accumulate.
//!
//! The registry never holds loaded values. Region operations that must be
//! atomic with a validity check (install, evict, clear) run their closure
//! while the registry lock is held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tidemark_core::{CoherenceResult, EntityKey, StorageError, TimeSource, Timestamp, TxId};

/// Marker for a load in flight: (key, transaction, insertion time).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPut {
    id: u64,
    key: EntityKey,
    tx: TxId,
    inserted_at: Timestamp,
    epoch: u64,
}

impl PendingPut {
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn tx(&self) -> TxId {
        self.tx
    }

    pub fn inserted_at(&self) -> Timestamp {
        self.inserted_at
    }
}

#[derive(Debug, Default)]
struct KeyRecord {
    /// Bumped by every eviction and every window open/close.
    epoch: u64,
    pending: HashMap<u64, Timestamp>,
    invalidators: HashMap<TxId, Timestamp>,
}

impl KeyRecord {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.invalidators.is_empty()
    }

    fn invalidate(&mut self) {
        self.epoch += 1;
        self.pending.clear();
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    keys: HashMap<EntityKey, KeyRecord>,
    region_invalidators: HashMap<TxId, Timestamp>,
}

impl RegistryState {
    fn invalidate_all(&mut self) {
        for record in self.keys.values_mut() {
            record.invalidate();
        }
        self.keys.retain(|_, record| !record.is_idle());
    }
}

/// Per-region registry of pending puts and invalidation windows.
#[derive(Debug)]
pub struct PendingPutsRegistry {
    time_source: Arc<dyn TimeSource>,
    max_idle: Duration,
    next_id: AtomicU64,
    state: Mutex<RegistryState>,
}

impl PendingPutsRegistry {
    pub fn new(time_source: Arc<dyn TimeSource>, max_idle: Duration) -> Self {
        Self {
            time_source,
            max_idle,
            next_id: AtomicU64::new(1),
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn max_idle(&self) -> Duration {
        self.max_idle
    }

    fn lock(&self) -> CoherenceResult<MutexGuard<'_, RegistryState>> {
        self.state
            .lock()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    fn is_live(&self, since: Timestamp) -> bool {
        !self.time_source.is_expired(since, self.max_idle)
    }

    fn has_active_window(&self, state: &RegistryState, key: &EntityKey) -> bool {
        let region_window = state
            .region_invalidators
            .values()
            .any(|opened| self.is_live(*opened));
        let key_window = state
            .keys
            .get(key)
            .map(|r| r.invalidators.values().any(|opened| self.is_live(*opened)))
            .unwrap_or(false);
        region_window || key_window
    }

    fn is_valid(&self, state: &RegistryState, pending: &PendingPut) -> bool {
        if !self.is_live(pending.inserted_at) || self.has_active_window(state, &pending.key) {
            return false;
        }
        state
            .keys
            .get(&pending.key)
            .map(|r| r.epoch == pending.epoch && r.pending.contains_key(&pending.id))
            .unwrap_or(false)
    }

    /// Register a load in flight for `key` on behalf of `tx`.
    ///
    /// Under an open invalidation window the marker is returned but never
    /// recorded, so it can never install.
    pub fn mark_pending(&self, key: &EntityKey, tx: TxId) -> CoherenceResult<PendingPut> {
        let now = self.time_source.now();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock()?;
        self.purge(&mut state);

        let fenced = self.has_active_window(&state, key);
        let record = state.keys.entry(key.clone()).or_default();
        if !fenced {
            record.pending.insert(id, now);
        }
        let epoch = record.epoch;
        if record.is_idle() {
            state.keys.remove(key);
        }
        Ok(PendingPut {
            id,
            key: key.clone(),
            tx,
            inserted_at: now,
            epoch,
        })
    }

    /// Whether the load guarded by `pending` may still install its result.
    pub fn is_still_pending(&self, pending: &PendingPut) -> CoherenceResult<bool> {
        let state = self.lock()?;
        Ok(self.is_valid(&state, pending))
    }

    /// Drop a marker without installing anything.
    pub fn remove(&self, pending: &PendingPut) -> CoherenceResult<()> {
        let mut state = self.lock()?;
        if let Some(record) = state.keys.get_mut(&pending.key) {
            record.pending.remove(&pending.id);
            if record.is_idle() {
                state.keys.remove(&pending.key);
            }
        }
        Ok(())
    }

    /// Consume `pending`, running `install` under the registry lock only if
    /// the marker is still valid. Returns `None` when the marker was stale.
    pub fn complete<R>(
        &self,
        pending: &PendingPut,
        install: impl FnOnce() -> CoherenceResult<R>,
    ) -> CoherenceResult<Option<R>> {
        let mut state = self.lock()?;
        let valid = self.is_valid(&state, pending);
        if let Some(record) = state.keys.get_mut(&pending.key) {
            record.pending.remove(&pending.id);
            if record.is_idle() {
                state.keys.remove(&pending.key);
            }
        }
        if !valid {
            return Ok(None);
        }
        install().map(Some)
    }

    /// Run `f` under the registry lock if no invalidation window is open on
    /// `key`. Used by conditional region writes.
    pub fn when_quiescent<R>(
        &self,
        key: &EntityKey,
        f: impl FnOnce() -> CoherenceResult<R>,
    ) -> CoherenceResult<Option<R>> {
        let state = self.lock()?;
        if self.has_active_window(&state, key) {
            return Ok(None);
        }
        f().map(Some)
    }

    /// Invalidate every pending put for `key`, running `evict` atomically.
    pub fn invalidate<R>(
        &self,
        key: &EntityKey,
        evict: impl FnOnce() -> CoherenceResult<R>,
    ) -> CoherenceResult<R> {
        let mut state = self.lock()?;
        if let Some(record) = state.keys.get_mut(key) {
            record.invalidate();
            if record.is_idle() {
                state.keys.remove(key);
            }
        }
        evict()
    }

    /// Invalidate every pending put in the region, running `clear` atomically.
    pub fn invalidate_all<R>(&self, clear: impl FnOnce() -> CoherenceResult<R>) -> CoherenceResult<R> {
        let mut state = self.lock()?;
        state.invalidate_all();
        clear()
    }

    /// Open an invalidation window on `key` for `tx`, running `evict`
    /// atomically with the invalidation of existing markers.
    pub fn begin_invalidation<R>(
        &self,
        key: &EntityKey,
        tx: TxId,
        evict: impl FnOnce() -> CoherenceResult<R>,
    ) -> CoherenceResult<R> {
        let now = self.time_source.now();
        let mut state = self.lock()?;
        self.purge(&mut state);
        let record = state.keys.entry(key.clone()).or_default();
        record.invalidate();
        record.invalidators.insert(tx, now);
        evict()
    }

    /// Close the window `tx` opened on `key`, running `evict` atomically.
    /// Markers registered while it was open stay invalid.
    pub fn end_invalidation<R>(
        &self,
        key: &EntityKey,
        tx: TxId,
        evict: impl FnOnce() -> CoherenceResult<R>,
    ) -> CoherenceResult<R> {
        let mut state = self.lock()?;
        if let Some(record) = state.keys.get_mut(key) {
            record.invalidators.remove(&tx);
            record.invalidate();
            if record.is_idle() {
                state.keys.remove(key);
            }
        }
        evict()
    }

    /// Open a region-wide invalidation window for `tx` (bulk writes).
    pub fn begin_region_invalidation<R>(
        &self,
        tx: TxId,
        clear: impl FnOnce() -> CoherenceResult<R>,
    ) -> CoherenceResult<R> {
        let now = self.time_source.now();
        let mut state = self.lock()?;
        self.purge(&mut state);
        state.invalidate_all();
        state.region_invalidators.insert(tx, now);
        clear()
    }

    /// Close the region-wide window of `tx`, running `clear` atomically.
    pub fn end_region_invalidation<R>(
        &self,
        tx: TxId,
        clear: impl FnOnce() -> CoherenceResult<R>,
    ) -> CoherenceResult<R> {
        let mut state = self.lock()?;
        state.region_invalidators.remove(&tx);
        state.invalidate_all();
        clear()
    }

    /// Whether a live invalidation window covers `key`.
    pub fn is_invalidating(&self, key: &EntityKey) -> CoherenceResult<bool> {
        let state = self.lock()?;
        Ok(self.has_active_window(&state, key))
    }

    /// Drop expired markers and windows. Returns how many were dropped.
    pub fn purge_expired(&self) -> CoherenceResult<usize> {
        let mut state = self.lock()?;
        Ok(self.purge(&mut state))
    }

    fn purge(&self, state: &mut RegistryState) -> usize {
        let mut purged = 0;

        let before = state.region_invalidators.len();
        state
            .region_invalidators
            .retain(|_, opened| !self.time_source.is_expired(*opened, self.max_idle));
        purged += before - state.region_invalidators.len();

        for record in state.keys.values_mut() {
            let before = record.pending.len() + record.invalidators.len();
            record
                .pending
                .retain(|_, at| !self.time_source.is_expired(*at, self.max_idle));
            record
                .invalidators
                .retain(|_, at| !self.time_source.is_expired(*at, self.max_idle));
            purged += before - (record.pending.len() + record.invalidators.len());
        }
        state.keys.retain(|_, record| !record.is_idle());
        purged
    }

    /// Number of registered markers.
    pub fn pending_count(&self) -> CoherenceResult<usize> {
        let state = self.lock()?;
        Ok(state.keys.values().map(|r| r.pending.len()).sum())
    }
}
