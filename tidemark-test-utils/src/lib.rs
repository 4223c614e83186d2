//! Tidemark Test Utilities
//!
//! Shared test infrastructure for the tidemark workspace:
//! - The `Item` entity the race scenarios operate on
//! - Bounded rendezvous primitives and the non-invalidation race harness
//! - Proptest generators, fixtures and custom assertions

pub mod coordination;
pub mod harness;

pub use coordination::{await_or_throw, CountdownLatch, LoadBarrier, WAIT_TIMEOUT};
pub use harness::{NonInvalidationHarness, WorkerHandle, WORKER_TIMEOUT};

// Re-export core types for convenience
pub use tidemark_core::{
    CoherenceError, CoherenceResult, ConcurrencyError, CoordinationError, EntityKey, Identifier,
    PersistentEntity, TestTimeSource, TidemarkConfig, TxId, Version,
};

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber for tests.
///
/// The filter comes from `TIDEMARK_LOG`, then `RUST_LOG`, then a default
/// that shows the protocol's informational events. Safe to call repeatedly.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_env("TIDEMARK_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("tidemark_storage=info,tidemark_test_utils=info,warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_test_writer()
        .try_init();
}

/// Cached test entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: Identifier,
    pub version: Version,
    pub name: String,
    pub description: String,
}

impl Item {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: 0,
            version: 0,
            name: name.into(),
            description: description.into(),
        }
    }
}

impl PersistentEntity for Item {
    const ENTITY_NAME: &'static str = "Item";

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

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for tidemark types.

    use super::*;
    use proptest::prelude::*;
    use tidemark_core::{ExpirationConfig, TimeUnit};

    /// Generate an item with a printable name and description.
    pub fn arb_item() -> impl Strategy<Value = Item> {
        ("[a-z]{1,12}", "[A-Za-z ]{0,40}").prop_map(|(name, description)| Item::new(name, description))
    }

    pub fn arb_description() -> impl Strategy<Value = String> {
        "[A-Za-z ]{1,40}"
    }

    pub fn arb_entity_key() -> impl Strategy<Value = EntityKey> {
        (prop_oneof![Just("Item"), Just("Person"), Just("Address")], 1i64..1_000)
            .prop_map(|(name, id)| EntityKey::new(name, id))
    }

    pub fn arb_time_unit() -> impl Strategy<Value = TimeUnit> {
        prop_oneof![
            Just(TimeUnit::Milliseconds),
            Just(TimeUnit::Seconds),
            Just(TimeUnit::Minutes),
        ]
    }

    /// Generate a valid (non-zero) expiration.
    pub fn arb_expiration() -> impl Strategy<Value = ExpirationConfig> {
        (1u64..10_000, arb_time_unit()).prop_map(|(max_idle, unit)| ExpirationConfig::new(max_idle, unit))
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for the race scenarios.

    use super::*;

    pub const ORIGINAL_NAME: &str = "my item";
    pub const ORIGINAL_DESCRIPTION: &str = "Original item";
    pub const UPDATED_DESCRIPTION: &str = "Updated item";

    /// Configuration of the race harness.
    ///
    /// The row lock timeout is short so the losing writer of a flush race
    /// fails well inside [`WAIT_TIMEOUT`].
    pub const HARNESS_CONFIG: &str = r#"
[cache.pending_puts]
max_idle = 60
unit = "seconds"

[[cache.regions]]
name = "Item"
kind = "entity"

[store]
lock_timeout_ms = 100
"#;

    pub fn harness_config() -> CoherenceResult<TidemarkConfig> {
        Ok(TidemarkConfig::from_toml_str(HARNESS_CONFIG)?)
    }

    /// The item each scenario starts from.
    pub fn original_item() -> Item {
        Item::new(ORIGINAL_NAME, ORIGINAL_DESCRIPTION)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over cache and outcome state.

    use super::*;

    /// Assert that the harness region holds no entries.
    #[track_caller]
    pub fn assert_cache_empty(harness: &NonInvalidationHarness) {
        let keys = harness.cached_keys().expect("region keys");
        assert!(keys.is_empty(), "Cache is not empty: {keys:?}");
    }

    /// Assert that the cached entry of `id` exists with `version`.
    #[track_caller]
    pub fn assert_cached_version(harness: &NonInvalidationHarness, id: Identifier, version: Version) {
        use tidemark_storage::CacheRegion;

        let entry = harness
            .block_on(harness.region().get(&harness.item_key(id)))
            .expect("region read");
        match entry {
            Some(entry) => assert_eq!(entry.version(), version, "Cached version of item {id}"),
            None => panic!("Expected item {id} at version {version} in cache, found nothing"),
        }
    }

    /// Assert that a result is a lost write race.
    #[track_caller]
    pub fn assert_conflict<T: std::fmt::Debug>(result: &CoherenceResult<T>) {
        match result {
            Err(e) if e.is_conflict() => {}
            other => panic!("Expected concurrency conflict, got: {other:?}"),
        }
    }

    /// Assert that a result is a coordination timeout.
    #[track_caller]
    pub fn assert_coordination_timeout<T: std::fmt::Debug>(result: &CoherenceResult<T>) {
        match result {
            Err(e) if e.is_coordination_timeout() => {}
            other => panic!("Expected coordination timeout, got: {other:?}"),
        }
    }
}
