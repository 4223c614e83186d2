//! Tidemark Core - Shared Types
//!
//! Keys, identifiers, clocks, configuration and the error taxonomy used by
//! the cache, the entity store and the session layer. No coherence logic
//! lives here.

pub mod config;
pub mod entity;
pub mod error;
pub mod identity;
pub mod time;

pub use config::{
    ExpirationConfig, RegionConfig, RegionFactoryConfig, RegionKind, StoreConfig, TidemarkConfig,
    TimeUnit, DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_PENDING_PUTS_MAX_IDLE_MS,
};
pub use entity::PersistentEntity;
pub use error::{
    CacheError, CoherenceError, CoherenceResult, ConcurrencyError, ConfigError,
    CoordinationError, StorageError,
};
pub use identity::{EntityKey, Identifier, Timestamp, TxId, Version};
pub use time::{SystemTimeSource, TestTimeSource, TimeSource};
