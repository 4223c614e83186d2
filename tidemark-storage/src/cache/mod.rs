//! Second-level cache with a pending-put fence.
//!
//! # Design
//!
//! The cache never holds data older than the last committed write. Two
//! mechanisms enforce that:
//!
//! - Loads register a [`PendingPut`] before reading the store and install
//!   their result only if the marker survived. Any eviction, clear or open
//!   invalidation window on the key kills the marker.
//! - Writers never write through. [`NonStrictInvalidationStrategy`] evicts
//!   the key and opens an invalidation window before the store write, and
//!   closes it when the transaction completes.
//!
//! # Example
//!
//! ```ignore
//! let regions = RegionFactory::start(RegionFactoryConfig::new(), Arc::new(SystemTimeSource))?;
//! let strategy = NonStrictInvalidationStrategy::new(regions.build_region("Item")?);
//!
//! if let Some(pending) = strategy.before_load(tx, &key).await {
//!     let row = store.read(&key)?;
//!     // installs only if nobody evicted `key` in the meantime
//!     strategy.after_load(tx, &pending, CacheEntry::new(row.version, row.state)).await;
//! }
//! ```

pub mod factory;
pub mod pending_puts;
pub mod region;
pub mod strategy;
pub mod traits;

pub use factory::RegionFactory;
pub use pending_puts::{PendingPut, PendingPutsRegistry};
pub use region::InMemoryRegion;
pub use strategy::{NonStrictInvalidationStrategy, TxCacheState};
pub use traits::{CacheEntry, CacheRegion, RegionStats};
