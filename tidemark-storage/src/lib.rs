//! Tidemark Storage - Entity Store, Cache Regions and Sessions
//!
//! The entity store is the source of truth; cache regions hold versioned
//! snapshots of its rows; sessions run units of work against both and keep
//! them coherent through the non-strict invalidation strategy.

pub mod cache;
pub mod mapping;
pub mod session;
pub mod store;

pub use cache::{
    CacheEntry, CacheRegion, InMemoryRegion, NonStrictInvalidationStrategy, PendingPut,
    PendingPutsRegistry, RegionFactory, RegionStats, TxCacheState,
};
pub use mapping::{
    ColumnMapping, ColumnSize, ForeignKeyDirection, OneToOneType, PersistenceContextView,
    SqlTypeCode,
};
pub use session::{
    Session, SessionFactory, SessionFuture, SessionStatus, TransactionListener, TxOutcome,
};
pub use store::{EntityStore, InMemoryEntityStore, Row};
