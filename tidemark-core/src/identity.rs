//! Identity types for cached entities and transactions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Row identifier assigned by the entity store's sequence.
pub type Identifier = i64;

/// Monotonically assigned row version. Inserts start at 0.
pub type Version = i64;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Transaction identifier using UUIDv7 for timestamp-sortable IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(Uuid);

impl TxId {
    /// Generate a new transaction id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Uniquely identifies one row's cache slot: (entity name, identifier).
///
/// The entity name is shared behind an `Arc` so keys stay cheap to clone
/// when they fan out into registries and per-transaction state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    entity_name: Arc<str>,
    identifier: Identifier,
}

impl EntityKey {
    pub fn new(entity_name: impl AsRef<str>, identifier: Identifier) -> Self {
        Self {
            entity_name: Arc::from(entity_name.as_ref()),
            identifier,
        }
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn identifier(&self) -> Identifier {
        self.identifier
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_name, self.identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_entity_key_equality_and_hash() {
        let a = EntityKey::new("Item", 7);
        let b = EntityKey::new(String::from("Item"), 7);
        let c = EntityKey::new("Item", 8);

        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&a));
    }

    #[test]
    fn test_entity_key_display() {
        let key = EntityKey::new("Item", 42);
        assert_eq!(key.to_string(), "Item#42");
        assert_eq!(key.entity_name(), "Item");
        assert_eq!(key.identifier(), 42);
    }

    #[test]
    fn test_tx_ids_are_unique() {
        let first = TxId::new();
        let second = TxId::new();
        assert_ne!(first, second);
        assert_eq!(TxId::from_uuid(first.as_uuid()), first);
    }
}
