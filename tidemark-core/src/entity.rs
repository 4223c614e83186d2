//! Persistent entity contract.

use crate::{EntityKey, Identifier, Version};
use serde::{de::DeserializeOwned, Serialize};

/// Marker trait for types that the session can persist and cache.
///
/// State crosses the store and cache boundaries as a `serde_json::Value`
/// snapshot; identifier and version are managed by the session and written
/// back onto the entity after persist and load.
pub trait PersistentEntity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Entity name, also the name of the entity's cache region.
    const ENTITY_NAME: &'static str;

    fn id(&self) -> Identifier;

    fn set_id(&mut self, id: Identifier);

    fn version(&self) -> Version;

    fn set_version(&mut self, version: Version);

    /// Cache slot of this instance.
    fn entity_key(&self) -> EntityKey {
        EntityKey::new(Self::ENTITY_NAME, self.id())
    }

    /// Cache slot for an arbitrary identifier of this entity type.
    fn key_for(id: Identifier) -> EntityKey {
        EntityKey::new(Self::ENTITY_NAME, id)
    }
}
