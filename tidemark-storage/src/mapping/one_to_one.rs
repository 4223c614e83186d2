//! One-to-one association mapped onto zero columns.
//!
//! The association has no column of its own. Its value is resolved from
//! the owner's identifier, which the persistence context already knows,
//! so hydration and assembly never read a column value and the type never
//! contributes to dirty checking.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tidemark_core::{EntityKey, Identifier};

use super::{ColumnMapping, ColumnSize, PersistenceContextView, SqlTypeCode};

/// Which side of the association holds the foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForeignKeyDirection {
    /// The key points from the child to this (parent) side.
    ToParent,
    /// The key points from this side to the parent.
    FromParent,
}

/// Zero-column one-to-one association type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneToOneType {
    referenced_entity_name: String,
    /// Owning entity.
    entity_name: String,
    property_name: Option<String>,
    direction: ForeignKeyDirection,
    unique_key_property_name: Option<String>,
    lazy: bool,
    unwrap_proxy: bool,
}

impl OneToOneType {
    pub fn new(
        referenced_entity_name: impl Into<String>,
        entity_name: impl Into<String>,
        direction: ForeignKeyDirection,
    ) -> Self {
        Self {
            referenced_entity_name: referenced_entity_name.into(),
            entity_name: entity_name.into(),
            property_name: None,
            direction,
            unique_key_property_name: None,
            lazy: false,
            unwrap_proxy: false,
        }
    }

    /// Set the owning property.
    pub fn with_property_name(mut self, property_name: impl Into<String>) -> Self {
        self.property_name = Some(property_name.into());
        self
    }

    /// Reference a unique key property instead of the primary key.
    pub fn with_unique_key_property(mut self, property_name: impl Into<String>) -> Self {
        self.unique_key_property_name = Some(property_name.into());
        self
    }

    pub fn with_lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn with_unwrap_proxy(mut self, unwrap_proxy: bool) -> Self {
        self.unwrap_proxy = unwrap_proxy;
        self
    }

    pub fn referenced_entity_name(&self) -> &str {
        &self.referenced_entity_name
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn property_name(&self) -> Option<&str> {
        self.property_name.as_deref()
    }

    pub fn foreign_key_direction(&self) -> ForeignKeyDirection {
        self.direction
    }

    /// Whether the association targets the referenced primary key.
    pub fn is_reference_to_primary_key(&self) -> bool {
        self.unique_key_property_name.is_none()
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    pub fn is_eager(&self) -> bool {
        !self.lazy
    }

    pub fn is_unwrap_proxy(&self) -> bool {
        self.unwrap_proxy
    }

    pub fn is_one_to_one(&self) -> bool {
        true
    }

    pub fn use_lhs_primary_key(&self) -> bool {
        true
    }

    /// Never dirty-checked: the association is never dirty.
    pub fn is_always_dirty_checked(&self) -> bool {
        false
    }

    pub fn is_nullable(&self) -> bool {
        self.direction == ForeignKeyDirection::ToParent
    }

    pub fn is_dirty(&self, _old: &Value, _current: &Value) -> bool {
        false
    }

    pub fn is_modified(&self, _old: &Value, _current: &Value, _checkable: &[bool]) -> bool {
        false
    }

    /// Whether the association is null for `owner`.
    ///
    /// Without an owning property there is nothing to consult and the
    /// association is reported as present.
    pub fn is_null(&self, owner: &EntityKey, ctx: &dyn PersistenceContextView) -> bool {
        let Some(property) = self.property_name.as_deref() else {
            return false;
        };
        match ctx.context_entity_identifier(owner) {
            Some(id) => ctx.is_property_null(&EntityKey::new(&self.entity_name, id), property),
            None => true,
        }
    }

    /// Identifier of the associated entity: the owner's own identifier.
    pub fn hydrate(&self, owner: &EntityKey, ctx: &dyn PersistenceContextView) -> Option<Identifier> {
        ctx.context_entity_identifier(owner)
    }

    /// Nothing is cached for this association.
    pub fn disassemble(&self, _value: &Value, _owner: &EntityKey) -> Option<Value> {
        None
    }

    /// Resolve the associated entity's key from the owner's identifier,
    /// ignoring the cached value.
    pub fn assemble(
        &self,
        _cached: Option<&Value>,
        owner: &EntityKey,
        ctx: &dyn PersistenceContextView,
    ) -> Option<EntityKey> {
        ctx.context_entity_identifier(owner)
            .map(|id| EntityKey::new(&self.referenced_entity_name, id))
    }
}

impl ColumnMapping for OneToOneType {
    fn column_span(&self) -> usize {
        0
    }

    fn sql_types(&self) -> Vec<SqlTypeCode> {
        Vec::new()
    }

    fn dictated_sizes(&self) -> Vec<ColumnSize> {
        Vec::new()
    }

    fn default_sizes(&self) -> Vec<ColumnSize> {
        Vec::new()
    }

    fn to_column_nullness(&self, _value: &Value) -> Vec<bool> {
        Vec::new()
    }

    fn null_safe_set(&self, _binds: &mut Vec<Value>, _value: &Value, _index: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    /// Persistence context over a fixed set of owner states.
    #[derive(Default)]
    struct Context {
        managed: HashMap<EntityKey, Value>,
    }

    impl PersistenceContextView for Context {
        fn context_entity_identifier(&self, owner: &EntityKey) -> Option<Identifier> {
            self.managed.contains_key(owner).then(|| owner.identifier())
        }

        fn is_property_null(&self, owner: &EntityKey, property: &str) -> bool {
            self.managed
                .get(owner)
                .and_then(|state| state.get(property))
                .map_or(true, Value::is_null)
        }
    }

    fn person_context() -> Context {
        let mut ctx = Context::default();
        ctx.managed
            .insert(EntityKey::new("Person", 7), json!({ "address": { "city": "Brno" } }));
        ctx.managed
            .insert(EntityKey::new("Person", 8), json!({ "address": null }));
        ctx
    }

    fn address_of_person() -> OneToOneType {
        OneToOneType::new("Address", "Person", ForeignKeyDirection::FromParent)
            .with_property_name("address")
    }

    #[test]
    fn test_spans_no_columns() {
        let ty = address_of_person();
        assert_eq!(ty.column_span(), 0);
        assert!(ty.sql_types().is_empty());
        assert!(ty.dictated_sizes().is_empty());
        assert!(ty.default_sizes().is_empty());
        assert!(ty.to_column_nullness(&json!(1)).is_empty());

        let mut binds = vec![json!("untouched")];
        ty.null_safe_set(&mut binds, &json!(42), 1);
        assert_eq!(binds, vec![json!("untouched")]);
    }

    #[test]
    fn test_association_flags() {
        let ty = address_of_person();
        assert!(ty.is_one_to_one());
        assert!(ty.use_lhs_primary_key());
        assert!(!ty.is_always_dirty_checked());
        assert!(!ty.is_dirty(&json!(1), &json!(2)));
        assert!(!ty.is_modified(&json!(1), &json!(2), &[true]));
        assert!(ty.is_reference_to_primary_key());
        assert!(ty.is_eager());
    }

    #[test]
    fn test_nullable_only_towards_parent() {
        let to_parent = OneToOneType::new("Address", "Person", ForeignKeyDirection::ToParent);
        let from_parent = OneToOneType::new("Address", "Person", ForeignKeyDirection::FromParent);
        assert!(to_parent.is_nullable());
        assert!(!from_parent.is_nullable());
    }

    #[test]
    fn test_is_null_delegates_to_context() {
        let ctx = person_context();
        let ty = address_of_person();
        assert!(!ty.is_null(&EntityKey::new("Person", 7), &ctx));
        assert!(ty.is_null(&EntityKey::new("Person", 8), &ctx));

        let without_property = OneToOneType::new("Address", "Person", ForeignKeyDirection::ToParent);
        assert!(!without_property.is_null(&EntityKey::new("Person", 8), &ctx));
    }

    #[test]
    fn test_hydrate_and_assemble_use_owner_identifier() {
        let ctx = person_context();
        let ty = address_of_person();
        let owner = EntityKey::new("Person", 7);

        assert_eq!(ty.hydrate(&owner, &ctx), Some(7));
        assert_eq!(ty.disassemble(&json!({ "city": "Brno" }), &owner), None);
        assert_eq!(
            ty.assemble(Some(&json!(999)), &owner, &ctx),
            Some(EntityKey::new("Address", 7))
        );
        assert_eq!(ty.assemble(None, &EntityKey::new("Person", 1), &ctx), None);
    }
}
