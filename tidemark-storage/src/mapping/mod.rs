//! Association type mappings.

pub mod one_to_one;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tidemark_core::{EntityKey, Identifier};

pub use one_to_one::{ForeignKeyDirection, OneToOneType};

/// JDBC-style SQL type code.
pub type SqlTypeCode = i32;

/// Column size constraints a mapped type dictates or defaults to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ColumnSize {
    pub length: Option<u64>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
}

/// How a mapped type occupies SQL columns.
pub trait ColumnMapping {
    fn column_span(&self) -> usize;

    fn sql_types(&self) -> Vec<SqlTypeCode>;

    fn dictated_sizes(&self) -> Vec<ColumnSize>;

    fn default_sizes(&self) -> Vec<ColumnSize>;

    /// Per-column nullness of `value`.
    fn to_column_nullness(&self, value: &Value) -> Vec<bool>;

    /// Bind `value` into `binds` starting at `index`.
    fn null_safe_set(&self, binds: &mut Vec<Value>, value: &Value, index: usize);
}

/// Read access to a session's persistence context.
pub trait PersistenceContextView {
    /// Identifier of `owner` if the context manages it.
    fn context_entity_identifier(&self, owner: &EntityKey) -> Option<Identifier>;

    /// Whether `property` of the managed `owner` is null. Unmanaged owners
    /// report null.
    fn is_property_null(&self, owner: &EntityKey, property: &str) -> bool;
}
