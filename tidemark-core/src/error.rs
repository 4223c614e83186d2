//! Error types for tidemark operations

use crate::{EntityKey, Version};
use std::time::Duration;
use thiserror::Error;

/// Entity store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {key}")]
    NotFound { key: EntityKey },

    #[error("Insert failed for {key}: {reason}")]
    InsertFailed { key: EntityKey, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Serialization failed for {entity_name}: {reason}")]
    Serialization { entity_name: String, reason: String },
}

/// Lost races between concurrent writers.
///
/// Both variants are recovered locally: the transaction is marked
/// rollback-only and the unit of work reports failure instead of crashing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConcurrencyError {
    #[error("Optimistic conflict on {key}: expected version {expected:?}, found {actual:?}")]
    OptimisticConflict {
        key: EntityKey,
        expected: Option<Version>,
        actual: Option<Version>,
    },

    #[error("Lock on {key} not acquired within {waited:?}")]
    LockTimeout { key: EntityKey, waited: Duration },
}

impl ConcurrencyError {
    pub fn key(&self) -> &EntityKey {
        match self {
            ConcurrencyError::OptimisticConflict { key, .. } => key,
            ConcurrencyError::LockTimeout { key, .. } => key,
        }
    }
}

/// Rendezvous failures in the race harness. Never recovered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("Timed out after {waited:?} waiting on {what}")]
    Timeout { what: String, waited: Duration },

    #[error("Worker for {what} stopped before completing: {reason}")]
    Interrupted { what: String, reason: String },
}

/// Cache layer errors. Always best-effort relative to the entity store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache region {region} unavailable: {reason}")]
    Unavailable { region: String, reason: String },

    #[error("Cache region {region} used after shutdown")]
    RegionStopped { region: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all tidemark errors.
#[derive(Debug, Clone, Error)]
pub enum CoherenceError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Concurrency error: {0}")]
    Concurrency(#[from] ConcurrencyError),

    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CoherenceError {
    /// True for losers of a write race (optimistic conflict or lock timeout).
    pub fn is_conflict(&self) -> bool {
        matches!(self, CoherenceError::Concurrency(_))
    }

    /// The concurrency failure, if this is one.
    pub fn as_conflict(&self) -> Option<&ConcurrencyError> {
        match self {
            CoherenceError::Concurrency(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_coordination_timeout(&self) -> bool {
        matches!(
            self,
            CoherenceError::Coordination(CoordinationError::Timeout { .. })
        )
    }
}

/// Result type alias for tidemark operations.
pub type CoherenceResult<T> = Result<T, CoherenceError>;

// =============================================================================
// TESTS
// =============================================================================
