//! Transaction lifecycle hooks.

use async_trait::async_trait;
use tidemark_core::TxId;

/// Subscriber to a session's flush and completion boundaries.
///
/// Hooks are notifications: they cannot veto or fail the transaction.
#[async_trait]
pub trait TransactionListener: Send + Sync {
    async fn before_flush(&self, _tx: TxId) {}

    async fn after_flush(&self, _tx: TxId) {}

    async fn after_commit(&self, _tx: TxId) {}

    async fn after_rollback(&self, _tx: TxId) {}
}
