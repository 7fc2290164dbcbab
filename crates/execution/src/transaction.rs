//! Transaction seam.
//!
//! The engine never talks to a database itself. Transactional tasks (and every
//! task when auto-transaction is on) are wrapped in a [`Transaction`] obtained
//! from the configured [`TransactionManager`].

use async_trait::async_trait;
use thiserror::Error;

/// Transaction failures.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("failed to begin transaction: {0}")]
    Begin(String),

    #[error("failed to commit transaction: {0}")]
    Commit(String),

    #[error("failed to roll back transaction: {0}")]
    Rollback(String),
}

/// Handle to an open transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Task the transaction belongs to
    pub owner: String,
}

/// Opens and closes transactions around task work.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Open a transaction for `owner`.
    async fn begin(&self, owner: &str) -> Result<Transaction, TransactionError>;

    /// Make the work durable.
    async fn commit(&self, tx: Transaction) -> Result<(), TransactionError>;

    /// Discard the work.
    async fn rollback(&self, tx: Transaction) -> Result<(), TransactionError>;
}

/// Transaction manager for deployments without a transactional backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTransactions;

#[async_trait]
impl TransactionManager for NoopTransactions {
    async fn begin(&self, owner: &str) -> Result<Transaction, TransactionError> {
        Ok(Transaction {
            owner: owner.to_string(),
        })
    }

    async fn commit(&self, _tx: Transaction) -> Result<(), TransactionError> {
        Ok(())
    }

    async fn rollback(&self, _tx: Transaction) -> Result<(), TransactionError> {
        Ok(())
    }
}
