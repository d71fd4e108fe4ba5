//! Caller-scoped store transactions.
//!
//! A [`TransactionalBackend`] can open a [`StoreTransaction`], which is itself
//! a [`StoreBackend`]. Repositories built over the transaction (see
//! [`Repository::within`](crate::Repository::within)) run every read and
//! write inside it, with the usual soft-delete and audit rules. Several
//! repositories can share one transaction by cloning it.
//!
//! ```rust,ignore
//! transactional(&backend, |tx| async move {
//!     let labels = labels.within(&tx);
//!     let logs = logs.within(&tx);
//!     labels.soft_delete(Filter::any_of("id", ids)).await?;
//!     logs.save(LogRecord::new("info", "labels removed")).await?;
//!     Ok::<_, StoreError>(())
//! })
//! .await?;
//! ```

use std::future::Future;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::errors::{StoreError, StoreResult};
use crate::repository::StoreBackend;

/// An open transaction usable as a backend.
///
/// Clones refer to the same transaction. Once it is committed or rolled back,
/// operations through any clone fail with [`StoreError::TransactionClosed`].
#[async_trait]
pub trait StoreTransaction: StoreBackend {
    /// Makes every write in the transaction visible.
    async fn commit(self) -> StoreResult<()>;

    /// Discards every write in the transaction.
    async fn rollback(self) -> StoreResult<()>;
}

/// A backend able to open transactions.
#[async_trait]
pub trait TransactionalBackend: StoreBackend {
    /// Transaction type opened by [`TransactionalBackend::begin`].
    type Transaction: StoreTransaction;

    /// Opens a transaction.
    async fn begin(&self) -> StoreResult<Self::Transaction>;
}

/// Runs `op` inside a fresh transaction on `backend`.
///
/// Commits when `op` returns `Ok` and rolls back when it returns `Err`. A
/// rollback failure is logged; the operation's own error is returned.
pub async fn transactional<B, F, Fut, T, E>(backend: &B, op: F) -> Result<T, E>
where
    B: TransactionalBackend,
    F: FnOnce(B::Transaction) -> Fut + Send,
    Fut: Future<Output = Result<T, E>> + Send,
    E: From<StoreError>,
{
    let tx = backend.begin().await?;
    match op(tx.clone()).await {
        Ok(value) => {
            tx.commit().await?;
            debug!(backend = %backend.kind(), "transaction committed");
            Ok(value)
        }
        Err(error) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(backend = %backend.kind(), error = %rollback, "transaction rollback failed");
            }
            Err(error)
        }
    }
}
