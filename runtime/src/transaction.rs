//! Commit/rollback plumbing shared by every component.

use fulfillment_core::Result;
use fulfillment_core::error::StoreResultExt;
use fulfillment_core::store::StoreTransaction;

/// Commit `tx` if `result` is `Ok`, roll it back otherwise.
///
/// A failed rollback is only logged: the transaction is gone either way and
/// the original error is the one worth returning.
pub(crate) async fn finish<Tx, T>(tx: Tx, result: Result<T>, context: &str) -> Result<T>
where
    Tx: StoreTransaction,
{
    match result {
        Ok(value) => {
            tx.commit().await.context(context)?;
            Ok(value)
        }
        Err(error) => {
            discard(tx).await;
            Err(error)
        }
    }
}

/// Roll back a transaction, logging failures.
pub(crate) async fn discard<Tx>(tx: Tx)
where
    Tx: StoreTransaction,
{
    if let Err(error) = tx.rollback().await {
        tracing::warn!(error = %error, "Rollback failed");
    }
}
