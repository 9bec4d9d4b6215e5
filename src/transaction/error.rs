// Transaction-level control errors.

use thiserror::Error;

use crate::common::TxnId;

/// Raised when a transaction must stop executing, most commonly because the
/// deadlock detector chose it as a victim and its blocking lock call
/// returned `false`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionError {
    #[error("transaction {0} aborted")]
    Aborted(TxnId),
}

pub type TransactionResult<T> = std::result::Result<T, TransactionError>;

impl TransactionError {
    /// Converts the `false` return of a blocking lock call into the abort
    /// signal, so callers can `?` their way out of a victimized transaction.
    pub fn check(granted: bool, txn_id: TxnId) -> TransactionResult<()> {
        if granted {
            Ok(())
        } else {
            Err(TransactionError::Aborted(txn_id))
        }
    }
}
