// Transactions: per-transaction state, SS2PL locking, write-ahead logging,
// and lifecycle management.

pub mod error;
pub mod lock_manager;
pub mod manager;
pub mod types;
pub mod wal;

pub use error::{TransactionError, TransactionResult};
pub use lock_manager::{LockManager, LockMode, DEADLOCK_DETECTION_INTERVAL};
pub use manager::TransactionManager;
pub use types::{Transaction, TransactionState};
pub use wal::{LogManager, LogRecord, LogRecordType};
