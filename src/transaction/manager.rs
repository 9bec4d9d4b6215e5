// Transaction lifecycle: begin, commit, abort, and undo-based rollback.

use std::collections::HashSet;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::buffer::BufferPoolManager;
use crate::common::{TupleId, TxnId, INVALID_LSN};
use crate::error::{DbError, Result};
use crate::storage::table_page::TablePage;
use crate::storage::tuple::Tuple;
use crate::transaction::lock_manager::LockManager;
use crate::transaction::types::{self, Transaction, TransactionState};
use crate::transaction::wal::{LogManager, LogRecord, LogRecordType};

/// Creates transactions, drives commit and abort, and undoes aborted work
/// by walking the per-transaction LSN chain.
///
/// Dropping the manager removes its transactions from the process-wide
/// transaction table.
pub struct TransactionManager {
    lock_manager: Arc<LockManager>,
    log_manager: Option<Arc<LogManager>>,
    buffer: Option<BufferPoolManager>,
    created: Mutex<Vec<TxnId>>,
}

impl TransactionManager {
    /// A manager without logging; aborts release locks but undo nothing.
    pub fn new(lock_manager: Arc<LockManager>) -> TransactionManager {
        TransactionManager {
            lock_manager,
            log_manager: None,
            buffer: None,
            created: Mutex::new(Vec::new()),
        }
    }

    /// A manager with write-ahead logging and rollback.
    pub fn with_logging(
        lock_manager: Arc<LockManager>,
        log_manager: Arc<LogManager>,
        buffer: BufferPoolManager,
    ) -> TransactionManager {
        TransactionManager {
            lock_manager,
            log_manager: Some(log_manager),
            buffer: Some(buffer),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Starts a transaction: allocates the next id, registers it in the
    /// transaction table, and writes a `Begin` record when logging.
    pub fn begin_transaction(&self) -> Result<Arc<Transaction>> {
        let txn_id = types::allocate_txn_id();
        let txn = Arc::new(Transaction::new(txn_id));
        types::register(Arc::clone(&txn));
        self.created.lock().push(txn_id);
        if let Some(log) = &self.log_manager {
            let lsn = log.append_record(&LogRecord::new(LogRecordType::Begin, txn_id, txn.lsn()))?;
            txn.set_lsn(lsn);
        }
        debug!("txn {txn_id} started");
        Ok(txn)
    }

    /// Commits: writes a `Commit` record, flushes the log (the durability
    /// point), marks the transaction committed, and releases its locks.
    pub fn commit_transaction(&self, txn_id: TxnId) -> Result<()> {
        let Some(txn) = Transaction::get(txn_id) else {
            return Ok(());
        };
        if let Some(log) = &self.log_manager {
            let lsn = log.append_record(&LogRecord::new(LogRecordType::Commit, txn_id, txn.lsn()))?;
            log.flush()?;
            txn.set_lsn(lsn);
        }
        txn.set_state(TransactionState::Committed);
        self.release_all_locks(&txn);
        debug!("txn {txn_id} committed");
        Ok(())
    }

    /// Aborts: writes an `Abort` record, marks the transaction aborted,
    /// rolls its updates back, and releases its locks.
    pub fn abort_transaction(&self, txn_id: TxnId) -> Result<()> {
        let Some(txn) = Transaction::get(txn_id) else {
            return Ok(());
        };
        if let Some(log) = &self.log_manager {
            let lsn = log.append_record(&LogRecord::new(LogRecordType::Abort, txn_id, txn.lsn()))?;
            txn.set_lsn(lsn);
        }
        txn.set_state(TransactionState::Aborted);
        self.rollback(&txn)?;
        self.release_all_locks(&txn);
        debug!("txn {txn_id} aborted");
        Ok(())
    }

    /// Looks a transaction up in the process-wide table.
    pub fn get_transaction(txn_id: TxnId) -> Option<Arc<Transaction>> {
        Transaction::get(txn_id)
    }

    /// Walks the LSN chain backward and rewrites each updated tuple's
    /// before image in place. The transaction still holds its exclusive
    /// locks, so no other writer can observe the intermediate states.
    fn rollback(&self, txn: &Transaction) -> Result<()> {
        let (Some(log), Some(buffer)) = (&self.log_manager, &self.buffer) else {
            return Ok(());
        };
        let mut undone = 0usize;
        let mut lsn = txn.lsn();
        while lsn != INVALID_LSN {
            let record = log.get_record(lsn)?;
            match record.record_type() {
                LogRecordType::Update => {
                    // a page freed since the update has nothing to restore
                    if let Some(guard) = buffer.fetch_page(record.page_id())? {
                        let mut page = TablePage::new(guard);
                        let old = Tuple::from_slice(record.old_data());
                        if !page.update_tuple(record.slot_id(), &old) {
                            return Err(DbError::Internal(format!(
                                "rollback of txn {} cannot restore tuple (page {}, slot {})",
                                txn.id(),
                                record.page_id(),
                                record.slot_id()
                            )));
                        }
                        undone += 1;
                    }
                }
                LogRecordType::Begin => break,
                _ => {}
            }
            lsn = record.prev_lsn();
        }
        debug!("txn {} rolled back {undone} updates", txn.id());
        Ok(())
    }

    fn release_all_locks(&self, txn: &Transaction) {
        let mut lock_set: HashSet<TupleId> = txn.exclusive_lock_set().iter().copied().collect();
        lock_set.extend(txn.shared_lock_set().iter().copied());
        for tuple_id in lock_set {
            self.lock_manager.unlock(txn, tuple_id);
        }
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        let created = std::mem::take(&mut *self.created.lock());
        types::unregister_all(&created);
    }
}
