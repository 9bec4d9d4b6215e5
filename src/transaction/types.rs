// Transaction state and the process-wide transaction table.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::common::{Lsn, TupleId, TxnId, INVALID_LSN};

/// Lifecycle state. Under SS2PL there is no explicit shrinking phase: all
/// locks are released together when the transaction leaves `Growing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionState {
    Growing = 0,
    Committed = 1,
    Aborted = 2,
}

impl TransactionState {
    fn from_u8(value: u8) -> TransactionState {
        match value {
            0 => TransactionState::Growing,
            1 => TransactionState::Committed,
            _ => TransactionState::Aborted,
        }
    }
}

/// Per-transaction state: id, most recent log record, lifecycle state, and
/// the sets of tuple locks held.
///
/// A transaction is driven by a single worker thread; the only cross-thread
/// writer is the deadlock detector, which forces `state` to `Aborted`. The
/// state therefore lives in an atomic.
pub struct Transaction {
    id: TxnId,
    lsn: AtomicI64,
    state: AtomicU8,
    shared_lock_set: Mutex<HashSet<TupleId>>,
    exclusive_lock_set: Mutex<HashSet<TupleId>>,
}

impl Transaction {
    pub(crate) fn new(id: TxnId) -> Transaction {
        Transaction {
            id,
            lsn: AtomicI64::new(INVALID_LSN),
            state: AtomicU8::new(TransactionState::Growing as u8),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    /// LSN of this transaction's most recent log record.
    pub fn lsn(&self) -> Lsn {
        self.lsn.load(Ordering::Acquire)
    }

    pub fn set_lsn(&self, lsn: Lsn) {
        self.lsn.store(lsn, Ordering::Release);
    }

    pub fn state(&self) -> TransactionState {
        TransactionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: TransactionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_shared_locked(&self, tuple_id: TupleId) -> bool {
        self.shared_lock_set.lock().contains(&tuple_id)
    }

    pub fn is_exclusive_locked(&self, tuple_id: TupleId) -> bool {
        self.exclusive_lock_set.lock().contains(&tuple_id)
    }

    pub fn shared_lock_set(&self) -> MutexGuard<'_, HashSet<TupleId>> {
        self.shared_lock_set.lock()
    }

    pub fn exclusive_lock_set(&self) -> MutexGuard<'_, HashSet<TupleId>> {
        self.exclusive_lock_set.lock()
    }

    /// Looks a transaction up in the process-wide table.
    pub fn get(txn_id: TxnId) -> Option<Arc<Transaction>> {
        TXN_TABLE.read().get(&txn_id).cloned()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("lsn", &self.lsn())
            .finish()
    }
}

/// Process-wide transaction table. Readers (lock manager, deadlock
/// detector) take the shared lock; transaction managers insert and remove
/// entries under the exclusive lock.
static TXN_TABLE: Lazy<RwLock<HashMap<TxnId, Arc<Transaction>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

static NEXT_TXN_ID: AtomicI64 = AtomicI64::new(0);

pub(crate) fn allocate_txn_id() -> TxnId {
    NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn register(txn: Arc<Transaction>) {
    TXN_TABLE.write().insert(txn.id(), txn);
}

pub(crate) fn unregister_all(txn_ids: &[TxnId]) {
    let mut table = TXN_TABLE.write();
    for txn_id in txn_ids {
        table.remove(txn_id);
    }
}
