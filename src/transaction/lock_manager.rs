// SS2PL lock manager with FIFO wait queues and cycle-based deadlock
// detection.
//
// All lock state lives in one table behind a single mutex. A blocking
// request enqueues itself, waits on the tuple's condition variable, and
// re-tests its grant condition after every wake-up, checking first whether
// it has been aborted. Waiters are granted strictly in queue order; the one
// permitted converter per tuple bypasses the queue and is granted as soon
// as it is the sole shared holder.
//
// The background detector wakes every `DEADLOCK_DETECTION_INTERVAL`, builds
// the wait-for graph from the table, and on any cycle forces the youngest
// participating transaction to `Aborted` before waking it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info};
use parking_lot::{Condvar, Mutex};

use crate::common::graph::Graph;
use crate::common::{TupleId, TxnId, INVALID_TXN_ID};
use crate::transaction::types::{Transaction, TransactionState};

/// How often the background detector scans for cycles.
pub const DEADLOCK_DETECTION_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Lock state of one tuple. A transaction waiting to convert its shared
/// lock enqueues with mode `Exclusive` and sets `wait_conversion`.
struct LockList {
    shared_locks: HashSet<TxnId>,
    exclusive_lock: TxnId,
    wait_list: VecDeque<(TxnId, LockMode)>,
    wait_conversion: bool,
    cv: Arc<Condvar>,
}

impl LockList {
    fn new() -> LockList {
        LockList {
            shared_locks: HashSet::new(),
            exclusive_lock: INVALID_TXN_ID,
            wait_list: VecDeque::new(),
            wait_conversion: false,
            cv: Arc::new(Condvar::new()),
        }
    }

    fn holds_any(&self, txn_id: TxnId) -> bool {
        self.shared_locks.contains(&txn_id) || self.exclusive_lock == txn_id
    }

    fn front_is(&self, txn_id: TxnId) -> bool {
        self.wait_list.front().is_some_and(|&(id, _)| id == txn_id)
    }

    fn remove_waiter(&mut self, txn_id: TxnId) {
        self.wait_list.retain(|&(id, _)| id != txn_id);
    }

    fn is_idle(&self) -> bool {
        self.shared_locks.is_empty()
            && self.exclusive_lock == INVALID_TXN_ID
            && self.wait_list.is_empty()
    }
}

type LockTable = HashMap<TupleId, LockList>;

struct LockManagerInner {
    table: Mutex<LockTable>,
    stop_detector: AtomicBool,
}

pub struct LockManager {
    inner: Arc<LockManagerInner>,
    detector: Option<JoinHandle<()>>,
}

impl LockManager {
    pub fn new(enable_deadlock_detection: bool) -> LockManager {
        let inner = Arc::new(LockManagerInner {
            table: Mutex::new(HashMap::new()),
            stop_detector: AtomicBool::new(false),
        });
        let detector = enable_deadlock_detection.then(|| {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("deadlock-detector".into())
                .spawn(move || detection_loop(&inner))
                .expect("failed to spawn deadlock detector")
        });
        LockManager { inner, detector }
    }

    /// Acquires a shared lock, blocking while an exclusive lock or older
    /// waiters stand in the way.
    ///
    /// Returns `false` when the transaction is not in its growing phase,
    /// already holds a lock on the tuple, or is aborted while waiting.
    pub fn lock_shared(&self, txn: &Transaction, tuple_id: TupleId) -> bool {
        let mut table = self.inner.table.lock();
        if txn.state() != TransactionState::Growing {
            return false;
        }
        let txn_id = txn.id();
        let (already_locked, must_wait, cv) = {
            let list = table.entry(tuple_id).or_insert_with(LockList::new);
            let already_locked = list.holds_any(txn_id);
            let must_wait = !already_locked
                && !(list.exclusive_lock == INVALID_TXN_ID && list.wait_list.is_empty());
            if must_wait {
                list.wait_list.push_back((txn_id, LockMode::Shared));
            }
            (already_locked, must_wait, Arc::clone(&list.cv))
        };
        if already_locked {
            return false;
        }
        if must_wait {
            loop {
                cv.wait(&mut table);
                if txn.state() == TransactionState::Aborted {
                    abandon_wait(&mut table, tuple_id, txn_id);
                    return false;
                }
                let granted = table.get(&tuple_id).is_some_and(|list| {
                    list.exclusive_lock == INVALID_TXN_ID
                        && !list.wait_conversion
                        && list.front_is(txn_id)
                });
                if granted {
                    break;
                }
            }
            leave_wait_list(&mut table, tuple_id, txn_id);
        }
        let list = table.entry(tuple_id).or_insert_with(LockList::new);
        list.shared_locks.insert(txn_id);
        txn.shared_lock_set().insert(tuple_id);
        debug!("txn {txn_id} acquired shared lock on tuple {}", tuple_id.raw());
        true
    }

    /// Acquires an exclusive lock, blocking until no other transaction
    /// holds any lock on the tuple and no older waiter is queued.
    ///
    /// Returns `false` under the same conditions as [`lock_shared`].
    ///
    /// [`lock_shared`]: LockManager::lock_shared
    pub fn lock_exclusive(&self, txn: &Transaction, tuple_id: TupleId) -> bool {
        let mut table = self.inner.table.lock();
        if txn.state() != TransactionState::Growing {
            return false;
        }
        let txn_id = txn.id();
        let (already_locked, must_wait, cv) = {
            let list = table.entry(tuple_id).or_insert_with(LockList::new);
            let already_locked = list.holds_any(txn_id);
            let must_wait = !already_locked
                && !(list.exclusive_lock == INVALID_TXN_ID
                    && list.shared_locks.is_empty()
                    && list.wait_list.is_empty());
            if must_wait {
                list.wait_list.push_back((txn_id, LockMode::Exclusive));
            }
            (already_locked, must_wait, Arc::clone(&list.cv))
        };
        if already_locked {
            return false;
        }
        if must_wait {
            loop {
                cv.wait(&mut table);
                if txn.state() == TransactionState::Aborted {
                    abandon_wait(&mut table, tuple_id, txn_id);
                    return false;
                }
                let granted = table.get(&tuple_id).is_some_and(|list| {
                    list.exclusive_lock == INVALID_TXN_ID
                        && list.shared_locks.is_empty()
                        && list.front_is(txn_id)
                });
                if granted {
                    break;
                }
            }
            leave_wait_list(&mut table, tuple_id, txn_id);
        }
        let list = table.entry(tuple_id).or_insert_with(LockList::new);
        list.exclusive_lock = txn_id;
        txn.exclusive_lock_set().insert(tuple_id);
        debug!("txn {txn_id} acquired exclusive lock on tuple {}", tuple_id.raw());
        true
    }

    /// Converts a held shared lock into an exclusive lock without releasing
    /// it in between. The converter bypasses queue order: it is granted as
    /// soon as it is the only remaining shared holder.
    ///
    /// Returns `false` when the transaction is not growing, holds no shared
    /// lock on the tuple, another transaction is already converting, or the
    /// transaction is aborted while waiting.
    pub fn lock_convert(&self, txn: &Transaction, tuple_id: TupleId) -> bool {
        let mut table = self.inner.table.lock();
        if txn.state() != TransactionState::Growing {
            return false;
        }
        let txn_id = txn.id();
        let (eligible, must_wait, cv) = {
            let list = table.entry(tuple_id).or_insert_with(LockList::new);
            if !list.shared_locks.contains(&txn_id) || list.wait_conversion {
                (false, false, Arc::clone(&list.cv))
            } else {
                let must_wait =
                    !(list.shared_locks.len() == 1 && list.exclusive_lock == INVALID_TXN_ID);
                if must_wait {
                    list.wait_conversion = true;
                    list.wait_list.push_back((txn_id, LockMode::Exclusive));
                }
                (true, must_wait, Arc::clone(&list.cv))
            }
        };
        if !eligible {
            return false;
        }
        if must_wait {
            loop {
                cv.wait(&mut table);
                if txn.state() == TransactionState::Aborted {
                    if let Some(list) = table.get_mut(&tuple_id) {
                        list.remove_waiter(txn_id);
                        list.wait_conversion = false;
                        list.cv.notify_all();
                    }
                    return false;
                }
                let granted = table.get(&tuple_id).is_some_and(|list| {
                    list.exclusive_lock == INVALID_TXN_ID
                        && list.shared_locks.len() == 1
                        && list.shared_locks.contains(&txn_id)
                });
                if granted {
                    break;
                }
            }
            if let Some(list) = table.get_mut(&tuple_id) {
                list.remove_waiter(txn_id);
                list.wait_conversion = false;
            }
        }
        let list = table.entry(tuple_id).or_insert_with(LockList::new);
        list.shared_locks.remove(&txn_id);
        list.exclusive_lock = txn_id;
        txn.shared_lock_set().remove(&tuple_id);
        txn.exclusive_lock_set().insert(tuple_id);
        debug!("txn {txn_id} converted lock on tuple {} to exclusive", tuple_id.raw());
        true
    }

    /// Releases a held lock. Under SS2PL this is only legal once the
    /// transaction has left its growing phase.
    ///
    /// Returns `false` when the transaction is still growing or holds no
    /// lock on the tuple.
    pub fn unlock(&self, txn: &Transaction, tuple_id: TupleId) -> bool {
        let mut table = self.inner.table.lock();
        if txn.state() == TransactionState::Growing {
            return false;
        }
        let txn_id = txn.id();
        let Some(list) = table.get_mut(&tuple_id) else {
            return false;
        };
        let held_shared = list.shared_locks.remove(&txn_id);
        let held_exclusive = list.exclusive_lock == txn_id;
        if held_exclusive {
            list.exclusive_lock = INVALID_TXN_ID;
        }
        if !held_shared && !held_exclusive {
            return false;
        }
        list.cv.notify_all();
        if list.is_idle() {
            table.remove(&tuple_id);
        }
        if held_shared {
            txn.shared_lock_set().remove(&tuple_id);
        } else {
            txn.exclusive_lock_set().remove(&tuple_id);
        }
        debug!("txn {txn_id} released lock on tuple {}", tuple_id.raw());
        true
    }

    /// Builds the wait-for graph: an edge from each waiter to every
    /// transaction holding a conflicting lock on the same tuple.
    pub fn build_wait_graph(&self) -> Graph<TxnId> {
        wait_graph_of(&self.inner.table.lock())
    }

    /// Returns the vertex with the largest transaction id on any cycle, or
    /// `INVALID_TXN_ID` when the graph is acyclic.
    pub fn cycle_victim(graph: &Graph<TxnId>) -> TxnId {
        // Tarjan's strongly connected components: the wait-for graph has no
        // self-edges, so every component of size > 1 contains a cycle.
        struct Scc<'g> {
            graph: &'g Graph<TxnId>,
            index: HashMap<TxnId, usize>,
            lowlink: HashMap<TxnId, usize>,
            on_stack: HashSet<TxnId>,
            stack: Vec<TxnId>,
            next_index: usize,
            victim: TxnId,
        }

        impl Scc<'_> {
            fn visit(&mut self, v: TxnId) {
                self.index.insert(v, self.next_index);
                self.lowlink.insert(v, self.next_index);
                self.next_index += 1;
                self.stack.push(v);
                self.on_stack.insert(v);

                if let Some(neighbors) = self.graph.outgoing_neighbors(v) {
                    for &w in neighbors {
                        if !self.index.contains_key(&w) {
                            self.visit(w);
                            let low = self.lowlink[&w].min(self.lowlink[&v]);
                            self.lowlink.insert(v, low);
                        } else if self.on_stack.contains(&w) {
                            let low = self.index[&w].min(self.lowlink[&v]);
                            self.lowlink.insert(v, low);
                        }
                    }
                }

                if self.lowlink[&v] == self.index[&v] {
                    let mut component = Vec::new();
                    while let Some(w) = self.stack.pop() {
                        self.on_stack.remove(&w);
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    if component.len() > 1 {
                        for w in component {
                            self.victim = self.victim.max(w);
                        }
                    }
                }
            }
        }

        let mut scc = Scc {
            graph,
            index: HashMap::new(),
            lowlink: HashMap::new(),
            on_stack: HashSet::new(),
            stack: Vec::new(),
            next_index: 0,
            victim: INVALID_TXN_ID,
        };
        for v in graph.vertices() {
            if !scc.index.contains_key(&v) {
                scc.visit(v);
            }
        }
        scc.victim
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.inner.stop_detector.store(true, Ordering::Release);
        if let Some(handle) = self.detector.take() {
            let _ = handle.join();
        }
    }
}

/// Abandons a wait after an abort: leave the queue and wake the others,
/// since a new front waiter may now be grantable.
fn abandon_wait(table: &mut LockTable, tuple_id: TupleId, txn_id: TxnId) {
    if let Some(list) = table.get_mut(&tuple_id) {
        list.remove_waiter(txn_id);
        list.cv.notify_all();
    }
}

fn leave_wait_list(table: &mut LockTable, tuple_id: TupleId, txn_id: TxnId) {
    if let Some(list) = table.get_mut(&tuple_id) {
        list.remove_waiter(txn_id);
        list.cv.notify_all();
    }
}

fn wait_graph_of(table: &LockTable) -> Graph<TxnId> {
    let mut graph = Graph::new();
    for list in table.values() {
        for &holder in &list.shared_locks {
            graph.add_vertex(holder);
        }
        if list.exclusive_lock != INVALID_TXN_ID {
            graph.add_vertex(list.exclusive_lock);
        }
        for &(waiter, mode) in &list.wait_list {
            graph.add_vertex(waiter);
            if list.exclusive_lock != INVALID_TXN_ID && list.exclusive_lock != waiter {
                graph.add_edge(waiter, list.exclusive_lock);
            }
            if mode == LockMode::Exclusive {
                for &holder in &list.shared_locks {
                    if holder != waiter {
                        graph.add_edge(waiter, holder);
                    }
                }
            }
        }
    }
    graph
}

fn detection_loop(inner: &LockManagerInner) {
    while !inner.stop_detector.load(Ordering::Acquire) {
        thread::sleep(DEADLOCK_DETECTION_INTERVAL);
        let table = inner.table.lock();
        let graph = wait_graph_of(&table);
        let victim = LockManager::cycle_victim(&graph);
        if victim == INVALID_TXN_ID {
            continue;
        }
        info!("deadlock detected, aborting youngest transaction {victim}");
        if let Some(txn) = Transaction::get(victim) {
            txn.set_state(TransactionState::Aborted);
        }
        for list in table.values() {
            if list.wait_list.iter().any(|&(id, _)| id == victim) {
                list.cv.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::error::TransactionError;
    use crate::transaction::manager::TransactionManager;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    fn tuple(raw: i64) -> TupleId {
        TupleId::from_raw(raw)
    }

    fn sleep_ms(ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn shared_set(txn: &Transaction) -> HashSet<TupleId> {
        txn.shared_lock_set().clone()
    }

    fn exclusive_set(txn: &Transaction) -> HashSet<TupleId> {
        txn.exclusive_lock_set().clone()
    }

    #[test]
    fn exclusive_lock_rules() {
        let lm = Arc::new(LockManager::new(false));
        let tm = TransactionManager::new(Arc::clone(&lm));
        let txn = tm.begin_transaction().unwrap();

        // SS2PL violation: locking outside the growing phase
        txn.set_state(TransactionState::Committed);
        assert!(!lm.lock_exclusive(&txn, tuple(123)));
        assert!(exclusive_set(&txn).is_empty());

        txn.set_state(TransactionState::Growing);
        assert!(lm.lock_exclusive(&txn, tuple(123)));
        assert_eq!(exclusive_set(&txn), HashSet::from([tuple(123)]));
        assert!(lm.lock_exclusive(&txn, tuple(456)));
        assert_eq!(exclusive_set(&txn), HashSet::from([tuple(123), tuple(456)]));

        // double lock
        assert!(!lm.lock_exclusive(&txn, tuple(123)));
        assert!(!lm.lock_shared(&txn, tuple(123)));
        assert_eq!(exclusive_set(&txn), HashSet::from([tuple(123), tuple(456)]));
    }

    #[test]
    fn convert_lock_rules() {
        let lm = Arc::new(LockManager::new(false));
        let tm = TransactionManager::new(Arc::clone(&lm));
        let txn = tm.begin_transaction().unwrap();

        txn.set_state(TransactionState::Committed);
        assert!(!lm.lock_convert(&txn, tuple(123)));

        // nothing to convert
        txn.set_state(TransactionState::Growing);
        assert!(!lm.lock_convert(&txn, tuple(123)));
        assert!(exclusive_set(&txn).is_empty());

        assert!(lm.lock_shared(&txn, tuple(123)));
        assert!(lm.lock_convert(&txn, tuple(123)));
        assert!(shared_set(&txn).is_empty());
        assert_eq!(exclusive_set(&txn), HashSet::from([tuple(123)]));

        // the shared lock is gone, so a second convert fails
        assert!(!lm.lock_convert(&txn, tuple(123)));
        assert_eq!(exclusive_set(&txn), HashSet::from([tuple(123)]));
    }

    #[test]
    fn unlock_rules() {
        let lm = Arc::new(LockManager::new(false));
        let tm = TransactionManager::new(Arc::clone(&lm));
        let txn = tm.begin_transaction().unwrap();

        // unlocking while growing violates SS2PL
        assert!(!lm.unlock(&txn, tuple(123)));

        // nothing to unlock
        txn.set_state(TransactionState::Committed);
        assert!(!lm.unlock(&txn, tuple(123)));

        txn.set_state(TransactionState::Growing);
        assert!(lm.lock_shared(&txn, tuple(123)));
        assert!(lm.lock_exclusive(&txn, tuple(456)));
        txn.set_state(TransactionState::Committed);
        assert!(lm.unlock(&txn, tuple(123)));
        assert!(shared_set(&txn).is_empty());
        assert_eq!(exclusive_set(&txn), HashSet::from([tuple(456)]));
        assert!(lm.unlock(&txn, tuple(456)));
        assert!(exclusive_set(&txn).is_empty());

        assert!(!lm.unlock(&txn, tuple(123)));
        assert!(!lm.unlock(&txn, tuple(456)));
    }

    #[test]
    fn shared_waits_for_exclusive_release() {
        let lm = Arc::new(LockManager::new(false));
        let tm = TransactionManager::new(Arc::clone(&lm));
        let t1 = tm.begin_transaction().unwrap();
        let t2 = tm.begin_transaction().unwrap();

        assert!(lm.lock_exclusive(&t1, tuple(0)));
        let release_started = Arc::new(AtomicBool::new(false));

        thread::scope(|scope| {
            scope.spawn(|| {
                assert!(lm.lock_shared(&t2, tuple(0)));
                // the grant must come after the unlock
                assert!(release_started.load(Ordering::Acquire));
            });
            sleep_ms(100);
            release_started.store(true, Ordering::Release);
            t1.set_state(TransactionState::Committed);
            assert!(lm.unlock(&t1, tuple(0)));
        });
        assert_eq!(shared_set(&t2), HashSet::from([tuple(0)]));
    }

    // Convert conflict without deadlock:
    //    T1                  T2                  T3
    //                                         LOCK-S(0)
    // LOCK-S(0)
    //                     LOCK-S(0)
    //                     LOCK-CONVERT(0)
    // LOCK-CONVERT(0)                         COMMIT
    //                                         UNLOCK(0)
    // T2 registers as the converter first; T1's convert is rejected (one
    // converter per tuple), T1 aborts and releases its shared lock, and T2
    // completes once T3 unlocks.
    #[test]
    fn convert_conflict_resolves_without_deadlock() {
        let lm = Arc::new(LockManager::new(false));
        let tm = TransactionManager::new(Arc::clone(&lm));
        let t1 = tm.begin_transaction().unwrap();
        let t2 = tm.begin_transaction().unwrap();
        let t3 = tm.begin_transaction().unwrap();
        let start = Instant::now();

        thread::scope(|scope| {
            scope.spawn(|| {
                sleep_ms(100);
                assert!(lm.lock_shared(&t1, tuple(0)));
                sleep_ms(300);
                if let Err(TransactionError::Aborted(id)) =
                    TransactionError::check(lm.lock_convert(&t1, tuple(0)), t1.id())
                {
                    tm.abort_transaction(id).unwrap();
                }
            });
            scope.spawn(|| {
                sleep_ms(200);
                assert!(lm.lock_shared(&t2, tuple(0)));
                if let Err(TransactionError::Aborted(id)) =
                    TransactionError::check(lm.lock_convert(&t2, tuple(0)), t2.id())
                {
                    tm.abort_transaction(id).unwrap();
                }
            });
            scope.spawn(|| {
                assert!(lm.lock_shared(&t3, tuple(0)));
                sleep_ms(600);
                t3.set_state(TransactionState::Committed);
                assert!(lm.unlock(&t3, tuple(0)));
            });
        });

        assert!(start.elapsed() < Duration::from_secs(1));
        // T2 won the conversion and holds only the exclusive lock
        assert_eq!(t1.state(), TransactionState::Aborted);
        assert!(shared_set(&t1).is_empty() && exclusive_set(&t1).is_empty());
        assert_eq!(exclusive_set(&t2), HashSet::from([tuple(0)]));
        assert!(shared_set(&t2).is_empty());
    }

    // Two transfers and a sum, interleaved through converts.
    #[test]
    fn concurrent_transfer_and_sum() {
        let lm = Arc::new(LockManager::new(false));
        let tm = TransactionManager::new(Arc::clone(&lm));
        let t1 = tm.begin_transaction().unwrap();
        let t2 = tm.begin_transaction().unwrap();
        let values = Mutex::new(vec![100i64, 200]);
        let result = Mutex::new(0i64);

        thread::scope(|scope| {
            scope.spawn(|| {
                assert!(lm.lock_shared(&t1, tuple(0)));
                let x = values.lock()[0] - 50;
                assert!(lm.lock_convert(&t1, tuple(0)));
                values.lock()[0] = x;
                assert!(lm.lock_shared(&t1, tuple(1)));
                let y = values.lock()[1] + 50;
                assert!(lm.lock_convert(&t1, tuple(1)));
                values.lock()[1] = y;
                t1.set_state(TransactionState::Committed);
                assert!(lm.unlock(&t1, tuple(0)));
                assert!(lm.unlock(&t1, tuple(1)));
            });
            scope.spawn(|| {
                assert!(lm.lock_shared(&t2, tuple(0)));
                let x = values.lock()[0];
                assert!(lm.lock_shared(&t2, tuple(1)));
                let y = values.lock()[1];
                *result.lock() = x + y;
                t2.set_state(TransactionState::Committed);
                assert!(lm.unlock(&t2, tuple(0)));
                assert!(lm.unlock(&t2, tuple(1)));
            });
        });

        assert!(shared_set(&t1).is_empty() && exclusive_set(&t1).is_empty());
        assert!(shared_set(&t2).is_empty() && exclusive_set(&t2).is_empty());
        assert_eq!(*result.lock(), 300);
    }

    #[test]
    fn concurrent_exclusive_writers_and_reader() {
        let lm = Arc::new(LockManager::new(false));
        let tm = TransactionManager::new(Arc::clone(&lm));
        let t1 = tm.begin_transaction().unwrap();
        let t2 = tm.begin_transaction().unwrap();
        let t3 = tm.begin_transaction().unwrap();
        let values = Mutex::new(vec![10i64, 0, 0]);
        let result = Mutex::new(0i64);

        thread::scope(|scope| {
            scope.spawn(|| {
                assert!(lm.lock_exclusive(&t1, tuple(0)));
                values.lock()[0] -= 3;
                assert!(lm.lock_exclusive(&t1, tuple(1)));
                values.lock()[1] += 3;
                t1.set_state(TransactionState::Committed);
                assert!(lm.unlock(&t1, tuple(1)));
                assert!(lm.unlock(&t1, tuple(0)));
            });
            scope.spawn(|| {
                assert!(lm.lock_exclusive(&t2, tuple(0)));
                values.lock()[0] -= 1;
                assert!(lm.lock_exclusive(&t2, tuple(2)));
                values.lock()[2] += 1;
                t2.set_state(TransactionState::Committed);
                assert!(lm.unlock(&t2, tuple(2)));
                assert!(lm.unlock(&t2, tuple(0)));
            });
            scope.spawn(|| {
                assert!(lm.lock_shared(&t3, tuple(0)));
                assert!(lm.lock_shared(&t3, tuple(1)));
                assert!(lm.lock_shared(&t3, tuple(2)));
                let v = values.lock();
                *result.lock() = v[0] + v[1] + v[2];
                drop(v);
                t3.set_state(TransactionState::Committed);
                assert!(lm.unlock(&t3, tuple(2)));
                assert!(lm.unlock(&t3, tuple(1)));
                assert!(lm.unlock(&t3, tuple(0)));
            });
        });

        for txn in [&t1, &t2, &t3] {
            assert!(shared_set(txn).is_empty() && exclusive_set(txn).is_empty());
        }
        // both writers only move value around, so every serializable
        // schedule sums to the initial total
        assert_eq!(*result.lock(), 10);
    }

    #[test]
    fn wait_graph_edges_point_at_conflicting_holders() {
        let lm = LockManager::new(false);
        {
            let mut table = lm.inner.table.lock();
            let list0 = table.entry(tuple(0)).or_insert_with(LockList::new);
            list0.exclusive_lock = 1;
            let list1 = table.entry(tuple(1)).or_insert_with(LockList::new);
            list1.exclusive_lock = 1;
            list1.wait_list.push_back((2, LockMode::Shared));
            let list2 = table.entry(tuple(2)).or_insert_with(LockList::new);
            list2.shared_locks.extend([1, 2, 3]);
            list2.wait_list.push_back((1, LockMode::Exclusive));
            list2.wait_list.push_back((4, LockMode::Exclusive));
            let list3 = table.entry(tuple(3)).or_insert_with(LockList::new);
            list3.shared_locks.insert(1);
        }

        let graph = lm.build_wait_graph();
        assert_eq!(graph.vertex_count(), 4);
        assert_eq!(graph.outgoing_neighbors(1), Some(&HashSet::from([2, 3])));
        assert_eq!(graph.outgoing_neighbors(2), Some(&HashSet::from([1])));
        assert_eq!(graph.outgoing_neighbors(3), Some(&HashSet::new()));
        assert_eq!(graph.outgoing_neighbors(4), Some(&HashSet::from([1, 2, 3])));
    }

    #[test]
    fn acyclic_graph_has_no_victim() {
        let mut graph = Graph::new();
        for v in 1..=6 {
            graph.add_vertex(v);
        }
        graph
            .add_edge(1, 2)
            .add_edge(3, 2)
            .add_edge(3, 6)
            .add_edge(4, 3)
            .add_edge(4, 5)
            .add_edge(4, 6)
            .add_edge(5, 1)
            .add_edge(6, 1)
            .add_edge(6, 5);
        assert_eq!(LockManager::cycle_victim(&graph), INVALID_TXN_ID);
    }

    #[test]
    fn victim_is_the_youngest_on_the_cycle() {
        let mut graph = Graph::new();
        for v in 1..=7 {
            graph.add_vertex(v);
        }
        graph
            .add_edge(1, 3)
            .add_edge(1, 4)
            .add_edge(2, 1)
            .add_edge(2, 3)
            .add_edge(2, 4)
            .add_edge(3, 5)
            .add_edge(4, 6)
            .add_edge(5, 4)
            .add_edge(6, 3)
            .add_edge(7, 6);
        // the only cycle is 3 -> 5 -> 4 -> 6 -> 3; vertex 7 feeds into it
        // but is not part of it
        assert_eq!(LockManager::cycle_victim(&graph), 6);
    }

    // Deadlock:
    //    T1                  T2
    // LOCK-S(0)
    //                     LOCK-S(1)
    //                     LOCK-X(0)
    // LOCK-X(1)
    // The detector must abort the younger transaction within two detection
    // intervals; the older one commits.
    #[test]
    fn two_transaction_deadlock_is_broken() {
        let lm = Arc::new(LockManager::new(true));
        let tm = TransactionManager::new(Arc::clone(&lm));
        let t1 = tm.begin_transaction().unwrap();
        let t2 = tm.begin_transaction().unwrap();
        let start = Instant::now();

        thread::scope(|scope| {
            scope.spawn(|| {
                assert!(lm.lock_shared(&t1, tuple(0)));
                sleep_ms(200);
                if lm.lock_exclusive(&t1, tuple(1)) {
                    t1.set_state(TransactionState::Committed);
                    lm.unlock(&t1, tuple(0));
                    lm.unlock(&t1, tuple(1));
                } else {
                    tm.abort_transaction(t1.id()).unwrap();
                }
            });
            scope.spawn(|| {
                sleep_ms(100);
                assert!(lm.lock_shared(&t2, tuple(1)));
                if lm.lock_exclusive(&t2, tuple(0)) {
                    t2.set_state(TransactionState::Committed);
                    lm.unlock(&t2, tuple(0));
                    lm.unlock(&t2, tuple(1));
                } else {
                    tm.abort_transaction(t2.id()).unwrap();
                }
            });
        });

        assert!(start.elapsed() < Duration::from_secs(1));
        // the victim is the younger transaction
        assert_eq!(t1.state(), TransactionState::Committed);
        assert_eq!(t2.state(), TransactionState::Aborted);
        for txn in [&t1, &t2] {
            assert!(shared_set(txn).is_empty() && exclusive_set(txn).is_empty());
        }
    }

    // Three-transaction cycle:
    //    T1                  T2                  T3
    // LOCK-S(0)
    //                     LOCK-X(1)
    //                                         LOCK-S(2)
    // LOCK-S(1)
    //                     LOCK-X(2)
    //                                         LOCK-X(0)
    // The wait-for cycle is 1 -> 2 -> 3 -> 1, so the detector aborts T3 and
    // the other two commit.
    #[test]
    fn three_transaction_deadlock_is_broken() {
        let lm = Arc::new(LockManager::new(true));
        let tm = TransactionManager::new(Arc::clone(&lm));
        let t1 = tm.begin_transaction().unwrap();
        let t2 = tm.begin_transaction().unwrap();
        let t3 = tm.begin_transaction().unwrap();
        let start = Instant::now();

        thread::scope(|scope| {
            scope.spawn(|| {
                assert!(lm.lock_shared(&t1, tuple(0)));
                sleep_ms(400);
                if lm.lock_shared(&t1, tuple(1)) {
                    t1.set_state(TransactionState::Committed);
                    lm.unlock(&t1, tuple(0));
                    lm.unlock(&t1, tuple(1));
                } else {
                    tm.abort_transaction(t1.id()).unwrap();
                }
            });
            scope.spawn(|| {
                sleep_ms(100);
                assert!(lm.lock_exclusive(&t2, tuple(1)));
                sleep_ms(400);
                if lm.lock_exclusive(&t2, tuple(2)) {
                    t2.set_state(TransactionState::Committed);
                    lm.unlock(&t2, tuple(1));
                    lm.unlock(&t2, tuple(2));
                } else {
                    tm.abort_transaction(t2.id()).unwrap();
                }
            });
            scope.spawn(|| {
                sleep_ms(200);
                assert!(lm.lock_shared(&t3, tuple(2)));
                sleep_ms(400);
                if lm.lock_exclusive(&t3, tuple(0)) {
                    t3.set_state(TransactionState::Committed);
                    lm.unlock(&t3, tuple(2));
                    lm.unlock(&t3, tuple(0));
                } else {
                    tm.abort_transaction(t3.id()).unwrap();
                }
            });
        });

        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(t3.state(), TransactionState::Aborted);
        assert_eq!(t1.state(), TransactionState::Committed);
        assert_eq!(t2.state(), TransactionState::Committed);
        for txn in [&t1, &t2, &t3] {
            assert!(shared_set(txn).is_empty() && exclusive_set(txn).is_empty());
        }
    }
}
