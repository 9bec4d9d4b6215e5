// Table heap: a doubly-linked chain of slotted pages.
//
// A heap is identified by its root page id, fixed at creation. The root is
// never deleted, even when empty; every other page on the chain holds at
// least one live tuple, because pages emptied by deletion are spliced out
// and deallocated.

use crate::buffer::BufferPoolManager;
use crate::common::{PageId, TupleId, INVALID_PAGE_ID, INVALID_SLOT_ID};
use crate::error::{DbError, Result};
use crate::storage::table_page::{TablePage, MAX_TUPLE_SIZE};
use crate::storage::tuple::Tuple;

pub struct TableHeap {
    buffer: BufferPoolManager,
    root_page_id: PageId,
}

impl TableHeap {
    /// Creates a heap by allocating and formatting a root page.
    pub fn new(buffer: BufferPoolManager) -> Result<TableHeap> {
        let guard = buffer.new_page()?.ok_or(DbError::BufferPoolExhausted)?;
        let root_page_id = guard.page_id();
        TablePage::new(guard).init(INVALID_PAGE_ID);
        Ok(TableHeap { buffer, root_page_id })
    }

    /// Reopens an existing heap by its root page id.
    pub fn open(buffer: BufferPoolManager, root_page_id: PageId) -> TableHeap {
        TableHeap { buffer, root_page_id }
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id
    }

    /// Inserts a tuple into the first page of the chain that accepts it,
    /// growing the chain at the tail when every page is full.
    pub fn insert_tuple(&self, tuple: &Tuple) -> Result<TupleId> {
        if tuple.size() > MAX_TUPLE_SIZE {
            return Err(DbError::Storage(format!(
                "tuple of {} bytes cannot fit a page",
                tuple.size()
            )));
        }
        let mut current = self.fetch_table_page(self.root_page_id)?;
        loop {
            let slot_id = current.insert_tuple(tuple);
            if slot_id != INVALID_SLOT_ID {
                return Ok(TupleId::new(current.page_id(), slot_id));
            }
            let next_page_id = current.next_page_id();
            if next_page_id != INVALID_PAGE_ID {
                current = self.fetch_table_page(next_page_id)?;
            } else {
                let guard = self.buffer.new_page()?.ok_or(DbError::BufferPoolExhausted)?;
                let mut new_page = TablePage::new(guard);
                current.set_next_page_id(new_page.page_id());
                new_page.init(current.page_id());
                current = new_page;
            }
        }
    }

    /// Deletes a tuple. A page emptied by the deletion is deallocated and
    /// spliced out of the chain, unless it is the root.
    pub fn delete_tuple(&self, tuple_id: TupleId) -> Result<bool> {
        if !tuple_id.is_valid() {
            return Ok(false);
        }
        let (page_id, slot_id) = tuple_id.page_id_and_slot_id();
        let tuple_count;
        let prev_page_id;
        let next_page_id;
        {
            let Some(guard) = self.buffer.fetch_page(page_id)? else {
                return Ok(false);
            };
            let mut page = TablePage::new(guard);
            if !page.delete_tuple(slot_id) {
                return Ok(false);
            }
            tuple_count = page.tuple_count();
            prev_page_id = page.prev_page_id();
            next_page_id = page.next_page_id();
        }
        if tuple_count == 0 && page_id != self.root_page_id {
            // deallocate before touching the chain: a concurrent fetch may
            // have re-pinned the page, in which case the delete is refused
            // and the chain must stay intact
            if !self.buffer.delete_page(page_id)? {
                return Ok(false);
            }
            {
                let mut prev = self.fetch_table_page(prev_page_id)?;
                prev.set_next_page_id(next_page_id);
            }
            if next_page_id != INVALID_PAGE_ID {
                let mut next = self.fetch_table_page(next_page_id)?;
                next.set_prev_page_id(prev_page_id);
            }
        }
        Ok(true)
    }

    pub fn get_tuple(&self, tuple_id: TupleId) -> Result<Option<Tuple>> {
        if !tuple_id.is_valid() {
            return Ok(None);
        }
        let (page_id, slot_id) = tuple_id.page_id_and_slot_id();
        let Some(guard) = self.buffer.fetch_page(page_id)? else {
            return Ok(None);
        };
        Ok(TablePage::new(guard).get_tuple(slot_id))
    }

    /// Overwrites a tuple in place; the new payload must have the stored
    /// tuple's exact size.
    pub fn update_tuple(&self, tuple_id: TupleId, tuple: &Tuple) -> Result<bool> {
        if !tuple_id.is_valid() {
            return Ok(false);
        }
        let (page_id, slot_id) = tuple_id.page_id_and_slot_id();
        let Some(guard) = self.buffer.fetch_page(page_id)? else {
            return Ok(false);
        };
        Ok(TablePage::new(guard).update_tuple(slot_id, tuple))
    }

    /// Forward iterator from the first live tuple of the chain.
    pub fn iter(&self) -> TableIter<'_> {
        TableIter {
            heap: self,
            cursor: Cursor::Start,
        }
    }

    /// Backward iterator from the last live tuple of the chain.
    pub fn iter_back(&self) -> TableBackIter<'_> {
        TableBackIter {
            heap: self,
            cursor: Cursor::Start,
        }
    }

    fn fetch_table_page(&self, page_id: PageId) -> Result<TablePage> {
        let guard = self
            .buffer
            .fetch_page(page_id)?
            .ok_or(DbError::BufferPoolExhausted)?;
        Ok(TablePage::new(guard))
    }

    fn first_tuple_id(&self) -> Result<Option<TupleId>> {
        let root = self.fetch_table_page(self.root_page_id)?;
        let slot_id = root.first_slot();
        if slot_id != INVALID_SLOT_ID {
            return Ok(Some(TupleId::new(self.root_page_id, slot_id)));
        }
        let next_page_id = root.next_page_id();
        drop(root);
        if next_page_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        // only the root may be empty
        let next = self.fetch_table_page(next_page_id)?;
        Ok(Some(TupleId::new(next_page_id, next.first_slot())))
    }

    fn next_tuple_id(&self, tuple_id: TupleId) -> Result<Option<TupleId>> {
        let (page_id, slot_id) = tuple_id.page_id_and_slot_id();
        let page = self.fetch_table_page(page_id)?;
        let next_slot = page.next_slot(slot_id);
        if next_slot != INVALID_SLOT_ID {
            return Ok(Some(TupleId::new(page_id, next_slot)));
        }
        let next_page_id = page.next_page_id();
        drop(page);
        if next_page_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let next = self.fetch_table_page(next_page_id)?;
        Ok(Some(TupleId::new(next_page_id, next.first_slot())))
    }

    fn last_tuple_id(&self) -> Result<Option<TupleId>> {
        let mut page = self.fetch_table_page(self.root_page_id)?;
        loop {
            let next_page_id = page.next_page_id();
            if next_page_id == INVALID_PAGE_ID {
                break;
            }
            page = self.fetch_table_page(next_page_id)?;
        }
        let slot_id = page.last_slot();
        if slot_id == INVALID_SLOT_ID {
            // the tail can only be empty when it is the root
            return Ok(None);
        }
        Ok(Some(TupleId::new(page.page_id(), slot_id)))
    }

    fn prev_tuple_id(&self, tuple_id: TupleId) -> Result<Option<TupleId>> {
        let (page_id, slot_id) = tuple_id.page_id_and_slot_id();
        let page = self.fetch_table_page(page_id)?;
        let prev_slot = page.prev_slot(slot_id);
        if prev_slot != INVALID_SLOT_ID {
            return Ok(Some(TupleId::new(page_id, prev_slot)));
        }
        let prev_page_id = page.prev_page_id();
        drop(page);
        if prev_page_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let prev = self.fetch_table_page(prev_page_id)?;
        let prev_slot = prev.last_slot();
        if prev_slot == INVALID_SLOT_ID {
            // an empty predecessor is the empty root
            return Ok(None);
        }
        Ok(Some(TupleId::new(prev_page_id, prev_slot)))
    }
}

enum Cursor {
    Start,
    At(TupleId),
    End,
}

/// Forward tuple iterator. Yields `(tuple_id, tuple)` pairs, re-fetching
/// pages as it advances; an I/O failure ends the iteration after yielding
/// the error once.
pub struct TableIter<'a> {
    heap: &'a TableHeap,
    cursor: Cursor,
}

impl Iterator for TableIter<'_> {
    type Item = Result<(TupleId, Tuple)>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = match self.cursor {
            Cursor::End => return None,
            Cursor::Start => self.heap.first_tuple_id(),
            Cursor::At(tuple_id) => Ok(Some(tuple_id)),
        };
        step(&mut self.cursor, self.heap, first, TableHeap::next_tuple_id)
    }
}

/// Backward tuple iterator, symmetric to [`TableIter`].
pub struct TableBackIter<'a> {
    heap: &'a TableHeap,
    cursor: Cursor,
}

impl Iterator for TableBackIter<'_> {
    type Item = Result<(TupleId, Tuple)>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = match self.cursor {
            Cursor::End => return None,
            Cursor::Start => self.heap.last_tuple_id(),
            Cursor::At(tuple_id) => Ok(Some(tuple_id)),
        };
        step(&mut self.cursor, self.heap, first, TableHeap::prev_tuple_id)
    }
}

fn step(
    cursor: &mut Cursor,
    heap: &TableHeap,
    current: Result<Option<TupleId>>,
    advance: fn(&TableHeap, TupleId) -> Result<Option<TupleId>>,
) -> Option<Result<(TupleId, Tuple)>> {
    let tuple_id = match current {
        Ok(Some(tuple_id)) => tuple_id,
        Ok(None) => {
            *cursor = Cursor::End;
            return None;
        }
        Err(err) => {
            *cursor = Cursor::End;
            return Some(Err(err));
        }
    };
    let tuple = match heap.get_tuple(tuple_id) {
        Ok(Some(tuple)) => tuple,
        Ok(None) => {
            *cursor = Cursor::End;
            return Some(Err(DbError::Internal(format!(
                "iterator reached a dangling tuple reference {:?}",
                tuple_id
            ))));
        }
        Err(err) => {
            *cursor = Cursor::End;
            return Some(Err(err));
        }
    };
    match advance(heap, tuple_id) {
        Ok(Some(next)) => *cursor = Cursor::At(next),
        Ok(None) => *cursor = Cursor::End,
        Err(err) => {
            *cursor = Cursor::End;
            return Some(Err(err));
        }
    }
    Some(Ok((tuple_id, tuple)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::INVALID_TUPLE_ID;
    use crate::storage::disk::DiskManager;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;
    use tempfile::TempDir;

    const TUPLE_COUNT: usize = 100;

    fn heap_env(pool_size: usize) -> (BufferPoolManager, TempDir) {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(DiskManager::open(dir.path().join("test.db")).unwrap());
        (BufferPoolManager::new(pool_size, disk), dir)
    }

    fn random_tuple(rng: &mut StdRng) -> Tuple {
        let p: f64 = rng.random();
        let size = if p < 0.1 {
            0
        } else if p < 0.2 {
            MAX_TUPLE_SIZE
        } else {
            rng.random_range(0..=MAX_TUPLE_SIZE)
        };
        Tuple::new((0..size).map(|_| rng.random()).collect())
    }

    fn crc_sum<'a>(tuples: impl Iterator<Item = &'a Tuple>) -> u32 {
        tuples.fold(0u32, |sum, t| sum.wrapping_add(crc32fast::hash(t.data())))
    }

    #[test]
    fn random_tuples_survive_churn_and_reopen() {
        let mut rng = StdRng::seed_from_u64(0xfe44);
        let mut tuples: Vec<Tuple> = (0..TUPLE_COUNT).map(|_| random_tuple(&mut rng)).collect();
        let mut tuple_ids = vec![TupleId::from_raw(INVALID_TUPLE_ID); TUPLE_COUNT];
        let expected_sum = crc_sum(tuples.iter());

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let root_page_id;
        {
            let disk = Arc::new(DiskManager::open(&path).unwrap());
            let pool = BufferPoolManager::new(16, Arc::clone(&disk));
            let table = TableHeap::new(pool.clone()).unwrap();
            root_page_id = table.root_page_id();

            // insert and read back by id
            for (i, tuple) in tuples.iter().enumerate() {
                tuple_ids[i] = table.insert_tuple(tuple).unwrap();
            }
            for (i, tuple) in tuples.iter().enumerate() {
                assert_eq!(table.get_tuple(tuple_ids[i]).unwrap().as_ref(), Some(tuple));
            }

            // iteration covers exactly the inserted payloads
            let scanned = crc_sum_of(&table);
            assert_eq!(scanned, expected_sum);

            // delete a random quarter
            let mut deleted = [false; TUPLE_COUNT];
            let mut deleted_count = 0;
            for _ in 0..TUPLE_COUNT / 4 {
                let victim = rng.random_range(0..TUPLE_COUNT);
                if deleted[victim] {
                    assert!(!table.delete_tuple(tuple_ids[victim]).unwrap());
                } else {
                    assert!(table.delete_tuple(tuple_ids[victim]).unwrap());
                    deleted[victim] = true;
                    deleted_count += 1;
                }
            }
            for (i, tuple) in tuples.iter().enumerate() {
                let got = table.get_tuple(tuple_ids[i]).unwrap();
                if deleted[i] {
                    assert_eq!(got, None);
                } else {
                    assert_eq!(got.as_ref(), Some(tuple));
                }
            }
            assert_eq!(
                table.iter().count(),
                TUPLE_COUNT - deleted_count,
                "iteration must see every live tuple exactly once"
            );

            // re-insert what was deleted; the content sum is restored
            for i in 0..TUPLE_COUNT {
                if deleted[i] {
                    tuple_ids[i] = table.insert_tuple(&tuples[i]).unwrap();
                }
            }
            assert_eq!(crc_sum_of(&table), expected_sum);

            // same-size updates
            for _ in 0..TUPLE_COUNT / 4 {
                let i = rng.random_range(0..TUPLE_COUNT);
                let size = tuples[i].size();
                tuples[i] = Tuple::new((0..size).map(|_| rng.random()).collect());
                assert!(table.update_tuple(tuple_ids[i], &tuples[i]).unwrap());
            }
            for (i, tuple) in tuples.iter().enumerate() {
                assert_eq!(table.get_tuple(tuple_ids[i]).unwrap().as_ref(), Some(tuple));
            }
            assert_eq!(crc_sum_of(&table), crc_sum(tuples.iter()));

            pool.flush_all_pages().unwrap();
        }

        // reopen from disk by root page id
        {
            let disk = Arc::new(DiskManager::open(&path).unwrap());
            let pool = BufferPoolManager::new(8, disk);
            let table = TableHeap::open(pool, root_page_id);
            for (i, tuple) in tuples.iter().enumerate() {
                assert_eq!(table.get_tuple(tuple_ids[i]).unwrap().as_ref(), Some(tuple));
            }
            assert_eq!(crc_sum_of(&table), crc_sum(tuples.iter()));
        }
    }

    fn crc_sum_of(table: &TableHeap) -> u32 {
        table.iter().fold(0u32, |sum, item| {
            let (_, tuple) = item.unwrap();
            sum.wrapping_add(crc32fast::hash(tuple.data()))
        })
    }

    #[test]
    fn backward_iteration_reverses_forward_order() {
        let (pool, _dir) = heap_env(8);
        let table = TableHeap::new(pool).unwrap();
        for i in 0u32..500 {
            table.insert_tuple(&Tuple::new(i.to_ne_bytes().to_vec())).unwrap();
        }

        let forward: Vec<TupleId> = table.iter().map(|item| item.unwrap().0).collect();
        let mut backward: Vec<TupleId> = table.iter_back().map(|item| item.unwrap().0).collect();
        assert_eq!(forward.len(), 500);
        backward.reverse();
        assert_eq!(forward, backward);
    }

    #[test]
    fn emptied_pages_are_spliced_out_and_freed() {
        let (pool, _dir) = heap_env(8);
        let table = TableHeap::new(pool.clone()).unwrap();

        // ~1000-byte tuples: four per page, so 20 tuples span several pages
        let tuple = Tuple::new(vec![0xEE; 1000]);
        let ids: Vec<TupleId> = (0..20).map(|_| table.insert_tuple(&tuple).unwrap()).collect();
        let middle_page = ids[6].page_id();
        assert_ne!(middle_page, table.root_page_id());

        for id in ids.iter().filter(|id| id.page_id() == middle_page) {
            assert!(table.delete_tuple(*id).unwrap());
        }
        assert!(!pool.page_allocated(middle_page));

        // the chain is still fully traversable in both directions
        let live = ids.iter().filter(|id| id.page_id() != middle_page).count();
        assert_eq!(table.iter().count(), live);
        assert_eq!(table.iter_back().count(), live);
    }

    #[test]
    fn empty_root_is_kept_and_skipped_by_iterators() {
        let (pool, _dir) = heap_env(8);
        let table = TableHeap::new(pool.clone()).unwrap();

        assert_eq!(table.iter().count(), 0);
        assert_eq!(table.iter_back().count(), 0);

        // fill past the root, then empty the root only
        let big = Tuple::new(vec![1; 3000]);
        let a = table.insert_tuple(&big).unwrap();
        let b = table.insert_tuple(&big).unwrap();
        assert_eq!(a.page_id(), table.root_page_id());
        assert_ne!(b.page_id(), table.root_page_id());

        assert!(table.delete_tuple(a).unwrap());
        assert!(pool.page_allocated(table.root_page_id()));
        let seen: Vec<TupleId> = table.iter().map(|item| item.unwrap().0).collect();
        assert_eq!(seen, vec![b]);
        let seen: Vec<TupleId> = table.iter_back().map(|item| item.unwrap().0).collect();
        assert_eq!(seen, vec![b]);
    }

    #[test]
    fn stale_and_invalid_references_are_rejected() {
        let (pool, _dir) = heap_env(4);
        let table = TableHeap::new(pool).unwrap();
        let id = table.insert_tuple(&Tuple::from_slice(b"x")).unwrap();

        assert!(!table.delete_tuple(TupleId::from_raw(INVALID_TUPLE_ID)).unwrap());
        assert_eq!(table.get_tuple(TupleId::from_raw(INVALID_TUPLE_ID)).unwrap(), None);
        assert_eq!(table.get_tuple(TupleId::new(id.page_id(), 55)).unwrap(), None);
        assert!(!table
            .update_tuple(TupleId::new(id.page_id(), 55), &Tuple::from_slice(b"y"))
            .unwrap());
    }
}
