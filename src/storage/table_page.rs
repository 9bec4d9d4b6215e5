// Slotted-page layout over a pinned page.
//
// Page layout:
//
// ```text
// | Header (40) | Slot 0 (8) | Slot 1 (8) | ... | free space | Tuple N | ... | Tuple 0 |
//               |<------- slot array ------->|               ^ free space pointer
// ```
//
// Header fields (host-native byte order):
//
// ```text
// | lsn (8) | prev_page_id (8) | next_page_id (8) | free_space_pointer (4) |
// | slot_count (4) | tuple_count (4) | padding (4) |
// ```
//
// A slot is an `(offset, size)` pair of `u32`; a slot with offset 0 is a
// tombstone. Tuple bodies grow backward from the page end toward the slot
// array. `slot_count` is the high-water mark of ever-assigned slots and
// never shrinks; `tuple_count` counts live slots.

use crate::buffer::PageGuard;
use crate::common::{Lsn, PageId, SlotId, INVALID_LSN, INVALID_PAGE_ID, INVALID_SLOT_ID, PAGE_SIZE};
use crate::storage::tuple::Tuple;

const OFFSET_LSN: usize = 0;
const OFFSET_PREV_PAGE_ID: usize = 8;
const OFFSET_NEXT_PAGE_ID: usize = 16;
const OFFSET_FREE_SPACE_POINTER: usize = 24;
const OFFSET_SLOT_COUNT: usize = 28;
const OFFSET_TUPLE_COUNT: usize = 32;
const HEADER_SIZE: usize = 40;
const SLOT_SIZE: usize = 8;

/// Largest tuple that fits an empty page alongside its slot entry.
pub const MAX_TUPLE_SIZE: usize = PAGE_SIZE - HEADER_SIZE - SLOT_SIZE;

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn write_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

fn read_i64(data: &[u8], offset: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    i64::from_ne_bytes(bytes)
}

fn write_i64(data: &mut [u8], offset: usize, value: i64) {
    data[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
}

/// A table page: slotted-page semantics over a page guard.
pub struct TablePage {
    page: PageGuard,
}

impl TablePage {
    pub fn new(page: PageGuard) -> TablePage {
        TablePage { page }
    }

    /// Formats the page as an empty member of a heap chain.
    pub fn init(&mut self, prev_page_id: PageId) {
        self.page.clear();
        self.set_lsn(INVALID_LSN);
        self.set_prev_page_id(prev_page_id);
        self.set_next_page_id(INVALID_PAGE_ID);
        self.set_free_space_pointer(PAGE_SIZE as u32);
        self.set_slot_count(0);
        self.set_tuple_count(0);
    }

    pub fn page_id(&self) -> PageId {
        self.page.page_id()
    }

    pub fn lsn(&self) -> Lsn {
        read_i64(self.page.data(), OFFSET_LSN)
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        write_i64(self.page.data_mut(), OFFSET_LSN, lsn);
    }

    pub fn prev_page_id(&self) -> PageId {
        read_i64(self.page.data(), OFFSET_PREV_PAGE_ID)
    }

    pub fn set_prev_page_id(&mut self, prev_page_id: PageId) {
        write_i64(self.page.data_mut(), OFFSET_PREV_PAGE_ID, prev_page_id);
    }

    pub fn next_page_id(&self) -> PageId {
        read_i64(self.page.data(), OFFSET_NEXT_PAGE_ID)
    }

    pub fn set_next_page_id(&mut self, next_page_id: PageId) {
        write_i64(self.page.data_mut(), OFFSET_NEXT_PAGE_ID, next_page_id);
    }

    pub fn tuple_count(&self) -> u32 {
        read_u32(self.page.data(), OFFSET_TUPLE_COUNT)
    }

    /// Inserts a tuple, reusing the first tombstone slot if any. Returns
    /// `INVALID_SLOT_ID` when the tuple plus a slot entry does not fit.
    pub fn insert_tuple(&mut self, tuple: &Tuple) -> SlotId {
        if (self.free_space() as usize) < tuple.size() + SLOT_SIZE {
            return INVALID_SLOT_ID;
        }

        let slot = (0..self.slot_count())
            .find(|&s| self.tuple_deleted(s))
            .unwrap_or_else(|| self.slot_count());

        let fsp = self.free_space_pointer() - tuple.size() as u32;
        self.set_free_space_pointer(fsp);
        self.page.data_mut()[fsp as usize..fsp as usize + tuple.size()]
            .copy_from_slice(tuple.data());

        self.set_tuple_offset(slot, fsp);
        self.set_tuple_size(slot, tuple.size() as u32);
        if slot == self.slot_count() {
            self.set_slot_count(slot + 1);
        }
        self.set_tuple_count(self.tuple_count() + 1);
        slot as SlotId
    }

    /// Deletes a tuple and compacts the packed tuple region: every byte
    /// below the deleted body shifts up by its size, and live slots whose
    /// offsets were below it are adjusted.
    pub fn delete_tuple(&mut self, slot_id: SlotId) -> bool {
        let Some(slot) = self.live_slot(slot_id) else {
            return false;
        };
        let tuple_offset = self.tuple_offset(slot) as usize;
        let tuple_size = self.tuple_size(slot) as usize;
        let fsp = self.free_space_pointer() as usize;

        self.page
            .data_mut()
            .copy_within(fsp..tuple_offset, fsp + tuple_size);

        self.set_free_space_pointer((fsp + tuple_size) as u32);
        self.set_tuple_offset(slot, 0);
        self.set_tuple_size(slot, 0);
        self.set_tuple_count(self.tuple_count() - 1);

        for s in 0..self.slot_count() {
            if !self.tuple_deleted(s) {
                let offset = self.tuple_offset(s);
                if (offset as usize) < tuple_offset {
                    self.set_tuple_offset(s, offset + tuple_size as u32);
                }
            }
        }
        true
    }

    /// Copies a live tuple out of the page.
    pub fn get_tuple(&self, slot_id: SlotId) -> Option<Tuple> {
        let slot = self.live_slot(slot_id)?;
        let offset = self.tuple_offset(slot) as usize;
        let size = self.tuple_size(slot) as usize;
        Some(Tuple::from_slice(&self.page.data()[offset..offset + size]))
    }

    /// Overwrites a live tuple in place. Only same-size updates are
    /// supported.
    pub fn update_tuple(&mut self, slot_id: SlotId, tuple: &Tuple) -> bool {
        let Some(slot) = self.live_slot(slot_id) else {
            return false;
        };
        let offset = self.tuple_offset(slot) as usize;
        let size = self.tuple_size(slot) as usize;
        if tuple.size() != size {
            return false;
        }
        self.page.data_mut()[offset..offset + size].copy_from_slice(tuple.data());
        true
    }

    /// First live slot, or `INVALID_SLOT_ID` for an empty page.
    pub fn first_slot(&self) -> SlotId {
        (0..self.slot_count())
            .find(|&s| !self.tuple_deleted(s))
            .map_or(INVALID_SLOT_ID, |s| s as SlotId)
    }

    /// Next live slot after `slot_id`, skipping tombstones.
    pub fn next_slot(&self, slot_id: SlotId) -> SlotId {
        let start = (slot_id + 1).max(0) as u32;
        (start..self.slot_count())
            .find(|&s| !self.tuple_deleted(s))
            .map_or(INVALID_SLOT_ID, |s| s as SlotId)
    }

    /// Previous live slot before `slot_id`, skipping tombstones.
    pub fn prev_slot(&self, slot_id: SlotId) -> SlotId {
        let end = (slot_id.max(0) as u32).min(self.slot_count());
        (0..end)
            .rev()
            .find(|&s| !self.tuple_deleted(s))
            .map_or(INVALID_SLOT_ID, |s| s as SlotId)
    }

    /// Last live slot, or `INVALID_SLOT_ID` for an empty page.
    pub fn last_slot(&self) -> SlotId {
        (0..self.slot_count())
            .rev()
            .find(|&s| !self.tuple_deleted(s))
            .map_or(INVALID_SLOT_ID, |s| s as SlotId)
    }

    fn live_slot(&self, slot_id: SlotId) -> Option<u32> {
        if slot_id < 0 || slot_id as u32 >= self.slot_count() {
            return None;
        }
        let slot = slot_id as u32;
        (!self.tuple_deleted(slot)).then_some(slot)
    }

    /// A slot with offset 0 is a tombstone.
    fn tuple_deleted(&self, slot: u32) -> bool {
        self.tuple_offset(slot) == 0
    }

    fn free_space(&self) -> u32 {
        self.free_space_pointer() - HEADER_SIZE as u32 - SLOT_SIZE as u32 * self.slot_count()
    }

    fn free_space_pointer(&self) -> u32 {
        read_u32(self.page.data(), OFFSET_FREE_SPACE_POINTER)
    }

    fn set_free_space_pointer(&mut self, fsp: u32) {
        write_u32(self.page.data_mut(), OFFSET_FREE_SPACE_POINTER, fsp);
    }

    fn slot_count(&self) -> u32 {
        read_u32(self.page.data(), OFFSET_SLOT_COUNT)
    }

    fn set_slot_count(&mut self, slot_count: u32) {
        write_u32(self.page.data_mut(), OFFSET_SLOT_COUNT, slot_count);
    }

    fn set_tuple_count(&mut self, tuple_count: u32) {
        write_u32(self.page.data_mut(), OFFSET_TUPLE_COUNT, tuple_count);
    }

    fn slot_offset(slot: u32) -> usize {
        HEADER_SIZE + SLOT_SIZE * slot as usize
    }

    fn tuple_offset(&self, slot: u32) -> u32 {
        read_u32(self.page.data(), Self::slot_offset(slot))
    }

    fn set_tuple_offset(&mut self, slot: u32, offset: u32) {
        write_u32(self.page.data_mut(), Self::slot_offset(slot), offset);
    }

    fn tuple_size(&self, slot: u32) -> u32 {
        read_u32(self.page.data(), Self::slot_offset(slot) + 4)
    }

    fn set_tuple_size(&mut self, slot: u32, size: u32) {
        write_u32(self.page.data_mut(), Self::slot_offset(slot) + 4, size);
    }
}
