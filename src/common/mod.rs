// Identifier types, sentinels, and crate-wide constants.

pub mod graph;

/// Index of a data page within a database file.
pub type PageId = i64;
/// Slot of the buffer pool holding one page.
pub type FrameId = i64;
/// Slot within a slotted page.
pub type SlotId = i32;
/// Transaction identifier, densely and monotonically allocated.
pub type TxnId = i64;
/// Log sequence number: byte offset of a record in the log stream.
pub type Lsn = i64;

pub const INVALID_PAGE_ID: PageId = -1;
pub const INVALID_FRAME_ID: FrameId = -1;
pub const INVALID_SLOT_ID: SlotId = -1;
pub const INVALID_TXN_ID: TxnId = -1;
pub const INVALID_LSN: Lsn = -1;
pub const INVALID_TUPLE_ID: i64 = -1;

/// Size of every on-disk structure.
pub const PAGE_SIZE: usize = 4096;
/// Number of 16-bit allocation counters on the master page.
pub const MAX_HEADER_PAGES: usize = 2048;
/// Number of data pages governed by one header-page bitmap.
pub const DATA_PAGES_PER_HEADER: usize = 32768;
/// Page id reserved for the root catalog by upper layers.
pub const ROOT_CATALOG_PAGE_ID: PageId = 0;

const PAGE_SHIFT: i64 = 16;
const SLOT_ID_MASK: i64 = (1 << PAGE_SHIFT) - 1;

/// Packed `(page_id << 16) | slot_id` reference to a tuple in a heap.
///
/// The 16-bit shift makes the packing lossless: a slotted page can never
/// hold more than `PAGE_SIZE / 8` slots, far below `2^16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TupleId(i64);

impl TupleId {
    pub fn new(page_id: PageId, slot_id: SlotId) -> TupleId {
        TupleId((page_id << PAGE_SHIFT) | slot_id as i64)
    }

    pub fn from_raw(raw: i64) -> TupleId {
        TupleId(raw)
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn page_id(self) -> PageId {
        ((self.0 as u64) >> PAGE_SHIFT) as PageId
    }

    pub fn slot_id(self) -> SlotId {
        (self.0 & SLOT_ID_MASK) as SlotId
    }

    pub fn page_id_and_slot_id(self) -> (PageId, SlotId) {
        (self.page_id(), self.slot_id())
    }

    pub fn is_valid(self) -> bool {
        self.0 != INVALID_TUPLE_ID
    }
}
