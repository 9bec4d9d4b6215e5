// Persistent storage: disk allocation, slotted pages, and heap files.

pub mod disk;
pub mod table_heap;
pub mod table_page;
pub mod tuple;

pub use disk::DiskManager;
pub use table_heap::{TableBackIter, TableHeap, TableIter};
pub use table_page::{TablePage, MAX_TUPLE_SIZE};
pub use tuple::Tuple;
