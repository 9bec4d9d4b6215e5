// Scoped borrow of a pinned buffer page.

use std::fmt;

use crate::buffer::manager::BufferPoolManager;
use crate::common::{PageId, PAGE_SIZE};

/// The sole sanctioned borrow of a pinned page.
///
/// Holding a guard keeps its frame pinned and its backing bytes at a stable
/// address. Dropping the guard performs exactly one unpin, propagating
/// whether the page was written through this guard. Reads through [`data`]
/// do not mark the page dirty; [`data_mut`] and [`clear`] do.
///
/// [`data`]: PageGuard::data
/// [`data_mut`]: PageGuard::data_mut
/// [`clear`]: PageGuard::clear
pub struct PageGuard {
    pool: BufferPoolManager,
    data: *mut u8,
    page_id: PageId,
    dirty: bool,
}

// SAFETY: the pointed-to frame allocation is stable while the frame stays
// pinned, and concurrent access through multiple guards is delegated to the
// layers that hand out tuples and locks.
unsafe impl Send for PageGuard {}

impl PageGuard {
    pub(crate) fn new(pool: BufferPoolManager, data: *mut u8, page_id: PageId) -> PageGuard {
        PageGuard {
            pool,
            data,
            page_id,
            dirty: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Read access to the page bytes.
    pub fn data(&self) -> &[u8] {
        // SAFETY: the frame is pinned for the guard's lifetime
        unsafe { std::slice::from_raw_parts(self.data, PAGE_SIZE) }
    }

    /// Write access to the page bytes. Marks the page dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        // SAFETY: the frame is pinned for the guard's lifetime
        unsafe { std::slice::from_raw_parts_mut(self.data, PAGE_SIZE) }
    }

    /// Zeroes the page. Marks the page dirty.
    pub fn clear(&mut self) {
        self.data_mut().fill(0);
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id, self.dirty);
    }
}

impl fmt::Debug for PageGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageGuard")
            .field("page_id", &self.page_id)
            .field("dirty", &self.dirty)
            .finish()
    }
}
