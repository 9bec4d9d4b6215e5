// Buffer pool manager: a pinning cache of disk pages.
//
// Frames are preallocated at construction and never move. Lookups go
// through a page table; replacement frames come from the free list first
// and from the eviction policy second. A frame with a nonzero pin count is
// never reused, and a frame is evictable exactly while its pin count is
// zero. Dirty victims are written back before their frame is rebound.
//
// Every public operation serializes on one pool-wide mutex over the frame
// metadata, page table, free list, and eviction policy. Page *contents* are
// read through guards without the mutex; the pin protocol keeps the frame
// bound while any guard exists.

use std::cell::UnsafeCell;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::eviction::{EvictionPolicy, LruEvictionPolicy};
use crate::buffer::page_guard::PageGuard;
use crate::common::{FrameId, PageId, INVALID_FRAME_ID, INVALID_PAGE_ID, PAGE_SIZE};
use crate::error::Result;
use crate::storage::disk::DiskManager;

/// Page-sized frame buffer with a stable heap address.
struct FrameBuf(UnsafeCell<[u8; PAGE_SIZE]>);

// SAFETY: frame contents are only touched by the pool while it holds the
// pool mutex and the frame is unpinned, or through a guard while the frame
// is pinned; the unpin protocol separates the two regimes.
unsafe impl Sync for FrameBuf {}

/// Per-frame metadata, updated only under the pool mutex.
struct FrameMeta {
    page_id: PageId,
    pin_count: u32,
    dirty: bool,
}

impl FrameMeta {
    fn new() -> FrameMeta {
        FrameMeta {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            dirty: false,
        }
    }
}

struct PoolState {
    metas: Vec<FrameMeta>,
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    policy: Box<dyn EvictionPolicy>,
}

struct PoolInner {
    pool_size: usize,
    buffers: Vec<FrameBuf>,
    state: Mutex<PoolState>,
    disk: Arc<DiskManager>,
}

/// Shared handle to a buffer pool. Clones refer to the same pool; page
/// guards keep a clone alive until they are dropped.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<PoolInner>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, disk: Arc<DiskManager>) -> BufferPoolManager {
        let state = PoolState {
            metas: (0..pool_size).map(|_| FrameMeta::new()).collect(),
            page_table: HashMap::new(),
            free_list: (0..pool_size as FrameId).collect(),
            policy: Box::new(LruEvictionPolicy::new()),
        };
        BufferPoolManager {
            inner: Arc::new(PoolInner {
                pool_size,
                buffers: (0..pool_size)
                    .map(|_| FrameBuf(UnsafeCell::new([0; PAGE_SIZE])))
                    .collect(),
                state: Mutex::new(state),
                disk,
            }),
        }
    }

    /// Number of frames in the pool.
    pub fn size(&self) -> usize {
        self.inner.pool_size
    }

    /// Fetches an allocated page and pins it.
    ///
    /// Returns `Ok(None)` when the page is not allocated on disk or when
    /// every frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<Option<PageGuard>> {
        let mut state = self.inner.state.lock();
        if let Some(&frame_id) = state.page_table.get(&page_id) {
            if state.metas[frame_id as usize].pin_count == 0 {
                state.policy.pin(frame_id);
            }
            state.metas[frame_id as usize].pin_count += 1;
            return Ok(Some(self.guard_for(frame_id, page_id)));
        }
        if !self.inner.disk.page_allocated(page_id) {
            return Ok(None);
        }
        let Some(frame_id) = take_victim_frame(&mut state) else {
            return Ok(None);
        };
        self.evict_and_rebind(&mut state, frame_id, page_id)?;
        // SAFETY: the frame is unbound from any page table entry and
        // unpinned; no guard can reference it while the mutex is held.
        let buf = unsafe { &mut *self.inner.buffers[frame_id as usize].0.get() };
        self.inner.disk.read_page(page_id, buf)?;
        state.metas[frame_id as usize].pin_count = 1;
        Ok(Some(self.guard_for(frame_id, page_id)))
    }

    /// Allocates a page on disk, binds it to a frame zeroed in memory, and
    /// pins it.
    ///
    /// Returns `Ok(None)` when every frame is pinned; the freshly allocated
    /// disk page is freed again in that case.
    pub fn new_page(&self) -> Result<Option<PageGuard>> {
        let mut state = self.inner.state.lock();
        let page_id = self.inner.disk.alloc_page()?;
        let Some(frame_id) = take_victim_frame(&mut state) else {
            self.inner.disk.free_page(page_id)?;
            return Ok(None);
        };
        self.evict_and_rebind(&mut state, frame_id, page_id)?;
        // SAFETY: as in `fetch_page`, the frame is unreachable from guards.
        let buf = unsafe { &mut *self.inner.buffers[frame_id as usize].0.get() };
        buf.fill(0);
        state.metas[frame_id as usize].pin_count = 1;
        Ok(Some(self.guard_for(frame_id, page_id)))
    }

    /// Deallocates a page on disk and drops it from the cache.
    ///
    /// Returns `Ok(false)` when the page is cached with a nonzero pin
    /// count; the page is not freed in that case.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut state = self.inner.state.lock();
        if let Some(&frame_id) = state.page_table.get(&page_id) {
            if state.metas[frame_id as usize].pin_count != 0 {
                return Ok(false);
            }
            state.policy.pin(frame_id);
            state.page_table.remove(&page_id);
            let meta = &mut state.metas[frame_id as usize];
            meta.page_id = INVALID_PAGE_ID;
            meta.dirty = false;
            state.free_list.push_back(frame_id);
        }
        self.inner.disk.free_page(page_id)?;
        Ok(true)
    }

    /// Writes the cached bytes of a page to disk and clears its dirty flag.
    ///
    /// Returns `Ok(false)` when the page is not cached.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let mut state = self.inner.state.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(false);
        };
        // SAFETY: shared read of the frame bytes under the pool mutex;
        // writers hold a guard on a pinned frame and do not run concurrently
        // with a flush of the same page by contract of the upper layers.
        let buf = unsafe { &*self.inner.buffers[frame_id as usize].0.get() };
        self.inner.disk.write_page(page_id, buf)?;
        state.metas[frame_id as usize].dirty = false;
        Ok(true)
    }

    /// Flushes every cached page.
    pub fn flush_all_pages(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        let entries: Vec<(PageId, FrameId)> =
            state.page_table.iter().map(|(&p, &f)| (p, f)).collect();
        for (page_id, frame_id) in entries {
            // SAFETY: as in `flush_page`.
            let buf = unsafe { &*self.inner.buffers[frame_id as usize].0.get() };
            self.inner.disk.write_page(page_id, buf)?;
            state.metas[frame_id as usize].dirty = false;
        }
        Ok(())
    }

    /// Whether the page is allocated on disk.
    pub fn page_allocated(&self, page_id: PageId) -> bool {
        self.inner.disk.page_allocated(page_id)
    }

    /// Called by `PageGuard` on drop; there is exactly one unpin per
    /// successful fetch or allocation.
    pub(crate) fn unpin_page(&self, page_id: PageId, dirty: bool) {
        let mut state = self.inner.state.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return;
        };
        let meta = &mut state.metas[frame_id as usize];
        debug_assert!(meta.pin_count > 0);
        meta.pin_count -= 1;
        if dirty {
            meta.dirty = true;
        }
        let now_unpinned = meta.pin_count == 0;
        if now_unpinned {
            state.policy.unpin(frame_id);
        }
    }

    fn guard_for(&self, frame_id: FrameId, page_id: PageId) -> PageGuard {
        let data = self.inner.buffers[frame_id as usize].0.get() as *mut u8;
        PageGuard::new(self.clone(), data, page_id)
    }

    /// Writes back a dirty victim and rebinds the frame to `new_page_id`.
    fn evict_and_rebind(
        &self,
        state: &mut PoolState,
        frame_id: FrameId,
        new_page_id: PageId,
    ) -> Result<()> {
        let (old_page_id, dirty) = {
            let meta = &state.metas[frame_id as usize];
            (meta.page_id, meta.dirty)
        };
        if dirty {
            // SAFETY: the victim frame is unpinned and cannot be behind a guard.
            let buf = unsafe { &*self.inner.buffers[frame_id as usize].0.get() };
            self.inner.disk.write_page(old_page_id, buf)?;
        }
        if old_page_id != INVALID_PAGE_ID {
            state.page_table.remove(&old_page_id);
        }
        state.page_table.insert(new_page_id, frame_id);
        let meta = &mut state.metas[frame_id as usize];
        meta.page_id = new_page_id;
        meta.dirty = false;
        meta.pin_count = 0;
        Ok(())
    }

    #[cfg(test)]
    fn accounting(&self) -> (u32, usize, usize) {
        let state = self.inner.state.lock();
        let pinned: u32 = state.metas.iter().map(|m| m.pin_count).sum();
        (pinned, state.free_list.len(), state.policy.size())
    }
}

fn take_victim_frame(state: &mut PoolState) -> Option<FrameId> {
    if let Some(frame_id) = state.free_list.pop_front() {
        return Some(frame_id);
    }
    let frame_id = state.policy.victim();
    (frame_id != INVALID_FRAME_ID).then_some(frame_id)
}
