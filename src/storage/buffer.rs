pub mod lru;
pub mod replacer;

use crate::storage::disk::{DiskManager, PAGE_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageId, INVALID_PAGE_ID};
use log::debug;
use lru::LruReplacer;
use parking_lot::{lock_api, Mutex, RawRwLock, RwLock};
use replacer::{FrameId, Replacer};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// The byte buffer of one frame, behind its reader/writer latch. The
/// latch guards page *content*; all frame metadata lives under the pool
/// mutex.
pub type FrameData = Arc<RwLock<Box<[u8; PAGE_SIZE]>>>;

/// Shared (read) latch on a frame's bytes. `'static`, so tree
/// operations can carry it across buffer pool calls.
pub type FrameReadGuard = lock_api::ArcRwLockReadGuard<RawRwLock, Box<[u8; PAGE_SIZE]>>;

/// Exclusive (write) latch on a frame's bytes.
pub type FrameWriteGuard = lock_api::ArcRwLockWriteGuard<RawRwLock, Box<[u8; PAGE_SIZE]>>;

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub pool_size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self { pool_size: 1024 }
    }
}

/// Per-frame bookkeeping. Guarded by the pool mutex.
struct FrameMeta {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

impl FrameMeta {
    fn new() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
        }
    }

    fn reset(&mut self) {
        self.page_id = INVALID_PAGE_ID;
        self.pin_count = 0;
        self.is_dirty = false;
    }
}

/// Bookkeeping protected by the pool latch: the page table, the free
/// list, frame metadata, and the disk manager.
struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    metas: Vec<FrameMeta>,
    disk: DiskManager,
}

struct BufferPoolInner {
    state: Mutex<PoolState>,
    frames: Vec<FrameData>,
    replacer: Mutex<Box<dyn Replacer>>,
    pool_size: usize,
}

/// Buffer pool manager: a fixed array of frames fronting the disk
/// manager. Cheap to clone; clones share the pool.
///
/// Every `fetch_page`/`new_page` pins the page and must be paired with
/// exactly one `unpin_page`. Content latches are acquired through the
/// returned [`PageHandle`] after the pool call returns, and released
/// before the matching unpin.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<BufferPoolInner>,
}

/// A pinned page. Holds the frame's data `Arc` so the caller can latch
/// the bytes; dropping the handle does not unpin.
pub struct PageHandle {
    page_id: PageId,
    data: FrameData,
}

impl PageHandle {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Acquires the frame's shared latch.
    pub fn read_latch(&self) -> FrameReadGuard {
        self.data.read_arc()
    }

    /// Acquires the frame's exclusive latch.
    pub fn write_latch(&self) -> FrameWriteGuard {
        self.data.write_arc()
    }
}

impl BufferPoolManager {
    pub fn new(disk: DiskManager, config: BufferPoolConfig) -> Self {
        let pool_size = config.pool_size;
        assert!(pool_size > 0, "buffer pool needs at least one frame");

        let frames = (0..pool_size)
            .map(|_| Arc::new(RwLock::new(Box::new([0u8; PAGE_SIZE]))))
            .collect();
        let metas = (0..pool_size).map(|_| FrameMeta::new()).collect();
        let free_list = (0..pool_size as FrameId).collect();

        Self {
            inner: Arc::new(BufferPoolInner {
                state: Mutex::new(PoolState {
                    page_table: HashMap::with_capacity(pool_size),
                    free_list,
                    metas,
                    disk,
                }),
                frames,
                replacer: Mutex::new(Box::new(LruReplacer::new(pool_size))),
                pool_size,
            }),
        }
    }

    fn handle(&self, page_id: PageId, frame_id: FrameId) -> PageHandle {
        PageHandle {
            page_id,
            data: self.inner.frames[frame_id as usize].clone(),
        }
    }

    /// Fetches a page, reading it from disk if it is not resident.
    /// The returned page is pinned. Fails with `BufferPoolFull` when
    /// every frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> StorageResult<PageHandle> {
        if !page_id.is_valid() {
            return Err(StorageError::PageNotFound(page_id));
        }

        let mut state = self.inner.state.lock();

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            state.metas[frame_id as usize].pin_count += 1;
            self.inner.replacer.lock().pin(frame_id);
            return Ok(self.handle(page_id, frame_id));
        }

        let frame_id = self.take_victim_frame(&mut state)?;

        let read_result = {
            let mut data = self.inner.frames[frame_id as usize]
                .try_write_arc()
                .expect("an unpinned frame cannot be latched");
            state.disk.read_page(page_id, &mut data[..])
        };
        if let Err(err) = read_result {
            state.free_list.push_back(frame_id);
            return Err(err);
        }

        state.page_table.insert(page_id, frame_id);
        let meta = &mut state.metas[frame_id as usize];
        meta.page_id = page_id;
        meta.pin_count = 1;
        meta.is_dirty = false;

        Ok(self.handle(page_id, frame_id))
    }

    /// Allocates a fresh page and returns it zero-filled and pinned.
    /// When no frame can be secured, no page id is allocated.
    pub fn new_page(&self) -> StorageResult<(PageId, PageHandle)> {
        let mut state = self.inner.state.lock();

        let frame_id = self.take_victim_frame(&mut state)?;
        let page_id = match state.disk.allocate_page() {
            Ok(page_id) => page_id,
            Err(err) => {
                state.free_list.push_back(frame_id);
                return Err(err);
            }
        };

        {
            let mut data = self.inner.frames[frame_id as usize]
                .try_write_arc()
                .expect("an unpinned frame cannot be latched");
            data.fill(0);
        }

        state.page_table.insert(page_id, frame_id);
        let meta = &mut state.metas[frame_id as usize];
        meta.page_id = page_id;
        meta.pin_count = 1;
        meta.is_dirty = false;

        Ok((page_id, self.handle(page_id, frame_id)))
    }

    /// Drops one pin. Returns false if the page is not resident or was
    /// not pinned. The dirty flag is OR-folded into the frame; the frame
    /// becomes evictable when the pin count reaches zero.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut state = self.inner.state.lock();

        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return false;
        };
        let meta = &mut state.metas[frame_id as usize];
        if meta.pin_count == 0 {
            return false;
        }

        meta.pin_count -= 1;
        meta.is_dirty |= is_dirty;
        if meta.pin_count == 0 {
            self.inner.replacer.lock().unpin(frame_id);
        }
        true
    }

    /// Writes a resident page back unconditionally and clears its dirty
    /// flag. Returns false if the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> StorageResult<bool> {
        if !page_id.is_valid() {
            return Ok(false);
        }

        // Pin the frame so it cannot be remapped, then latch its bytes
        // outside the pool mutex. The pool never blocks on a frame latch.
        let frame_id = {
            let mut state = self.inner.state.lock();
            let Some(&frame_id) = state.page_table.get(&page_id) else {
                return Ok(false);
            };
            state.metas[frame_id as usize].pin_count += 1;
            self.inner.replacer.lock().pin(frame_id);
            frame_id
        };

        let data = self.inner.frames[frame_id as usize].read_arc();
        let mut state = self.inner.state.lock();
        let result = state.disk.write_page(page_id, &data[..]);
        if result.is_ok() {
            state.metas[frame_id as usize].is_dirty = false;
        }

        let meta = &mut state.metas[frame_id as usize];
        meta.pin_count -= 1;
        if meta.pin_count == 0 {
            self.inner.replacer.lock().unpin(frame_id);
        }

        result.map(|_| true)
    }

    /// Flushes every resident page. Conservative, not atomic with
    /// concurrent mutation.
    pub fn flush_all(&self) -> StorageResult<()> {
        let page_ids: Vec<PageId> = {
            let state = self.inner.state.lock();
            state.page_table.keys().copied().collect()
        };

        for page_id in page_ids {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Deletes a page. Returns true when the page is gone (it was not
    /// resident, or its frame was reclaimed); false when it is pinned.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let mut state = self.inner.state.lock();

        let Some(&frame_id) = state.page_table.get(&page_id) else {
            state.disk.deallocate_page(page_id);
            return true;
        };
        if state.metas[frame_id as usize].pin_count > 0 {
            return false;
        }

        self.inner.replacer.lock().pin(frame_id);
        state.page_table.remove(&page_id);
        state.metas[frame_id as usize].reset();
        state.free_list.push_back(frame_id);
        state.disk.deallocate_page(page_id);
        true
    }

    /// Secures a frame for a new resident page: the free list first,
    /// then the replacer. A dirty victim is written back before reuse.
    fn take_victim_frame(&self, state: &mut PoolState) -> StorageResult<FrameId> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let Some(frame_id) = self.inner.replacer.lock().victim() else {
            return Err(StorageError::BufferPoolFull {
                pool_size: self.inner.pool_size,
            });
        };

        let (old_page_id, is_dirty) = {
            let meta = &state.metas[frame_id as usize];
            debug_assert_eq!(meta.pin_count, 0, "replacer yielded a pinned frame");
            (meta.page_id, meta.is_dirty)
        };

        if old_page_id.is_valid() {
            if is_dirty {
                debug!("evicting dirty page {old_page_id}, writing back");
                let data = self.inner.frames[frame_id as usize]
                    .try_read_arc()
                    .expect("an unpinned frame cannot be latched");
                state.disk.write_page(old_page_id, &data[..])?;
            }
            state.page_table.remove(&old_page_id);
        }

        state.metas[frame_id as usize].reset();
        Ok(frame_id)
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    pub fn page_is_resident(&self, page_id: PageId) -> bool {
        self.inner.state.lock().page_table.contains_key(&page_id)
    }

    /// Pin count of a resident page, None if not resident.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.inner.state.lock();
        let &frame_id = state.page_table.get(&page_id)?;
        Some(state.metas[frame_id as usize].pin_count)
    }

    pub fn resident_page_count(&self) -> usize {
        self.inner.state.lock().page_table.len()
    }

    pub fn free_frame_count(&self) -> usize {
        self.inner.state.lock().free_list.len()
    }

    /// Number of pages allocated on disk.
    pub fn disk_page_count(&self) -> StorageResult<u32> {
        self.inner.state.lock().disk.num_pages()
    }

    /// Number of page writes the disk manager has performed.
    pub fn disk_write_count(&self) -> u64 {
        self.inner.state.lock().disk.write_count()
    }
}
