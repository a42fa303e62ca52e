use crate::storage::buffer::{BufferPoolManager, FrameReadGuard, FrameWriteGuard, PageHandle};
use crate::storage::disk::PAGE_SIZE;
use crate::storage::page::PageId;
use log::debug;

/// Latch mode held on a page during a tree operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    Read,
    Write,
}

pub(crate) enum FrameLatch {
    Read(FrameReadGuard),
    Write(FrameWriteGuard),
}

/// One pinned and latched page on the descent path.
pub(crate) struct LatchedPage {
    handle: PageHandle,
    latch: FrameLatch,
    dirty: bool,
}

impl LatchedPage {
    pub fn page_id(&self) -> PageId {
        self.handle.page_id()
    }

    pub fn mode(&self) -> LatchMode {
        match self.latch {
            FrameLatch::Read(_) => LatchMode::Read,
            FrameLatch::Write(_) => LatchMode::Write,
        }
    }

    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        match &self.latch {
            FrameLatch::Read(guard) => guard.as_ref(),
            FrameLatch::Write(guard) => guard.as_ref(),
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        match &mut self.latch {
            FrameLatch::Write(guard) => guard.as_mut(),
            FrameLatch::Read(_) => panic!("page latched for read, write access refused"),
        }
    }

    /// Marks the page structurally modified; it will be unpinned dirty.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Surrenders the handle and read guard, transferring the unpin
    /// obligation to the caller (the iterator takes over the leaf).
    pub(crate) fn into_read_parts(self) -> (PageHandle, FrameReadGuard) {
        match self.latch {
            FrameLatch::Read(guard) => (self.handle, guard),
            FrameLatch::Write(_) => panic!("page latched for write cannot seed a read cursor"),
        }
    }
}

/// Per-operation container for the pages latched during a descent, in
/// acquisition order, plus the pages scheduled for deletion.
///
/// Pages are released unlatch-then-unpin, in acquisition order, either
/// explicitly through the release methods or by `Drop` on any exit
/// path. Deleted pages are handed to the buffer pool only after every
/// latch is gone.
pub struct Transaction {
    pool: BufferPoolManager,
    pages: Vec<LatchedPage>,
    deleted_pages: Vec<PageId>,
}

impl Transaction {
    pub fn new(pool: BufferPoolManager) -> Self {
        Self {
            pool,
            pages: Vec::new(),
            deleted_pages: Vec::new(),
        }
    }

    /// Read-latches a pinned page and appends it to the path.
    pub(crate) fn latch_read(&mut self, handle: PageHandle) {
        let guard = handle.read_latch();
        self.pages.push(LatchedPage {
            handle,
            latch: FrameLatch::Read(guard),
            dirty: false,
        });
    }

    /// Write-latches a pinned page and appends it to the path.
    pub(crate) fn latch_write(&mut self, handle: PageHandle) {
        let guard = handle.write_latch();
        self.pages.push(LatchedPage {
            handle,
            latch: FrameLatch::Write(guard),
            dirty: false,
        });
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub(crate) fn page(&self, index: usize) -> &LatchedPage {
        &self.pages[index]
    }

    pub(crate) fn page_mut(&mut self, index: usize) -> &mut LatchedPage {
        &mut self.pages[index]
    }

    pub(crate) fn last(&self) -> &LatchedPage {
        self.pages.last().expect("transaction holds no pages")
    }

    pub(crate) fn last_mut(&mut self) -> &mut LatchedPage {
        self.pages.last_mut().expect("transaction holds no pages")
    }

    /// Two distinct pages on the path, mutably. `a` must precede `b`.
    pub(crate) fn pair_mut(&mut self, a: usize, b: usize) -> (&mut LatchedPage, &mut LatchedPage) {
        debug_assert!(a < b);
        let (head, tail) = self.pages.split_at_mut(b);
        (&mut head[a], &mut tail[0])
    }

    /// The latched page holding `page_id`, if it is on the path.
    pub(crate) fn find_mut(&mut self, page_id: PageId) -> Option<&mut LatchedPage> {
        self.pages.iter_mut().find(|page| page.page_id() == page_id)
    }

    /// Releases every page above the most recently latched one. Called
    /// when the current page is proven safe.
    pub fn release_ancestors(&mut self) {
        if self.pages.len() <= 1 {
            return;
        }
        let last = self.pages.pop().expect("checked non-empty");
        for page in self.pages.drain(..) {
            release(&self.pool, page);
        }
        self.pages.push(last);
    }

    /// Removes the most recently latched page without releasing it.
    pub(crate) fn detach_last(&mut self) -> Option<LatchedPage> {
        self.pages.pop()
    }

    /// Releases the most recently latched page only.
    pub(crate) fn release_last(&mut self) {
        if let Some(page) = self.pages.pop() {
            release(&self.pool, page);
        }
    }

    /// Releases everything, in acquisition order.
    pub fn release_all(&mut self) {
        for page in self.pages.drain(..) {
            release(&self.pool, page);
        }
    }

    /// Schedules a page for deletion once all latches are released.
    pub fn schedule_delete(&mut self, page_id: PageId) {
        self.deleted_pages.push(page_id);
    }
}

fn release(pool: &BufferPoolManager, page: LatchedPage) {
    let LatchedPage {
        handle,
        latch,
        dirty,
    } = page;
    drop(latch);
    pool.unpin_page(handle.page_id(), dirty);
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.release_all();
        for page_id in self.deleted_pages.drain(..) {
            if !self.pool.delete_page(page_id) {
                // Someone still holds a pin (e.g. an iterator racing the
                // leaf chain); the page stays allocated.
                debug!("could not reclaim page {page_id}, still pinned");
            }
        }
    }
}
