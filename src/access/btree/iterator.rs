use crate::access::btree::key::IndexKey;
use crate::access::RecordId;
use crate::storage::buffer::{BufferPoolManager, FrameReadGuard, PageHandle};
use crate::storage::page::btree_leaf_page::{BTreeLeafPage, LeafPageView};
use crate::storage::page::{BTreePageView, PageId};

/// Forward cursor over the leaf chain. Holds exactly one leaf pinned
/// and read-latched; advancing past the last slot releases it and hops
/// to `next_page_id`. Structural changes in leaves the cursor has not
/// reached yet may become visible mid-scan.
pub struct TreeIterator<K: IndexKey> {
    pool: BufferPoolManager,
    leaf: Option<(PageHandle, FrameReadGuard)>,
    slot: usize,
    _marker: std::marker::PhantomData<K>,
}

impl<K: IndexKey> TreeIterator<K> {
    /// Cursor positioned at `slot` of the given latched leaf. If that
    /// slot is past the leaf's end, the cursor normalizes forward.
    pub(crate) fn new(
        pool: BufferPoolManager,
        leaf: Option<(PageHandle, FrameReadGuard)>,
        slot: usize,
    ) -> Self {
        let mut iter = Self {
            pool,
            leaf,
            slot,
            _marker: std::marker::PhantomData,
        };
        iter.advance_past_exhausted_leaves();
        iter
    }

    /// The exhausted cursor.
    pub(crate) fn exhausted(pool: BufferPoolManager) -> Self {
        Self {
            pool,
            leaf: None,
            slot: 0,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn is_end(&self) -> bool {
        self.leaf.is_none()
    }

    /// The entry under the cursor, if any.
    pub fn current(&self) -> Option<(K, RecordId)> {
        let (_, guard) = self.leaf.as_ref()?;
        let leaf = BTreeLeafPage::<K>::new(&guard[..]);
        debug_assert!(self.slot < leaf.size() as usize);
        Some((leaf.key_at(self.slot), leaf.record_at(self.slot)))
    }

    /// Hops leaves until the cursor rests on a live slot. Releases each
    /// exhausted leaf before fetching its successor.
    fn advance_past_exhausted_leaves(&mut self) {
        while let Some((handle, guard)) = self.leaf.take() {
            let (size, next) = {
                let leaf = BTreeLeafPage::<K>::new(&guard[..]);
                (leaf.size() as usize, leaf.next_page_id())
            };

            if self.slot < size {
                self.leaf = Some((handle, guard));
                return;
            }

            drop(guard);
            self.pool.unpin_page(handle.page_id(), false);

            if !next.is_valid() {
                return;
            }
            match self.pool.fetch_page(next) {
                Ok(next_handle) => {
                    let next_guard = next_handle.read_latch();
                    self.leaf = Some((next_handle, next_guard));
                    self.slot = 0;
                }
                Err(_) => return,
            }
        }
    }

    fn position(&self) -> Option<(PageId, usize)> {
        let (handle, _) = self.leaf.as_ref()?;
        Some((handle.page_id(), self.slot))
    }
}

impl<K: IndexKey> Iterator for TreeIterator<K> {
    type Item = (K, RecordId);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.current()?;
        self.slot += 1;
        self.advance_past_exhausted_leaves();
        Some(entry)
    }
}

/// Two cursors are equal when they rest on the same leaf slot, or when
/// both are exhausted.
impl<K: IndexKey> PartialEq for TreeIterator<K> {
    fn eq(&self, other: &Self) -> bool {
        self.position() == other.position()
    }
}

impl<K: IndexKey> Drop for TreeIterator<K> {
    fn drop(&mut self) {
        if let Some((handle, guard)) = self.leaf.take() {
            drop(guard);
            self.pool.unpin_page(handle.page_id(), false);
        }
    }
}
