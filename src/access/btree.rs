pub mod iterator;
pub mod key;
pub mod transaction;

use self::iterator::TreeIterator;
use self::key::IndexKey;
use self::transaction::Transaction;
use crate::access::RecordId;
use crate::storage::buffer::{BufferPoolManager, FrameWriteGuard};
use crate::storage::page::btree_internal_page::{
    internal_capacity, BTreeInternalPage, BTreeInternalPageMut, InternalPageView,
};
use crate::storage::page::btree_leaf_page::{
    leaf_capacity, BTreeLeafPage, BTreeLeafPageMut, LeafPageView,
};
use crate::storage::page::header_page::{HeaderPage, HeaderPageMut};
use crate::storage::page::{
    page_type_of, write_parent_page_id, BTreePageType, BTreePageView, PageId, RawBTreePage,
    HEADER_PAGE_ID, INVALID_PAGE_ID,
};
use anyhow::{bail, ensure, Context, Result};
use log::debug;
use parking_lot::{Mutex, MutexGuard};
use std::marker::PhantomData;

/// Kind of descent, deciding latch modes and the crabbing safety rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TreeOp {
    Search,
    Insert,
    Remove,
}

/// A page is safe when the operation on a descendant cannot propagate a
/// structure change up through it.
fn node_is_safe(data: &[u8], op: TreeOp) -> bool {
    let page = RawBTreePage(data);
    match op {
        TreeOp::Search => true,
        TreeOp::Insert => page.size() < page.max_size(),
        TreeOp::Remove => page.size() > page.min_size(),
    }
}

/// Concurrent B+tree index over the buffer pool.
///
/// Maps fixed-width keys to [`RecordId`]s, rejecting duplicates. All
/// inter-page references are page ids resolved through the pool;
/// descents use latch crabbing (read for lookups, write for mutations)
/// and a root-id mutex serialises changes to the root page id, which is
/// persisted in the header page under this index's name.
pub struct BPlusTree<K: IndexKey> {
    index_name: String,
    pool: BufferPoolManager,
    /// The root-id latch: held while descending until the first page is
    /// latched, and through any structural change of the root.
    root_id: Mutex<PageId>,
    leaf_max_size: u32,
    internal_max_size: u32,
    _marker: PhantomData<K>,
}

impl<K: IndexKey> BPlusTree<K> {
    /// Registers a new (empty) index in the header page. On a fresh
    /// database this also formats page 0 as the header page.
    pub fn create(
        pool: BufferPoolManager,
        index_name: &str,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Result<Self> {
        Self::validate_sizes(leaf_max_size, internal_max_size)?;

        if pool.disk_page_count()? == 0 {
            let (page_id, handle) = pool.new_page().context("bootstrap header page")?;
            ensure!(
                page_id == HEADER_PAGE_ID,
                "first allocated page must be the header page, got {page_id}"
            );
            {
                let mut guard = handle.write_latch();
                HeaderPageMut::init(&mut guard[..]);
            }
            pool.unpin_page(page_id, true);
        }

        let handle = pool.fetch_page(HEADER_PAGE_ID).context("fetch header page")?;
        let inserted = {
            let mut guard = handle.write_latch();
            let mut header = HeaderPageMut::new(&mut guard[..]);
            header.insert_record(index_name, INVALID_PAGE_ID)
        };
        pool.unpin_page(HEADER_PAGE_ID, inserted);
        ensure!(inserted, "index {index_name} already registered in header page");

        Ok(Self {
            index_name: index_name.to_string(),
            pool,
            root_id: Mutex::new(INVALID_PAGE_ID),
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        })
    }

    /// Opens an index previously registered in the header page.
    pub fn open(
        pool: BufferPoolManager,
        index_name: &str,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Result<Self> {
        Self::validate_sizes(leaf_max_size, internal_max_size)?;

        let handle = pool.fetch_page(HEADER_PAGE_ID).context("fetch header page")?;
        let root = {
            let guard = handle.read_latch();
            HeaderPage::new(&guard[..]).get_record(index_name)
        };
        pool.unpin_page(HEADER_PAGE_ID, false);
        let root =
            root.with_context(|| format!("index {index_name} not found in header page"))?;

        Ok(Self {
            index_name: index_name.to_string(),
            pool,
            root_id: Mutex::new(root),
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        })
    }

    fn validate_sizes(leaf_max_size: u32, internal_max_size: u32) -> Result<()> {
        ensure!(leaf_max_size >= 2, "leaf max size must be at least 2");
        ensure!(internal_max_size >= 3, "internal max size must be at least 3");
        ensure!(
            leaf_max_size <= leaf_capacity::<K>(),
            "leaf max size {leaf_max_size} exceeds page capacity {}",
            leaf_capacity::<K>()
        );
        ensure!(
            internal_max_size <= internal_capacity::<K>(),
            "internal max size {internal_max_size} exceeds page capacity {}",
            internal_capacity::<K>()
        );
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        !self.root_id.lock().is_valid()
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_id.lock()
    }

    /// Point lookup. Appends the value for `key` to `result` and
    /// returns true if the key exists.
    pub fn get_value(&self, key: &K, result: &mut Vec<RecordId>) -> Result<bool> {
        let mut root_guard = Some(self.root_id.lock());
        if !root_guard.as_deref().unwrap().is_valid() {
            return Ok(false);
        }

        let mut tx = Transaction::new(self.pool.clone());
        self.find_leaf(Some(key), TreeOp::Search, &mut tx, &mut root_guard)?;

        let leaf = BTreeLeafPage::<K>::new(&tx.last().data()[..]);
        match leaf.lookup(key) {
            Some(record) => {
                result.push(record);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Inserts a key/value pair. Returns false (with no state change)
    /// if the key is already present.
    pub fn insert(&self, key: &K, record: RecordId) -> Result<bool> {
        let mut root_guard = Some(self.root_id.lock());
        if !root_guard.as_deref().unwrap().is_valid() {
            self.start_new_tree(root_guard.as_mut().unwrap())?;
        }

        let mut tx = Transaction::new(self.pool.clone());
        self.find_leaf(Some(key), TreeOp::Insert, &mut tx, &mut root_guard)?;

        {
            let leaf = BTreeLeafPage::<K>::new(&tx.last().data()[..]);
            if leaf.lookup(key).is_some() {
                return Ok(false);
            }
        }

        let overflowed = {
            let page = tx.last_mut();
            let new_size = BTreeLeafPageMut::<K>::new(&mut page.data_mut()[..]).insert(key, record);
            page.mark_dirty();
            new_size > self.leaf_max_size
        };

        if overflowed {
            self.split_leaf(&mut tx, &mut root_guard)?;
        }
        Ok(true)
    }

    /// Removes `key` if present. Underflowing pages are rebalanced by
    /// redistribution or coalescing, shrinking the tree as needed.
    pub fn remove(&self, key: &K) -> Result<()> {
        let mut root_guard = Some(self.root_id.lock());
        if !root_guard.as_deref().unwrap().is_valid() {
            return Ok(());
        }

        let mut tx = Transaction::new(self.pool.clone());
        self.find_leaf(Some(key), TreeOp::Remove, &mut tx, &mut root_guard)?;

        let (removed, size, is_root) = {
            let page = tx.last_mut();
            let mut leaf = BTreeLeafPageMut::<K>::new(&mut page.data_mut()[..]);
            let removed = leaf.remove(key);
            (removed, leaf.size(), leaf.is_root())
        };
        if !removed {
            return Ok(());
        }
        tx.last_mut().mark_dirty();

        if is_root {
            if size == 0 {
                // The last key is gone: the tree is empty again.
                let old_root = tx.last().page_id();
                let guard = root_guard
                    .as_mut()
                    .expect("root latch must be held when the tree empties");
                **guard = INVALID_PAGE_ID;
                self.update_root_record(INVALID_PAGE_ID)?;
                tx.schedule_delete(old_root);
                debug!("index {} is empty again", self.index_name);
            }
            return Ok(());
        }

        let min_size = RawBTreePage(&tx.last().data()[..]).min_size();
        if size < min_size {
            let leaf_index = tx.len() - 1;
            self.coalesce_or_redistribute(&mut tx, &mut root_guard, leaf_index)?;
        }
        Ok(())
    }

    /// Cursor at the first entry of the leftmost leaf.
    pub fn begin(&self) -> Result<TreeIterator<K>> {
        let mut root_guard = Some(self.root_id.lock());
        if !root_guard.as_deref().unwrap().is_valid() {
            return Ok(TreeIterator::exhausted(self.pool.clone()));
        }

        let mut tx = Transaction::new(self.pool.clone());
        self.find_leaf(None, TreeOp::Search, &mut tx, &mut root_guard)?;
        Ok(self.into_iterator(tx, 0))
    }

    /// Cursor at the smallest entry with key `>= key`.
    pub fn begin_at(&self, key: &K) -> Result<TreeIterator<K>> {
        let mut root_guard = Some(self.root_id.lock());
        if !root_guard.as_deref().unwrap().is_valid() {
            return Ok(TreeIterator::exhausted(self.pool.clone()));
        }

        let mut tx = Transaction::new(self.pool.clone());
        self.find_leaf(Some(key), TreeOp::Search, &mut tx, &mut root_guard)?;
        let slot = BTreeLeafPage::<K>::new(&tx.last().data()[..]).key_index(key);
        Ok(self.into_iterator(tx, slot))
    }

    /// The exhausted cursor.
    pub fn end(&self) -> TreeIterator<K> {
        TreeIterator::exhausted(self.pool.clone())
    }

    fn into_iterator(&self, mut tx: Transaction, slot: usize) -> TreeIterator<K> {
        let page = tx.detach_last().expect("descent latched a leaf");
        let (handle, guard) = page.into_read_parts();
        TreeIterator::new(self.pool.clone(), Some((handle, guard)), slot)
    }

    /// Descends from the root to the leaf responsible for `key` (the
    /// leftmost leaf when `key` is None), latching hand-over-hand in the
    /// mode of `op` and releasing ancestors at proven-safe pages. The
    /// root-id latch is dropped as soon as the root can no longer be
    /// rewritten by this operation.
    fn find_leaf<'a>(
        &'a self,
        key: Option<&K>,
        op: TreeOp,
        tx: &mut Transaction,
        root_guard: &mut Option<MutexGuard<'a, PageId>>,
    ) -> Result<()> {
        let root = **root_guard
            .as_ref()
            .expect("root-id latch must be held when a descent starts");
        debug_assert!(root.is_valid());

        let handle = self.pool.fetch_page(root).context("fetch root page")?;
        match op {
            TreeOp::Search => tx.latch_read(handle),
            _ => tx.latch_write(handle),
        }
        if op == TreeOp::Search || node_is_safe(&tx.last().data()[..], op) {
            *root_guard = None;
        }

        loop {
            let child = {
                let data = &tx.last().data()[..];
                match page_type_of(data) {
                    BTreePageType::Leaf => return Ok(()),
                    BTreePageType::Internal => {
                        let page = BTreeInternalPage::<K>::new(data);
                        match key {
                            Some(key) => page.lookup(key),
                            None => page.child_at(0),
                        }
                    }
                    BTreePageType::Invalid => {
                        bail!("descent reached an unformatted page in index {}", self.index_name)
                    }
                }
            };

            let handle = self.pool.fetch_page(child).context("fetch child page")?;
            match op {
                TreeOp::Search => tx.latch_read(handle),
                _ => tx.latch_write(handle),
            }

            if op == TreeOp::Search || node_is_safe(&tx.last().data()[..], op) {
                tx.release_ancestors();
                *root_guard = None;
            }
        }
    }

    /// Creates the first leaf, makes it root, and publishes the root id.
    fn start_new_tree(&self, root_guard: &mut MutexGuard<'_, PageId>) -> Result<()> {
        let (page_id, handle) = self.pool.new_page().context("allocate root leaf")?;
        {
            let mut guard = handle.write_latch();
            BTreeLeafPageMut::<K>::init(
                &mut guard[..],
                page_id,
                INVALID_PAGE_ID,
                self.leaf_max_size,
            );
        }
        self.pool.unpin_page(page_id, true);

        **root_guard = page_id;
        self.update_root_record(page_id)?;
        debug!("index {} rooted at {page_id}", self.index_name);
        Ok(())
    }

    /// Rewrites this index's record in the header page. The caller holds
    /// the root-id latch; the header latch is acquired last.
    fn update_root_record(&self, root: PageId) -> Result<()> {
        let handle = self
            .pool
            .fetch_page(HEADER_PAGE_ID)
            .context("fetch header page")?;
        let updated = {
            let mut guard = handle.write_latch();
            HeaderPageMut::new(&mut guard[..]).update_record(&self.index_name, root)
        };
        self.pool.unpin_page(HEADER_PAGE_ID, updated);
        ensure!(updated, "index {} missing from header page", self.index_name);
        Ok(())
    }

    /// Splits the overflowed leaf at the bottom of the path: the upper
    /// half moves into a fresh sibling, which is linked into the leaf
    /// chain, and the separator climbs into the parent.
    fn split_leaf<'a>(
        &'a self,
        tx: &mut Transaction,
        root_guard: &mut Option<MutexGuard<'a, PageId>>,
    ) -> Result<()> {
        let (sibling_id, sibling_handle) =
            self.pool.new_page().context("allocate leaf split sibling")?;
        let mut sibling_guard = sibling_handle.write_latch();

        let (left_id, separator) = {
            let page = tx.last_mut();
            let left_id = page.page_id();
            let mut leaf = BTreeLeafPageMut::<K>::new(&mut page.data_mut()[..]);
            let mut sibling = BTreeLeafPageMut::<K>::init(
                &mut sibling_guard[..],
                sibling_id,
                leaf.parent_page_id(),
                self.leaf_max_size,
            );
            leaf.move_half_to(&mut sibling);
            sibling.set_next_page_id(leaf.next_page_id());
            leaf.set_next_page_id(sibling_id);
            (left_id, sibling.key_at(0))
        };
        tx.last_mut().mark_dirty();

        drop(sibling_handle);
        self.insert_into_parent(tx, root_guard, left_id, separator, sibling_id, sibling_guard)
    }

    /// Publishes a split: `(separator, right_id)` goes into the parent
    /// of `left_id`, growing a new root when `left_id` was the root and
    /// splitting the parent when it overflows in turn.
    fn insert_into_parent<'a>(
        &'a self,
        tx: &mut Transaction,
        root_guard: &mut Option<MutexGuard<'a, PageId>>,
        left_id: PageId,
        separator: K,
        right_id: PageId,
        mut right_guard: FrameWriteGuard,
    ) -> Result<()> {
        debug_assert_eq!(tx.last().page_id(), left_id);
        let left_is_root = RawBTreePage(&tx.last().data()[..]).is_root();

        if left_is_root {
            let (new_root_id, root_handle) = self.pool.new_page().context("allocate new root")?;
            {
                let mut guard = root_handle.write_latch();
                let mut root = BTreeInternalPageMut::<K>::init(
                    &mut guard[..],
                    new_root_id,
                    INVALID_PAGE_ID,
                    self.internal_max_size,
                );
                root.populate_new_root(left_id, &separator, right_id);
            }

            {
                let page = tx.last_mut();
                write_parent_page_id(&mut page.data_mut()[..], new_root_id);
                page.mark_dirty();
            }
            write_parent_page_id(&mut right_guard[..], new_root_id);

            let guard = root_guard
                .as_mut()
                .expect("root-id latch must be held when the root splits");
            **guard = new_root_id;
            self.update_root_record(new_root_id)?;
            *root_guard = None;
            debug!(
                "index {} grew a root: {new_root_id} over ({left_id}, {right_id})",
                self.index_name
            );

            drop(right_guard);
            self.pool.unpin_page(right_id, true);
            self.pool.unpin_page(new_root_id, true);
            return Ok(());
        }

        ensure!(tx.len() >= 2, "split propagation lost the parent latch");
        let parent_id = tx.page(tx.len() - 2).page_id();

        // The right sibling's final parent may still change if the
        // parent splits below; park the provisional pointer and release
        // the sibling so the re-parenting pass can reach it.
        write_parent_page_id(&mut right_guard[..], parent_id);
        drop(right_guard);
        self.pool.unpin_page(right_id, true);

        // The split child is structurally complete. Release it before
        // touching the parent; the parent's write latch shields the
        // whole subtree from concurrent descents.
        tx.release_last();

        let parent_overflowed = {
            let page = tx.last_mut();
            let new_size = BTreeInternalPageMut::<K>::new(&mut page.data_mut()[..])
                .insert_node_after(left_id, &separator, right_id);
            page.mark_dirty();
            new_size > self.internal_max_size
        };
        if !parent_overflowed {
            return Ok(());
        }

        // The parent overflowed in turn: split it and climb.
        let (new_sibling_id, new_sibling_handle) = self
            .pool
            .new_page()
            .context("allocate internal split sibling")?;
        let mut new_sibling_guard = new_sibling_handle.write_latch();

        let (parent_left_id, new_separator, moved_children) = {
            let page = tx.last_mut();
            let parent_left_id = page.page_id();
            let mut parent = BTreeInternalPageMut::<K>::new(&mut page.data_mut()[..]);
            let mut sibling = BTreeInternalPageMut::<K>::init(
                &mut new_sibling_guard[..],
                new_sibling_id,
                parent.parent_page_id(),
                self.internal_max_size,
            );
            parent.move_half_to(&mut sibling);
            let moved: Vec<PageId> = (0..sibling.size() as usize)
                .map(|i| sibling.child_at(i))
                .collect();
            (parent_left_id, sibling.separator_key(), moved)
        };
        tx.last_mut().mark_dirty();

        for child in moved_children {
            self.reparent(tx, child, new_sibling_id)?;
        }

        drop(new_sibling_handle);
        self.insert_into_parent(
            tx,
            root_guard,
            parent_left_id,
            new_separator,
            new_sibling_id,
            new_sibling_guard,
        )
    }

    /// Rewrites a child's parent pointer, going through the path latch
    /// when the child is on the current path.
    fn reparent(&self, tx: &mut Transaction, child: PageId, parent: PageId) -> Result<()> {
        if let Some(page) = tx.find_mut(child) {
            write_parent_page_id(&mut page.data_mut()[..], parent);
            page.mark_dirty();
            return Ok(());
        }

        let handle = self
            .pool
            .fetch_page(child)
            .context("fetch child for re-parenting")?;
        {
            let mut guard = handle.write_latch();
            write_parent_page_id(&mut guard[..], parent);
        }
        self.pool.unpin_page(child, true);
        Ok(())
    }

    /// Rebalances the underflowing non-root page at `node_index` of the
    /// path against a sibling under the same parent: redistribution
    /// when their entries cannot fit one page, a merge otherwise,
    /// recursing up when the parent underflows in turn.
    fn coalesce_or_redistribute<'a>(
        &'a self,
        tx: &mut Transaction,
        root_guard: &mut Option<MutexGuard<'a, PageId>>,
        node_index: usize,
    ) -> Result<()> {
        ensure!(node_index >= 1, "rebalance lost the parent latch");
        let parent_index = node_index - 1;
        let node_id = tx.page(node_index).page_id();
        let node_is_leaf = page_type_of(&tx.page(node_index).data()[..]) == BTreePageType::Leaf;

        let (index_in_parent, sibling_id) = {
            let parent = BTreeInternalPage::<K>::new(&tx.page(parent_index).data()[..]);
            let index_in_parent = parent
                .value_index(node_id)
                .expect("underflowing page must be listed in its parent");
            let sibling_pos = if index_in_parent > 0 { index_in_parent - 1 } else { 1 };
            (index_in_parent, parent.child_at(sibling_pos))
        };
        let sibling_is_left = index_in_parent > 0;

        let sibling_handle = self
            .pool
            .fetch_page(sibling_id)
            .context("fetch rebalance sibling")?;
        let mut sibling_guard = sibling_handle.write_latch();

        let node_size = RawBTreePage(&tx.page(node_index).data()[..]).size();
        let sibling_size = RawBTreePage(&sibling_guard[..]).size();
        let max_size = if node_is_leaf {
            self.leaf_max_size
        } else {
            self.internal_max_size
        };

        if node_size + sibling_size > max_size {
            self.redistribute(
                tx,
                parent_index,
                node_index,
                &mut sibling_guard,
                index_in_parent,
                sibling_is_left,
            )?;
            drop(sibling_guard);
            self.pool.unpin_page(sibling_id, true);
            return Ok(());
        }

        // Merge the right page of the pair into the left one, drop the
        // separator from the parent, and schedule the emptied page.
        let mut moved_children = Vec::new();
        {
            let (parent_page, node_page) = tx.pair_mut(parent_index, node_index);
            let mut parent = BTreeInternalPageMut::<K>::new(&mut parent_page.data_mut()[..]);

            if sibling_is_left {
                // node drains into its left sibling
                if node_is_leaf {
                    let mut node = BTreeLeafPageMut::<K>::new(&mut node_page.data_mut()[..]);
                    let mut sibling = BTreeLeafPageMut::<K>::new(&mut sibling_guard[..]);
                    let next = node.next_page_id();
                    node.move_all_to(&mut sibling);
                    sibling.set_next_page_id(next);
                } else {
                    let mut node = BTreeInternalPageMut::<K>::new(&mut node_page.data_mut()[..]);
                    let mut sibling = BTreeInternalPageMut::<K>::new(&mut sibling_guard[..]);
                    moved_children =
                        (0..node.size() as usize).map(|i| node.child_at(i)).collect();
                    let middle = parent.key_at(index_in_parent);
                    node.move_all_to(&mut sibling, &middle);
                }
                parent.remove_at(index_in_parent);
            } else {
                // node is leftmost: its right sibling drains into it
                if node_is_leaf {
                    let mut node = BTreeLeafPageMut::<K>::new(&mut node_page.data_mut()[..]);
                    let mut sibling = BTreeLeafPageMut::<K>::new(&mut sibling_guard[..]);
                    let next = sibling.next_page_id();
                    sibling.move_all_to(&mut node);
                    node.set_next_page_id(next);
                } else {
                    let mut node = BTreeInternalPageMut::<K>::new(&mut node_page.data_mut()[..]);
                    let mut sibling = BTreeInternalPageMut::<K>::new(&mut sibling_guard[..]);
                    moved_children = (0..sibling.size() as usize)
                        .map(|i| sibling.child_at(i))
                        .collect();
                    let middle = parent.key_at(1);
                    sibling.move_all_to(&mut node, &middle);
                }
                parent.remove_at(1);
            }
        }
        tx.page_mut(parent_index).mark_dirty();
        tx.page_mut(node_index).mark_dirty();

        let survivor_id = if sibling_is_left { sibling_id } else { node_id };
        for child in moved_children {
            self.reparent(tx, child, survivor_id)?;
        }

        drop(sibling_guard);
        self.pool.unpin_page(sibling_id, true);
        tx.schedule_delete(if sibling_is_left { node_id } else { sibling_id });

        let (parent_is_root, parent_size, parent_min) = {
            let page = RawBTreePage(&tx.page(parent_index).data()[..]);
            (page.is_root(), page.size(), page.min_size())
        };
        if parent_is_root {
            self.adjust_root(tx, root_guard, parent_index)
        } else if parent_size < parent_min {
            self.coalesce_or_redistribute(tx, root_guard, parent_index)
        } else {
            Ok(())
        }
    }

    /// Moves one entry from the richer sibling into the deficient node
    /// and refreshes the separator between them in the parent.
    fn redistribute(
        &self,
        tx: &mut Transaction,
        parent_index: usize,
        node_index: usize,
        sibling_guard: &mut FrameWriteGuard,
        index_in_parent: usize,
        sibling_is_left: bool,
    ) -> Result<()> {
        let node_id = tx.page(node_index).page_id();
        let node_is_leaf = page_type_of(&tx.page(node_index).data()[..]) == BTreePageType::Leaf;
        let mut moved_child = None;

        {
            let (parent_page, node_page) = tx.pair_mut(parent_index, node_index);
            let mut parent = BTreeInternalPageMut::<K>::new(&mut parent_page.data_mut()[..]);

            if node_is_leaf {
                let mut node = BTreeLeafPageMut::<K>::new(&mut node_page.data_mut()[..]);
                let mut sibling = BTreeLeafPageMut::<K>::new(&mut sibling_guard[..]);
                if sibling_is_left {
                    sibling.move_last_to_front_of(&mut node);
                    let separator = node.key_at(0);
                    parent.set_key_at(index_in_parent, &separator);
                } else {
                    sibling.move_first_to_end_of(&mut node);
                    let separator = sibling.key_at(0);
                    parent.set_key_at(1, &separator);
                }
            } else {
                let mut node = BTreeInternalPageMut::<K>::new(&mut node_page.data_mut()[..]);
                let mut sibling = BTreeInternalPageMut::<K>::new(&mut sibling_guard[..]);
                if sibling_is_left {
                    let middle = parent.key_at(index_in_parent);
                    let new_separator = sibling.move_last_to_front_of(&mut node, &middle);
                    parent.set_key_at(index_in_parent, &new_separator);
                    moved_child = Some(node.child_at(0));
                } else {
                    let middle = parent.key_at(1);
                    let new_separator = sibling.move_first_to_end_of(&mut node, &middle);
                    parent.set_key_at(1, &new_separator);
                    moved_child = Some(node.child_at(node.size() as usize - 1));
                }
            }
        }
        tx.page_mut(parent_index).mark_dirty();
        tx.page_mut(node_index).mark_dirty();

        if let Some(child) = moved_child {
            self.reparent(tx, child, node_id)?;
        }
        Ok(())
    }

    /// Collapses an internal root left with a single child: the child is
    /// promoted to root and the old root is deleted.
    fn adjust_root<'a>(
        &'a self,
        tx: &mut Transaction,
        root_guard: &mut Option<MutexGuard<'a, PageId>>,
        root_index: usize,
    ) -> Result<()> {
        let (old_root_id, size) = {
            let page = RawBTreePage(&tx.page(root_index).data()[..]);
            (page.page_id(), page.size())
        };
        if size > 1 {
            return Ok(());
        }

        let survivor = BTreeInternalPage::<K>::new(&tx.page(root_index).data()[..]).child_at(0);
        self.reparent(tx, survivor, INVALID_PAGE_ID)?;

        let guard = root_guard
            .as_mut()
            .expect("root-id latch must be held when the root collapses");
        **guard = survivor;
        self.update_root_record(survivor)?;
        tx.schedule_delete(old_root_id);
        debug!(
            "index {} shrank: root {old_root_id} replaced by {survivor}",
            self.index_name
        );
        Ok(())
    }

    /// Walks the whole tree under read latches and checks its structural
    /// invariants: uniform leaf depth, strict key order, parent
    /// agreement, size bounds, and a monotone leaf chain.
    pub fn verify_integrity(&self) -> Result<()> {
        let root = *self.root_id.lock();
        if !root.is_valid() {
            return Ok(());
        }

        let mut leaves = Vec::new();
        self.verify_node(root, INVALID_PAGE_ID, None, None, 0, &mut leaves)?;

        ensure!(!leaves.is_empty(), "non-empty tree has no leaves");
        for pair in leaves.windows(2) {
            ensure!(
                pair[0].depth == pair[1].depth,
                "leaves {} and {} sit at different depths",
                pair[0].page_id,
                pair[1].page_id
            );
            ensure!(
                pair[0].next == pair[1].page_id,
                "leaf chain skips from {} past {}",
                pair[0].page_id,
                pair[1].page_id
            );
            ensure!(
                pair[0].last_key < pair[1].first_key,
                "leaf chain keys not monotone between {} and {}",
                pair[0].page_id,
                pair[1].page_id
            );
        }
        let last = leaves.last().unwrap();
        ensure!(
            !last.next.is_valid(),
            "last leaf {} does not terminate the chain",
            last.page_id
        );
        Ok(())
    }

    fn verify_node(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        lower: Option<K>,
        upper: Option<K>,
        depth: usize,
        leaves: &mut Vec<LeafCheck<K>>,
    ) -> Result<()> {
        let handle = self.pool.fetch_page(page_id)?;
        let guard = handle.read_latch();

        let checked = (|| -> Result<Option<Vec<(PageId, Option<K>, Option<K>)>>> {
            let data = &guard[..];
            let page = RawBTreePage(data);
            ensure!(
                page.page_id() == page_id,
                "page {page_id} carries id {}",
                page.page_id()
            );
            ensure!(
                page.parent_page_id() == expected_parent,
                "page {page_id} expects parent {expected_parent}, header says {}",
                page.parent_page_id()
            );
            ensure!(
                page.size() >= page.min_size() && page.size() <= page.max_size(),
                "page {page_id} size {} outside [{}, {}]",
                page.size(),
                page.min_size(),
                page.max_size()
            );

            match page_type_of(data) {
                BTreePageType::Leaf => {
                    let leaf = BTreeLeafPage::<K>::new(data);
                    let size = leaf.size() as usize;
                    for i in 1..size {
                        ensure!(
                            leaf.key_at(i - 1) < leaf.key_at(i),
                            "leaf {page_id} keys not strictly increasing at slot {i}"
                        );
                    }
                    let first_key = leaf.key_at(0);
                    let last_key = leaf.key_at(size - 1);
                    if let Some(lower) = lower {
                        ensure!(first_key >= lower, "leaf {page_id} underruns its lower bound");
                    }
                    if let Some(upper) = upper {
                        ensure!(last_key < upper, "leaf {page_id} overruns its upper bound");
                    }
                    leaves.push(LeafCheck {
                        page_id,
                        depth,
                        first_key,
                        last_key,
                        next: leaf.next_page_id(),
                    });
                    Ok(None)
                }
                BTreePageType::Internal => {
                    let internal = BTreeInternalPage::<K>::new(data);
                    let size = internal.size() as usize;
                    for i in 2..size {
                        ensure!(
                            internal.key_at(i - 1) < internal.key_at(i),
                            "internal {page_id} keys not strictly increasing at slot {i}"
                        );
                    }
                    let mut children = Vec::with_capacity(size);
                    for i in 0..size {
                        let child_lower = if i == 0 { lower } else { Some(internal.key_at(i)) };
                        let child_upper = if i + 1 < size {
                            Some(internal.key_at(i + 1))
                        } else {
                            upper
                        };
                        children.push((internal.child_at(i), child_lower, child_upper));
                    }
                    Ok(Some(children))
                }
                BTreePageType::Invalid => bail!("page {page_id} is unformatted"),
            }
        })();

        drop(guard);
        self.pool.unpin_page(page_id, false);

        if let Some(children) = checked? {
            for (child, child_lower, child_upper) in children {
                self.verify_node(child, page_id, child_lower, child_upper, depth + 1, leaves)?;
            }
        }
        Ok(())
    }
}

struct LeafCheck<K> {
    page_id: PageId,
    depth: usize,
    first_key: K,
    last_key: K,
    next: PageId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::buffer::BufferPoolConfig;
    use crate::storage::disk::DiskManager;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use tempfile::{tempdir, TempDir};

    fn create_tree(
        pool_size: usize,
        leaf_max: u32,
        internal_max: u32,
    ) -> Result<(BPlusTree<i64>, BufferPoolManager, TempDir)> {
        let dir = tempdir()?;
        let disk = DiskManager::create(&dir.path().join("test.db"))?;
        let pool = BufferPoolManager::new(disk, BufferPoolConfig { pool_size });
        let tree = BPlusTree::create(pool.clone(), "test_index", leaf_max, internal_max)?;
        Ok((tree, pool, dir))
    }

    fn rid(key: i64) -> RecordId {
        RecordId::new(PageId(key as u32), key as u16)
    }

    fn get(tree: &BPlusTree<i64>, key: i64) -> Result<Option<RecordId>> {
        let mut result = Vec::new();
        let found = tree.get_value(&key, &mut result)?;
        Ok(if found { Some(result[0]) } else { None })
    }

    fn collect_keys(tree: &BPlusTree<i64>) -> Result<Vec<i64>> {
        Ok(tree.begin()?.map(|(key, _)| key).collect())
    }

    fn page_kind(pool: &BufferPoolManager, page_id: PageId) -> BTreePageType {
        let handle = pool.fetch_page(page_id).unwrap();
        let kind = page_type_of(&handle.read_latch()[..]);
        pool.unpin_page(page_id, false);
        kind
    }

    fn first_separator(pool: &BufferPoolManager, page_id: PageId) -> i64 {
        let handle = pool.fetch_page(page_id).unwrap();
        let separator = {
            let guard = handle.read_latch();
            BTreeInternalPage::<i64>::new(&guard[..]).key_at(1)
        };
        pool.unpin_page(page_id, false);
        separator
    }

    fn first_child(pool: &BufferPoolManager, page_id: PageId) -> PageId {
        let handle = pool.fetch_page(page_id).unwrap();
        let child = {
            let guard = handle.read_latch();
            BTreeInternalPage::<i64>::new(&guard[..]).child_at(0)
        };
        pool.unpin_page(page_id, false);
        child
    }

    fn header_root(pool: &BufferPoolManager, name: &str) -> Option<PageId> {
        let handle = pool.fetch_page(HEADER_PAGE_ID).unwrap();
        let root = {
            let guard = handle.read_latch();
            HeaderPage::new(&guard[..]).get_record(name)
        };
        pool.unpin_page(HEADER_PAGE_ID, false);
        root
    }

    fn assert_no_dangling_pins(pool: &BufferPoolManager) {
        for page in 0..pool.disk_page_count().unwrap() {
            let pins = pool.pin_count(PageId(page)).unwrap_or(0);
            assert_eq!(pins, 0, "page {page} left pinned");
        }
    }

    #[test]
    fn test_empty_tree() -> Result<()> {
        let (tree, pool, _dir) = create_tree(16, 4, 4)?;

        assert!(tree.is_empty());
        assert_eq!(tree.root_page_id(), INVALID_PAGE_ID);
        assert_eq!(get(&tree, 1)?, None);
        tree.remove(&1)?;
        assert!(tree.begin()?.is_end());
        assert!(tree.begin_at(&5)?.is_end());
        tree.verify_integrity()?;
        assert_no_dangling_pins(&pool);

        Ok(())
    }

    #[test]
    fn test_single_leaf_insertion() -> Result<()> {
        // Out-of-order inserts that stay within one leaf.
        let (tree, pool, _dir) = create_tree(16, 4, 4)?;

        for key in [1i64, 4, 2, 3] {
            assert!(tree.insert(&key, rid(key))?);
        }
        assert!(!tree.is_empty());
        assert_eq!(page_kind(&pool, tree.root_page_id()), BTreePageType::Leaf);

        for key in 1..=4 {
            assert_eq!(get(&tree, key)?, Some(rid(key)));
        }
        assert_eq!(get(&tree, 5)?, None);
        assert_eq!(collect_keys(&tree)?, vec![1, 2, 3, 4]);

        tree.verify_integrity()?;
        assert_no_dangling_pins(&pool);
        Ok(())
    }

    #[test]
    fn test_duplicate_insert_rejected() -> Result<()> {
        let (tree, _pool, _dir) = create_tree(16, 4, 4)?;

        assert!(tree.insert(&7, rid(7))?);
        assert!(!tree.insert(&7, RecordId::new(PageId(999), 999))?);
        assert_eq!(get(&tree, 7)?, Some(rid(7)));

        Ok(())
    }

    #[test]
    fn test_leaf_split() -> Result<()> {
        // The fifth insert overflows the leaf and
        // grows an internal root with separator 3.
        let (tree, pool, _dir) = create_tree(16, 4, 4)?;

        for key in [1i64, 4, 2, 3, 5] {
            assert!(tree.insert(&key, rid(key))?);
        }

        let root = tree.root_page_id();
        assert_eq!(page_kind(&pool, root), BTreePageType::Internal);
        assert_eq!(first_separator(&pool, root), 3);
        assert_eq!(header_root(&pool, "test_index"), Some(root));

        for key in 1..=5 {
            assert_eq!(get(&tree, key)?, Some(rid(key)));
        }
        assert_eq!(collect_keys(&tree)?, vec![1, 2, 3, 4, 5]);

        tree.verify_integrity()?;
        assert_no_dangling_pins(&pool);
        Ok(())
    }

    #[test]
    fn test_cascading_split() -> Result<()> {
        // Sequential inserts with tiny fanout force
        // the root split to cascade.
        let (tree, pool, _dir) = create_tree(32, 3, 3)?;

        for key in 1i64..=10 {
            assert!(tree.insert(&key, rid(key))?);
        }

        let root = tree.root_page_id();
        assert_eq!(page_kind(&pool, root), BTreePageType::Internal);
        assert_eq!(
            page_kind(&pool, first_child(&pool, root)),
            BTreePageType::Internal
        );

        assert_eq!(collect_keys(&tree)?, (1..=10).collect::<Vec<_>>());
        tree.verify_integrity()?;
        assert_no_dangling_pins(&pool);
        Ok(())
    }

    #[test]
    fn test_random_insert_order() -> Result<()> {
        let (tree, pool, _dir) = create_tree(64, 4, 4)?;

        let mut keys: Vec<i64> = (1..=200).collect();
        keys.shuffle(&mut StdRng::seed_from_u64(7));
        for &key in &keys {
            assert!(tree.insert(&key, rid(key))?);
        }

        for key in 1..=200 {
            assert_eq!(get(&tree, key)?, Some(rid(key)));
        }
        assert_eq!(get(&tree, 0)?, None);
        assert_eq!(get(&tree, 201)?, None);
        assert_eq!(collect_keys(&tree)?, (1..=200).collect::<Vec<_>>());

        tree.verify_integrity()?;
        assert_no_dangling_pins(&pool);
        Ok(())
    }

    #[test]
    fn test_delete_to_empty() -> Result<()> {
        // Removing every key leaves an empty tree and
        // the header page reflects it.
        let (tree, pool, _dir) = create_tree(16, 4, 3)?;

        for key in 1i64..=5 {
            tree.insert(&key, rid(key))?;
        }
        for key in [3i64, 1, 5, 2, 4] {
            tree.remove(&key)?;
            tree.verify_integrity()?;
        }

        assert!(tree.is_empty());
        assert_eq!(tree.root_page_id(), INVALID_PAGE_ID);
        assert_eq!(header_root(&pool, "test_index"), Some(INVALID_PAGE_ID));
        for key in 1..=5 {
            assert_eq!(get(&tree, key)?, None);
        }
        assert!(tree.begin()?.is_end());
        assert_no_dangling_pins(&pool);

        Ok(())
    }

    #[test]
    fn test_leaf_redistribute_from_right() -> Result<()> {
        let (tree, pool, _dir) = create_tree(16, 4, 4)?;

        // Leaves [1,2] and [3,4,5,6] under separator 3.
        for key in 1i64..=6 {
            tree.insert(&key, rid(key))?;
        }
        // The leftmost leaf underflows; its only sibling is to the
        // right and rich enough to lend its first entry.
        tree.remove(&1)?;

        assert_eq!(first_separator(&pool, tree.root_page_id()), 4);
        assert_eq!(collect_keys(&tree)?, vec![2, 3, 4, 5, 6]);
        tree.verify_integrity()?;
        assert_no_dangling_pins(&pool);
        Ok(())
    }

    #[test]
    fn test_leaf_redistribute_from_left() -> Result<()> {
        let (tree, pool, _dir) = create_tree(16, 4, 4)?;

        // Leaves [3,4] / [5,6,7], then filling the left one: [1,2,3,4].
        for key in [3i64, 4, 5, 6, 7, 1, 2] {
            tree.insert(&key, rid(key))?;
        }
        tree.remove(&6)?;
        // The right leaf underflows; the left sibling lends its last
        // entry and the separator moves down to 4.
        tree.remove(&7)?;

        assert_eq!(first_separator(&pool, tree.root_page_id()), 4);
        assert_eq!(collect_keys(&tree)?, vec![1, 2, 3, 4, 5]);
        tree.verify_integrity()?;
        assert_no_dangling_pins(&pool);
        Ok(())
    }

    #[test]
    fn test_leaf_coalesce_collapses_root() -> Result<()> {
        let (tree, pool, _dir) = create_tree(16, 4, 3)?;

        // Leaves [1,2] and [3,4,5] under an internal root.
        for key in 1i64..=5 {
            tree.insert(&key, rid(key))?;
        }
        assert_eq!(page_kind(&pool, tree.root_page_id()), BTreePageType::Internal);

        // [2] + [3,4,5] fit in one page: merge, then the root with a
        // single child is replaced by that child.
        tree.remove(&1)?;

        assert_eq!(page_kind(&pool, tree.root_page_id()), BTreePageType::Leaf);
        assert_eq!(header_root(&pool, "test_index"), Some(tree.root_page_id()));
        assert_eq!(collect_keys(&tree)?, vec![2, 3, 4, 5]);
        tree.verify_integrity()?;
        assert_no_dangling_pins(&pool);
        Ok(())
    }

    #[test]
    fn test_remove_absent_key() -> Result<()> {
        let (tree, _pool, _dir) = create_tree(16, 4, 4)?;

        for key in 1i64..=4 {
            tree.insert(&key, rid(key))?;
        }
        tree.remove(&99)?;
        assert_eq!(collect_keys(&tree)?, vec![1, 2, 3, 4]);

        Ok(())
    }

    #[test]
    fn test_sequential_removal_deep_tree() -> Result<()> {
        let (tree, pool, _dir) = create_tree(64, 3, 3)?;

        for key in 1i64..=30 {
            tree.insert(&key, rid(key))?;
        }

        // Draining from the left edge walks every leftmost-page
        // rebalance path, including internal coalesces.
        for key in 1i64..=30 {
            tree.remove(&key)?;
            if key % 5 == 0 {
                tree.verify_integrity()?;
            }
            assert_eq!(get(&tree, key)?, None);
            if key < 30 {
                assert_eq!(get(&tree, key + 1)?, Some(rid(key + 1)));
            }
        }
        assert!(tree.is_empty());
        assert_no_dangling_pins(&pool);

        Ok(())
    }

    #[test]
    fn test_reverse_removal_deep_tree() -> Result<()> {
        let (tree, pool, _dir) = create_tree(64, 3, 3)?;

        for key in 1i64..=30 {
            tree.insert(&key, rid(key))?;
        }

        // Draining from the right edge exercises the left-sibling
        // redistribute and merge paths.
        for key in (1i64..=30).rev() {
            tree.remove(&key)?;
            if key % 5 == 0 {
                tree.verify_integrity()?;
            }
        }
        assert!(tree.is_empty());
        assert_no_dangling_pins(&pool);

        Ok(())
    }

    #[test]
    fn test_mixed_workload() -> Result<()> {
        let (tree, pool, _dir) = create_tree(64, 4, 4)?;
        let mut rng = StdRng::seed_from_u64(42);

        let mut keys: Vec<i64> = (1..=150).collect();
        keys.shuffle(&mut rng);
        for &key in &keys {
            tree.insert(&key, rid(key))?;
        }

        let mut evens: Vec<i64> = (1..=150).filter(|k| k % 2 == 0).collect();
        evens.shuffle(&mut rng);
        for &key in &evens {
            tree.remove(&key)?;
        }

        tree.verify_integrity()?;
        for key in 1..=150 {
            let expected = if key % 2 == 0 { None } else { Some(rid(key)) };
            assert_eq!(get(&tree, key)?, expected, "key {key}");
        }
        let odds: Vec<i64> = (1..=150).filter(|k| k % 2 == 1).collect();
        assert_eq!(collect_keys(&tree)?, odds);
        assert_no_dangling_pins(&pool);

        Ok(())
    }

    #[test]
    fn test_insert_after_delete_to_empty() -> Result<()> {
        let (tree, _pool, _dir) = create_tree(16, 4, 3)?;

        for key in 1i64..=5 {
            tree.insert(&key, rid(key))?;
        }
        for key in 1i64..=5 {
            tree.remove(&key)?;
        }
        assert!(tree.is_empty());

        // The tree starts over with a fresh root.
        for key in 10i64..=12 {
            assert!(tree.insert(&key, rid(key))?);
        }
        assert_eq!(collect_keys(&tree)?, vec![10, 11, 12]);
        tree.verify_integrity()?;

        Ok(())
    }

    #[test]
    fn test_persistence_across_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");

        {
            let disk = DiskManager::create(&path)?;
            let pool = BufferPoolManager::new(disk, BufferPoolConfig { pool_size: 64 });
            let tree: BPlusTree<i64> = BPlusTree::create(pool.clone(), "orders_pk", 4, 4)?;
            for key in 1i64..=50 {
                tree.insert(&key, rid(key))?;
            }
            pool.flush_all()?;
        }

        {
            let disk = DiskManager::open(&path)?;
            let pool = BufferPoolManager::new(disk, BufferPoolConfig { pool_size: 64 });
            let tree: BPlusTree<i64> = BPlusTree::open(pool.clone(), "orders_pk", 4, 4)?;
            for key in 1i64..=50 {
                assert_eq!(get(&tree, key)?, Some(rid(key)));
            }
            assert_eq!(collect_keys(&tree)?, (1..=50).collect::<Vec<_>>());
            tree.verify_integrity()?;
        }

        Ok(())
    }

    #[test]
    fn test_open_unknown_index_fails() -> Result<()> {
        let (_tree, pool, _dir) = create_tree(16, 4, 4)?;
        assert!(BPlusTree::<i64>::open(pool, "nonexistent", 4, 4).is_err());
        Ok(())
    }

    #[test]
    fn test_two_indexes_share_header_page() -> Result<()> {
        let dir = tempdir()?;
        let disk = DiskManager::create(&dir.path().join("test.db"))?;
        let pool = BufferPoolManager::new(disk, BufferPoolConfig { pool_size: 64 });

        let first: BPlusTree<i64> = BPlusTree::create(pool.clone(), "first", 4, 4)?;
        let second: BPlusTree<i64> = BPlusTree::create(pool.clone(), "second", 4, 4)?;
        assert!(BPlusTree::<i64>::create(pool.clone(), "first", 4, 4).is_err());

        for key in 1i64..=20 {
            first.insert(&key, rid(key))?;
            second.insert(&(key * 100), rid(key * 100))?;
        }

        assert_eq!(get(&first, 100)?, None);
        assert_eq!(get(&second, 100)?, Some(rid(100)));
        assert_eq!(header_root(&pool, "first"), Some(first.root_page_id()));
        assert_eq!(header_root(&pool, "second"), Some(second.root_page_id()));

        Ok(())
    }

    #[test]
    fn test_iterator_begin_at() -> Result<()> {
        let (tree, _pool, _dir) = create_tree(32, 4, 4)?;

        for key in (10i64..=100).step_by(10) {
            tree.insert(&key, rid(key))?;
        }

        // Between keys: lands on the next larger one.
        let keys: Vec<i64> = tree.begin_at(&35)?.map(|(k, _)| k).collect();
        assert_eq!(keys, vec![40, 50, 60, 70, 80, 90, 100]);

        // Exact hit starts at the key itself.
        let keys: Vec<i64> = tree.begin_at(&40)?.map(|(k, _)| k).collect();
        assert_eq!(keys, vec![40, 50, 60, 70, 80, 90, 100]);

        // Past the maximum: already exhausted.
        assert!(tree.begin_at(&1000)?.is_end());

        Ok(())
    }

    #[test]
    fn test_iterator_equality() -> Result<()> {
        let (tree, _pool, _dir) = create_tree(32, 4, 4)?;

        for key in 1i64..=10 {
            tree.insert(&key, rid(key))?;
        }

        {
            let a = tree.begin()?;
            let b = tree.begin()?;
            assert!(a == b);
            assert!(a != tree.end());
            assert!(tree.end() == tree.end());

            let c = tree.begin_at(&6)?;
            assert!(a != c);
            let d = tree.begin_at(&6)?;
            assert!(c == d);
        }

        let mut iter = tree.begin()?;
        assert_eq!(iter.current(), Some((1, rid(1))));
        for _ in 0..10 {
            iter.next();
        }
        assert!(iter.is_end());
        assert!(iter == tree.end());

        Ok(())
    }

    #[test]
    fn test_concurrent_readers_and_writer() -> Result<()> {
        // Sixteen readers race one writer inserting
        // 1..=1000 in random order; afterwards every key is visible and
        // the tree verifies clean.
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = tempdir()?;
        let disk = DiskManager::create(&dir.path().join("test.db"))?;
        let pool = BufferPoolManager::new(disk, BufferPoolConfig { pool_size: 256 });
        let tree: Arc<BPlusTree<i64>> =
            Arc::new(BPlusTree::create(pool.clone(), "test_index", 32, 32)?);

        let done = Arc::new(AtomicBool::new(false));
        let mut readers = Vec::new();
        for seed in 0..16u64 {
            let tree = tree.clone();
            let done = done.clone();
            readers.push(thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                let mut observed = 0u32;
                while !done.load(Ordering::Acquire) {
                    let key = rng.gen_range(1i64..=1000);
                    let mut result = Vec::new();
                    if tree.get_value(&key, &mut result).unwrap() {
                        assert_eq!(result[0], rid(key));
                        observed += 1;
                    }
                }
                observed
            }));
        }

        let writer = {
            let tree = tree.clone();
            thread::spawn(move || {
                let mut keys: Vec<i64> = (1..=1000).collect();
                keys.shuffle(&mut StdRng::seed_from_u64(99));
                for key in keys {
                    assert!(tree.insert(&key, rid(key)).unwrap());
                }
            })
        };

        writer.join().unwrap();
        done.store(true, Ordering::Release);
        for reader in readers {
            reader.join().unwrap();
        }

        for key in 1i64..=1000 {
            assert_eq!(get(&tree, key)?, Some(rid(key)));
        }
        assert_eq!(collect_keys(&tree)?, (1..=1000).collect::<Vec<_>>());
        tree.verify_integrity()?;
        assert_no_dangling_pins(&pool);

        Ok(())
    }

    #[test]
    fn test_concurrent_disjoint_writers() -> Result<()> {
        // Four writers insert disjoint key ranges; crabbing keeps their
        // splits from corrupting each other.
        let dir = tempdir()?;
        let disk = DiskManager::create(&dir.path().join("test.db"))?;
        let pool = BufferPoolManager::new(disk, BufferPoolConfig { pool_size: 256 });
        let tree: Arc<BPlusTree<i64>> =
            Arc::new(BPlusTree::create(pool.clone(), "test_index", 16, 16)?);

        let mut writers = Vec::new();
        for lane in 0..4i64 {
            let tree = tree.clone();
            writers.push(thread::spawn(move || {
                let mut keys: Vec<i64> = (0..250).map(|i| lane * 250 + i + 1).collect();
                keys.shuffle(&mut StdRng::seed_from_u64(lane as u64));
                for key in keys {
                    assert!(tree.insert(&key, rid(key)).unwrap());
                }
            }));
        }
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(collect_keys(&tree)?, (1..=1000).collect::<Vec<_>>());
        tree.verify_integrity()?;
        assert_no_dangling_pins(&pool);

        Ok(())
    }
}
