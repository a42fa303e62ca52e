//! silodb storage core: a fixed-size buffer pool over page-oriented
//! disk storage, and a concurrent B+tree index built on top of it.

pub mod access;
pub mod storage;

pub use access::{BPlusTree, IndexKey, RecordId, TreeIterator};
pub use storage::{
    BufferPoolConfig, BufferPoolManager, DiskManager, PageId, StorageError, INVALID_PAGE_ID,
    PAGE_SIZE,
};
