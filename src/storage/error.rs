//! Storage layer error types.

use crate::storage::page::PageId;
use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Buffer pool is full: all {pool_size} frames are pinned")]
    BufferPoolFull { pool_size: usize },

    #[error("Page not found: {0}")]
    PageNotFound(PageId),

    #[error("Page {page_id} is corrupted: {reason}")]
    Corrupted {
        page_id: PageId,
        reason: &'static str,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
