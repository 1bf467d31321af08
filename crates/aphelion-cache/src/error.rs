//! Cache error types

use thiserror::Error;

use crate::arena::EntryId;

/// Errors raised by the custody cache
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The entry pool is exhausted
    #[error("Entry pool exhausted (capacity {capacity})")]
    PoolExhausted { capacity: usize },

    /// No live entry behind this id
    #[error("No live cache entry {0}")]
    UnknownEntry(EntryId),
}

/// Result alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;
