//! # Aphelion Storage
//!
//! The storage plane the bundle agent stands on: durable FIFO byte-queues
//! with random access to records that have been dequeued but not yet
//! released. The engine owns three queues per channel (data, payload, DACS)
//! and never sees past this contract, so queue implementations can live
//! anywhere from RAM to flash.
//!
//! A record's [`StorageId`] stays valid from the moment `dequeue` hands it
//! out until `relinquish` releases it; retransmission works by `retrieve`-ing
//! the record again by id.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

pub mod memory;

pub use memory::{MemoryQueue, MemoryStoreProvider};

/// Handle to a stored record
pub type StorageId = u64;

/// How long a storage call may block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Do not block
    Poll,
    /// Block up to the given duration
    Wait(Duration),
    /// Block until the operation can complete
    Forever,
}

impl Timeout {
    /// Convenience constructor from whole seconds
    pub fn from_secs(secs: u64) -> Self {
        Timeout::Wait(Duration::from_secs(secs))
    }
}

/// Storage plane errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The operation could not complete within its timeout
    #[error("Storage operation timed out")]
    Timeout,

    /// No live record carries this id
    #[error("Storage id {0} is not live")]
    InvalidId(StorageId),

    /// The record is larger than the queue accepts
    #[error("Record of {size} bytes exceeds queue limit {max}")]
    RecordTooLarge { size: usize, max: usize },
}

/// A dequeued record
#[derive(Debug, Clone)]
pub struct StoredRecord {
    /// Id for later `retrieve`/`relinquish`
    pub sid: StorageId,
    /// The record bytes, header and body contiguous
    pub bytes: Bytes,
}

/// A durable FIFO byte-queue
///
/// `enqueue` appends `header ‖ body` atomically as one record. `dequeue`
/// removes the head but keeps the record retrievable by id until
/// `relinquish`; a timeout on `dequeue` is a normal outcome, not an error.
pub trait BundleQueue: Send + Sync {
    /// Append one record, blocking while the queue is full
    fn enqueue(&self, header: &[u8], body: &[u8], timeout: Timeout) -> Result<(), StoreError>;

    /// Remove and return the head record; `None` on timeout
    fn dequeue(&self, timeout: Timeout) -> Result<Option<StoredRecord>, StoreError>;

    /// Re-read a dequeued record by id without releasing it
    fn retrieve(&self, sid: StorageId, timeout: Timeout) -> Result<Bytes, StoreError>;

    /// Release a record; its id becomes invalid
    fn relinquish(&self, sid: StorageId) -> Result<(), StoreError>;

    /// Number of records currently waiting in the queue
    fn count(&self) -> u64;
}

/// Factory for queues of one storage backend
pub trait StoreProvider: Send + Sync {
    /// Allocate a queue holding up to `capacity` records
    fn create(&self, capacity: usize) -> Arc<dyn BundleQueue>;

    /// Release a queue and discard its contents
    fn destroy(&self, queue: Arc<dyn BundleQueue>) {
        drop(queue);
    }
}
