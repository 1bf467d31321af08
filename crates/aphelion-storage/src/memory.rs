//! In-memory queue implementation
//!
//! Suitable for testing and for agents whose storage durability requirements
//! end at process lifetime. Enqueue blocks while the queue is at capacity,
//! dequeue blocks while it is empty, both bounded by the caller's timeout.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::{BundleQueue, StorageId, StoreError, StoredRecord, StoreProvider, Timeout};

struct QueueState {
    /// Records waiting to be dequeued
    queue: VecDeque<(StorageId, Bytes)>,
    /// Dequeued records not yet relinquished
    outstanding: HashMap<StorageId, Bytes>,
    /// Next id to hand out
    next_sid: StorageId,
}

/// Bounded in-memory FIFO of records
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl MemoryQueue {
    /// Create a queue holding up to `capacity` records
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                outstanding: HashMap::new(),
                next_sid: 1,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Records dequeued but not yet relinquished
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding.len()
    }
}

/// Wait on `condvar` until `ready` holds, bounded by `timeout`.
///
/// Returns false if the deadline passed with `ready` still false.
fn wait_until<F>(
    condvar: &Condvar,
    guard: &mut parking_lot::MutexGuard<'_, QueueState>,
    timeout: Timeout,
    mut ready: F,
) -> bool
where
    F: FnMut(&QueueState) -> bool,
{
    match timeout {
        Timeout::Poll => ready(guard),
        Timeout::Forever => {
            while !ready(guard) {
                condvar.wait(guard);
            }
            true
        }
        Timeout::Wait(limit) => {
            let deadline = Instant::now() + limit;
            while !ready(guard) {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                condvar.wait_for(guard, deadline - now);
            }
            true
        }
    }
}

impl BundleQueue for MemoryQueue {
    fn enqueue(&self, header: &[u8], body: &[u8], timeout: Timeout) -> Result<(), StoreError> {
        let capacity = self.capacity;
        let mut state = self.state.lock();
        if !wait_until(&self.not_full, &mut state, timeout, |s| {
            s.queue.len() < capacity
        }) {
            return Err(StoreError::Timeout);
        }

        let mut record = BytesMut::with_capacity(header.len() + body.len());
        record.extend_from_slice(header);
        record.extend_from_slice(body);

        let sid = state.next_sid;
        state.next_sid += 1;
        state.queue.push_back((sid, record.freeze()));
        trace!(sid, len = header.len() + body.len(), "Enqueued record");

        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    fn dequeue(&self, timeout: Timeout) -> Result<Option<StoredRecord>, StoreError> {
        let mut state = self.state.lock();
        if !wait_until(&self.not_empty, &mut state, timeout, |s| !s.queue.is_empty()) {
            return Ok(None);
        }
        let Some((sid, bytes)) = state.queue.pop_front() else {
            return Ok(None);
        };
        state.outstanding.insert(sid, bytes.clone());
        trace!(sid, "Dequeued record");

        drop(state);
        self.not_full.notify_one();
        Ok(Some(StoredRecord { sid, bytes }))
    }

    fn retrieve(&self, sid: StorageId, _timeout: Timeout) -> Result<Bytes, StoreError> {
        let state = self.state.lock();
        state
            .outstanding
            .get(&sid)
            .cloned()
            .ok_or(StoreError::InvalidId(sid))
    }

    fn relinquish(&self, sid: StorageId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state
            .outstanding
            .remove(&sid)
            .map(|_| trace!(sid, "Relinquished record"))
            .ok_or(StoreError::InvalidId(sid))
    }

    fn count(&self) -> u64 {
        self.state.lock().queue.len() as u64
    }
}

/// Factory for in-memory queues
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStoreProvider;

impl StoreProvider for MemoryStoreProvider {
    fn create(&self, capacity: usize) -> Arc<dyn BundleQueue> {
        Arc::new(MemoryQueue::new(capacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = MemoryQueue::new(8);
        queue.enqueue(b"h1", b"first", Timeout::Poll).unwrap();
        queue.enqueue(b"h2", b"second", Timeout::Poll).unwrap();

        let a = queue.dequeue(Timeout::Poll).unwrap().unwrap();
        let b = queue.dequeue(Timeout::Poll).unwrap().unwrap();
        assert_eq!(&a.bytes[..], b"h1first");
        assert_eq!(&b.bytes[..], b"h2second");
        assert_ne!(a.sid, b.sid);
    }

    #[test]
    fn test_poll_on_empty_is_timeout_not_error() {
        let queue = MemoryQueue::new(8);
        assert!(queue.dequeue(Timeout::Poll).unwrap().is_none());
        assert!(
            queue
                .dequeue(Timeout::Wait(Duration::from_millis(10)))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_retrieve_until_relinquish() {
        let queue = MemoryQueue::new(8);
        queue.enqueue(b"", b"payload", Timeout::Poll).unwrap();

        let record = queue.dequeue(Timeout::Poll).unwrap().unwrap();
        assert_eq!(queue.count(), 0);
        assert_eq!(queue.outstanding(), 1);

        // Still retrievable, any number of times.
        assert_eq!(
            &queue.retrieve(record.sid, Timeout::Poll).unwrap()[..],
            b"payload"
        );
        assert_eq!(
            &queue.retrieve(record.sid, Timeout::Poll).unwrap()[..],
            b"payload"
        );

        queue.relinquish(record.sid).unwrap();
        assert_eq!(
            queue.retrieve(record.sid, Timeout::Poll),
            Err(StoreError::InvalidId(record.sid))
        );
        assert_eq!(
            queue.relinquish(record.sid),
            Err(StoreError::InvalidId(record.sid))
        );
    }

    #[test]
    fn test_enqueue_blocks_at_capacity() {
        let queue = MemoryQueue::new(1);
        queue.enqueue(b"", b"one", Timeout::Poll).unwrap();
        assert_eq!(
            queue.enqueue(b"", b"two", Timeout::Poll),
            Err(StoreError::Timeout)
        );
        assert_eq!(
            queue.enqueue(b"", b"two", Timeout::Wait(Duration::from_millis(10))),
            Err(StoreError::Timeout)
        );
    }

    #[test]
    fn test_blocked_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(MemoryQueue::new(4));
        let reader = Arc::clone(&queue);

        let handle = thread::spawn(move || {
            reader
                .dequeue(Timeout::Wait(Duration::from_secs(5)))
                .unwrap()
                .expect("enqueue should wake the reader")
        });

        thread::sleep(Duration::from_millis(20));
        queue.enqueue(b"", b"wake up", Timeout::Poll).unwrap();

        let record = handle.join().unwrap();
        assert_eq!(&record.bytes[..], b"wake up");
    }

    #[test]
    fn test_blocked_enqueue_wakes_on_dequeue() {
        let queue = Arc::new(MemoryQueue::new(1));
        queue.enqueue(b"", b"head", Timeout::Poll).unwrap();

        let writer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            writer.enqueue(b"", b"tail", Timeout::Wait(Duration::from_secs(5)))
        });

        thread::sleep(Duration::from_millis(20));
        let head = queue.dequeue(Timeout::Poll).unwrap().unwrap();
        assert_eq!(&head.bytes[..], b"head");

        handle.join().unwrap().unwrap();
        assert_eq!(queue.count(), 1);
    }
}
