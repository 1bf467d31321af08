//! The three cache indexes
//!
//! Ordered maps over entry ids: by action time (driving `poll`), by
//! destination node (driving route-up re-evaluation), and by a salted
//! CRC-32/Castagnoli hash (driving duplicate detection and DACS lookup).
//! Hash collisions are resolved by scanning the bucket's collision list
//! against the actual tuple.

use std::collections::BTreeMap;

use aphelion_codec::integrity::crc32c;
use aphelion_core::EndpointId;

use crate::arena::EntryId;

/// Salt distinguishing bundle-lookup hashes
const SALT_BUNDLE: u32 = 0x9E37_79B9;
/// Salt distinguishing DACS-lookup hashes
const SALT_DACS: u32 = 0x85EB_CA6B;

/// Hash key for a stored bundle: `(flow source, sequence)`
pub fn bundle_hash(flow: EndpointId, sequence: u64) -> u32 {
    let mut buf = [0u8; 20];
    buf[..4].copy_from_slice(&SALT_BUNDLE.to_be_bytes());
    buf[4..8].copy_from_slice(&flow.node.to_be_bytes());
    buf[8..12].copy_from_slice(&flow.service.to_be_bytes());
    buf[12..].copy_from_slice(&sequence.to_be_bytes());
    crc32c(&buf)
}

/// Hash key for an open DACS: `(flow source, previous custodian)`
pub fn dacs_hash(flow: EndpointId, prev_custodian: EndpointId) -> u32 {
    let mut buf = [0u8; 20];
    buf[..4].copy_from_slice(&SALT_DACS.to_be_bytes());
    buf[4..8].copy_from_slice(&flow.node.to_be_bytes());
    buf[8..12].copy_from_slice(&flow.service.to_be_bytes());
    buf[12..16].copy_from_slice(&prev_custodian.node.to_be_bytes());
    buf[16..].copy_from_slice(&prev_custodian.service.to_be_bytes());
    crc32c(&buf)
}

/// Ordered multimap from a key to entry ids
#[derive(Debug, Default)]
pub struct BucketIndex<K: Ord + Copy> {
    buckets: BTreeMap<K, Vec<EntryId>>,
}

impl<K: Ord + Copy> BucketIndex<K> {
    pub fn new() -> Self {
        Self {
            buckets: BTreeMap::new(),
        }
    }

    /// Link `id` under `key`
    pub fn insert(&mut self, key: K, id: EntryId) {
        self.buckets.entry(key).or_default().push(id);
    }

    /// Unlink `id` from `key`
    pub fn remove(&mut self, key: K, id: EntryId) {
        if let Some(bucket) = self.buckets.get_mut(&key) {
            bucket.retain(|&other| other != id);
            if bucket.is_empty() {
                self.buckets.remove(&key);
            }
        }
    }

    /// The collision list under `key`
    pub fn bucket(&self, key: K) -> &[EntryId] {
        self.buckets.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of distinct keys
    pub fn keys(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no entries are linked
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Index by action time, Unix ms
#[derive(Debug, Default)]
pub struct TimeIndex {
    inner: BucketIndex<u64>,
}

impl TimeIndex {
    pub fn new() -> Self {
        Self {
            inner: BucketIndex::new(),
        }
    }

    pub fn insert(&mut self, at_ms: u64, id: EntryId) {
        self.inner.insert(at_ms, id);
    }

    pub fn remove(&mut self, at_ms: u64, id: EntryId) {
        self.inner.remove(at_ms, id);
    }

    /// Drain every entry whose action time is at or before `now_ms`
    pub fn take_due(&mut self, now_ms: u64) -> Vec<EntryId> {
        let mut due = Vec::new();
        let later = self.inner.buckets.split_off(&(now_ms + 1));
        for (_, mut bucket) in std::mem::replace(&mut self.inner.buckets, later) {
            due.append(&mut bucket);
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Index by destination node
#[derive(Debug, Default)]
pub struct DestIndex {
    inner: BucketIndex<u32>,
}

impl DestIndex {
    pub fn new() -> Self {
        Self {
            inner: BucketIndex::new(),
        }
    }

    pub fn insert(&mut self, node: u32, id: EntryId) {
        self.inner.insert(node, id);
    }

    pub fn remove(&mut self, node: u32, id: EntryId) {
        self.inner.remove(node, id);
    }

    /// Entries whose destination masks to `dest & mask`
    pub fn matching(&self, dest: u32, mask: u32) -> Vec<EntryId> {
        let start = dest & mask;
        let end = start | !mask;
        self.inner
            .buckets
            .range(start..=end)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }
}
