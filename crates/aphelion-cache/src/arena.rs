//! Entry arena
//!
//! The cache keeps every retained bundle in a fixed pool of entries
//! addressed by stable indices. Indices stay valid until the entry is freed,
//! so the three ordered indexes can reference entries without pointers, and
//! freeing recycles the slot through a free list instead of the allocator.

use crate::entry::CacheEntry;

/// Stable index of a pooled entry
pub type EntryId = usize;

/// Fixed-capacity pool of cache entries
#[derive(Debug)]
pub struct EntryArena {
    slots: Vec<Option<CacheEntry>>,
    free: Vec<EntryId>,
    live: usize,
}

impl EntryArena {
    /// Create a pool of `capacity` slots
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
            live: 0,
        }
    }

    /// Total slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Live entries
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether no entries are live
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Claim a slot for `entry`; `None` when the pool is exhausted
    pub fn alloc(&mut self, entry: CacheEntry) -> Option<EntryId> {
        let id = self.free.pop()?;
        self.slots[id] = Some(entry);
        self.live += 1;
        Some(id)
    }

    /// Release a slot, returning its entry
    pub fn free(&mut self, id: EntryId) -> Option<CacheEntry> {
        let entry = self.slots.get_mut(id)?.take()?;
        self.free.push(id);
        self.live -= 1;
        Some(entry)
    }

    /// The entry behind `id`, if live
    pub fn get(&self, id: EntryId) -> Option<&CacheEntry> {
        self.slots.get(id)?.as_ref()
    }

    /// Mutable access to the entry behind `id`
    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut CacheEntry> {
        self.slots.get_mut(id)?.as_mut()
    }

    /// Iterate live entries
    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &CacheEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|e| (id, e)))
    }
}
