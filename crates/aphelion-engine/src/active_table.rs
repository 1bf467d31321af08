//! The active table
//!
//! A fixed ring tracking every custody-bearing bundle this channel has
//! emitted and not yet seen acknowledged. Custody IDs are issued
//! monotonically; CID `c` lives in slot `c mod A`, so the span of
//! outstanding IDs can never exceed the table size. `oldest_cid` is advanced
//! lazily: acknowledgment vacates a slot immediately, but the front of the
//! window only moves when the retransmission scan walks over it.

use aphelion_storage::StorageId;

/// One ring slot
#[derive(Debug, Clone, Copy, Default)]
pub struct Slot {
    /// Storage record of the in-flight bundle; `None` when vacant
    pub sid: Option<StorageId>,
    /// When the bundle was last transmitted, Unix seconds
    pub last_retx_secs: u64,
}

/// Ring of in-flight custody entries
#[derive(Debug)]
pub struct ActiveTable {
    slots: Vec<Slot>,
    /// Lowest custody ID that may still be outstanding
    oldest: u64,
    /// Next custody ID to issue
    current: u64,
}

impl ActiveTable {
    /// Create a table of `size` slots
    pub fn new(size: usize) -> Self {
        Self {
            slots: vec![Slot::default(); size],
            oldest: 0,
            current: 0,
        }
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Lowest possibly-outstanding custody ID
    pub fn oldest_cid(&self) -> u64 {
        self.oldest
    }

    /// Next custody ID to issue
    pub fn current_cid(&self) -> u64 {
        self.current
    }

    /// Custody IDs in flight
    pub fn active_span(&self) -> u64 {
        self.current - self.oldest
    }

    /// Whether issuing another custody ID would exceed the ring
    pub fn is_full(&self) -> bool {
        self.active_span() >= self.slots.len() as u64
    }

    /// Whether `cid` falls inside the outstanding window
    pub fn in_window(&self, cid: u64) -> bool {
        (self.oldest..self.current).contains(&cid)
    }

    fn index(&self, cid: u64) -> usize {
        (cid % self.slots.len() as u64) as usize
    }

    /// The occupant of `cid`'s slot as `(storage id, last transmit time)`
    pub fn get(&self, cid: u64) -> Option<(StorageId, u64)> {
        let slot = self.slots[self.index(cid)];
        slot.sid.map(|sid| (sid, slot.last_retx_secs))
    }

    /// Occupy the slot of `cid`
    pub fn occupy(&mut self, cid: u64, sid: StorageId, now_secs: u64) {
        let index = self.index(cid);
        self.slots[index] = Slot {
            sid: Some(sid),
            last_retx_secs: now_secs,
        };
    }

    /// Refresh the retransmission time of `cid`
    pub fn touch(&mut self, cid: u64, now_secs: u64) {
        let index = self.index(cid);
        self.slots[index].last_retx_secs = now_secs;
    }

    /// Vacate the slot of `cid`, returning the storage id it held
    pub fn vacate(&mut self, cid: u64) -> Option<StorageId> {
        let index = self.index(cid);
        self.slots[index].sid.take()
    }

    /// Issue the next custody ID, occupying its slot
    ///
    /// The caller must have made room first; `is_full` must be false.
    pub fn issue(&mut self, sid: StorageId, now_secs: u64) -> u64 {
        debug_assert!(!self.is_full());
        let cid = self.current;
        self.occupy(cid, sid, now_secs);
        self.current += 1;
        cid
    }

    /// Move `oldest` forward past vacant slots
    pub fn advance_oldest(&mut self) {
        while self.oldest < self.current && self.get(self.oldest).is_none() {
            self.oldest += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_is_monotonic() {
        let mut table = ActiveTable::new(4);
        assert_eq!(table.issue(10, 0), 0);
        assert_eq!(table.issue(11, 0), 1);
        assert_eq!(table.issue(12, 0), 2);
        assert_eq!(table.active_span(), 3);
        assert!(!table.is_full());

        table.issue(13, 0);
        assert!(table.is_full());
    }

    #[test]
    fn test_window_invariant_holds() {
        let mut table = ActiveTable::new(4);
        for sid in 0..4 {
            table.issue(sid, 0);
            assert!(table.active_span() <= table.size() as u64);
        }
        // Acknowledge the middle; span unchanged until the front clears.
        table.vacate(1);
        assert_eq!(table.active_span(), 4);
        table.advance_oldest();
        assert_eq!(table.oldest_cid(), 0);

        table.vacate(0);
        table.advance_oldest();
        // 0 and 1 both vacant, 2 still live.
        assert_eq!(table.oldest_cid(), 2);
        assert_eq!(table.active_span(), 2);
    }

    #[test]
    fn test_slot_reuse_after_wraparound() {
        let mut table = ActiveTable::new(2);
        table.issue(10, 0);
        table.issue(11, 0);
        table.vacate(0);
        table.vacate(1);
        table.advance_oldest();

        let cid = table.issue(20, 5);
        assert_eq!(cid, 2);
        // CID 2 shares a slot index with CID 0.
        assert_eq!(table.get(2), Some((20, 5)));
    }

    #[test]
    fn test_touch_updates_retx() {
        let mut table = ActiveTable::new(2);
        table.issue(10, 100);
        table.touch(0, 250);
        assert_eq!(table.get(0), Some((10, 250)));
    }
}
