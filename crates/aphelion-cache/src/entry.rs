//! Cache entries
//!
//! One entry per retained bundle, holding a refcounted reference to the
//! serialized block, the per-entry FSM state, and the keys linking it into
//! the time, destination, and hash indexes. DACS entries are bundles the
//! cache itself is composing: their payload (the set of acknowledged
//! sequence numbers) stays open for appending until finalized.

use aphelion_codec::admin::CustodyAccept;
use aphelion_core::EndpointId;
use bitflags::bitflags;
use bytes::Bytes;

/// Per-entry FSM state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Retained, waiting for a route or a retry timer
    Idle,
    /// An open DACS accumulating sequence numbers
    GenerateDacs,
    /// Ready for the convergence-layer egress queue
    QueuedForEgress,
    /// Transmitted; custody acknowledgment outstanding
    AwaitingCustodyAck,
    /// Lifetime exceeded; to be removed
    Expired,
    /// Work finished; slot is reclaimed once no queue holds a reference
    Terminal,
}

bitflags! {
    /// Per-entry condition flags
    pub struct EntryFlags: u32 {
        /// The entry did productive work since last observed
        const ACTIVITY         = 0x01;
        /// This agent holds custody of the bundle
        const LOCAL_CUSTODY    = 0x02;
        /// The entry sleeps until its action time
        const ACTION_TIME_WAIT = 0x04;
        /// A downstream queue holds a reference to the block
        const LOCALLY_QUEUED   = 0x08;
    }
}

/// What the entry retains
#[derive(Debug, Clone)]
pub enum EntryKind {
    /// A stored bundle under (or awaiting release of) local custody
    Bundle {
        /// Source endpoint of the bundle's flow
        flow_source: EndpointId,
        /// Creation sequence within the flow
        sequence: u64,
        /// Custodian to acknowledge, when custody was accepted from one
        prev_custodian: Option<EndpointId>,
        /// Retransmissions so far
        retries: u32,
    },
    /// An open outbound DACS toward a previous custodian
    Dacs {
        /// The acknowledgment payload being accumulated
        accept: CustodyAccept,
        /// The custodian the signal is addressed to
        destination: EndpointId,
    },
}

/// One pooled cache entry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Refcounted serialized bundle; empty for DACS entries until built
    pub block: Bytes,
    pub state: EntryState,
    pub flags: EntryFlags,
    /// Earliest time the FSM should re-evaluate this entry, Unix ms
    pub action_time_ms: u64,
    /// Destination node, keying the destination index
    pub dest_node: u32,
    /// Key in the hash index while the entry is findable there
    pub hash: Option<u32>,
    /// Absolute expiry, Unix ms; 0 = never
    pub expiry_ms: u64,
    pub kind: EntryKind,
}

impl CacheEntry {
    /// Entry for a stored bundle
    pub fn bundle(
        block: Bytes,
        flow_source: EndpointId,
        sequence: u64,
        dest_node: u32,
        prev_custodian: Option<EndpointId>,
        expiry_ms: u64,
    ) -> Self {
        Self {
            block,
            state: EntryState::Idle,
            flags: EntryFlags::LOCAL_CUSTODY | EntryFlags::ACTIVITY,
            action_time_ms: 0,
            dest_node,
            hash: None,
            expiry_ms,
            kind: EntryKind::Bundle {
                flow_source,
                sequence,
                prev_custodian,
                retries: 0,
            },
        }
    }

    /// Entry for an open outbound DACS
    pub fn dacs(flow_source: EndpointId, destination: EndpointId, first_seq: u64) -> Self {
        Self {
            block: Bytes::new(),
            state: EntryState::GenerateDacs,
            flags: EntryFlags::ACTIVITY,
            action_time_ms: 0,
            dest_node: destination.node,
            hash: None,
            expiry_ms: 0,
            kind: EntryKind::Dacs {
                accept: CustodyAccept {
                    flow_source,
                    sequences: vec![first_seq],
                },
                destination,
            },
        }
    }

    /// Whether the entry's lifetime has passed at `now_ms`
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiry_ms != 0 && self.expiry_ms <= now_ms
    }

    /// Whether this bundle entry matches a `(flow, sequence)` lookup key
    pub fn matches_bundle(&self, flow: EndpointId, seq: u64) -> bool {
        matches!(
            &self.kind,
            EntryKind::Bundle { flow_source, sequence, .. }
                if *flow_source == flow && *sequence == seq
        )
    }

    /// Whether this open DACS matches a `(flow, previous custodian)` key
    pub fn matches_dacs(&self, flow: EndpointId, prev: EndpointId) -> bool {
        matches!(
            &self.kind,
            EntryKind::Dacs { accept, destination }
                if accept.flow_source == flow && *destination == prev
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_entry_defaults() {
        let entry = CacheEntry::bundle(
            Bytes::from_static(b"blk"),
            EndpointId::new(9, 1),
            44,
            3,
            Some(EndpointId::new(8, 1)),
            5_000,
        );
        assert_eq!(entry.state, EntryState::Idle);
        assert!(entry.flags.contains(EntryFlags::LOCAL_CUSTODY));
        assert!(entry.matches_bundle(EndpointId::new(9, 1), 44));
        assert!(!entry.matches_bundle(EndpointId::new(9, 1), 45));
        assert!(!entry.is_expired(4_999));
        assert!(entry.is_expired(5_000));
    }

    #[test]
    fn test_dacs_entry_matches_by_flow_and_custodian() {
        let flow = EndpointId::new(9, 1);
        let prev = EndpointId::new(8, 1);
        let entry = CacheEntry::dacs(flow, prev, 7);

        assert_eq!(entry.state, EntryState::GenerateDacs);
        assert!(entry.matches_dacs(flow, prev));
        assert!(!entry.matches_dacs(flow, EndpointId::new(7, 1)));
        assert!(!entry.matches_bundle(flow, 7));
    }

    #[test]
    fn test_zero_expiry_never_expires() {
        let entry = CacheEntry::bundle(Bytes::new(), EndpointId::new(1, 1), 0, 2, None, 0);
        assert!(!entry.is_expired(u64::MAX));
    }
}
