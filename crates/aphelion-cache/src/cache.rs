//! The custody cache
//!
//! An indexed, pooled store of retained bundles implementing the custody
//! transfer handshake. Ingress ([`BundleCache::store_bundle`]) deduplicates
//! by bundle hash and opens an aggregate custody signal toward the previous
//! custodian; [`BundleCache::poll`] drives every entry's FSM against the
//! action-time index and hands ready bundles to the convergence-layer
//! egress; a received custody-accept record releases local custody.
//!
//! Downstream queues hold refcounted block references. The consumer reports
//! each reference back through [`BundleCache::recycle`], which clears
//! `LOCALLY_QUEUED` and re-runs the entry's FSM.

use std::collections::VecDeque;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use aphelion_codec::admin::{self, CustodyAccept};
use aphelion_codec::{self as codec, Bundle, PcfFlags, PrimaryBlock, WireVersion};
use aphelion_core::{EndpointId, StatusFlags};

use crate::arena::{EntryArena, EntryId};
use crate::entry::{CacheEntry, EntryFlags, EntryKind, EntryState};
use crate::error::{CacheError, CacheResult};
use crate::index::{BucketIndex, DestIndex, TimeIndex, bundle_hash, dacs_hash};

/// How bundles handed to egress are tracked afterwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeliveryPolicy {
    /// Send and forget; entries retry on a timer but carry no custody state
    BestEffort,
    /// Hold local custody until a remote custody-accept releases it
    #[default]
    CustodyTracking,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Local endpoint stamped into outbound custody signals
    pub local: EndpointId,
    pub delivery_policy: DeliveryPolicy,
    /// Entry pool capacity
    pub pool_size: usize,
    /// How long an open DACS keeps accepting appends, ms
    pub dacs_open_millis: u64,
    /// Sequence numbers per custody-accept payload
    pub max_seq_per_payload: usize,
    /// Retransmission timer for unacknowledged bundles, ms
    pub retry_interval_millis: u64,
    /// Egress references outstanding at once while the interface is up
    pub max_subq_depth: usize,
    /// Lifetime of outbound custody signals, seconds
    pub dacs_lifetime_secs: u64,
}

impl CacheConfig {
    /// Defaults for an agent at `local`
    pub fn new(local: EndpointId) -> Self {
        Self {
            local,
            delivery_policy: DeliveryPolicy::CustodyTracking,
            pool_size: 1024,
            dacs_open_millis: 1_000,
            max_seq_per_payload: 64,
            retry_interval_millis: 10_000,
            max_subq_depth: 128,
            dacs_lifetime_secs: 3_600,
        }
    }
}

/// Ingress description of a bundle being stored
#[derive(Debug, Clone, Copy)]
pub struct BundleInfo {
    /// Source endpoint of the bundle's flow
    pub flow_source: EndpointId,
    /// Creation sequence within the flow
    pub sequence: u64,
    /// Final destination
    pub destination: EndpointId,
    /// Custodian that handed the bundle over, when custody travels with it
    pub prev_custodian: Option<EndpointId>,
    /// Absolute expiry, Unix ms; 0 = never
    pub expiry_ms: u64,
}

/// Outcome of `store_bundle`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// A new entry was created
    Stored(EntryId),
    /// The bundle was already retained; its custody was re-acknowledged
    Duplicate,
}

/// A block reference handed to the convergence layer
#[derive(Debug, Clone)]
pub struct EgressItem {
    /// Entry to report back through `recycle`
    pub entry: EntryId,
    /// Serialized bundle
    pub bundle: Bytes,
}

/// Downstream egress queue fed by `poll`
///
/// `push` returns false when the queue cannot accept more work; the cache
/// stops draining until the next poll.
pub trait Egress {
    fn push(&mut self, item: EgressItem) -> bool;
}

/// Unbounded egress, accepting everything (tests, loopback)
impl Egress for Vec<EgressItem> {
    fn push(&mut self, item: EgressItem) -> bool {
        Vec::push(self, item);
        true
    }
}

enum FsmOutcome {
    Done,
    EgressFull,
}

/// The indexed custody cache
pub struct BundleCache {
    config: CacheConfig,
    arena: EntryArena,
    time_index: TimeIndex,
    dest_index: DestIndex,
    hash_index: BucketIndex<u32>,
    /// Entries awaiting FSM evaluation
    pending: VecDeque<EntryId>,
    /// Egress references currently outstanding
    queued: usize,
    /// Depth limit; zero while the interface is down
    egress_limit: usize,
    flags: StatusFlags,
}

impl BundleCache {
    pub fn new(config: CacheConfig) -> Self {
        let pool_size = config.pool_size;
        let egress_limit = config.max_subq_depth;
        Self {
            config,
            arena: EntryArena::with_capacity(pool_size),
            time_index: TimeIndex::new(),
            dest_index: DestIndex::new(),
            hash_index: BucketIndex::new(),
            pending: VecDeque::new(),
            queued: 0,
            egress_limit,
            flags: StatusFlags::empty(),
        }
    }

    /// Take and clear the accumulated condition flags
    pub fn take_flags(&mut self) -> StatusFlags {
        std::mem::take(&mut self.flags)
    }

    /// Live entries in the pool
    pub fn live_entries(&self) -> usize {
        self.arena.len()
    }

    /// Egress references currently outstanding
    pub fn queued_refs(&self) -> usize {
        self.queued
    }

    // ------------------------------------------------------------------
    // Ingress
    // ------------------------------------------------------------------

    /// Retain a bundle, taking local custody
    ///
    /// A bundle already retained is not stored again; its custody is
    /// re-acknowledged in case the earlier signal was lost.
    pub fn store_bundle(
        &mut self,
        block: Bytes,
        info: BundleInfo,
        now_ms: u64,
    ) -> CacheResult<StoreOutcome> {
        let hash = bundle_hash(info.flow_source, info.sequence);
        let duplicate = self
            .hash_index
            .bucket(hash)
            .iter()
            .any(|&id| match self.arena.get(id) {
                Some(entry) => entry.matches_bundle(info.flow_source, info.sequence),
                None => false,
            });
        if duplicate {
            trace!(flow = %info.flow_source, seq = info.sequence, "Duplicate bundle re-acknowledged");
            self.flags |= StatusFlags::DUPLICATES;
            self.acknowledge_previous(&info, now_ms);
            return Ok(StoreOutcome::Duplicate);
        }

        let mut entry = CacheEntry::bundle(
            block,
            info.flow_source,
            info.sequence,
            info.destination.node,
            info.prev_custodian,
            info.expiry_ms,
        );
        entry.hash = Some(hash);
        let Some(id) = self.arena.alloc(entry) else {
            self.flags |= StatusFlags::OUT_OF_MEMORY;
            return Err(CacheError::PoolExhausted {
                capacity: self.arena.capacity(),
            });
        };
        self.dest_index.insert(info.destination.node, id);
        self.hash_index.insert(hash, id);
        self.pending.push_back(id);
        self.flags |= StatusFlags::ACTIVITY | StatusFlags::LOCAL_CUSTODY;

        self.acknowledge_previous(&info, now_ms);
        Ok(StoreOutcome::Stored(id))
    }

    /// Open or extend the DACS owed to the bundle's previous custodian
    ///
    /// A full pool only degrades the acknowledgment (the custodian will
    /// retransmit); the stored bundle itself is not unwound.
    fn acknowledge_previous(&mut self, info: &BundleInfo, now_ms: u64) {
        if self.config.delivery_policy != DeliveryPolicy::CustodyTracking {
            return;
        }
        let Some(prev) = info.prev_custodian else {
            return;
        };
        if let Err(e) = self.update_dacs(info.flow_source, prev, info.sequence, now_ms) {
            warn!(error = %e, custodian = %prev, "Could not open custody signal");
        }
    }

    fn update_dacs(
        &mut self,
        flow: EndpointId,
        prev: EndpointId,
        seq: u64,
        now_ms: u64,
    ) -> CacheResult<()> {
        let hash = dacs_hash(flow, prev);
        let open = self.hash_index.bucket(hash).iter().copied().find(|&id| {
            self.arena
                .get(id)
                .is_some_and(|e| e.state == EntryState::GenerateDacs && e.matches_dacs(flow, prev))
        });

        if let Some(id) = open {
            let full = {
                let Some(entry) = self.arena.get_mut(id) else {
                    return Err(CacheError::UnknownEntry(id));
                };
                let EntryKind::Dacs { accept, .. } = &mut entry.kind else {
                    return Err(CacheError::UnknownEntry(id));
                };
                if accept.sequences.contains(&seq) {
                    // Appending twice would acknowledge twice; flag and keep.
                    self.flags |= StatusFlags::DUPLICATES;
                    false
                } else {
                    accept.sequences.push(seq);
                    accept.sequences.len() >= self.config.max_seq_per_payload
                }
            };
            if full {
                self.finalize_dacs(id);
            }
            return Ok(());
        }

        // No open signal toward this custodian: start one and keep it open
        // for appends until its action time.
        let mut entry = CacheEntry::dacs(flow, prev, seq);
        entry.hash = Some(hash);
        entry.action_time_ms = now_ms + self.config.dacs_open_millis;
        entry.flags |= EntryFlags::ACTION_TIME_WAIT;
        let action_time = entry.action_time_ms;
        let dest_node = entry.dest_node;

        let Some(id) = self.arena.alloc(entry) else {
            self.flags |= StatusFlags::OUT_OF_MEMORY;
            return Err(CacheError::PoolExhausted {
                capacity: self.arena.capacity(),
            });
        };
        self.hash_index.insert(hash, id);
        self.time_index.insert(action_time, id);
        self.dest_index.insert(dest_node, id);
        debug!(flow = %flow, custodian = %prev, "Opened custody signal");
        Ok(())
    }

    /// Close a DACS to further appends and queue it for egress
    fn finalize_dacs(&mut self, id: EntryId) {
        let Some(entry) = self.arena.get_mut(id) else {
            return;
        };
        if let Some(hash) = entry.hash.take() {
            self.hash_index.remove(hash, id);
        }
        if entry.flags.contains(EntryFlags::ACTION_TIME_WAIT) {
            entry.flags.remove(EntryFlags::ACTION_TIME_WAIT);
            self.time_index.remove(entry.action_time_ms, id);
        }
        entry.state = EntryState::QueuedForEgress;
        self.pending.push_back(id);
    }

    /// Consume a remote custody-accept record
    ///
    /// Clears local custody on every acknowledged bundle; entries with no
    /// outstanding egress reference are reclaimed immediately.
    pub fn handle_custody_accept(&mut self, accept: &CustodyAccept) -> usize {
        let mut released = 0;
        for &seq in &accept.sequences {
            let hash = bundle_hash(accept.flow_source, seq);
            let found = self.hash_index.bucket(hash).iter().copied().find(|&id| {
                self.arena
                    .get(id)
                    .is_some_and(|e| e.matches_bundle(accept.flow_source, seq))
            });
            let Some(id) = found else {
                continue;
            };
            let locally_queued = {
                let Some(entry) = self.arena.get_mut(id) else {
                    continue;
                };
                entry.flags.remove(EntryFlags::LOCAL_CUSTODY);
                entry.state = EntryState::Terminal;
                entry.flags.contains(EntryFlags::LOCALLY_QUEUED)
            };
            released += 1;
            if locally_queued {
                // The block reference downstream keeps the slot until recycle.
                continue;
            }
            self.remove_entry(id);
        }
        if released > 0 {
            self.flags |= StatusFlags::ACTIVITY;
        }
        debug!(flow = %accept.flow_source, released, "Custody released by remote accept");
        released
    }

    // ------------------------------------------------------------------
    // FSM
    // ------------------------------------------------------------------

    /// Wake due entries and drain the pending list through the FSM
    ///
    /// Draining stops early when the egress queue refuses work.
    pub fn poll(&mut self, now_ms: u64, egress: &mut dyn Egress) {
        for id in self.time_index.take_due(now_ms) {
            if let Some(entry) = self.arena.get_mut(id) {
                entry.flags.remove(EntryFlags::ACTION_TIME_WAIT);
                self.pending.push_back(id);
            }
        }

        while let Some(id) = self.pending.pop_front() {
            if let FsmOutcome::EgressFull = self.fsm_execute(id, now_ms, egress) {
                self.pending.push_front(id);
                break;
            }
        }
    }

    /// Re-evaluate entries whose destination masks to `dest & mask`
    pub fn route_up(&mut self, dest: u32, mask: u32) {
        for id in self.dest_index.matching(dest, mask) {
            self.pending.push_back(id);
        }
    }

    /// Raise or drop the egress interface
    pub fn intf_state_change(&mut self, up: bool) {
        self.egress_limit = if up { self.config.max_subq_depth } else { 0 };
        debug!(up, limit = self.egress_limit, "Interface state change");
    }

    /// Return a block reference the downstream queue has finished with
    pub fn recycle(&mut self, id: EntryId) {
        let Some(entry) = self.arena.get_mut(id) else {
            return;
        };
        entry.flags.remove(EntryFlags::LOCALLY_QUEUED);
        self.queued = self.queued.saturating_sub(1);
        match entry.state {
            EntryState::Terminal | EntryState::Expired => self.remove_entry(id),
            _ => self.pending.push_back(id),
        }
    }

    fn fsm_execute(&mut self, id: EntryId, now_ms: u64, egress: &mut dyn Egress) -> FsmOutcome {
        let Some(entry) = self.arena.get(id) else {
            return FsmOutcome::Done;
        };
        let state = entry.state;
        let waiting = entry.flags.contains(EntryFlags::ACTION_TIME_WAIT);
        let queued_ref = entry.flags.contains(EntryFlags::LOCALLY_QUEUED);
        let expired = entry.is_expired(now_ms);

        match state {
            EntryState::Idle => {
                if expired {
                    self.expire(id);
                    return FsmOutcome::Done;
                }
                if waiting {
                    return FsmOutcome::Done;
                }
                if self.egress_limit == 0 {
                    self.flags |= StatusFlags::ROUTE_NEEDED;
                    return FsmOutcome::Done;
                }
                if let Some(entry) = self.arena.get_mut(id) {
                    entry.state = EntryState::QueuedForEgress;
                }
                self.try_egress(id, now_ms, egress)
            }
            EntryState::GenerateDacs => {
                if waiting {
                    return FsmOutcome::Done;
                }
                // Open time ran out without filling the payload.
                self.finalize_dacs(id);
                FsmOutcome::Done
            }
            EntryState::QueuedForEgress => {
                if expired {
                    self.expire(id);
                    return FsmOutcome::Done;
                }
                self.try_egress(id, now_ms, egress)
            }
            EntryState::AwaitingCustodyAck => {
                if expired {
                    self.expire(id);
                    return FsmOutcome::Done;
                }
                if waiting || queued_ref {
                    return FsmOutcome::Done;
                }
                // Retransmission timer fired with no acknowledgment. Back
                // to idle: the idle dispatch decides whether egress is open
                // or the entry must wait on a route.
                if let Some(entry) = self.arena.get_mut(id) {
                    entry.state = EntryState::Idle;
                    if let EntryKind::Bundle { retries, .. } = &mut entry.kind {
                        *retries += 1;
                    }
                }
                self.pending.push_back(id);
                FsmOutcome::Done
            }
            EntryState::Expired => {
                if !queued_ref {
                    self.remove_entry(id);
                }
                FsmOutcome::Done
            }
            EntryState::Terminal => {
                if !queued_ref {
                    self.remove_entry(id);
                }
                FsmOutcome::Done
            }
        }
    }

    fn try_egress(&mut self, id: EntryId, now_ms: u64, egress: &mut dyn Egress) -> FsmOutcome {
        if self.egress_limit == 0 || self.queued >= self.egress_limit {
            return FsmOutcome::EgressFull;
        }

        enum Payload {
            Block(Bytes),
            Signal(CustodyAccept, EndpointId),
        }
        let payload = {
            let Some(entry) = self.arena.get(id) else {
                return FsmOutcome::Done;
            };
            if entry.flags.contains(EntryFlags::LOCALLY_QUEUED) {
                // Previous reference still downstream; wait for its recycle.
                return FsmOutcome::Done;
            }
            match &entry.kind {
                EntryKind::Bundle { .. } => Payload::Block(entry.block.clone()),
                EntryKind::Dacs { accept, destination } => {
                    Payload::Signal(accept.clone(), *destination)
                }
            }
        };
        let bundle = match payload {
            Payload::Block(block) => block,
            Payload::Signal(accept, destination) => {
                match self.build_dacs_bundle(&accept, destination, now_ms) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "Dropping unbuildable custody signal");
                        self.remove_entry(id);
                        return FsmOutcome::Done;
                    }
                }
            }
        };

        if !egress.push(EgressItem { entry: id, bundle }) {
            return FsmOutcome::EgressFull;
        }
        self.queued += 1;
        self.flags |= StatusFlags::ACTIVITY;

        let retry_at = now_ms + self.config.retry_interval_millis;
        let custody_tracking = self.config.delivery_policy == DeliveryPolicy::CustodyTracking;
        let mut retry_insert = None;
        if let Some(entry) = self.arena.get_mut(id) {
            entry.flags.insert(EntryFlags::LOCALLY_QUEUED);
            match entry.kind {
                EntryKind::Bundle { .. } => {
                    entry.state = if custody_tracking {
                        EntryState::AwaitingCustodyAck
                    } else {
                        EntryState::Idle
                    };
                    entry.action_time_ms = retry_at;
                    entry.flags.insert(EntryFlags::ACTION_TIME_WAIT);
                    retry_insert = Some(retry_at);
                }
                EntryKind::Dacs { .. } => {
                    entry.state = EntryState::Terminal;
                }
            }
        }
        if let Some(at) = retry_insert {
            self.time_index.insert(at, id);
        }
        trace!(entry = id, "Handed block to egress");
        FsmOutcome::Done
    }

    fn build_dacs_bundle(
        &self,
        accept: &CustodyAccept,
        destination: EndpointId,
        now_ms: u64,
    ) -> Result<Bytes, aphelion_codec::CodecError> {
        let payload = admin::encode_custody_accept(accept)?;
        let bundle = Bundle {
            primary: PrimaryBlock {
                flags: PcfFlags::ADMIN_RECORD | PcfFlags::SINGLETON,
                destination,
                source: self.config.local,
                report_to: self.config.local,
                custodian: self.config.local,
                creation_secs: now_ms / 1000,
                creation_seq: 0,
                lifetime_secs: self.config.dacs_lifetime_secs,
                fragment_offset: 0,
                total_adu_len: payload.len() as u64,
            },
            custody: None,
            integrity: None,
            payload: Bytes::from(payload),
            unknown: Vec::new(),
        };
        Ok(Bytes::from(codec::serialize(WireVersion::V7, &bundle)?.bytes))
    }

    fn expire(&mut self, id: EntryId) {
        let locally_queued = match self.arena.get_mut(id) {
            Some(entry) => {
                entry.state = EntryState::Expired;
                entry.flags.contains(EntryFlags::LOCALLY_QUEUED)
            }
            None => return,
        };
        debug!(entry = id, "Cache entry expired");
        if !locally_queued {
            self.remove_entry(id);
        }
    }

    /// Unlink an entry from every index and release its slot
    fn remove_entry(&mut self, id: EntryId) {
        let Some(entry) = self.arena.free(id) else {
            return;
        };
        self.dest_index.remove(entry.dest_node, id);
        if let Some(hash) = entry.hash {
            self.hash_index.remove(hash, id);
        }
        if entry.flags.contains(EntryFlags::ACTION_TIME_WAIT) {
            self.time_index.remove(entry.action_time_ms, id);
        }
    }
}
