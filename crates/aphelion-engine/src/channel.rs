//! The per-channel protocol engine
//!
//! A channel binds one local endpoint and runs the four bundle operations:
//!
//! - [`Channel::store`] originates bundles from application payloads
//! - [`Channel::load`] emits the next serialized bundle for the convergence
//!   layer, preferring pending custody signals, then due retransmissions,
//!   then fresh data
//! - [`Channel::process`] takes an inbound serialized bundle and delivers,
//!   forwards, or consumes it
//! - [`Channel::accept`] hands a delivered payload to the application
//!
//! Three critical regions guard channel state, never nested: the outbound
//! template, the open DACS accumulators, and the active table (a mutex
//! paired with a condvar so `load` callers blocked on wrap wake when
//! acknowledgments drain).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, instrument, trace, warn};

use aphelion_codec::{
    self as codec, BlockFlags, Bundle, CidField, CustodyBlock, IntegrityBlock, ParsedBundle,
    PcfFlags, PrimaryBlock, admin,
};
use aphelion_core::{ChannelCounters, ChannelStats, Clock, EndpointId, StatusFlags};
use aphelion_storage::{BundleQueue, StorageId, StoreProvider, Timeout};

use crate::active_table::ActiveTable;
use crate::config::{ChannelConfig, ChannelOption, ChannelOptionKey, WrapResponse};
use crate::dacs::{DacsAccumulator, DacsSet};
use crate::error::{ChannelError, ChannelResult};

/// Delivery record header: custody flag byte plus payload length.
const DELIVERY_HEADER_LEN: usize = 9;

/// Prune the duplicate-detection map past this many entries.
const SEEN_PRUNE_THRESHOLD: usize = 4096;

/// Key identifying one received bundle for duplicate detection
type BundleKey = (EndpointId, u64, u64, u64);

/// Result of `store`
#[derive(Debug, Clone, Copy)]
pub struct Stored {
    /// Bundles enqueued (more than one when the payload was fragmented)
    pub bundles: usize,
    pub flags: StatusFlags,
}

/// Result of `load`
#[derive(Debug, Clone)]
pub struct Loaded {
    /// Serialized bundle ready for the convergence layer
    pub bytes: Vec<u8>,
    pub flags: StatusFlags,
}

/// What `process` did with the bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Payload enqueued for local delivery
    Delivered,
    /// Bundle rewritten and enqueued for onward transmission
    Forwarded,
    /// Aggregate custody signal consumed; count of slots released
    AcknowledgedCustody(u64),
}

/// Result of `process`
#[derive(Debug, Clone, Copy)]
pub struct Processed {
    pub action: Disposition,
    pub flags: StatusFlags,
}

/// A payload handed to the application by `accept`
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: Bytes,
    /// Whether the sender requested custody transfer
    pub request_custody: bool,
    pub flags: StatusFlags,
}

/// Outbound origination state, guarded by the data-bundle lock
struct Outbound {
    template: Bundle,
    /// Creation sequence of the next originated bundle
    sequence: u64,
}

/// A custody bundle dequeued from the data store but not yet placed in the
/// active table (the table was full under the BLOCK wrap policy).
struct Staged {
    sid: StorageId,
    bytes: Vec<u8>,
    cid: CidField,
}

/// Active table plus head-of-line staging, guarded by the signal mutex
struct TableState {
    table: ActiveTable,
    staged: Option<Staged>,
}

/// One protocol channel
pub struct Channel {
    config: Mutex<ChannelConfig>,
    outbound: Mutex<Outbound>,
    dacs: Mutex<DacsSet>,
    table: Mutex<TableState>,
    table_signal: Condvar,
    data_store: Arc<dyn BundleQueue>,
    payload_store: Arc<dyn BundleQueue>,
    dacs_store: Arc<dyn BundleQueue>,
    clock: Arc<dyn Clock>,
    counters: ChannelCounters,
    seen: DashMap<BundleKey, u64>,
}

fn build_template(cfg: &ChannelConfig) -> Bundle {
    let mut flags = PcfFlags::SINGLETON;
    if cfg.request_custody {
        flags |= PcfFlags::CUSTODY_REQUEST;
    }
    Bundle {
        primary: PrimaryBlock {
            flags,
            destination: cfg.destination,
            source: cfg.local,
            report_to: cfg.report_to,
            custodian: cfg.custodian,
            creation_secs: 0,
            creation_seq: 0,
            lifetime_secs: cfg.lifetime_secs,
            fragment_offset: 0,
            total_adu_len: 0,
        },
        custody: cfg.request_custody.then_some(CustodyBlock {
            custody_id: 0,
            custodian: cfg.custodian,
        }),
        integrity: None,
        payload: Bytes::new(),
        unknown: Vec::new(),
    }
}

fn delivery_header(request_custody: bool, payload_len: usize) -> [u8; DELIVERY_HEADER_LEN] {
    let mut header = [0u8; DELIVERY_HEADER_LEN];
    header[0] = request_custody as u8;
    header[1..].copy_from_slice(&(payload_len as u64).to_be_bytes());
    header
}

fn parse_delivery(record: &Bytes) -> ChannelResult<(bool, Bytes)> {
    if record.len() < DELIVERY_HEADER_LEN {
        return Err(ChannelError::Param("delivery record truncated"));
    }
    let request_custody = record[0] != 0;
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&record[1..DELIVERY_HEADER_LEN]);
    let len = u64::from_be_bytes(len_bytes) as usize;
    if record.len() != DELIVERY_HEADER_LEN + len {
        return Err(ChannelError::Param("delivery record length mismatch"));
    }
    Ok((request_custody, record.slice(DELIVERY_HEADER_LEN..)))
}

impl Channel {
    /// Open a channel, creating its three storage queues from `provider`
    pub fn open(
        config: ChannelConfig,
        provider: &dyn StoreProvider,
        clock: Arc<dyn Clock>,
    ) -> ChannelResult<Arc<Self>> {
        config.validate()?;
        let template = build_template(&config);
        let table = ActiveTable::new(config.active_table_size);
        let capacity = config.storage_capacity;

        Ok(Arc::new(Self {
            config: Mutex::new(config),
            outbound: Mutex::new(Outbound {
                template,
                sequence: 0,
            }),
            dacs: Mutex::new(DacsSet::new()),
            table: Mutex::new(TableState {
                table,
                staged: None,
            }),
            table_signal: Condvar::new(),
            data_store: provider.create(capacity),
            payload_store: provider.create(capacity),
            dacs_store: provider.create(capacity),
            clock,
            counters: ChannelCounters::default(),
            seen: DashMap::new(),
        }))
    }

    /// Snapshot of the channel's attributes
    pub fn config(&self) -> ChannelConfig {
        self.config.lock().clone()
    }

    /// Point-in-time statistics
    pub fn stats(&self) -> ChannelStats {
        let mut snap = self.counters.snapshot();
        snap.bundles = self.data_store.count();
        snap.payloads = self.payload_store.count();
        snap.records = self.dacs_store.count();
        snap.active = self.table.lock().table.active_span();
        snap
    }

    /// Change one channel option
    ///
    /// Options shaping the primary block rebuild the outbound template.
    pub fn set_option(&self, opt: ChannelOption) -> ChannelResult<()> {
        let snapshot = {
            let mut cfg = self.config.lock();
            match opt {
                ChannelOption::DestinationNode(v) => cfg.destination.node = v,
                ChannelOption::DestinationService(v) => cfg.destination.service = v,
                ChannelOption::ReportToNode(v) => cfg.report_to.node = v,
                ChannelOption::ReportToService(v) => cfg.report_to.service = v,
                ChannelOption::CustodianNode(v) => cfg.custodian.node = v,
                ChannelOption::CustodianService(v) => cfg.custodian.service = v,
                ChannelOption::SetSequence(_) => {}
                ChannelOption::Lifetime(v) => cfg.lifetime_secs = v,
                ChannelOption::RequestCustody(v) => cfg.request_custody = v,
                ChannelOption::IntegrityCheck(v) => cfg.integrity_check = v,
                ChannelOption::PayloadCrc(v) => cfg.cipher_suite = v,
                ChannelOption::AllowFragment(v) => cfg.allow_fragment = v,
                ChannelOption::Timeout(v) => cfg.timeout_secs = v,
                ChannelOption::MaxBundleLength(v) => {
                    if v == 0 {
                        return Err(ChannelError::Param("max_bundle_len must be nonzero"));
                    }
                    cfg.max_bundle_len = v;
                }
                ChannelOption::Originate(v) => cfg.originate = v,
                ChannelOption::ProcessAdminOnly(v) => cfg.process_admin_only = v,
                ChannelOption::Wrap(v) => cfg.wrap_response = v,
                ChannelOption::CidReuse(v) => cfg.cid_reuse = v,
                ChannelOption::AcsRate(v) => cfg.dacs_rate_secs = v,
            }
            cfg.clone()
        };

        if let ChannelOption::SetSequence(seq) = opt {
            self.outbound.lock().sequence = seq;
        }
        if opt.rebuilds_template() {
            self.outbound.lock().template = build_template(&snapshot);
        }
        Ok(())
    }

    /// Read one channel option back
    pub fn get_option(&self, key: ChannelOptionKey) -> ChannelOption {
        let cfg = self.config.lock().clone();
        match key {
            ChannelOptionKey::DestinationNode => ChannelOption::DestinationNode(cfg.destination.node),
            ChannelOptionKey::DestinationService => {
                ChannelOption::DestinationService(cfg.destination.service)
            }
            ChannelOptionKey::ReportToNode => ChannelOption::ReportToNode(cfg.report_to.node),
            ChannelOptionKey::ReportToService => {
                ChannelOption::ReportToService(cfg.report_to.service)
            }
            ChannelOptionKey::CustodianNode => ChannelOption::CustodianNode(cfg.custodian.node),
            ChannelOptionKey::CustodianService => {
                ChannelOption::CustodianService(cfg.custodian.service)
            }
            ChannelOptionKey::SetSequence => ChannelOption::SetSequence(self.outbound.lock().sequence),
            ChannelOptionKey::Lifetime => ChannelOption::Lifetime(cfg.lifetime_secs),
            ChannelOptionKey::RequestCustody => ChannelOption::RequestCustody(cfg.request_custody),
            ChannelOptionKey::IntegrityCheck => ChannelOption::IntegrityCheck(cfg.integrity_check),
            ChannelOptionKey::PayloadCrc => ChannelOption::PayloadCrc(cfg.cipher_suite),
            ChannelOptionKey::AllowFragment => ChannelOption::AllowFragment(cfg.allow_fragment),
            ChannelOptionKey::Timeout => ChannelOption::Timeout(cfg.timeout_secs),
            ChannelOptionKey::MaxBundleLength => ChannelOption::MaxBundleLength(cfg.max_bundle_len),
            ChannelOptionKey::Originate => ChannelOption::Originate(cfg.originate),
            ChannelOptionKey::ProcessAdminOnly => {
                ChannelOption::ProcessAdminOnly(cfg.process_admin_only)
            }
            ChannelOptionKey::Wrap => ChannelOption::Wrap(cfg.wrap_response),
            ChannelOptionKey::CidReuse => ChannelOption::CidReuse(cfg.cid_reuse),
            ChannelOptionKey::AcsRate => ChannelOption::AcsRate(cfg.dacs_rate_secs),
        }
    }

    // ------------------------------------------------------------------
    // Origination
    // ------------------------------------------------------------------

    /// Originate one or more bundles carrying `payload`
    #[instrument(skip(self, payload), fields(len = payload.len()))]
    pub fn store(&self, payload: &[u8], timeout: Timeout) -> ChannelResult<Stored> {
        let cfg = self.config();
        if !cfg.originate {
            return Err(ChannelError::WrongOrigination);
        }

        let fragmented = payload.len() > cfg.max_bundle_len;
        if fragmented && !cfg.allow_fragment {
            return Err(ChannelError::BundleTooLarge {
                size: payload.len(),
                max: cfg.max_bundle_len,
            });
        }
        let chunks: Vec<(usize, &[u8])> = if fragmented {
            payload
                .chunks(cfg.max_bundle_len)
                .enumerate()
                .map(|(i, chunk)| (i * cfg.max_bundle_len, chunk))
                .collect()
        } else {
            vec![(0, payload)]
        };

        let now = self.clock.now_secs();
        let mut outbound = self.outbound.lock();
        let base_seq = outbound.sequence;

        let mut encoded = Vec::with_capacity(chunks.len());
        for (i, (offset, chunk)) in chunks.iter().enumerate() {
            let mut bundle = outbound.template.clone();
            bundle.primary.creation_secs = now;
            bundle.primary.creation_seq = base_seq + i as u64;
            bundle.primary.total_adu_len = payload.len() as u64;
            if fragmented {
                bundle.primary.flags |= PcfFlags::IS_FRAGMENT;
                bundle.primary.fragment_offset = *offset as u64;
            }
            if cfg.integrity_check {
                bundle.integrity = Some(IntegrityBlock {
                    suite: cfg.cipher_suite,
                    result: cfg.cipher_suite.compute(cfg.integrity_key.as_ref(), chunk)?,
                });
            }
            bundle.payload = Bytes::copy_from_slice(chunk);
            encoded.push(codec::serialize(cfg.version, &bundle)?);
        }

        for bundle in &encoded {
            if let Err(e) = self.data_store.enqueue(&[], &bundle.bytes, timeout) {
                // Sequence counter stays put so the numbering restarts clean.
                warn!(error = %e, "Data store rejected originated bundle");
                return Err(e.into());
            }
            ChannelCounters::bump(&self.counters.generated);
        }
        outbound.sequence = base_seq + chunks.len() as u64;
        trace!(bundles = chunks.len(), sequence = outbound.sequence, "Originated");

        Ok(Stored {
            bundles: chunks.len(),
            flags: StatusFlags::ACTIVITY,
        })
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    /// Emit the next outbound bundle
    ///
    /// Selection priority: stale custody signals, pending custody signals,
    /// due retransmissions, fresh data. Returns `Ok(None)` when nothing is
    /// ready within `timeout`.
    #[instrument(skip(self))]
    pub fn load(&self, timeout: Timeout) -> ChannelResult<Option<Loaded>> {
        let cfg = self.config();
        let now = self.clock.now_secs();
        let mut flags = StatusFlags::empty();

        // 1. Flush accumulators whose rate timer ran out.
        {
            let mut set = self.dacs.lock();
            for acc in set.stale_mut(now, cfg.dacs_rate_secs) {
                self.flush_accumulator(&cfg, acc, now, &mut flags)?;
            }
        }

        // 2. A pending custody signal goes out before anything else.
        if let Some(record) = self.dacs_store.dequeue(Timeout::Poll)? {
            let bytes = record.bytes.to_vec();
            self.dacs_store.relinquish(record.sid)?;
            ChannelCounters::bump(&self.counters.transmitted);
            flags |= StatusFlags::ACTIVITY;
            return Ok(Some(Loaded { bytes, flags }));
        }

        // 3. Due retransmissions, then any bundle staged by a prior wrap.
        {
            let mut guard = self.table.lock();
            if let Some(loaded) = self.scan_retransmit(&cfg, now, &mut guard, &mut flags)? {
                return Ok(Some(loaded));
            }
            if guard.staged.is_some() {
                return match self.emit_staged(&cfg, now, &mut guard, &mut flags)? {
                    Some(loaded) => Ok(Some(loaded)),
                    None => Err(ChannelError::Overflow),
                };
            }
        }

        // 4. Fresh data.
        loop {
            let Some(record) = self.data_store.dequeue(timeout)? else {
                return Ok(None);
            };
            let bytes = record.bytes.to_vec();
            let parsed = match codec::parse(cfg.version, &bytes) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "Dropping unparseable stored bundle");
                    let _ = self.data_store.relinquish(record.sid);
                    ChannelCounters::bump(&self.counters.lost);
                    continue;
                }
            };
            if parsed.primary.is_expired(now) {
                debug!(creation = parsed.primary.creation_secs, "Dropping expired bundle");
                let _ = self.data_store.relinquish(record.sid);
                ChannelCounters::bump(&self.counters.expired);
                continue;
            }

            match (parsed.custody.is_some(), parsed.cid) {
                (true, Some(cid_field)) => {
                    let mut guard = self.table.lock();
                    guard.staged = Some(Staged {
                        sid: record.sid,
                        bytes,
                        cid: cid_field,
                    });
                    return match self.emit_staged(&cfg, now, &mut guard, &mut flags)? {
                        Some(loaded) => Ok(Some(loaded)),
                        None => Err(ChannelError::Overflow),
                    };
                }
                _ => {
                    // No custody tracking: emit and release immediately.
                    self.data_store.relinquish(record.sid)?;
                    ChannelCounters::bump(&self.counters.transmitted);
                    flags |= StatusFlags::ACTIVITY;
                    return Ok(Some(Loaded { bytes, flags }));
                }
            }
        }
    }

    /// Walk the active table from the oldest custody ID, emitting the first
    /// entry whose retransmission timer has run out.
    fn scan_retransmit(
        &self,
        cfg: &ChannelConfig,
        now: u64,
        guard: &mut MutexGuard<'_, TableState>,
        flags: &mut StatusFlags,
    ) -> ChannelResult<Option<Loaded>> {
        let state = &mut **guard;
        let mut cid = state.table.oldest_cid();

        while cid < state.table.current_cid() {
            let Some((sid, last_retx)) = state.table.get(cid) else {
                state.table.advance_oldest();
                cid += 1;
                continue;
            };

            let bytes = match self.data_store.retrieve(sid, Timeout::Poll) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(cid, error = %e, "Active entry lost its storage record");
                    state.table.vacate(cid);
                    state.table.advance_oldest();
                    ChannelCounters::bump(&self.counters.lost);
                    *flags |= StatusFlags::STORE_FAILURE;
                    cid += 1;
                    continue;
                }
            };

            let parsed = match codec::parse(cfg.version, &bytes) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(cid, error = %e, "Dropping corrupt active bundle");
                    let _ = self.data_store.relinquish(sid);
                    state.table.vacate(cid);
                    state.table.advance_oldest();
                    ChannelCounters::bump(&self.counters.lost);
                    cid += 1;
                    continue;
                }
            };

            if parsed.primary.is_expired(now) {
                let _ = self.data_store.relinquish(sid);
                state.table.vacate(cid);
                state.table.advance_oldest();
                ChannelCounters::bump(&self.counters.expired);
                cid += 1;
                continue;
            }

            if now < last_retx.saturating_add(cfg.timeout_secs) {
                // Entries are in send order; the oldest live one gates the rest.
                return Ok(None);
            }

            let Some(cid_field) = parsed.cid else {
                warn!(cid, "Active bundle carries no custody field");
                let _ = self.data_store.relinquish(sid);
                state.table.vacate(cid);
                state.table.advance_oldest();
                ChannelCounters::bump(&self.counters.lost);
                cid += 1;
                continue;
            };

            let mut out = bytes.to_vec();
            let send_cid = if cfg.cid_reuse {
                state.table.touch(cid, now);
                cid
            } else {
                state.table.vacate(cid);
                state.table.advance_oldest();
                state.table.issue(sid, now)
            };
            codec::patch_custody_id(cfg.version, &mut out, cid_field, send_cid)?;
            ChannelCounters::bump(&self.counters.retransmitted);
            *flags |= StatusFlags::ACTIVITY;
            debug!(cid = send_cid, reuse = cfg.cid_reuse, "Retransmitting");
            return Ok(Some(Loaded {
                bytes: out,
                flags: *flags,
            }));
        }
        Ok(None)
    }

    /// Place the staged custody bundle into the table and emit it, applying
    /// the wrap policy when the table is full.
    ///
    /// `Ok(None)` means the table is still full under the BLOCK policy; the
    /// staged bundle stays put for the next call.
    fn emit_staged(
        &self,
        cfg: &ChannelConfig,
        now: u64,
        guard: &mut MutexGuard<'_, TableState>,
        flags: &mut StatusFlags,
    ) -> ChannelResult<Option<Loaded>> {
        guard.table.advance_oldest();
        if guard.table.is_full() {
            *flags |= StatusFlags::ACTIVE_TABLE_WRAP;
            match cfg.wrap_response {
                WrapResponse::Block => {
                    // Wait for acknowledgments to drain a slot, bounded.
                    self.table_signal
                        .wait_for(guard, Duration::from_millis(cfg.wrap_timeout_millis));
                    guard.table.advance_oldest();
                    if guard.table.is_full() {
                        return Ok(None);
                    }
                }
                WrapResponse::Resend => {
                    return self.resend_oldest(cfg, now, guard, flags);
                }
                WrapResponse::Drop => {
                    let oldest = guard.table.oldest_cid();
                    if let Some(sid) = guard.table.vacate(oldest) {
                        let _ = self.data_store.relinquish(sid);
                    }
                    guard.table.advance_oldest();
                    ChannelCounters::bump(&self.counters.lost);
                    debug!(cid = oldest, "Wrap policy dropped oldest custody bundle");
                }
            }
        }

        let Some(staged) = guard.staged.take() else {
            return Ok(None);
        };
        let cid = guard.table.issue(staged.sid, now);
        let mut bytes = staged.bytes;
        codec::patch_custody_id(cfg.version, &mut bytes, staged.cid, cid)?;
        ChannelCounters::bump(&self.counters.transmitted);
        *flags |= StatusFlags::ACTIVITY;
        trace!(cid, "Emitted custody bundle");
        Ok(Some(Loaded {
            bytes,
            flags: *flags,
        }))
    }

    /// RESEND wrap policy: emit the oldest occupant under a fresh custody ID
    /// instead of the staged bundle. A failed retrieval clears the slot and
    /// counts the bundle lost, making room for the staged one.
    fn resend_oldest(
        &self,
        cfg: &ChannelConfig,
        now: u64,
        guard: &mut MutexGuard<'_, TableState>,
        flags: &mut StatusFlags,
    ) -> ChannelResult<Option<Loaded>> {
        let oldest = guard.table.oldest_cid();
        let Some((sid, _)) = guard.table.get(oldest) else {
            return Ok(None);
        };

        match self.data_store.retrieve(sid, Timeout::Poll) {
            Ok(bytes) => {
                let parsed = codec::parse(cfg.version, &bytes)?;
                let Some(cid_field) = parsed.cid else {
                    guard.table.vacate(oldest);
                    guard.table.advance_oldest();
                    ChannelCounters::bump(&self.counters.lost);
                    return self.emit_staged(cfg, now, guard, flags);
                };
                guard.table.vacate(oldest);
                guard.table.advance_oldest();
                let cid = guard.table.issue(sid, now);
                let mut out = bytes.to_vec();
                codec::patch_custody_id(cfg.version, &mut out, cid_field, cid)?;
                ChannelCounters::bump(&self.counters.retransmitted);
                *flags |= StatusFlags::ACTIVITY;
                debug!(old = oldest, cid, "Wrap policy resent oldest custody bundle");
                Ok(Some(Loaded {
                    bytes: out,
                    flags: *flags,
                }))
            }
            Err(e) => {
                warn!(cid = oldest, error = %e, "Wrap resend lost its storage record");
                guard.table.vacate(oldest);
                guard.table.advance_oldest();
                ChannelCounters::bump(&self.counters.lost);
                *flags |= StatusFlags::STORE_FAILURE;
                self.emit_staged(cfg, now, guard, flags)
            }
        }
    }

    // ------------------------------------------------------------------
    // Reception
    // ------------------------------------------------------------------

    /// Process one inbound serialized bundle
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub fn process(&self, bytes: &[u8], timeout: Timeout) -> ChannelResult<Processed> {
        let cfg = self.config();
        let now = self.clock.now_secs();
        let mut flags = StatusFlags::empty();
        ChannelCounters::bump(&self.counters.received);

        let parsed = codec::parse(cfg.version, bytes)?;

        for block in &parsed.unknown {
            if block.flags.contains(BlockFlags::DELETE_NO_PROC) {
                debug!(block_type = block.block_type, "Unprocessable block deletes bundle");
                return Err(ChannelError::Dropped);
            }
            if block.flags.contains(BlockFlags::NOTIFY_NO_PROC) {
                flags |= StatusFlags::NON_COMPLIANT;
            }
        }

        if let Some(ib) = &parsed.integrity
            && !ib
                .suite
                .verify(cfg.integrity_key.as_ref(), &parsed.payload, &ib.result)?
        {
            return Err(ChannelError::FailedIntegrity);
        }

        if parsed.primary.is_expired(now) {
            ChannelCounters::bump(&self.counters.expired);
            return Err(ChannelError::Expired);
        }

        if parsed.primary.destination.node != cfg.local.node {
            return self.forward(&cfg, parsed, now, timeout, flags);
        }

        let service = parsed.primary.destination.service;
        if service != cfg.local.service && cfg.local.service != 0 {
            return Err(ChannelError::WrongChannel {
                service,
                local: cfg.local.service,
            });
        }

        if parsed.primary.is_admin_record() {
            return self.consume_admin(&parsed, flags);
        }
        self.deliver(&cfg, parsed, now, timeout, flags)
    }

    /// Rewrite an inbound bundle for the next hop and enqueue it
    fn forward(
        &self,
        cfg: &ChannelConfig,
        parsed: ParsedBundle,
        now: u64,
        timeout: Timeout,
        mut flags: StatusFlags,
    ) -> ChannelResult<Processed> {
        let prev_custody = parsed.custody;
        let mut bundle = parsed.to_forwardable();
        bundle.primary.report_to = cfg.local;
        bundle.primary.custodian = cfg.local;

        // The custody block itself is only re-emitted when custody was
        // requested and the previous hop actually attached one.
        let reissue = bundle.primary.custody_requested() && prev_custody.is_some();
        bundle.custody = reissue.then_some(CustodyBlock {
            custody_id: 0,
            custodian: cfg.local,
        });

        let encoded = codec::serialize(cfg.version, &bundle)?;
        self.data_store.enqueue(&[], &encoded.bytes, timeout)?;

        if reissue && let Some(prev) = prev_custody {
            // We now hold custody; acknowledge the previous custodian.
            self.dacs_update(cfg, prev.custodian, prev.custody_id, false, now, &mut flags)?;
        }
        flags |= StatusFlags::ACTIVITY;
        debug!(dest = %bundle.primary.destination, custody = reissue, "Forwarded");
        Ok(Processed {
            action: Disposition::Forwarded,
            flags,
        })
    }

    /// Enqueue the payload for the application and acknowledge custody
    fn deliver(
        &self,
        cfg: &ChannelConfig,
        parsed: ParsedBundle,
        now: u64,
        timeout: Timeout,
        mut flags: StatusFlags,
    ) -> ChannelResult<Processed> {
        if cfg.process_admin_only {
            return Err(ChannelError::Ignore);
        }
        if parsed.payload.len() > cfg.max_bundle_len {
            return Err(ChannelError::PayloadTooLarge {
                size: parsed.payload.len(),
                max: cfg.max_bundle_len,
            });
        }

        let key: BundleKey = (
            parsed.primary.source,
            parsed.primary.creation_secs,
            parsed.primary.creation_seq,
            parsed.primary.fragment_offset,
        );
        let duplicate = self.remember(key, now, cfg.seen_horizon_secs);
        if duplicate {
            flags |= StatusFlags::DUPLICATES;
            trace!(source = %parsed.primary.source, seq = parsed.primary.creation_seq, "Duplicate delivery suppressed");
        } else {
            let header = delivery_header(parsed.primary.custody_requested(), parsed.payload.len());
            self.payload_store.enqueue(&header, &parsed.payload, timeout)?;
            ChannelCounters::bump(&self.counters.delivered);
        }

        if parsed.primary.custody_requested()
            && let Some(custody) = parsed.custody
        {
            // Re-acknowledge duplicates too: the previous signal may be lost.
            self.dacs_update(cfg, custody.custodian, custody.custody_id, true, now, &mut flags)?;
        }
        flags |= StatusFlags::ACTIVITY;
        Ok(Processed {
            action: Disposition::Delivered,
            flags,
        })
    }

    /// Consume an administrative record addressed to this channel
    fn consume_admin(&self, parsed: &ParsedBundle, mut flags: StatusFlags) -> ChannelResult<Processed> {
        use aphelion_codec::CodecError;

        let rtype = admin::peek_record_type(&parsed.payload)?;
        match rtype {
            admin::record_type::ACS => {
                let runs = admin::decode_acs(&parsed.payload)?;
                if !runs.succeeded {
                    return Err(ChannelError::Ignore);
                }
                let mut released = 0u64;
                {
                    let mut guard = self.table.lock();
                    for cid in runs.cids() {
                        if !guard.table.in_window(cid) {
                            continue;
                        }
                        if let Some((sid, _)) = guard.table.get(cid) {
                            let _ = self.data_store.relinquish(sid);
                            guard.table.vacate(cid);
                            ChannelCounters::bump(&self.counters.acknowledged);
                            released += 1;
                        }
                    }
                }
                // Wake any load caller blocked on wrap.
                self.table_signal.notify_all();
                if released > 0 {
                    flags |= StatusFlags::ACTIVITY;
                }
                debug!(released, "Consumed aggregate custody signal");
                Ok(Processed {
                    action: Disposition::AcknowledgedCustody(released),
                    flags,
                })
            }
            admin::record_type::CUSTODY_SIGNAL | admin::record_type::STATUS => Err(
                ChannelError::Codec(CodecError::Unsupported("legacy administrative record")),
            ),
            other => Err(ChannelError::Codec(CodecError::UnknownRecord(other))),
        }
    }

    /// Hand the next delivered payload to the application
    pub fn accept(&self, timeout: Timeout) -> ChannelResult<Option<Delivery>> {
        let Some(record) = self.payload_store.dequeue(timeout)? else {
            return Ok(None);
        };
        self.payload_store.relinquish(record.sid)?;
        let (request_custody, payload) = parse_delivery(&record.bytes)?;
        Ok(Some(Delivery {
            payload,
            request_custody,
            flags: StatusFlags::ACTIVITY,
        }))
    }

    // ------------------------------------------------------------------
    // Custody egress
    // ------------------------------------------------------------------

    /// Record one custody ID owed to a remote custodian
    fn dacs_update(
        &self,
        cfg: &ChannelConfig,
        custodian: EndpointId,
        cid: u64,
        delivered: bool,
        now: u64,
        flags: &mut StatusFlags,
    ) -> ChannelResult<()> {
        let mut set = self.dacs.lock();
        let Some(acc) = set.find_or_open(custodian, delivered, now, cfg.max_concurrent_dacs) else {
            warn!(custodian = %custodian, "No room for another custody accumulator");
            *flags |= StatusFlags::TOO_MANY_SOURCES;
            return Ok(());
        };

        if acc.delivered != delivered {
            if !acc.cids.is_empty() {
                // Delivered and forwarded acknowledgments never share a signal.
                *flags |= StatusFlags::MIXED_RESPONSE;
                self.flush_accumulator(cfg, acc, now, flags)?;
            }
            acc.delivered = delivered;
        }

        if !acc.cids.insert(cid) {
            *flags |= StatusFlags::DUPLICATES;
        }
        if acc.cids.len() >= cfg.max_acs_tree_size {
            self.flush_accumulator(cfg, acc, now, flags)?;
        }
        Ok(())
    }

    /// Drain one accumulator into DACS bundles on the signal queue
    fn flush_accumulator(
        &self,
        cfg: &ChannelConfig,
        acc: &mut DacsAccumulator,
        now: u64,
        flags: &mut StatusFlags,
    ) -> ChannelResult<()> {
        while !acc.cids.is_empty() {
            let payload = admin::encode_acs(&mut acc.cids, cfg.max_fills_per_dacs);
            let bundle = self.dacs_bundle(cfg, acc.custodian, &payload, now)?;
            let encoded =
                codec::serialize(cfg.version, &bundle).map_err(|_| ChannelError::FailedResponse)?;

            if let Err(e) = self.dacs_store.enqueue(&[], &encoded.bytes, Timeout::Poll) {
                // Put the drained IDs back; the next rate tick retries.
                if let Ok(runs) = admin::decode_acs(&payload) {
                    for cid in runs.cids() {
                        acc.cids.insert(cid);
                    }
                }
                warn!(error = %e, custodian = %acc.custodian, "Signal store refused DACS bundle");
                *flags |= StatusFlags::STORE_FAILURE;
                break;
            }
            trace!(custodian = %acc.custodian, "Flushed custody signal");
        }
        acc.last_sent_secs = now;
        Ok(())
    }

    /// Build the admin bundle carrying one ACS payload
    fn dacs_bundle(
        &self,
        cfg: &ChannelConfig,
        custodian: EndpointId,
        payload: &[u8],
        now: u64,
    ) -> ChannelResult<Bundle> {
        let integrity = if cfg.integrity_check {
            Some(IntegrityBlock {
                suite: cfg.cipher_suite,
                result: cfg.cipher_suite.compute(cfg.integrity_key.as_ref(), payload)?,
            })
        } else {
            None
        };
        Ok(Bundle {
            primary: PrimaryBlock {
                flags: PcfFlags::ADMIN_RECORD | PcfFlags::SINGLETON,
                destination: custodian,
                source: cfg.local,
                report_to: cfg.local,
                custodian: cfg.local,
                creation_secs: now,
                creation_seq: 0,
                lifetime_secs: cfg.lifetime_secs,
                fragment_offset: 0,
                total_adu_len: payload.len() as u64,
            },
            custody: None,
            integrity,
            payload: Bytes::copy_from_slice(payload),
            unknown: Vec::new(),
        })
    }

    /// Record a received-bundle key; true when it was already known
    fn remember(&self, key: BundleKey, now: u64, horizon_secs: u64) -> bool {
        let duplicate = self.seen.insert(key, now).is_some();
        if self.seen.len() > SEEN_PRUNE_THRESHOLD {
            self.seen
                .retain(|_, first| now.saturating_sub(*first) < horizon_secs);
        }
        duplicate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_record_roundtrip() {
        let header = delivery_header(true, 5);
        let mut record = header.to_vec();
        record.extend_from_slice(b"hello");

        let (custody, payload) = parse_delivery(&Bytes::from(record)).unwrap();
        assert!(custody);
        assert_eq!(&payload[..], b"hello");
    }

    #[test]
    fn test_delivery_record_length_checked() {
        assert!(parse_delivery(&Bytes::from_static(b"\x01")).is_err());

        let mut record = delivery_header(false, 5).to_vec();
        record.extend_from_slice(b"hell"); // one byte short
        assert!(parse_delivery(&Bytes::from(record)).is_err());
    }
}
