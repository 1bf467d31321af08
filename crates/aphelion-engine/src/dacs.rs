//! Open DACS accumulators
//!
//! While this channel accepts custody of forwarded bundles (or delivers
//! them), it owes each previous custodian an aggregate custody signal. One
//! accumulator is kept per remote custodian, collecting custody IDs until
//! the signal is flushed by rate, by size, or by a change in acknowledgment
//! kind: acknowledgments for delivered bundles and for merely-forwarded
//! bundles never share one signal.

use std::collections::BTreeSet;

use aphelion_core::EndpointId;

/// One open accumulator toward a remote custodian
#[derive(Debug)]
pub struct DacsAccumulator {
    /// The custodian owed this signal
    pub custodian: EndpointId,
    /// Custody IDs pending acknowledgment
    pub cids: BTreeSet<u64>,
    /// When a signal was last flushed toward this custodian, Unix seconds
    pub last_sent_secs: u64,
    /// Whether the pending IDs acknowledge local deliveries
    pub delivered: bool,
}

/// The channel's set of open accumulators
#[derive(Debug, Default)]
pub struct DacsSet {
    open: Vec<DacsAccumulator>,
}

impl DacsSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the accumulator for `custodian`, opening one if there is room
    ///
    /// Returns `None` when the custodian is new and `max_concurrent`
    /// accumulators are already open.
    pub fn find_or_open(
        &mut self,
        custodian: EndpointId,
        delivered: bool,
        now_secs: u64,
        max_concurrent: usize,
    ) -> Option<&mut DacsAccumulator> {
        if let Some(at) = self.open.iter().position(|a| a.custodian == custodian) {
            return Some(&mut self.open[at]);
        }
        if self.open.len() >= max_concurrent {
            return None;
        }
        self.open.push(DacsAccumulator {
            custodian,
            cids: BTreeSet::new(),
            last_sent_secs: now_secs,
            delivered,
        });
        self.open.last_mut()
    }

    /// Accumulators whose rate timer has run out and that hold pending IDs
    pub fn stale_mut(
        &mut self,
        now_secs: u64,
        rate_secs: u64,
    ) -> impl Iterator<Item = &mut DacsAccumulator> {
        self.open.iter_mut().filter(move |a| {
            !a.cids.is_empty() && now_secs >= a.last_sent_secs.saturating_add(rate_secs)
        })
    }

    /// Number of open accumulators
    pub fn len(&self) -> usize {
        self.open.len()
    }

    /// Whether any accumulator is open
    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}
