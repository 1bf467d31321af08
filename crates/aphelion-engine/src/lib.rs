//! # Aphelion Engine
//!
//! The per-channel bundle protocol engine: origination, forwarding,
//! delivery, custody retransmission, and aggregate custody signalling.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use aphelion_core::{EndpointId, SystemClock};
//! use aphelion_engine::{BpAgent, ChannelConfig};
//! use aphelion_storage::{MemoryStoreProvider, Timeout};
//!
//! let agent = BpAgent::new(Arc::new(SystemClock), Arc::new(MemoryStoreProvider), 8);
//! let config = ChannelConfig::between(EndpointId::new(1, 10), EndpointId::new(2, 10));
//! let handle = agent.open(config).unwrap();
//!
//! let channel = agent.channel(handle).unwrap();
//! channel.store(b"hello", Timeout::Poll).unwrap();
//! // `loaded.bytes` goes to a convergence-layer adapter from here.
//! let loaded = channel.load(Timeout::Poll).unwrap().unwrap();
//! assert!(!loaded.bytes.is_empty());
//! # agent.close(handle).unwrap();
//! ```
//!
//! ## Modules
//!
//! - [`channel`]: the four bundle operations and channel state
//! - [`active_table`]: the in-flight custody ring
//! - [`dacs`]: open aggregate-custody-signal accumulators
//! - [`config`]: channel attributes and runtime options
//! - [`error`]: the engine error taxonomy

pub mod active_table;
pub mod channel;
pub mod config;
pub mod dacs;
pub mod error;

pub use channel::{Channel, Delivery, Disposition, Loaded, Processed, Stored};
pub use config::{ChannelConfig, ChannelOption, ChannelOptionKey, WrapResponse};
pub use error::{ChannelError, ChannelResult};

use std::sync::Arc;

use parking_lot::Mutex;

use aphelion_core::Clock;
use aphelion_storage::StoreProvider;

/// Dense handle to an open channel
pub type ChannelHandle = usize;

/// The process-wide channel registry
///
/// Channels are addressed by dense small-integer handles, validated at every
/// entry point. The registry lock is only taken at open and close; operation
/// calls go straight to the channel behind its `Arc`.
pub struct BpAgent {
    channels: Mutex<Vec<Option<Arc<Channel>>>>,
    clock: Arc<dyn Clock>,
    provider: Arc<dyn StoreProvider>,
}

impl BpAgent {
    /// Create an agent with room for `max_channels` channels
    pub fn new(
        clock: Arc<dyn Clock>,
        provider: Arc<dyn StoreProvider>,
        max_channels: usize,
    ) -> Self {
        Self {
            channels: Mutex::new((0..max_channels).map(|_| None).collect()),
            clock,
            provider,
        }
    }

    /// Open a channel, returning its handle
    pub fn open(&self, config: ChannelConfig) -> ChannelResult<ChannelHandle> {
        let channel = Channel::open(config, self.provider.as_ref(), Arc::clone(&self.clock))?;
        let mut channels = self.channels.lock();
        let Some(slot) = channels.iter().position(Option::is_none) else {
            return Err(ChannelError::ChannelsFull);
        };
        channels[slot] = Some(channel);
        Ok(slot)
    }

    /// Close a channel, discarding its queues
    pub fn close(&self, handle: ChannelHandle) -> ChannelResult<()> {
        let mut channels = self.channels.lock();
        match channels.get_mut(handle) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                Ok(())
            }
            _ => Err(ChannelError::InvalidHandle(handle)),
        }
    }

    /// The channel behind `handle`
    pub fn channel(&self, handle: ChannelHandle) -> ChannelResult<Arc<Channel>> {
        self.channels
            .lock()
            .get(handle)
            .and_then(Clone::clone)
            .ok_or(ChannelError::InvalidHandle(handle))
    }

    /// Number of open channels
    pub fn open_count(&self) -> usize {
        self.channels.lock().iter().flatten().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aphelion_core::{EndpointId, ManualClock};
    use aphelion_storage::MemoryStoreProvider;

    fn agent(max: usize) -> BpAgent {
        BpAgent::new(
            Arc::new(ManualClock::at_secs(1_000)),
            Arc::new(MemoryStoreProvider),
            max,
        )
    }

    fn config(node: u32) -> ChannelConfig {
        ChannelConfig::between(EndpointId::new(node, 1), EndpointId::new(99, 1))
    }

    #[test]
    fn test_open_close_reuses_slots() {
        let agent = agent(2);
        let a = agent.open(config(1)).unwrap();
        let b = agent.open(config(2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(agent.open_count(), 2);

        assert!(matches!(
            agent.open(config(3)),
            Err(ChannelError::ChannelsFull)
        ));

        agent.close(a).unwrap();
        let c = agent.open(config(3)).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_invalid_handles_rejected() {
        let agent = agent(2);
        assert!(matches!(
            agent.channel(0),
            Err(ChannelError::InvalidHandle(0))
        ));
        assert!(matches!(
            agent.channel(7),
            Err(ChannelError::InvalidHandle(7))
        ));
        assert!(matches!(agent.close(7), Err(ChannelError::InvalidHandle(7))));

        let handle = agent.open(config(1)).unwrap();
        agent.close(handle).unwrap();
        assert!(matches!(
            agent.close(handle),
            Err(ChannelError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_invalid_config_rejected_at_open() {
        let agent = agent(2);
        let mut bad = config(1);
        bad.active_table_size = 0;
        assert!(matches!(agent.open(bad), Err(ChannelError::Param(_))));
        assert_eq!(agent.open_count(), 0);
    }
}
