//! # Aphelion Core
//!
//! Shared types for the Aphelion bundle agent.
//!
//! A bundle agent moves self-contained *bundles* of application data across
//! links that are only intermittently available. Everything in this crate is
//! deliberately small and dependency-light: endpoint addressing, the wall
//! clock abstraction the rest of the agent tells time through, the side-band
//! status flags returned alongside call results, and per-channel statistics
//! counters.
//!
//! ## Modules
//!
//! - [`eid`]: `ipn:`-scheme endpoint identifiers
//! - [`clock`]: seconds/milliseconds clock trait with a manual test clock
//! - [`flags`]: cumulative status flags surfaced to callers
//! - [`stats`]: monotonic per-channel counters and snapshots

pub mod clock;
pub mod eid;
pub mod flags;
pub mod stats;

pub use clock::{Clock, ManualClock, SystemClock};
pub use eid::{EidError, EndpointId};
pub use flags::StatusFlags;
pub use stats::{ChannelCounters, ChannelStats};
