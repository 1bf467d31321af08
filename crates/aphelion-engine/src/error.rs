//! Engine error types

use aphelion_codec::CodecError;
use aphelion_core::EidError;
use aphelion_storage::StoreError;
use thiserror::Error;

/// Errors surfaced by channel operations
#[derive(Debug, Error)]
pub enum ChannelError {
    /// A configuration value is out of range
    #[error("Invalid parameter: {0}")]
    Param(&'static str),

    /// No open channel behind this handle
    #[error("Invalid channel handle {0}")]
    InvalidHandle(usize),

    /// Every channel slot is occupied
    #[error("Channel table is full")]
    ChannelsFull,

    /// Malformed endpoint ID
    #[error(transparent)]
    Eid(#[from] EidError),

    /// Wire-level encode/decode failure
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Storage plane failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Origination payload exceeds the bundle limit with fragmentation off
    #[error("Payload of {size} bytes exceeds bundle limit {max} and fragmentation is disabled")]
    BundleTooLarge { size: usize, max: usize },

    /// A received payload exceeds what this channel will deliver
    #[error("Payload of {size} bytes exceeds delivery limit {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// Channel is not configured to originate bundles
    #[error("Channel does not originate")]
    WrongOrigination,

    /// Bundle reached a channel bound to a different service
    #[error("Bundle for service {service} reached channel bound to service {local}")]
    WrongChannel { service: u32, local: u32 },

    /// Bundle lifetime has passed
    #[error("Bundle lifetime expired")]
    Expired,

    /// An unprocessable block demanded the whole bundle be deleted
    #[error("Bundle dropped by block processing flags")]
    Dropped,

    /// Channel policy declines this bundle
    #[error("Bundle ignored by channel policy")]
    Ignore,

    /// Payload does not match its integrity block
    #[error("Payload integrity verification failed")]
    FailedIntegrity,

    /// Active table wrapped and the wrap policy is BLOCK
    #[error("Active table is full")]
    Overflow,

    /// A custody acknowledgment could not be built
    #[error("Failed to build custody signal")]
    FailedResponse,
}

/// Result alias for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;
