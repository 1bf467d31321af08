//! Codec error types

use aphelion_core::EidError;
use thiserror::Error;

/// Errors raised while encoding or decoding bundles
#[derive(Debug, Error)]
pub enum CodecError {
    /// Input bytes do not form the promised structure
    #[error("Bundle parse error: {0}")]
    Parse(&'static str),

    /// A well-formed construct this agent does not implement
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    /// An SDNV's minimal encoding exceeds its reserved width, or a decoded
    /// SDNV exceeds 64 bits
    #[error("SDNV overflow")]
    SdnvOverflow,

    /// Input ended before an SDNV terminator byte
    #[error("SDNV truncated")]
    SdnvIncomplete,

    /// Administrative record of a type this agent does not know
    #[error("Unknown administrative record type {0}")]
    UnknownRecord(u8),

    /// A field value does not fit the wire field that must carry it
    #[error("Value {value} does not fit field {field}")]
    FieldOverflow { field: &'static str, value: u64 },

    /// Malformed endpoint ID text inside a block
    #[error(transparent)]
    Eid(#[from] EidError),
}
