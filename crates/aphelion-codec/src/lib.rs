//! # Aphelion Codec
//!
//! Wire codecs for the Aphelion bundle agent.
//!
//! Two bundle formats are supported, selected per channel:
//!
//! - **BPv6**: SDNV-encoded fields laid out at fixed byte offsets in the
//!   primary block, followed by explicit canonical blocks (custody,
//!   integrity, payload).
//! - **BPv7**: CBOR-encoded blocks with per-block CRCs.
//!
//! Both serializers return an [`EncodedBundle`] carrying the raw bytes plus
//! the location of the custody-id field, so the engine can stamp a fresh
//! custody ID into an already-serialized header without re-encoding the
//! bundle. Both parsers produce the same logical [`ParsedBundle`], so the
//! engine above is format-agnostic.
//!
//! ## Modules
//!
//! - [`sdnv`]: self-delimiting numeric values, including reserved-width writes
//! - [`integrity`]: CRC and keyed-digest cipher suites
//! - [`bundle`]: the logical block model shared by both formats
//! - [`v6`]: BPv6 fixed-offset serializer/parser
//! - [`v7`]: BPv7 CBOR serializer/parser
//! - [`admin`]: administrative records and the aggregate custody signal

pub mod admin;
pub mod bundle;
pub mod integrity;
pub mod sdnv;
pub mod v6;
pub mod v7;

mod cbor;
mod error;

pub use bundle::{
    BlockFlags, Bundle, CidField, CustodyBlock, EncodedBundle, IntegrityBlock, ParsedBundle,
    PcfFlags, PrimaryBlock, UnknownBlock,
};
pub use error::CodecError;
pub use integrity::CipherSuite;

use serde::{Deserialize, Serialize};

/// Bundle wire format, selected per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WireVersion {
    /// SDNV blocks at fixed offsets
    #[default]
    V6,
    /// CBOR blocks with per-block CRCs
    V7,
}

/// Serialize a logical bundle in the given wire format
pub fn serialize(version: WireVersion, bundle: &Bundle) -> Result<EncodedBundle, CodecError> {
    match version {
        WireVersion::V6 => v6::serialize(bundle),
        WireVersion::V7 => v7::serialize(bundle),
    }
}

/// Parse a serialized bundle in the given wire format
pub fn parse(version: WireVersion, bytes: &[u8]) -> Result<ParsedBundle, CodecError> {
    match version {
        WireVersion::V6 => v6::parse(bytes),
        WireVersion::V7 => v7::parse(bytes),
    }
}

/// Overwrite the custody-id field of an already-serialized bundle
pub fn patch_custody_id(
    version: WireVersion,
    bytes: &mut [u8],
    field: CidField,
    cid: u64,
) -> Result<(), CodecError> {
    match version {
        WireVersion::V6 => v6::patch_custody_id(bytes, field, cid),
        WireVersion::V7 => v7::patch_custody_id(bytes, field, cid),
    }
}
