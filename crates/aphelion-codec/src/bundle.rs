//! Logical block model
//!
//! Both wire formats serialize and parse through the same logical model: a
//! primary block, an optional custody block, an optional integrity block, and
//! one payload block. Blocks a parser does not recognize are preserved as
//! [`UnknownBlock`]s so the engine can apply their processing-control flags
//! when forwarding.

use aphelion_core::EndpointId;
use bitflags::bitflags;
use bytes::Bytes;

use crate::integrity::CipherSuite;

bitflags! {
    /// Bundle processing-control flags from the primary block
    pub struct PcfFlags: u32 {
        /// The payload is a fragment of a larger application data unit
        const IS_FRAGMENT       = 0x01;
        /// The payload is an administrative record
        const ADMIN_RECORD      = 0x02;
        /// The bundle must not be fragmented in transit
        const MUST_NOT_FRAGMENT = 0x04;
        /// Custody transfer is requested
        const CUSTODY_REQUEST   = 0x08;
        /// The destination is a singleton endpoint
        const SINGLETON         = 0x10;
    }
}

bitflags! {
    /// Canonical block processing-control flags
    pub struct BlockFlags: u32 {
        /// Replicate this block in every fragment
        const REPLICATE       = 0x01;
        /// Report if the block cannot be processed
        const NOTIFY_NO_PROC  = 0x02;
        /// Delete the bundle if the block cannot be processed
        const DELETE_NO_PROC  = 0x04;
        /// This is the last block of the bundle
        const LAST_BLOCK      = 0x08;
        /// Discard this block if it cannot be processed
        const DROP_NO_PROC    = 0x10;
        /// The block was forwarded without being processed
        const FORWARD_NO_PROC = 0x20;
    }
}

/// Canonical block type numbers shared by both formats
pub mod block_type {
    /// Payload block
    pub const PAYLOAD: u8 = 0x01;
    /// Custody transfer enhancement block
    pub const CUSTODY: u8 = 0x0A;
    /// Block integrity block
    pub const INTEGRITY: u8 = 0x0B;
}

/// Primary block of a bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryBlock {
    /// Processing-control flags
    pub flags: PcfFlags,
    /// Final destination endpoint
    pub destination: EndpointId,
    /// Originating endpoint
    pub source: EndpointId,
    /// Endpoint that receives status reports
    pub report_to: EndpointId,
    /// Current custodian endpoint
    pub custodian: EndpointId,
    /// Creation time, Unix seconds
    pub creation_secs: u64,
    /// Creation sequence number, monotonic within one second of one source
    pub creation_seq: u64,
    /// Lifetime in seconds; 0 means the bundle never expires
    pub lifetime_secs: u64,
    /// Offset of this fragment's payload in the original application data unit
    pub fragment_offset: u64,
    /// Total length of the original application data unit
    pub total_adu_len: u64,
}

impl PrimaryBlock {
    /// Whether the bundle has outlived its lifetime at `now` (Unix seconds)
    ///
    /// A zero lifetime never expires.
    pub fn is_expired(&self, now_secs: u64) -> bool {
        self.lifetime_secs != 0 && self.creation_secs.saturating_add(self.lifetime_secs) <= now_secs
    }

    /// Whether custody transfer is requested
    pub fn custody_requested(&self) -> bool {
        self.flags.contains(PcfFlags::CUSTODY_REQUEST)
    }

    /// Whether the payload is an administrative record
    pub fn is_admin_record(&self) -> bool {
        self.flags.contains(PcfFlags::ADMIN_RECORD)
    }
}

/// Custody transfer enhancement block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustodyBlock {
    /// Custody ID assigned by the current custodian
    pub custody_id: u64,
    /// The custodian that assigned it
    pub custodian: EndpointId,
}

/// Integrity block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityBlock {
    /// Cipher suite that produced the result
    pub suite: CipherSuite,
    /// Checksum or truncated digest over the payload fragment
    pub result: Vec<u8>,
}

/// A canonical block the parser does not interpret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownBlock {
    /// Wire block type
    pub block_type: u8,
    /// Processing-control flags of the block
    pub flags: BlockFlags,
    /// Raw block body
    pub body: Bytes,
}

/// A logical bundle ready for serialization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub primary: PrimaryBlock,
    pub custody: Option<CustodyBlock>,
    pub integrity: Option<IntegrityBlock>,
    /// Payload bytes
    pub payload: Bytes,
    /// Unrecognized blocks carried through from a parsed bundle
    pub unknown: Vec<UnknownBlock>,
}

/// Location of the custody-id field inside serialized bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidField {
    /// Byte offset of the field
    pub offset: usize,
    /// Reserved width of the field in bytes
    pub width: usize,
}

/// A serialized bundle plus the patchable custody-id location
#[derive(Debug, Clone)]
pub struct EncodedBundle {
    /// The wire bytes
    pub bytes: Vec<u8>,
    /// Where the custody-id lives, when the bundle carries a custody block
    pub cid: Option<CidField>,
}

/// A parsed bundle
///
/// `payload` is copied out of the input buffer; unknown blocks keep their raw
/// bodies for forwarding.
#[derive(Debug, Clone)]
pub struct ParsedBundle {
    pub primary: PrimaryBlock,
    pub custody: Option<CustodyBlock>,
    pub integrity: Option<IntegrityBlock>,
    pub payload: Bytes,
    pub unknown: Vec<UnknownBlock>,
    /// Where the custody-id was found in the input bytes
    pub cid: Option<CidField>,
}

impl ParsedBundle {
    /// Rebuild a logical bundle from the parsed blocks, dropping any unknown
    /// block flagged `DROP_NO_PROC` and marking the rest forwarded.
    pub fn to_forwardable(&self) -> Bundle {
        let unknown = self
            .unknown
            .iter()
            .filter(|b| !b.flags.contains(BlockFlags::DROP_NO_PROC))
            .map(|b| UnknownBlock {
                block_type: b.block_type,
                flags: b.flags | BlockFlags::FORWARD_NO_PROC,
                body: b.body.clone(),
            })
            .collect();

        Bundle {
            primary: self.primary.clone(),
            custody: self.custody,
            integrity: self.integrity.clone(),
            payload: self.payload.clone(),
            unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn primary(lifetime: u64, creation: u64) -> PrimaryBlock {
        PrimaryBlock {
            flags: PcfFlags::empty(),
            destination: EndpointId::new(2, 1),
            source: EndpointId::new(1, 1),
            report_to: EndpointId::new(1, 1),
            custodian: EndpointId::null(),
            creation_secs: creation,
            creation_seq: 0,
            lifetime_secs: lifetime,
            fragment_offset: 0,
            total_adu_len: 0,
        }
    }

    #[test]
    fn test_expiry() {
        let block = primary(10, 100);
        assert!(!block.is_expired(100));
        assert!(!block.is_expired(109));
        assert!(block.is_expired(110));
        assert!(block.is_expired(111));
    }

    #[test]
    fn test_zero_lifetime_never_expires() {
        let block = primary(0, 100);
        assert!(!block.is_expired(u64::MAX));
    }

    #[test]
    fn test_forwardable_strips_and_marks() {
        let parsed = ParsedBundle {
            primary: primary(0, 1),
            custody: None,
            integrity: None,
            payload: Bytes::from_static(b"x"),
            unknown: vec![
                UnknownBlock {
                    block_type: 0xC0,
                    flags: BlockFlags::DROP_NO_PROC,
                    body: Bytes::from_static(b"drop me"),
                },
                UnknownBlock {
                    block_type: 0xC1,
                    flags: BlockFlags::empty(),
                    body: Bytes::from_static(b"keep me"),
                },
            ],
            cid: None,
        };

        let out = parsed.to_forwardable();
        assert_eq!(out.unknown.len(), 1);
        assert_eq!(out.unknown[0].block_type, 0xC1);
        assert!(out.unknown[0].flags.contains(BlockFlags::FORWARD_NO_PROC));
    }
}
