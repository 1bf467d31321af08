//! BPv7 wire format
//!
//! A bundle is a CBOR indefinite-length array of blocks. The primary block
//! carries routing and lifetime fields; canonical blocks are five- or
//! six-element arrays `[type, number, flags, crc-type, data, crc?]` whose CRC
//! is computed over the whole block with the CRC field zero-filled.
//!
//! The custody-tracking extension block (type 10) holds the current
//! custodian and a custody sequence number. The sequence is encoded as a
//! fixed nine-byte CBOR u64 and the block carries no CRC, so the engine can
//! stamp a fresh custody ID into serialized bytes the same way it patches a
//! BPv6 SDNV. Custody state is protected end-to-end by the custody transfer
//! handshake itself, not by a hop checksum.

use aphelion_core::EndpointId;
use bytes::Bytes;
use minicbor::{Decoder, Encoder};

use crate::bundle::{
    BlockFlags, Bundle, CidField, CustodyBlock, EncodedBundle, IntegrityBlock, ParsedBundle,
    PcfFlags, PrimaryBlock, UnknownBlock,
};
use crate::cbor::{darr, dbytes, deid, du64, earr, ebytes, eeid, eu64};
use crate::error::CodecError;
use crate::integrity::{self, CipherSuite};

/// Protocol version
const VERSION: u64 = 7;
/// CBOR indefinite-array open / break
const ARRAY_OPEN: u8 = 0x9F;
const ARRAY_BREAK: u8 = 0xFF;
/// CBOR major-0 prefix for an eight-byte unsigned value
const U64_FIXED: u8 = 0x1B;

/// Canonical block type numbers
const BLOCK_PAYLOAD: u64 = 1;
const BLOCK_CUSTODY: u64 = 10;
const BLOCK_INTEGRITY: u64 = 11;

/// Block CRC types
const CRC_NONE: u64 = 0;
const CRC_16: u64 = 1;
const CRC_32C: u64 = 2;

fn crc_len(crc_type: u64) -> Result<usize, CodecError> {
    match crc_type {
        CRC_16 => Ok(2),
        CRC_32C => Ok(4),
        _ => Err(CodecError::Unsupported("block crc type")),
    }
}

/// Append a zero-filled CRC byte string, then overwrite it with the checksum
/// of the whole block.
fn seal_block_crc(block: &mut Vec<u8>, crc_type: u64) -> Result<(), CodecError> {
    let len = crc_len(crc_type)?;
    {
        let mut e = Encoder::new(&mut *block);
        ebytes(&mut e, &vec![0u8; len])?;
    }
    let at = block.len() - len;
    match crc_type {
        CRC_16 => {
            let crc = integrity::crc16(block);
            block[at..].copy_from_slice(&crc.to_be_bytes());
        }
        _ => {
            let crc = integrity::crc32c(block);
            block[at..].copy_from_slice(&crc.to_be_bytes());
        }
    }
    Ok(())
}

/// Check a block CRC given the block's byte range and the position of the
/// CRC payload inside the buffer.
fn verify_block_crc(
    buf: &[u8],
    block: std::ops::Range<usize>,
    crc_payload: std::ops::Range<usize>,
    crc_type: u64,
) -> Result<(), CodecError> {
    if crc_payload.len() != crc_len(crc_type)? {
        return Err(CodecError::Parse("block crc length"));
    }
    let mut copy = buf[block.clone()].to_vec();
    let offset = crc_payload.start - block.start;
    copy[offset..offset + crc_payload.len()].fill(0);

    let stored = &buf[crc_payload.clone()];
    let ok = match crc_type {
        CRC_16 => stored == integrity::crc16(&copy).to_be_bytes(),
        _ => stored == integrity::crc32c(&copy).to_be_bytes(),
    };
    if ok {
        Ok(())
    } else {
        Err(CodecError::Parse("block crc mismatch"))
    }
}

fn encode_primary(primary: &PrimaryBlock) -> Result<Vec<u8>, CodecError> {
    let is_frag = primary.flags.contains(PcfFlags::IS_FRAGMENT);
    let arity = 9 + if is_frag { 2 } else { 0 };

    let mut block = Vec::new();
    {
        let mut e = Encoder::new(&mut block);
        earr(&mut e, arity)?;
        eu64(&mut e, VERSION)?;
        eu64(&mut e, primary.flags.bits() as u64)?;
        eu64(&mut e, CRC_32C)?;
        eeid(&mut e, primary.destination)?;
        eeid(&mut e, primary.source)?;
        eeid(&mut e, primary.report_to)?;
        earr(&mut e, 2)?;
        eu64(&mut e, primary.creation_secs * 1000)?;
        eu64(&mut e, primary.creation_seq)?;
        eu64(&mut e, primary.lifetime_secs * 1000)?;
        if is_frag {
            eu64(&mut e, primary.fragment_offset)?;
            eu64(&mut e, primary.total_adu_len)?;
        }
    }
    seal_block_crc(&mut block, CRC_32C)?;
    Ok(block)
}

/// Encode one canonical block; `crc_type` of zero writes a five-element
/// block with no checksum.
fn encode_canonical(
    block_type: u64,
    number: u64,
    flags: u32,
    crc_type: u64,
    data: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let arity = if crc_type == CRC_NONE { 5 } else { 6 };
    let mut block = Vec::new();
    {
        let mut e = Encoder::new(&mut block);
        earr(&mut e, arity)?;
        eu64(&mut e, block_type)?;
        eu64(&mut e, number)?;
        eu64(&mut e, flags as u64)?;
        eu64(&mut e, crc_type)?;
        ebytes(&mut e, data)?;
    }
    if crc_type != CRC_NONE {
        seal_block_crc(&mut block, crc_type)?;
    }
    Ok(block)
}

/// Serialize a bundle into BPv7 bytes
pub fn serialize(bundle: &Bundle) -> Result<EncodedBundle, CodecError> {
    let mut buf = vec![ARRAY_OPEN];
    buf.extend_from_slice(&encode_primary(&bundle.primary)?);

    let mut cid = None;
    let mut number = 2;

    if let Some(custody) = &bundle.custody {
        let mut data = Vec::new();
        {
            let mut e = Encoder::new(&mut data);
            earr(&mut e, 2)?;
            eeid(&mut e, custody.custodian)?;
        }
        let cid_in_data = data.len();
        data.push(U64_FIXED);
        data.extend_from_slice(&custody.custody_id.to_be_bytes());

        let block = encode_canonical(BLOCK_CUSTODY, number, 0, CRC_NONE, &data)?;
        number += 1;

        let data_start_in_block = block.len() - data.len();
        cid = Some(CidField {
            offset: buf.len() + data_start_in_block + cid_in_data,
            width: 9,
        });
        buf.extend_from_slice(&block);
    }

    if let Some(ib) = &bundle.integrity {
        let mut data = Vec::new();
        {
            let mut e = Encoder::new(&mut data);
            earr(&mut e, 2)?;
            eu64(&mut e, ib.suite.id())?;
            ebytes(&mut e, &ib.result)?;
        }
        let block = encode_canonical(BLOCK_INTEGRITY, number, 0, CRC_32C, &data)?;
        number += 1;
        buf.extend_from_slice(&block);
    }

    for unk in &bundle.unknown {
        let block = encode_canonical(
            unk.block_type as u64,
            number,
            unk.flags.bits(),
            CRC_NONE,
            &unk.body,
        )?;
        number += 1;
        buf.extend_from_slice(&block);
    }

    let payload = encode_canonical(BLOCK_PAYLOAD, 1, 0, CRC_32C, &bundle.payload)?;
    buf.extend_from_slice(&payload);
    buf.push(ARRAY_BREAK);

    Ok(EncodedBundle { bytes: buf, cid })
}

/// Overwrite the custody sequence in serialized BPv7 bytes
pub fn patch_custody_id(bytes: &mut [u8], field: CidField, cid: u64) -> Result<(), CodecError> {
    if field.width != 9 || field.offset + 9 > bytes.len() || bytes[field.offset] != U64_FIXED {
        return Err(CodecError::Parse("custody sequence field out of range"));
    }
    bytes[field.offset + 1..field.offset + 9].copy_from_slice(&cid.to_be_bytes());
    Ok(())
}

fn parse_primary(buf: &[u8], d: &mut Decoder<'_>) -> Result<PrimaryBlock, CodecError> {
    let start = d.position();
    let arity = darr(d)?;

    if du64(d)? != VERSION {
        return Err(CodecError::Unsupported("bundle protocol version"));
    }
    let flags = PcfFlags::from_bits_truncate(du64(d)? as u32);
    let crc_type = du64(d)?;

    let is_frag = flags.contains(PcfFlags::IS_FRAGMENT);
    let expected = 8 + if is_frag { 2 } else { 0 } + if crc_type != CRC_NONE { 1 } else { 0 };
    if arity != expected {
        return Err(CodecError::Parse("primary block arity"));
    }

    let destination = deid(d)?;
    let source = deid(d)?;
    let report_to = deid(d)?;

    if darr(d)? != 2 {
        return Err(CodecError::Parse("creation timestamp arity"));
    }
    let creation_ms = du64(d)?;
    let creation_seq = du64(d)?;
    let lifetime_ms = du64(d)?;

    let (fragment_offset, total_adu_len) = if is_frag {
        (du64(d)?, du64(d)?)
    } else {
        (0, 0)
    };

    if crc_type != CRC_NONE {
        let crc = dbytes(d)?;
        let end = d.position();
        verify_block_crc(buf, start..end, end - crc.len()..end, crc_type)?;
    }

    Ok(PrimaryBlock {
        flags,
        destination,
        source,
        report_to,
        // BPv7 carries the custodian in the custody-tracking block; filled
        // in by the caller when that block is present.
        custodian: EndpointId::null(),
        creation_secs: creation_ms / 1000,
        creation_seq,
        lifetime_secs: lifetime_ms / 1000,
        fragment_offset,
        total_adu_len,
    })
}

/// Parse BPv7 bytes into the logical model
pub fn parse(buf: &[u8]) -> Result<ParsedBundle, CodecError> {
    if buf.first() != Some(&ARRAY_OPEN) {
        return Err(CodecError::Parse("not a bundle array"));
    }
    let mut d = Decoder::new(buf);
    d.set_position(1);

    let mut primary = parse_primary(buf, &mut d)?;

    let mut custody = None;
    let mut integrity = None;
    let mut payload = None;
    let mut unknown = Vec::new();
    let mut cid = None;

    while buf.get(d.position()) != Some(&ARRAY_BREAK) {
        if payload.is_some() {
            return Err(CodecError::Parse("block after payload block"));
        }
        let start = d.position();
        let arity = darr(&mut d)?;
        if !(5..=6).contains(&arity) {
            return Err(CodecError::Parse("canonical block arity"));
        }
        let btype = du64(&mut d)?;
        let _number = du64(&mut d)?;
        let flags = BlockFlags::from_bits_truncate(du64(&mut d)? as u32);
        let crc_type = du64(&mut d)?;

        let data = dbytes(&mut d)?;
        let data_start = d.position() - data.len();

        if arity == 6 {
            let crc = dbytes(&mut d)?;
            let end = d.position();
            verify_block_crc(buf, start..end, end - crc.len()..end, crc_type)?;
        } else if crc_type != CRC_NONE {
            return Err(CodecError::Parse("crc type without crc field"));
        }

        match btype {
            BLOCK_PAYLOAD => {
                payload = Some(Bytes::copy_from_slice(data));
            }
            BLOCK_CUSTODY => {
                let mut inner = Decoder::new(data);
                if darr(&mut inner)? != 2 {
                    return Err(CodecError::Parse("custody block arity"));
                }
                let custodian = deid(&mut inner)?;
                let seq_at = inner.position();
                let custody_id = du64(&mut inner)?;
                custody = Some(CustodyBlock {
                    custody_id,
                    custodian,
                });
                if data.get(seq_at) == Some(&U64_FIXED) {
                    cid = Some(CidField {
                        offset: data_start + seq_at,
                        width: 9,
                    });
                }
            }
            BLOCK_INTEGRITY => {
                let mut inner = Decoder::new(data);
                if darr(&mut inner)? != 2 {
                    return Err(CodecError::Parse("integrity block arity"));
                }
                let suite = CipherSuite::from_id(du64(&mut inner)?)?;
                let result = dbytes(&mut inner)?.to_vec();
                integrity = Some(IntegrityBlock { suite, result });
            }
            _ => {
                if btype > u8::MAX as u64 {
                    return Err(CodecError::Unsupported("extension block type"));
                }
                unknown.push(UnknownBlock {
                    block_type: btype as u8,
                    flags,
                    body: Bytes::copy_from_slice(data),
                });
            }
        }
    }

    if d.position() + 1 != buf.len() {
        return Err(CodecError::Parse("trailing bytes after bundle"));
    }
    let payload = payload.ok_or(CodecError::Parse("missing payload block"))?;

    if let Some(c) = &custody {
        primary.custodian = c.custodian;
    }

    Ok(ParsedBundle {
        primary,
        custody,
        integrity,
        payload,
        unknown,
        cid,
    })
}
