//! BPv6 wire format
//!
//! The primary block is laid out at fixed byte offsets inside a 52-byte
//! region: every numeric field is an SDNV padded to a reserved width, so a
//! serialized header can be patched field-by-field without shifting its
//! neighbours. Canonical blocks follow as `type, flags SDNV, length SDNV,
//! body`; the payload block is always last.

use aphelion_core::EndpointId;
use bytes::Bytes;

use crate::bundle::{
    BlockFlags, Bundle, CidField, CustodyBlock, EncodedBundle, IntegrityBlock, ParsedBundle,
    PcfFlags, PrimaryBlock, UnknownBlock, block_type,
};
use crate::error::CodecError;
use crate::integrity::CipherSuite;
use crate::sdnv;

/// Protocol version byte
const VERSION: u8 = 0x06;

/// Reserved width of the custody-id SDNV in the custody block
const CID_WIDTH: usize = 4;

/// Fixed primary-block field offsets and reserved widths.
mod layout {
    pub const VERSION: usize = 0;
    pub const PCF: (usize, usize) = (1, 3);
    pub const BLKLEN: (usize, usize) = (4, 1);
    pub const DSTNODE: (usize, usize) = (5, 4);
    pub const DSTSERV: (usize, usize) = (9, 2);
    pub const SRCNODE: (usize, usize) = (11, 4);
    pub const SRCSERV: (usize, usize) = (15, 2);
    pub const RPTNODE: (usize, usize) = (17, 4);
    pub const RPTSERV: (usize, usize) = (21, 2);
    pub const CSTNODE: (usize, usize) = (23, 4);
    pub const CSTSERV: (usize, usize) = (27, 2);
    pub const CREATESEC: (usize, usize) = (29, 6);
    pub const CREATESEQ: (usize, usize) = (35, 4);
    pub const LIFETIME: (usize, usize) = (39, 4);
    pub const DICTLEN: (usize, usize) = (43, 1);
    pub const FRAGOFFSET: (usize, usize) = (44, 4);
    pub const PAYLEN: (usize, usize) = (48, 4);
    /// Total primary block size
    pub const SIZE: usize = 52;
}

fn put(
    buf: &mut [u8],
    (offset, width): (usize, usize),
    value: u64,
    field: &'static str,
) -> Result<(), CodecError> {
    sdnv::encode_fixed(value, &mut buf[offset..offset + width])
        .map_err(|_| CodecError::FieldOverflow { field, value })
}

fn get(buf: &[u8], (offset, width): (usize, usize)) -> Result<u64, CodecError> {
    let (value, _) = sdnv::decode(&buf[offset..offset + width])?;
    Ok(value)
}

/// Serialize a bundle into BPv6 bytes
pub fn serialize(bundle: &Bundle) -> Result<EncodedBundle, CodecError> {
    let mut buf = vec![0u8; layout::SIZE];
    let primary = &bundle.primary;

    buf[layout::VERSION] = VERSION;
    put(&mut buf, layout::PCF, primary.flags.bits() as u64, "pcf")?;
    put(
        &mut buf,
        layout::BLKLEN,
        (layout::SIZE - layout::BLKLEN.0 - layout::BLKLEN.1) as u64,
        "blklen",
    )?;
    put(&mut buf, layout::DSTNODE, primary.destination.node as u64, "dstnode")?;
    put(&mut buf, layout::DSTSERV, primary.destination.service as u64, "dstserv")?;
    put(&mut buf, layout::SRCNODE, primary.source.node as u64, "srcnode")?;
    put(&mut buf, layout::SRCSERV, primary.source.service as u64, "srcserv")?;
    put(&mut buf, layout::RPTNODE, primary.report_to.node as u64, "rptnode")?;
    put(&mut buf, layout::RPTSERV, primary.report_to.service as u64, "rptserv")?;
    put(&mut buf, layout::CSTNODE, primary.custodian.node as u64, "cstnode")?;
    put(&mut buf, layout::CSTSERV, primary.custodian.service as u64, "cstserv")?;
    put(&mut buf, layout::CREATESEC, primary.creation_secs, "createsec")?;
    put(&mut buf, layout::CREATESEQ, primary.creation_seq, "createseq")?;
    put(&mut buf, layout::LIFETIME, primary.lifetime_secs, "lifetime")?;
    put(&mut buf, layout::DICTLEN, 0, "dictlen")?;
    put(&mut buf, layout::FRAGOFFSET, primary.fragment_offset, "fragoffset")?;
    put(&mut buf, layout::PAYLEN, primary.total_adu_len, "paylen")?;

    let mut cid = None;
    if let Some(custody) = &bundle.custody {
        let custodian_text = custody.custodian.to_string();
        let body_len = CID_WIDTH + custodian_text.len();

        buf.push(block_type::CUSTODY);
        sdnv::encode(BlockFlags::REPLICATE.bits() as u64, &mut buf);
        sdnv::encode(body_len as u64, &mut buf);

        let offset = buf.len();
        buf.resize(offset + CID_WIDTH, 0);
        sdnv::encode_fixed(custody.custody_id, &mut buf[offset..offset + CID_WIDTH])?;
        buf.extend_from_slice(custodian_text.as_bytes());
        cid = Some(CidField {
            offset,
            width: CID_WIDTH,
        });
    }

    if let Some(integrity) = &bundle.integrity {
        let mut body = Vec::with_capacity(2 + integrity.result.len());
        sdnv::encode(integrity.suite.id(), &mut body);
        sdnv::encode(integrity.result.len() as u64, &mut body);
        body.extend_from_slice(&integrity.result);

        buf.push(block_type::INTEGRITY);
        sdnv::encode(BlockFlags::empty().bits() as u64, &mut buf);
        sdnv::encode(body.len() as u64, &mut buf);
        buf.extend_from_slice(&body);
    }

    for block in &bundle.unknown {
        buf.push(block.block_type);
        sdnv::encode(block.flags.bits() as u64, &mut buf);
        sdnv::encode(block.body.len() as u64, &mut buf);
        buf.extend_from_slice(&block.body);
    }

    buf.push(block_type::PAYLOAD);
    sdnv::encode(BlockFlags::LAST_BLOCK.bits() as u64, &mut buf);
    sdnv::encode(bundle.payload.len() as u64, &mut buf);
    buf.extend_from_slice(&bundle.payload);

    Ok(EncodedBundle { bytes: buf, cid })
}

/// Overwrite the custody-id SDNV in serialized BPv6 bytes
pub fn patch_custody_id(bytes: &mut [u8], field: CidField, cid: u64) -> Result<(), CodecError> {
    if field.offset + field.width > bytes.len() {
        return Err(CodecError::Parse("custody-id field out of range"));
    }
    sdnv::encode_fixed(cid, &mut bytes[field.offset..field.offset + field.width])
}

fn decode_at(buf: &[u8], pos: &mut usize) -> Result<u64, CodecError> {
    let (value, used) = sdnv::decode(&buf[*pos..])?;
    *pos += used;
    Ok(value)
}

fn parse_primary(buf: &[u8]) -> Result<PrimaryBlock, CodecError> {
    if buf.len() < layout::SIZE {
        return Err(CodecError::Parse("primary block truncated"));
    }
    if buf[layout::VERSION] != VERSION {
        return Err(CodecError::Unsupported("bundle protocol version"));
    }
    if get(buf, layout::DICTLEN)? != 0 {
        return Err(CodecError::Unsupported("non-empty dictionary"));
    }

    let pcf = get(buf, layout::PCF)?;
    let flags = PcfFlags::from_bits_truncate(pcf as u32);

    let eid = |node: (usize, usize), serv: (usize, usize)| -> Result<EndpointId, CodecError> {
        let node = get(buf, node)?;
        let service = get(buf, serv)?;
        Ok(EndpointId::new(node as u32, service as u32))
    };

    Ok(PrimaryBlock {
        flags,
        destination: eid(layout::DSTNODE, layout::DSTSERV)?,
        source: eid(layout::SRCNODE, layout::SRCSERV)?,
        report_to: eid(layout::RPTNODE, layout::RPTSERV)?,
        custodian: eid(layout::CSTNODE, layout::CSTSERV)?,
        creation_secs: get(buf, layout::CREATESEC)?,
        creation_seq: get(buf, layout::CREATESEQ)?,
        lifetime_secs: get(buf, layout::LIFETIME)?,
        fragment_offset: get(buf, layout::FRAGOFFSET)?,
        total_adu_len: get(buf, layout::PAYLEN)?,
    })
}

/// Parse BPv6 bytes into the logical model
pub fn parse(buf: &[u8]) -> Result<ParsedBundle, CodecError> {
    let primary = parse_primary(buf)?;

    let mut pos = layout::SIZE;
    let mut custody = None;
    let mut integrity = None;
    let mut payload = None;
    let mut unknown = Vec::new();
    let mut cid = None;

    while pos < buf.len() {
        let btype = buf[pos];
        pos += 1;
        let flags = BlockFlags::from_bits_truncate(decode_at(buf, &mut pos)? as u32);
        let body_len = decode_at(buf, &mut pos)? as usize;
        if pos + body_len > buf.len() {
            return Err(CodecError::Parse("canonical block truncated"));
        }
        let body = &buf[pos..pos + body_len];

        match btype {
            block_type::CUSTODY => {
                let mut at = 0;
                let custody_id = decode_at(body, &mut at)?;
                let width = at;
                let text = std::str::from_utf8(&body[at..])
                    .map_err(|_| CodecError::Parse("custodian EID is not UTF-8"))?;
                custody = Some(CustodyBlock {
                    custody_id,
                    custodian: text.parse()?,
                });
                cid = Some(CidField { offset: pos, width });
            }
            block_type::INTEGRITY => {
                let mut at = 0;
                let suite = CipherSuite::from_id(decode_at(body, &mut at)?)?;
                let result_len = decode_at(body, &mut at)? as usize;
                if at + result_len > body.len() {
                    return Err(CodecError::Parse("integrity result truncated"));
                }
                integrity = Some(IntegrityBlock {
                    suite,
                    result: body[at..at + result_len].to_vec(),
                });
            }
            block_type::PAYLOAD => {
                payload = Some(Bytes::copy_from_slice(body));
                pos += body_len;
                break;
            }
            _ => {
                unknown.push(UnknownBlock {
                    block_type: btype,
                    flags,
                    body: Bytes::copy_from_slice(body),
                });
            }
        }
        pos += body_len;
    }

    let payload = payload.ok_or(CodecError::Parse("missing payload block"))?;
    if pos != buf.len() {
        return Err(CodecError::Parse("trailing bytes after payload block"));
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

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bundle(custody: bool) -> Bundle {
        Bundle {
            primary: PrimaryBlock {
                flags: if custody {
                    PcfFlags::CUSTODY_REQUEST | PcfFlags::SINGLETON
                } else {
                    PcfFlags::SINGLETON
                },
                destination: EndpointId::new(2, 1),
                source: EndpointId::new(1, 10),
                report_to: EndpointId::new(1, 10),
                custodian: EndpointId::new(1, 10),
                creation_secs: 1_700_000_000,
                creation_seq: 3,
                lifetime_secs: 86_400,
                fragment_offset: 0,
                total_adu_len: 5,
            },
            custody: custody.then_some(CustodyBlock {
                custody_id: 17,
                custodian: EndpointId::new(1, 10),
            }),
            integrity: Some(IntegrityBlock {
                suite: CipherSuite::Crc16X25,
                result: crate::integrity::crc16(b"hello").to_be_bytes().to_vec(),
            }),
            payload: Bytes::from_static(b"hello"),
            unknown: Vec::new(),
        }
    }

    #[test]
    fn test_roundtrip() {
        let bundle = sample_bundle(true);
        let encoded = serialize(&bundle).unwrap();
        assert_eq!(encoded.bytes[0], VERSION);

        let parsed = parse(&encoded.bytes).unwrap();
        assert_eq!(parsed.primary, bundle.primary);
        assert_eq!(parsed.custody, bundle.custody);
        assert_eq!(parsed.integrity, bundle.integrity);
        assert_eq!(parsed.payload, bundle.payload);
        assert_eq!(parsed.cid, encoded.cid);
    }

    #[test]
    fn test_primary_block_is_fixed_size() {
        let bundle = sample_bundle(false);
        let encoded = serialize(&bundle).unwrap();
        // First canonical block begins right after the 52-byte primary.
        assert_eq!(encoded.bytes[layout::SIZE], block_type::INTEGRITY);
    }

    #[test]
    fn test_patch_custody_id() {
        let bundle = sample_bundle(true);
        let mut encoded = serialize(&bundle).unwrap();
        let field = encoded.cid.unwrap();

        patch_custody_id(&mut encoded.bytes, field, 9_999).unwrap();
        let parsed = parse(&encoded.bytes).unwrap();
        assert_eq!(parsed.custody.unwrap().custody_id, 9_999);
    }

    #[test]
    fn test_service_number_must_fit_reserved_width() {
        let mut bundle = sample_bundle(false);
        bundle.primary.destination.service = 16_384;
        assert!(matches!(
            serialize(&bundle),
            Err(CodecError::FieldOverflow { field: "dstserv", .. })
        ));
    }

    #[test]
    fn test_unknown_block_survives() {
        let mut bundle = sample_bundle(false);
        bundle.unknown.push(UnknownBlock {
            block_type: 0xC7,
            flags: BlockFlags::NOTIFY_NO_PROC,
            body: Bytes::from_static(b"\x01\x02\x03"),
        });

        let encoded = serialize(&bundle).unwrap();
        let parsed = parse(&encoded.bytes).unwrap();
        assert_eq!(parsed.unknown.len(), 1);
        assert_eq!(parsed.unknown[0].block_type, 0xC7);
        assert!(parsed.unknown[0].flags.contains(BlockFlags::NOTIFY_NO_PROC));
        assert_eq!(&parsed.unknown[0].body[..], b"\x01\x02\x03");
    }

    #[test]
    fn test_truncated_input() {
        let bundle = sample_bundle(true);
        let encoded = serialize(&bundle).unwrap();
        assert!(parse(&encoded.bytes[..30]).is_err());
        assert!(parse(&encoded.bytes[..encoded.bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_wrong_version_rejected() {
        let bundle = sample_bundle(false);
        let mut encoded = serialize(&bundle).unwrap();
        encoded.bytes[0] = 0x07;
        assert!(matches!(
            parse(&encoded.bytes),
            Err(CodecError::Unsupported(_))
        ));
    }
}
