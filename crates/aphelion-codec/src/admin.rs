//! Administrative records
//!
//! An administrative record travels as the payload of a bundle whose primary
//! block has the admin-record flag set. The first payload byte carries the
//! record type in its high nibble.
//!
//! The only record this agent originates is the *Aggregate Custody Signal*:
//! one bundle acknowledging many custody IDs, encoded as a status byte
//! followed by SDNV `(fill, count)` pairs. The first pair's fill is the
//! lowest acknowledged CID; each later fill is the gap from the previous
//! run's last CID. The v7 custody cache uses a CBOR *custody accept* payload
//! instead, acknowledging `(flow source, sequence)` tuples.

use std::collections::BTreeSet;

use aphelion_core::EndpointId;
use minicbor::{Decoder, Encoder};

use crate::cbor::{darr, deid, du64, earr, eeid, eu64};
use crate::error::CodecError;
use crate::sdnv;

/// Administrative record types
pub mod record_type {
    /// Bundle status report
    pub const STATUS: u8 = 1;
    /// Legacy (single-bundle) custody signal
    pub const CUSTODY_SIGNAL: u8 = 2;
    /// Aggregate custody signal
    pub const ACS: u8 = 4;
}

/// Status byte bit: custody transfer succeeded
const STATUS_SUCCEEDED: u8 = 0x01;

/// Read the record type from an admin-record payload
pub fn peek_record_type(payload: &[u8]) -> Result<u8, CodecError> {
    if payload.len() < 2 {
        return Err(CodecError::Parse("administrative record too short"));
    }
    Ok(payload[0] >> 4)
}

/// Drain up to `max_fills` runs of consecutive CIDs from `cids` into one ACS
/// payload
///
/// The set is mutated: encoded CIDs are removed. Call repeatedly until the
/// set is empty to drain a large accumulator into several bundles.
pub fn encode_acs(cids: &mut BTreeSet<u64>, max_fills: usize) -> Vec<u8> {
    let mut payload = vec![record_type::ACS << 4, STATUS_SUCCEEDED];
    let mut prev_last = None;

    for _ in 0..max_fills {
        let Some(&first) = cids.iter().next() else {
            break;
        };
        let mut last = first;
        while cids.contains(&(last + 1)) {
            last += 1;
        }
        for cid in first..=last {
            cids.remove(&cid);
        }

        let fill = match prev_last {
            None => first,
            Some(prev) => first - prev,
        };
        sdnv::encode(fill, &mut payload);
        sdnv::encode(last - first + 1, &mut payload);
        prev_last = Some(last);
    }

    payload
}

/// A decoded aggregate custody signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcsRuns {
    /// Whether custody transfer succeeded
    pub succeeded: bool,
    /// Runs of consecutive CIDs as `(first, count)`
    pub runs: Vec<(u64, u64)>,
}

impl AcsRuns {
    /// Iterate every acknowledged CID in ascending order
    pub fn cids(&self) -> impl Iterator<Item = u64> + '_ {
        self.runs.iter().flat_map(|&(first, count)| first..first + count)
    }
}

/// Decode an ACS payload
pub fn decode_acs(payload: &[u8]) -> Result<AcsRuns, CodecError> {
    let rtype = peek_record_type(payload)?;
    if rtype != record_type::ACS {
        return Err(CodecError::UnknownRecord(rtype));
    }
    let succeeded = payload[1] & STATUS_SUCCEEDED != 0;

    let mut runs = Vec::new();
    let mut prev_last = None;
    let mut pos = 2;
    while pos < payload.len() {
        let (fill, used) = sdnv::decode(&payload[pos..])?;
        pos += used;
        let (count, used) = sdnv::decode(&payload[pos..])?;
        pos += used;
        if count == 0 {
            return Err(CodecError::Parse("empty ACS fill"));
        }

        let first = match prev_last {
            None => fill,
            Some(prev) => prev + fill,
        };
        prev_last = Some(first + count - 1);
        runs.push((first, count));
    }

    Ok(AcsRuns { succeeded, runs })
}

/// The v7 custody-accept admin payload
///
/// Acknowledges a set of bundles from one source flow by sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodyAccept {
    /// Source endpoint of the acknowledged flow
    pub flow_source: EndpointId,
    /// Acknowledged creation sequence numbers
    pub sequences: Vec<u64>,
}

/// Encode a custody-accept record as a CBOR admin payload
pub fn encode_custody_accept(accept: &CustodyAccept) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    let mut e = Encoder::new(&mut buf);
    earr(&mut e, 2)?;
    eu64(&mut e, record_type::ACS as u64)?;
    earr(&mut e, 2)?;
    eeid(&mut e, accept.flow_source)?;
    earr(&mut e, accept.sequences.len() as u64)?;
    for &seq in &accept.sequences {
        eu64(&mut e, seq)?;
    }
    Ok(buf)
}

/// Decode a CBOR admin payload into a custody-accept record
pub fn decode_custody_accept(payload: &[u8]) -> Result<CustodyAccept, CodecError> {
    let mut d = Decoder::new(payload);
    if darr(&mut d)? != 2 {
        return Err(CodecError::Parse("admin record arity"));
    }
    let rtype = du64(&mut d)?;
    if rtype != record_type::ACS as u64 {
        return Err(CodecError::UnknownRecord(rtype.min(u8::MAX as u64) as u8));
    }
    if darr(&mut d)? != 2 {
        return Err(CodecError::Parse("custody accept arity"));
    }
    let flow_source = deid(&mut d)?;
    let n = darr(&mut d)?;
    let mut sequences = Vec::with_capacity(n as usize);
    for _ in 0..n {
        sequences.push(du64(&mut d)?);
    }
    Ok(CustodyAccept {
        flow_source,
        sequences,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acs_roundtrip_single_run() {
        let mut cids: BTreeSet<u64> = (0..4).collect();
        let payload = encode_acs(&mut cids, 16);
        assert!(cids.is_empty());

        let runs = decode_acs(&payload).unwrap();
        assert!(runs.succeeded);
        assert_eq!(runs.runs, vec![(0, 4)]);
        assert_eq!(runs.cids().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_acs_roundtrip_sparse() {
        let mut cids: BTreeSet<u64> = [1, 2, 3, 7, 9, 10, 500].into_iter().collect();
        let payload = encode_acs(&mut cids, 16);
        assert!(cids.is_empty());

        let runs = decode_acs(&payload).unwrap();
        assert_eq!(runs.runs, vec![(1, 3), (7, 1), (9, 2), (500, 1)]);
        assert_eq!(
            runs.cids().collect::<Vec<_>>(),
            vec![1, 2, 3, 7, 9, 10, 500]
        );
    }

    #[test]
    fn test_acs_respects_fill_limit() {
        let mut cids: BTreeSet<u64> = [0, 2, 4, 6, 8].into_iter().collect();
        let payload = encode_acs(&mut cids, 2);

        // Two runs drained, three CIDs left for the next bundle.
        assert_eq!(decode_acs(&payload).unwrap().runs.len(), 2);
        assert_eq!(cids.len(), 3);

        let rest = encode_acs(&mut cids, 16);
        assert_eq!(decode_acs(&rest).unwrap().runs.len(), 3);
        assert!(cids.is_empty());
    }

    #[test]
    fn test_short_record_is_parse_error() {
        assert!(matches!(
            peek_record_type(&[0x40]),
            Err(CodecError::Parse(_))
        ));
        assert!(matches!(decode_acs(&[]), Err(CodecError::Parse(_))));
    }

    #[test]
    fn test_unknown_record_type() {
        // Type 3 in the high nibble.
        assert!(matches!(
            decode_acs(&[0x30, 0x01]),
            Err(CodecError::UnknownRecord(3))
        ));
    }

    #[test]
    fn test_custody_accept_roundtrip() {
        let accept = CustodyAccept {
            flow_source: EndpointId::new(100, 4),
            sequences: vec![3, 5, 8, 13],
        };
        let payload = encode_custody_accept(&accept).unwrap();
        assert_eq!(decode_custody_accept(&payload).unwrap(), accept);
    }
}
