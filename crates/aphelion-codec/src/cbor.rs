//! Thin minicbor wrappers shared by the v7 block codec and admin records.
//!
//! Every helper collapses the encoder/decoder error into [`CodecError`] so
//! call sites stay flat.

use aphelion_core::EndpointId;
use minicbor::{Decoder, Encoder};

use crate::error::CodecError;

/// ipn endpoint scheme number
pub(crate) const IPN_SCHEME: u64 = 2;

pub(crate) type Enc<'a> = Encoder<&'a mut Vec<u8>>;

pub(crate) fn bad_encode<E>(_: E) -> CodecError {
    CodecError::Parse("cbor encode")
}

pub(crate) fn bad_decode<E>(_: E) -> CodecError {
    CodecError::Parse("cbor")
}

pub(crate) fn earr(e: &mut Enc<'_>, len: u64) -> Result<(), CodecError> {
    e.array(len).map(|_| ()).map_err(bad_encode)
}

pub(crate) fn eu64(e: &mut Enc<'_>, v: u64) -> Result<(), CodecError> {
    e.u64(v).map(|_| ()).map_err(bad_encode)
}

pub(crate) fn ebytes(e: &mut Enc<'_>, v: &[u8]) -> Result<(), CodecError> {
    e.bytes(v).map(|_| ()).map_err(bad_encode)
}

pub(crate) fn eeid(e: &mut Enc<'_>, eid: EndpointId) -> Result<(), CodecError> {
    earr(e, 2)?;
    eu64(e, IPN_SCHEME)?;
    earr(e, 2)?;
    eu64(e, eid.node as u64)?;
    eu64(e, eid.service as u64)
}

pub(crate) fn darr(d: &mut Decoder<'_>) -> Result<u64, CodecError> {
    d.array()
        .map_err(bad_decode)?
        .ok_or(CodecError::Parse("indefinite inner array"))
}

pub(crate) fn du64(d: &mut Decoder<'_>) -> Result<u64, CodecError> {
    d.u64().map_err(bad_decode)
}

pub(crate) fn dbytes<'b>(d: &mut Decoder<'b>) -> Result<&'b [u8], CodecError> {
    d.bytes().map_err(bad_decode)
}

pub(crate) fn deid(d: &mut Decoder<'_>) -> Result<EndpointId, CodecError> {
    if darr(d)? != 2 {
        return Err(CodecError::Parse("endpoint arity"));
    }
    if du64(d)? != IPN_SCHEME {
        return Err(CodecError::Unsupported("non-ipn endpoint scheme"));
    }
    if darr(d)? != 2 {
        return Err(CodecError::Parse("ipn endpoint arity"));
    }
    let node = du64(d)?;
    let service = du64(d)?;
    if node > u32::MAX as u64 || service > u32::MAX as u64 {
        return Err(CodecError::Parse("ipn number out of range"));
    }
    Ok(EndpointId::new(node as u32, service as u32))
}
