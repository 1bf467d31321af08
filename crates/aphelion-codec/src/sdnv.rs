//! Self-Delimiting Numeric Values
//!
//! An SDNV encodes an unsigned integer big-endian, seven bits per byte; the
//! high bit of every byte except the last is set. The BPv6 primary block
//! reserves a fixed width for each field so that already-serialized headers
//! can be patched in place: [`encode_fixed`] left-pads with `0x80`
//! continuation bytes (leading zero groups) to fill the reserved width
//! exactly, and fails rather than shift neighbouring fields when the value
//! needs more bytes than were reserved.

use crate::error::CodecError;

/// Longest SDNV this codec will decode: 10 bytes holds any u64.
const MAX_BYTES: usize = 10;

/// Number of bytes the minimal encoding of `value` occupies
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Append the minimal encoding of `value`
pub fn encode(value: u64, out: &mut Vec<u8>) {
    let len = encoded_len(value);
    for i in (0..len).rev() {
        let group = ((value >> (7 * i)) & 0x7F) as u8;
        let cont = if i == 0 { 0x00 } else { 0x80 };
        out.push(group | cont);
    }
}

/// Write `value` into exactly `out.len()` bytes
///
/// Pads with `0x80` bytes on the left when the minimal encoding is shorter
/// than the reserved width; fails with [`CodecError::SdnvOverflow`] when it
/// is longer.
pub fn encode_fixed(value: u64, out: &mut [u8]) -> Result<(), CodecError> {
    let len = encoded_len(value);
    if len > out.len() {
        return Err(CodecError::SdnvOverflow);
    }
    let pad = out.len() - len;
    for slot in out.iter_mut().take(pad) {
        *slot = 0x80;
    }
    for i in 0..len {
        let shift = 7 * (len - 1 - i);
        let group = ((value >> shift) & 0x7F) as u8;
        let cont = if i == len - 1 { 0x00 } else { 0x80 };
        out[pad + i] = group | cont;
    }
    Ok(())
}

/// Decode one SDNV from the front of `buf`
///
/// Returns the value and the number of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(u64, usize), CodecError> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= MAX_BYTES {
            return Err(CodecError::SdnvOverflow);
        }
        if value >> 57 != 0 {
            return Err(CodecError::SdnvOverflow);
        }
        value = (value << 7) | u64::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(CodecError::SdnvIncomplete)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_roundtrip() {
        for value in [0, 1, 127, 128, 16383, 16384, 0xFFFF_FFFF, u64::MAX] {
            let mut buf = Vec::new();
            encode(value, &mut buf);
            assert_eq!(buf.len(), encoded_len(value));
            let (decoded, used) = decode(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(used, buf.len());
        }
    }

    #[test]
    fn test_known_encodings() {
        let mut buf = Vec::new();
        encode(0x80, &mut buf);
        assert_eq!(buf, [0x81, 0x00]);

        buf.clear();
        encode(0x7F, &mut buf);
        assert_eq!(buf, [0x7F]);
    }

    #[test]
    fn test_fixed_width_pads_left() {
        let mut field = [0u8; 4];
        encode_fixed(5, &mut field).unwrap();
        assert_eq!(field, [0x80, 0x80, 0x80, 0x05]);
        assert_eq!(decode(&field).unwrap(), (5, 4));
    }

    #[test]
    fn test_fixed_width_overflow() {
        let mut field = [0u8; 2];
        // 16384 needs three 7-bit groups.
        assert!(matches!(
            encode_fixed(16384, &mut field),
            Err(CodecError::SdnvOverflow)
        ));
        // 16383 fits exactly.
        encode_fixed(16383, &mut field).unwrap();
        assert_eq!(decode(&field).unwrap(), (16383, 2));
    }

    #[test]
    fn test_decode_truncated() {
        assert!(matches!(
            decode(&[0x81, 0x80]),
            Err(CodecError::SdnvIncomplete)
        ));
        assert!(matches!(decode(&[]), Err(CodecError::SdnvIncomplete)));
    }

    #[test]
    fn test_decode_overlong() {
        // Eleven continuation bytes can never terminate inside the limit.
        let buf = [0x80u8; 11];
        assert!(matches!(decode(&buf), Err(CodecError::SdnvOverflow)));
    }

    #[test]
    fn test_decode_u64_boundary() {
        let mut buf = Vec::new();
        encode(u64::MAX, &mut buf);
        assert_eq!(buf.len(), 10);
        assert_eq!(decode(&buf).unwrap().0, u64::MAX);

        // Same length but one bit past 64: must be rejected.
        let mut high = buf.clone();
        high[0] |= 0x02;
        assert!(matches!(decode(&high), Err(CodecError::SdnvOverflow)));
    }

    #[test]
    fn test_random_roundtrip() {
        use rand::Rng;
        let mut rng = rand::rng();
        for _ in 0..200 {
            let value: u64 = rng.random();
            let mut buf = Vec::new();
            encode(value, &mut buf);
            assert_eq!(decode(&buf).unwrap(), (value, buf.len()));
        }
    }
}
