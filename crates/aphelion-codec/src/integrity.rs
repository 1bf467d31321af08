//! Integrity cipher suites
//!
//! The integrity block carries a checksum or keyed digest over the payload
//! fragment. Which suite a channel uses is configuration; key management is
//! outside the agent, which only ever sees the 32-byte key material.

use crc::{CRC_16_IBM_SDLC, CRC_32_ISCSI, CRC_32_ISO_HDLC, Crc};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Bytes kept from a keyed BLAKE3 digest.
const KEYED_DIGEST_LEN: usize = 16;

/// CRC-16/X.25 over `data`
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// CRC-32 (IEEE) over `data`
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// CRC-32/Castagnoli over `data`
///
/// Also used by the custody cache as its salted-tuple hash.
pub fn crc32c(data: &[u8]) -> u32 {
    CRC32C.checksum(data)
}

/// Integrity suite carried by the integrity block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CipherSuite {
    /// CRC-16/X.25, two-byte result
    #[default]
    Crc16X25,
    /// CRC-32/Castagnoli, four-byte result
    Crc32Castagnoli,
    /// Keyed BLAKE3, truncated to sixteen bytes
    KeyedBlake3,
}

impl CipherSuite {
    /// Wire identifier of the suite
    pub fn id(self) -> u64 {
        match self {
            CipherSuite::Crc16X25 => 2,
            CipherSuite::Crc32Castagnoli => 3,
            CipherSuite::KeyedBlake3 => 9,
        }
    }

    /// Suite from its wire identifier
    pub fn from_id(id: u64) -> Result<Self, CodecError> {
        match id {
            2 => Ok(CipherSuite::Crc16X25),
            3 => Ok(CipherSuite::Crc32Castagnoli),
            9 => Ok(CipherSuite::KeyedBlake3),
            _ => Err(CodecError::Unsupported("integrity cipher suite")),
        }
    }

    /// Length in bytes of this suite's result
    pub fn result_len(self) -> usize {
        match self {
            CipherSuite::Crc16X25 => 2,
            CipherSuite::Crc32Castagnoli => 4,
            CipherSuite::KeyedBlake3 => KEYED_DIGEST_LEN,
        }
    }

    /// Compute the integrity result over `data`
    ///
    /// `key` is required for keyed suites and ignored otherwise.
    pub fn compute(self, key: Option<&[u8; 32]>, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self {
            CipherSuite::Crc16X25 => Ok(crc16(data).to_be_bytes().to_vec()),
            CipherSuite::Crc32Castagnoli => Ok(crc32c(data).to_be_bytes().to_vec()),
            CipherSuite::KeyedBlake3 => {
                let key = key.ok_or(CodecError::Unsupported("keyed suite without a key"))?;
                let digest = blake3::keyed_hash(key, data);
                Ok(digest.as_bytes()[..KEYED_DIGEST_LEN].to_vec())
            }
        }
    }

    /// Verify a previously-computed result over `data`
    pub fn verify(
        self,
        key: Option<&[u8; 32]>,
        data: &[u8],
        result: &[u8],
    ) -> Result<bool, CodecError> {
        Ok(self.compute(key, data)? == result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_check_values() {
        // Standard check inputs for the chosen polynomials.
        assert_eq!(crc16(b"123456789"), 0x906E);
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32c(b"123456789"), 0xE306_9283);
    }

    #[test]
    fn test_suite_id_roundtrip() {
        for suite in [
            CipherSuite::Crc16X25,
            CipherSuite::Crc32Castagnoli,
            CipherSuite::KeyedBlake3,
        ] {
            assert_eq!(CipherSuite::from_id(suite.id()).unwrap(), suite);
        }
        assert!(CipherSuite::from_id(7).is_err());
    }

    #[test]
    fn test_compute_and_verify() {
        let data = b"the payload fragment";
        for suite in [CipherSuite::Crc16X25, CipherSuite::Crc32Castagnoli] {
            let result = suite.compute(None, data).unwrap();
            assert_eq!(result.len(), suite.result_len());
            assert!(suite.verify(None, data, &result).unwrap());
            assert!(!suite.verify(None, b"tampered", &result).unwrap());
        }
    }

    #[test]
    fn test_keyed_suite_needs_key() {
        let key = [7u8; 32];
        let data = b"payload";
        assert!(CipherSuite::KeyedBlake3.compute(None, data).is_err());

        let result = CipherSuite::KeyedBlake3.compute(Some(&key), data).unwrap();
        assert_eq!(result.len(), 16);
        assert!(
            CipherSuite::KeyedBlake3
                .verify(Some(&key), data, &result)
                .unwrap()
        );

        let other = [8u8; 32];
        assert!(
            !CipherSuite::KeyedBlake3
                .verify(Some(&other), data, &result)
                .unwrap()
        );
    }
}
