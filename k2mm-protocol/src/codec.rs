//! Word packing for record payloads.
//!
//! Record addresses and data travel as one beat-wide word each. With big-endian wire
//! order every word is byte-reversed relative to the stream's lane order, on both the
//! encode and decode side.

use crate::error::ProtocolError;
use bytes::BufMut;
use serde::{Deserialize, Serialize};

/// Byte order of record words on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endianness {
    /// Most significant byte first.
    #[default]
    Big,
    /// Stream lane order, least significant byte first.
    Little,
}

/// Packs and unpacks fixed-width words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WordCodec {
    bytes: usize,
    endianness: Endianness,
}

impl WordCodec {
    /// Creates a codec for `bytes`-wide words (1..=8).
    pub fn new(bytes: usize, endianness: Endianness) -> Result<Self, ProtocolError> {
        if bytes == 0 || bytes > 8 {
            return Err(ProtocolError::UnsupportedWidth {
                what: "word",
                bits: bytes * 8,
            });
        }
        Ok(Self { bytes, endianness })
    }

    /// Word width in bytes.
    pub fn width(&self) -> usize {
        self.bytes
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Largest value representable in one word.
    pub fn max_value(&self) -> u64 {
        if self.bytes == 8 {
            u64::MAX
        } else {
            (1u64 << (self.bytes * 8)) - 1
        }
    }

    /// Appends `value` (truncated to the word width) to `buf`.
    pub fn put_word<B: BufMut>(&self, buf: &mut B, value: u64) {
        match self.endianness {
            Endianness::Big => buf.put_slice(&value.to_be_bytes()[8 - self.bytes..]),
            Endianness::Little => buf.put_slice(&value.to_le_bytes()[..self.bytes]),
        }
    }

    /// Reads the word starting at `buf[0]`.
    pub fn get_word(&self, buf: &[u8]) -> Result<u64, ProtocolError> {
        if buf.len() < self.bytes {
            return Err(ProtocolError::Truncated {
                needed: self.bytes,
                available: buf.len(),
            });
        }

        let mut raw = [0u8; 8];
        let value = match self.endianness {
            Endianness::Big => {
                raw[8 - self.bytes..].copy_from_slice(&buf[..self.bytes]);
                u64::from_be_bytes(raw)
            }
            Endianness::Little => {
                raw[..self.bytes].copy_from_slice(&buf[..self.bytes]);
                u64::from_le_bytes(raw)
            }
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_big_endian_word() {
        let codec = WordCodec::new(4, Endianness::Big).unwrap();
        let mut buf = BytesMut::new();
        codec.put_word(&mut buf, 0x1122_3344);

        assert_eq!(buf.as_ref(), &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(codec.get_word(&buf).unwrap(), 0x1122_3344);
    }

    #[test]
    fn test_little_endian_word() {
        let codec = WordCodec::new(4, Endianness::Little).unwrap();
        let mut buf = BytesMut::new();
        codec.put_word(&mut buf, 0x1122_3344);

        assert_eq!(buf.as_ref(), &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(codec.get_word(&buf).unwrap(), 0x1122_3344);
    }

    #[test]
    fn test_endianness_is_a_byte_reversal() {
        let big = WordCodec::new(8, Endianness::Big).unwrap();
        let little = WordCodec::new(8, Endianness::Little).unwrap();

        let mut a = BytesMut::new();
        let mut b = BytesMut::new();
        big.put_word(&mut a, 0x0102_0304_0506_0708);
        little.put_word(&mut b, 0x0102_0304_0506_0708);

        let mut reversed = b.to_vec();
        reversed.reverse();
        assert_eq!(a.as_ref(), reversed.as_slice());
    }

    #[test]
    fn test_value_truncated_to_word() {
        let codec = WordCodec::new(4, Endianness::Big).unwrap();
        let mut buf = BytesMut::new();
        codec.put_word(&mut buf, 0xAABB_CCDD_1122_3344);
        assert_eq!(codec.get_word(&buf).unwrap(), 0x1122_3344);
        assert_eq!(codec.max_value(), 0xFFFF_FFFF);
    }

    #[test]
    fn test_short_buffer() {
        let codec = WordCodec::new(8, Endianness::Little).unwrap();
        let result = codec.get_word(&[1, 2, 3]);
        assert!(matches!(
            result,
            Err(ProtocolError::Truncated {
                needed: 8,
                available: 3
            })
        ));
    }

    #[test]
    fn test_unsupported_width() {
        assert!(WordCodec::new(0, Endianness::Big).is_err());
        assert!(WordCodec::new(16, Endianness::Big).is_err());
    }
}
