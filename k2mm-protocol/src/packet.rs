//! k2mm packet header.
//!
//! Header layout (zero-padded to `max(beat_bytes, 8)` bytes):
//!
//! ```text
//! +--------+--------+----------------------+-----------+-----------+---------+
//! | magic  | magic  | ver[7:4] nr pr pf    | addr_size | port_size | padding |
//! | byte 0 | byte 1 | byte 2               | byte 3    | byte 4    | ...     |
//! +--------+--------+----------------------+-----------+-----------+---------+
//! ```
//!
//! Only the probe and response flags are meaningful to the traffic handlers; magic,
//! version and the size fields are filled by the packetizer.

use crate::error::ProtocolError;
use crate::field::HeaderField;
use bytes::BytesMut;

/// Magic value opening every k2mm packet.
pub const MAGIC: u16 = 0x4F6F;

/// Smallest header length in bytes. Wider beats pad the header to one full beat.
pub const MIN_HEADER_LENGTH: usize = 8;

const MAGIC_FIELD: HeaderField = HeaderField::new(0, 0, 16);
const VERSION_FIELD: HeaderField = HeaderField::new(2, 4, 4);
const NR_FIELD: HeaderField = HeaderField::new(2, 2, 1);
const PR_FIELD: HeaderField = HeaderField::new(2, 1, 1);
const PF_FIELD: HeaderField = HeaderField::new(2, 0, 1);
const ADDR_SIZE_FIELD: HeaderField = HeaderField::new(3, 0, 8);
const PORT_SIZE_FIELD: HeaderField = HeaderField::new(4, 0, 8);

/// Returns the header length used on a link with `beat_bytes` wide beats.
pub fn header_length(beat_bytes: usize) -> usize {
    beat_bytes.max(MIN_HEADER_LENGTH)
}

/// User-visible packet flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// Probe request (`pf`).
    pub const PROBE_REQUEST: u8 = 1 << 0;
    /// Probe response (`pr`).
    pub const PROBE_RESPONSE: u8 = 1 << 1;
    /// No response requested (`nr`).
    pub const NO_RESPONSE: u8 = 1 << 2;

    const MASK: u8 = 0x07;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_probe_request(mut self) -> Self {
        self.0 |= Self::PROBE_REQUEST;
        self
    }

    pub fn with_probe_response(mut self) -> Self {
        self.0 |= Self::PROBE_RESPONSE;
        self
    }

    pub fn with_no_response(mut self) -> Self {
        self.0 |= Self::NO_RESPONSE;
        self
    }

    pub fn is_probe_request(&self) -> bool {
        self.0 & Self::PROBE_REQUEST != 0
    }

    pub fn is_probe_response(&self) -> bool {
        self.0 & Self::PROBE_RESPONSE != 0
    }

    pub fn is_no_response(&self) -> bool {
        self.0 & Self::NO_RESPONSE != 0
    }

    /// Turns a probe request into the matching response, keeping every other flag.
    pub fn into_probe_response(self) -> Self {
        Self((self.0 & !Self::PROBE_REQUEST) | Self::PROBE_RESPONSE)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Builds flags from raw bits, ignoring bits outside the flag mask.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::MASK)
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic: u16,
    pub version: u8,
    pub flags: PacketFlags,
    /// Address size in bytes.
    pub addr_size: u8,
    /// Port size in bytes.
    pub port_size: u8,
}

impl PacketHeader {
    /// Creates a header for a link with `beat_bytes` wide beats.
    pub fn new(flags: PacketFlags, beat_bytes: usize) -> Self {
        let size = beat_bytes.min(u8::MAX as usize) as u8;
        Self {
            magic: MAGIC,
            version: crate::PROTOCOL_VERSION,
            flags,
            addr_size: size,
            port_size: size,
        }
    }

    pub fn has_valid_magic(&self) -> bool {
        self.magic == MAGIC
    }

    /// Encodes the header into a zero-padded buffer of `header_len` bytes.
    pub fn encode(&self, header_len: usize) -> BytesMut {
        let mut buf = BytesMut::zeroed(header_len.max(MIN_HEADER_LENGTH));

        MAGIC_FIELD.insert(&mut buf, self.magic as u64);
        VERSION_FIELD.insert(&mut buf, self.version as u64);
        NR_FIELD.insert(&mut buf, self.flags.is_no_response() as u64);
        PR_FIELD.insert(&mut buf, self.flags.is_probe_response() as u64);
        PF_FIELD.insert(&mut buf, self.flags.is_probe_request() as u64);
        ADDR_SIZE_FIELD.insert(&mut buf, self.addr_size as u64);
        PORT_SIZE_FIELD.insert(&mut buf, self.port_size as u64);

        buf
    }

    /// Decodes a header occupying the first `header_len` bytes of `buf`.
    ///
    /// The magic value is reported as-is; callers decide whether a mismatch voids
    /// the frame.
    pub fn decode(buf: &[u8], header_len: usize) -> Result<Self, ProtocolError> {
        let header_len = header_len.max(MIN_HEADER_LENGTH);
        if buf.len() < header_len {
            return Err(ProtocolError::Truncated {
                needed: header_len,
                available: buf.len(),
            });
        }

        let mut flags = PacketFlags::new();
        if PF_FIELD.extract(buf) == 1 {
            flags = flags.with_probe_request();
        }
        if PR_FIELD.extract(buf) == 1 {
            flags = flags.with_probe_response();
        }
        if NR_FIELD.extract(buf) == 1 {
            flags = flags.with_no_response();
        }

        Ok(Self {
            magic: MAGIC_FIELD.extract(buf) as u16,
            version: VERSION_FIELD.extract(buf) as u8,
            flags,
            addr_size: ADDR_SIZE_FIELD.extract(buf) as u8,
            port_size: PORT_SIZE_FIELD.extract(buf) as u8,
        })
    }

    /// Reads the magic value from the first two bytes, if present.
    pub fn peek_magic(buf: &[u8]) -> Option<u16> {
        if buf.len() < MAGIC_FIELD.end() {
            return None;
        }
        Some(MAGIC_FIELD.extract(buf) as u16)
    }

    /// Decodes a header and rejects it unless the magic matches.
    pub fn decode_checked(buf: &[u8], header_len: usize) -> Result<Self, ProtocolError> {
        let header = Self::decode(buf, header_len)?;
        if !header.has_valid_magic() {
            return Err(ProtocolError::MagicMismatch(header.magic));
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_length() {
        assert_eq!(header_length(4), 8);
        assert_eq!(header_length(8), 8);
        assert_eq!(header_length(32), 32);
    }

    #[test]
    fn test_header_wire_layout() {
        let header = PacketHeader::new(PacketFlags::new().with_probe_request(), 4);
        let encoded = header.encode(header_length(4));

        assert_eq!(
            encoded.as_ref(),
            &[0x4F, 0x6F, 0x11, 0x04, 0x04, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_header_roundtrip_wide_beat() {
        let header = PacketHeader::new(PacketFlags::new().with_no_response(), 32);
        let encoded = header.encode(header_length(32));
        assert_eq!(encoded.len(), 32);
        assert!(encoded[5..].iter().all(|&b| b == 0));

        let decoded = PacketHeader::decode(&encoded, 32).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.has_valid_magic());
    }

    #[test]
    fn test_decode_truncated() {
        let result = PacketHeader::decode(&[0x4F, 0x6F, 0x00], 8);
        assert_eq!(
            result,
            Err(ProtocolError::Truncated {
                needed: 8,
                available: 3
            })
        );
    }

    #[test]
    fn test_decode_checked_rejects_bad_magic() {
        let mut encoded = PacketHeader::new(PacketFlags::new(), 4).encode(8);
        encoded[0] = 0x12;
        encoded[1] = 0x34;

        let decoded = PacketHeader::decode(&encoded, 8).unwrap();
        assert_eq!(decoded.magic, 0x1234);
        assert!(!decoded.has_valid_magic());

        let result = PacketHeader::decode_checked(&encoded, 8);
        assert_eq!(result, Err(ProtocolError::MagicMismatch(0x1234)));
    }

    #[test]
    fn test_peek_magic() {
        assert_eq!(PacketHeader::peek_magic(&[0x4F, 0x6F, 0xFF]), Some(MAGIC));
        assert_eq!(PacketHeader::peek_magic(&[0x4F]), None);
    }

    #[test]
    fn test_packet_flags() {
        let flags = PacketFlags::new().with_probe_request().with_no_response();
        assert!(flags.is_probe_request());
        assert!(!flags.is_probe_response());
        assert!(flags.is_no_response());

        let response = flags.into_probe_response();
        assert!(!response.is_probe_request());
        assert!(response.is_probe_response());
        assert!(response.is_no_response());

        assert_eq!(PacketFlags::from_bits(0xFF).bits(), 0x07);
    }

    proptest! {
        #[test]
        fn prop_header_roundtrip(
            version in 0u8..16,
            flag_bits in 0u8..8,
            addr_size: u8,
            port_size: u8,
            beat_pow in 2u32..7,
        ) {
            let beat_bytes = 1usize << beat_pow;
            let header = PacketHeader {
                magic: MAGIC,
                version,
                flags: PacketFlags::from_bits(flag_bits),
                addr_size,
                port_size,
            };
            let len = header_length(beat_bytes);
            let encoded = header.encode(len);
            prop_assert_eq!(encoded.len(), len);
            prop_assert_eq!(PacketHeader::decode(&encoded, len).unwrap(), header);
        }
    }
}
