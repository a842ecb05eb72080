//! Etherbone-style burst records.
//!
//! A record rides inside the payload of a k2mm packet:
//!
//! ```text
//! +-------------------------------+--------+--------+-------------+---------+
//! | bca rca rff . cyc wca wff .   | (rsvd) | wcount | rcount      | be ...  |
//! | byte 0                        | byte 1 | byte 2 | byte 3      | byte 4+ |
//! +-------------------------------+--------+--------+-------------+---------+
//! | [base_write_addr] [data x wcount] [base_ret_addr] [addr x rcount]       |
//! +-------------------------------------------------------------------------+
//! ```
//!
//! The header is padded to an 8-byte boundary. Every address and data word is one
//! beat wide and subject to the configured wire endianness.

use crate::codec::{Endianness, WordCodec};
use crate::error::ProtocolError;
use crate::field::HeaderField;
use crate::MAX_BURST;
use bytes::BytesMut;

const BCA_FIELD: HeaderField = HeaderField::new(0, 0, 1);
const RCA_FIELD: HeaderField = HeaderField::new(0, 1, 1);
const RFF_FIELD: HeaderField = HeaderField::new(0, 2, 1);
const CYC_FIELD: HeaderField = HeaderField::new(0, 4, 1);
const WCA_FIELD: HeaderField = HeaderField::new(0, 5, 1);
const WFF_FIELD: HeaderField = HeaderField::new(0, 6, 1);
const WCOUNT_FIELD: HeaderField = HeaderField::new(2, 0, 8);
const RCOUNT_FIELD: HeaderField = HeaderField::new(3, 0, 8);

const HEADER_ALIGN: usize = 8;

fn byte_enable_field(beat_bytes: usize) -> HeaderField {
    HeaderField::new(4, 0, beat_bytes)
}

/// Returns the record header length for `beat_bytes` wide beats.
///
/// Padding is always added, so a length already on an 8-byte boundary grows by
/// a whole block.
pub fn record_header_length(beat_bytes: usize) -> usize {
    let len = 4 + beat_bytes / 8;
    len + (HEADER_ALIGN - len % HEADER_ALIGN)
}

/// Reserved record control bits. Carried through unchanged, never interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RecordFlags(u8);

impl RecordFlags {
    pub const BCA: u8 = 1 << 0;
    pub const RCA: u8 = 1 << 1;
    pub const RFF: u8 = 1 << 2;
    pub const CYC: u8 = 1 << 4;
    pub const WCA: u8 = 1 << 5;
    pub const WFF: u8 = 1 << 6;

    const MASK: u8 = 0x77;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::MASK)
    }

    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    fn fields() -> [(u8, HeaderField); 6] {
        [
            (Self::BCA, BCA_FIELD),
            (Self::RCA, RCA_FIELD),
            (Self::RFF, RFF_FIELD),
            (Self::CYC, CYC_FIELD),
            (Self::WCA, WCA_FIELD),
            (Self::WFF, WFF_FIELD),
        ]
    }
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub flags: RecordFlags,
    pub wcount: u8,
    pub rcount: u8,
    pub byte_enable: u64,
}

impl RecordHeader {
    pub fn encode(&self, beat_bytes: usize) -> BytesMut {
        let mut buf = BytesMut::zeroed(record_header_length(beat_bytes));
        for (flag, field) in RecordFlags::fields() {
            field.insert(&mut buf, self.flags.contains(flag) as u64);
        }
        WCOUNT_FIELD.insert(&mut buf, self.wcount as u64);
        RCOUNT_FIELD.insert(&mut buf, self.rcount as u64);
        byte_enable_field(beat_bytes).insert(&mut buf, self.byte_enable);
        buf
    }

    pub fn decode(buf: &[u8], beat_bytes: usize) -> Result<Self, ProtocolError> {
        let len = record_header_length(beat_bytes);
        if buf.len() < len {
            return Err(ProtocolError::Truncated {
                needed: len,
                available: buf.len(),
            });
        }

        let mut bits = 0u8;
        for (flag, field) in RecordFlags::fields() {
            if field.extract(buf) == 1 {
                bits |= flag;
            }
        }

        Ok(Self {
            flags: RecordFlags::from_bits(bits),
            wcount: WCOUNT_FIELD.extract(buf) as u8,
            rcount: RCOUNT_FIELD.extract(buf) as u8,
            byte_enable: byte_enable_field(beat_bytes).extract(buf),
        })
    }
}

/// Write half of a record: data for consecutive addresses starting at `base_addr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Writes {
    pub base_addr: u64,
    pub data: Vec<u64>,
}

/// Read half of a record: explicit addresses, answered at `base_ret_addr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reads {
    pub base_ret_addr: u64,
    pub addrs: Vec<u64>,
}

/// A burst read/write record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub flags: RecordFlags,
    pub byte_enable: u64,
    pub writes: Option<Writes>,
    pub reads: Option<Reads>,
}

impl Record {
    /// Creates an empty record with the given byte-enable mask.
    pub fn new(byte_enable: u64) -> Self {
        Self {
            flags: RecordFlags::new(),
            byte_enable,
            writes: None,
            reads: None,
        }
    }

    /// Adds a write burst. An empty burst leaves the record without writes.
    pub fn with_writes(mut self, base_addr: u64, data: Vec<u64>) -> Self {
        self.writes = (!data.is_empty()).then_some(Writes { base_addr, data });
        self
    }

    /// Adds a read burst. An empty burst leaves the record without reads.
    pub fn with_reads(mut self, base_ret_addr: u64, addrs: Vec<u64>) -> Self {
        self.reads = (!addrs.is_empty()).then_some(Reads {
            base_ret_addr,
            addrs,
        });
        self
    }

    pub fn with_flags(mut self, flags: RecordFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn wcount(&self) -> usize {
        self.writes.as_ref().map_or(0, |w| w.data.len())
    }

    pub fn rcount(&self) -> usize {
        self.reads.as_ref().map_or(0, |r| r.addrs.len())
    }

    pub fn is_empty(&self) -> bool {
        self.wcount() == 0 && self.rcount() == 0
    }

    /// Write targets as `(address, data)` pairs, addresses incrementing from the base.
    pub fn write_targets(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.writes.iter().flat_map(|w| {
            w.data
                .iter()
                .enumerate()
                .map(move |(i, &data)| (w.base_addr.wrapping_add(i as u64), data))
        })
    }

    /// Read addresses exactly as supplied by the requester.
    pub fn read_addresses(&self) -> &[u64] {
        self.reads
            .as_ref()
            .map(|r| r.addrs.as_slice())
            .unwrap_or_default()
    }
}

/// Encodes and decodes records for a given beat width, address width and endianness.
#[derive(Debug, Clone, Copy)]
pub struct RecordCodec {
    beat_bytes: usize,
    word: WordCodec,
    addr_mask: u64,
}

impl RecordCodec {
    /// Creates a codec. Beats wider than 64 bits are not supported by the record
    /// format; addresses must be 32 or 64 bits and fit in one beat.
    pub fn new(
        beat_bytes: usize,
        address_bits: usize,
        endianness: Endianness,
    ) -> Result<Self, ProtocolError> {
        if !beat_bytes.is_power_of_two() || !(1..=8).contains(&beat_bytes) {
            return Err(ProtocolError::UnsupportedWidth {
                what: "record beat",
                bits: beat_bytes * 8,
            });
        }
        if !matches!(address_bits, 32 | 64) || address_bits > beat_bytes * 8 {
            return Err(ProtocolError::UnsupportedWidth {
                what: "address",
                bits: address_bits,
            });
        }

        let addr_mask = if address_bits == 64 {
            u64::MAX
        } else {
            (1u64 << address_bits) - 1
        };

        Ok(Self {
            beat_bytes,
            word: WordCodec::new(beat_bytes, endianness)?,
            addr_mask,
        })
    }

    pub fn beat_bytes(&self) -> usize {
        self.beat_bytes
    }

    pub fn header_length(&self) -> usize {
        record_header_length(self.beat_bytes)
    }

    /// Byte-enable mask selecting every byte of a beat.
    pub fn full_byte_enable(&self) -> u64 {
        if self.beat_bytes >= 64 {
            u64::MAX
        } else {
            (1u64 << self.beat_bytes) - 1
        }
    }

    /// Encoded size of a record with the given burst counts.
    pub fn encoded_len(&self, wcount: usize, rcount: usize) -> usize {
        let words = |count: usize| if count > 0 { count + 1 } else { 0 };
        self.header_length() + (words(wcount) + words(rcount)) * self.beat_bytes
    }

    pub fn encode(&self, record: &Record) -> Result<BytesMut, ProtocolError> {
        let (wcount, rcount) = (record.wcount(), record.rcount());
        for count in [wcount, rcount] {
            if count > MAX_BURST {
                return Err(ProtocolError::BurstTooLarge {
                    count,
                    max: MAX_BURST,
                });
            }
        }

        let header = RecordHeader {
            flags: record.flags,
            wcount: wcount as u8,
            rcount: rcount as u8,
            byte_enable: record.byte_enable & self.full_byte_enable(),
        };

        let mut buf = BytesMut::with_capacity(self.encoded_len(wcount, rcount));
        buf.extend_from_slice(&header.encode(self.beat_bytes));

        if let Some(writes) = &record.writes {
            self.word.put_word(&mut buf, writes.base_addr & self.addr_mask);
            for &data in &writes.data {
                self.word.put_word(&mut buf, data);
            }
        }

        if let Some(reads) = &record.reads {
            self.word
                .put_word(&mut buf, reads.base_ret_addr & self.addr_mask);
            for &addr in &reads.addrs {
                self.word.put_word(&mut buf, addr & self.addr_mask);
            }
        }

        Ok(buf)
    }

    /// Decodes one record from the start of `buf`. Bytes past the counted words are
    /// ignored.
    pub fn decode(&self, buf: &[u8]) -> Result<Record, ProtocolError> {
        let header = RecordHeader::decode(buf, self.beat_bytes)?;
        let (wcount, rcount) = (header.wcount as usize, header.rcount as usize);

        let needed = self.encoded_len(wcount, rcount);
        if buf.len() < needed {
            return Err(ProtocolError::Truncated {
                needed,
                available: buf.len(),
            });
        }

        let mut words = buf[self.header_length()..needed].chunks_exact(self.beat_bytes);
        let mut next_word = || -> Result<u64, ProtocolError> {
            let chunk = words.next().ok_or(ProtocolError::Truncated {
                needed,
                available: buf.len(),
            })?;
            self.word.get_word(chunk)
        };

        let mut record = Record::new(header.byte_enable).with_flags(header.flags);

        if wcount > 0 {
            let base_addr = next_word()? & self.addr_mask;
            let data = (0..wcount)
                .map(|_| next_word())
                .collect::<Result<Vec<_>, _>>()?;
            record = record.with_writes(base_addr, data);
        }

        if rcount > 0 {
            let base_ret_addr = next_word()? & self.addr_mask;
            let addrs = (0..rcount)
                .map(|_| next_word().map(|addr| addr & self.addr_mask))
                .collect::<Result<Vec<_>, _>>()?;
            record = record.with_reads(base_ret_addr, addrs);
        }

        Ok(record)
    }
}
