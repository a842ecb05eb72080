//! # k2mm-protocol
//!
//! Wire format for k2mm, a small diagnostics and remote-memory protocol carried
//! one frame per datagram.
//!
//! This crate provides:
//! - A bit-field layout engine shared by every header on the wire
//! - The packet header (magic, probe flags, address/port sizes)
//! - The Etherbone-style record sub-format for burst reads and writes
//! - Word packing with configurable wire endianness

pub mod codec;
pub mod error;
pub mod field;
pub mod packet;
pub mod record;

pub use codec::{Endianness, WordCodec};
pub use error::ProtocolError;
pub use field::HeaderField;
pub use packet::{header_length, PacketFlags, PacketHeader, MAGIC, MIN_HEADER_LENGTH};
pub use record::{Reads, Record, RecordCodec, RecordFlags, RecordHeader, Writes};

/// Protocol version written into every packet header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default UDP port shared by all k2mm traffic.
pub const DEFAULT_PORT: u16 = 50000;

/// Largest burst a single record can describe.
pub const MAX_BURST: usize = 255;
