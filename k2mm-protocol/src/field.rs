//! Bit-field layout shared by all k2mm headers.
//!
//! A header is a zero-padded byte buffer. Each field occupies `width` bits starting at
//! bit `offset` of byte `byte`, with bits numbered little-endian across the buffer:
//! absolute bit `k` lives in byte `k / 8` at position `k % 8`.
//!
//! Fields that span whole bytes (width a multiple of 8, wider than one byte) are
//! byte-reversed before insertion and after extraction. For byte-aligned fields this
//! puts the most significant byte first on the wire.

/// Position and width of one header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderField {
    /// Byte offset of the field's least significant bit.
    pub byte: usize,
    /// Bit offset within that byte.
    pub offset: usize,
    /// Width in bits (1..=64).
    pub width: usize,
}

impl HeaderField {
    pub const fn new(byte: usize, offset: usize, width: usize) -> Self {
        Self {
            byte,
            offset,
            width,
        }
    }

    /// Number of buffer bytes required to hold this field.
    pub const fn end(&self) -> usize {
        (self.byte * 8 + self.offset + self.width).div_ceil(8)
    }

    /// Largest value the field can hold.
    pub const fn max_value(&self) -> u64 {
        if self.width >= 64 {
            u64::MAX
        } else {
            (1u64 << self.width) - 1
        }
    }

    fn is_swapped(&self) -> bool {
        self.width > 8 && self.width % 8 == 0
    }

    /// Writes `value` into `buf`. Bits above the field width are ignored.
    ///
    /// `buf` must be at least [`end`](Self::end) bytes long.
    pub fn insert(&self, buf: &mut [u8], value: u64) {
        let mut value = value & self.max_value();
        if self.is_swapped() {
            value = reverse_bytes(value, self.width / 8);
        }

        let start = self.byte * 8 + self.offset;
        for i in 0..self.width {
            let pos = start + i;
            let bit = 1u8 << (pos % 8);
            if (value >> i) & 1 == 1 {
                buf[pos / 8] |= bit;
            } else {
                buf[pos / 8] &= !bit;
            }
        }
    }

    /// Reads the field from `buf`.
    ///
    /// `buf` must be at least [`end`](Self::end) bytes long.
    pub fn extract(&self, buf: &[u8]) -> u64 {
        let start = self.byte * 8 + self.offset;
        let mut value = 0u64;
        for i in 0..self.width {
            let pos = start + i;
            if buf[pos / 8] & (1u8 << (pos % 8)) != 0 {
                value |= 1 << i;
            }
        }

        if self.is_swapped() {
            value = reverse_bytes(value, self.width / 8);
        }
        value
    }
}

/// Reverses the low `n` bytes of `value`.
fn reverse_bytes(value: u64, n: usize) -> u64 {
    value.swap_bytes() >> (64 - 8 * n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sixteen_bit_field_is_big_endian() {
        let field = HeaderField::new(0, 0, 16);
        let mut buf = [0u8; 8];
        field.insert(&mut buf, 0x4F6F);

        assert_eq!(&buf[..2], &[0x4F, 0x6F]);
        assert_eq!(field.extract(&buf), 0x4F6F);
    }

    #[test]
    fn test_single_bit_fields_share_a_byte() {
        let pf = HeaderField::new(2, 0, 1);
        let pr = HeaderField::new(2, 1, 1);
        let nr = HeaderField::new(2, 2, 1);
        let version = HeaderField::new(2, 4, 4);

        let mut buf = [0u8; 8];
        pf.insert(&mut buf, 1);
        nr.insert(&mut buf, 1);
        version.insert(&mut buf, 0xA);

        assert_eq!(buf[2], 0b1010_0101);
        assert_eq!(pf.extract(&buf), 1);
        assert_eq!(pr.extract(&buf), 0);
        assert_eq!(nr.extract(&buf), 1);
        assert_eq!(version.extract(&buf), 0xA);

        pf.insert(&mut buf, 0);
        assert_eq!(buf[2], 0b1010_0100);
    }

    #[test]
    fn test_value_truncated_to_width() {
        let field = HeaderField::new(0, 4, 4);
        let mut buf = [0u8; 1];
        field.insert(&mut buf, 0x1F);

        assert_eq!(buf[0], 0xF0);
        assert_eq!(field.extract(&buf), 0xF);
    }

    #[test]
    fn test_wide_field_reversal() {
        let field = HeaderField::new(4, 0, 32);
        let mut buf = [0u8; 8];
        field.insert(&mut buf, 0x1122_3344);

        assert_eq!(&buf[4..], &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(field.extract(&buf), 0x1122_3344);
    }

    #[test]
    fn test_sub_byte_field_not_reversed() {
        // 4-bit byte-enable mask at byte 4
        let field = HeaderField::new(4, 0, 4);
        let mut buf = [0u8; 8];
        field.insert(&mut buf, 0b0011);
        assert_eq!(buf[4], 0b0011);
    }

    #[test]
    fn test_field_end_and_max() {
        assert_eq!(HeaderField::new(0, 0, 16).end(), 2);
        assert_eq!(HeaderField::new(2, 4, 4).end(), 3);
        assert_eq!(HeaderField::new(4, 0, 64).end(), 12);
        assert_eq!(HeaderField::new(0, 0, 1).max_value(), 1);
        assert_eq!(HeaderField::new(0, 0, 64).max_value(), u64::MAX);
    }

    #[test]
    fn test_full_width_field() {
        let field = HeaderField::new(0, 0, 64);
        let mut buf = [0u8; 8];
        field.insert(&mut buf, 0x0102_0304_0506_0708);
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(field.extract(&buf), 0x0102_0304_0506_0708);
    }
}
