//! Local bus seam for the record bridge.

use std::collections::BTreeMap;

/// One word-sized access on the local bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusTransaction {
    pub write: bool,
    pub address: u64,
    /// Write data; ignored for reads.
    pub data: u64,
    /// Byte lanes taking part in the access.
    pub byte_enable: u64,
    /// Final access of a burst.
    pub last: bool,
}

impl BusTransaction {
    pub fn write(address: u64, data: u64, byte_enable: u64) -> Self {
        Self {
            write: true,
            address,
            data,
            byte_enable,
            last: false,
        }
    }

    pub fn read(address: u64, byte_enable: u64) -> Self {
        Self {
            write: false,
            address,
            data: 0,
            byte_enable,
            last: false,
        }
    }

    pub fn with_last(mut self, last: bool) -> Self {
        self.last = last;
        self
    }
}

/// A memory-mapped bus the bridge drives one access at a time.
///
/// The bridge presents the same transaction on every step until it is acknowledged.
pub trait Bus {
    /// Returns `Some(read data)` once the access is acknowledged. Writes acknowledge
    /// with `Some(0)`.
    fn access(&mut self, txn: &BusTransaction) -> Option<u64>;
}

/// Sparse word-addressed memory with byte-enable support.
#[derive(Debug, Default)]
pub struct MemoryBus {
    words: BTreeMap<u64, u64>,
    wait_states: u32,
    waited: u32,
    accesses: u64,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every access is held for `wait_states` extra polls before acknowledging.
    pub fn with_wait_states(mut self, wait_states: u32) -> Self {
        self.wait_states = wait_states;
        self
    }

    pub fn read_word(&self, address: u64) -> u64 {
        self.words.get(&address).copied().unwrap_or(0)
    }

    pub fn write_word(&mut self, address: u64, value: u64) {
        self.words.insert(address, value);
    }

    /// Acknowledged accesses so far.
    pub fn accesses(&self) -> u64 {
        self.accesses
    }

    fn lane_mask(byte_enable: u64) -> u64 {
        (0..8)
            .filter(|lane| byte_enable & (1 << lane) != 0)
            .fold(0u64, |mask, lane| mask | (0xFF << (lane * 8)))
    }
}

impl Bus for MemoryBus {
    fn access(&mut self, txn: &BusTransaction) -> Option<u64> {
        if self.waited < self.wait_states {
            self.waited += 1;
            return None;
        }
        self.waited = 0;
        self.accesses += 1;

        let mask = Self::lane_mask(txn.byte_enable);
        let current = self.read_word(txn.address);
        if txn.write {
            self.words
                .insert(txn.address, (current & !mask) | (txn.data & mask));
            Some(0)
        } else {
            Some(current & mask)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_write_read() {
        let mut bus = MemoryBus::new();
        assert_eq!(bus.access(&BusTransaction::write(0x10, 0xDEAD_BEEF, 0xF)), Some(0));
        assert_eq!(bus.access(&BusTransaction::read(0x10, 0xF)), Some(0xDEAD_BEEF));
        assert_eq!(bus.read_word(0x11), 0);
        assert_eq!(bus.accesses(), 2);
    }

    #[test]
    fn test_byte_enable_merges() {
        let mut bus = MemoryBus::new();
        bus.write_word(0, 0x1122_3344);
        bus.access(&BusTransaction::write(0, 0xAAAA_AAAA, 0b0101));
        assert_eq!(bus.read_word(0), 0x11AA_33AA);
        assert_eq!(bus.access(&BusTransaction::read(0, 0b0010)), Some(0x0000_3300));
    }

    #[test]
    fn test_wait_states() {
        let mut bus = MemoryBus::new().with_wait_states(2);
        let txn = BusTransaction::write(4, 9, 0xF);
        assert_eq!(bus.access(&txn), None);
        assert_eq!(bus.access(&txn), None);
        assert_eq!(bus.access(&txn), Some(0));
        assert_eq!(bus.read_word(4), 9);
    }
}
