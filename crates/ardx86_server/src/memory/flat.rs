use super::{DefaultStrategy, MemoryBackend};

/// A contiguous byte array covering the whole address space.
pub struct FlatBackend {
    mem: Vec<u8>,
    strategy: DefaultStrategy,
}

impl FlatBackend {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            strategy: DefaultStrategy::default(),
        }
    }
}

impl Default for FlatBackend {
    fn default() -> Self {
        FlatBackend::new(0x10_0000)
    }
}

impl MemoryBackend for FlatBackend {
    fn size(&self) -> usize {
        self.mem.len()
    }

    fn read_u8(&self, address: u32) -> u8 {
        self.mem.get(address as usize).copied().unwrap_or(0xFF)
    }

    fn write_u8(&mut self, address: u32, value: u8) {
        if let Some(byte) = self.mem.get_mut(address as usize) {
            *byte = value;
        }
    }

    fn erase(&mut self) {
        let strategy = self.strategy;
        for (address, byte) in self.mem.iter_mut().enumerate() {
            *byte = strategy.byte_for(address as u32);
        }
    }

    fn set_strategy(&mut self, strategy: DefaultStrategy) {
        self.strategy = strategy;
    }

    fn strategy(&self) -> DefaultStrategy {
        self.strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ardx86_common::{MemoryStrategy, ServerError};

    #[test]
    fn test_bulk_out_of_range() {
        let mut mem = FlatBackend::new(0x100);
        assert_eq!(
            mem.set_range(0xFE, &[1, 2, 3]),
            Err(ServerError::MemoryRangeError {
                address: 0xFE,
                len: 3
            })
        );
        assert!(mem.read_range(0x100, 1).is_err());
        assert!(mem.set_range(0xFD, &[1, 2, 3]).is_ok());
        // Bus traffic out of range is ignored.
        mem.write_u16(0x200, 0x1234);
        assert_eq!(mem.read_u8(0x200), 0xFF);
    }

    #[test]
    fn test_erase_applies_strategy() {
        let mut mem = FlatBackend::new(0x100);
        mem.write_u8(0x10, 0x55);
        mem.set_strategy(DefaultStrategy::new(MemoryStrategy::Ones, 0));
        mem.erase();
        assert_eq!(mem.read_u16(0x10), 0xFFFF);
        mem.randomize(42);
        let expected = DefaultStrategy::new(MemoryStrategy::Random, 42).word_for(0x20);
        assert_eq!(mem.read_u16(0x20), expected);
    }
}
