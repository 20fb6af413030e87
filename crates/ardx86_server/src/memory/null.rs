use super::{DefaultStrategy, MemoryBackend};

/// Reads zero, discards writes. Used when no usable memory is configured.
#[derive(Copy, Clone, Debug, Default)]
pub struct NullBackend;

impl MemoryBackend for NullBackend {
    fn size(&self) -> usize {
        0
    }

    fn read_u8(&self, _address: u32) -> u8 {
        0
    }

    fn write_u8(&mut self, _address: u32, _value: u8) {}

    fn erase(&mut self) {}

    fn set_strategy(&mut self, _strategy: DefaultStrategy) {}

    fn strategy(&self) -> DefaultStrategy {
        DefaultStrategy::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ardx86_common::ServerError;

    #[test]
    fn test_null_backend_rejects_ranges() {
        let mut mem = NullBackend;
        assert!(mem.read_range(0, 0).unwrap().is_empty());
        assert!(matches!(
            mem.read_range(0, u32::MAX as usize),
            Err(ServerError::MemoryRangeError { address: 0, .. })
        ));
        assert!(matches!(
            mem.set_range(0x100, &[0xAA]),
            Err(ServerError::MemoryRangeError { address: 0x100, len: 1 })
        ));
        assert_eq!(mem.read_u8(0x100), 0);
    }
}
