use super::{lowbias32, DefaultStrategy, MemoryBackend};

const EMPTY_KEY: u32 = u32::MAX;

/// An open-addressing table of 16-bit words keyed by `address >> 1`.
///
/// Only written words are stored. Everything else is synthesized by the default strategy,
/// which lets a small table stand in for a 16MB address space.
pub struct HashBackend {
    keys: Vec<u32>,
    values: Vec<u16>,
    mask: usize,
    used: usize,
    address_space: usize,
    strategy: DefaultStrategy,
}

impl HashBackend {
    /// `capacity` is rounded up to a power of two.
    pub fn new(capacity: usize, address_space: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            keys: vec![EMPTY_KEY; capacity],
            values: vec![0; capacity],
            mask: capacity - 1,
            used: 0,
            address_space,
            strategy: DefaultStrategy::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.keys.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn clear(&mut self) {
        self.keys.fill(EMPTY_KEY);
        self.used = 0;
    }

    /// Linear search for `key`. Returns the slot holding it, or the first empty slot on the
    /// search path.
    fn find_slot(&self, key: u32) -> Result<usize, Option<usize>> {
        let mut slot = lowbias32(key) as usize & self.mask;
        for _ in 0..self.keys.len() {
            match self.keys[slot] {
                k if k == key => return Ok(slot),
                EMPTY_KEY => return Err(Some(slot)),
                _ => slot = (slot + 1) & self.mask,
            }
        }
        Err(None)
    }

    fn read_word(&self, key: u32) -> u16 {
        match self.find_slot(key) {
            Ok(slot) => self.values[slot],
            Err(_) => self.strategy.word_for(key << 1),
        }
    }

    fn write_word(&mut self, key: u32, value: u16) {
        match self.find_slot(key) {
            Ok(slot) => self.values[slot] = value,
            Err(Some(slot)) => {
                self.keys[slot] = key;
                self.values[slot] = value;
                self.used += 1;
            }
            Err(None) => {
                log::warn!(
                    "Hash memory full ({} words), dropping write to [{:06X}]",
                    self.keys.len(),
                    key << 1
                );
            }
        }
    }
}

impl MemoryBackend for HashBackend {
    fn size(&self) -> usize {
        self.address_space
    }

    fn read_u8(&self, address: u32) -> u8 {
        let word = self.read_word(address >> 1);
        if address & 1 != 0 {
            (word >> 8) as u8
        } else {
            word as u8
        }
    }

    fn write_u8(&mut self, address: u32, value: u8) {
        let key = address >> 1;
        let word = self.read_word(key);
        let word = if address & 1 != 0 {
            (word & 0x00FF) | (value as u16) << 8
        } else {
            (word & 0xFF00) | value as u16
        };
        self.write_word(key, word);
    }

    fn read_u16(&self, address: u32) -> u16 {
        if address & 1 == 0 {
            self.read_word(address >> 1)
        } else {
            self.read_u8(address) as u16 | (self.read_u8(address.wrapping_add(1)) as u16) << 8
        }
    }

    fn write_u16(&mut self, address: u32, value: u16) {
        if address & 1 == 0 {
            self.write_word(address >> 1, value);
        } else {
            self.write_u8(address, value as u8);
            self.write_u8(address.wrapping_add(1), (value >> 8) as u8);
        }
    }

    fn erase(&mut self) {
        self.clear();
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
    use ardx86_common::{DataWidth, MemoryStrategy};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn random_backend(seed: u32) -> HashBackend {
        let mut mem = HashBackend::new(1000, 0x100_0000);
        mem.set_strategy(DefaultStrategy::new(MemoryStrategy::Random, seed));
        mem
    }

    #[test]
    fn test_capacity_power_of_two() {
        assert_eq!(random_backend(0).capacity(), 1024);
    }

    #[test]
    fn test_round_trip() {
        let mut rng = StdRng::seed_from_u64(0x808);
        let mut mem = random_backend(7);
        let mut written = Vec::new();
        for _ in 0..500 {
            let addr = rng.gen_range(0..0x100_0000u32);
            let value: u16 = rng.gen();
            mem.write_u16(addr, value);
            written.push((addr, value));
        }
        // Later writes may overlap earlier ones, so check in reverse against the last writer.
        let mut seen = std::collections::HashSet::new();
        for (addr, value) in written.iter().rev() {
            if seen.contains(addr)
                || seen.contains(&addr.wrapping_sub(1))
                || seen.contains(&(addr + 1))
            {
                continue;
            }
            seen.insert(*addr);
            assert_eq!(mem.read_u16(*addr), *value, "addr {:06X}", addr);
        }
    }

    #[test]
    fn test_unwritten_reads_are_stable() {
        let mem_a = random_backend(0xCAFE);
        let mem_b = random_backend(0xCAFE);
        for addr in (0x1000..0x2000).step_by(3) {
            let v = mem_a.read_bus(addr, DataWidth::EightLow);
            assert_eq!(v, mem_a.read_bus(addr, DataWidth::EightLow));
            assert_eq!(v, mem_b.read_bus(addr, DataWidth::EightLow));
        }
        assert_eq!(mem_a.used(), 0);
    }

    #[test]
    fn test_clear_reverts_to_default() {
        let mut mem = random_backend(99);
        let before = mem.read_u16(0x4000);
        mem.write_u16(0x4000, before ^ 0xFFFF);
        mem.write_u8(0x4003, 0x12);
        assert_eq!(mem.read_u16(0x4000), before ^ 0xFFFF);
        mem.clear();
        assert_eq!(mem.used(), 0);
        assert_eq!(mem.read_u16(0x4000), before);
        assert_eq!(
            mem.read_u8(0x4003),
            DefaultStrategy::new(MemoryStrategy::Random, 99).byte_for(0x4003)
        );
    }

    #[test]
    fn test_full_table_drops_writes() {
        let mut mem = HashBackend::new(4, 0x1000);
        for i in 0..4 {
            mem.write_u16(i * 2, 0x1111);
        }
        mem.write_u16(0x100, 0x2222);
        assert_eq!(mem.used(), 4);
        assert_eq!(mem.read_u16(0x100), 0);
        assert_eq!(mem.read_u16(6), 0x1111);
    }
}
