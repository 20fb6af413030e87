//! Memory backends serving bus cycles during automatic execution.
//!
//! A backend stores bytes, but most callers address it the way the CPU does: by bus address and
//! active [DataWidth]. The default [MemoryBackend::read_bus] and [MemoryBackend::write_bus]
//! implement the lane selection so backends only need byte access.
//!
//! Addresses a backend never stored are synthesized by a [DefaultStrategy]. The random strategy
//! is a pure function of the seed and address, so a software emulator seeded identically sees
//! the same memory without either side storing it.

mod flat;
mod hash;
mod null;

pub use flat::FlatBackend;
pub use hash::HashBackend;
pub use null::NullBackend;

use ardx86_common::{DataWidth, MemoryStrategy, Result, ServerError};

/// The lowbias32 integer avalanche.
#[inline]
pub fn lowbias32(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb_352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846c_a68b);
    x ^= x >> 16;
    x
}

/// What a backend returns for memory it never stored.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DefaultStrategy {
    pub kind: MemoryStrategy,
    pub seed: u32,
    /// The strategy applies to `start..end`. Everything else reads zero. An `end` of zero
    /// covers the whole address space.
    pub start: u32,
    pub end: u32,
}

impl DefaultStrategy {
    pub fn new(kind: MemoryStrategy, seed: u32) -> Self {
        Self {
            kind,
            seed,
            start: 0,
            end: 0,
        }
    }

    pub fn in_range(&self, address: u32) -> bool {
        self.end == 0 || (self.start..self.end).contains(&address)
    }

    /// The default word for the aligned word containing `address`.
    pub fn word_for(&self, address: u32) -> u16 {
        if !self.in_range(address) {
            return 0;
        }
        match self.kind {
            MemoryStrategy::Zero => 0,
            MemoryStrategy::Ones => 0xFFFF,
            MemoryStrategy::Random => lowbias32(self.seed ^ (address >> 1)) as u16,
        }
    }

    pub fn byte_for(&self, address: u32) -> u8 {
        let word = self.word_for(address);
        if address & 1 != 0 {
            (word >> 8) as u8
        } else {
            word as u8
        }
    }
}

pub trait MemoryBackend {
    /// Size of the addressable space in bytes.
    fn size(&self) -> usize;

    fn read_u8(&self, address: u32) -> u8;
    fn write_u8(&mut self, address: u32, value: u8);

    fn read_u16(&self, address: u32) -> u16 {
        self.read_u8(address) as u16 | (self.read_u8(address.wrapping_add(1)) as u16) << 8
    }

    fn write_u16(&mut self, address: u32, value: u16) {
        self.write_u8(address, value as u8);
        self.write_u8(address.wrapping_add(1), (value >> 8) as u8);
    }

    /// Serve a bus read. Byte transfers on the high lane come from the odd address and are
    /// returned in the high byte.
    fn read_bus(&self, address: u32, width: DataWidth) -> u16 {
        match width {
            DataWidth::Sixteen => self.read_u16(address),
            DataWidth::EightHigh => (self.read_u8(address) as u16) << 8,
            DataWidth::EightLow => self.read_u8(address) as u16,
            // Refresh cycle, nothing is driven.
            DataWidth::Invalid => 0xFFFF,
        }
    }

    fn write_bus(&mut self, address: u32, width: DataWidth, data: u16) {
        match width {
            DataWidth::Sixteen => self.write_u16(address, data),
            DataWidth::EightHigh => self.write_u8(address, (data >> 8) as u8),
            DataWidth::EightLow => self.write_u8(address, data as u8),
            DataWidth::Invalid => {
                log::trace!("Discarding refresh cycle write to [{:06X}]", address);
            }
        }
    }

    /// No I/O devices are attached. Ports float high.
    fn io_read(&self, _port: u16, _width: DataWidth) -> u16 {
        0xFFFF
    }

    fn io_write(&mut self, _port: u16, _width: DataWidth, _data: u16) {}

    fn check_range(&self, address: u32, len: usize) -> Result<()> {
        if (address as usize).saturating_add(len) > self.size() {
            return Err(ServerError::MemoryRangeError { address, len });
        }
        Ok(())
    }

    fn set_range(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.check_range(address, data.len())?;
        for (i, byte) in data.iter().enumerate() {
            self.write_u8(address + i as u32, *byte);
        }
        Ok(())
    }

    fn read_range(&self, address: u32, len: usize) -> Result<Vec<u8>> {
        self.check_range(address, len)?;
        Ok((0..len).map(|i| self.read_u8(address + i as u32)).collect())
    }

    /// Forget everything written. Memory reverts to the default strategy.
    fn erase(&mut self);

    fn set_strategy(&mut self, strategy: DefaultStrategy);
    fn strategy(&self) -> DefaultStrategy;

    fn randomize(&mut self, seed: u32) {
        self.set_strategy(DefaultStrategy::new(MemoryStrategy::Random, seed));
        self.erase();
    }
}

/// Which backend to construct.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BackendKind {
    Null,
    #[default]
    Flat,
    Hash,
}

impl std::str::FromStr for BackendKind {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_lowercase().as_str() {
            "null" => Ok(BackendKind::Null),
            "flat" => Ok(BackendKind::Flat),
            "hash" => Ok(BackendKind::Hash),
            _ => Err(format!("Invalid memory backend: {}", s)),
        }
    }
}

/// Build a backend covering `address_space` bytes. The hash backend holds at most
/// `hash_capacity` words.
pub fn make_backend(
    kind: BackendKind,
    address_space: usize,
    hash_capacity: usize,
    strategy: DefaultStrategy,
) -> Box<dyn MemoryBackend> {
    let mut backend: Box<dyn MemoryBackend> = match kind {
        BackendKind::Null => Box::new(NullBackend),
        BackendKind::Flat => Box::new(FlatBackend::new(address_space)),
        BackendKind::Hash => Box::new(HashBackend::new(hash_capacity, address_space)),
    };
    backend.set_strategy(strategy);
    backend.erase();
    backend
}
