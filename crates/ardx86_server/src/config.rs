//! Server configuration.

use std::time::Duration;

use ardx86_common::{CpuFamily, MemoryStrategy, FLAG_EXECUTE_AUTOMATIC};

use crate::memory::{BackendKind, DefaultStrategy};

/// Cycle budgets for each blocking phase.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PhaseTimeouts {
    pub reset: u32,
    pub cpuid: u32,
    pub load: u32,
    pub finalize: u32,
    pub store: u32,
    pub storeall: u32,
    pub execute: u32,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            reset: 64,
            cpuid: 256,
            load: 5000,
            finalize: 1000,
            store: 5000,
            storeall: 5000,
            execute: 100_000,
        }
    }
}

/// How the server detects that the user program has finished.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum EndStrategy {
    /// Queue tags when the CPU reports queue status, NMI otherwise.
    #[default]
    Auto,
    QueueTag,
    Nmi,
}

impl std::str::FromStr for EndStrategy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(EndStrategy::Auto),
            "queue" | "queuetag" => Ok(EndStrategy::QueueTag),
            "nmi" => Ok(EndStrategy::Nmi),
            _ => Err(format!("Invalid end strategy: {}", s)),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryConfig {
    pub backend: BackendKind,
    pub strategy: DefaultStrategy,
    /// Words the hash backend can hold.
    pub hash_capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Flat,
            strategy: DefaultStrategy::new(MemoryStrategy::Zero, 0),
            hash_capacity: 0x1_0000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub family: CpuFamily,
    pub timeouts: PhaseTimeouts,
    /// How long the dispatcher waits for each parameter byte.
    pub param_timeout: Duration,
    pub clock_high_us: u32,
    pub clock_low_us: u32,
    /// Clocks RESET is held before release.
    pub reset_hold_cycles: u32,
    /// Wait states inserted into every bus cycle.
    pub wait_states: u32,
    /// Run the prefetch program before the user program.
    pub prefetch: bool,
    pub end_strategy: EndStrategy,
    pub memory: MemoryConfig,
    pub flags: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            family: CpuFamily::Intel808x,
            timeouts: PhaseTimeouts::default(),
            param_timeout: Duration::from_millis(100),
            clock_high_us: 0,
            clock_low_us: 0,
            reset_hold_cycles: 4,
            wait_states: 0,
            prefetch: false,
            end_strategy: EndStrategy::Auto,
            memory: MemoryConfig::default(),
            flags: 0,
        }
    }
}

impl ServerConfig {
    pub fn automatic(mut self) -> Self {
        self.flags |= FLAG_EXECUTE_AUTOMATIC;
        self
    }

    /// Size of the physical address space for the configured family.
    pub fn address_space(&self) -> usize {
        match self.family {
            CpuFamily::Intel808x | CpuFamily::Intel186 => 0x10_0000,
            CpuFamily::Intel286 | CpuFamily::Intel386 => 0x100_0000,
        }
    }

    pub fn address_mask(&self) -> u32 {
        (self.address_space() - 1) as u32
    }
}
