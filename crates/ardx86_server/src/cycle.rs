//! Per-family bus cycle models. Each model decodes the raw status lines into a [BusStatus] and
//! computes the next T-state from the current one. The models are pure; all bus side effects
//! live in the server.

use ardx86_common::{
    get_bus_status, BusStatus, CpuFamily, TCycle, COMMAND_AIOWC_BIT, COMMAND_AMWC_BIT,
    COMMAND_INTA_BIT, COMMAND_IORC_BIT, COMMAND_IOWC_BIT, COMMAND_MRDC_BIT, COMMAND_MWTC_BIT,
};

/// The command strobes that carry a transfer of the given status, as bits of the active-low
/// command byte.
pub fn command_mask(status: BusStatus) -> u8 {
    match status {
        BusStatus::Code | BusStatus::MemRead => COMMAND_MRDC_BIT,
        BusStatus::IoRead => COMMAND_IORC_BIT,
        BusStatus::IrqAck => COMMAND_INTA_BIT,
        BusStatus::MemWrite => COMMAND_MWTC_BIT | COMMAND_AMWC_BIT,
        BusStatus::IoWrite => COMMAND_IOWC_BIT | COMMAND_AIOWC_BIT,
        BusStatus::Halt | BusStatus::Passive => 0,
    }
}

/// The capability every CPU family's bus interface provides to the server.
pub trait BusCycleModel {
    /// Decode the raw status byte read from the CPU's status lines.
    fn decode_status(&self, raw: u8) -> BusStatus;

    /// Compute the next T-state. `status` is the status decoded this tick, `latched` the
    /// status latched at the start of the current bus cycle. `command` (the active-low
    /// command byte) and `ready` are the line states when the tick began.
    fn next_cycle(
        &self,
        current: TCycle,
        status: BusStatus,
        latched: BusStatus,
        command: u8,
        ready: bool,
    ) -> TCycle;

    /// Return whether the transfer for the latched status can complete this tick. The
    /// command strobe for the latched status must be active, then READY decides.
    fn transfer_done(&self, latched: BusStatus, command: u8, ready: bool) -> bool {
        match latched {
            BusStatus::Passive | BusStatus::Halt => true,
            _ => (!command & command_mask(latched)) != 0 && ready,
        }
    }

    /// Whether the bus cycle has a separate T3/T4 data phase.
    fn four_state(&self) -> bool;
}

/// 8088, 8086, V20, V30 and 80186. S2-S0 in bits 0-2, four T-states per cycle.
#[derive(Copy, Clone, Debug, Default)]
pub struct Bus808x;

impl BusCycleModel for Bus808x {
    fn decode_status(&self, raw: u8) -> BusStatus {
        get_bus_status!(raw)
    }

    fn next_cycle(
        &self,
        current: TCycle,
        status: BusStatus,
        latched: BusStatus,
        command: u8,
        ready: bool,
    ) -> TCycle {
        match current {
            TCycle::Idle => {
                if status.is_active() {
                    TCycle::T1
                } else {
                    TCycle::Idle
                }
            }
            TCycle::T1 => {
                // Only leave T1 once the status indicates a transfer.
                if status.is_active() {
                    TCycle::T2
                } else {
                    TCycle::T1
                }
            }
            TCycle::T2 => TCycle::T3,
            TCycle::T3 | TCycle::Wait => {
                if self.transfer_done(latched, command, ready) {
                    TCycle::T4
                } else {
                    TCycle::Wait
                }
            }
            TCycle::T4 => {
                if status.is_active() {
                    TCycle::T1
                } else {
                    TCycle::Idle
                }
            }
        }
    }

    fn four_state(&self) -> bool {
        true
    }
}

/// The shared two-state (Ts/Tc) sequence of the 286 and 386. Ts maps to T1, Tc to T2.
fn next_cycle_two_state(current: TCycle, status: BusStatus, ready: bool) -> TCycle {
    match current {
        TCycle::Idle => {
            if status.is_active() {
                TCycle::T1
            } else {
                TCycle::Idle
            }
        }
        TCycle::T1 => TCycle::T2,
        TCycle::T2 | TCycle::Wait | TCycle::T3 | TCycle::T4 => {
            if !ready {
                TCycle::Wait
            } else if status.is_active() {
                // Pipelined: the next cycle's status is already on the bus.
                TCycle::T1
            } else {
                TCycle::Idle
            }
        }
    }
}

/// 80286. Status is the nibble COD/INTA, M/IO, S1, S0 (bit 3 to bit 0).
#[derive(Copy, Clone, Debug, Default)]
pub struct Bus286;

impl BusCycleModel for Bus286 {
    fn decode_status(&self, raw: u8) -> BusStatus {
        match raw & 0x0F {
            0b0000 => BusStatus::IrqAck,
            0b0100 => BusStatus::Halt,
            0b0101 => BusStatus::MemRead,
            0b0110 => BusStatus::MemWrite,
            0b1001 => BusStatus::IoRead,
            0b1010 => BusStatus::IoWrite,
            0b1101 => BusStatus::Code,
            _ => BusStatus::Passive,
        }
    }

    fn next_cycle(
        &self,
        current: TCycle,
        status: BusStatus,
        _latched: BusStatus,
        _command: u8,
        ready: bool,
    ) -> TCycle {
        next_cycle_two_state(current, status, ready)
    }

    fn transfer_done(&self, _latched: BusStatus, _command: u8, ready: bool) -> bool {
        ready
    }

    fn four_state(&self) -> bool {
        false
    }
}

/// 80386. Bit 0 W/R, bit 1 D/C, bit 2 M/IO, bit 3 ADS#.
#[derive(Copy, Clone, Debug, Default)]
pub struct Bus386;

impl BusCycleModel for Bus386 {
    fn decode_status(&self, raw: u8) -> BusStatus {
        if raw & 0b1000 != 0 {
            // ADS# not asserted: no cycle is starting.
            return BusStatus::Passive;
        }
        match raw & 0b0111 {
            0b000 => BusStatus::IrqAck,
            0b001 => BusStatus::Passive,
            0b010 => BusStatus::IoRead,
            0b011 => BusStatus::IoWrite,
            0b100 => BusStatus::Code,
            0b101 => BusStatus::Halt,
            0b110 => BusStatus::MemRead,
            _ => BusStatus::MemWrite,
        }
    }

    fn next_cycle(
        &self,
        current: TCycle,
        status: BusStatus,
        _latched: BusStatus,
        _command: u8,
        ready: bool,
    ) -> TCycle {
        next_cycle_two_state(current, status, ready)
    }

    fn transfer_done(&self, _latched: BusStatus, _command: u8, ready: bool) -> bool {
        ready
    }

    fn four_state(&self) -> bool {
        false
    }
}

/// Runtime selection of a [BusCycleModel] by CPU family.
#[derive(Copy, Clone, Debug)]
pub enum CycleModel {
    I808x(Bus808x),
    I286(Bus286),
    I386(Bus386),
}

impl CycleModel {
    pub fn for_family(family: CpuFamily) -> CycleModel {
        match family {
            CpuFamily::Intel808x | CpuFamily::Intel186 => CycleModel::I808x(Bus808x),
            CpuFamily::Intel286 => CycleModel::I286(Bus286),
            CpuFamily::Intel386 => CycleModel::I386(Bus386),
        }
    }

    fn inner(&self) -> &dyn BusCycleModel {
        match self {
            CycleModel::I808x(m) => m,
            CycleModel::I286(m) => m,
            CycleModel::I386(m) => m,
        }
    }
}

impl BusCycleModel for CycleModel {
    fn decode_status(&self, raw: u8) -> BusStatus {
        self.inner().decode_status(raw)
    }

    fn next_cycle(
        &self,
        current: TCycle,
        status: BusStatus,
        latched: BusStatus,
        command: u8,
        ready: bool,
    ) -> TCycle {
        self.inner().next_cycle(current, status, latched, command, ready)
    }

    fn transfer_done(&self, latched: BusStatus, command: u8, ready: bool) -> bool {
        self.inner().transfer_done(latched, command, ready)
    }

    fn four_state(&self) -> bool {
        self.inner().four_state()
    }
}
