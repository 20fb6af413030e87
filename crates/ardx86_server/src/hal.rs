//! Hardware capabilities the server consumes. A board support layer implements these over
//! its GPIO pins; [crate::sim::SimCpu] implements them in software.

use ardx86_common::{CpuPin, DataWidth};

/// Direction of the data bus from the server's point of view.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BusDirection {
    /// The CPU drives the bus.
    #[default]
    Input,
    /// The server drives the bus.
    Output,
}

pub trait CpuPins {
    fn read_pin(&self, pin: CpuPin) -> bool;
    fn write_pin(&mut self, pin: CpuPin, value: bool);
}

pub trait CpuClock {
    /// Drive the CLK input high or low.
    fn clock_edge(&mut self, high: bool);
}

pub trait BusTransceiver {
    fn set_direction(&mut self, direction: BusDirection);
    fn set_width(&mut self, width: DataWidth);
    fn read_data_bus(&self) -> u16;
    fn write_data_bus(&mut self, data: u16);
    /// The 20 or 24 address lines.
    fn read_address(&self) -> u32;
    /// The raw status lines, in the encoding of the CPU family.
    fn read_status(&self) -> u8;
    /// True when BHE is asserted.
    fn read_bhe(&self) -> bool;
    /// The CPU's own command outputs as an active-low command byte, for CPUs that decode
    /// their bus commands on chip. `None` means the server synthesizes the command lines.
    fn read_command(&self) -> Option<u8> {
        None
    }
}

pub trait Delay {
    fn delay_us(&mut self, us: u32);
}

/// Everything the server needs from the hardware.
pub trait CpuHal: CpuPins + CpuClock + BusTransceiver + Delay {}

impl<T: CpuPins + CpuClock + BusTransceiver + Delay> CpuHal for T {}
