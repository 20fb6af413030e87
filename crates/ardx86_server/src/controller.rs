//! Emulation of the 8288 and 82288 bus controllers. Boards without a physical bus controller
//! use these to synthesize the command and ALE lines from the CPU's status outputs.

use ardx86_common::{
    BusStatus, CpuFamily, TCycle, COMMAND_AIOWC_BIT, COMMAND_AMWC_BIT, COMMAND_BHE_BIT,
    COMMAND_INTA_BIT, COMMAND_IORC_BIT, COMMAND_IOWC_BIT, COMMAND_MRDC_BIT, COMMAND_MWTC_BIT,
    CONTROL_ALE_BIT,
};

/// The command and control outputs of a bus controller, active-high in this struct.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandLines {
    pub ale: bool,
    pub mrdc: bool,
    pub amwc: bool,
    pub mwtc: bool,
    pub iorc: bool,
    pub aiowc: bool,
    pub iowc: bool,
    pub inta: bool,
}

impl CommandLines {
    fn clear_commands(&mut self) {
        *self = CommandLines {
            ale: self.ale,
            ..Default::default()
        };
    }

    pub fn any_command(&self) -> bool {
        self.mrdc || self.amwc || self.mwtc || self.iorc || self.aiowc || self.iowc || self.inta
    }

    /// The command byte as read from a real bus controller: every line active-low.
    pub fn command_byte(&self, bhe: bool) -> u8 {
        let mut byte = 0xFF;
        for (line, bit) in [
            (self.mrdc, COMMAND_MRDC_BIT),
            (self.amwc, COMMAND_AMWC_BIT),
            (self.mwtc, COMMAND_MWTC_BIT),
            (self.iorc, COMMAND_IORC_BIT),
            (self.aiowc, COMMAND_AIOWC_BIT),
            (self.iowc, COMMAND_IOWC_BIT),
            (self.inta, COMMAND_INTA_BIT),
            (bhe, COMMAND_BHE_BIT),
        ] {
            if line {
                byte &= !bit;
            }
        }
        byte
    }

    pub fn control_byte(&self) -> u8 {
        if self.ale {
            CONTROL_ALE_BIT
        } else {
            0
        }
    }
}

/// 8288 emulation for the 8088, 8086, V20, V30 and 80186.
#[derive(Copy, Clone, Debug, Default)]
pub struct I8288 {
    last_status: BusStatus,
    status: BusStatus,
    latched: BusStatus,
    t_cycle: TCycle,
    lines: CommandLines,
}

impl I8288 {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn reset(&mut self) {
        *self = Default::default();
    }

    pub fn tick(&mut self, status: BusStatus, ready: bool) {
        self.last_status = self.status;
        self.status = status;
        self.lines.ale = false;

        if self.last_status == BusStatus::Passive && status.is_active() {
            // A new bus cycle begins regardless of where we thought we were.
            if !matches!(self.t_cycle, TCycle::Idle | TCycle::T4) {
                log::trace!("8288: status went active in {:?}, restarting at T1", self.t_cycle);
            }
            self.t_cycle = TCycle::T1;
            self.latched = status;
            self.lines.clear_commands();
            self.lines.ale = true;
            // Advanced write strobes fire at T1.
            match status {
                BusStatus::MemWrite => self.lines.amwc = true,
                BusStatus::IoWrite => self.lines.aiowc = true,
                _ => {}
            }
            return;
        }

        self.t_cycle = match self.t_cycle {
            TCycle::Idle => TCycle::Idle,
            TCycle::T1 => {
                match self.latched {
                    BusStatus::Code | BusStatus::MemRead => self.lines.mrdc = true,
                    BusStatus::IoRead => self.lines.iorc = true,
                    BusStatus::IrqAck => self.lines.inta = true,
                    BusStatus::MemWrite => self.lines.mwtc = true,
                    BusStatus::IoWrite => self.lines.iowc = true,
                    BusStatus::Halt | BusStatus::Passive => {}
                }
                TCycle::T2
            }
            TCycle::T2 => TCycle::T3,
            TCycle::T3 | TCycle::Wait => {
                let done = matches!(self.latched, BusStatus::Passive | BusStatus::Halt) || ready;
                if done {
                    self.lines.clear_commands();
                    TCycle::T4
                } else {
                    TCycle::Wait
                }
            }
            TCycle::T4 => TCycle::Idle,
        };
    }

    pub fn lines(&self) -> &CommandLines {
        &self.lines
    }
}

/// 82288 emulation for the 286 and 386. One command line per cycle, no advanced strobes,
/// cycle completion follows READY.
#[derive(Copy, Clone, Debug, Default)]
pub struct I82288 {
    status: BusStatus,
    latched: BusStatus,
    t_cycle: TCycle,
    lines: CommandLines,
}

impl I82288 {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn reset(&mut self) {
        *self = Default::default();
    }

    fn start(&mut self, status: BusStatus) -> TCycle {
        self.latched = status;
        self.lines.ale = true;
        TCycle::T1
    }

    pub fn tick(&mut self, status: BusStatus, ready: bool) {
        self.status = status;
        self.lines.ale = false;

        self.t_cycle = match self.t_cycle {
            TCycle::Idle => {
                if status.is_active() {
                    self.start(status)
                } else {
                    TCycle::Idle
                }
            }
            TCycle::T1 => {
                match self.latched {
                    BusStatus::Code | BusStatus::MemRead => self.lines.mrdc = true,
                    BusStatus::MemWrite => self.lines.mwtc = true,
                    BusStatus::IoRead => self.lines.iorc = true,
                    BusStatus::IoWrite => self.lines.iowc = true,
                    BusStatus::IrqAck => self.lines.inta = true,
                    BusStatus::Halt | BusStatus::Passive => {}
                }
                TCycle::T2
            }
            _ => {
                if ready {
                    self.lines.clear_commands();
                    if status.is_active() {
                        self.start(status)
                    } else {
                        TCycle::Idle
                    }
                } else {
                    TCycle::Wait
                }
            }
        };
    }

    pub fn lines(&self) -> &CommandLines {
        &self.lines
    }
}

/// The bus controller for the configured CPU family.
#[derive(Copy, Clone, Debug)]
pub enum BusController {
    I8288(I8288),
    I82288(I82288),
}

impl BusController {
    pub fn for_family(family: CpuFamily) -> BusController {
        if family.uses_8288() {
            BusController::I8288(I8288::new())
        } else {
            BusController::I82288(I82288::new())
        }
    }

    pub fn reset(&mut self) {
        match self {
            BusController::I8288(c) => c.reset(),
            BusController::I82288(c) => c.reset(),
        }
    }

    pub fn tick(&mut self, status: BusStatus, ready: bool) {
        match self {
            BusController::I8288(c) => c.tick(status, ready),
            BusController::I82288(c) => c.tick(status, ready),
        }
    }

    pub fn lines(&self) -> &CommandLines {
        match self {
            BusController::I8288(c) => c.lines(),
            BusController::I82288(c) => c.lines(),
        }
    }

    pub fn latched(&self) -> BusStatus {
        match self {
            BusController::I8288(c) => c.latched,
            BusController::I82288(c) => c.latched,
        }
    }

    pub fn t_cycle(&self) -> TCycle {
        match self {
            BusController::I8288(c) => c.t_cycle,
            BusController::I82288(c) => c.t_cycle,
        }
    }

    pub fn ale(&self) -> bool {
        self.lines().ale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_write_cycle() {
        let mut c = I8288::new();
        let mut ale_pulses = 0;

        // T1
        c.tick(BusStatus::IoWrite, true);
        ale_pulses += c.lines().ale as u32;
        assert_eq!(c.t_cycle, TCycle::T1);
        assert!(c.lines().aiowc);
        assert!(!c.lines().iowc);

        // T2
        c.tick(BusStatus::IoWrite, true);
        ale_pulses += c.lines().ale as u32;
        assert_eq!(c.t_cycle, TCycle::T2);
        assert!(c.lines().aiowc);
        assert!(c.lines().iowc);

        // T3, status goes passive. The strobes hold through T3 and drop as T4 begins.
        c.tick(BusStatus::Passive, true);
        ale_pulses += c.lines().ale as u32;
        assert_eq!(c.t_cycle, TCycle::T3);
        assert!(c.lines().aiowc);
        assert!(c.lines().iowc);
        assert!(!c.lines().mwtc && !c.lines().amwc && !c.lines().iorc);

        // T4, Idle
        for expected in [TCycle::T4, TCycle::Idle, TCycle::Idle] {
            c.tick(BusStatus::Passive, true);
            ale_pulses += c.lines().ale as u32;
            assert_eq!(c.t_cycle, expected);
            assert!(!c.lines().any_command());
            assert_eq!(c.lines().command_byte(false), 0xFF);
        }
        assert_eq!(ale_pulses, 1);
    }

    #[test]
    fn test_read_cycle_with_wait() {
        let mut c = I8288::new();
        c.tick(BusStatus::MemRead, true);
        assert_eq!(c.lines().control_byte(), CONTROL_ALE_BIT);
        c.tick(BusStatus::MemRead, true);
        assert!(c.lines().mrdc);
        assert_eq!(c.lines().command_byte(true) & COMMAND_MRDC_BIT, 0);
        assert_eq!(c.lines().command_byte(true) & COMMAND_BHE_BIT, 0);
        c.tick(BusStatus::Passive, false);
        c.tick(BusStatus::Passive, false);
        assert_eq!(c.t_cycle, TCycle::Wait);
        assert!(c.lines().mrdc);
        c.tick(BusStatus::Passive, true);
        assert_eq!(c.t_cycle, TCycle::T4);
        assert!(!c.lines().mrdc);
    }

    #[test]
    fn test_new_status_forces_t1() {
        let mut c = I8288::new();
        c.tick(BusStatus::Code, true);
        c.tick(BusStatus::Code, true);
        c.tick(BusStatus::Passive, true);
        // Status goes active again before we reached T4.
        c.tick(BusStatus::MemWrite, true);
        assert_eq!(c.t_cycle, TCycle::T1);
        assert!(c.lines().ale);
        assert!(!c.lines().mrdc);
        assert!(c.lines().amwc);
        assert_eq!(c.latched, BusStatus::MemWrite);
    }

    #[test]
    fn test_82288_cycle() {
        let mut c = BusController::for_family(CpuFamily::Intel286);
        c.tick(BusStatus::MemWrite, true);
        assert!(c.ale());
        assert!(!c.lines().any_command());
        c.tick(BusStatus::Passive, false);
        assert!(!c.ale());
        assert!(c.lines().mwtc);
        assert!(!c.lines().amwc);
        c.tick(BusStatus::Passive, false);
        assert_eq!(c.t_cycle(), TCycle::Wait);
        assert!(c.lines().mwtc);
        c.tick(BusStatus::Passive, true);
        assert_eq!(c.t_cycle(), TCycle::Idle);
        assert!(!c.lines().any_command());
    }
}
