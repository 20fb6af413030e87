//! A cycle-level software model of an 8088-family CPU, driven through the same pin and bus
//! traits as real hardware.
//!
//! The model splits the CPU into a bus interface unit (BIU) that runs bus cycles and fills the
//! prefetch queue, and an execution unit (EU) that pops the queue one byte per clock and turns
//! each instruction into a short list of micro-operations. Only the real-mode instructions the
//! server's programs and simple test programs use are decoded; anything else executes as a
//! one-byte no-op with a warning.

use std::collections::VecDeque;
use std::str::FromStr;

use ardx86_common::{
    BusStatus, CpuFamily, CpuPin, CpuWidth, DataWidth, QueueOp, Segment, COMMAND_INTA_BIT,
    COMMAND_IORC_BIT, COMMAND_IOWC_BIT, COMMAND_MRDC_BIT, COMMAND_MWTC_BIT,
};

use crate::hal::{BusDirection, BusTransceiver, CpuClock, CpuPins, Delay};
use crate::programs::{LOADALL286_ADDR, SMM_BASE, SMM_SAVE_ADDR};
use crate::registers::{
    loadall286, loadall386, smm386, Registers, CPU_FLAG_AUX_CARRY, CPU_FLAG_CARRY, CPU_FLAG_DIRECTION, CPU_FLAG_INT_ENABLE,
    CPU_FLAG_OVERFLOW, CPU_FLAG_PARITY, CPU_FLAG_SIGN, CPU_FLAG_TRAP, CPU_FLAG_ZERO,
};

const REG_AX: usize = 0;
const REG_CX: usize = 1;
const REG_DX: usize = 2;
const REG_BX: usize = 3;
const REG_SP: usize = 4;
const REG_BP: usize = 5;
const REG_SI: usize = 6;
const REG_DI: usize = 7;

const SREG_ES: usize = 0;
const SREG_CS: usize = 1;
const SREG_SS: usize = 2;
const SREG_DS: usize = 3;

/// Clocks between RESET going low and the first bus cycle.
const RESET_DELAY: u32 = 3;

/// The CPU being modelled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SimModel {
    I8088,
    I8086,
    V20,
    V30,
    I80188,
    I80186,
    I80286,
    I80386,
}

impl SimModel {
    pub fn width(&self) -> CpuWidth {
        match self {
            SimModel::I8088 | SimModel::V20 | SimModel::I80188 => CpuWidth::Eight,
            _ => CpuWidth::Sixteen,
        }
    }

    pub fn is_nec(&self) -> bool {
        matches!(self, SimModel::V20 | SimModel::V30)
    }

    pub fn family(&self) -> CpuFamily {
        match self {
            SimModel::I8088 | SimModel::I8086 | SimModel::V20 | SimModel::V30 => {
                CpuFamily::Intel808x
            }
            SimModel::I80188 | SimModel::I80186 => CpuFamily::Intel186,
            SimModel::I80286 => CpuFamily::Intel286,
            SimModel::I80386 => CpuFamily::Intel386,
        }
    }

    fn two_state(&self) -> bool {
        matches!(self, SimModel::I80286 | SimModel::I80386)
    }

    fn address_mask(&self) -> u32 {
        match self {
            SimModel::I80286 | SimModel::I80386 => 0xFF_FFFF,
            _ => 0xF_FFFF,
        }
    }

    /// Clocks the AAD in the identification program takes after its last byte is read.
    fn detect_clocks(&self) -> u32 {
        if self.is_nec() {
            10
        } else {
            1
        }
    }
}

impl FromStr for SimModel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "8088" => Ok(SimModel::I8088),
            "8086" => Ok(SimModel::I8086),
            "v20" => Ok(SimModel::V20),
            "v30" => Ok(SimModel::V30),
            "80188" => Ok(SimModel::I80188),
            "80186" => Ok(SimModel::I80186),
            "80286" | "286" => Ok(SimModel::I80286),
            "80386" | "386" => Ok(SimModel::I80386),
            _ => Err(format!("Unknown CPU model: {}", s)),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum BiuState {
    Idle,
    T1,
    T2,
    T3,
    Tw,
    T4,
}

#[derive(Copy, Clone, Debug)]
struct BusCycle {
    kind: BusStatus,
    address: u32,
    lanes: DataWidth,
    data: u16,
    prefetch: bool,
}

/// One bus cycle's worth of an EU transfer. `shift` places the byte(s) within the operand.
#[derive(Copy, Clone, Debug)]
struct Piece {
    address: u32,
    lanes: DataWidth,
    shift: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Dest {
    Ip,
    Cs,
    Flags,
    Reg16(usize),
    Sreg(usize),
    Al,
}

/// Where LOADALL and STOREALL find each register in the 80286 image.
const LOADALL286_FIELDS: [(usize, Dest); 14] = [
    (loadall286::FLAGS, Dest::Flags),
    (loadall286::IP, Dest::Ip),
    (loadall286::DS, Dest::Sreg(SREG_DS)),
    (loadall286::SS, Dest::Sreg(SREG_SS)),
    (loadall286::CS, Dest::Cs),
    (loadall286::ES, Dest::Sreg(SREG_ES)),
    (loadall286::DI, Dest::Reg16(REG_DI)),
    (loadall286::SI, Dest::Reg16(REG_SI)),
    (loadall286::BP, Dest::Reg16(REG_BP)),
    (loadall286::SP, Dest::Reg16(REG_SP)),
    (loadall286::BX, Dest::Reg16(REG_BX)),
    (loadall286::DX, Dest::Reg16(REG_DX)),
    (loadall286::CX, Dest::Reg16(REG_CX)),
    (loadall286::AX, Dest::Reg16(REG_AX)),
];

/// The low word of each register in the 80386 LOADALL image.
const LOADALL386_FIELDS: [(usize, Dest); 14] = [
    (loadall386::EFLAGS, Dest::Flags),
    (loadall386::EIP, Dest::Ip),
    (loadall386::EDI, Dest::Reg16(REG_DI)),
    (loadall386::ESI, Dest::Reg16(REG_SI)),
    (loadall386::EBP, Dest::Reg16(REG_BP)),
    (loadall386::ESP, Dest::Reg16(REG_SP)),
    (loadall386::EBX, Dest::Reg16(REG_BX)),
    (loadall386::EDX, Dest::Reg16(REG_DX)),
    (loadall386::ECX, Dest::Reg16(REG_CX)),
    (loadall386::EAX, Dest::Reg16(REG_AX)),
    (loadall386::DS, Dest::Sreg(SREG_DS)),
    (loadall386::SS, Dest::Sreg(SREG_SS)),
    (loadall386::CS, Dest::Cs),
    (loadall386::ES, Dest::Sreg(SREG_ES)),
];

/// The low word of each register in the SMM state-save image.
const SMM_FIELDS: [(usize, Dest); 14] = [
    (smm386::EFLAGS, Dest::Flags),
    (smm386::EIP, Dest::Ip),
    (smm386::EDI, Dest::Reg16(REG_DI)),
    (smm386::ESI, Dest::Reg16(REG_SI)),
    (smm386::EBP, Dest::Reg16(REG_BP)),
    (smm386::ESP, Dest::Reg16(REG_SP)),
    (smm386::EBX, Dest::Reg16(REG_BX)),
    (smm386::EDX, Dest::Reg16(REG_DX)),
    (smm386::ECX, Dest::Reg16(REG_CX)),
    (smm386::EAX, Dest::Reg16(REG_AX)),
    (smm386::DS, Dest::Sreg(SREG_DS)),
    (smm386::SS, Dest::Sreg(SREG_SS)),
    (smm386::CS, Dest::Cs),
    (smm386::ES, Dest::Sreg(SREG_ES)),
];

#[derive(Clone, Debug)]
struct Transfer {
    kind: BusStatus,
    pieces: VecDeque<Piece>,
    value: u16,
    dest: Option<Dest>,
    done: bool,
}

#[derive(Copy, Clone, Debug)]
enum MicroOp {
    Busy(u32),
    Read {
        kind: BusStatus,
        address: u32,
        word: bool,
        dest: Dest,
    },
    Write {
        kind: BusStatus,
        address: u32,
        word: bool,
        value: u16,
    },
    /// Flush the queue and resume fetching at CS:IP.
    Jump,
    Halt,
}

pub struct SimCpu {
    model: SimModel,

    ready: bool,
    test: bool,
    intr: bool,
    nmi: bool,
    smi: bool,
    reset: bool,
    qs_mode: bool,
    clk: bool,
    reset_delay: u32,
    running: bool,

    biu: BiuState,
    cycle: Option<BusCycle>,
    address: u32,
    data_out: u16,
    data_in: u16,
    direction: BusDirection,
    bus_width: DataWidth,
    qs: QueueOp,
    halt_cycle_pending: bool,

    queue: VecDeque<u8>,
    fetch_ip: u16,
    prefetch_suspended: bool,

    regs: [u16; 8],
    sregs: [u16; 4],
    ip: u16,
    flags: u16,
    cs_base: u32,
    decode: Vec<u8>,
    uops: VecDeque<MicroOp>,
    transfer: Option<Transfer>,
    halted: bool,
    emu: bool,
    nmi_pending: bool,
    smi_pending: bool,

    cycles: u64,
    instructions: u64,
}

impl SimCpu {
    pub fn new(model: SimModel) -> Self {
        let mut cpu = Self {
            model,
            ready: true,
            test: false,
            intr: false,
            nmi: false,
            smi: false,
            reset: false,
            qs_mode: true,
            clk: false,
            reset_delay: 0,
            running: false,
            biu: BiuState::Idle,
            cycle: None,
            address: 0,
            data_out: 0,
            data_in: 0,
            direction: BusDirection::Input,
            bus_width: DataWidth::Invalid,
            qs: QueueOp::Idle,
            halt_cycle_pending: false,
            queue: VecDeque::with_capacity(6),
            fetch_ip: 0,
            prefetch_suspended: false,
            regs: [0; 8],
            sregs: [0; 4],
            ip: 0,
            flags: 0,
            cs_base: 0,
            decode: Vec::with_capacity(6),
            uops: VecDeque::new(),
            transfer: None,
            halted: false,
            emu: false,
            nmi_pending: false,
            smi_pending: false,
            cycles: 0,
            instructions: 0,
        };
        cpu.reset_state();
        cpu
    }

    /// Set the level of the 8018x RD/QSMD strap.
    pub fn with_qs_mode(mut self, qs_mode: bool) -> Self {
        self.qs_mode = qs_mode;
        self
    }

    pub fn model(&self) -> SimModel {
        self.model
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn in_emulation(&self) -> bool {
        self.emu
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycles
    }

    pub fn instruction_count(&self) -> u64 {
        self.instructions
    }

    pub fn direction(&self) -> BusDirection {
        self.direction
    }

    pub fn bus_width(&self) -> DataWidth {
        self.bus_width
    }

    pub fn registers(&self) -> Registers {
        Registers {
            ax: self.regs[0],
            bx: self.regs[3],
            cx: self.regs[1],
            dx: self.regs[2],
            ss: self.sregs[SREG_SS],
            sp: self.regs[4],
            flags: self.flags,
            ip: self.ip,
            cs: self.sregs[SREG_CS],
            ds: self.sregs[SREG_DS],
            es: self.sregs[SREG_ES],
            bp: self.regs[5],
            si: self.regs[6],
            di: self.regs[7],
        }
    }

    fn reset_state(&mut self) {
        self.running = false;
        self.biu = BiuState::Idle;
        self.cycle = None;
        self.qs = QueueOp::Idle;
        self.halt_cycle_pending = false;
        self.queue.clear();
        self.prefetch_suspended = false;
        self.regs = [0; 8];
        self.sregs = [0; 4];
        self.flags = self.normalize_flags(0);
        if self.model.two_state() {
            self.sregs[SREG_CS] = 0xF000;
            self.ip = 0xFFF0;
            self.cs_base = 0xFF_0000;
        } else {
            self.sregs[SREG_CS] = 0xFFFF;
            self.ip = 0;
            self.cs_base = 0xF_FFF0;
        }
        self.fetch_ip = self.ip;
        self.decode.clear();
        self.uops.clear();
        self.transfer = None;
        self.halted = false;
        self.emu = false;
        self.nmi_pending = false;
        self.smi_pending = false;
        self.instructions = 0;
    }

    fn normalize_flags(&self, flags: u16) -> u16 {
        let fixed = if self.model.two_state() {
            0x0002
        } else {
            0xF002
        };
        (flags & 0x0FD5) | fixed
    }

    fn linear(&self, segment: usize, offset: u16) -> u32 {
        (((self.sregs[segment] as u32) << 4) + offset as u32) & self.model.address_mask()
    }

    fn fetch_address(&self) -> u32 {
        self.cs_base.wrapping_add(self.fetch_ip as u32) & self.model.address_mask()
    }

    fn biu_busy(&self) -> bool {
        matches!(
            self.biu,
            BiuState::T1 | BiuState::T2 | BiuState::T3 | BiuState::Tw
        )
    }

    fn queue_has_room(&self) -> bool {
        match self.model.width() {
            CpuWidth::Eight => self.queue.len() < 4,
            CpuWidth::Sixteen => self.queue.len() + 2 <= 6,
        }
    }

    fn tick(&mut self) {
        self.cycles += 1;
        if self.reset {
            return;
        }
        if !self.running {
            if self.reset_delay > 0 {
                self.reset_delay -= 1;
            }
            if self.reset_delay == 0 {
                self.running = true;
            }
            return;
        }
        self.qs = QueueOp::Idle;
        self.biu_tick();
        self.eu_tick();
    }

    fn biu_tick(&mut self) {
        self.biu = match self.biu {
            BiuState::Idle | BiuState::T4 => match self.next_bus_cycle() {
                Some(cycle) => {
                    self.address = cycle.address;
                    self.cycle = Some(cycle);
                    BiuState::T1
                }
                None => {
                    self.cycle = None;
                    BiuState::Idle
                }
            },
            BiuState::T1 => {
                if let Some(cycle) = &self.cycle {
                    if cycle.kind.is_write() {
                        self.data_out = cycle.data;
                    }
                }
                BiuState::T2
            }
            BiuState::T2 if !self.model.two_state() => BiuState::T3,
            BiuState::T2 | BiuState::T3 | BiuState::Tw => {
                let halt = matches!(self.cycle, Some(c) if c.kind == BusStatus::Halt);
                if self.ready || (halt && !self.model.two_state()) {
                    self.complete_bus_cycle();
                    BiuState::T4
                } else {
                    BiuState::Tw
                }
            }
        };
    }

    fn next_bus_cycle(&mut self) -> Option<BusCycle> {
        if self.halt_cycle_pending {
            self.halt_cycle_pending = false;
            return Some(BusCycle {
                kind: BusStatus::Halt,
                address: self.fetch_address() & !1,
                lanes: DataWidth::EightLow,
                data: 0,
                prefetch: false,
            });
        }

        if let Some(transfer) = &self.transfer {
            if !transfer.done {
                let piece = transfer.pieces.front().copied()?;
                let data = match piece.lanes {
                    DataWidth::Sixteen => transfer.value,
                    DataWidth::EightHigh => ((transfer.value >> piece.shift) & 0xFF) << 8,
                    _ => (transfer.value >> piece.shift) & 0xFF,
                };
                return Some(BusCycle {
                    kind: transfer.kind,
                    address: piece.address,
                    lanes: piece.lanes,
                    data,
                    prefetch: false,
                });
            }
        }

        if self.prefetch_suspended || self.halted || !self.queue_has_room() {
            return None;
        }
        let address = self.fetch_address();
        let lanes = match self.model.width() {
            CpuWidth::Eight => DataWidth::EightLow,
            CpuWidth::Sixteen if address & 1 == 0 => DataWidth::Sixteen,
            CpuWidth::Sixteen => DataWidth::EightHigh,
        };
        Some(BusCycle {
            kind: BusStatus::Code,
            address,
            lanes,
            data: 0,
            prefetch: true,
        })
    }

    fn complete_bus_cycle(&mut self) {
        let Some(cycle) = self.cycle else {
            return;
        };
        let data = self.data_in;

        if cycle.prefetch {
            match cycle.lanes {
                DataWidth::Sixteen => {
                    self.queue.push_back(data as u8);
                    self.queue.push_back((data >> 8) as u8);
                    self.fetch_ip = self.fetch_ip.wrapping_add(2);
                }
                DataWidth::EightHigh => {
                    self.queue.push_back((data >> 8) as u8);
                    self.fetch_ip = self.fetch_ip.wrapping_add(1);
                }
                _ => {
                    self.queue.push_back(data as u8);
                    self.fetch_ip = self.fetch_ip.wrapping_add(1);
                }
            }
            return;
        }

        if let Some(transfer) = &mut self.transfer {
            if let Some(piece) = transfer.pieces.pop_front() {
                if transfer.kind.is_read() {
                    match piece.lanes {
                        DataWidth::Sixteen => transfer.value = data,
                        DataWidth::EightHigh => transfer.value |= (data >> 8) << piece.shift,
                        _ => transfer.value |= (data & 0xFF) << piece.shift,
                    }
                }
            }
            transfer.done = transfer.pieces.is_empty();
        }
    }

    fn split(&self, address: u32, word: bool) -> VecDeque<Piece> {
        let mask = self.model.address_mask();
        let a = address & mask;
        let next = address.wrapping_add(1) & mask;
        let piece = |address: u32, lanes: DataWidth, shift: u32| Piece {
            address,
            lanes,
            shift,
        };
        match (self.model.width(), word) {
            (CpuWidth::Eight, false) => VecDeque::from([piece(a, DataWidth::EightLow, 0)]),
            (CpuWidth::Eight, true) => VecDeque::from([
                piece(a, DataWidth::EightLow, 0),
                piece(next, DataWidth::EightLow, 8),
            ]),
            (CpuWidth::Sixteen, false) if a & 1 == 0 => {
                VecDeque::from([piece(a, DataWidth::EightLow, 0)])
            }
            (CpuWidth::Sixteen, false) => VecDeque::from([piece(a, DataWidth::EightHigh, 0)]),
            (CpuWidth::Sixteen, true) if a & 1 == 0 => {
                VecDeque::from([piece(a, DataWidth::Sixteen, 0)])
            }
            (CpuWidth::Sixteen, true) => VecDeque::from([
                piece(a, DataWidth::EightHigh, 0),
                piece(next, DataWidth::EightLow, 8),
            ]),
        }
    }

    fn eu_tick(&mut self) {
        while let Some(op) = self.uops.front().copied() {
            match op {
                MicroOp::Busy(n) => {
                    if n <= 1 {
                        self.uops.pop_front();
                    } else if let Some(front) = self.uops.front_mut() {
                        *front = MicroOp::Busy(n - 1);
                    }
                    return;
                }
                MicroOp::Read {
                    kind,
                    address,
                    word,
                    dest,
                } => match &self.transfer {
                    None => {
                        self.transfer = Some(Transfer {
                            kind,
                            pieces: self.split(address, word),
                            value: 0,
                            dest: Some(dest),
                            done: false,
                        });
                        return;
                    }
                    Some(t) if t.done => {
                        let value = t.value;
                        self.transfer = None;
                        self.uops.pop_front();
                        self.store_dest(dest, if word { value } else { value & 0xFF });
                    }
                    Some(_) => return,
                },
                MicroOp::Write {
                    kind,
                    address,
                    word,
                    value,
                } => match &self.transfer {
                    None => {
                        self.transfer = Some(Transfer {
                            kind,
                            pieces: self.split(address, word),
                            value,
                            dest: None,
                            done: false,
                        });
                        return;
                    }
                    Some(t) if t.done => {
                        self.transfer = None;
                        self.uops.pop_front();
                    }
                    Some(_) => return,
                },
                MicroOp::Jump => {
                    self.prefetch_suspended = true;
                    if self.biu_busy() {
                        return;
                    }
                    self.queue.clear();
                    self.qs = QueueOp::Flush;
                    self.fetch_ip = self.ip;
                    self.prefetch_suspended = false;
                    self.uops.pop_front();
                    return;
                }
                MicroOp::Halt => {
                    self.uops.pop_front();
                    self.halted = true;
                    self.halt_cycle_pending = true;
                    return;
                }
            }
        }

        if self.smi_pending && (self.halted || self.decode.is_empty()) {
            self.start_smi();
            return;
        }
        if self.nmi_pending && (self.halted || self.decode.is_empty()) {
            self.start_nmi();
            return;
        }
        if self.halted {
            return;
        }

        let Some(byte) = self.queue.pop_front() else {
            return;
        };
        self.qs = if self.decode.is_empty() {
            QueueOp::First
        } else {
            QueueOp::Subsequent
        };
        self.decode.push(byte);
        self.ip = self.ip.wrapping_add(1);

        if self.decode.len() >= self.instruction_len() {
            let bytes = std::mem::take(&mut self.decode);
            if self.emu {
                self.execute_8080(&bytes);
            } else {
                self.execute(&bytes);
            }
            self.instructions += 1;
            if self.uops.iter().any(|op| matches!(op, MicroOp::Jump)) {
                self.prefetch_suspended = true;
            }
        }
    }

    fn store_dest(&mut self, dest: Dest, value: u16) {
        match dest {
            Dest::Ip => self.ip = value,
            Dest::Cs => {
                self.sregs[SREG_CS] = value;
                self.cs_base = (value as u32) << 4;
            }
            Dest::Flags => self.flags = self.normalize_flags(value),
            Dest::Reg16(r) => self.regs[r] = value,
            Dest::Sreg(s) => self.sregs[s] = value,
            Dest::Al => self.set_reg8(0, value as u8),
        }
    }

    fn dest_value(&self, dest: Dest) -> u16 {
        match dest {
            Dest::Ip => self.ip,
            Dest::Cs => self.sregs[SREG_CS],
            Dest::Flags => self.flags,
            Dest::Reg16(r) => self.regs[r],
            Dest::Sreg(s) => self.sregs[s],
            Dest::Al => self.reg8(0) as u16,
        }
    }

    /// Queue word reads that fill registers from a memory image, in address order.
    fn read_image(&mut self, base: u32, fields: &[(usize, Dest)]) {
        for &(offset, dest) in fields {
            self.uops.push_back(MicroOp::Read {
                kind: BusStatus::MemRead,
                address: base + offset as u32,
                word: true,
                dest,
            });
        }
    }

    /// Queue word writes of the registers into a memory image.
    fn write_image(&mut self, base: u32, fields: &[(usize, Dest)]) {
        for &(offset, dest) in fields {
            self.uops.push_back(MicroOp::Write {
                kind: BusStatus::MemWrite,
                address: base + offset as u32,
                word: true,
                value: self.dest_value(dest),
            });
        }
    }

    fn reg8(&self, r: usize) -> u8 {
        if r < 4 {
            self.regs[r] as u8
        } else {
            (self.regs[r - 4] >> 8) as u8
        }
    }

    fn set_reg8(&mut self, r: usize, value: u8) {
        if r < 4 {
            self.regs[r] = (self.regs[r] & 0xFF00) | value as u16;
        } else {
            self.regs[r - 4] = (self.regs[r - 4] & 0x00FF) | ((value as u16) << 8);
        }
    }

    fn set_flag(&mut self, flag: u16, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    fn set_szp(&mut self, result: u16, word: bool) {
        let (zero, sign) = if word {
            (result == 0, result & 0x8000 != 0)
        } else {
            (result & 0xFF == 0, result & 0x80 != 0)
        };
        self.set_flag(CPU_FLAG_ZERO, zero);
        self.set_flag(CPU_FLAG_SIGN, sign);
        self.set_flag(CPU_FLAG_PARITY, (result as u8).count_ones() % 2 == 0);
    }

    fn add_flags(&mut self, a: u16, b: u16, result: u32, word: bool) {
        let (carry, sign_bit) = if word {
            (result > 0xFFFF, 0x8000)
        } else {
            (result > 0xFF, 0x80)
        };
        let r = result as u16;
        self.set_flag(CPU_FLAG_CARRY, carry);
        self.set_flag(CPU_FLAG_AUX_CARRY, ((a ^ b ^ r) & 0x10) != 0);
        self.set_flag(CPU_FLAG_OVERFLOW, ((a ^ r) & (b ^ r) & sign_bit) != 0);
        self.set_szp(r, word);
    }

    fn push(&mut self, value: u16) {
        self.regs[REG_SP] = self.regs[REG_SP].wrapping_sub(2);
        self.uops.push_back(MicroOp::Write {
            kind: BusStatus::MemWrite,
            address: self.linear(SREG_SS, self.regs[REG_SP]),
            word: true,
            value,
        });
    }

    fn pop(&mut self, dest: Dest) {
        self.uops.push_back(MicroOp::Read {
            kind: BusStatus::MemRead,
            address: self.linear(SREG_SS, self.regs[REG_SP]),
            word: true,
            dest,
        });
        self.regs[REG_SP] = self.regs[REG_SP].wrapping_add(2);
    }

    fn read_vector(&mut self, vector: u8) {
        let address = vector as u32 * 4;
        self.uops.push_back(MicroOp::Read {
            kind: BusStatus::MemRead,
            address,
            word: true,
            dest: Dest::Ip,
        });
        self.uops.push_back(MicroOp::Read {
            kind: BusStatus::MemRead,
            address: address + 2,
            word: true,
            dest: Dest::Cs,
        });
    }

    fn start_nmi(&mut self) {
        log::trace!("sim: taking NMI at {:04X}:{:04X}", self.sregs[SREG_CS], self.ip);
        self.nmi_pending = false;
        self.halted = false;
        self.prefetch_suspended = true;
        self.uops.push_back(MicroOp::Busy(2));
        self.push(self.flags);
        self.push(self.sregs[SREG_CS]);
        self.push(self.ip);
        self.flags &= !(CPU_FLAG_INT_ENABLE | CPU_FLAG_TRAP);
        self.read_vector(2);
        self.uops.push_back(MicroOp::Jump);
    }

    /// Dump the state to the top of SMRAM and enter the handler at SMBASE + 0x8000.
    fn start_smi(&mut self) {
        log::trace!("sim: taking SMI at {:04X}:{:04X}", self.sregs[SREG_CS], self.ip);
        self.smi_pending = false;
        self.halted = false;
        self.prefetch_suspended = true;
        self.write_image(SMM_SAVE_ADDR, &SMM_FIELDS);
        self.jump_far((SMM_BASE >> 4) as u16, 0x8000);
    }

    fn modrm_len(modrm: u8) -> usize {
        match modrm >> 6 {
            0b00 if modrm & 0x07 == 0x06 => 2,
            0b00 => 0,
            0b01 => 1,
            0b10 => 2,
            _ => 0,
        }
    }

    /// Length of the instruction being decoded, or one more than the bytes read so far when
    /// it cannot be known yet.
    fn instruction_len(&self) -> usize {
        let bytes = &self.decode;
        let more = bytes.len() + 1;
        let opcode = bytes[0];

        if self.emu {
            return match opcode {
                0x3E | 0x06 | 0x0E | 0xED => 2,
                _ => 1,
            };
        }

        match opcode {
            0x04 | 0xB0..=0xB7 | 0xD5 | 0xE4 | 0xE5 | 0xE6 | 0xE7 | 0xEB => 2,
            0x05 | 0xA0..=0xA3 | 0xB8..=0xBF => 3,
            0x9A | 0xEA => 5,
            0x0F if self.model.is_nec() || self.model.two_state() => match bytes.get(1) {
                Some(0xFF) => 3,
                Some(_) => 2,
                None => more,
            },
            // STOREALL is encoded behind an ICE prefix.
            0xF1 if self.model == SimModel::I80286 => 3,
            0x63 if self.model.is_nec() => match bytes.get(1) {
                Some(&modrm) => 2 + Self::modrm_len(modrm),
                None => more,
            },
            0x89 | 0x8B | 0x8C | 0x8E => match bytes.get(1) {
                Some(&modrm) => 2 + Self::modrm_len(modrm),
                None => more,
            },
            _ => 1,
        }
    }

    fn imm16(bytes: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
    }

    fn execute(&mut self, bytes: &[u8]) {
        let opcode = bytes[0];
        match opcode {
            0x04 => {
                let a = self.reg8(0) as u16;
                let b = bytes[1] as u16;
                let result = a as u32 + b as u32;
                self.set_reg8(0, result as u8);
                self.add_flags(a, b, result, false);
                self.uops.push_back(MicroOp::Busy(2));
            }
            0x05 => {
                let a = self.regs[REG_AX];
                let b = Self::imm16(bytes, 1);
                let result = a as u32 + b as u32;
                self.regs[REG_AX] = result as u16;
                self.add_flags(a, b, result, true);
                self.uops.push_back(MicroOp::Busy(2));
            }
            0x0F if bytes.len() == 3 && bytes[1] == 0xFF => {
                // BRKEM: interrupt into 8080 emulation mode.
                self.push(self.flags);
                self.push(self.sregs[SREG_CS]);
                self.push(self.ip);
                self.read_vector(bytes[2]);
                self.uops.push_back(MicroOp::Jump);
                self.emu = true;
            }
            0x0F if self.model.two_state() => self.execute_0f(bytes),
            0x40..=0x47 | 0x48..=0x4F => {
                let r = (opcode & 0x07) as usize;
                let a = self.regs[r];
                let result = if opcode < 0x48 {
                    a.wrapping_add(1)
                } else {
                    a.wrapping_sub(1)
                };
                self.regs[r] = result;
                let overflow = if opcode < 0x48 {
                    result == 0x8000
                } else {
                    result == 0x7FFF
                };
                self.set_flag(CPU_FLAG_OVERFLOW, overflow);
                self.set_flag(CPU_FLAG_AUX_CARRY, ((a ^ result) & 0x10) != 0);
                self.set_szp(result, true);
            }
            0x50..=0x57 => {
                let value = self.regs[(opcode & 0x07) as usize];
                self.push(value);
            }
            0x58..=0x5F => self.pop(Dest::Reg16((opcode & 0x07) as usize)),
            0x63 if self.model.is_nec() => {}
            0x89 | 0x8B | 0x8C | 0x8E => self.execute_mov(bytes),
            0x90 => {}
            0x9A => {
                let ip = Self::imm16(bytes, 1);
                let cs = Self::imm16(bytes, 3);
                self.push(self.sregs[SREG_CS]);
                self.push(self.ip);
                self.jump_far(cs, ip);
            }
            0x9C => self.push(self.flags),
            0x9D => self.pop(Dest::Flags),
            0xA0..=0xA3 => {
                let address = self.linear(SREG_DS, Self::imm16(bytes, 1));
                let word = opcode & 1 != 0;
                if opcode < 0xA2 {
                    let dest = if word { Dest::Reg16(REG_AX) } else { Dest::Al };
                    self.uops.push_back(MicroOp::Read {
                        kind: BusStatus::MemRead,
                        address,
                        word,
                        dest,
                    });
                } else {
                    self.uops.push_back(MicroOp::Write {
                        kind: BusStatus::MemWrite,
                        address,
                        word,
                        value: self.regs[REG_AX],
                    });
                }
            }
            0xAA | 0xAB => {
                let word = opcode == 0xAB;
                let address = self.linear(SREG_ES, self.regs[REG_DI]);
                self.uops.push_back(MicroOp::Write {
                    kind: BusStatus::MemWrite,
                    address,
                    word,
                    value: self.regs[REG_AX],
                });
                let step = if word { 2 } else { 1 };
                self.regs[REG_DI] = if self.flags & CPU_FLAG_DIRECTION != 0 {
                    self.regs[REG_DI].wrapping_sub(step)
                } else {
                    self.regs[REG_DI].wrapping_add(step)
                };
            }
            0xB0..=0xB7 => self.set_reg8((opcode & 0x07) as usize, bytes[1]),
            0xB8..=0xBF => self.regs[(opcode & 0x07) as usize] = Self::imm16(bytes, 1),
            0xCB => {
                self.pop(Dest::Ip);
                self.pop(Dest::Cs);
                self.uops.push_back(MicroOp::Jump);
            }
            0xCF => {
                self.pop(Dest::Ip);
                self.pop(Dest::Cs);
                self.pop(Dest::Flags);
                self.uops.push_back(MicroOp::Jump);
            }
            0xD5 => {
                let base = if self.model.is_nec() { 10 } else { bytes[1] };
                let al = self.reg8(0).wrapping_add(self.reg8(4).wrapping_mul(base));
                self.regs[REG_AX] = al as u16;
                self.set_szp(al as u16, false);
                self.uops.push_back(MicroOp::Busy(self.model.detect_clocks()));
            }
            0xE4 | 0xE5 | 0xEC | 0xED => {
                let word = opcode & 1 != 0;
                let port = if opcode < 0xEC {
                    bytes[1] as u16
                } else {
                    self.regs[REG_DX]
                };
                let dest = if word { Dest::Reg16(REG_AX) } else { Dest::Al };
                self.uops.push_back(MicroOp::Read {
                    kind: BusStatus::IoRead,
                    address: port as u32,
                    word,
                    dest,
                });
            }
            0xE6 | 0xE7 | 0xEE | 0xEF => {
                let word = opcode & 1 != 0;
                let port = if opcode < 0xEE {
                    bytes[1] as u16
                } else {
                    self.regs[REG_DX]
                };
                self.uops.push_back(MicroOp::Write {
                    kind: BusStatus::IoWrite,
                    address: port as u32,
                    word,
                    value: self.regs[REG_AX],
                });
            }
            0xEA => {
                let ip = Self::imm16(bytes, 1);
                let cs = Self::imm16(bytes, 3);
                self.jump_far(cs, ip);
            }
            0xEB => {
                self.ip = self.ip.wrapping_add(bytes[1] as i8 as u16);
                self.uops.push_back(MicroOp::Busy(2));
                self.uops.push_back(MicroOp::Jump);
            }
            0xF1 if self.model == SimModel::I80286 && bytes[1..] == [0x0F, 0x04] => {
                // STOREALL: dump the state where LOADALL reads it, then shut down.
                self.uops.push_back(MicroOp::Write {
                    kind: BusStatus::MemWrite,
                    address: LOADALL286_ADDR + loadall286::MSW as u32,
                    word: true,
                    value: 0xFFF0,
                });
                self.write_image(LOADALL286_ADDR, &LOADALL286_FIELDS);
                self.uops.push_back(MicroOp::Halt);
            }
            0xF4 => self.uops.push_back(MicroOp::Halt),
            0xF8 => self.set_flag(CPU_FLAG_CARRY, false),
            0xF9 => self.set_flag(CPU_FLAG_CARRY, true),
            0xFA => self.set_flag(CPU_FLAG_INT_ENABLE, false),
            0xFB => self.set_flag(CPU_FLAG_INT_ENABLE, true),
            0xFC => self.set_flag(CPU_FLAG_DIRECTION, false),
            0xFD => self.set_flag(CPU_FLAG_DIRECTION, true),
            _ => {
                log::warn!(
                    "sim: unsupported opcode {:02X?} at {:04X}:{:04X}",
                    bytes,
                    self.sregs[SREG_CS],
                    self.ip.wrapping_sub(bytes.len() as u16)
                );
            }
        }
    }

    /// LOADALL and RSM. Descriptor caches are not modelled: segment bases follow the selectors.
    fn execute_0f(&mut self, bytes: &[u8]) {
        match (self.model, bytes[1]) {
            (SimModel::I80286, 0x05) => self.read_image(LOADALL286_ADDR, &LOADALL286_FIELDS),
            (SimModel::I80386, 0x07) => {
                let base = self.linear(SREG_ES, self.regs[REG_DI]);
                self.read_image(base, &LOADALL386_FIELDS);
            }
            (SimModel::I80386, 0xAA) => self.read_image(SMM_SAVE_ADDR, &SMM_FIELDS),
            _ => {
                log::warn!("sim: unsupported opcode {:02X?}", bytes);
                return;
            }
        }
        self.uops.push_back(MicroOp::Jump);
    }

    fn execute_mov(&mut self, bytes: &[u8]) {
        let modrm = bytes[1];
        if modrm >> 6 != 0b11 {
            log::warn!("sim: memory operand forms of {:02X} are not supported", bytes[0]);
            return;
        }
        let reg = ((modrm >> 3) & 0x07) as usize;
        let rm = (modrm & 0x07) as usize;
        match bytes[0] {
            0x89 => self.regs[rm] = self.regs[reg],
            0x8B => self.regs[reg] = self.regs[rm],
            0x8C => self.regs[rm] = self.sregs[reg & 0x03],
            _ => match reg & 0x03 {
                SREG_CS => log::warn!("sim: MOV CS ignored"),
                sreg => self.sregs[sreg] = self.regs[rm],
            },
        }
    }

    fn jump_far(&mut self, cs: u16, ip: u16) {
        self.sregs[SREG_CS] = cs;
        self.cs_base = (cs as u32) << 4;
        self.ip = ip;
        self.uops.push_back(MicroOp::Busy(2));
        self.uops.push_back(MicroOp::Jump);
    }

    fn execute_8080(&mut self, bytes: &[u8]) {
        match bytes[0] {
            0x00 => {}
            0x3C => {
                let a = self.reg8(0).wrapping_add(1);
                self.set_reg8(0, a);
                self.set_szp(a as u16, false);
            }
            0x3E => self.set_reg8(0, bytes[1]),
            0x06 => self.set_reg8(5, bytes[1]),
            0x0E => self.set_reg8(1, bytes[1]),
            0x76 => self.uops.push_back(MicroOp::Halt),
            0xED if bytes[1] == 0xFD => {
                // RETEM: return to native mode through the BRKEM frame.
                self.pop(Dest::Ip);
                self.pop(Dest::Cs);
                self.pop(Dest::Flags);
                self.uops.push_back(MicroOp::Jump);
                self.emu = false;
            }
            _ => log::warn!("sim: unsupported 8080 opcode {:02X?}", bytes),
        }
    }

    fn status_808x(&self) -> u8 {
        let (status, segment) = match (self.biu, self.cycle) {
            (BiuState::T1 | BiuState::T2, Some(cycle)) => {
                let segment = if cycle.kind == BusStatus::Code {
                    Segment::CS
                } else {
                    Segment::DS
                };
                (cycle.kind as u8, segment as u8)
            }
            _ => (BusStatus::Passive as u8, Segment::DS as u8),
        };
        let qs = if self.model.family() == CpuFamily::Intel186 && !self.qs_mode {
            0
        } else {
            self.qs as u8
        };
        status | (segment << 3) | (qs << 6)
    }

    /// COD/INTA, M/IO, S1, S0 in bits 3-0. Both S lines high is idle.
    fn status_286(&self) -> u8 {
        const IDLE: u8 = 0b1011;
        match (self.biu, self.cycle) {
            (BiuState::T1, Some(cycle)) => match cycle.kind {
                BusStatus::IrqAck => 0b0000,
                BusStatus::Halt => 0b0100,
                BusStatus::MemRead => 0b0101,
                BusStatus::MemWrite => 0b0110,
                BusStatus::IoRead => 0b1001,
                BusStatus::IoWrite => 0b1010,
                BusStatus::Code => 0b1101,
                BusStatus::Passive => IDLE,
            },
            _ => IDLE,
        }
    }

    /// ADS#, M/IO, D/C, W/R in bits 3-0. ADS# is only asserted during T1.
    fn status_386(&self) -> u8 {
        const IDLE: u8 = 0b1001;
        match (self.biu, self.cycle) {
            (BiuState::T1, Some(cycle)) => match cycle.kind {
                BusStatus::IrqAck => 0b0000,
                BusStatus::IoRead => 0b0010,
                BusStatus::IoWrite => 0b0011,
                BusStatus::Code => 0b0100,
                BusStatus::Halt => 0b0101,
                BusStatus::MemRead => 0b0110,
                BusStatus::MemWrite => 0b0111,
                BusStatus::Passive => IDLE,
            },
            _ => IDLE,
        }
    }
}

impl CpuPins for SimCpu {
    fn read_pin(&self, pin: CpuPin) -> bool {
        match pin {
            CpuPin::READY => self.ready,
            CpuPin::TEST => self.test,
            CpuPin::INTR => self.intr,
            CpuPin::NMI => self.nmi,
            CpuPin::SMI => self.smi,
            CpuPin::RESET => self.reset,
            CpuPin::QSMODE => self.qs_mode,
        }
    }

    fn write_pin(&mut self, pin: CpuPin, value: bool) {
        match pin {
            CpuPin::READY => self.ready = value,
            CpuPin::TEST => self.test = value,
            CpuPin::INTR => self.intr = value,
            CpuPin::NMI => {
                if value && !self.nmi {
                    self.nmi_pending = true;
                }
                self.nmi = value;
            }
            CpuPin::SMI => {
                if value && !self.smi {
                    if self.model == SimModel::I80386 {
                        self.smi_pending = true;
                    } else {
                        log::warn!("sim: {:?} has no SMI", self.model);
                    }
                }
                self.smi = value;
            }
            CpuPin::RESET => {
                if value {
                    self.reset_state();
                } else if self.reset {
                    self.reset_delay = RESET_DELAY;
                }
                self.reset = value;
            }
            CpuPin::QSMODE => self.qs_mode = value,
        }
    }
}

impl CpuClock for SimCpu {
    fn clock_edge(&mut self, high: bool) {
        if high && !self.clk {
            self.tick();
        }
        self.clk = high;
    }
}

impl BusTransceiver for SimCpu {
    fn set_direction(&mut self, direction: BusDirection) {
        self.direction = direction;
    }

    fn set_width(&mut self, width: DataWidth) {
        self.bus_width = width;
    }

    fn read_data_bus(&self) -> u16 {
        self.data_out
    }

    fn write_data_bus(&mut self, data: u16) {
        self.data_in = data;
    }

    fn read_address(&self) -> u32 {
        self.address
    }

    fn read_status(&self) -> u8 {
        match self.model {
            SimModel::I80286 => self.status_286(),
            SimModel::I80386 => self.status_386(),
            _ => self.status_808x(),
        }
    }

    fn read_bhe(&self) -> bool {
        if self.model.width() == CpuWidth::Eight {
            return false;
        }
        match (self.biu, self.cycle) {
            (BiuState::T1, Some(cycle)) => {
                matches!(cycle.lanes, DataWidth::Sixteen | DataWidth::EightHigh)
            }
            _ => false,
        }
    }

    /// The 8018x drives RD and WR itself. They are active from T2 until the cycle ends.
    fn read_command(&self) -> Option<u8> {
        if self.model.family() != CpuFamily::Intel186 {
            return None;
        }
        let strobe = match (self.biu, self.cycle) {
            (BiuState::T2 | BiuState::T3 | BiuState::Tw, Some(cycle)) => match cycle.kind {
                BusStatus::Code | BusStatus::MemRead => COMMAND_MRDC_BIT,
                BusStatus::IoRead => COMMAND_IORC_BIT,
                BusStatus::MemWrite => COMMAND_MWTC_BIT,
                BusStatus::IoWrite => COMMAND_IOWC_BIT,
                BusStatus::IrqAck => COMMAND_INTA_BIT,
                BusStatus::Halt | BusStatus::Passive => 0,
            },
            _ => 0,
        };
        Some(!strobe)
    }
}

impl Delay for SimCpu {
    fn delay_us(&mut self, _us: u32) {}
}
