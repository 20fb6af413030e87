//! The bus emulator serves memory and I/O cycles from a [MemoryBackend] and keeps a log of
//! recent bus operations.

use std::collections::BTreeMap;

use ardx86_common::{BusStatus, DataWidth};

use crate::memory::MemoryBackend;

pub const BUS_LOG_LEN: usize = 256;

/// Consecutive writes at or above this count look like a far call or interrupt frame.
pub const FAR_CALL_WRITES: u32 = 3;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BusOperation {
    pub kind: BusStatus,
    pub width: DataWidth,
    pub address: u32,
    pub data: u16,
}

impl BusOperation {
    /// Wire form: kind, width, address (u32 LE), data (u16 LE).
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0] = self.kind as u8;
        buf[1] = self.width as u8;
        buf[2..6].copy_from_slice(&self.address.to_le_bytes());
        buf[6..8].copy_from_slice(&self.data.to_le_bytes());
        buf
    }
}

/// A ring of the last [BUS_LOG_LEN] bus operations. Once the ring wraps, `overflow` stays set
/// until the log is cleared.
#[derive(Clone, Debug)]
pub struct BusOperationLog {
    ops: Vec<BusOperation>,
    head: usize,
    len: usize,
    overflow: bool,
}

impl Default for BusOperationLog {
    fn default() -> Self {
        Self {
            ops: vec![BusOperation::default(); BUS_LOG_LEN],
            head: 0,
            len: 0,
            overflow: false,
        }
    }
}

impl BusOperationLog {
    pub fn push(&mut self, op: BusOperation) {
        let tail = (self.head + self.len) % BUS_LOG_LEN;
        self.ops[tail] = op;
        if self.len < BUS_LOG_LEN {
            self.len += 1;
        } else {
            self.head = (self.head + 1) % BUS_LOG_LEN;
            self.overflow = true;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn overflow(&self) -> bool {
        self.overflow
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
        self.overflow = false;
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &BusOperation> + '_ {
        (0..self.len).map(move |i| &self.ops[(self.head + i) % BUS_LOG_LEN])
    }
}

/// An interrupt or far call frame recovered from the log.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CallFrame {
    pub ip: u16,
    pub cs: u16,
    pub flags: u16,
}

pub struct BusEmulator {
    mem: Box<dyn MemoryBackend>,
    log: BusOperationLog,
    consecutive_writes: u32,
    far_call: bool,
}

impl BusEmulator {
    pub fn new(mem: Box<dyn MemoryBackend>) -> Self {
        Self {
            mem,
            log: BusOperationLog::default(),
            consecutive_writes: 0,
            far_call: false,
        }
    }

    pub fn mem(&self) -> &dyn MemoryBackend {
        self.mem.as_ref()
    }

    pub fn mem_mut(&mut self) -> &mut dyn MemoryBackend {
        self.mem.as_mut()
    }

    pub fn log(&self) -> &BusOperationLog {
        &self.log
    }

    pub fn log_op(&mut self, op: BusOperation) {
        if op.kind.is_write() {
            self.consecutive_writes += 1;
            if self.consecutive_writes >= FAR_CALL_WRITES && !self.far_call {
                log::trace!("Write burst ending at [{:06X}], likely far call", op.address);
                self.far_call = true;
            }
        } else if op.kind != BusStatus::Passive {
            self.consecutive_writes = 0;
        }
        self.log.push(op);
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
        self.consecutive_writes = 0;
        self.far_call = false;
    }

    pub fn far_call_detected(&self) -> bool {
        self.far_call
    }

    /// Serve a read cycle from the backend and log it.
    pub fn read_bus(&mut self, kind: BusStatus, address: u32, width: DataWidth) -> u16 {
        let data = match kind {
            BusStatus::IoRead => self.mem.io_read(address as u16, width),
            // The CPU supplies nothing on an INTA cycle here; no PIC is attached.
            BusStatus::IrqAck => 0,
            _ => self.mem.read_bus(address, width),
        };
        self.log_op(BusOperation {
            kind,
            width,
            address,
            data,
        });
        data
    }

    /// Apply a write cycle to the backend and log it.
    pub fn write_bus(&mut self, kind: BusStatus, address: u32, width: DataWidth, data: u16) {
        match kind {
            BusStatus::IoWrite => self.mem.io_write(address as u16, width, data),
            _ => self.mem.write_bus(address, width, data),
        }
        self.log_op(BusOperation {
            kind,
            width,
            address,
            data,
        });
    }

    /// Rebuild frames from each run of three or more consecutive memory writes. The lowest
    /// written address holds IP, followed by CS and FLAGS.
    pub fn far_call_frames(&self) -> Vec<CallFrame> {
        let mut frames = Vec::new();
        let mut run: Vec<&BusOperation> = Vec::new();

        let mut close_run = |run: &mut Vec<&BusOperation>| {
            if run.len() >= FAR_CALL_WRITES as usize {
                if let Some(frame) = frame_from_writes(run.iter().copied()) {
                    frames.push(frame);
                }
            }
            run.clear();
        };

        for op in self.log.iter() {
            match op.kind {
                BusStatus::MemWrite => run.push(op),
                BusStatus::Passive => {}
                _ => close_run(&mut run),
            }
        }
        close_run(&mut run);
        frames
    }
}

/// Collect the bytes a sequence of write operations stored, by address.
pub fn assemble_writes<'a>(ops: impl IntoIterator<Item = &'a BusOperation>) -> BTreeMap<u32, u8> {
    let mut bytes = BTreeMap::new();
    for op in ops {
        match op.width {
            DataWidth::Sixteen => {
                bytes.insert(op.address, op.data as u8);
                bytes.insert(op.address.wrapping_add(1), (op.data >> 8) as u8);
            }
            DataWidth::EightLow => {
                bytes.insert(op.address, op.data as u8);
            }
            DataWidth::EightHigh => {
                bytes.insert(op.address, (op.data >> 8) as u8);
            }
            DataWidth::Invalid => {}
        }
    }
    bytes
}

/// Rebuild an IP, CS, FLAGS frame from the writes that pushed it.
pub fn frame_from_writes<'a>(ops: impl IntoIterator<Item = &'a BusOperation>) -> Option<CallFrame> {
    let bytes = assemble_writes(ops);
    let base = *bytes.keys().next()?;
    let word = |offset: u32| -> Option<u16> {
        let lo = *bytes.get(&(base + offset))?;
        let hi = *bytes.get(&(base + offset + 1))?;
        Some(u16::from_le_bytes([lo, hi]))
    };
    Some(CallFrame {
        ip: word(0)?,
        cs: word(2)?,
        flags: word(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FlatBackend;

    fn emu() -> BusEmulator {
        BusEmulator::new(Box::new(FlatBackend::new(0x10000)))
    }

    #[test]
    fn test_log_overflow_is_sticky() {
        let mut emu = emu();
        for i in 0..BUS_LOG_LEN as u32 {
            emu.read_bus(BusStatus::Code, i, DataWidth::EightLow);
        }
        assert!(!emu.log().overflow());
        emu.read_bus(BusStatus::Code, 0x1000, DataWidth::EightLow);
        assert!(emu.log().overflow());
        assert_eq!(emu.log().len(), BUS_LOG_LEN);
        assert_eq!(emu.log().iter().next().map(|op| op.address), Some(1));
        assert_eq!(emu.log().iter().last().map(|op| op.address), Some(0x1000));
        emu.clear_log();
        assert!(!emu.log().overflow());
        assert!(emu.log().is_empty());
    }

    #[test]
    fn test_far_call_heuristic() {
        let mut emu = emu();
        emu.write_bus(BusStatus::MemWrite, 0x100, DataWidth::Sixteen, 1);
        emu.write_bus(BusStatus::MemWrite, 0x102, DataWidth::Sixteen, 1);
        emu.read_bus(BusStatus::Code, 0x0, DataWidth::Sixteen);
        emu.write_bus(BusStatus::MemWrite, 0x104, DataWidth::Sixteen, 1);
        assert!(!emu.far_call_detected());
        emu.write_bus(BusStatus::IoWrite, 0x10, DataWidth::EightLow, 1);
        emu.write_bus(BusStatus::MemWrite, 0x106, DataWidth::Sixteen, 1);
        assert!(emu.far_call_detected());
    }

    #[test]
    fn test_frames_from_byte_writes() {
        let mut emu = emu();
        // flags, cs, ip pushed as bytes on an 8-bit bus, high byte first
        let sp = 0x200u32;
        let pushes = [0xF202u16, 0x1234, 0x0010];
        for (i, word) in pushes.iter().enumerate() {
            let addr = sp - 2 * (i as u32 + 1);
            emu.write_bus(BusStatus::MemWrite, addr + 1, DataWidth::EightLow, word >> 8);
            emu.write_bus(BusStatus::MemWrite, addr, DataWidth::EightLow, word & 0xFF);
        }
        emu.read_bus(BusStatus::MemRead, 0x8, DataWidth::EightLow);
        let frames = emu.far_call_frames();
        assert_eq!(
            frames,
            vec![CallFrame {
                ip: 0x0010,
                cs: 0x1234,
                flags: 0xF202
            }]
        );
        assert_eq!(emu.mem().read_u16(0x1FA), 0x0010);
    }
}
