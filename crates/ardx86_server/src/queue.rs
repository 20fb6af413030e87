//! A model of the CPU's instruction prefetch queue, kept in lockstep with the real queue by
//! pushing every completed code fetch and popping on every queue-status read.

use ardx86_common::{CpuWidth, DataWidth};

/// Tags each queued byte with where it came from, so the server can tell user program bytes
/// from the padding it feeds after the program is exhausted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueDataType {
    Program,
    ProgramEnd,
}

#[derive(Copy, Clone, Debug)]
pub struct QueueEntry {
    pub opcode: u8,
    pub dtype: QueueDataType,
    pub addr: u32,
}

pub struct InstructionQueue {
    size: usize,
    len: usize,
    back: usize,
    front: usize,
    q: Vec<QueueEntry>,
}

impl InstructionQueue {
    pub fn new(width: CpuWidth) -> Self {
        Self {
            size: width.queue_size(),
            len: 0,
            back: 0,
            front: 0,
            q: vec![
                QueueEntry {
                    opcode: 0,
                    dtype: QueueDataType::Program,
                    addr: 0,
                };
                width.queue_size()
            ],
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn has_room(&self, width: DataWidth) -> bool {
        self.len + width.bytes() <= self.size
    }

    fn push_byte(&mut self, opcode: u8, dtype: QueueDataType, addr: u32) {
        self.q[self.front] = QueueEntry {
            opcode,
            dtype,
            addr,
        };
        self.front = (self.front + 1) % self.size;
        self.len += 1;
    }

    /// Push a completed code fetch. Returns false and leaves the queue untouched if the fetch
    /// would overflow it.
    pub fn push(&mut self, data: u16, width: DataWidth, dtype: QueueDataType, addr: u32) -> bool {
        if !self.has_room(width) {
            log::error!(
                "Queue overrun! len: {} pushing {:?} at [{:05X}]",
                self.len,
                width,
                addr
            );
            return false;
        }
        match width {
            DataWidth::EightLow => self.push_byte(data as u8, dtype, addr),
            DataWidth::EightHigh => self.push_byte((data >> 8) as u8, dtype, addr),
            DataWidth::Sixteen => {
                self.push_byte(data as u8, dtype, addr);
                self.push_byte((data >> 8) as u8, dtype, addr.wrapping_add(1));
            }
            DataWidth::Invalid => {
                log::error!("Bad DataWidth for queue push: {:?}", width);
                return false;
            }
        }
        true
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        if self.len == 0 {
            return None;
        }
        let entry = self.q[self.back];
        self.back = (self.back + 1) % self.size;
        self.len -= 1;
        Some(entry)
    }

    pub fn flush(&mut self) {
        self.len = 0;
        self.back = 0;
        self.front = 0;
    }

    /// Copy the queued bytes, oldest first.
    pub fn bytes(&self) -> Vec<u8> {
        (0..self.len)
            .map(|i| self.q[(self.back + i) % self.size].opcode)
            .collect()
    }
}

impl std::fmt::Display for InstructionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.bytes() {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}
