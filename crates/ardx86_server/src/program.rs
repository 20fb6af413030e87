/*
    ArduinoX86 Copyright 2022-2025 Daniel Balsom
    https://github.com/dbalsom/arduinoX86

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.
*/


//! Relocatable synthetic instruction streams fed onto the data bus in place of real memory.

use ardx86_common::DataWidth;

use crate::programs::OPCODE_NOPS;

/// An [InlineProgram] is a byte sequence the server feeds to the CPU during a phase. Reads
/// advance a cursor; once the program is exhausted every read returns the fill word, which
/// the caller tags as the end of the program.
#[derive(Clone, Debug)]
pub struct InlineProgram {
    name: &'static str,
    bytes: Vec<u8>,
    pos: usize,
    fill: u16,
    vector_offset: Option<usize>,
}

impl InlineProgram {
    pub fn new(name: &'static str, bytes: &[u8]) -> Self {
        Self {
            name,
            bytes: bytes.to_vec(),
            pos: 0,
            fill: OPCODE_NOPS,
            vector_offset: None,
        }
    }

    /// Mark the offset of the segment word `patch_vector` writes to.
    pub fn with_vector_offset(mut self, offset: usize) -> Self {
        self.vector_offset = Some(offset);
        self
    }

    pub fn with_fill(mut self, fill: u16) -> Self {
        self.fill = fill;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn fill(&self) -> u16 {
        self.fill
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.remaining() == 0
    }

    /// Rewinds the program to the start.
    pub fn reset(&mut self) {
        self.pos = 0;
    }

    fn next_byte(&mut self, fill: u8) -> u8 {
        match self.bytes.get(self.pos) {
            Some(byte) => {
                self.pos += 1;
                *byte
            }
            None => fill,
        }
    }

    /// Produce the next data bus value for a code fetch of the given width, advancing the
    /// cursor. The address is only used for tracing: the program is position independent.
    pub fn read(&mut self, address: u32, width: DataWidth) -> u16 {
        let [fill_lo, fill_hi] = self.fill.to_le_bytes();
        let value = match width {
            DataWidth::EightLow => self.next_byte(fill_lo) as u16,
            DataWidth::EightHigh => ((self.next_byte(fill_hi) as u16) << 8) | fill_lo as u16,
            DataWidth::Sixteen => {
                let lo = self.next_byte(fill_lo);
                let hi = self.next_byte(fill_hi);
                u16::from_le_bytes([lo, hi])
            }
            DataWidth::Invalid => self.fill,
        };
        log::trace!(
            "{}: read [{:05X}] {:?} -> {:04X} ({}/{})",
            self.name,
            address,
            width,
            value,
            self.pos,
            self.bytes.len()
        );
        value
    }

    /// Produce a data bus value for `address`, treating the program as an image mapped at
    /// `base`. The cursor is not touched. Bytes outside the image read as fill.
    pub fn read_at(&self, base: u32, address: u32, width: DataWidth) -> u16 {
        let [fill_lo, fill_hi] = self.fill.to_le_bytes();
        let byte_at = |addr: u32, fill: u8| -> u8 {
            addr.checked_sub(base)
                .and_then(|offset| self.bytes.get(offset as usize))
                .copied()
                .unwrap_or(fill)
        };
        match width {
            DataWidth::EightLow => byte_at(address, fill_lo) as u16,
            DataWidth::EightHigh => ((byte_at(address, fill_hi) as u16) << 8) | fill_lo as u16,
            DataWidth::Sixteen => u16::from_le_bytes([
                byte_at(address, fill_lo),
                byte_at(address.wrapping_add(1), fill_hi),
            ]),
            DataWidth::Invalid => self.fill,
        }
    }

    /// Write `segment` at the program's vector-patch offset.
    pub fn patch_vector(&mut self, segment: u16) {
        if let Some(offset) = self.vector_offset {
            self.patch_word_at(offset, segment);
        }
    }

    /// Write a little-endian word into the program. Patches that don't fit are ignored.
    pub fn patch_word_at(&mut self, offset: usize, value: u16) {
        let end = offset.checked_add(2).filter(|end| *end <= self.bytes.len());
        if let Some(end) = end {
            self.bytes[offset..end].copy_from_slice(&value.to_le_bytes());
        } else {
            log::trace!("{}: ignoring patch at offset {}", self.name, offset);
        }
    }

    pub fn patch_byte_at(&mut self, offset: usize, value: u8) {
        if let Some(byte) = self.bytes.get_mut(offset) {
            *byte = value;
        }
    }
}
