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


//! The ArduinoX86 bus-cycle protocol engine.
//!
//! [CpuServer] drives a real (or simulated) x86 CPU one clock at a time through the traits in
//! [hal]: it decodes the bus status each tick, emulates the 8288/82288 bus controller,
//! feeds synthetic instruction streams onto the data bus, keeps a model of the prefetch queue
//! in step with the CPU's, and sequences the Reset, Load, Execute and Store phases.
//! [CommandDispatcher] puts the host protocol in front of it.

// Annotate the trace line for the current cycle.
macro_rules! cycle_comment {
    ($self:ident, $($t:tt)*) => {{
        $self.cycle_comment = Some(format!($($t)*));
    }};
}

pub mod bus_emulator;
pub mod config;
pub mod controller;
pub mod cycle;
pub mod dispatcher;
pub mod hal;
pub mod memory;
pub mod program;
pub mod programs;
pub mod queue;
pub mod registers;
pub mod server;
pub mod sim;

// Re-export the common crate for convenience
pub use ardx86_common;

pub use bus_emulator::{assemble_writes, frame_from_writes, BusEmulator, BusOperation, CallFrame};
pub use config::{EndStrategy, MemoryConfig, PhaseTimeouts, ServerConfig};
pub use dispatcher::{CommandDispatcher, HostTransport, LoopbackTransport};
pub use hal::CpuHal;
pub use memory::{BackendKind, DefaultStrategy, MemoryBackend};
pub use queue::QueueDataType;
pub use registers::{RegisterBlock, Registers};
pub use server::{classify_cpu, CpuResetResult, CpuServer, CycleState};
pub use sim::{SimCpu, SimModel};
