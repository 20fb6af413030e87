//! Opcode constants and the inline programs the server feeds during each phase.

use ardx86_common::{CpuFamily, ServerCpuType};

use crate::program::InlineProgram;
use crate::registers::Registers;

pub const OPCODE_NOPS: u16 = 0x9090;
pub const OPCODE_NOPS80: u16 = 0x0000; // NOP for 8080

/// Segment the reset vector jumps to before running the register load program.
pub const LOAD_SEGMENT: u16 = 0xD000;
/// Segment of the synthetic interrupt handlers. The NMI vector points at offset 0.
pub const ISR_SEGMENT: u16 = 0xF800;
/// Port the store program writes to when it is done.
pub const IO_FINALIZE_ADDR: u32 = 0x00FF;
/// Interrupt number used to enter 8080 emulation mode on NEC CPUs.
pub const BRKEM_INT: u8 = 0xFF;
/// Physical address of the NMI vector.
pub const NMI_VECTOR_ADDR: u32 = 0x0008;
/// 80286 LOADALL reads its image from this physical address.
pub const LOADALL286_ADDR: u32 = 0x0800;
/// 80386 LOADALL reads its image from ES:EDI, which is 0 after reset.
pub const LOADALL386_ADDR: u32 = 0x0000;
/// Default SMBASE; the SMI handler starts at SMBASE + 0x8000.
pub const SMM_BASE: u32 = 0x3_0000;
pub const SMM_ENTRY_ADDR: u32 = SMM_BASE + 0x8000;
/// The state-save image ends at the top of SMRAM.
pub const SMM_SAVE_ADDR: u32 = SMM_BASE + 0x1_0000 - 208;

/// The identification program. Intel and NEC parts take a different number of cycles to
/// execute it.
pub static CPUID_PROGRAM: [u8; 2] = [0xD5, 0x0A];

pub static JUMP_VECTOR_PROGRAM: [u8; 5] = [0xEA, 0x00, 0x00, 0x00, 0x00];
const JUMP_VECTOR_SEGMENT_OFFSET: usize = 3;

/// Move the 8018x peripheral control block out of the top of I/O space.
pub static I186_SETUP_PROGRAM: [u8; 7] = [
    0xBA, 0xFE, 0xFF, // mov dx, 0xFFFE
    0xB8, 0x00, 0x10, // mov ax, 0x1000
    0xEF, // out dx, ax
];

pub static INTEL808X_PREFETCH_PROGRAM: [u8; 4] = [0xAA, 0xAA, 0xAA, 0xAA]; // (4x stosb)
pub static NECVX0_PREFETCH_PROGRAM: [u8; 2] = [0x63, 0xC0]; // (undefined, no side effects)

pub static LOADALL286_PROGRAM: [u8; 2] = [0x0F, 0x05];
pub static LOADALL386_PROGRAM: [u8; 2] = [0x0F, 0x07];
pub static STOREALL_PROGRAM: [u8; 3] = [0xF1, 0x0F, 0x04];
pub static RSM_PROGRAM: [u8; 2] = [0x0F, 0xAA];

pub static BRKEM_PROGRAM: [u8; 3] = [0x0F, 0xFF, BRKEM_INT];
pub static RETEM_PROGRAM: [u8; 2] = [0xED, 0xFD];

// Register load program. Immediates are patched from the register block before the phase
// begins. POPF reads the flags word, which the server serves from the stack read.
static LOAD_PROGRAM: [u8; 45] = [
    0xBB, 0x00, 0x00, // mov bx, imm
    0xB9, 0x00, 0x00, // mov cx, imm
    0xBA, 0x00, 0x00, // mov dx, imm
    0xB8, 0x00, 0x00, // mov ax, imm (ss)
    0x8E, 0xD0, // mov ss, ax
    0xB8, 0x00, 0x00, // mov ax, imm (ds)
    0x8E, 0xD8, // mov ds, ax
    0xB8, 0x00, 0x00, // mov ax, imm (es)
    0x8E, 0xC0, // mov es, ax
    0xBC, 0x00, 0x00, // mov sp, imm
    0xBD, 0x00, 0x00, // mov bp, imm
    0xBE, 0x00, 0x00, // mov si, imm
    0xBF, 0x00, 0x00, // mov di, imm
    0x9D, // popf
    0xB8, 0x00, 0x00, // mov ax, imm
    0xEA, 0x00, 0x00, 0x00, 0x00, // jmp far cs:ip
];

const LOAD_BX: usize = 1;
const LOAD_CX: usize = 4;
const LOAD_DX: usize = 7;
const LOAD_SS: usize = 10;
const LOAD_DS: usize = 15;
const LOAD_ES: usize = 20;
const LOAD_SP: usize = 25;
const LOAD_BP: usize = 28;
const LOAD_SI: usize = 31;
const LOAD_DI: usize = 34;
const LOAD_AX: usize = 38;
const LOAD_IP: usize = 41;
const LOAD_CS: usize = 43;

// Register store program. Each register is written to the port matching its offset in the
// V1 register layout. FLAGS is captured from the PUSHF stack write, IP from the address of
// the first instruction that was not executed.
static STORE_PROGRAM: [u8; 49] = [
    0xE7, 0x00, // out 0x00, ax
    0x89, 0xD8, 0xE7, 0x02, // mov ax, bx; out 0x02, ax
    0x89, 0xC8, 0xE7, 0x04, // mov ax, cx; out 0x04, ax
    0x89, 0xD0, 0xE7, 0x06, // mov ax, dx; out 0x06, ax
    0x8C, 0xD0, 0xE7, 0x08, // mov ax, ss; out 0x08, ax
    0x89, 0xE0, 0xE7, 0x0A, // mov ax, sp; out 0x0A, ax
    0x9C, // pushf
    0x8C, 0xC8, 0xE7, 0x10, // mov ax, cs; out 0x10, ax
    0x8C, 0xD8, 0xE7, 0x12, // mov ax, ds; out 0x12, ax
    0x8C, 0xC0, 0xE7, 0x14, // mov ax, es; out 0x14, ax
    0x89, 0xE8, 0xE7, 0x16, // mov ax, bp; out 0x16, ax
    0x89, 0xF0, 0xE7, 0x18, // mov ax, si; out 0x18, ax
    0x89, 0xF8, 0xE7, 0x1A, // mov ax, di; out 0x1A, ax
    0xE6, 0xFF, // out 0xFF, al
];

pub fn cpuid_program() -> InlineProgram {
    InlineProgram::new("cpuid", &CPUID_PROGRAM)
}

pub fn jump_vector_program(segment: u16) -> InlineProgram {
    let mut program = InlineProgram::new("jump_vector", &JUMP_VECTOR_PROGRAM)
        .with_vector_offset(JUMP_VECTOR_SEGMENT_OFFSET);
    program.patch_vector(segment);
    program
}

/// Return the setup program for a family, if it needs one.
pub fn setup_program(family: CpuFamily) -> Option<InlineProgram> {
    match family {
        CpuFamily::Intel186 => Some(InlineProgram::new("setup_186", &I186_SETUP_PROGRAM)),
        _ => None,
    }
}

/// Return the prefetch program for a CPU type.
pub fn prefetch_program(cpu_type: ServerCpuType) -> Option<InlineProgram> {
    match cpu_type {
        ServerCpuType::NecV20 | ServerCpuType::NecV30 => {
            Some(InlineProgram::new("prefetch_nec", &NECVX0_PREFETCH_PROGRAM))
        }
        ServerCpuType::Intel8088
        | ServerCpuType::Intel8086
        | ServerCpuType::Intel80188(_)
        | ServerCpuType::Intel80186(_) => {
            Some(InlineProgram::new("prefetch_intel", &INTEL808X_PREFETCH_PROGRAM))
        }
        _ => None,
    }
}

/// Build the register load program for `regs`. SP is loaded two below its final value, as
/// POPF adds it back.
pub fn load_program(regs: &Registers) -> InlineProgram {
    let mut program = InlineProgram::new("load", &LOAD_PROGRAM);
    for (offset, value) in [
        (LOAD_BX, regs.bx),
        (LOAD_CX, regs.cx),
        (LOAD_DX, regs.dx),
        (LOAD_SS, regs.ss),
        (LOAD_DS, regs.ds),
        (LOAD_ES, regs.es),
        (LOAD_SP, regs.sp.wrapping_sub(2)),
        (LOAD_BP, regs.bp),
        (LOAD_SI, regs.si),
        (LOAD_DI, regs.di),
        (LOAD_AX, regs.ax),
        (LOAD_IP, regs.ip),
        (LOAD_CS, regs.cs),
    ] {
        program.patch_word_at(offset, value);
    }
    program
}

pub fn store_program() -> InlineProgram {
    InlineProgram::new("store", &STORE_PROGRAM)
}

/// An empty program whose fill marks the end of the user program.
pub fn finalize_program(emu8080: bool) -> InlineProgram {
    let fill = if emu8080 { OPCODE_NOPS80 } else { OPCODE_NOPS };
    InlineProgram::new("finalize", &[]).with_fill(fill)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_program_patches_registers() {
        let regs = Registers {
            ax: 0x1111,
            bx: 0x2222,
            cx: 0x3333,
            dx: 0x4444,
            ss: 0x5555,
            sp: 0x0100,
            flags: 0xF002,
            ip: 0x0010,
            cs: 0x2000,
            ds: 0x6666,
            es: 0x7777,
            bp: 0x8888,
            si: 0x9999,
            di: 0xAAAA,
        };
        let program = load_program(&regs);
        let bytes = program.bytes();
        assert_eq!(&bytes[0..3], &[0xBB, 0x22, 0x22]);
        assert_eq!(&bytes[24..27], &[0xBC, 0xFE, 0x00]);
        assert_eq!(&bytes[36..40], &[0x9D, 0xB8, 0x11, 0x11]);
        assert_eq!(&bytes[40..45], &[0xEA, 0x10, 0x00, 0x00, 0x20]);
    }

    #[test]
    fn test_jump_vector_targets_segment() {
        let program = jump_vector_program(LOAD_SEGMENT);
        assert_eq!(program.bytes(), &[0xEA, 0x00, 0x00, 0x00, 0xD0]);
    }

    #[test]
    fn test_store_program_ends_with_finalize_port() {
        let program = store_program();
        let n = program.len();
        assert_eq!(&program.bytes()[n - 2..], &[0xE6, IO_FINALIZE_ADDR as u8]);
    }
}
