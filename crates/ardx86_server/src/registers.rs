//! Register payload formats. Every payload on the wire starts with a [RegisterFormat] tag.

use ardx86_common::{RegisterFormat, Result, ServerCpuType, ServerError};

pub const CPU_FLAG_CARRY: u16 = 0b0000_0000_0000_0001;
pub const CPU_FLAG_RESERVED1: u16 = 0b0000_0000_0000_0010;
pub const CPU_FLAG_PARITY: u16 = 0b0000_0000_0000_0100;
pub const CPU_FLAG_AUX_CARRY: u16 = 0b0000_0000_0001_0000;
pub const CPU_FLAG_ZERO: u16 = 0b0000_0000_0100_0000;
pub const CPU_FLAG_SIGN: u16 = 0b0000_0000_1000_0000;
pub const CPU_FLAG_TRAP: u16 = 0b0000_0001_0000_0000;
pub const CPU_FLAG_INT_ENABLE: u16 = 0b0000_0010_0000_0000;
pub const CPU_FLAG_DIRECTION: u16 = 0b0000_0100_0000_0000;
pub const CPU_FLAG_OVERFLOW: u16 = 0b0000_1000_0000_0000;
// Emulation mode bit on V20
pub const CPU_FLAG_MODE: u16 = 0b1000_0000_0000_0000;

#[inline]
fn word_at(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn put_word(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn dword_at(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn check_len(format: RegisterFormat, buf: &[u8]) -> Result<()> {
    if buf.len() != format.payload_len() {
        return Err(ServerError::InvalidRegisterFormat(format!(
            "{:?} payload must be {} bytes, got {}",
            format,
            format.payload_len(),
            buf.len()
        )));
    }
    Ok(())
}

/// The V1 register set: the 14 registers of the 8086 programming model, stored in the order
/// AX, BX, CX, DX, SS, SP, FLAGS, IP, CS, DS, ES, BP, SI, DI, little-endian.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    pub ax: u16,
    pub bx: u16,
    pub cx: u16,
    pub dx: u16,
    pub ss: u16,
    pub sp: u16,
    pub flags: u16,
    pub ip: u16,
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub bp: u16,
    pub si: u16,
    pub di: u16,
}

impl Registers {
    pub const LEN: usize = 28;

    pub const FLAGS_OFFSET: usize = 0x0C;
    pub const IP_OFFSET: usize = 0x0E;
    pub const CS_OFFSET: usize = 0x10;

    pub fn rewind_ip(&mut self, adjust: u16) {
        self.ip = self.ip.wrapping_sub(adjust);
    }

    fn words(&self) -> [u16; 14] {
        [
            self.ax, self.bx, self.cx, self.dx, self.ss, self.sp, self.flags, self.ip, self.cs,
            self.ds, self.es, self.bp, self.si, self.di,
        ]
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Registers> {
        check_len(RegisterFormat::V1, buf)?;
        Ok(Registers {
            ax: word_at(buf, 0x00),
            bx: word_at(buf, 0x02),
            cx: word_at(buf, 0x04),
            dx: word_at(buf, 0x06),
            ss: word_at(buf, 0x08),
            sp: word_at(buf, 0x0A),
            flags: word_at(buf, 0x0C),
            ip: word_at(buf, 0x0E),
            cs: word_at(buf, 0x10),
            ds: word_at(buf, 0x12),
            es: word_at(buf, 0x14),
            bp: word_at(buf, 0x16),
            si: word_at(buf, 0x18),
            di: word_at(buf, 0x1A),
        })
    }

    pub fn to_bytes(&self) -> [u8; Registers::LEN] {
        let mut buf = [0u8; Registers::LEN];
        for (i, word) in self.words().iter().enumerate() {
            buf[i * 2..i * 2 + 2].copy_from_slice(&word.to_le_bytes());
        }
        buf
    }

    /// Linear address of CS:IP.
    pub fn code_address(&self) -> u32 {
        (((self.cs as u32) << 4) + self.ip as u32) & 0xF_FFFF
    }

    pub fn flags_str(&self) -> String {
        let f = self.flags;
        let c = |mask: u16, ch: char| if f & mask != 0 { ch } else { '-' };
        format!(
            "{}{}{}{}{}{}{}{}{}",
            c(CPU_FLAG_OVERFLOW, 'O'),
            c(CPU_FLAG_DIRECTION, 'D'),
            c(CPU_FLAG_INT_ENABLE, 'I'),
            c(CPU_FLAG_TRAP, 'T'),
            c(CPU_FLAG_SIGN, 'S'),
            c(CPU_FLAG_ZERO, 'Z'),
            c(CPU_FLAG_AUX_CARRY, 'A'),
            c(CPU_FLAG_PARITY, 'P'),
            c(CPU_FLAG_CARRY, 'C'),
        )
    }
}

impl std::fmt::Display for Registers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "AX: {:04X} BX: {:04X} CX: {:04X} DX: {:04X}\n\
             SP: {:04X} BP: {:04X} SI: {:04X} DI: {:04X}\n\
             CS: {:04X} DS: {:04X} ES: {:04X} SS: {:04X}\n\
             IP: {:04X}\n\
             FLAGS: {:04X} {}",
            self.ax,
            self.bx,
            self.cx,
            self.dx,
            self.sp,
            self.bp,
            self.si,
            self.di,
            self.cs,
            self.ds,
            self.es,
            self.ss,
            self.ip,
            self.flags,
            self.flags_str()
        )
    }
}

/// Offsets into the 80286 LOADALL image, relative to physical 0x800.
pub mod loadall286 {
    pub const MSW: usize = 0x06;
    pub const TR: usize = 0x16;
    pub const FLAGS: usize = 0x18;
    pub const IP: usize = 0x1A;
    pub const LDT: usize = 0x1C;
    pub const DS: usize = 0x1E;
    pub const SS: usize = 0x20;
    pub const CS: usize = 0x22;
    pub const ES: usize = 0x24;
    pub const DI: usize = 0x26;
    pub const SI: usize = 0x28;
    pub const BP: usize = 0x2A;
    pub const SP: usize = 0x2C;
    pub const BX: usize = 0x2E;
    pub const DX: usize = 0x30;
    pub const CX: usize = 0x32;
    pub const AX: usize = 0x34;
    pub const ES_DESC: usize = 0x36;
    pub const CS_DESC: usize = 0x3C;
    pub const SS_DESC: usize = 0x42;
    pub const DS_DESC: usize = 0x48;
}

/// V2: the 102-byte 80286 LOADALL image, exactly as the CPU reads it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Loadall286 {
    pub image: Vec<u8>,
}

impl Loadall286 {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        check_len(RegisterFormat::V2, buf)?;
        Ok(Self {
            image: buf.to_vec(),
        })
    }

    /// Build a real-mode image from a V1 register set. Descriptor cache bases are derived
    /// from the segment values with 64K limits.
    pub fn from_registers(regs: &Registers) -> Self {
        use loadall286::*;
        let mut image = vec![0u8; RegisterFormat::V2.payload_len()];
        let mut put = |offset: usize, value: u16| {
            image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        };
        put(MSW, 0xFFF0);
        put(FLAGS, regs.flags);
        put(IP, regs.ip);
        put(DS, regs.ds);
        put(SS, regs.ss);
        put(CS, regs.cs);
        put(ES, regs.es);
        put(DI, regs.di);
        put(SI, regs.si);
        put(BP, regs.bp);
        put(SP, regs.sp);
        put(BX, regs.bx);
        put(DX, regs.dx);
        put(CX, regs.cx);
        put(AX, regs.ax);
        for (desc, seg, rights) in [
            (ES_DESC, regs.es, 0x93u8),
            (CS_DESC, regs.cs, 0x9B),
            (SS_DESC, regs.ss, 0x93),
            (DS_DESC, regs.ds, 0x93),
        ] {
            let base = (seg as u32) << 4;
            image[desc..desc + 3].copy_from_slice(&base.to_le_bytes()[..3]);
            image[desc + 3] = rights;
            image[desc + 4..desc + 6].copy_from_slice(&0xFFFFu16.to_le_bytes());
        }
        Self { image }
    }

    pub fn cs(&self) -> u16 {
        word_at(&self.image, loadall286::CS)
    }

    pub fn ip(&self) -> u16 {
        word_at(&self.image, loadall286::IP)
    }

    pub fn flags(&self) -> u16 {
        word_at(&self.image, loadall286::FLAGS)
    }
}

/// Offsets into the 80386 LOADALL image.
pub mod loadall386 {
    pub const CR0: usize = 0x00;
    pub const EFLAGS: usize = 0x04;
    pub const EIP: usize = 0x08;
    pub const EDI: usize = 0x0C;
    pub const ESI: usize = 0x10;
    pub const EBP: usize = 0x14;
    pub const ESP: usize = 0x18;
    pub const EBX: usize = 0x1C;
    pub const EDX: usize = 0x20;
    pub const ECX: usize = 0x24;
    pub const EAX: usize = 0x28;
    pub const DR6: usize = 0x2C;
    pub const DR7: usize = 0x30;
    pub const TR: usize = 0x34;
    pub const LDT: usize = 0x38;
    pub const GS: usize = 0x3C;
    pub const FS: usize = 0x40;
    pub const DS: usize = 0x44;
    pub const SS: usize = 0x48;
    pub const CS: usize = 0x4C;
    pub const ES: usize = 0x50;
    /// First of ten 12-byte descriptor caches: TSS, IDT, GDT, LDT, GS, FS, DS, SS, CS, ES.
    pub const DESCRIPTORS: usize = 0x54;
}

/// V3A: the 204-byte 80386 LOADALL image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Loadall386 {
    pub image: Vec<u8>,
}

impl Loadall386 {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        check_len(RegisterFormat::V3A, buf)?;
        Ok(Self {
            image: buf.to_vec(),
        })
    }

    pub fn cs(&self) -> u16 {
        word_at(&self.image, loadall386::CS)
    }

    pub fn eip(&self) -> u32 {
        dword_at(&self.image, loadall386::EIP)
    }

    pub fn eflags(&self) -> u32 {
        dword_at(&self.image, loadall386::EFLAGS)
    }

    pub fn cr0(&self) -> u32 {
        dword_at(&self.image, loadall386::CR0)
    }
}

/// Offsets into the 80386 SMM state-save image.
pub mod smm386 {
    pub const CR0: usize = 0x00;
    pub const CR3: usize = 0x04;
    pub const EFLAGS: usize = 0x08;
    pub const EIP: usize = 0x0C;
    pub const EDI: usize = 0x10;
    pub const ESI: usize = 0x14;
    pub const EBP: usize = 0x18;
    pub const ESP: usize = 0x1C;
    pub const EBX: usize = 0x20;
    pub const EDX: usize = 0x24;
    pub const ECX: usize = 0x28;
    pub const EAX: usize = 0x2C;
    pub const DR6: usize = 0x30;
    pub const DR7: usize = 0x34;
    pub const TR: usize = 0x38;
    pub const LDTR: usize = 0x3C;
    pub const GS: usize = 0x40;
    pub const FS: usize = 0x44;
    pub const DS: usize = 0x48;
    pub const SS: usize = 0x4C;
    pub const CS: usize = 0x50;
    pub const ES: usize = 0x54;
    pub const DESCRIPTORS: usize = 0x58;
}

/// V3B: the 208-byte 80386 SMM state-save dump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Smm386 {
    pub image: Vec<u8>,
}

impl Smm386 {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        check_len(RegisterFormat::V3B, buf)?;
        Ok(Self {
            image: buf.to_vec(),
        })
    }

    pub fn cs(&self) -> u16 {
        word_at(&self.image, smm386::CS)
    }

    pub fn eip(&self) -> u32 {
        dword_at(&self.image, smm386::EIP)
    }

    pub fn eflags(&self) -> u32 {
        dword_at(&self.image, smm386::EFLAGS)
    }

    /// Replace the interrupted context with the one an interrupt pushed just before the
    /// dump was taken, and pop the frame.
    pub fn unwind_frame(&mut self, ip: u16, cs: u16, flags: u16) {
        put_word(&mut self.image, smm386::EIP, ip);
        put_word(&mut self.image, smm386::CS, cs);
        put_word(&mut self.image, smm386::EFLAGS, flags);
        let sp = word_at(&self.image, smm386::ESP).wrapping_add(6);
        put_word(&mut self.image, smm386::ESP, sp);
    }

    /// The low 16 bits of the general and segment registers, as a V1 set.
    pub fn to_registers(&self) -> Registers {
        use smm386::*;
        let w = |offset: usize| word_at(&self.image, offset);
        Registers {
            ax: w(EAX),
            bx: w(EBX),
            cx: w(ECX),
            dx: w(EDX),
            ss: w(SS),
            sp: w(ESP),
            flags: w(EFLAGS),
            ip: w(EIP),
            cs: w(CS),
            ds: w(DS),
            es: w(ES),
            bp: w(EBP),
            si: w(ESI),
            di: w(EDI),
        }
    }
}

/// A register payload of any supported format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegisterBlock {
    V1(Registers),
    V2(Loadall286),
    V3A(Loadall386),
    V3B(Smm386),
}

impl RegisterBlock {
    pub fn from_payload(format: RegisterFormat, payload: &[u8]) -> Result<Self> {
        Ok(match format {
            RegisterFormat::V1 => RegisterBlock::V1(Registers::from_bytes(payload)?),
            RegisterFormat::V2 => RegisterBlock::V2(Loadall286::from_bytes(payload)?),
            RegisterFormat::V3A => RegisterBlock::V3A(Loadall386::from_bytes(payload)?),
            RegisterFormat::V3B => RegisterBlock::V3B(Smm386::from_bytes(payload)?),
        })
    }

    /// Parse a tagged payload.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let (&tag, payload) = buf.split_first().ok_or_else(|| {
            ServerError::InvalidRegisterFormat("empty register payload".to_string())
        })?;
        RegisterBlock::from_payload(RegisterFormat::try_from(tag)?, payload)
    }

    pub fn format(&self) -> RegisterFormat {
        match self {
            RegisterBlock::V1(_) => RegisterFormat::V1,
            RegisterBlock::V2(_) => RegisterFormat::V2,
            RegisterBlock::V3A(_) => RegisterFormat::V3A,
            RegisterBlock::V3B(_) => RegisterFormat::V3B,
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        match self {
            RegisterBlock::V1(regs) => regs.to_bytes().to_vec(),
            RegisterBlock::V2(l) => l.image.clone(),
            RegisterBlock::V3A(l) => l.image.clone(),
            RegisterBlock::V3B(s) => s.image.clone(),
        }
    }

    pub fn to_tagged_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.format().payload_len());
        buf.push(self.format() as u8);
        buf.extend(self.payload());
        buf
    }

    /// Check that a CPU can load this format.
    pub fn check_cpu(&self, cpu_type: ServerCpuType) -> Result<()> {
        let ok = match self {
            RegisterBlock::V1(_) => true,
            RegisterBlock::V2(_) => cpu_type == ServerCpuType::Intel80286,
            RegisterBlock::V3A(_) | RegisterBlock::V3B(_) => {
                cpu_type == ServerCpuType::Intel80386
            }
        };
        if ok {
            Ok(())
        } else {
            Err(ServerError::InvalidRegisterFormat(format!(
                "{:?} registers cannot be loaded on {:?}",
                self.format(),
                cpu_type
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v1_layout_order() {
        let buf: Vec<u8> = (0..28).collect();
        let regs = Registers::from_bytes(&buf).unwrap();
        assert_eq!(regs.ax, 0x0100);
        assert_eq!(regs.ss, 0x0908);
        assert_eq!(regs.flags, 0x0D0C);
        assert_eq!(regs.ip, 0x0F0E);
        assert_eq!(regs.cs, 0x1110);
        assert_eq!(regs.di, 0x1B1A);
        assert_eq!(regs.to_bytes().to_vec(), buf);
    }

    #[test]
    fn test_tagged_parse_rejects_bad_input() {
        assert!(matches!(
            RegisterBlock::parse(&[]),
            Err(ServerError::InvalidRegisterFormat(_))
        ));
        assert!(matches!(
            RegisterBlock::parse(&[0x09; 29]),
            Err(ServerError::InvalidRegisterFormat(_))
        ));
        assert!(matches!(
            RegisterBlock::parse(&[0x01; 20]),
            Err(ServerError::InvalidRegisterFormat(_))
        ));

        let mut buf = vec![0x02];
        buf.extend(vec![0u8; 102]);
        let block = RegisterBlock::parse(&buf).unwrap();
        assert_eq!(block.format(), RegisterFormat::V2);
        assert_eq!(block.to_tagged_bytes(), buf);
        assert!(block.check_cpu(ServerCpuType::Intel8088).is_err());
        assert!(block.check_cpu(ServerCpuType::Intel80286).is_ok());
    }

    #[test]
    fn test_loadall286_from_registers() {
        let regs = Registers {
            cs: 0xF000,
            ip: 0xFFF0,
            ds: 0x1234,
            ..Default::default()
        };
        let l = Loadall286::from_registers(&regs);
        assert_eq!(l.cs(), 0xF000);
        assert_eq!(l.ip(), 0xFFF0);
        let d = loadall286::DS_DESC;
        assert_eq!(&l.image[d..d + 6], &[0x40, 0x23, 0x01, 0x93, 0xFF, 0xFF]);
    }

    #[test]
    fn test_smm_dump_to_registers() {
        let mut image = vec![0u8; 208];
        image[smm386::EAX..smm386::EAX + 4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        image[smm386::CS..smm386::CS + 2].copy_from_slice(&0x0F00u16.to_le_bytes());
        let smm = Smm386::from_bytes(&image).unwrap();
        let regs = smm.to_registers();
        assert_eq!(regs.ax, 0xBEEF);
        assert_eq!(regs.cs, 0x0F00);
    }

    #[test]
    fn test_smm_unwind_frame() {
        let mut image = vec![0u8; 208];
        image[smm386::ESP..smm386::ESP + 4].copy_from_slice(&0x0001_00FAu32.to_le_bytes());
        image[smm386::EIP..smm386::EIP + 4].copy_from_slice(&0x0000_0004u32.to_le_bytes());
        let mut smm = Smm386::from_bytes(&image).unwrap();
        smm.unwind_frame(0x0106, 0x1000, 0xF046);
        assert_eq!(smm.cs(), 0x1000);
        assert_eq!(smm.eip(), 0x0106);
        assert_eq!(smm.eflags(), 0xF046);
        // Only the low word of ESP moves.
        assert_eq!(word_at(&smm.image, smm386::ESP), 0x0100);
        assert_eq!(word_at(&smm.image, smm386::ESP + 2), 0x0001);
    }
}
