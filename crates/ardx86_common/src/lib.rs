//! Wire-level vocabulary of the ArduinoX86 server: detected CPU types, bus status encodings,
//! queue operations, server states and the host command set.

use std::str::FromStr;

pub mod error;

pub use error::{Result, ServerError};

/// Protocol version reported by the Version command.
pub const PROTOCOL_VER: u8 = 3;
/// Identification text returned by the Version command, followed by [PROTOCOL_VER].
pub const VERSION_TEXT: &[u8; 7] = b"ardX86 ";

pub const RESULT_OK: u8 = 0x01;
pub const RESULT_FAIL: u8 = 0x00;

pub const CONTROL_ALE_BIT: u8 = 0b0000_0001;

pub const COMMAND_MRDC_BIT: u8 = 0b0000_0001;
pub const COMMAND_AMWC_BIT: u8 = 0b0000_0010;
pub const COMMAND_MWTC_BIT: u8 = 0b0000_0100;
pub const COMMAND_IORC_BIT: u8 = 0b0000_1000;
pub const COMMAND_AIOWC_BIT: u8 = 0b0001_0000;
pub const COMMAND_IOWC_BIT: u8 = 0b0010_0000;
pub const COMMAND_INTA_BIT: u8 = 0b0100_0000;
pub const COMMAND_BHE_BIT: u8 = 0b1000_0000;

pub const STATUS_SEG_BITS: u8 = 0b0001_1000;
pub const STATUS_QS_BITS: u8 = 0b1100_0000;

// Server flags, settable by the host with SetFlags.
pub const FLAG_EXECUTE_AUTOMATIC: u32 = 0x0000_0001;
pub const FLAG_EMU_8080: u32 = 0x0000_0002;
pub const FLAG_HALT_AFTER_JUMP: u32 = 0x0000_0004;
pub const FLAG_USE_SMM: u32 = 0x0000_0008;
pub const FLAG_DEBUG_ENABLED: u32 = 0x0000_0010;

/// [CpuFamily] selects the bus-cycle model and bus controller the server uses. Unlike
/// [ServerCpuType], the family is not detected: it is a property of the board the CPU sits in.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CpuFamily {
    /// 8088, 8086, NEC V20 and V30.
    #[default]
    Intel808x,
    /// 80188 and 80186.
    Intel186,
    Intel286,
    Intel386,
}

impl CpuFamily {
    /// Return whether this family's bus needs an emulated 8288 (as opposed to an 82288-style
    /// controller decoding the onboard status nibble).
    pub fn uses_8288(&self) -> bool {
        matches!(self, CpuFamily::Intel808x | CpuFamily::Intel186)
    }
}

impl FromStr for CpuFamily {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, String>
    where
        Self: Sized,
    {
        match s.to_lowercase().as_str() {
            "808x" | "8088" | "8086" | "v20" | "v30" => Ok(CpuFamily::Intel808x),
            "186" | "80186" | "80188" => Ok(CpuFamily::Intel186),
            "286" | "80286" => Ok(CpuFamily::Intel286),
            "386" | "80386" => Ok(CpuFamily::Intel386),
            _ => Err("Bad value for CpuFamily".to_string()),
        }
    }
}

/// [ServerCpuType] maps to the CPU types that can be detected by the server.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ServerCpuType {
    #[default]
    Intel8088,
    Intel8086,
    NecV20,
    NecV30,
    Intel80188(bool),
    Intel80186(bool),
    Intel80286,
    Intel80386,
}

impl ServerCpuType {
    /// Returns whether the CPU type is an Intel CPU.
    pub fn is_intel(&self) -> bool {
        !matches!(self, ServerCpuType::NecV20 | ServerCpuType::NecV30)
    }
    /// Returns whether this CPU type supports 8080 emulation. Only the NEC V20 and V30
    /// support this.
    pub fn has_8080_emulation(&self) -> bool {
        matches!(self, ServerCpuType::NecV20 | ServerCpuType::NecV30)
    }
    /// Returns whether the CPU exposes queue status on its control lines.
    pub fn has_queue_status(&self) -> bool {
        match self {
            ServerCpuType::Intel80188(qs) | ServerCpuType::Intel80186(qs) => *qs,
            ServerCpuType::Intel80286 | ServerCpuType::Intel80386 => false,
            _ => true,
        }
    }
    pub fn family(&self) -> CpuFamily {
        match self {
            ServerCpuType::Intel80188(_) | ServerCpuType::Intel80186(_) => CpuFamily::Intel186,
            ServerCpuType::Intel80286 => CpuFamily::Intel286,
            ServerCpuType::Intel80386 => CpuFamily::Intel386,
            _ => CpuFamily::Intel808x,
        }
    }
}

/// Derive the [CpuWidth] from a [ServerCpuType].
impl From<ServerCpuType> for CpuWidth {
    fn from(cpu_type: ServerCpuType) -> Self {
        match cpu_type {
            ServerCpuType::Intel8088 | ServerCpuType::NecV20 | ServerCpuType::Intel80188(_) => {
                CpuWidth::Eight
            }
            _ => CpuWidth::Sixteen,
        }
    }
}

/// Convert a [ServerCpuType] to the byte returned by the CpuType command. Bit 7 carries the
/// queue-status flag for the 8018x.
impl From<ServerCpuType> for u8 {
    fn from(cpu_type: ServerCpuType) -> u8 {
        match cpu_type {
            ServerCpuType::Intel8088 => 0x00,
            ServerCpuType::Intel8086 => 0x01,
            ServerCpuType::NecV20 => 0x02,
            ServerCpuType::NecV30 => 0x03,
            ServerCpuType::Intel80188(qs) => 0x04 | if qs { 0x80 } else { 0 },
            ServerCpuType::Intel80186(qs) => 0x05 | if qs { 0x80 } else { 0 },
            ServerCpuType::Intel80286 => 0x06,
            ServerCpuType::Intel80386 => 0x07,
        }
    }
}

impl TryFrom<u8> for ServerCpuType {
    type Error = ServerError;
    fn try_from(value: u8) -> Result<ServerCpuType> {
        match value & 0x7F {
            0x00 => Ok(ServerCpuType::Intel8088),
            0x01 => Ok(ServerCpuType::Intel8086),
            0x02 => Ok(ServerCpuType::NecV20),
            0x03 => Ok(ServerCpuType::NecV30),
            0x04 => Ok(ServerCpuType::Intel80188((value & 0x80) != 0)),
            0x05 => Ok(ServerCpuType::Intel80186((value & 0x80) != 0)),
            0x06 => Ok(ServerCpuType::Intel80286),
            0x07 => Ok(ServerCpuType::Intel80386),
            _ => Err(ServerError::BadValue(format!("cpu type {:02X}", value))),
        }
    }
}

/// [DataWidth] represents which part of the data bus is active for the current transfer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DataWidth {
    /// Neither half of the bus is driven. Seen on refresh cycles.
    #[default]
    Invalid,
    /// The entire data bus is being driven.
    Sixteen,
    /// The low half of the data bus is being driven, A0 is even.
    EightLow,
    /// The high half of the data bus is being driven, A0 is odd.
    EightHigh,
}

impl DataWidth {
    /// Number of queue slots a code fetch of this width fills.
    pub fn bytes(&self) -> usize {
        match self {
            DataWidth::Invalid => 0,
            DataWidth::Sixteen => 2,
            DataWidth::EightLow | DataWidth::EightHigh => 1,
        }
    }
}

/// Convert the (BHE asserted, A0) signals to a [DataWidth].
impl From<(bool, bool)> for DataWidth {
    fn from(signals: (bool, bool)) -> DataWidth {
        match signals {
            // Odd address, high half of bus active.
            (true, true) => DataWidth::EightHigh,
            // Even address with BHE, full bus active.
            (true, false) => DataWidth::Sixteen,
            // Odd address without BHE. Neither half is driven.
            (false, true) => DataWidth::Invalid,
            (false, false) => DataWidth::EightLow,
        }
    }
}

/// [CpuWidth] represents the width of the detected CPU's data bus.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CpuWidth {
    #[default]
    Eight,
    Sixteen,
}

impl CpuWidth {
    /// Returns the size of the instruction queue for the CPU width.
    pub fn queue_size(&self) -> usize {
        match self {
            CpuWidth::Eight => 4,
            CpuWidth::Sixteen => 6,
        }
    }
}

impl From<u8> for CpuWidth {
    fn from(value: u8) -> Self {
        match value {
            0 => CpuWidth::Eight,
            _ => CpuWidth::Sixteen,
        }
    }
}

/// Convert a [CpuWidth] to a usize value representing the number of bytes.
impl From<CpuWidth> for usize {
    fn from(value: CpuWidth) -> usize {
        match value {
            CpuWidth::Eight => 1,
            CpuWidth::Sixteen => 2,
        }
    }
}

/// [ServerCommand] represents the commands that can be sent to the server.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ServerCommand {
    CmdNull = 0x00,
    CmdVersion = 0x01,
    CmdReset = 0x02,
    CmdLoad = 0x03,
    CmdCycle = 0x04,
    CmdReadAddressLatch = 0x05,
    CmdReadStatus = 0x06,
    CmdRead8288Command = 0x07,
    CmdRead8288Control = 0x08,
    CmdReadDataBus = 0x09,
    CmdWriteDataBus = 0x0A,
    CmdFinalize = 0x0B,
    CmdBeginStore = 0x0C,
    CmdStore = 0x0D,
    CmdQueueLen = 0x0E,
    CmdQueueBytes = 0x0F,
    CmdWritePin = 0x10,
    CmdReadPin = 0x11,
    CmdGetProgramState = 0x12,
    CmdGetLastError = 0x13,
    CmdGetCycleState = 0x14,
    CmdCGetCycleState = 0x15,
    CmdPrefetchStore = 0x16,
    CmdReadAddressU = 0x17,
    CmdCpuType = 0x18,
    CmdEmulate8080 = 0x19,
    CmdPrefetch = 0x1A,
    CmdInitScreen = 0x1B,
    CmdStoreAll = 0x1C,
    CmdSetRandomSeed = 0x1D,
    CmdRandomizeMem = 0x1E,
    CmdSetMemory = 0x1F,
    CmdGetCycleStates = 0x20,
    CmdEnableDebug = 0x21,
    CmdSetMemoryStrategy = 0x22,
    CmdGetFlags = 0x23,
    CmdSetFlags = 0x24,
    CmdReadMemory = 0x25,
    CmdCycleN = 0x26,
    CmdEraseMemory = 0x27,
    CmdServerStatus = 0x28,
    CmdClearCycleLog = 0x29,
    CmdGetCycleLog = 0x2A,
    CmdRun = 0x2B,
}

impl ServerCommand {
    const ALL: [ServerCommand; 44] = [
        ServerCommand::CmdNull,
        ServerCommand::CmdVersion,
        ServerCommand::CmdReset,
        ServerCommand::CmdLoad,
        ServerCommand::CmdCycle,
        ServerCommand::CmdReadAddressLatch,
        ServerCommand::CmdReadStatus,
        ServerCommand::CmdRead8288Command,
        ServerCommand::CmdRead8288Control,
        ServerCommand::CmdReadDataBus,
        ServerCommand::CmdWriteDataBus,
        ServerCommand::CmdFinalize,
        ServerCommand::CmdBeginStore,
        ServerCommand::CmdStore,
        ServerCommand::CmdQueueLen,
        ServerCommand::CmdQueueBytes,
        ServerCommand::CmdWritePin,
        ServerCommand::CmdReadPin,
        ServerCommand::CmdGetProgramState,
        ServerCommand::CmdGetLastError,
        ServerCommand::CmdGetCycleState,
        ServerCommand::CmdCGetCycleState,
        ServerCommand::CmdPrefetchStore,
        ServerCommand::CmdReadAddressU,
        ServerCommand::CmdCpuType,
        ServerCommand::CmdEmulate8080,
        ServerCommand::CmdPrefetch,
        ServerCommand::CmdInitScreen,
        ServerCommand::CmdStoreAll,
        ServerCommand::CmdSetRandomSeed,
        ServerCommand::CmdRandomizeMem,
        ServerCommand::CmdSetMemory,
        ServerCommand::CmdGetCycleStates,
        ServerCommand::CmdEnableDebug,
        ServerCommand::CmdSetMemoryStrategy,
        ServerCommand::CmdGetFlags,
        ServerCommand::CmdSetFlags,
        ServerCommand::CmdReadMemory,
        ServerCommand::CmdCycleN,
        ServerCommand::CmdEraseMemory,
        ServerCommand::CmdServerStatus,
        ServerCommand::CmdClearCycleLog,
        ServerCommand::CmdGetCycleLog,
        ServerCommand::CmdRun,
    ];
}

impl TryFrom<u8> for ServerCommand {
    type Error = ServerError;
    fn try_from(value: u8) -> Result<ServerCommand> {
        ServerCommand::ALL
            .get(value as usize)
            .copied()
            .ok_or(ServerError::InvalidCommand(value))
    }
}

/// [ServerState] represents the current phase of the server state machine.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ServerState {
    #[default]
    Reset = 0,
    CpuId,
    CpuSetup,
    JumpVector,
    Load,
    LoadSmm,
    LoadDone,
    EmuEnter,
    Prefetch,
    Execute,
    ExecuteFinalize,
    ExecuteDone,
    EmuExit,
    Store,
    StoreDone,
    StoreDoneSmm,
    Done,
    StoreAll,
    Shutdown,
    Error,
}

impl ServerState {
    const ALL: [ServerState; 20] = [
        ServerState::Reset,
        ServerState::CpuId,
        ServerState::CpuSetup,
        ServerState::JumpVector,
        ServerState::Load,
        ServerState::LoadSmm,
        ServerState::LoadDone,
        ServerState::EmuEnter,
        ServerState::Prefetch,
        ServerState::Execute,
        ServerState::ExecuteFinalize,
        ServerState::ExecuteDone,
        ServerState::EmuExit,
        ServerState::Store,
        ServerState::StoreDone,
        ServerState::StoreDoneSmm,
        ServerState::Done,
        ServerState::StoreAll,
        ServerState::Shutdown,
        ServerState::Error,
    ];

    /// Return whether the CPU is running the user's program in this state.
    pub fn is_executing(&self) -> bool {
        matches!(self, ServerState::Execute | ServerState::ExecuteFinalize)
    }
}

impl TryFrom<u8> for ServerState {
    type Error = ServerError;
    fn try_from(value: u8) -> Result<ServerState> {
        ServerState::ALL
            .get(value as usize)
            .copied()
            .ok_or_else(|| ServerError::BadValue(format!("server state {:02X}", value)))
    }
}

/// [Segment] represents the segment register used by the current bus cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    ES = 0,
    SS,
    CS,
    DS,
}

/// [QueueOp] represents the operation performed on the instruction queue on the last cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueOp {
    Idle = 0,
    First,
    Flush,
    Subsequent,
}

/// [BusStatus] is the decoded bus status, shared across CPU families. Each family packs it
/// differently on its status lines; see `ardx86_server::cycle`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BusStatus {
    IrqAck = 0,
    IoRead = 1,
    IoWrite = 2,
    Halt = 3,
    Code = 4,
    MemRead = 5,
    MemWrite = 6,
    #[default]
    Passive = 7,
}

impl BusStatus {
    pub fn is_active(&self) -> bool {
        !matches!(self, BusStatus::Passive)
    }
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            BusStatus::Code | BusStatus::MemRead | BusStatus::IoRead | BusStatus::IrqAck
        )
    }
    pub fn is_write(&self) -> bool {
        matches!(self, BusStatus::MemWrite | BusStatus::IoWrite)
    }
    pub fn short_str(&self) -> &'static str {
        match self {
            BusStatus::IrqAck => "INTA",
            BusStatus::IoRead => "IOR ",
            BusStatus::IoWrite => "IOW ",
            BusStatus::Halt => "HALT",
            BusStatus::Code => "CODE",
            BusStatus::MemRead => "MEMR",
            BusStatus::MemWrite => "MEMW",
            BusStatus::Passive => "PASV",
        }
    }
}

/// [TCycle] is the bus T-state. Two-state (Ts/Tc) families map Ts to T1 and Tc to T2.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TCycle {
    #[default]
    Idle,
    T1,
    T2,
    T3,
    T4,
    Wait,
}

impl TCycle {
    pub fn short_str(&self) -> &'static str {
        match self {
            TCycle::Idle => "Ti",
            TCycle::T1 => "T1",
            TCycle::T2 => "T2",
            TCycle::T3 => "T3",
            TCycle::T4 => "T4",
            TCycle::Wait => "Tw",
        }
    }
}

/// [CpuPin] represents the miscellaneous CPU pins that can be read or written. Only pins up to
/// and including SMI are addressable by the host.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CpuPin {
    READY = 0,
    TEST,
    INTR,
    NMI,
    SMI,
    RESET,
    /// 8018x RD/QSMD strap. High when the CPU drives queue status.
    QSMODE,
}

impl TryFrom<u8> for CpuPin {
    type Error = ServerError;
    fn try_from(value: u8) -> Result<CpuPin> {
        match value {
            0 => Ok(CpuPin::READY),
            1 => Ok(CpuPin::TEST),
            2 => Ok(CpuPin::INTR),
            3 => Ok(CpuPin::NMI),
            4 => Ok(CpuPin::SMI),
            _ => Err(ServerError::BadValue(format!("pin number {}", value))),
        }
    }
}

/// [RegisterFormat] is the tag byte leading every register payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegisterFormat {
    /// 14 plain 16-bit registers.
    V1 = 0x01,
    /// 80286 LOADALL image.
    V2 = 0x02,
    /// 80386 LOADALL image.
    V3A = 0x03,
    /// 80386 SMM state-save dump.
    V3B = 0x04,
}

impl RegisterFormat {
    /// Length of the payload following the tag byte.
    pub fn payload_len(&self) -> usize {
        match self {
            RegisterFormat::V1 => 28,
            RegisterFormat::V2 => 102,
            RegisterFormat::V3A => 204,
            RegisterFormat::V3B => 208,
        }
    }
}

impl TryFrom<u8> for RegisterFormat {
    type Error = ServerError;
    fn try_from(value: u8) -> Result<RegisterFormat> {
        match value {
            0x01 => Ok(RegisterFormat::V1),
            0x02 => Ok(RegisterFormat::V2),
            0x03 => Ok(RegisterFormat::V3A),
            0x04 => Ok(RegisterFormat::V3B),
            _ => Err(ServerError::InvalidRegisterFormat(format!(
                "unknown format tag {:02X}",
                value
            ))),
        }
    }
}

/// [MemoryStrategy] selects what a memory backend returns for addresses never written.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MemoryStrategy {
    #[default]
    Zero = 0,
    Ones = 1,
    Random = 2,
}

impl TryFrom<u8> for MemoryStrategy {
    type Error = ServerError;
    fn try_from(value: u8) -> Result<MemoryStrategy> {
        match value {
            0 => Ok(MemoryStrategy::Zero),
            1 => Ok(MemoryStrategy::Ones),
            2 => Ok(MemoryStrategy::Random),
            _ => Err(ServerError::BadValue(format!("memory strategy {}", value))),
        }
    }
}

#[macro_export]
macro_rules! get_segment {
    ($s:expr) => {
        match (($s >> 3) & 0x03) {
            0b00 => Segment::ES,
            0b01 => Segment::SS,
            0b10 => Segment::CS,
            _ => Segment::DS,
        }
    };
}

/// Decode 8088-style S0-S2 status bits into a [BusStatus].
#[macro_export]
macro_rules! get_bus_status {
    ($s:expr) => {
        match ($s & 0x07) {
            0 => BusStatus::IrqAck,
            1 => BusStatus::IoRead,
            2 => BusStatus::IoWrite,
            3 => BusStatus::Halt,
            4 => BusStatus::Code,
            5 => BusStatus::MemRead,
            6 => BusStatus::MemWrite,
            _ => BusStatus::Passive,
        }
    };
}

#[macro_export]
macro_rules! get_queue_op {
    ($s:expr) => {
        match (($s >> 6) & 0x03) {
            0b00 => QueueOp::Idle,
            0b01 => QueueOp::First,
            0b10 => QueueOp::Flush,
            _ => QueueOp::Subsequent,
        }
    };
}

#[macro_export]
macro_rules! is_reading {
    ($s:expr) => {
        (!($s) & 0b0000_1001) != 0
    };
}

#[macro_export]
macro_rules! is_writing {
    ($s:expr) => {
        (!($s) & 0b0011_0110) != 0
    };
}
