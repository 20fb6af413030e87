//! The error taxonomy shared by the server engine and the command dispatcher.

use thiserror::Error;

use crate::ServerState;

/// [ServerError] represents every failure the server can report to the host. The dispatcher
/// turns these into the last-error string and a FAIL result byte.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerError {
    #[error("Timed out waiting for {expected} parameter byte(s) for command {command:#04X}")]
    ProtocolTimeout { command: u8, expected: usize },
    #[error("{phase:?} phase did not complete within {cycles} cycles")]
    PhaseTimeout { phase: ServerState, cycles: u32 },
    #[error("Command requires {expected}, but server is in state {actual:?}")]
    InvalidPhase {
        expected: &'static str,
        actual: ServerState,
    },
    #[error("Invalid register format: {0}")]
    InvalidRegisterFormat(String),
    #[error("Memory access out of range: [{address:08X}] len: {len}")]
    MemoryRangeError { address: u32, len: usize },
    #[error("CPU reset failed: {0}")]
    ResetFailure(String),
    #[error("Invalid command byte: {0:#04X}")]
    InvalidCommand(u8),
    #[error("Received invalid value: {0}")]
    BadValue(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;
