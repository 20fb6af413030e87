//! The host command protocol: one command byte, a fixed number of parameter bytes, then a
//! response payload followed by a result byte.

use std::collections::VecDeque;
use std::time::Duration;

use ardx86_common::{
    CpuPin, MemoryStrategy, RegisterFormat, Result, ServerCommand, ServerError, ServerState,
    FLAG_DEBUG_ENABLED, PROTOCOL_VER, RESULT_FAIL, RESULT_OK, VERSION_TEXT,
};

use crate::hal::CpuHal;
use crate::registers::RegisterBlock;
use crate::server::CpuServer;

/// Longest error string returned by GetLastError, excluding the terminator.
pub const MAX_ERROR_LEN: usize = 255;

/// The byte stream to and from the host.
pub trait HostTransport {
    /// Wait up to `timeout` for the next byte.
    fn read_byte(&mut self, timeout: Duration) -> Option<u8>;
    fn write(&mut self, bytes: &[u8]);
}

/// An in-memory transport. The host side pushes commands and collects responses.
#[derive(Default)]
pub struct LoopbackTransport {
    input: VecDeque<u8>,
    output: Vec<u8>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn send(&mut self, bytes: &[u8]) {
        self.input.extend(bytes);
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    pub fn pending_input(&self) -> usize {
        self.input.len()
    }
}

impl HostTransport for LoopbackTransport {
    fn read_byte(&mut self, _timeout: Duration) -> Option<u8> {
        self.input.pop_front()
    }

    fn write(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }
}

/// Commands the server still answers after a fatal error.
fn allowed_in_error(cmd: ServerCommand) -> bool {
    use ServerCommand::*;
    matches!(
        cmd,
        CmdNull
            | CmdVersion
            | CmdReset
            | CmdReadAddressLatch
            | CmdReadAddressU
            | CmdReadStatus
            | CmdRead8288Command
            | CmdRead8288Control
            | CmdReadDataBus
            | CmdQueueLen
            | CmdQueueBytes
            | CmdReadPin
            | CmdGetProgramState
            | CmdGetLastError
            | CmdCpuType
            | CmdGetFlags
            | CmdServerStatus
            | CmdGetCycleLog
    )
}

/// Fixed parameter bytes for each command. Load and SetMemory read more after these.
fn param_count(cmd: ServerCommand) -> usize {
    use ServerCommand::*;
    match cmd {
        CmdLoad => 1,
        CmdReadPin | CmdGetCycleStates | CmdEnableDebug => 1,
        CmdWriteDataBus | CmdWritePin => 2,
        CmdSetRandomSeed | CmdRandomizeMem | CmdSetFlags | CmdCycleN | CmdRun => 4,
        CmdSetMemory | CmdReadMemory => 8,
        CmdSetMemoryStrategy => 9,
        _ => 0,
    }
}

fn u32_at(params: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        params[offset],
        params[offset + 1],
        params[offset + 2],
        params[offset + 3],
    ])
}

fn address_bytes(address: u32) -> [u8; 3] {
    let [b0, b1, b2, _] = address.to_le_bytes();
    [b0, b1, b2]
}

pub struct CommandDispatcher<H: CpuHal, T: HostTransport> {
    server: CpuServer<H>,
    transport: T,
}

impl<H: CpuHal, T: HostTransport> CommandDispatcher<H, T> {
    pub fn new(server: CpuServer<H>, transport: T) -> Self {
        Self { server, transport }
    }

    pub fn server(&self) -> &CpuServer<H> {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut CpuServer<H> {
        &mut self.server
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Handle one command if one is waiting. Returns false when there was nothing to do.
    pub fn poll(&mut self) -> bool {
        let Some(byte) = self.transport.read_byte(Duration::ZERO) else {
            return false;
        };
        match self.dispatch(byte) {
            Ok(mut response) => {
                response.push(RESULT_OK);
                self.transport.write(&response);
            }
            Err(e) => {
                self.server.set_last_error(&e);
                self.transport.write(&[RESULT_FAIL]);
            }
        }
        true
    }

    /// Handle every command waiting on the transport.
    pub fn run_pending(&mut self) -> usize {
        let mut handled = 0;
        while self.poll() {
            handled += 1;
        }
        handled
    }

    fn read_params(&mut self, command: u8, count: usize) -> Result<Vec<u8>> {
        let timeout = self.server.config().param_timeout;
        let mut params = Vec::with_capacity(count);
        for _ in 0..count {
            match self.transport.read_byte(timeout) {
                Some(byte) => params.push(byte),
                None => {
                    return Err(ServerError::ProtocolTimeout {
                        command,
                        expected: count - params.len(),
                    })
                }
            }
        }
        Ok(params)
    }

    fn dispatch(&mut self, byte: u8) -> Result<Vec<u8>> {
        let cmd = ServerCommand::try_from(byte)?;
        let mut params = self.read_params(byte, param_count(cmd))?;

        // Variable-length tails.
        match cmd {
            ServerCommand::CmdLoad => {
                let format = RegisterFormat::try_from(params[0])?;
                let payload = self.read_params(byte, format.payload_len())?;
                params.extend(payload);
            }
            ServerCommand::CmdSetMemory => {
                let len = u32_at(&params, 4) as usize;
                let (address, size) = (u32_at(&params, 0), self.server.bus().mem().size());
                if address as usize + len > size {
                    return Err(ServerError::MemoryRangeError { address, len });
                }
                let data = self.read_params(byte, len)?;
                params.extend(data);
            }
            _ => {}
        }

        log::trace!("Command: {:?} params: {:02X?}", cmd, params);

        if self.server.state() == ServerState::Error && !allowed_in_error(cmd) {
            return Err(ServerError::InvalidPhase {
                expected: "Reset",
                actual: ServerState::Error,
            });
        }

        self.execute(cmd, &params)
    }

    fn execute(&mut self, cmd: ServerCommand, params: &[u8]) -> Result<Vec<u8>> {
        use ServerCommand::*;
        let server = &mut self.server;
        let mut response = Vec::new();

        match cmd {
            CmdNull | CmdInitScreen => {}
            CmdVersion => {
                response.extend_from_slice(VERSION_TEXT);
                response.push(PROTOCOL_VER);
            }
            CmdReset => {
                server.reset()?;
            }
            CmdLoad => {
                let block = RegisterBlock::parse(params)?;
                server.load(block)?;
            }
            CmdCycle => server.cycle()?,
            CmdReadAddressLatch => response.extend(address_bytes(server.address_latch())),
            CmdReadAddressU => response.extend(address_bytes(server.address_bus())),
            CmdReadStatus => response.push(server.status_byte()),
            CmdRead8288Command => response.push(server.command_byte()),
            CmdRead8288Control => response.push(server.control_byte()),
            CmdReadDataBus => response.extend(server.data_bus().to_le_bytes()),
            CmdWriteDataBus => {
                server.write_data_bus(u16::from_le_bytes([params[0], params[1]]));
            }
            CmdFinalize => server.finalize()?,
            CmdBeginStore => server.begin_store()?,
            CmdStore => {
                let block = server.store()?;
                response.extend(block.to_tagged_bytes());
            }
            CmdQueueLen => response.push(server.queue().len() as u8),
            CmdQueueBytes => {
                let bytes = server.queue().bytes();
                response.push(bytes.len() as u8);
                response.extend(bytes);
            }
            CmdWritePin => {
                let pin = CpuPin::try_from(params[0])?;
                server.write_pin(pin, params[1] != 0);
            }
            CmdReadPin => {
                let pin = CpuPin::try_from(params[0])?;
                response.push(server.read_pin(pin) as u8);
            }
            CmdGetProgramState => response.push(server.state() as u8),
            CmdGetLastError => {
                let error = server.last_error().as_bytes();
                response.extend(&error[..error.len().min(MAX_ERROR_LEN)]);
                response.push(0);
            }
            CmdGetCycleState => response.extend(server.cycle_state().to_bytes()),
            CmdCGetCycleState => {
                server.cycle()?;
                response.extend(server.cycle_state().to_bytes());
            }
            CmdPrefetchStore => server.prefetch_store()?,
            CmdCpuType => response.push(u8::from(server.cpu_type())),
            CmdEmulate8080 => server.enable_emulation()?,
            CmdPrefetch => server.enable_prefetch()?,
            CmdStoreAll => {
                response.push(RegisterFormat::V2 as u8);
                response.extend(server.store_all()?);
            }
            CmdSetRandomSeed => server.set_random_seed(u32_at(params, 0)),
            CmdRandomizeMem => server.randomize_memory(u32_at(params, 0)),
            CmdSetMemory => server.set_memory(u32_at(params, 0), &params[8..])?,
            CmdGetCycleStates => {
                for _ in 0..params[0] {
                    server.cycle()?;
                    response.extend(server.cycle_state().to_bytes());
                }
            }
            CmdEnableDebug => {
                let flags = if params[0] != 0 {
                    server.flags() | FLAG_DEBUG_ENABLED
                } else {
                    server.flags() & !FLAG_DEBUG_ENABLED
                };
                server.set_flags(flags);
            }
            CmdSetMemoryStrategy => {
                let strategy = MemoryStrategy::try_from(params[0])?;
                server.set_memory_strategy(strategy, u32_at(params, 1), u32_at(params, 5));
            }
            CmdGetFlags => response.extend(server.flags().to_le_bytes()),
            CmdSetFlags => server.set_flags(u32_at(params, 0)),
            CmdReadMemory => {
                let data = server.read_memory(u32_at(params, 0), u32_at(params, 4) as usize)?;
                response.extend(data);
            }
            CmdCycleN => server.cycle_n(u32_at(params, 0))?,
            CmdEraseMemory => server.erase_memory(),
            CmdServerStatus => {
                response.push(server.state() as u8);
                response.push(u8::from(server.cpu_type()));
                response.extend(server.flags().to_le_bytes());
            }
            CmdClearCycleLog => server.bus_mut().clear_log(),
            CmdGetCycleLog => {
                let log = server.bus().log();
                response.extend((log.len() as u16).to_le_bytes());
                for op in log.iter() {
                    response.extend(op.to_bytes());
                }
            }
            CmdRun => {
                server.run(u32_at(params, 0))?;
            }
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::sim::{SimCpu, SimModel};

    fn dispatcher() -> CommandDispatcher<SimCpu, LoopbackTransport> {
        let server = CpuServer::new(SimCpu::new(SimModel::I8088), ServerConfig::default());
        CommandDispatcher::new(server, LoopbackTransport::new())
    }

    #[test]
    fn test_version() {
        let mut d = dispatcher();
        d.transport_mut().send(&[ServerCommand::CmdVersion as u8]);
        assert!(d.poll());
        let out = d.transport_mut().take_output();
        assert_eq!(&out[..7], VERSION_TEXT);
        assert_eq!(out[7], PROTOCOL_VER);
        assert_eq!(out[8], RESULT_OK);
    }

    #[test]
    fn test_unknown_command_fails() {
        let mut d = dispatcher();
        d.transport_mut().send(&[0x7F]);
        assert!(d.poll());
        assert_eq!(d.transport_mut().take_output(), vec![RESULT_FAIL]);
        assert!(d.server().last_error().contains("0x7F"));
    }

    #[test]
    fn test_missing_params_time_out() {
        let mut d = dispatcher();
        d.transport_mut().send(&[ServerCommand::CmdSetFlags as u8, 0x01]);
        assert!(d.poll());
        assert_eq!(d.transport_mut().take_output(), vec![RESULT_FAIL]);
        assert!(d.server().last_error().contains("3 parameter"));
    }

    #[test]
    fn test_flags_round_trip() {
        let mut d = dispatcher();
        d.transport_mut()
            .send(&[ServerCommand::CmdSetFlags as u8, 0x05, 0x00, 0x00, 0x00]);
        d.transport_mut().send(&[ServerCommand::CmdGetFlags as u8]);
        assert_eq!(d.run_pending(), 2);
        assert_eq!(
            d.transport_mut().take_output(),
            vec![RESULT_OK, 0x05, 0x00, 0x00, 0x00, RESULT_OK]
        );
    }

    #[test]
    fn test_get_last_error_is_terminated() {
        let mut d = dispatcher();
        d.transport_mut().send(&[ServerCommand::CmdFinalize as u8]);
        d.transport_mut().send(&[ServerCommand::CmdGetLastError as u8]);
        d.run_pending();
        let out = d.transport_mut().take_output();
        assert_eq!(out[0], RESULT_FAIL);
        assert_eq!(out[out.len() - 2], 0);
        assert_eq!(out[out.len() - 1], RESULT_OK);
    }

    #[test]
    fn test_memory_commands() {
        let mut d = dispatcher();
        let mut cmd = vec![ServerCommand::CmdSetMemory as u8];
        cmd.extend(0x1234u32.to_le_bytes());
        cmd.extend(3u32.to_le_bytes());
        cmd.extend([0xAA, 0xBB, 0xCC]);
        d.transport_mut().send(&cmd);

        let mut cmd = vec![ServerCommand::CmdReadMemory as u8];
        cmd.extend(0x1233u32.to_le_bytes());
        cmd.extend(5u32.to_le_bytes());
        d.transport_mut().send(&cmd);

        assert_eq!(d.run_pending(), 2);
        assert_eq!(
            d.transport_mut().take_output(),
            vec![RESULT_OK, 0x00, 0xAA, 0xBB, 0xCC, 0x00, RESULT_OK]
        );
    }

    #[test]
    fn test_set_memory_out_of_range() {
        let mut d = dispatcher();
        let mut cmd = vec![ServerCommand::CmdSetMemory as u8];
        cmd.extend(0xFFFFFu32.to_le_bytes());
        cmd.extend(2u32.to_le_bytes());
        d.transport_mut().send(&cmd);
        assert_eq!(d.run_pending(), 1);
        assert_eq!(d.transport_mut().take_output(), vec![RESULT_FAIL]);
    }

    #[test]
    fn test_bad_pin_rejected() {
        let mut d = dispatcher();
        d.transport_mut()
            .send(&[ServerCommand::CmdWritePin as u8, CpuPin::RESET as u8, 1]);
        d.poll();
        assert_eq!(d.transport_mut().take_output(), vec![RESULT_FAIL]);
    }
}
