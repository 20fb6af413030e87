//! Drive the server through its wire protocol over a loopback transport.

use ardx86_common::*;
use ardx86_server::*;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn dispatcher(model: SimModel) -> CommandDispatcher<SimCpu, LoopbackTransport> {
    let config = ServerConfig {
        family: model.family(),
        ..ServerConfig::default()
    };
    CommandDispatcher::new(CpuServer::new(SimCpu::new(model), config), LoopbackTransport::new())
}

/// Send one command and return its response, checking the trailing result byte.
fn command(d: &mut CommandDispatcher<SimCpu, LoopbackTransport>, cmd: ServerCommand, params: &[u8]) -> Vec<u8> {
    d.transport_mut().send(&[cmd as u8]);
    d.transport_mut().send(params);
    assert!(d.poll());
    let mut out = d.transport_mut().take_output();
    let result = out.pop().expect("empty response");
    assert_eq!(
        result,
        RESULT_OK,
        "{:?} failed: {}",
        cmd,
        d.server().last_error()
    );
    out
}

fn load_params(regs: &Registers) -> Vec<u8> {
    RegisterBlock::V1(*regs).to_tagged_bytes()
}

fn set_memory_params(address: u32, data: &[u8]) -> Vec<u8> {
    let mut params = address.to_le_bytes().to_vec();
    params.extend((data.len() as u32).to_le_bytes());
    params.extend(data);
    params
}

fn user_regs() -> Registers {
    Registers {
        ss: 0x0000,
        sp: 0x1000,
        flags: 0xF002,
        cs: 0x0800,
        ip: 0x0000,
        ds: 0x0900,
        ..Registers::default()
    }
}

#[test]
fn test_full_session() {
    init();
    let mut d = dispatcher(SimModel::I8088);

    let version = command(&mut d, ServerCommand::CmdVersion, &[]);
    assert_eq!(&version[..VERSION_TEXT.len()], VERSION_TEXT);

    command(&mut d, ServerCommand::CmdReset, &[]);
    let cpu = command(&mut d, ServerCommand::CmdCpuType, &[]);
    assert_eq!(cpu, vec![u8::from(ServerCpuType::Intel8088)]);

    command(&mut d, ServerCommand::CmdSetFlags, &FLAG_EXECUTE_AUTOMATIC.to_le_bytes());

    // mov cx, 0ABCDh; inc cx; jmp $
    let program = [0xB9, 0xCD, 0xAB, 0x41, 0xEB, 0xFE];
    command(&mut d, ServerCommand::CmdSetMemory, &set_memory_params(0x8000, &program));

    let regs = user_regs();
    command(&mut d, ServerCommand::CmdLoad, &load_params(&regs));
    let state = command(&mut d, ServerCommand::CmdGetProgramState, &[]);
    assert_eq!(state, vec![ServerState::Execute as u8]);

    command(&mut d, ServerCommand::CmdCycleN, &200u32.to_le_bytes());
    command(&mut d, ServerCommand::CmdFinalize, &[]);
    command(&mut d, ServerCommand::CmdBeginStore, &[]);
    let stored = command(&mut d, ServerCommand::CmdStore, &[]);
    assert_eq!(stored[0], RegisterFormat::V1 as u8);

    let out = Registers::from_bytes(&stored[1..]).unwrap();
    assert_eq!(out.cx, 0xABCE);
    assert_eq!(out.ip, 4);
    assert_eq!(out.cs, regs.cs);
    assert_eq!(out.sp, regs.sp);
    assert_eq!(out.ds, regs.ds);

    let status = command(&mut d, ServerCommand::CmdServerStatus, &[]);
    assert_eq!(status[0], ServerState::Done as u8);
}

#[test]
fn test_store_out_of_phase_fails() {
    init();
    let mut d = dispatcher(SimModel::I8088);
    d.transport_mut().send(&[ServerCommand::CmdStore as u8]);
    d.transport_mut().send(&[ServerCommand::CmdGetLastError as u8]);
    assert_eq!(d.run_pending(), 2);

    let out = d.transport_mut().take_output();
    assert_eq!(out[0], RESULT_FAIL);
    let text = String::from_utf8_lossy(&out[1..out.len() - 2]).to_string();
    assert!(text.contains("Store"), "unexpected error text: {}", text);
}

#[test]
fn test_load_rejects_wrong_format() {
    init();
    let mut d = dispatcher(SimModel::I8088);
    command(&mut d, ServerCommand::CmdReset, &[]);

    let mut params = vec![RegisterFormat::V2 as u8];
    params.extend(vec![0u8; RegisterFormat::V2.payload_len()]);
    d.transport_mut().send(&[ServerCommand::CmdLoad as u8]);
    d.transport_mut().send(&params);
    assert!(d.poll());
    assert_eq!(d.transport_mut().take_output(), vec![RESULT_FAIL]);
    assert_eq!(d.server().state(), ServerState::JumpVector);
}

#[test]
fn test_cycle_states_report_reset_fetch() {
    init();
    let mut d = dispatcher(SimModel::I8088);
    command(&mut d, ServerCommand::CmdReset, &[]);

    let out = command(&mut d, ServerCommand::CmdGetCycleStates, &[4]);
    assert_eq!(out.len(), 4 * 6);
    for state in out.chunks(6) {
        let server_state = ServerState::try_from(state[0]).unwrap();
        assert!(matches!(
            server_state,
            ServerState::JumpVector | ServerState::Load
        ));
    }
}

#[test]
fn test_pins_and_data_bus() {
    init();
    let mut d = dispatcher(SimModel::I8088);

    command(&mut d, ServerCommand::CmdWritePin, &[CpuPin::TEST as u8, 1]);
    assert_eq!(command(&mut d, ServerCommand::CmdReadPin, &[CpuPin::TEST as u8]), vec![1]);
    command(&mut d, ServerCommand::CmdWritePin, &[CpuPin::TEST as u8, 0]);
    assert_eq!(command(&mut d, ServerCommand::CmdReadPin, &[CpuPin::TEST as u8]), vec![0]);

    command(&mut d, ServerCommand::CmdWriteDataBus, &[0x34, 0x12]);
    assert_eq!(command(&mut d, ServerCommand::CmdReadDataBus, &[]), vec![0x34, 0x12]);
}

#[test]
fn test_memory_strategy_and_readback() {
    init();
    let mut d = dispatcher(SimModel::I8088);

    let mut params = vec![MemoryStrategy::Ones as u8];
    params.extend(0x100u32.to_le_bytes());
    params.extend(0x1FFu32.to_le_bytes());
    command(&mut d, ServerCommand::CmdSetMemoryStrategy, &params);

    let mut read = 0x0FEu32.to_le_bytes().to_vec();
    read.extend(4u32.to_le_bytes());
    assert_eq!(command(&mut d, ServerCommand::CmdReadMemory, &read), vec![0x00, 0x00, 0xFF, 0xFF]);

    command(&mut d, ServerCommand::CmdEraseMemory, &[]);
    command(&mut d, ServerCommand::CmdSetMemory, &set_memory_params(0x100, &[0x12]));
    read = 0x100u32.to_le_bytes().to_vec();
    read.extend(2u32.to_le_bytes());
    assert_eq!(command(&mut d, ServerCommand::CmdReadMemory, &read), vec![0x12, 0xFF]);
}

#[test]
fn test_cycle_log_after_run() {
    init();
    let mut d = dispatcher(SimModel::I8088);
    command(&mut d, ServerCommand::CmdReset, &[]);

    command(&mut d, ServerCommand::CmdSetFlags, &FLAG_EXECUTE_AUTOMATIC.to_le_bytes());

    // mov al, 5Ah; out 40h, al; hlt
    let program = [0xB0, 0x5A, 0xE6, 0x40, 0xF4];
    command(&mut d, ServerCommand::CmdSetMemory, &set_memory_params(0x8000, &program));
    command(&mut d, ServerCommand::CmdLoad, &load_params(&user_regs()));
    command(&mut d, ServerCommand::CmdClearCycleLog, &[]);
    command(&mut d, ServerCommand::CmdRun, &0u32.to_le_bytes());

    let log = command(&mut d, ServerCommand::CmdGetCycleLog, &[]);
    let count = u16::from_le_bytes([log[0], log[1]]) as usize;
    assert_eq!(log.len(), 2 + count * 8);
    let io_write = log[2..].chunks(8).any(|entry| {
        entry[0] == BusStatus::IoWrite as u8 && entry[2] == 0x40 && entry[6] == 0x5A
    });
    assert!(io_write, "OUT 40h not found in the cycle log");
}
