//! Full reset / load / execute / store sequences against the simulated CPU.

use ardx86_common::*;
use ardx86_server::registers::{
    loadall286, loadall386, smm386, Loadall286, Loadall386, Smm386, CPU_FLAG_PARITY,
};
use ardx86_server::*;

const CODE_CS: u16 = 0x1000;
const CODE_IP: u16 = 0x0100;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn server(model: SimModel, config: ServerConfig) -> CpuServer<SimCpu> {
    CpuServer::new(SimCpu::new(model), config)
}

fn config_for(model: SimModel) -> ServerConfig {
    ServerConfig {
        family: model.family(),
        ..ServerConfig::default()
    }
    .automatic()
}

fn test_regs(flags: u16) -> Registers {
    Registers {
        ax: 0,
        bx: 0,
        cx: 0x1111,
        dx: 0x2222,
        ss: 0x2000,
        sp: 0x0100,
        flags,
        ip: CODE_IP,
        cs: CODE_CS,
        ds: 0x3000,
        es: 0x4000,
        bp: 0x5555,
        si: 0x6666,
        di: 0x7777,
    }
}

fn code_addr() -> u32 {
    ((CODE_CS as u32) << 4) + CODE_IP as u32
}

fn cycle_until<F>(server: &mut CpuServer<SimCpu>, limit: u32, done: F)
where
    F: Fn(&CpuServer<SimCpu>) -> bool,
{
    for _ in 0..limit {
        if done(server) {
            return;
        }
        server.cycle().expect("cycle failed");
    }
    assert!(done(server), "condition not reached in {} cycles, state {:?}", limit, server.state());
}

fn store_v1(server: &mut CpuServer<SimCpu>) -> Registers {
    server.begin_store().expect("begin_store failed");
    match server.store().expect("store failed") {
        RegisterBlock::V1(regs) => regs,
        other => panic!("unexpected register format {:?}", other.format()),
    }
}

// mov ax, 1234h; mov bx, ax; inc bx; jmp $
const LOOP_PROGRAM: [u8; 8] = [0xB8, 0x34, 0x12, 0x89, 0xC3, 0x43, 0xEB, 0xFE];
const LOOP_OFFSET: u16 = 6;

/// Load the loop program, let it run, finalize and store.
fn loop_round_trip(server: &mut CpuServer<SimCpu>) -> Registers {
    run_loop(server, false)
}

fn run_loop(server: &mut CpuServer<SimCpu>, prefetch: bool) -> Registers {
    let reset = server.reset().expect("reset failed");
    assert!(reset.success);
    assert_eq!(server.state(), ServerState::JumpVector);
    if prefetch {
        server.enable_prefetch().expect("enable_prefetch failed");
    }

    server.set_memory(code_addr(), &LOOP_PROGRAM).unwrap();
    let flags = if matches!(
        server.cpu_type(),
        ServerCpuType::Intel80286 | ServerCpuType::Intel80386
    ) {
        0x0002
    } else {
        0xF002
    };
    server.load(RegisterBlock::V1(test_regs(flags))).expect("load failed");
    assert_eq!(server.state(), ServerState::Execute);

    server.cycle_n(200).unwrap();
    server.finalize().expect("finalize failed");
    assert_eq!(server.state(), ServerState::ExecuteDone);
    store_v1(server)
}

/// One clock with the test acting as host: memory reads in Execute are answered from the
/// bus emulator's memory.
fn host_cycle(server: &mut CpuServer<SimCpu>) {
    server.cycle().expect("cycle failed");
    if server.state() != ServerState::Execute || server.command_byte() & COMMAND_MRDC_BIT != 0 {
        return;
    }
    let address = server.address_latch();
    let width = match server.width() {
        CpuWidth::Eight => DataWidth::EightLow,
        CpuWidth::Sixteen if address & 1 == 0 => DataWidth::Sixteen,
        CpuWidth::Sixteen => DataWidth::EightHigh,
    };
    let data = server.bus().mem().read_bus(address, width);
    server.write_data_bus(data);
}

/// Run the loop program with the host serving reads, and finalize with queue tags once the
/// jump is fully queued and not yet started, so tagging starts on an instruction boundary.
fn host_loop_round_trip(server: &mut CpuServer<SimCpu>) -> Registers {
    server.reset().expect("reset failed");
    assert!(server.has_queue_status());
    server.set_memory(code_addr(), &LOOP_PROGRAM).unwrap();
    server.load(RegisterBlock::V1(test_regs(0xF002))).expect("load failed");
    assert_eq!(server.state(), ServerState::Execute);

    for _ in 0..100 {
        host_cycle(server);
    }
    let at_jump = |s: &CpuServer<SimCpu>| s.queue().bytes().starts_with(&[0xEB, 0xFE]);
    for _ in 0..200 {
        if at_jump(server) {
            break;
        }
        host_cycle(server);
    }
    assert!(at_jump(server), "queue never held the jump: {}", server.queue());
    server.finalize().expect("finalize failed");
    assert_eq!(server.state(), ServerState::ExecuteDone);
    store_v1(server)
}

fn host_config(model: SimModel) -> ServerConfig {
    ServerConfig {
        family: model.family(),
        ..ServerConfig::default()
    }
}

fn check_loop_result(regs: &Registers, flags_hi: u16) {
    let loaded = test_regs(flags_hi | 0x0002);
    assert_eq!(regs.ax, 0x1234);
    assert_eq!(regs.bx, 0x1235);
    assert_eq!(regs.cs, CODE_CS);
    assert_eq!(regs.ip, CODE_IP + LOOP_OFFSET);
    // INC leaves PF set for 0x35.
    assert_eq!(regs.flags, loaded.flags | CPU_FLAG_PARITY);
    assert_eq!(regs.cx, loaded.cx);
    assert_eq!(regs.dx, loaded.dx);
    assert_eq!(regs.ss, loaded.ss);
    assert_eq!(regs.sp, loaded.sp);
    assert_eq!(regs.ds, loaded.ds);
    assert_eq!(regs.es, loaded.es);
    assert_eq!(regs.bp, loaded.bp);
    assert_eq!(regs.si, loaded.si);
    assert_eq!(regs.di, loaded.di);
}

#[test]
fn test_reset_identifies_8088() {
    init();
    let mut server = server(SimModel::I8088, config_for(SimModel::I8088));
    let reset = server.reset().unwrap();
    assert_eq!(reset.width, CpuWidth::Eight);
    assert!(reset.queue_status);
    assert_eq!(server.cpu_type(), ServerCpuType::Intel8088);
    assert_eq!(server.state(), ServerState::JumpVector);
}

#[test]
fn test_reset_identifies_8086() {
    init();
    let mut server = server(SimModel::I8086, config_for(SimModel::I8086));
    let reset = server.reset().unwrap();
    assert_eq!(reset.width, CpuWidth::Sixteen);
    assert_eq!(server.cpu_type(), ServerCpuType::Intel8086);
}

#[test]
fn test_reset_identifies_nec() {
    init();
    let mut server = server(SimModel::V20, config_for(SimModel::V20));
    server.reset().unwrap();
    assert_eq!(server.cpu_type(), ServerCpuType::NecV20);

    let mut server = self::server(SimModel::V30, config_for(SimModel::V30));
    server.reset().unwrap();
    assert_eq!(server.cpu_type(), ServerCpuType::NecV30);
}

#[test]
fn test_reset_twice() {
    init();
    let mut server = server(SimModel::I8088, config_for(SimModel::I8088));
    server.reset().unwrap();
    server.cycle_n(10).unwrap();
    server.reset().unwrap();
    assert_eq!(server.state(), ServerState::JumpVector);
}

#[test]
fn test_load_out_of_phase() {
    init();
    let mut server = server(SimModel::I8088, config_for(SimModel::I8088));
    let err = server.load(RegisterBlock::V1(test_regs(0xF002))).unwrap_err();
    assert!(matches!(err, ServerError::InvalidPhase { .. }));
    assert!(server.finalize().is_err());
    assert!(server.begin_store().is_err());
}

#[test]
fn test_8088_round_trip() {
    init();
    let mut server = server(SimModel::I8088, config_for(SimModel::I8088));
    let regs = loop_round_trip(&mut server);
    check_loop_result(&regs, 0xF000);
    assert_eq!(server.state(), ServerState::Done);
}

#[test]
fn test_8086_round_trip() {
    init();
    let mut server = server(SimModel::I8086, config_for(SimModel::I8086));
    let regs = loop_round_trip(&mut server);
    check_loop_result(&regs, 0xF000);
}

#[test]
fn test_8088_queue_tag_round_trip() {
    init();
    let mut server = server(SimModel::I8088, host_config(SimModel::I8088));
    let regs = host_loop_round_trip(&mut server);
    check_loop_result(&regs, 0xF000);
    assert_eq!(server.state(), ServerState::Done);
}

#[test]
fn test_8086_queue_tag_round_trip() {
    init();
    let mut server = server(SimModel::I8086, host_config(SimModel::I8086));
    let regs = host_loop_round_trip(&mut server);
    check_loop_result(&regs, 0xF000);
}

#[test]
fn test_80186_queue_tag_round_trip() {
    init();
    let model = SimModel::I80186;
    let mut server = CpuServer::new(SimCpu::new(model).with_qs_mode(true), host_config(model));
    let regs = host_loop_round_trip(&mut server);
    check_loop_result(&regs, 0xF000);
}

#[test]
fn test_automatic_queue_tag_falls_back_to_nmi() {
    init();
    let config = ServerConfig {
        end_strategy: EndStrategy::QueueTag,
        ..config_for(SimModel::I8086)
    };
    let mut server = server(SimModel::I8086, config);
    server.reset().unwrap();
    server.enable_prefetch().unwrap();

    // mov bx, ax; inc bx; jmp $
    let program = [0x89, 0xC3, 0x43, 0xEB, 0xFE];
    server.set_memory(code_addr(), &program).unwrap();
    let regs = Registers {
        ax: 0x1234,
        ..test_regs(0xF002)
    };
    server.load(RegisterBlock::V1(regs)).unwrap();
    server.cycle_n(200).unwrap();
    server.finalize().unwrap();

    let regs = store_v1(&mut server);
    assert_eq!(regs.bx, 0x1235);
    assert_eq!(regs.cs, CODE_CS);
    assert_eq!(regs.ip, CODE_IP + 3);
    assert_eq!(regs.sp, 0x0100);
    assert_eq!(regs.di, 0x7777);
}

#[test]
fn test_nmi_finalize_keeps_in_flight_stores() {
    init();
    // mov [0010h], ax; jmp short -5
    let program = [0xA3, 0x10, 0x00, 0xEB, 0xFB];
    let frame_base = (0x2000u32 << 4) + 0x0100 - 6;

    // Finalize at every point of the loop, including mid-store.
    for cycles in 30..70 {
        let config = ServerConfig {
            end_strategy: EndStrategy::Nmi,
            ..config_for(SimModel::I8088)
        };
        let mut server = server(SimModel::I8088, config);
        server.reset().unwrap();
        server.set_memory(code_addr(), &program).unwrap();
        let regs = Registers {
            ax: 0x1234,
            ds: 0x0000,
            ..test_regs(0xF002)
        };
        server.load(RegisterBlock::V1(regs)).unwrap();
        server.cycle_n(cycles).unwrap();
        server.finalize().unwrap();

        let regs = store_v1(&mut server);
        assert_eq!(regs.cs, CODE_CS, "after {} cycles", cycles);
        assert!(
            regs.ip == CODE_IP || regs.ip == CODE_IP + 3,
            "ip {:04X} after {} cycles",
            regs.ip,
            cycles
        );
        assert_eq!(regs.sp, 0x0100, "after {} cycles", cycles);
        assert_eq!(server.read_memory(0x10, 2).unwrap(), vec![0x34, 0x12], "after {} cycles", cycles);
        assert_eq!(server.read_memory(frame_base, 6).unwrap(), vec![0; 6], "after {} cycles", cycles);
    }
}

#[test]
fn test_prefetch_round_trip() {
    init();
    for model in [SimModel::I8088, SimModel::I8086, SimModel::V20, SimModel::V30] {
        let mut server = server(model, config_for(model));
        let regs = run_loop(&mut server, true);
        check_loop_result(&regs, 0xF000);
    }
    for (model, qs) in [(SimModel::I80188, false), (SimModel::I80186, true)] {
        let mut server = CpuServer::new(SimCpu::new(model).with_qs_mode(qs), config_for(model));
        let regs = run_loop(&mut server, true);
        check_loop_result(&regs, 0xF000);
    }
}

#[test]
fn test_prefetch_rejected_on_286() {
    init();
    let mut server = server(SimModel::I80286, config_for(SimModel::I80286));
    server.reset().unwrap();
    assert!(server.enable_prefetch().is_err());
}

#[test]
fn test_8088_nmi_round_trip() {
    init();
    let config = ServerConfig {
        end_strategy: EndStrategy::Nmi,
        ..config_for(SimModel::I8088)
    };
    let mut server = server(SimModel::I8088, config);
    let regs = loop_round_trip(&mut server);
    check_loop_result(&regs, 0xF000);

    // The NMI frame is not part of the program's memory.
    let frame_base = ((0x2000u32) << 4) + 0x0100 - 6;
    assert_eq!(server.read_memory(frame_base, 6).unwrap(), vec![0; 6]);
}

#[test]
fn test_286_round_trip() {
    init();
    let mut server = server(SimModel::I80286, config_for(SimModel::I80286));
    let reset = server.reset().unwrap();
    assert!(!reset.queue_status);
    assert_eq!(server.cpu_type(), ServerCpuType::Intel80286);

    server.set_memory(code_addr(), &LOOP_PROGRAM).unwrap();
    server.load(RegisterBlock::V1(test_regs(0x0002))).unwrap();
    server.cycle_n(200).unwrap();
    server.finalize().unwrap();
    let regs = store_v1(&mut server);
    check_loop_result(&regs, 0x0000);
}

#[test]
fn test_80188_without_queue_status() {
    init();
    let model = SimModel::I80188;
    let mut server = CpuServer::new(SimCpu::new(model).with_qs_mode(false), config_for(model));
    let regs = loop_round_trip(&mut server);
    assert_eq!(server.cpu_type(), ServerCpuType::Intel80188(false));
    assert!(!server.has_queue_status());
    check_loop_result(&regs, 0xF000);
}

#[test]
fn test_80186_with_queue_status() {
    init();
    let model = SimModel::I80186;
    let mut server = CpuServer::new(SimCpu::new(model).with_qs_mode(true), config_for(model));
    let regs = loop_round_trip(&mut server);
    assert_eq!(server.cpu_type(), ServerCpuType::Intel80186(true));
    check_loop_result(&regs, 0xF000);
}

#[test]
fn test_halt_after_jump() {
    init();
    let mut server = server(SimModel::I8088, config_for(SimModel::I8088));
    server.reset().unwrap();

    // mov ax, 1234h; mov bx, ax; inc bx; jmp short $+2
    let program = [0xB8, 0x34, 0x12, 0x89, 0xC3, 0x43, 0xEB, 0x00];
    server.set_memory(code_addr(), &program).unwrap();
    server.set_flags(server.flags() | FLAG_HALT_AFTER_JUMP);
    server.load(RegisterBlock::V1(test_regs(0xF002))).unwrap();

    cycle_until(&mut server, 500, |s| s.state() == ServerState::ExecuteDone);
    let regs = store_v1(&mut server);
    assert_eq!(regs.bx, 0x1235);
    assert_eq!(regs.ip, CODE_IP + program.len() as u16);
}

#[test]
fn test_run_until_halt() {
    init();
    let mut server = server(SimModel::I8088, config_for(SimModel::I8088));
    server.reset().unwrap();

    // mov ax, 0BEEFh; mov [0200h], ax; hlt
    let program = [0xB8, 0xEF, 0xBE, 0xA3, 0x00, 0x02, 0xF4];
    server.set_memory(code_addr(), &program).unwrap();
    server.load(RegisterBlock::V1(test_regs(0xF002))).unwrap();

    let cycles = server.run(0).expect("run failed");
    assert!(cycles > 0);
    assert!(server.is_halted());
    assert_eq!(server.state(), ServerState::ExecuteDone);

    let regs = store_v1(&mut server);
    assert_eq!(regs.ax, 0xBEEF);
    assert_eq!(regs.ip, CODE_IP + program.len() as u16);
    assert_eq!(regs.sp, 0x0100);

    let data = server.read_memory((0x3000 << 4) + 0x200, 2).unwrap();
    assert_eq!(data, vec![0xEF, 0xBE]);
}

#[test]
fn test_run_budget_exhausted() {
    init();
    let mut server = server(SimModel::I8088, config_for(SimModel::I8088));
    server.reset().unwrap();
    server.set_memory(code_addr(), &LOOP_PROGRAM).unwrap();
    server.load(RegisterBlock::V1(test_regs(0xF002))).unwrap();

    let err = server.run(200).unwrap_err();
    assert!(matches!(
        err,
        ServerError::PhaseTimeout {
            phase: ServerState::Execute,
            ..
        }
    ));
    assert_eq!(server.state(), ServerState::Execute);
}

#[test]
fn test_wait_states_stretch_bus_cycles() {
    init();
    let mut fast = server(SimModel::I8088, config_for(SimModel::I8088));
    let fast_regs = loop_round_trip(&mut fast);

    let config = ServerConfig {
        wait_states: 2,
        ..config_for(SimModel::I8088)
    };
    let mut slow = server(SimModel::I8088, config);
    let slow_regs = loop_round_trip(&mut slow);

    // Identification is not affected by wait states.
    assert_eq!(slow.cpu_type(), ServerCpuType::Intel8088);
    assert_eq!(slow_regs, fast_regs);
    assert!(slow.cycle_num() > fast.cycle_num());
    assert!(slow.read_pin(CpuPin::READY));
}

#[test]
fn test_bus_log_records_program_writes() {
    init();
    let mut server = server(SimModel::I8088, config_for(SimModel::I8088));
    server.reset().unwrap();

    // mov ax, 1234h; mov [0010h], ax; jmp $
    let program = [0xB8, 0x34, 0x12, 0xA3, 0x10, 0x00, 0xEB, 0xFE];
    server.set_memory(code_addr(), &program).unwrap();
    server.load(RegisterBlock::V1(test_regs(0xF002))).unwrap();
    server.bus_mut().clear_log();
    server.cycle_n(60).unwrap();

    let writes: Vec<_> = server
        .bus()
        .log()
        .iter()
        .filter(|op| op.kind == BusStatus::MemWrite)
        .copied()
        .collect();
    let bytes = assemble_writes(&writes);
    let base = (0x3000u32 << 4) + 0x10;
    assert_eq!(bytes.get(&base), Some(&0x34));
    assert_eq!(bytes.get(&(base + 1)), Some(&0x12));
}

#[test]
fn test_v20_8080_emulation() {
    init();
    let mut server = server(SimModel::V20, config_for(SimModel::V20));
    server.reset().unwrap();
    server.enable_emulation().unwrap();

    // mvi a, 42h; inr a
    server.set_memory(code_addr(), &[0x3E, 0x42, 0x3C]).unwrap();
    server.load(RegisterBlock::V1(test_regs(0xF002))).unwrap();
    assert!(server.hal().in_emulation());

    server.cycle_n(40).unwrap();
    server.finalize().unwrap();
    assert_eq!(server.state(), ServerState::ExecuteDone);
    assert!(!server.hal().in_emulation());

    let regs = store_v1(&mut server);
    assert_eq!(regs.ax & 0xFF, 0x43);
    assert_eq!(regs.cs, CODE_CS);
    assert!(regs.ip >= CODE_IP + 3);
    assert_eq!(regs.sp, 0x0100);
    assert_eq!(regs.flags, 0xF002);
}

#[test]
fn test_emulation_rejected_on_intel() {
    init();
    let mut server = server(SimModel::I8088, config_for(SimModel::I8088));
    server.reset().unwrap();
    assert!(server.enable_emulation().is_err());
}

fn put_word(image: &mut [u8], offset: usize, value: u16) {
    image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn image_word(image: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([image[offset], image[offset + 1]])
}

/// Lay the low words of `regs` out at the given register offsets.
fn build_image(len: usize, regs: &Registers, offsets: [usize; 14]) -> Vec<u8> {
    let mut image = vec![0u8; len];
    let values = [
        regs.flags, regs.ip, regs.di, regs.si, regs.bp, regs.sp, regs.bx, regs.dx, regs.cx,
        regs.ax, regs.ds, regs.ss, regs.cs, regs.es,
    ];
    for (offset, value) in offsets.into_iter().zip(values) {
        put_word(&mut image, offset, value);
    }
    image
}

fn loadall386_image(regs: &Registers) -> Loadall386 {
    use loadall386::*;
    let image = build_image(
        RegisterFormat::V3A.payload_len(),
        regs,
        [EFLAGS, EIP, EDI, ESI, EBP, ESP, EBX, EDX, ECX, EAX, DS, SS, CS, ES],
    );
    Loadall386::from_bytes(&image).unwrap()
}

fn smm_image(regs: &Registers) -> Smm386 {
    use smm386::*;
    let image = build_image(
        RegisterFormat::V3B.payload_len(),
        regs,
        [EFLAGS, EIP, EDI, ESI, EBP, ESP, EBX, EDX, ECX, EAX, DS, SS, CS, ES],
    );
    Smm386::from_bytes(&image).unwrap()
}

/// Run the loop program from an already loaded state, finalize and store.
fn finish_loop(server: &mut CpuServer<SimCpu>) -> Registers {
    assert_eq!(server.state(), ServerState::Execute);
    server.cycle_n(200).unwrap();
    server.finalize().expect("finalize failed");
    store_v1(server)
}

#[test]
fn test_286_loadall_round_trip() {
    init();
    let mut server = server(SimModel::I80286, config_for(SimModel::I80286));
    server.reset().unwrap();
    server.set_memory(code_addr(), &LOOP_PROGRAM).unwrap();

    let loadall = Loadall286::from_registers(&test_regs(0x0002));
    server.load(RegisterBlock::V2(loadall)).expect("load failed");
    let regs = finish_loop(&mut server);
    check_loop_result(&regs, 0x0000);
}

#[test]
fn test_286_storeall_shuts_down() {
    init();
    let mut server = server(SimModel::I80286, config_for(SimModel::I80286));
    server.reset().unwrap();
    server.set_memory(code_addr(), &LOOP_PROGRAM).unwrap();
    server.load(RegisterBlock::V1(test_regs(0x0002))).unwrap();
    server.cycle_n(200).unwrap();
    server.finalize().unwrap();

    let dump = server.store_all().expect("storeall failed");
    assert_eq!(server.state(), ServerState::Shutdown);
    assert_eq!(dump.len(), RegisterFormat::V2.payload_len());
    assert_eq!(image_word(&dump, loadall286::MSW), 0xFFF0);
    assert_eq!(image_word(&dump, loadall286::AX), 0x1234);
    assert_eq!(image_word(&dump, loadall286::BX), 0x1235);
    assert_eq!(image_word(&dump, loadall286::CX), 0x1111);
    assert_eq!(image_word(&dump, loadall286::DS), 0x3000);
    assert_eq!(image_word(&dump, loadall286::ES), 0x4000);
    assert_eq!(image_word(&dump, loadall286::SI), 0x6666);
    // The dump is a valid LOADALL image.
    assert!(RegisterBlock::from_payload(RegisterFormat::V2, &dump).is_ok());

    // Nothing but a reset leaves shutdown.
    assert!(server.begin_store().is_err());
    server.reset().unwrap();
    assert_eq!(server.state(), ServerState::JumpVector);
}

#[test]
fn test_storeall_rejected_before_286() {
    init();
    let mut server = server(SimModel::I8088, config_for(SimModel::I8088));
    server.reset().unwrap();
    server.set_memory(code_addr(), &LOOP_PROGRAM).unwrap();
    server.load(RegisterBlock::V1(test_regs(0xF002))).unwrap();
    server.cycle_n(100).unwrap();
    server.finalize().unwrap();
    assert!(matches!(server.store_all().unwrap_err(), ServerError::BadValue(_)));
    assert_eq!(server.state(), ServerState::ExecuteDone);
}

#[test]
fn test_386_round_trip() {
    init();
    let mut server = server(SimModel::I80386, config_for(SimModel::I80386));
    let regs = loop_round_trip(&mut server);
    assert_eq!(server.cpu_type(), ServerCpuType::Intel80386);
    check_loop_result(&regs, 0x0000);
}

#[test]
fn test_386_loadall_round_trip() {
    init();
    let mut server = server(SimModel::I80386, config_for(SimModel::I80386));
    server.reset().unwrap();
    server.set_memory(code_addr(), &LOOP_PROGRAM).unwrap();

    // Not a 286 image.
    let v2 = RegisterBlock::V2(Loadall286::from_registers(&test_regs(0x0002)));
    assert!(matches!(
        server.load(v2).unwrap_err(),
        ServerError::InvalidRegisterFormat(_)
    ));

    let loadall = loadall386_image(&test_regs(0x0002));
    server.load(RegisterBlock::V3A(loadall)).expect("load failed");
    let regs = finish_loop(&mut server);
    check_loop_result(&regs, 0x0000);
}

#[test]
fn test_386_smm_load() {
    init();
    let mut server = server(SimModel::I80386, config_for(SimModel::I80386));
    server.reset().unwrap();
    server.set_memory(code_addr(), &LOOP_PROGRAM).unwrap();

    let smm = smm_image(&test_regs(0x0002));
    server.load(RegisterBlock::V3B(smm)).expect("load failed");
    assert!(!server.read_pin(CpuPin::SMI));
    let regs = finish_loop(&mut server);
    check_loop_result(&regs, 0x0000);
}

#[test]
fn test_386_smm_store_and_resume() {
    init();
    let mut server = server(SimModel::I80386, config_for(SimModel::I80386));
    server.reset().unwrap();
    server.set_memory(code_addr(), &LOOP_PROGRAM).unwrap();
    server.load(RegisterBlock::V1(test_regs(0x0002))).unwrap();
    server.cycle_n(200).unwrap();
    server.finalize().unwrap();

    server.set_flags(server.flags() | FLAG_USE_SMM);
    server.begin_store().unwrap();
    let smm = match server.store().expect("store failed") {
        RegisterBlock::V3B(smm) => smm,
        other => panic!("unexpected register format {:?}", other.format()),
    };
    assert_eq!(server.state(), ServerState::StoreDoneSmm);
    assert!(!server.read_pin(CpuPin::SMI));
    check_loop_result(&smm.to_registers(), 0x0000);

    // Resume from SMM straight into a new state.
    server.set_flags(server.flags() & !FLAG_USE_SMM);
    let resumed = Registers {
        ax: 0x0000,
        ..test_regs(0x0002)
    };
    server.load(RegisterBlock::V3B(smm_image(&resumed))).expect("load failed");
    let regs = finish_loop(&mut server);
    check_loop_result(&regs, 0x0000);
}
