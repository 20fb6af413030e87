//! The server state machine. [CpuServer] owns every piece of per-CPU state and drives the CPU
//! one clock at a time through its capability traits.

use ardx86_common::{
    get_queue_op, get_segment, BusStatus, CpuFamily, CpuPin, CpuWidth, DataWidth, MemoryStrategy,
    QueueOp, RegisterFormat, Result, Segment, ServerCpuType, ServerError, ServerState, TCycle, FLAG_DEBUG_ENABLED,
    FLAG_EMU_8080, FLAG_EXECUTE_AUTOMATIC, FLAG_HALT_AFTER_JUMP, FLAG_USE_SMM,
};

use crate::bus_emulator::{assemble_writes, frame_from_writes, BusEmulator, BusOperation, CallFrame};
use crate::config::{EndStrategy, ServerConfig};
use crate::controller::BusController;
use crate::cycle::{BusCycleModel, CycleModel};
use crate::hal::{BusDirection, CpuHal};
use crate::memory::{make_backend, DefaultStrategy};
use crate::program::InlineProgram;
use crate::programs::{
    cpuid_program, finalize_program, jump_vector_program, load_program, prefetch_program,
    setup_program, store_program, BRKEM_INT, BRKEM_PROGRAM, CPUID_PROGRAM, IO_FINALIZE_ADDR,
    ISR_SEGMENT, LOADALL286_ADDR, LOADALL286_PROGRAM, LOADALL386_ADDR, LOADALL386_PROGRAM,
    LOAD_SEGMENT, NMI_VECTOR_ADDR, OPCODE_NOPS80, RETEM_PROGRAM, RSM_PROGRAM, SMM_ENTRY_ADDR,
    SMM_SAVE_ADDR, STOREALL_PROGRAM,
};
use crate::queue::{InstructionQueue, QueueDataType};
use crate::registers::{RegisterBlock, Registers, Smm386, CPU_FLAG_DIRECTION};

/// Detection runs longer than this many cycles identify a NEC CPU.
pub const NEC_DETECT_THRESHOLD: u32 = 5;

/// Length of the 80286 STOREALL dump.
pub const STOREALL_LEN: usize = 0x66;

/// FLAGS, CS and IP as pushed by an interrupt.
const NMI_FRAME_LEN: usize = 6;

/// A write seen while finalizing with NMI, with what memory held before it when the server
/// applied it.
#[derive(Copy, Clone, Debug)]
struct CapturedWrite {
    op: BusOperation,
    prior: Option<u16>,
}

/// Classify an 8088-family CPU from its bus width and the identification program timing.
pub fn classify_cpu(width: CpuWidth, detect_cycles: u32) -> ServerCpuType {
    let nec = detect_cycles > NEC_DETECT_THRESHOLD;
    match (width, nec) {
        (CpuWidth::Eight, false) => ServerCpuType::Intel8088,
        (CpuWidth::Eight, true) => ServerCpuType::NecV20,
        (CpuWidth::Sixteen, false) => ServerCpuType::Intel8086,
        (CpuWidth::Sixteen, true) => ServerCpuType::NecV30,
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CpuResetResult {
    pub success: bool,
    pub width: CpuWidth,
    pub queue_status: bool,
}

/// A snapshot of the bus after a cycle, as reported to the host.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleState {
    pub state: ServerState,
    pub control: u8,
    pub status: u8,
    pub command: u8,
    pub data: u16,
}

impl CycleState {
    pub fn to_bytes(&self) -> [u8; 6] {
        let [lo, hi] = self.data.to_le_bytes();
        [
            self.state as u8,
            self.control,
            self.status,
            self.command,
            lo,
            hi,
        ]
    }
}

pub struct CpuServer<H: CpuHal> {
    hal: H,
    config: ServerConfig,
    model: CycleModel,
    controller: BusController,
    bus: BusEmulator,
    queue: InstructionQueue,
    program: InlineProgram,
    /// Data served to memory reads during phases that feed a fixed image.
    data_image: Option<(u32, InlineProgram)>,

    state: ServerState,
    cpu_type: ServerCpuType,
    width: CpuWidth,
    have_qs: bool,
    flags: u32,
    addr_mask: u32,

    cycle_num: u64,
    t_cycle: TCycle,
    status_raw: u8,
    status: BusStatus,
    latched: BusStatus,
    address_bus: u32,
    address_latch: u32,
    bhe: bool,
    data_bus: u16,
    data_width: DataWidth,
    direction: BusDirection,
    bus_width: DataWidth,
    wait_count: u32,
    serviced: bool,
    fetch_type: QueueDataType,
    expected_fetch: Option<u32>,
    queue_op: QueueOp,
    queue_byte: u8,
    halted: bool,
    run_mode: bool,
    cycle_comment: Option<String>,
    last_error: String,

    registers: Option<RegisterBlock>,
    prefetch_pending: bool,
    detect_end: u32,
    cpuid_mark: Option<u64>,
    end_strategy: EndStrategy,
    program_end_addr: u32,
    nmi_writes: Vec<CapturedWrite>,
    nmi_frame: Option<CallFrame>,
    emu_writes: Vec<BusOperation>,
    store_buf: [u8; Registers::LEN],
    store_writes: Vec<BusOperation>,
    store_smm: bool,
    dump: Vec<u8>,
    result: Option<RegisterBlock>,
}

impl<H: CpuHal> CpuServer<H> {
    pub fn new(hal: H, config: ServerConfig) -> Self {
        let backend = make_backend(
            config.memory.backend,
            config.address_space(),
            config.memory.hash_capacity,
            config.memory.strategy,
        );
        Self {
            hal,
            model: CycleModel::for_family(config.family),
            controller: BusController::for_family(config.family),
            bus: BusEmulator::new(backend),
            queue: InstructionQueue::new(CpuWidth::Eight),
            program: cpuid_program(),
            data_image: None,
            state: ServerState::Reset,
            cpu_type: ServerCpuType::default(),
            width: CpuWidth::default(),
            have_qs: false,
            flags: config.flags,
            addr_mask: config.address_mask(),
            cycle_num: 0,
            t_cycle: TCycle::Idle,
            status_raw: 0,
            status: BusStatus::Passive,
            latched: BusStatus::Passive,
            address_bus: 0,
            address_latch: 0,
            bhe: false,
            data_bus: 0,
            data_width: DataWidth::default(),
            direction: BusDirection::Input,
            bus_width: DataWidth::default(),
            wait_count: 0,
            serviced: false,
            fetch_type: QueueDataType::Program,
            expected_fetch: None,
            queue_op: QueueOp::Idle,
            queue_byte: 0,
            halted: false,
            run_mode: false,
            cycle_comment: None,
            last_error: String::new(),
            registers: None,
            prefetch_pending: config.prefetch,
            detect_end: 0,
            cpuid_mark: None,
            end_strategy: EndStrategy::Auto,
            program_end_addr: 0,
            nmi_writes: Vec::new(),
            nmi_frame: None,
            emu_writes: Vec::new(),
            store_buf: [0; Registers::LEN],
            store_writes: Vec::new(),
            store_smm: false,
            dump: Vec::new(),
            result: None,
            config,
        }
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn cpu_type(&self) -> ServerCpuType {
        self.cpu_type
    }

    pub fn width(&self) -> CpuWidth {
        self.width
    }

    pub fn has_queue_status(&self) -> bool {
        self.have_qs
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u32) {
        log::debug!("Server flags: {:08X} -> {:08X}", self.flags, flags);
        self.flags = flags;
    }

    pub fn cycle_num(&self) -> u64 {
        self.cycle_num
    }

    pub fn t_cycle(&self) -> TCycle {
        self.t_cycle
    }

    pub fn bus_status(&self) -> BusStatus {
        self.status
    }

    pub fn latched_status(&self) -> BusStatus {
        self.latched
    }

    pub fn status_byte(&self) -> u8 {
        self.status_raw
    }

    pub fn command_byte(&self) -> u8 {
        self.controller.lines().command_byte(self.bhe)
    }

    pub fn control_byte(&self) -> u8 {
        self.controller.lines().control_byte()
    }

    pub fn address_latch(&self) -> u32 {
        self.address_latch
    }

    pub fn address_bus(&self) -> u32 {
        self.address_bus
    }

    pub fn data_bus(&self) -> u16 {
        self.data_bus
    }

    pub fn queue(&self) -> &InstructionQueue {
        &self.queue
    }

    pub fn bus(&self) -> &BusEmulator {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut BusEmulator {
        &mut self.bus
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub fn set_last_error(&mut self, error: &ServerError) {
        log::error!("{}", error);
        self.last_error = error.to_string();
    }

    pub fn cycle_state(&self) -> CycleState {
        CycleState {
            state: self.state,
            control: self.control_byte(),
            status: self.status_raw,
            command: self.command_byte(),
            data: self.data_bus,
        }
    }

    fn automatic(&self) -> bool {
        self.run_mode || (self.flags & FLAG_EXECUTE_AUTOMATIC) != 0
    }

    fn emulating(&self) -> bool {
        (self.flags & FLAG_EMU_8080) != 0
    }

    fn enter_state(&mut self, state: ServerState) {
        log::debug!(
            "{:?} -> {:?} at cycle {} [{:05X}]",
            self.state,
            state,
            self.cycle_num,
            self.address_latch
        );
        self.state = state;
    }

    fn require(&self, ok: bool, expected: &'static str) -> Result<()> {
        if ok {
            Ok(())
        } else {
            Err(ServerError::InvalidPhase {
                expected,
                actual: self.state,
            })
        }
    }

    fn set_bus_direction(&mut self, direction: BusDirection) {
        if self.direction != direction {
            self.hal.set_direction(direction);
            self.direction = direction;
        }
    }

    fn set_bus_width(&mut self, width: DataWidth) {
        if self.bus_width != width {
            self.hal.set_width(width);
            self.bus_width = width;
        }
    }

    fn clock_pulse(&mut self) {
        self.hal.clock_edge(true);
        if self.config.clock_high_us > 0 {
            self.hal.delay_us(self.config.clock_high_us);
        }
        self.hal.clock_edge(false);
        if self.config.clock_low_us > 0 {
            self.hal.delay_us(self.config.clock_low_us);
        }
    }

    /// Run up to `budget` cycles until `done` holds.
    fn tick_until<F>(&mut self, budget: u32, phase: ServerState, done: F) -> Result<u32>
    where
        F: Fn(&Self) -> bool,
    {
        for i in 0..budget {
            if done(self) {
                return Ok(i);
            }
            self.cycle()?;
        }
        if done(self) {
            Ok(budget)
        } else {
            Err(ServerError::PhaseTimeout {
                phase,
                cycles: budget,
            })
        }
    }

    fn reset_context(&mut self) {
        self.model = CycleModel::for_family(self.config.family);
        self.controller = BusController::for_family(self.config.family);
        self.queue = InstructionQueue::new(CpuWidth::Eight);
        self.program = cpuid_program();
        self.data_image = None;
        self.state = ServerState::Reset;
        self.cpu_type = ServerCpuType::default();
        self.width = CpuWidth::default();
        self.have_qs = false;
        self.cycle_num = 0;
        self.t_cycle = TCycle::Idle;
        self.status = BusStatus::Passive;
        self.latched = BusStatus::Passive;
        self.wait_count = 0;
        self.serviced = false;
        self.expected_fetch = None;
        self.queue_op = QueueOp::Idle;
        self.halted = false;
        self.run_mode = false;
        self.registers = None;
        // Emulation is armed per load.
        self.flags &= !FLAG_EMU_8080;
        self.prefetch_pending = self.config.prefetch;
        self.cpuid_mark = None;
        self.end_strategy = EndStrategy::Auto;
        self.program_end_addr = 0;
        self.nmi_writes.clear();
        self.nmi_frame = None;
        self.emu_writes.clear();
        self.store_writes.clear();
        self.store_smm = false;
        self.dump.clear();
        self.result = None;
        self.set_bus_direction(BusDirection::Input);
    }

    /// Reset the CPU and run it up to the point where it is ready for a register load:
    /// identification and family setup included.
    pub fn reset(&mut self) -> Result<CpuResetResult> {
        self.reset_context();

        self.hal.write_pin(CpuPin::READY, true);
        self.hal.write_pin(CpuPin::NMI, false);
        self.hal.write_pin(CpuPin::SMI, false);
        self.hal.write_pin(CpuPin::INTR, false);
        self.hal.write_pin(CpuPin::TEST, false);

        self.hal.write_pin(CpuPin::RESET, true);
        for _ in 0..self.config.reset_hold_cycles {
            self.clock_pulse();
        }
        self.hal.write_pin(CpuPin::RESET, false);

        let budget = self.config.timeouts.reset;
        if self
            .tick_until(budget, ServerState::Reset, |s| s.state != ServerState::Reset)
            .is_err()
        {
            self.enter_state(ServerState::Error);
            return Err(ServerError::ResetFailure(format!(
                "no ALE within {} cycles of reset",
                budget
            )));
        }

        if let Err(e) = self.tick_until(self.config.timeouts.cpuid, ServerState::CpuId, |s| {
            s.state == ServerState::JumpVector
        }) {
            let e = match (e, self.state) {
                (ServerError::PhaseTimeout { cycles, .. }, ServerState::CpuId) => {
                    ServerError::PhaseTimeout {
                        phase: ServerState::CpuId,
                        cycles,
                    }
                }
                (ServerError::PhaseTimeout { cycles, .. }, _) => ServerError::PhaseTimeout {
                    phase: ServerState::Reset,
                    cycles,
                },
                (e, _) => e,
            };
            self.enter_state(ServerState::Error);
            return Err(e);
        }

        log::debug!(
            "Reset complete: {:?}, {:?} bus, queue status: {}",
            self.cpu_type,
            self.width,
            self.have_qs
        );
        Ok(CpuResetResult {
            success: true,
            width: self.width,
            queue_status: self.have_qs,
        })
    }

    /// The first ALE after reset tells us the bus width.
    fn on_reset_fetch(&mut self) {
        let family = self.config.family;
        self.width = match family {
            CpuFamily::Intel808x | CpuFamily::Intel186 => {
                if self.bhe {
                    CpuWidth::Sixteen
                } else {
                    CpuWidth::Eight
                }
            }
            CpuFamily::Intel286 | CpuFamily::Intel386 => CpuWidth::Sixteen,
        };
        self.queue = InstructionQueue::new(self.width);
        self.detect_end = self.address_latch + CPUID_PROGRAM.len() as u32 - 1;

        let wide = self.width == CpuWidth::Sixteen;
        match family {
            CpuFamily::Intel808x => {
                self.have_qs = true;
                self.cpu_type = classify_cpu(self.width, 0);
                self.program = cpuid_program();
                self.enter_state(ServerState::CpuId);
            }
            CpuFamily::Intel186 => {
                self.have_qs = self.hal.read_pin(CpuPin::QSMODE);
                self.cpu_type = if wide {
                    ServerCpuType::Intel80186(self.have_qs)
                } else {
                    ServerCpuType::Intel80188(self.have_qs)
                };
                match setup_program(family) {
                    Some(program) => {
                        self.program = program;
                        self.enter_state(ServerState::CpuSetup);
                    }
                    None => self.enter_jump_vector(),
                }
            }
            CpuFamily::Intel286 => {
                self.cpu_type = ServerCpuType::Intel80286;
                self.enter_jump_vector();
            }
            CpuFamily::Intel386 => {
                self.cpu_type = ServerCpuType::Intel80386;
                self.enter_jump_vector();
            }
        }
    }

    fn enter_jump_vector(&mut self) {
        self.program = jump_vector_program(LOAD_SEGMENT);
        self.enter_state(ServerState::JumpVector);
    }

    /// Select the Emulate8080 mode for the next load.
    pub fn enable_emulation(&mut self) -> Result<()> {
        self.require(self.state == ServerState::JumpVector, "JumpVector")?;
        if !self.cpu_type.has_8080_emulation() {
            return Err(ServerError::BadValue(format!(
                "{:?} has no 8080 emulation mode",
                self.cpu_type
            )));
        }
        self.flags |= FLAG_EMU_8080;
        Ok(())
    }

    /// Run the prefetch program ahead of the user program on the next load.
    pub fn enable_prefetch(&mut self) -> Result<()> {
        self.require(self.state == ServerState::JumpVector, "JumpVector")?;
        if prefetch_program(self.cpu_type).is_none() {
            return Err(ServerError::BadValue(format!(
                "{:?} has no prefetch program",
                self.cpu_type
            )));
        }
        self.prefetch_pending = true;
        Ok(())
    }

    fn adjust_registers(&self, block: RegisterBlock) -> Result<RegisterBlock> {
        let RegisterBlock::V1(mut regs) = block else {
            return Ok(block);
        };
        if self.emulating() {
            if !self.cpu_type.has_8080_emulation() {
                return Err(ServerError::BadValue(format!(
                    "{:?} has no 8080 emulation mode",
                    self.cpu_type
                )));
            }
            // BRKEM pushes a frame before the user program starts.
            regs.sp = regs.sp.wrapping_add(6);
        } else if self.prefetch_pending {
            if let Some(program) = prefetch_program(self.cpu_type) {
                regs.rewind_ip(program.len() as u16);
                if self.cpu_type.is_intel() {
                    // Each STOSB moves DI by one.
                    if regs.flags & CPU_FLAG_DIRECTION != 0 {
                        regs.di = regs.di.wrapping_add(program.len() as u16);
                    } else {
                        regs.di = regs.di.wrapping_sub(program.len() as u16);
                    }
                }
            }
        }
        Ok(RegisterBlock::V1(regs))
    }

    /// Load registers and run until the CPU starts fetching the user program.
    pub fn load(&mut self, block: RegisterBlock) -> Result<()> {
        block.check_cpu(self.cpu_type)?;
        let from_smm =
            self.state == ServerState::StoreDoneSmm && matches!(block, RegisterBlock::V3B(_));
        self.require(self.state == ServerState::JumpVector || from_smm, "JumpVector")?;

        let block = self.adjust_registers(block)?;
        if let RegisterBlock::V3B(smm) = &block {
            if from_smm {
                // Already in SMM: resume straight into the new state.
                self.data_image = Some((SMM_SAVE_ADDR, image_program("smm_image", &smm.image)));
                self.program = InlineProgram::new("rsm", &RSM_PROGRAM);
                self.enter_state(ServerState::LoadSmm);
            }
        }
        self.registers = Some(block);

        self.tick_until(self.config.timeouts.load, ServerState::Load, |s| {
            s.state == ServerState::Execute
        })?;
        Ok(())
    }

    fn enter_load(&mut self) {
        let Some(block) = self.registers.clone() else {
            log::warn!("Reached load segment with no registers to load");
            return;
        };
        match &block {
            RegisterBlock::V1(regs) => {
                self.program = load_program(regs);
                let flags_addr = linear(regs.ss, regs.sp.wrapping_sub(2)) & self.addr_mask;
                self.data_image = Some((flags_addr, image_program("flags", &regs.flags.to_le_bytes())));
            }
            RegisterBlock::V2(l) => {
                self.program = InlineProgram::new("loadall286", &LOADALL286_PROGRAM);
                self.data_image = Some((LOADALL286_ADDR, image_program("loadall286", &l.image)));
            }
            RegisterBlock::V3A(l) => {
                self.program = InlineProgram::new("loadall386", &LOADALL386_PROGRAM);
                self.data_image = Some((LOADALL386_ADDR, image_program("loadall386", &l.image)));
            }
            RegisterBlock::V3B(smm) => {
                // Enter SMM; the handler fetch at the entry point switches to LoadSmm.
                self.program = finalize_program(false);
                self.data_image = Some((SMM_SAVE_ADDR, image_program("smm_image", &smm.image)));
                self.hal.write_pin(CpuPin::SMI, true);
            }
        }
        self.enter_state(ServerState::Load);
    }

    fn load_done(&mut self) {
        self.enter_state(ServerState::LoadDone);
        self.data_image = None;

        if self.emulating() {
            if let Some(RegisterBlock::V1(regs)) = &self.registers {
                let [ip_lo, ip_hi] = regs.ip.to_le_bytes();
                let [cs_lo, cs_hi] = regs.cs.to_le_bytes();
                self.data_image = Some((
                    BRKEM_INT as u32 * 4,
                    image_program("brkem_vector", &[ip_lo, ip_hi, cs_lo, cs_hi]),
                ));
            }
            self.emu_writes.clear();
            self.program = InlineProgram::new("brkem", &BRKEM_PROGRAM);
            self.enter_state(ServerState::EmuEnter);
            return;
        }

        if self.prefetch_pending {
            if let Some(program) = prefetch_program(self.cpu_type) {
                self.program = program;
                self.enter_state(ServerState::Prefetch);
                return;
            }
        }
        self.enter_execute();
    }

    fn enter_execute(&mut self) {
        self.program = finalize_program(self.emulating());
        self.data_image = None;
        self.halted = false;
        self.enter_state(ServerState::Execute);
    }

    fn resolve_end_strategy(&self) -> EndStrategy {
        if self.emulating() {
            return EndStrategy::QueueTag;
        }
        if self.automatic() {
            // Tagging replaces every fetch after this point, including operand bytes of the
            // instruction in flight. Only a host finalizing on an instruction boundary can
            // use it.
            if self.config.end_strategy == EndStrategy::QueueTag {
                log::warn!("Queue tagging needs host-driven execution, finalizing with NMI");
            }
            return EndStrategy::Nmi;
        }
        match self.config.end_strategy {
            EndStrategy::Auto | EndStrategy::QueueTag if self.have_qs => EndStrategy::QueueTag,
            EndStrategy::QueueTag => {
                log::warn!("No queue status available, finalizing with NMI");
                EndStrategy::Nmi
            }
            _ => EndStrategy::Nmi,
        }
    }

    fn begin_finalize(&mut self, strategy: EndStrategy) {
        self.end_strategy = strategy;
        self.program = finalize_program(self.emulating());
        self.nmi_writes.clear();
        self.nmi_frame = None;
        if strategy == EndStrategy::Nmi {
            let [isr_lo, isr_hi] = ISR_SEGMENT.to_le_bytes();
            self.data_image = Some((
                NMI_VECTOR_ADDR,
                image_program("nmi_vector", &[0x00, 0x00, isr_lo, isr_hi]),
            ));
            self.hal.write_pin(CpuPin::NMI, true);
        }
        self.enter_state(ServerState::ExecuteFinalize);
    }

    /// End the user program and run until the CPU has retired it.
    pub fn finalize(&mut self) -> Result<()> {
        self.require(self.state == ServerState::Execute, "Execute")?;
        let strategy = self.resolve_end_strategy();
        self.begin_finalize(strategy);
        self.tick_until(
            self.config.timeouts.finalize,
            ServerState::ExecuteFinalize,
            |s| s.state == ServerState::ExecuteDone,
        )?;
        Ok(())
    }

    /// Execute automatically until the CPU halts, then finalize with NMI. Returns the number
    /// of cycles executed before the halt.
    pub fn run(&mut self, budget: u32) -> Result<u32> {
        self.require(self.state == ServerState::Execute, "Execute")?;
        let budget = if budget == 0 {
            self.config.timeouts.execute
        } else {
            budget
        };
        self.run_mode = true;
        self.halted = self.latched == BusStatus::Halt;
        let result = self
            .tick_until(budget, ServerState::Execute, |s| s.halted)
            .and_then(|cycles| {
                self.begin_finalize(EndStrategy::Nmi);
                self.tick_until(
                    self.config.timeouts.finalize,
                    ServerState::ExecuteFinalize,
                    |s| s.state == ServerState::ExecuteDone,
                )?;
                Ok(cycles)
            });
        self.run_mode = false;
        result
    }

    pub fn begin_store(&mut self) -> Result<()> {
        self.require(self.state == ServerState::ExecuteDone, "ExecuteDone")?;
        self.store_buf = [0; Registers::LEN];
        self.store_writes.clear();
        self.result = None;
        self.data_image = None;
        self.store_smm =
            (self.flags & FLAG_USE_SMM) != 0 && self.cpu_type == ServerCpuType::Intel80386;
        if self.store_smm {
            self.dump = vec![0; RegisterFormat::V3B.payload_len()];
            self.program = finalize_program(false);
            self.hal.write_pin(CpuPin::SMI, true);
        } else {
            self.program = store_program();
        }
        self.enter_state(ServerState::Store);
        Ok(())
    }

    /// Begin the store phase and run until the CPU has started fetching the store program.
    pub fn prefetch_store(&mut self) -> Result<()> {
        self.begin_store()?;
        if !self.store_smm {
            self.tick_until(self.config.timeouts.store, ServerState::Store, |s| {
                s.program.pos() > 0
            })?;
        }
        Ok(())
    }

    /// Run the store phase to completion and return the registers.
    pub fn store(&mut self) -> Result<RegisterBlock> {
        match self.state {
            ServerState::Store => {
                self.tick_until(self.config.timeouts.store, ServerState::Store, |s| {
                    matches!(s.state, ServerState::StoreDone | ServerState::StoreDoneSmm)
                })?;
            }
            ServerState::StoreDone | ServerState::StoreDoneSmm => {}
            _ => {
                return Err(ServerError::InvalidPhase {
                    expected: "Store",
                    actual: self.state,
                })
            }
        }
        let result = self
            .result
            .clone()
            .ok_or_else(|| ServerError::BadValue("store produced no registers".to_string()))?;
        if self.state == ServerState::StoreDone {
            self.enter_state(ServerState::Done);
        }
        Ok(result)
    }

    /// Dump the full 80286 state with STOREALL. The CPU shuts down afterwards.
    pub fn store_all(&mut self) -> Result<Vec<u8>> {
        self.require(self.state == ServerState::ExecuteDone, "ExecuteDone")?;
        if self.cpu_type != ServerCpuType::Intel80286 {
            return Err(ServerError::BadValue(format!(
                "STOREALL is not supported on {:?}",
                self.cpu_type
            )));
        }
        self.dump = vec![0; STOREALL_LEN];
        self.program = InlineProgram::new("storeall", &STOREALL_PROGRAM);
        self.enter_state(ServerState::StoreAll);
        self.tick_until(self.config.timeouts.storeall, ServerState::StoreAll, |s| {
            s.state == ServerState::Shutdown
        })?;
        Ok(self.dump.clone())
    }

    /// Drive the data bus on behalf of the host.
    pub fn write_data_bus(&mut self, data: u16) {
        self.data_bus = data;
        self.set_bus_width(self.data_width);
        self.set_bus_direction(BusDirection::Output);
        self.hal.write_data_bus(data);
        self.serviced = true;
    }

    pub fn write_pin(&mut self, pin: CpuPin, value: bool) {
        self.hal.write_pin(pin, value);
    }

    pub fn read_pin(&self, pin: CpuPin) -> bool {
        self.hal.read_pin(pin)
    }

    pub fn set_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.bus.mem_mut().set_range(address, data)
    }

    pub fn read_memory(&self, address: u32, len: usize) -> Result<Vec<u8>> {
        self.bus.mem().read_range(address, len)
    }

    pub fn erase_memory(&mut self) {
        self.bus.mem_mut().erase();
    }

    pub fn randomize_memory(&mut self, seed: u32) {
        self.bus.mem_mut().randomize(seed);
    }

    pub fn set_random_seed(&mut self, seed: u32) {
        let strategy = DefaultStrategy {
            seed,
            ..self.bus.mem().strategy()
        };
        self.bus.mem_mut().set_strategy(strategy);
    }

    pub fn set_memory_strategy(&mut self, kind: MemoryStrategy, start: u32, end: u32) {
        let strategy = DefaultStrategy {
            kind,
            start,
            end,
            ..self.bus.mem().strategy()
        };
        self.bus.mem_mut().set_strategy(strategy);
        self.bus.mem_mut().erase();
    }

    pub fn cycle_n(&mut self, n: u32) -> Result<()> {
        for _ in 0..n {
            self.cycle()?;
        }
        Ok(())
    }

    /// Advance the CPU by one clock.
    pub fn cycle(&mut self) -> Result<()> {
        self.cycle_comment = None;
        self.queue_op = QueueOp::Idle;

        let ready = self.hal.read_pin(CpuPin::READY);
        let command = self
            .hal
            .read_command()
            .unwrap_or_else(|| self.controller.lines().command_byte(self.bhe));
        self.clock_pulse();
        self.cycle_num += 1;

        self.status_raw = self.hal.read_status();
        self.status = self.model.decode_status(self.status_raw);
        self.address_bus = self.hal.read_address() & self.addr_mask;
        self.bhe = self.hal.read_bhe();

        let last_t = self.t_cycle;
        self.controller.tick(self.status, ready);
        self.t_cycle = self
            .model
            .next_cycle(self.t_cycle, self.status, self.latched, command, ready);

        let completed = if self.model.four_state() {
            self.t_cycle == TCycle::T4
        } else {
            matches!(last_t, TCycle::T2 | TCycle::Wait)
                && matches!(self.t_cycle, TCycle::Idle | TCycle::T1)
        };
        if completed {
            self.complete_cycle();
        }

        if self.controller.ale() {
            if self.t_cycle != TCycle::T1 {
                log::warn!("ALE on non-T1 cycle state! CPU desynchronized.");
                self.t_cycle = TCycle::T1;
            }
            self.latched = self.controller.latched();
            self.address_latch = self.address_bus;
            if self.state == ServerState::Reset {
                self.on_reset_fetch();
            }
            self.data_width = self.bus_data_width();
            self.serviced = false;
            self.fetch_type = QueueDataType::Program;
            self.on_cycle_start();
        }

        self.handle_wait_states(last_t);
        self.service_transfer()?;
        self.handle_queue_status();

        if self.flags & FLAG_DEBUG_ENABLED != 0 {
            log::debug!("{}", self.get_cpu_state_str());
        } else {
            log::trace!("{}", self.get_cpu_state_str());
        }
        Ok(())
    }

    fn bus_data_width(&self) -> DataWidth {
        match self.width {
            CpuWidth::Eight => DataWidth::EightLow,
            CpuWidth::Sixteen => DataWidth::from((self.bhe, self.address_latch & 1 != 0)),
        }
    }

    fn complete_cycle(&mut self) {
        if self.latched == BusStatus::Code && self.have_qs {
            if !self.queue.push(self.data_bus, self.data_width, self.fetch_type, self.address_latch) {
                log::warn!("CPU desynchronized: fetch at [{:05X}] overflowed queue", self.address_latch);
            }
        }
        if self.wait_count > 0 {
            self.wait_count = 0;
            self.hal.write_pin(CpuPin::READY, true);
        }
        self.set_bus_direction(BusDirection::Input);
    }

    fn handle_wait_states(&mut self, last_t: TCycle) {
        // Wait states would skew the detection timing.
        if self.config.wait_states == 0
            || matches!(
                self.state,
                ServerState::Reset | ServerState::CpuId | ServerState::CpuSetup
            )
        {
            return;
        }
        match self.t_cycle {
            TCycle::T2 if last_t == TCycle::T1 => {
                if !matches!(self.latched, BusStatus::Halt | BusStatus::Passive) {
                    self.wait_count = self.config.wait_states;
                    self.hal.write_pin(CpuPin::READY, false);
                }
            }
            TCycle::Wait if self.wait_count > 0 => {
                self.wait_count -= 1;
                if self.wait_count == 0 {
                    self.hal.write_pin(CpuPin::READY, true);
                }
            }
            _ => {}
        }
    }

    /// Phase transitions that happen when a bus cycle begins.
    fn on_cycle_start(&mut self) {
        let addr = self.address_latch;

        if self.latched == BusStatus::Halt {
            match self.state {
                ServerState::StoreAll => self.enter_state(ServerState::Shutdown),
                ServerState::Execute => {
                    cycle_comment!(self, "CPU halted!");
                    self.halted = true;
                }
                _ => {}
            }
            return;
        }
        if self.latched != BusStatus::Code {
            return;
        }

        let sequential = self.expected_fetch.map_or(true, |expected| expected == addr);
        let jumped = !sequential && self.program.is_finished();
        self.expected_fetch = Some(addr.wrapping_add(self.data_width.bytes() as u32) & self.addr_mask);
        if jumped {
            cycle_comment!(self, "jump to [{:05X}]", addr);
        }

        match self.state {
            ServerState::JumpVector
                if self.program.is_finished() && addr == linear(LOAD_SEGMENT, 0) =>
            {
                self.enter_load()
            }
            ServerState::Load => {
                if matches!(self.registers, Some(RegisterBlock::V3B(_))) {
                    if addr == SMM_ENTRY_ADDR {
                        self.hal.write_pin(CpuPin::SMI, false);
                        self.program = InlineProgram::new("rsm", &RSM_PROGRAM);
                        self.enter_state(ServerState::LoadSmm);
                    }
                } else if jumped {
                    self.load_done();
                }
            }
            ServerState::LoadSmm if jumped => self.load_done(),
            ServerState::EmuEnter if jumped => self.enter_execute(),
            ServerState::Prefetch if self.program.is_finished() => self.enter_execute(),
            ServerState::Execute if !sequential && (self.flags & FLAG_HALT_AFTER_JUMP) != 0 => {
                let strategy = self.resolve_end_strategy();
                self.begin_finalize(strategy);
            }
            ServerState::ExecuteFinalize
                if self.end_strategy == EndStrategy::Nmi && addr == linear(ISR_SEGMENT, 0) =>
            {
                self.hal.write_pin(CpuPin::NMI, false);
                self.nmi_frame = self.take_nmi_frame();
                if self.nmi_frame.is_none() {
                    log::warn!("NMI handler entered but no stack frame was captured");
                }
                self.data_image = None;
                self.enter_state(ServerState::ExecuteDone);
            }
            ServerState::EmuExit if jumped => {
                self.data_image = None;
                self.program = finalize_program(false);
                self.enter_state(ServerState::ExecuteDone);
            }
            ServerState::Store if self.store_smm && addr == SMM_ENTRY_ADDR => {
                self.hal.write_pin(CpuPin::SMI, false);
                match Smm386::from_bytes(&self.dump) {
                    Ok(mut smm) => {
                        if let (EndStrategy::Nmi, Some(frame)) = (self.end_strategy, self.nmi_frame) {
                            smm.unwind_frame(frame.ip, frame.cs, frame.flags);
                        }
                        self.result = Some(RegisterBlock::V3B(smm));
                    }
                    Err(e) => log::error!("Bad SMM dump: {}", e),
                }
                self.enter_state(ServerState::StoreDoneSmm);
            }
            _ => {}
        }
    }

    fn service_transfer(&mut self) -> Result<()> {
        if self.serviced {
            return Ok(());
        }
        let lines = *self.controller.lines();
        let read = match self.latched {
            BusStatus::Code | BusStatus::MemRead => lines.mrdc,
            BusStatus::IoRead => lines.iorc,
            BusStatus::IrqAck => lines.inta,
            _ => false,
        };
        let write = match self.latched {
            BusStatus::MemWrite => lines.mwtc,
            BusStatus::IoWrite => lines.iowc,
            _ => false,
        };

        if read {
            self.serviced = true;
            if let Some(data) = self.serve_read() {
                self.data_bus = data;
                self.set_bus_width(self.data_width);
                self.set_bus_direction(BusDirection::Output);
                self.hal.write_data_bus(data);
            }
        } else if write {
            self.serviced = true;
            self.set_bus_direction(BusDirection::Input);
            self.data_bus = self.hal.read_data_bus();
            self.serve_write(self.data_bus)?;
        }
        Ok(())
    }

    fn image_read(&self, address: u32, width: DataWidth) -> Option<u16> {
        let (base, image) = self.data_image.as_ref()?;
        let range = *base..base.wrapping_add(image.len() as u32);
        let hit = range.contains(&address)
            || (width == DataWidth::Sixteen && range.contains(&address.wrapping_add(1)));
        hit.then(|| image.read_at(*base, address, width))
    }

    /// Produce the data for a read cycle. Returns `None` when the host serves it.
    fn serve_read(&mut self) -> Option<u16> {
        let (kind, address, width) = (self.latched, self.address_latch, self.data_width);

        if self.state == ServerState::Execute {
            if !self.automatic() {
                cycle_comment!(self, "waiting for host");
                return None;
            }
            return Some(self.bus.read_bus(kind, address, width));
        }

        if self.state == ServerState::ExecuteFinalize
            && self.end_strategy == EndStrategy::Nmi
            && self.automatic()
        {
            // The program runs on until the CPU takes the NMI.
            if kind == BusStatus::MemRead {
                if let Some(data) = self.image_read(address, width) {
                    return Some(data);
                }
            }
            return Some(self.bus.read_bus(kind, address, width));
        }

        if kind == BusStatus::Code {
            if matches!(
                self.state,
                ServerState::ExecuteFinalize | ServerState::ExecuteDone
            ) {
                self.fetch_type = QueueDataType::ProgramEnd;
            }
            return Some(self.program.read(address, width));
        }

        if kind == BusStatus::MemRead {
            if let Some(data) = self.image_read(address, width) {
                return Some(data);
            }
        }
        Some(self.bus.read_bus(kind, address, width))
    }

    fn serve_write(&mut self, data: u16) -> Result<()> {
        let op = BusOperation {
            kind: self.latched,
            width: self.data_width,
            address: self.address_latch,
            data,
        };

        match self.state {
            ServerState::ExecuteFinalize
                if self.end_strategy == EndStrategy::Nmi && op.kind == BusStatus::MemWrite =>
            {
                // Program stores may still be in flight. Which writes are the NMI frame is
                // only known once the handler is entered.
                let prior = if self.automatic() {
                    let prior = self.bus.mem().read_bus(op.address, op.width);
                    self.bus.write_bus(op.kind, op.address, op.width, op.data);
                    Some(prior)
                } else {
                    self.bus.log_op(op);
                    None
                };
                self.nmi_writes.push(CapturedWrite { op, prior });
            }
            ServerState::Execute | ServerState::ExecuteFinalize => {
                if self.automatic() {
                    self.bus.write_bus(op.kind, op.address, op.width, op.data);
                } else {
                    self.bus.log_op(op);
                }
            }
            ServerState::CpuSetup if op.kind == BusStatus::IoWrite => {
                log::debug!("Setup wrote {:04X} to port {:04X}", data, op.address);
                self.enter_jump_vector();
            }
            ServerState::EmuEnter if op.kind == BusStatus::MemWrite => {
                self.emu_writes.push(op);
            }
            ServerState::Store => self.store_write(op)?,
            ServerState::StoreAll if op.kind == BusStatus::MemWrite => {
                for (addr, byte) in assemble_writes([&op]) {
                    if let Some(offset) = addr.checked_sub(LOADALL286_ADDR) {
                        if let Some(slot) = self.dump.get_mut(offset as usize) {
                            *slot = byte;
                        }
                    }
                }
            }
            _ => {
                log::trace!(
                    "Ignoring {:?} of {:04X} to [{:05X}] in state {:?}",
                    op.kind,
                    data,
                    op.address,
                    self.state
                );
            }
        }
        Ok(())
    }

    /// Split the NMI frame off the writes captured since finalize. The frame is the last
    /// [NMI_FRAME_LEN] bytes written before the handler's first fetch. Its writes are undone so
    /// the program's memory is left as the program left it.
    fn take_nmi_frame(&mut self) -> Option<CallFrame> {
        let mut start = self.nmi_writes.len();
        let mut bytes = 0;
        while start > 0 && bytes < NMI_FRAME_LEN {
            start -= 1;
            bytes += self.nmi_writes[start].op.width.bytes();
        }
        let frame = self.nmi_writes.split_off(start);
        for write in frame.iter().rev() {
            if let Some(prior) = write.prior {
                self.bus
                    .mem_mut()
                    .write_bus(write.op.address, write.op.width, prior);
            }
        }
        frame_from_writes(frame.iter().map(|write| &write.op))
    }

    fn store_write(&mut self, op: BusOperation) -> Result<()> {
        if self.store_smm {
            if op.kind == BusStatus::MemWrite {
                for (addr, byte) in assemble_writes([&op]) {
                    if let Some(offset) = addr.checked_sub(SMM_SAVE_ADDR) {
                        if let Some(slot) = self.dump.get_mut(offset as usize) {
                            *slot = byte;
                        }
                    }
                }
            }
            return Ok(());
        }

        match op.kind {
            BusStatus::IoWrite => {
                let port = op.address & 0xFFFF;
                if port == IO_FINALIZE_ADDR {
                    return self.finish_store();
                }
                if (port as usize) < Registers::LEN {
                    for (addr, byte) in assemble_writes([&op]) {
                        if let Some(slot) = self.store_buf.get_mut(addr as usize) {
                            *slot = byte;
                        }
                    }
                } else {
                    log::warn!("Unexpected IO write to port {:04X} during store", port);
                }
            }
            BusStatus::MemWrite => self.store_writes.push(op),
            _ => {}
        }
        Ok(())
    }

    fn finish_store(&mut self) -> Result<()> {
        let mut regs = Registers::from_bytes(&self.store_buf)?;

        let pushed = assemble_writes(&self.store_writes);
        match pushed.keys().next() {
            Some(&base) => {
                let lo = pushed.get(&base).copied().unwrap_or(0);
                let hi = pushed.get(&(base + 1)).copied().unwrap_or(0);
                regs.flags = u16::from_le_bytes([lo, hi]);
            }
            None => log::warn!("No flags were pushed during store"),
        }

        match (self.end_strategy, self.nmi_frame) {
            (EndStrategy::Nmi, Some(frame)) => {
                regs.ip = frame.ip;
                regs.cs = frame.cs;
                regs.flags = frame.flags;
                // Undo the NMI frame push.
                regs.sp = regs.sp.wrapping_add(6);
            }
            (EndStrategy::Nmi, None) => {
                log::warn!("No NMI frame captured, IP and CS are the handler's");
            }
            _ => {
                regs.ip = self
                    .program_end_addr
                    .wrapping_sub((regs.cs as u32) << 4) as u16;
            }
        }

        if self.emulating() {
            // RETEM popped the frame BRKEM pushed below the loaded SP.
            regs.sp = regs.sp.wrapping_sub(6);
        }

        self.result = Some(RegisterBlock::V1(regs));
        self.enter_state(ServerState::StoreDone);
        Ok(())
    }

    fn handle_queue_status(&mut self) {
        if !self.have_qs {
            return;
        }
        self.queue_op = get_queue_op!(self.status_raw);
        match self.queue_op {
            QueueOp::Idle => {}
            QueueOp::Flush => {
                self.queue.flush();
                if self.state == ServerState::Execute && (self.flags & FLAG_HALT_AFTER_JUMP) != 0 {
                    let strategy = self.resolve_end_strategy();
                    self.begin_finalize(strategy);
                }
            }
            QueueOp::First | QueueOp::Subsequent => {
                let Some(entry) = self.queue.pop() else {
                    log::warn!("Queue read from empty queue! CPU desynchronized.");
                    return;
                };
                self.queue_byte = entry.opcode;
                let first = self.queue_op == QueueOp::First;

                match self.state {
                    ServerState::CpuId => match self.cpuid_mark {
                        None if !first && entry.addr == self.detect_end => {
                            self.cpuid_mark = Some(self.cycle_num);
                        }
                        Some(mark) if first => {
                            let cycles = (self.cycle_num - mark) as u32;
                            self.cpu_type = classify_cpu(self.width, cycles);
                            log::debug!("CPU detection took {} cycles: {:?}", cycles, self.cpu_type);
                            cycle_comment!(self, "detect: {} cycles", cycles);
                            self.enter_jump_vector();
                        }
                        _ => {}
                    },
                    ServerState::ExecuteFinalize
                        if first
                            && self.end_strategy == EndStrategy::QueueTag
                            && entry.dtype == QueueDataType::ProgramEnd =>
                    {
                        self.program_end_addr = entry.addr;
                        cycle_comment!(self, "program end at [{:05X}]", entry.addr);
                        if self.emulating() {
                            self.enter_emu_exit();
                        } else {
                            self.enter_state(ServerState::ExecuteDone);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn enter_emu_exit(&mut self) {
        let frame = assemble_writes(&self.emu_writes);
        if let Some(&base) = frame.keys().next() {
            let bytes: Vec<u8> = frame.values().copied().collect();
            self.data_image = Some((base, image_program("emu_frame", &bytes)));
        } else {
            log::warn!("No BRKEM frame was captured; RETEM will pop open bus");
        }
        self.program = InlineProgram::new("retem", &RETEM_PROGRAM).with_fill(OPCODE_NOPS80);
        self.enter_state(ServerState::EmuExit);
    }

    pub fn get_cpu_state_str(&self) -> String {
        let ale_str = if self.controller.ale() { "A:" } else { "  " };

        let seg_str = if self.config.family.uses_8288() && self.t_cycle != TCycle::T1 {
            match get_segment!(self.status_raw) {
                Segment::ES => "ES",
                Segment::SS => "SS",
                Segment::CS => "CS",
                Segment::DS => "DS",
            }
        } else {
            "  "
        };

        let lines = self.controller.lines();
        let chr = |on: bool, c: char| if on { c } else { '.' };

        let q_op_chr = match self.queue_op {
            QueueOp::Idle => ' ',
            QueueOp::First => 'F',
            QueueOp::Flush => 'E',
            QueueOp::Subsequent => 'S',
        };
        let q_read_str = match self.queue_op {
            QueueOp::First | QueueOp::Subsequent => format!("q-> {:02X}", self.queue_byte),
            _ => "      ".to_string(),
        };

        let mut xfer_str = "        ".to_string();
        if self.serviced && self.latched.is_active() {
            if self.latched.is_read() {
                xfer_str = format!("r-> {:04X}", self.data_bus);
            } else if self.latched.is_write() {
                xfer_str = format!("<-w {:04X}", self.data_bus);
            }
        }

        format!(
            "[{state:10}] {cycle:08} {ale}[{latch:05X}:{addr:05X}] {seg} M:{mr}{aw}{mw} I:{ir}{aiw}{iw} \
             P:{inta}{bhe} {bus} {t:2} {xfer:8} {qop}[{q:width$}] {qread} {comment}",
            state = format!("{:?}", self.state),
            cycle = self.cycle_num,
            ale = ale_str,
            latch = self.address_latch,
            addr = self.address_bus,
            seg = seg_str,
            mr = chr(lines.mrdc, 'R'),
            aw = chr(lines.amwc, 'A'),
            mw = chr(lines.mwtc, 'W'),
            ir = chr(lines.iorc, 'R'),
            aiw = chr(lines.aiowc, 'A'),
            iw = chr(lines.iowc, 'W'),
            inta = chr(lines.inta, 'A'),
            bhe = chr(self.bhe, 'B'),
            bus = self.status.short_str(),
            t = self.t_cycle.short_str(),
            xfer = xfer_str,
            qop = q_op_chr,
            q = self.queue.to_string(),
            width = self.queue.size() * 2,
            qread = q_read_str,
            comment = self.cycle_comment.as_deref().unwrap_or(""),
        )
    }
}

fn linear(segment: u16, offset: u16) -> u32 {
    ((segment as u32) << 4).wrapping_add(offset as u32)
}

fn image_program(name: &'static str, bytes: &[u8]) -> InlineProgram {
    InlineProgram::new(name, bytes).with_fill(0xFFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_threshold() {
        assert_eq!(classify_cpu(CpuWidth::Eight, 5), ServerCpuType::Intel8088);
        assert_eq!(classify_cpu(CpuWidth::Eight, 6), ServerCpuType::NecV20);
        assert_eq!(classify_cpu(CpuWidth::Sixteen, 5), ServerCpuType::Intel8086);
        assert_eq!(classify_cpu(CpuWidth::Sixteen, 6), ServerCpuType::NecV30);
        assert_eq!(classify_cpu(CpuWidth::Eight, 0), ServerCpuType::Intel8088);
    }

    #[test]
    fn test_cycle_state_bytes() {
        let state = CycleState {
            state: ServerState::Execute,
            control: 1,
            status: 0x04,
            command: 0xFE,
            data: 0xBEEF,
        };
        assert_eq!(
            state.to_bytes(),
            [ServerState::Execute as u8, 1, 0x04, 0xFE, 0xEF, 0xBE]
        );
    }
}
