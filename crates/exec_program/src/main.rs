use std::path::PathBuf;

use clap::Parser;

use ardx86_server::ardx86_common::{ServerError, ServerState};
use ardx86_server::*;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // CPU model to simulate: 8088, 8086, v20, v30, 80188, 80186, 286 or 386.
    #[arg(long, default_value = "8088")]
    cpu: SimModel,

    // Filename of the 28-byte register file to load.
    #[arg(long, required(true))]
    reg_file: PathBuf,

    // Filename of the binary image to execute.
    #[arg(long, required(true))]
    bin_file: PathBuf,

    // Address in memory to mount the bin file, in hex. This should typically
    // match the address specified by CS:IP, but doesn't have to...
    #[arg(long, required(true))]
    mount_addr: String,

    // Number of wait states for every bus transfer.
    #[arg(long, default_value_t = 0)]
    wait_states: u32,

    // How to end the program: auto, queue or nmi.
    #[arg(long, default_value = "auto")]
    end: EndStrategy,

    // Enter 8080 emulation mode. Must have a compatible CPU such as a V20/V30.
    #[arg(long, default_value_t = false)]
    emu8080: bool,

    // Fill the prefetch queue before executing code.
    #[arg(long, default_value_t = false)]
    prefetch: bool,

    // Finalize on the first jump the program takes.
    #[arg(long, default_value_t = false)]
    halt_after_jump: bool,

    // Run until the program executes HLT instead of for a fixed number of cycles.
    #[arg(long, default_value_t = false)]
    run: bool,

    // Cycles to execute before finalizing when not in --run mode.
    #[arg(long, default_value_t = 1000)]
    cycles: u32,

    // Fill memory with random data before mounting the binary.
    #[arg(long, default_value_t = false)]
    random_mem: bool,

    // Print the bus operations the program performed.
    #[arg(long, default_value_t = false)]
    print_log: bool,
}

fn mark(changed: bool) -> &'static str {
    if changed {
        "*"
    } else {
        " "
    }
}

fn print_regs_delta(initial: &Registers, regs: &Registers) {
    println!(
        "AX:{}{:04X} BX:{}{:04X} CX:{}{:04X} DX:{}{:04X}\n\
         SP:{}{:04X} BP:{}{:04X} SI:{}{:04X} DI:{}{:04X}\n\
         CS:{}{:04X} DS:{}{:04X} ES:{}{:04X} SS:{}{:04X}\n\
         IP:{}{:04X}\n\
         FLAGS:{}{:04X} {}",
        mark(initial.ax != regs.ax),
        regs.ax,
        mark(initial.bx != regs.bx),
        regs.bx,
        mark(initial.cx != regs.cx),
        regs.cx,
        mark(initial.dx != regs.dx),
        regs.dx,
        mark(initial.sp != regs.sp),
        regs.sp,
        mark(initial.bp != regs.bp),
        regs.bp,
        mark(initial.si != regs.si),
        regs.si,
        mark(initial.di != regs.di),
        regs.di,
        mark(initial.cs != regs.cs),
        regs.cs,
        mark(initial.ds != regs.ds),
        regs.ds,
        mark(initial.es != regs.es),
        regs.es,
        mark(initial.ss != regs.ss),
        regs.ss,
        mark(initial.ip != regs.ip),
        regs.ip,
        mark(initial.flags != regs.flags),
        regs.flags,
        regs.flags_str(),
    );
}

/// Execute the loaded program and bring the server to ExecuteDone.
fn execute(server: &mut CpuServer<SimCpu>, args: &Args) -> Result<(), ServerError> {
    if args.run {
        let cycles = server.run(0)?;
        log::debug!("Program halted after {} cycles", cycles);
        return Ok(());
    }

    for _ in 0..args.cycles {
        if server.state() != ServerState::Execute {
            break;
        }
        server.cycle()?;
    }
    if server.state() == ServerState::Execute {
        server.finalize()?;
    }
    // A jump may have started finalization on its own.
    let budget = server.config().timeouts.finalize;
    for _ in 0..budget {
        if server.state() == ServerState::ExecuteDone {
            break;
        }
        server.cycle()?;
    }
    if server.state() != ServerState::ExecuteDone {
        return Err(ServerError::PhaseTimeout {
            phase: ServerState::ExecuteFinalize,
            cycles: budget,
        });
    }
    Ok(())
}

fn exec(args: &Args, initial_regs: Registers, bin_bytes: &[u8], mount_addr: u32) -> Result<Registers, ServerError> {
    let mut config = ServerConfig {
        family: args.cpu.family(),
        wait_states: args.wait_states,
        end_strategy: args.end,
        ..ServerConfig::default()
    }
    .automatic();
    if args.halt_after_jump {
        config.flags |= ardx86_server::ardx86_common::FLAG_HALT_AFTER_JUMP;
    }

    let mut server = CpuServer::new(SimCpu::new(args.cpu), config);

    if args.random_mem {
        let seed: u32 = rand::random();
        log::debug!("Randomizing memory with seed {:08X}", seed);
        server.randomize_memory(seed);
    }

    let reset = server.reset()?;
    println!(
        "Detected CPU type: {:?} ({:?} bus, queue status: {})",
        server.cpu_type(),
        reset.width,
        reset.queue_status
    );

    log::debug!("Mounting program code at: {:05X}", mount_addr);
    server.set_memory(mount_addr, bin_bytes)?;

    if args.emu8080 {
        server.enable_emulation()?;
    }
    if args.prefetch {
        server.enable_prefetch()?;
    }

    server.load(RegisterBlock::V1(initial_regs))?;
    log::trace!("Successfully set up registers!");
    server.bus_mut().clear_log();

    execute(&mut server, args)?;

    if args.print_log {
        println!("Bus operations:");
        for op in server.bus().log().iter() {
            println!(
                "  {:<6} [{:06X}] {:04X} {:?}",
                op.kind.short_str(),
                op.address,
                op.data,
                op.width
            );
        }
    }
    for frame in server.bus().far_call_frames() {
        println!(
            "Far call frame: {:04X}:{:04X} flags: {:04X}",
            frame.cs, frame.ip, frame.flags
        );
    }

    server.begin_store()?;
    match server.store()? {
        RegisterBlock::V1(regs) => {
            println!("Program ran for {} cycles.", server.cycle_num());
            Ok(regs)
        }
        other => Err(ServerError::InvalidRegisterFormat(format!(
            "unexpected {:?} registers from store",
            other.format()
        ))),
    }
}

fn main() {
    env_logger::init();

    let args = Args::parse();

    let reg_bytes = std::fs::read(&args.reg_file).unwrap_or_else(|e| {
        eprintln!("Couldn't read register file {:?}: {}", args.reg_file, e);
        std::process::exit(1);
    });

    let bin_bytes = std::fs::read(&args.bin_file).unwrap_or_else(|e| {
        eprintln!("Couldn't read binary file {:?}: {}", args.bin_file, e);
        std::process::exit(1);
    });

    let mount_addr = u32::from_str_radix(&args.mount_addr, 16).unwrap_or_else(|e| {
        eprintln!(
            "Couldn't parse code mount address '{}': {}",
            args.mount_addr, e
        );
        std::process::exit(1);
    });

    let initial_regs = Registers::from_bytes(&reg_bytes).unwrap_or_else(|e| {
        eprintln!("Bad register file {:?}: {}", args.reg_file, e);
        std::process::exit(1);
    });

    println!("Initial register state:");
    println!("{}", initial_regs);

    match exec(&args, initial_regs, &bin_bytes, mount_addr) {
        Ok(regs) => {
            println!("Final register state:");
            print_regs_delta(&initial_regs, &regs);
        }
        Err(e) => {
            log::error!("Program execution failed!");
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
