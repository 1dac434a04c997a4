use anyhow::{bail, Context, Result};
use clap::{Arg, ArgAction, Command};

use parvm::{
    AluOp, Instruction, LoadSource, Op, Operand, Program, Register, ThreadOptions, Value,
    VirtualMachine, VmConfig, VmError,
};

/// Address of the shared counter the demo workers contend on.
const COUNTER: usize = 100;

fn cli() -> Command {
    Command::new("parvm")
        .about("Deterministic parallel VM emulator: contended-counter demo")
        .arg(
            Arg::new("processors")
                .long("processors")
                .short('p')
                .value_parser(clap::value_parser!(usize))
                .default_value("4")
                .help("Number of processor cores"),
        )
        .arg(
            Arg::new("threads")
                .long("threads")
                .short('t')
                .value_parser(clap::value_parser!(u32))
                .default_value("4")
                .help("Number of worker threads"),
        )
        .arg(
            Arg::new("iterations")
                .long("iterations")
                .short('n')
                .value_parser(clap::value_parser!(u32))
                .default_value("50")
                .help("Increments per worker"),
        )
        .arg(
            Arg::new("unlocked")
                .long("unlocked")
                .action(ArgAction::SetTrue)
                .help("Skip the lock around the counter (demonstrates race detection)"),
        )
        .arg(
            Arg::new("coherence")
                .long("coherence")
                .action(ArgAction::SetTrue)
                .help("Run with per-processor caches and the MESI bus"),
        )
        .arg(
            Arg::new("max-cycles")
                .long("max-cycles")
                .value_parser(clap::value_parser!(u64))
                .default_value("500000")
                .help("Cycle budget before giving up"),
        )
}

/// A worker that adds `iterations` increments to the shared counter,
/// guarding each increment with lock 0 unless `unlocked`.
fn counter_program(iterations: u32, unlocked: bool) -> Program {
    let counter = Operand::from(COUNTER as u32);
    let one = Operand::from(1);

    let mut code = vec![Instruction::new(Op::Load {
        dest: Register::R(2),
        src: LoadSource::Imm(Value(iterations)),
    })];

    let loop_top = code.len();
    if !unlocked {
        code.push(Instruction::new(Op::Lock { lock: Operand::from(0) }));
    }
    code.push(Instruction::new(Op::Load {
        dest: Register::R(1),
        src: LoadSource::Mem(counter),
    }));
    code.push(Instruction::new(Op::Alu {
        op: AluOp::Add,
        dest: Register::R(1),
        lhs: Operand::Reg(Register::R(1)),
        rhs: one,
    }));
    code.push(Instruction::new(Op::Store { src: Register::R(1), addr: counter }));
    if !unlocked {
        code.push(Instruction::new(Op::Unlock { lock: Operand::from(0) }));
    }
    code.push(Instruction::new(Op::Alu {
        op: AluOp::Sub,
        dest: Register::R(2),
        lhs: Operand::Reg(Register::R(2)),
        rhs: one,
    }));
    code.push(Instruction::new(Op::Jnz {
        cond: Register::R(2),
        target: Operand::from(loop_top as u32),
    }));
    code.push(Instruction::new(Op::Halt));

    Program::new("counter-worker", code)
}

fn main() -> Result<()> {
    let matches = cli().get_matches();

    let processors = *matches.get_one::<usize>("processors").unwrap();
    let threads = *matches.get_one::<u32>("threads").unwrap();
    let iterations = *matches.get_one::<u32>("iterations").unwrap();
    let unlocked = matches.get_flag("unlocked");
    let coherence = matches.get_flag("coherence");
    let max_cycles = *matches.get_one::<u64>("max-cycles").unwrap();

    let mut vm = VirtualMachine::new(VmConfig {
        num_processors: processors,
        enable_cache_coherence: coherence,
        ..VmConfig::default()
    });

    let program = vm
        .load_program(counter_program(iterations, unlocked))
        .context("loading the demo program")?;
    for _ in 0..threads {
        vm.create_thread_with(program, ThreadOptions::default())
            .context("creating a worker thread")?;
    }

    let cycles = match vm.run(Some(max_cycles)) {
        Ok(cycles) => cycles,
        Err(VmError::Deadlock { stuck }) => {
            bail!("deadlock after {} cycles: {stuck:?}", vm.global_clock());
        }
        Err(err) => return Err(err).context("running the VM"),
    };

    let counter = vm.peek_memory(COUNTER).context("reading the counter")?;
    let stats = vm.statistics();

    println!("finished in {cycles} cycles ({})", stats.state);
    println!(
        "counter = {counter} (expected {} from {threads} x {iterations})",
        u64::from(threads) * u64::from(iterations)
    );
    println!(
        "threads = {}, retired = {}, context switches = {}, utilization = {:.1}%",
        stats.threads, stats.instructions_retired, stats.context_switches,
        stats.processor_utilization
    );

    for lock in vm.lock_statistics() {
        println!(
            "lock {}: {} acquisitions, {} contended",
            lock.lock, lock.acquisitions, lock.contentions
        );
    }

    let races = vm.race_conditions();
    if races.is_empty() {
        println!("no races detected");
    } else {
        println!("{} race report(s):", races.len());
        for race in races.iter().take(5) {
            println!(
                "  {:?} at {:#x}: {} vs {}",
                race.kind, race.address, race.first.thread, race.second.thread
            );
        }
    }

    if let Some(bus) = vm.bus_statistics() {
        println!(
            "bus: {} requests ({} reads, {} write-backs, {} invalidations)",
            bus.total_requests, bus.read_requests, bus.write_requests,
            bus.invalidation_requests
        );
    }

    Ok(())
}
