use parvm::{
    AluOp, Instruction, LoadSource, Op, Operand, Program, Register, ThreadId, ThreadOptions,
    ThreadState, TraceFilter, Value, VirtualMachine, VmConfig, VmError, VmState,
};

fn vm(num_processors: usize) -> VirtualMachine {
    VirtualMachine::new(VmConfig { num_processors, ..VmConfig::default() })
}

fn load_imm(dest: Register, value: u32) -> Instruction {
    Instruction::new(Op::Load { dest, src: LoadSource::Imm(Value(value)) })
}

fn load_mem(dest: Register, addr: u32) -> Instruction {
    Instruction::new(Op::Load { dest, src: LoadSource::Mem(Operand::from(addr)) })
}

fn store(src: Register, addr: u32) -> Instruction {
    Instruction::new(Op::Store { src, addr: Operand::from(addr) })
}

fn alu(op: AluOp, dest: Register, lhs: Register, rhs: Operand) -> Instruction {
    Instruction::new(Op::Alu { op, dest, lhs: Operand::Reg(lhs), rhs })
}

fn halt() -> Instruction {
    Instruction::new(Op::Halt)
}

#[test]
fn single_thread_computes_and_finishes() {
    let mut vm = vm(2);
    let program = vm
        .load_program(Program::new(
            "mul",
            vec![
                load_imm(Register::R(0), 6),
                load_imm(Register::R(1), 7),
                alu(AluOp::Mul, Register::R(2), Register::R(0), Operand::Reg(Register::R(1))),
                store(Register::R(2), 10),
                halt(),
            ],
        ))
        .unwrap();
    let thread = vm.create_thread(program).unwrap();

    vm.run(Some(1_000)).unwrap();

    assert_eq!(vm.state(), VmState::Finished);
    assert_eq!(vm.peek_memory(10).unwrap(), Value(42));
    assert_eq!(vm.thread(thread).unwrap().state, ThreadState::Terminated);
    assert_eq!(vm.statistics().instructions_retired, 5);
}

#[test]
fn multi_cycle_instruction_charges_latency() {
    let mut vm = vm(1);
    let program = vm
        .load_program(Program::new(
            "slow",
            vec![Instruction::new(Op::Nop).with_latency(4), halt()],
        ))
        .unwrap();
    let thread = vm.create_thread(program).unwrap();

    vm.run(Some(100)).unwrap();

    // Four cycles spent on the NOP, one on HALT.
    assert_eq!(vm.thread(thread).unwrap().execution_cycles, 5);
    assert_eq!(vm.statistics().instructions_retired, 2);
}

#[test]
fn spawn_and_join_order_parent_after_child() {
    let mut vm = vm(2);
    let program = vm
        .load_program(Program::new(
            "spawn-join",
            vec![
                // parent
                Instruction::new(Op::Spawn {
                    entry: Operand::from(5),
                    arg: Operand::from(0),
                    dest: Register::R(3),
                }),
                Instruction::new(Op::Join { target: Operand::Reg(Register::R(3)) }),
                load_mem(Register::R(1), 20),
                store(Register::R(1), 21),
                halt(),
                // child
                load_imm(Register::R(0), 99),
                store(Register::R(0), 20),
                halt(),
            ],
        ))
        .unwrap();
    vm.create_thread(program).unwrap();

    vm.run(Some(1_000)).unwrap();

    assert_eq!(vm.statistics().threads, 2);
    assert_eq!(vm.peek_memory(20).unwrap(), Value(99));
    assert_eq!(vm.peek_memory(21).unwrap(), Value(99));
    // Join established an order, so the parent's read is not a race.
    assert!(vm.race_conditions().is_empty());
}

#[test]
fn context_switches_preserve_registers() {
    let mut vm = vm(1);
    let program = vm
        .load_program(Program::new(
            "two-lanes",
            vec![
                // lane A (entry 0)
                load_imm(Register::R(5), 11),
                Instruction::new(Op::Yield),
                store(Register::R(5), 40),
                halt(),
                // lane B (entry 4)
                load_imm(Register::R(5), 22),
                Instruction::new(Op::Yield),
                store(Register::R(5), 41),
                halt(),
            ],
        ))
        .unwrap();
    vm.create_thread(program).unwrap();
    vm.create_thread_with(program, ThreadOptions { entry_point: Some(4), ..Default::default() })
        .unwrap();

    vm.run(Some(1_000)).unwrap();

    assert_eq!(vm.peek_memory(40).unwrap(), Value(11));
    assert_eq!(vm.peek_memory(41).unwrap(), Value(22));
    assert!(vm.statistics().context_switches >= 3);
}

#[test]
fn call_and_ret_use_the_stack() {
    let mut vm = vm(1);
    let program = vm
        .load_program(Program::new(
            "call",
            vec![
                load_imm(Register::Sp, 64),
                Instruction::new(Op::Call { target: Operand::from(4) }),
                store(Register::R(0), 30),
                halt(),
                load_imm(Register::R(0), 7),
                Instruction::new(Op::Ret),
            ],
        ))
        .unwrap();
    let thread = vm.create_thread(program).unwrap();

    vm.run(Some(1_000)).unwrap();

    assert_eq!(vm.peek_memory(30).unwrap(), Value(7));
    // The return address was pushed and popped again.
    assert!(vm.thread(thread).unwrap().stack.is_empty());
}

#[test]
fn cas_reports_success_in_dest_register() {
    let mut vm = vm(1);
    let program = vm
        .load_program(Program::new(
            "cas",
            vec![
                Instruction::new(Op::Cas {
                    addr: Operand::from(50),
                    expected: Operand::from(0),
                    new: Operand::from(1),
                    dest: Register::R(1),
                }),
                Instruction::new(Op::Cas {
                    addr: Operand::from(50),
                    expected: Operand::from(0),
                    new: Operand::from(2),
                    dest: Register::R(2),
                }),
                halt(),
            ],
        ))
        .unwrap();
    let thread = vm.create_thread(program).unwrap();

    vm.run(Some(100)).unwrap();

    assert_eq!(vm.peek_memory(50).unwrap(), Value(1));
    let registers = &vm.thread(thread).unwrap().registers;
    assert_eq!(registers.get(Register::R(1)).unwrap(), Value(1));
    assert_eq!(registers.get(Register::R(2)).unwrap(), Value(0));
}

#[test]
fn faulting_thread_dies_alone() {
    let mut vm = vm(2);
    let program = vm
        .load_program(Program::new(
            "mixed",
            vec![
                // divides by zero (entry 0)
                alu(AluOp::Div, Register::R(0), Register::R(1), Operand::from(0)),
                halt(),
                // healthy (entry 2)
                load_imm(Register::R(0), 5),
                store(Register::R(0), 60),
                halt(),
            ],
        ))
        .unwrap();
    let faulty = vm.create_thread(program).unwrap();
    let healthy = vm
        .create_thread_with(program, ThreadOptions { entry_point: Some(2), ..Default::default() })
        .unwrap();

    vm.run(Some(1_000)).unwrap();

    assert_eq!(vm.state(), VmState::Finished);
    assert_eq!(vm.thread(faulty).unwrap().state, ThreadState::Terminated);
    assert_eq!(vm.thread(healthy).unwrap().state, ThreadState::Terminated);
    assert_eq!(vm.peek_memory(60).unwrap(), Value(5));

    let terminations = vm.trace_query(&TraceFilter::new().kind("thread_terminated"));
    assert_eq!(terminations.len(), 2);
}

#[test]
fn privilege_violation_terminates_the_thread() {
    let mut vm = vm(1);
    let program = vm
        .load_program(Program::new(
            "forbidden",
            vec![
                Instruction::new(Op::Syscall { number: Operand::from(1) }).privileged(),
                store(Register::R(0), 70),
                halt(),
            ],
        ))
        .unwrap();
    let thread = vm.create_thread(program).unwrap();

    vm.run(Some(100)).unwrap();

    assert_eq!(vm.state(), VmState::Finished);
    assert_eq!(vm.thread(thread).unwrap().state, ThreadState::Terminated);
    // The store after the violation never ran.
    assert_eq!(vm.peek_memory(70).unwrap(), Value(0));
}

#[test]
fn cycle_budget_exhaustion_pauses_the_vm() {
    let mut vm = vm(1);
    let program = vm
        .load_program(Program::new(
            "spin",
            vec![Instruction::new(Op::Jmp { target: Operand::from(0) })],
        ))
        .unwrap();
    vm.create_thread(program).unwrap();

    match vm.run(Some(50)) {
        Err(VmError::ExecutionLimit { budget: 50, executed }) => assert_eq!(executed, 50),
        other => panic!("expected execution limit, got {other:?}"),
    }
    assert_eq!(vm.state(), VmState::Paused);

    // Paused, not dead: stepping resumes.
    assert!(vm.step().unwrap());
}

#[test]
fn opposite_lock_order_deadlocks_and_is_reported() {
    let mut vm = vm(2);
    let program = vm
        .load_program(Program::new(
            "ab-ba",
            vec![
                // entry 0: lock 0 then 1
                Instruction::new(Op::Lock { lock: Operand::from(0) }),
                Instruction::new(Op::Lock { lock: Operand::from(1) }),
                halt(),
                // entry 3: lock 1 then 0
                Instruction::new(Op::Lock { lock: Operand::from(1) }),
                Instruction::new(Op::Lock { lock: Operand::from(0) }),
                halt(),
            ],
        ))
        .unwrap();
    let t0 = vm.create_thread(program).unwrap();
    let t1 = vm
        .create_thread_with(program, ThreadOptions { entry_point: Some(3), ..Default::default() })
        .unwrap();

    match vm.run(Some(1_000)) {
        Err(VmError::Deadlock { stuck }) => {
            let threads: Vec<ThreadId> = stuck.iter().map(|(thread, _)| *thread).collect();
            assert_eq!(threads, vec![t0, t1]);
        }
        other => panic!("expected deadlock, got {other:?}"),
    }
    assert_eq!(vm.state(), VmState::Paused);

    let reported = vm.trace_query(&TraceFilter::new().kind("deadlock_detected"));
    assert_eq!(reported.len(), 1);
}

#[test]
fn higher_priority_thread_is_scheduled_first() {
    let mut vm = vm(1);
    let program = vm
        .load_program(Program::new("noop", vec![halt()]))
        .unwrap();
    let _low = vm.create_thread(program).unwrap();
    let high = vm
        .create_thread_with(program, ThreadOptions { priority: 10, ..Default::default() })
        .unwrap();

    vm.run(Some(100)).unwrap();

    let scheduled = vm.trace_query(&TraceFilter::new().kind("thread_scheduled"));
    assert_eq!(scheduled[0].kind.thread(), Some(high));
}

#[test]
fn reset_restores_initial_state_and_data_segment() {
    let mut vm = vm(2);
    let program = vm
        .load_program(
            Program::new(
                "data",
                vec![
                    load_mem(Register::R(0), 80),
                    alu(AluOp::Add, Register::R(0), Register::R(0), Operand::from(1)),
                    store(Register::R(0), 80),
                    halt(),
                ],
            )
            .with_data(80, Value(5)),
        )
        .unwrap();
    vm.create_thread(program).unwrap();
    vm.run(Some(100)).unwrap();
    assert_eq!(vm.peek_memory(80).unwrap(), Value(6));

    vm.reset().unwrap();

    assert_eq!(vm.state(), VmState::Idle);
    assert_eq!(vm.global_clock(), 0);
    assert_eq!(vm.statistics().threads, 0);
    assert!(vm.execution_trace().is_empty());
    assert_eq!(vm.peek_memory(80).unwrap(), Value(5));

    // The program table survives a reset.
    vm.create_thread(program).unwrap();
    vm.run(Some(100)).unwrap();
    assert_eq!(vm.peek_memory(80).unwrap(), Value(6));
}

#[test]
fn joining_a_nonexistent_thread_surfaces_an_error() {
    let mut vm = vm(1);
    let program = vm
        .load_program(Program::new(
            "bad-join",
            vec![Instruction::new(Op::Join { target: Operand::from(999) }), halt()],
        ))
        .unwrap();
    vm.create_thread(program).unwrap();

    match vm.run(Some(100)) {
        Err(VmError::UnknownThread(ThreadId(999))) => {}
        other => panic!("expected unknown-thread error, got {other:?}"),
    }
}
