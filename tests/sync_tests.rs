use parvm::{
    AluOp, Instruction, LoadSource, Op, Operand, Program, Register, ThreadOptions, ThreadState,
    TraceFilter, Value, VirtualMachine, VmConfig,
};

const COUNTER: u32 = 100;

fn vm(num_processors: usize) -> VirtualMachine {
    VirtualMachine::new(VmConfig { num_processors, ..VmConfig::default() })
}

/// Worker that adds `iterations` increments to the shared counter, guarding
/// each one with lock 0 unless `unlocked`.
fn counter_program(iterations: u32, unlocked: bool) -> Program {
    let mut code = vec![Instruction::new(Op::Load {
        dest: Register::R(2),
        src: LoadSource::Imm(Value(iterations)),
    })];

    let loop_top = code.len() as u32;
    if !unlocked {
        code.push(Instruction::new(Op::Lock { lock: Operand::from(0) }));
    }
    code.push(Instruction::new(Op::Load {
        dest: Register::R(1),
        src: LoadSource::Mem(Operand::from(COUNTER)),
    }));
    code.push(Instruction::new(Op::Alu {
        op: AluOp::Add,
        dest: Register::R(1),
        lhs: Operand::Reg(Register::R(1)),
        rhs: Operand::from(1),
    }));
    code.push(Instruction::new(Op::Store {
        src: Register::R(1),
        addr: Operand::from(COUNTER),
    }));
    if !unlocked {
        code.push(Instruction::new(Op::Unlock { lock: Operand::from(0) }));
    }
    code.push(Instruction::new(Op::Alu {
        op: AluOp::Sub,
        dest: Register::R(2),
        lhs: Operand::Reg(Register::R(2)),
        rhs: Operand::from(1),
    }));
    code.push(Instruction::new(Op::Jnz {
        cond: Register::R(2),
        target: Operand::from(loop_top),
    }));
    code.push(Instruction::new(Op::Halt));

    Program::new("counter", code)
}

#[test]
fn locked_counter_is_exact_under_contention() {
    let mut vm = vm(4);
    let program = vm.load_program(counter_program(10, false)).unwrap();
    for _ in 0..4 {
        vm.create_thread(program).unwrap();
    }

    vm.run(Some(100_000)).unwrap();

    assert_eq!(vm.peek_memory(COUNTER as usize).unwrap(), Value(40));
    assert!(vm.race_conditions().is_empty());
    for thread in vm.threads() {
        assert_eq!(thread.state, ThreadState::Terminated);
    }

    // One lock, contended: every acquisition eventually succeeded.
    let locks = vm.lock_statistics();
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].waiting, 0);
    assert!(locks[0].holder.is_none());
    assert!(locks[0].acquisitions >= 40);
}

#[test]
fn unlocked_counter_races_are_detected() {
    let mut vm = vm(4);
    let program = vm.load_program(counter_program(5, true)).unwrap();
    for _ in 0..4 {
        vm.create_thread(program).unwrap();
    }

    vm.run(Some(100_000)).unwrap();

    assert!(!vm.race_conditions().is_empty());
    assert!(vm.shared_addresses().contains(&(COUNTER as usize)));
}

#[test]
fn lock_waiters_are_served_fifo() {
    // One processor plus a yield inside the critical section forces a
    // deterministic blocking order: T0 takes the lock, then T1 and T2 queue
    // behind it in schedule order.
    let mut vm = vm(1);
    let program = vm
        .load_program(Program::new(
            "handoff",
            vec![
                Instruction::new(Op::Lock { lock: Operand::from(0) }),
                Instruction::new(Op::Yield),
                Instruction::new(Op::Unlock { lock: Operand::from(0) }),
                Instruction::new(Op::Halt),
            ],
        ))
        .unwrap();
    let t0 = vm.create_thread(program).unwrap();
    let t1 = vm.create_thread(program).unwrap();
    let t2 = vm.create_thread(program).unwrap();

    vm.run(Some(10_000)).unwrap();

    for thread in vm.threads() {
        assert_eq!(thread.state, ThreadState::Terminated);
    }

    // Ownership moves to the longest-waiting thread on every release.
    let acquired: Vec<_> = vm
        .trace_query(&TraceFilter::new().kind("lock_acquired"))
        .iter()
        .filter_map(|event| event.kind.thread())
        .collect();
    assert_eq!(acquired, vec![t0, t1, t2]);
}

#[test]
fn barrier_releases_all_parties_and_is_reusable() {
    let mut vm = vm(4);
    let mut code = Vec::new();
    // Two barrier generations back to back.
    code.push(Instruction::new(Op::Barrier {
        barrier: Operand::from(0),
        parties: Operand::from(3),
    }));
    code.push(Instruction::new(Op::Barrier {
        barrier: Operand::from(0),
        parties: Operand::from(3),
    }));
    code.push(Instruction::new(Op::Halt));
    let program = vm.load_program(Program::new("rendezvous", code)).unwrap();
    for _ in 0..3 {
        vm.create_thread(program).unwrap();
    }

    vm.run(Some(10_000)).unwrap();

    for thread in vm.threads() {
        assert_eq!(thread.state, ThreadState::Terminated);
    }

    let tripped = vm.trace_query(&TraceFilter::new().kind("barrier_tripped"));
    assert_eq!(tripped.len(), 2);

    // Every trip released all three parties.
    for event in tripped {
        match &event.kind {
            parvm::EventKind::BarrierTripped { released, .. } => assert_eq!(released.len(), 3),
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[test]
fn terminating_holder_frees_its_lock() {
    let mut vm = vm(1);
    let program = vm
        .load_program(Program::new(
            "die-holding",
            vec![
                // entry 0: take the lock, let the other thread block on it,
                // then halt without releasing
                Instruction::new(Op::Lock { lock: Operand::from(0) }),
                Instruction::new(Op::Yield),
                Instruction::new(Op::Halt),
                // entry 3: take the lock, prove it, release, halt
                Instruction::new(Op::Lock { lock: Operand::from(0) }),
                Instruction::new(Op::Load { dest: Register::R(0), src: LoadSource::Imm(Value(1)) }),
                Instruction::new(Op::Store { src: Register::R(0), addr: Operand::from(90) }),
                Instruction::new(Op::Unlock { lock: Operand::from(0) }),
                Instruction::new(Op::Halt),
            ],
        ))
        .unwrap();
    vm.create_thread(program).unwrap();
    vm.create_thread_with(program, ThreadOptions { entry_point: Some(3), ..Default::default() })
        .unwrap();

    // Must finish: the dying holder's lock is released deterministically.
    vm.run(Some(10_000)).unwrap();

    assert_eq!(vm.peek_memory(90).unwrap(), Value(1));
    let locks = vm.lock_statistics();
    assert!(locks[0].holder.is_none());
}

#[test]
fn fence_is_traced() {
    let mut vm = vm(1);
    let program = vm
        .load_program(Program::new(
            "fence",
            vec![Instruction::new(Op::Fence), Instruction::new(Op::Halt)],
        ))
        .unwrap();
    vm.create_thread(program).unwrap();

    vm.run(Some(100)).unwrap();

    assert_eq!(vm.trace_query(&TraceFilter::new().kind("memory_fence")).len(), 1);
}
