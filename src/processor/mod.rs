pub mod alu;

use std::fmt;

use byteyarn::{yarn, Yarn};
use smallvec::SmallVec;
use thiserror::Error;
use tracing::{debug, trace};

use crate::instruction::{Instruction, LoadSource, Op, Operand, WORD_SIZE};
use crate::register::{PrivilegeLevel, Register, RegisterError, RegisterFile};
use crate::sync::{BarrierId, LockId};
use crate::thread::ThreadId;
use crate::value::Value;

use self::alu::{AluError, AluOp};

/// States a processor can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// Not hosting a thread.
    Idle,
    /// Executing instructions.
    Running,
    /// The hosted thread asked to wait (join, yield); the VM detaches it.
    Waiting,
    /// Blocked on an external resource. Reserved.
    Blocked,
    /// The hosted thread halted; the VM frees the processor.
    Terminated,
}

/// A request the processor hands to the VM driver for resolution against
/// shared state. The driver matches on these exhaustively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Read the word at `addr` into `dest`.
    MemoryRead { addr: usize, dest: Register },
    /// Write `value` to `addr`.
    MemoryWrite { addr: usize, value: Value },
    /// Acquire a lock, blocking while it is held elsewhere.
    SyncLock { lock: LockId },
    /// Release a lock held by the executing thread.
    SyncUnlock { lock: LockId },
    /// Arrive at a barrier of `parties` threads.
    Barrier { barrier: BarrierId, parties: u32 },
    /// Full memory fence marker.
    Fence,
    /// Atomic compare-and-swap; the success flag (1/0) lands in `dest`.
    Cas { addr: usize, expected: Value, new: Value, dest: Register },
    /// Terminate the executing thread.
    Halt,
    /// Reschedule the executing thread at the back of the ready queue.
    Yield,
    /// Raise syscall `number`.
    Syscall { number: Value },
    /// Create a thread at `entry` with `arg` in its R0; id lands in `dest`.
    Spawn { entry: usize, arg: Value, dest: Register },
    /// Block until `target` terminates.
    Join { target: ThreadId },
    /// Read the return address at `addr` and transfer control to it.
    Return { addr: usize },
}

/// Outcome of one `execute_instruction` call.
#[derive(Debug)]
pub struct Execution {
    /// True exactly when the stall counter reached zero on this call.
    pub completed: bool,
    pub effects: SmallVec<[Effect; 2]>,
}

impl Execution {
    fn stalled() -> Self {
        Execution { completed: false, effects: SmallVec::new() }
    }
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("invalid instruction at pc {pc}")]
    InvalidInstruction {
        pc: usize,
        #[source]
        source: RegisterError,
    },
    #[error("`{instruction}` at pc {pc} requires {required} privilege, processor is at {actual}")]
    PrivilegeViolation {
        pc: usize,
        instruction: Yarn,
        required: PrivilegeLevel,
        actual: PrivilegeLevel,
    },
    #[error("processor fault at pc {pc}")]
    Fault {
        pc: usize,
        #[source]
        source: AluError,
    },
}

/// Kinds of recorded control-flow transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlowKind {
    Jump,
    ConditionalJump,
    Call,
    Syscall,
}

/// Append-only audit record of a control-flow transfer.
#[derive(Debug, Clone)]
pub struct ControlFlowRecord {
    pub from: usize,
    pub to: usize,
    pub kind: ControlFlowKind,
    pub instruction: Yarn,
    pub cycle: u64,
    /// Always true for transfers taken by the instruction set itself; kept
    /// for audits that inject transfers from outside it.
    pub legitimate: bool,
}

/// One execution core: a register file, a stall counter and the dispatch
/// logic that turns instructions into [`Effect`]s.
///
/// A processor is reused across threads; it holds a thread's registers only
/// between context-switch-in and context-switch-out.
#[derive(Debug)]
pub struct Processor {
    id: usize,
    registers: RegisterFile,
    state: ProcessorState,
    current_thread: Option<ThreadId>,
    stall_cycles: u32,
    cycle_count: u64,
    stalled_cycles_total: u64,
    privilege_enforcement: bool,
    control_flow: Vec<ControlFlowRecord>,
}

impl Processor {
    pub fn new(id: usize, privilege_enforcement: bool) -> Self {
        Processor {
            id,
            registers: RegisterFile::new(),
            state: ProcessorState::Idle,
            current_thread: None,
            stall_cycles: 0,
            cycle_count: 0,
            stalled_cycles_total: 0,
            privilege_enforcement,
            control_flow: Vec::new(),
        }
    }

    pub fn id(&self) -> usize { self.id }

    pub fn state(&self) -> ProcessorState { self.state }

    pub fn is_busy(&self) -> bool { self.state != ProcessorState::Idle }

    pub fn current_thread(&self) -> Option<ThreadId> { self.current_thread }

    pub fn registers(&self) -> &RegisterFile { &self.registers }

    pub fn registers_mut(&mut self) -> &mut RegisterFile { &mut self.registers }

    pub fn cycle_count(&self) -> u64 { self.cycle_count }

    pub fn stall_cycles(&self) -> u32 { self.stall_cycles }

    pub fn stalled_cycles_total(&self) -> u64 { self.stalled_cycles_total }

    pub fn control_flow_records(&self) -> &[ControlFlowRecord] { &self.control_flow }

    /// Context-switch-in: take ownership of a thread's register snapshot.
    pub fn begin_thread(&mut self, thread: ThreadId, registers: RegisterFile) {
        debug!("P{} <- {thread} @ pc {}", self.id, registers.pc());

        self.current_thread = Some(thread);
        self.registers = registers;
        self.state = ProcessorState::Running;
        self.stall_cycles = 0;
    }

    /// Clears a Waiting/Terminated dispatch verdict when the driver decided
    /// the thread keeps running (e.g. JOIN on an already-terminated target).
    pub fn resume_running(&mut self) {
        if self.current_thread.is_some() {
            self.state = ProcessorState::Running;
        }
    }

    /// Context-switch-out: release the hosted thread and hand its register
    /// snapshot back. The processor goes idle.
    pub fn park(&mut self) -> RegisterFile {
        if let Some(thread) = self.current_thread.take() {
            debug!("P{} -> {thread} parked @ pc {}", self.id, self.registers.pc());
        }

        self.state = ProcessorState::Idle;
        self.stall_cycles = 0;
        std::mem::take(&mut self.registers)
    }

    pub fn reset(&mut self) {
        self.registers.reset();
        self.state = ProcessorState::Idle;
        self.current_thread = None;
        self.stall_cycles = 0;
        self.cycle_count = 0;
        self.stalled_cycles_total = 0;
        self.control_flow.clear();
    }

    /// Executes one cycle of `instruction`.
    ///
    /// A fresh instruction is accepted by charging the cycle counter and
    /// arming the stall counter; the register/effect dispatch and the PC
    /// update run on the call where the stall counter reaches zero, so state
    /// moves only when `completed` comes back true.
    pub fn execute_instruction(
        &mut self,
        instruction: &Instruction,
    ) -> Result<Execution, ProcessorError> {
        if self.stall_cycles > 0 {
            self.stall_cycles -= 1;
            self.stalled_cycles_total += 1;
            if self.stall_cycles > 0 {
                return Ok(Execution::stalled());
            }

            let effects = self.dispatch(instruction)?;
            return Ok(Execution { completed: true, effects });
        }

        if self.privilege_enforcement
            && instruction.privileged
            && self.registers.privilege() < PrivilegeLevel::Kernel
        {
            return Err(ProcessorError::PrivilegeViolation {
                pc: self.registers.pc(),
                instruction: yarn!("{instruction}"),
                required: PrivilegeLevel::Kernel,
                actual: self.registers.privilege(),
            });
        }

        self.cycle_count += 1;
        self.stall_cycles = instruction.latency.saturating_sub(1);
        if self.stall_cycles > 0 {
            return Ok(Execution::stalled());
        }

        let effects = self.dispatch(instruction)?;
        Ok(Execution { completed: true, effects })
    }

    fn dispatch(
        &mut self,
        instruction: &Instruction,
    ) -> Result<SmallVec<[Effect; 2]>, ProcessorError> {
        let pc = self.registers.pc();
        let mut effects = SmallVec::new();
        let mut next_pc = pc + 1;

        match &instruction.op {
            Op::Alu { op, dest, lhs, rhs } => {
                let lhs = self.operand(*lhs)?;
                let rhs = self.operand(*rhs)?;
                let result = op
                    .eval(lhs, rhs)
                    .map_err(|source| ProcessorError::Fault { pc, source })?;

                self.write_register(*dest, result)?;
                for (flag, on) in AluOp::flags_for(result) {
                    self.registers.set_flag(flag, on);
                }
            }
            Op::Load { dest, src: LoadSource::Imm(value) } => {
                self.write_register(*dest, *value)?;
            }
            Op::Load { dest, src: LoadSource::Mem(addr) } => {
                let addr = self.operand(*addr)?.to_address();
                effects.push(Effect::MemoryRead { addr, dest: *dest });
            }
            Op::Store { src, addr } => {
                let value = self.read_register(*src)?;
                let addr = self.operand(*addr)?.to_address();
                effects.push(Effect::MemoryWrite { addr, value });
            }
            Op::Push { src } => {
                let value = self.read_register(*src)?;
                let sp = self.read_register(Register::Sp)?.wrapping_sub(Value(WORD_SIZE));
                self.write_register(Register::Sp, sp)?;
                effects.push(Effect::MemoryWrite { addr: sp.to_address(), value });
            }
            Op::Pop { dest } => {
                let sp = self.read_register(Register::Sp)?;
                effects.push(Effect::MemoryRead { addr: sp.to_address(), dest: *dest });
                self.write_register(Register::Sp, sp.wrapping_add(Value(WORD_SIZE)))?;
            }
            Op::Jmp { target } => {
                let target = self.operand(*target)?.to_address();
                self.record_control_flow(pc, target, ControlFlowKind::Jump, instruction);
                next_pc = target;
            }
            Op::Jz { cond, target } => {
                let cond = self.read_register(*cond)?;
                if cond == Value::ZERO {
                    let target = self.operand(*target)?.to_address();
                    self.record_control_flow(pc, target, ControlFlowKind::ConditionalJump, instruction);
                    next_pc = target;
                }
            }
            Op::Jnz { cond, target } => {
                let cond = self.read_register(*cond)?;
                if cond != Value::ZERO {
                    let target = self.operand(*target)?.to_address();
                    self.record_control_flow(pc, target, ControlFlowKind::ConditionalJump, instruction);
                    next_pc = target;
                }
            }
            Op::Call { target } => {
                let target = self.operand(*target)?.to_address();
                let return_addr = Value::from(pc + 1);
                let sp = self.read_register(Register::Sp)?.wrapping_sub(Value(WORD_SIZE));
                self.write_register(Register::Sp, sp)?;
                effects.push(Effect::MemoryWrite { addr: sp.to_address(), value: return_addr });
                self.record_control_flow(pc, target, ControlFlowKind::Call, instruction);
                next_pc = target;
            }
            Op::Ret => {
                let sp = self.read_register(Register::Sp)?;
                self.write_register(Register::Sp, sp.wrapping_add(Value(WORD_SIZE)))?;
                effects.push(Effect::Return { addr: sp.to_address() });
                // The driver sets the PC once the return address is read.
                next_pc = pc;
            }
            Op::Lock { lock } => {
                let lock = LockId(self.operand(*lock)?.0);
                effects.push(Effect::SyncLock { lock });
            }
            Op::Unlock { lock } => {
                let lock = LockId(self.operand(*lock)?.0);
                effects.push(Effect::SyncUnlock { lock });
            }
            Op::Fence => {
                effects.push(Effect::Fence);
            }
            Op::Cas { addr, expected, new, dest } => {
                let addr = self.operand(*addr)?.to_address();
                let expected = self.operand(*expected)?;
                let new = self.operand(*new)?;
                effects.push(Effect::Cas { addr, expected, new, dest: *dest });
            }
            Op::Barrier { barrier, parties } => {
                let barrier = BarrierId(self.operand(*barrier)?.0);
                let parties = self.operand(*parties)?.0;
                effects.push(Effect::Barrier { barrier, parties });
            }
            Op::Halt => {
                self.state = ProcessorState::Terminated;
                effects.push(Effect::Halt);
            }
            Op::Yield => {
                self.state = ProcessorState::Waiting;
                effects.push(Effect::Yield);
            }
            Op::Syscall { number } => {
                let number = self.operand(*number)?;
                self.record_control_flow(pc, pc + 1, ControlFlowKind::Syscall, instruction);
                effects.push(Effect::Syscall { number });
            }
            Op::Nop => {}
            Op::Spawn { entry, arg, dest } => {
                let entry = self.operand(*entry)?.to_address();
                let arg = self.operand(*arg)?;
                effects.push(Effect::Spawn { entry, arg, dest: *dest });
            }
            Op::Join { target } => {
                let target = ThreadId(self.operand(*target)?.0);
                self.state = ProcessorState::Waiting;
                effects.push(Effect::Join { target });
            }
        }

        self.registers.set_pc(next_pc);
        trace!("P{} {pc:0>5} -> {next_pc:0>5} {:>24}: {effects:?}", self.id, yarn!("{instruction}"));

        Ok(effects)
    }

    fn operand(&self, operand: Operand) -> Result<Value, ProcessorError> {
        match operand {
            Operand::Reg(register) => self.read_register(register),
            Operand::Imm(value) => Ok(value),
        }
    }

    fn read_register(&self, register: Register) -> Result<Value, ProcessorError> {
        self.registers.get(register).map_err(|source| ProcessorError::InvalidInstruction {
            pc: self.registers.pc(),
            source,
        })
    }

    fn write_register(&mut self, register: Register, value: Value) -> Result<(), ProcessorError> {
        self.registers.set(register, value).map_err(|source| {
            ProcessorError::InvalidInstruction { pc: self.registers.pc(), source }
        })
    }

    fn record_control_flow(
        &mut self,
        from: usize,
        to: usize,
        kind: ControlFlowKind,
        instruction: &Instruction,
    ) {
        self.control_flow.push(ControlFlowRecord {
            from,
            to,
            kind,
            instruction: yarn!("{instruction}"),
            cycle: self.cycle_count,
            legitimate: true,
        });
    }
}

impl fmt::Display for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}[{:?}]", self.id, self.state)
    }
}
