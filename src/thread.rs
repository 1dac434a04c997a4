use std::fmt;

use crate::instruction::ProgramId;
use crate::register::RegisterFile;
use crate::sync::{BarrierId, LockId};
use crate::value::Value;

/// Identifier of a logical thread. Allocated sequentially by the VM so that
/// runs replay deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Why a waiting thread is parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// Blocked acquiring a held lock.
    Lock(LockId),
    /// Arrived at a barrier that has not tripped yet.
    Barrier(BarrierId),
    /// Joining a thread that has not terminated yet.
    Join(ThreadId),
}

impl fmt::Display for WaitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitReason::Lock(lock) => write!(f, "lock {lock}"),
            WaitReason::Barrier(barrier) => write!(f, "barrier {barrier}"),
            WaitReason::Join(thread) => write!(f, "join {thread}"),
        }
    }
}

/// Lifecycle states of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// In the ready queue, runnable.
    Ready,
    /// Scheduled onto a processor.
    Running,
    /// Parked until an explicit unblock.
    Waiting(WaitReason),
    /// Halted, faulted, or ran off the end of its program. Terminal.
    Terminated,
}

impl ThreadState {
    pub fn is_terminated(self) -> bool {
        matches!(self, ThreadState::Terminated)
    }

    pub fn is_waiting(self) -> bool {
        matches!(self, ThreadState::Waiting(_))
    }
}

/// A logical thread.
///
/// The register snapshot (including the PC) is authoritative only while the
/// thread is off-processor; while scheduled, the hosting processor holds the
/// live copy and the snapshot is refreshed when the thread is detached.
#[derive(Debug, Clone)]
pub struct Thread {
    pub id: ThreadId,
    pub program: ProgramId,
    pub registers: RegisterFile,
    /// Shadow of the memory-backed stack, maintained by the VM on
    /// PUSH/POP/CALL/RET so a thread's stack can be inspected without
    /// walking memory.
    pub stack: Vec<Value>,
    pub state: ThreadState,
    pub processor: Option<usize>,
    pub parent: Option<ThreadId>,
    /// Higher runs first; ties resolve in arrival order.
    pub priority: i32,
    pub created_at: u64,
    pub execution_cycles: u64,
}

impl Thread {
    pub fn new(id: ThreadId, program: ProgramId, entry_point: usize, created_at: u64) -> Self {
        let mut registers = RegisterFile::new();
        registers.set_pc(entry_point);

        Thread {
            id,
            program,
            registers,
            stack: Vec::new(),
            state: ThreadState::Ready,
            processor: None,
            parent: None,
            priority: 0,
            created_at,
            execution_cycles: 0,
        }
    }

    pub fn with_parent(mut self, parent: ThreadId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_registers(mut self, registers: RegisterFile) -> Self {
        let pc = self.registers.pc();
        self.registers = registers;
        self.registers.set_pc(pc);
        self
    }
}
