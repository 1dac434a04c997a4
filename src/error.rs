use thiserror::Error;

use crate::instruction::ProgramId;
use crate::memory::MemoryError;
use crate::sync::SyncError;
use crate::thread::{ThreadId, WaitReason};

/// Failures that surface to the embedder from `step()`/`run()`.
///
/// Faults local to one guest thread (bad instruction, privilege violation,
/// division by zero, wild memory access) are not in here: they terminate the
/// offending thread, are recorded in the trace, and the VM keeps running.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("program {0} is not loaded")]
    UnknownProgram(ProgramId),
    #[error("thread {0} does not exist")]
    UnknownThread(ThreadId),
    #[error("cycle budget of {budget} exhausted after {executed} cycles; VM left paused")]
    ExecutionLimit { budget: u64, executed: u64 },
    #[error("deadlock: {} thread(s) waiting with nothing left to unblock them", .stuck.len())]
    Deadlock { stuck: Vec<(ThreadId, WaitReason)> },
    #[error("memory system fault")]
    Memory(#[from] MemoryError),
    #[error("synchronization manager inconsistency")]
    Sync(#[from] SyncError),
}
