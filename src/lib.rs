//! A deterministic parallel virtual machine emulator.
//!
//! The machine multiplexes logical threads over a fixed pool of processors
//! driven by one global clock. Each [`vm::VirtualMachine::step`] advances
//! every busy processor by exactly one instruction cycle in processor-id
//! order, which makes interleavings (and therefore races, contention and
//! deadlocks) reproducible for a given thread-creation order.
//!
//! Processors communicate with shared state exclusively through typed
//! [`processor::Effect`]s that the driver resolves against main memory, the
//! optional MESI-coherent cache hierarchy, and the synchronization manager.
//! Execution is observable through the typed trace, the race detector and
//! per-component statistics.

pub mod error;
pub mod instruction;
pub mod memory;
pub mod processor;
pub mod race;
pub mod register;
pub mod scheduler;
pub mod sync;
pub mod thread;
pub mod trace;
pub mod value;
pub mod vm;

pub use error::VmError;
pub use instruction::{Instruction, InstructionKind, LoadSource, Op, Operand, Program, ProgramId};
pub use memory::cache::{CacheConfig, MesiState};
pub use processor::alu::AluOp;
pub use processor::{Effect, Processor, ProcessorState};
pub use register::{Flag, PrivilegeLevel, Register, RegisterFile};
pub use sync::{BarrierId, LockId};
pub use thread::{Thread, ThreadId, ThreadState, WaitReason};
pub use trace::{EventKind, ExecutionEvent, TraceFilter};
pub use value::Value;
pub use vm::{ThreadOptions, VirtualMachine, VmConfig, VmState, VmStatistics};
