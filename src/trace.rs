use byteyarn::Yarn;

use crate::sync::{BarrierId, LockId};
use crate::thread::ThreadId;
use crate::value::Value;

/// Why a parked thread became runnable again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnblockReason {
    LockGranted(LockId),
    BarrierReleased(BarrierId),
    JoinCompleted(ThreadId),
}

/// Everything the VM can put in its execution trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    VmStarted,
    VmPaused,
    VmFinished,
    ThreadCreated { thread: ThreadId, parent: Option<ThreadId>, entry: usize },
    ThreadScheduled { thread: ThreadId, processor: usize },
    ContextSwitch { thread: ThreadId, processor: usize },
    InstructionRetired { thread: ThreadId, processor: usize, pc: usize, instruction: Yarn },
    MemoryRead { thread: ThreadId, processor: usize, address: usize, value: Value },
    MemoryWrite { thread: ThreadId, processor: usize, address: usize, value: Value },
    MemoryFence { thread: ThreadId, processor: usize },
    CasResolved {
        thread: ThreadId,
        processor: usize,
        address: usize,
        expected: Value,
        new: Value,
        success: bool,
    },
    LockAcquired { thread: ThreadId, lock: LockId },
    LockBlocked { thread: ThreadId, lock: LockId, holder: ThreadId },
    LockReleased { thread: ThreadId, lock: LockId, handed_to: Option<ThreadId> },
    BarrierWaiting { thread: ThreadId, barrier: BarrierId, waiting: u32, needed: u32 },
    BarrierTripped { thread: ThreadId, barrier: BarrierId, generation: u64, released: Vec<ThreadId> },
    ThreadYielded { thread: ThreadId, processor: usize },
    ThreadUnblocked { thread: ThreadId, reason: UnblockReason },
    ThreadTerminated { thread: ThreadId, fault: Option<Yarn> },
    JoinWait { thread: ThreadId, target: ThreadId },
    Syscall { thread: ThreadId, processor: usize, number: Value },
    DeadlockDetected { threads: Vec<ThreadId> },
}

impl EventKind {
    /// Stable label, usable as a query key.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::VmStarted => "vm_started",
            EventKind::VmPaused => "vm_paused",
            EventKind::VmFinished => "vm_finished",
            EventKind::ThreadCreated { .. } => "thread_created",
            EventKind::ThreadScheduled { .. } => "thread_scheduled",
            EventKind::ContextSwitch { .. } => "context_switch",
            EventKind::InstructionRetired { .. } => "instruction_retired",
            EventKind::MemoryRead { .. } => "memory_read",
            EventKind::MemoryWrite { .. } => "memory_write",
            EventKind::MemoryFence { .. } => "memory_fence",
            EventKind::CasResolved { .. } => "cas_operation",
            EventKind::LockAcquired { .. } => "lock_acquired",
            EventKind::LockBlocked { .. } => "lock_blocked",
            EventKind::LockReleased { .. } => "lock_released",
            EventKind::BarrierWaiting { .. } => "barrier_waiting",
            EventKind::BarrierTripped { .. } => "barrier_tripped",
            EventKind::ThreadYielded { .. } => "thread_yielded",
            EventKind::ThreadUnblocked { .. } => "thread_unblocked",
            EventKind::ThreadTerminated { .. } => "thread_terminated",
            EventKind::JoinWait { .. } => "thread_join_wait",
            EventKind::Syscall { .. } => "syscall",
            EventKind::DeadlockDetected { .. } => "deadlock_detected",
        }
    }

    /// The thread the event concerns, when there is one.
    pub fn thread(&self) -> Option<ThreadId> {
        match self {
            EventKind::ThreadCreated { thread, .. }
            | EventKind::ThreadScheduled { thread, .. }
            | EventKind::ContextSwitch { thread, .. }
            | EventKind::InstructionRetired { thread, .. }
            | EventKind::MemoryRead { thread, .. }
            | EventKind::MemoryWrite { thread, .. }
            | EventKind::MemoryFence { thread, .. }
            | EventKind::CasResolved { thread, .. }
            | EventKind::LockAcquired { thread, .. }
            | EventKind::LockBlocked { thread, .. }
            | EventKind::LockReleased { thread, .. }
            | EventKind::BarrierWaiting { thread, .. }
            | EventKind::BarrierTripped { thread, .. }
            | EventKind::ThreadYielded { thread, .. }
            | EventKind::ThreadUnblocked { thread, .. }
            | EventKind::ThreadTerminated { thread, .. }
            | EventKind::JoinWait { thread, .. }
            | EventKind::Syscall { thread, .. } => Some(*thread),
            _ => None,
        }
    }

    /// The processor the event happened on, when there is one.
    pub fn processor(&self) -> Option<usize> {
        match self {
            EventKind::ThreadScheduled { processor, .. }
            | EventKind::ContextSwitch { processor, .. }
            | EventKind::InstructionRetired { processor, .. }
            | EventKind::MemoryRead { processor, .. }
            | EventKind::MemoryWrite { processor, .. }
            | EventKind::MemoryFence { processor, .. }
            | EventKind::CasResolved { processor, .. }
            | EventKind::ThreadYielded { processor, .. }
            | EventKind::Syscall { processor, .. } => Some(*processor),
            _ => None,
        }
    }
}

/// An append-only trace record. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionEvent {
    pub timestamp: u64,
    pub kind: EventKind,
}

/// Query over the trace; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TraceFilter {
    kind: Option<&'static str>,
    thread: Option<ThreadId>,
    processor: Option<usize>,
    since: Option<u64>,
    until: Option<u64>,
}

impl TraceFilter {
    pub fn new() -> Self { Self::default() }

    pub fn kind(mut self, kind: &'static str) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn thread(mut self, thread: ThreadId) -> Self {
        self.thread = Some(thread);
        self
    }

    pub fn processor(mut self, processor: usize) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    fn matches(&self, event: &ExecutionEvent) -> bool {
        if let Some(kind) = self.kind {
            if event.kind.name() != kind {
                return false;
            }
        }
        if let Some(thread) = self.thread {
            if event.kind.thread() != Some(thread) {
                return false;
            }
        }
        if let Some(processor) = self.processor {
            if event.kind.processor() != Some(processor) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.timestamp > until {
                return false;
            }
        }
        true
    }
}

/// The VM's execution trace. Appends are gated on the tracing switch so a
/// disabled trace costs nothing.
#[derive(Debug)]
pub struct ExecutionTrace {
    enabled: bool,
    events: Vec<ExecutionEvent>,
}

impl ExecutionTrace {
    pub fn new(enabled: bool) -> Self {
        ExecutionTrace { enabled, events: Vec::new() }
    }

    pub fn record(&mut self, timestamp: u64, kind: EventKind) {
        if self.enabled {
            self.events.push(ExecutionEvent { timestamp, kind });
        }
    }

    pub fn events(&self) -> &[ExecutionEvent] { &self.events }

    pub fn query(&self, filter: &TraceFilter) -> Vec<&ExecutionEvent> {
        self.events.iter().filter(|event| filter.matches(event)).collect()
    }

    pub fn len(&self) -> usize { self.events.len() }

    pub fn is_empty(&self) -> bool { self.events.is_empty() }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_by_kind_and_thread() {
        let mut trace = ExecutionTrace::new(true);
        trace.record(0, EventKind::ThreadCreated { thread: ThreadId(0), parent: None, entry: 0 });
        trace.record(1, EventKind::ThreadScheduled { thread: ThreadId(0), processor: 0 });
        trace.record(1, EventKind::ThreadScheduled { thread: ThreadId(1), processor: 1 });

        let scheduled = trace.query(&TraceFilter::new().kind("thread_scheduled"));
        assert_eq!(scheduled.len(), 2);

        let t1 = trace.query(&TraceFilter::new().thread(ThreadId(1)));
        assert_eq!(t1.len(), 1);
        assert_eq!(t1[0].timestamp, 1);
    }

    #[test]
    fn filter_by_time_window() {
        let mut trace = ExecutionTrace::new(true);
        for t in 0..10 {
            trace.record(t, EventKind::VmStarted);
        }
        let window = trace.query(&TraceFilter::new().since(3).until(5));
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn disabled_trace_stays_empty() {
        let mut trace = ExecutionTrace::new(false);
        trace.record(0, EventKind::VmStarted);
        assert!(trace.is_empty());
    }
}
