use std::collections::VecDeque;

use fnv::FnvHashMap;
use tracing::debug;

use crate::thread::ThreadId;

/// The ready queue plus scheduling bookkeeping.
///
/// Ordering is priority-then-FIFO: higher priority runs first, equal
/// priorities keep arrival order. With every thread at the default priority
/// this degenerates to the plain round-robin the machine guarantees.
#[derive(Debug, Default)]
pub struct Scheduler {
    ready: VecDeque<(ThreadId, i32)>,
    context_switches: u64,
    run_cycles: FnvHashMap<ThreadId, u64>,
    wait_cycles: FnvHashMap<ThreadId, u64>,
}

impl Scheduler {
    pub fn new() -> Self { Self::default() }

    /// Queues a runnable thread. A thread is never queued twice.
    pub fn enqueue(&mut self, thread: ThreadId, priority: i32) {
        if self.ready.iter().any(|(queued, _)| *queued == thread) {
            return;
        }

        let position = self
            .ready
            .iter()
            .position(|(_, queued_priority)| *queued_priority < priority)
            .unwrap_or(self.ready.len());
        self.ready.insert(position, (thread, priority));

        debug!("ready <- {thread} (priority {priority}, depth {})", self.ready.len());
    }

    /// Pops the next thread to run.
    pub fn pop_next(&mut self) -> Option<ThreadId> {
        self.ready.pop_front().map(|(thread, _)| thread)
    }

    pub fn ready_len(&self) -> usize { self.ready.len() }

    pub fn has_ready(&self) -> bool { !self.ready.is_empty() }

    pub fn remove(&mut self, thread: ThreadId) {
        self.ready.retain(|(queued, _)| *queued != thread);
    }

    pub fn record_context_switch(&mut self) {
        self.context_switches += 1;
    }

    pub fn context_switches(&self) -> u64 { self.context_switches }

    pub fn add_run_cycle(&mut self, thread: ThreadId) {
        *self.run_cycles.entry(thread).or_default() += 1;
    }

    pub fn add_wait_cycle(&mut self, thread: ThreadId) {
        *self.wait_cycles.entry(thread).or_default() += 1;
    }

    pub fn run_cycles(&self, thread: ThreadId) -> u64 {
        self.run_cycles.get(&thread).copied().unwrap_or(0)
    }

    pub fn wait_cycles(&self, thread: ThreadId) -> u64 {
        self.wait_cycles.get(&thread).copied().unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.ready.clear();
        self.context_switches = 0;
        self.run_cycles.clear();
        self.wait_cycles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_priority_is_fifo() {
        let mut s = Scheduler::new();
        s.enqueue(ThreadId(1), 0);
        s.enqueue(ThreadId(2), 0);
        s.enqueue(ThreadId(3), 0);

        assert_eq!(s.pop_next(), Some(ThreadId(1)));
        assert_eq!(s.pop_next(), Some(ThreadId(2)));
        assert_eq!(s.pop_next(), Some(ThreadId(3)));
        assert_eq!(s.pop_next(), None);
    }

    #[test]
    fn higher_priority_jumps_the_queue() {
        let mut s = Scheduler::new();
        s.enqueue(ThreadId(1), 0);
        s.enqueue(ThreadId(2), 5);
        s.enqueue(ThreadId(3), 5);
        s.enqueue(ThreadId(4), 0);

        assert_eq!(s.pop_next(), Some(ThreadId(2)));
        assert_eq!(s.pop_next(), Some(ThreadId(3)));
        assert_eq!(s.pop_next(), Some(ThreadId(1)));
        assert_eq!(s.pop_next(), Some(ThreadId(4)));
    }

    #[test]
    fn duplicate_enqueue_is_ignored() {
        let mut s = Scheduler::new();
        s.enqueue(ThreadId(1), 0);
        s.enqueue(ThreadId(1), 0);
        assert_eq!(s.ready_len(), 1);
    }

    #[test]
    fn cycle_accounting_accumulates() {
        let mut s = Scheduler::new();
        s.add_run_cycle(ThreadId(1));
        s.add_run_cycle(ThreadId(1));
        s.add_wait_cycle(ThreadId(2));
        assert_eq!(s.run_cycles(ThreadId(1)), 2);
        assert_eq!(s.wait_cycles(ThreadId(2)), 1);
        assert_eq!(s.run_cycles(ThreadId(9)), 0);
    }
}
