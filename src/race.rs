use fnv::{FnvHashMap, FnvHashSet};
use smallvec::SmallVec;
use tracing::debug;

use crate::sync::LockId;
use crate::thread::ThreadId;
use crate::value::Value;

/// Kinds of detected races.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceKind {
    ReadWrite,
    WriteWrite,
}

/// One logged memory access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryAccess {
    pub thread: ThreadId,
    pub processor: usize,
    pub timestamp: u64,
    pub is_write: bool,
    pub value: Value,
    /// Locks the thread held at access time.
    pub locks: SmallVec<[LockId; 2]>,
}

/// A flagged pair of conflicting accesses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaceReport {
    pub kind: RaceKind,
    pub address: usize,
    pub first: MemoryAccess,
    pub second: MemoryAccess,
    pub detected_at: u64,
}

/// Passive race detector: logs accesses per address, infers happens-before
/// from synchronization hand-offs and flags unordered conflicting pairs.
/// Advisory only; it never blocks execution.
#[derive(Debug, Default)]
pub struct RaceDetector {
    enabled: bool,
    accesses: FnvHashMap<usize, Vec<MemoryAccess>>,
    happens_before: FnvHashMap<ThreadId, FnvHashSet<ThreadId>>,
    held_locks: FnvHashMap<ThreadId, FnvHashSet<LockId>>,
    races: Vec<RaceReport>,
}

impl RaceDetector {
    pub fn new(enabled: bool) -> Self {
        RaceDetector { enabled, ..Default::default() }
    }

    pub fn is_enabled(&self) -> bool { self.enabled }

    /// Logs a read or write and checks it against every earlier access to
    /// the same address from other threads.
    pub fn record_access(
        &mut self,
        thread: ThreadId,
        processor: usize,
        timestamp: u64,
        address: usize,
        is_write: bool,
        value: Value,
    ) {
        if !self.enabled {
            return;
        }

        let mut locks: SmallVec<[LockId; 2]> = self
            .held_locks
            .get(&thread)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        locks.sort_unstable();

        let access = MemoryAccess { thread, processor, timestamp, is_write, value, locks };

        let mut found = Vec::new();
        if let Some(log) = self.accesses.get(&address) {
            for prev in log {
                if prev.thread == thread {
                    continue;
                }

                let kind = match (prev.is_write, access.is_write) {
                    (true, true) => RaceKind::WriteWrite,
                    (false, false) => continue,
                    _ => RaceKind::ReadWrite,
                };

                if prev.locks.iter().any(|lock| access.locks.contains(lock)) {
                    continue;
                }
                if self.ordered(prev.thread, access.thread) {
                    continue;
                }

                debug!("race at {address:#x}: {:?} {} vs {}", kind, prev.thread, access.thread);

                found.push(RaceReport {
                    kind,
                    address,
                    first: prev.clone(),
                    second: access.clone(),
                    detected_at: timestamp,
                });
            }
        }

        self.races.extend(found);
        self.accesses.entry(address).or_default().push(access);
    }

    /// Records a happens-before edge: everything `from` did up to now is
    /// ordered before everything `to` does afterwards.
    pub fn record_synchronization(&mut self, from: ThreadId, to: ThreadId, _timestamp: u64) {
        if !self.enabled || from == to {
            return;
        }
        self.happens_before.entry(from).or_default().insert(to);
    }

    /// Lockset bookkeeping, fed by the VM as threads take and drop locks.
    pub fn lock_acquired(&mut self, thread: ThreadId, lock: LockId) {
        if self.enabled {
            self.held_locks.entry(thread).or_default().insert(lock);
        }
    }

    pub fn lock_released(&mut self, thread: ThreadId, lock: LockId) {
        if let Some(set) = self.held_locks.get_mut(&thread) {
            set.remove(&lock);
        }
    }

    /// Whether a happens-before path connects the two threads, in either
    /// direction, transitively through recorded synchronization.
    fn ordered(&self, a: ThreadId, b: ThreadId) -> bool {
        self.reaches(a, b) || self.reaches(b, a)
    }

    fn reaches(&self, from: ThreadId, to: ThreadId) -> bool {
        let mut seen = FnvHashSet::default();
        let mut stack = vec![from];

        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(next) = self.happens_before.get(&current) {
                stack.extend(next.iter().copied());
            }
        }

        false
    }

    pub fn races(&self) -> &[RaceReport] { &self.races }

    /// Addresses touched by more than one thread.
    pub fn shared_addresses(&self) -> Vec<usize> {
        let mut shared: Vec<usize> = self
            .accesses
            .iter()
            .filter(|(_, log)| {
                log.iter().any(|access| access.thread != log[0].thread)
            })
            .map(|(addr, _)| *addr)
            .collect();
        shared.sort_unstable();
        shared
    }

    pub fn access_count(&self) -> usize {
        self.accesses.values().map(Vec::len).sum()
    }

    pub fn reset(&mut self) {
        self.accesses.clear();
        self.happens_before.clear();
        self.held_locks.clear();
        self.races.clear();
    }
}
