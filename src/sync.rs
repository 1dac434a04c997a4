use std::collections::VecDeque;
use std::fmt;

use fnv::FnvHashMap;
use smallvec::SmallVec;
use thiserror::Error;
use tracing::debug;

use crate::thread::{ThreadId, WaitReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(pub u32);

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BarrierId(pub u32);

impl fmt::Display for BarrierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("lock {lock} released while not held")]
    ReleaseUnheld { lock: LockId },
    #[error("{thread} released lock {lock} held by {holder}")]
    NotHolder { lock: LockId, thread: ThreadId, holder: ThreadId },
    #[error("{thread} arrived twice at barrier {barrier} in one generation")]
    AlreadyAtBarrier { barrier: BarrierId, thread: ThreadId },
    #[error("barrier {barrier} was created for {expected} parties, awaited with {got}")]
    PartiesMismatch { barrier: BarrierId, expected: u32, got: u32 },
}

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquire {
    Acquired,
    /// The caller must park the thread; `holder` is who currently owns it.
    Blocked { holder: ThreadId },
}

/// Result of a barrier arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierWait {
    /// The arrival tripped the barrier. Every arrived thread (the arriver
    /// included) is listed in ascending thread-id order; the barrier has
    /// already been reset for its next generation.
    Tripped { generation: u64, released: SmallVec<[ThreadId; 4]> },
    /// The caller must park the thread until the barrier trips.
    Waiting { waiting: u32, needed: u32 },
}

/// A mutex: one holder, FIFO handoff to waiters.
#[derive(Debug)]
pub struct Lock {
    id: LockId,
    holder: Option<ThreadId>,
    waiters: VecDeque<ThreadId>,
    acquisitions: u64,
    contentions: u64,
}

impl Lock {
    fn new(id: LockId) -> Self {
        Lock { id, holder: None, waiters: VecDeque::new(), acquisitions: 0, contentions: 0 }
    }

    pub fn holder(&self) -> Option<ThreadId> { self.holder }

    pub fn is_held_by(&self, thread: ThreadId) -> bool { self.holder == Some(thread) }

    pub fn waiter_count(&self) -> usize { self.waiters.len() }

    fn acquire(&mut self, thread: ThreadId, enqueue: bool) -> LockAcquire {
        match self.holder {
            None => {
                self.holder = Some(thread);
                self.acquisitions += 1;
                LockAcquire::Acquired
            }
            Some(holder) if holder == thread => LockAcquire::Acquired,
            Some(holder) => {
                if enqueue && !self.waiters.contains(&thread) {
                    self.waiters.push_back(thread);
                    self.contentions += 1;
                }
                LockAcquire::Blocked { holder }
            }
        }
    }

    /// Releases the lock. If anyone is queued the lock is handed straight to
    /// the front waiter (no lock-stealing window) and that thread is
    /// returned so the caller can unblock it.
    fn release(&mut self, thread: ThreadId) -> Result<Option<ThreadId>, SyncError> {
        match self.holder {
            None => return Err(SyncError::ReleaseUnheld { lock: self.id }),
            Some(holder) if holder != thread => {
                return Err(SyncError::NotHolder { lock: self.id, thread, holder })
            }
            Some(_) => {}
        }

        let next = self.waiters.pop_front();
        self.holder = next;
        if next.is_some() {
            self.acquisitions += 1;
        }

        Ok(next)
    }
}

/// A reusable barrier. Trips when `parties` distinct threads have arrived,
/// then resets for the next generation.
#[derive(Debug)]
pub struct Barrier {
    id: BarrierId,
    parties: u32,
    arrived: Vec<ThreadId>,
    generation: u64,
}

impl Barrier {
    fn new(id: BarrierId, parties: u32) -> Self {
        Barrier { id, parties, arrived: Vec::new(), generation: 0 }
    }

    pub fn parties(&self) -> u32 { self.parties }

    pub fn generation(&self) -> u64 { self.generation }

    pub fn arrived_count(&self) -> u32 { self.arrived.len() as u32 }

    fn arrive(&mut self, thread: ThreadId) -> Result<BarrierWait, SyncError> {
        if self.arrived.contains(&thread) {
            return Err(SyncError::AlreadyAtBarrier { barrier: self.id, thread });
        }

        self.arrived.push(thread);

        if self.arrived.len() as u32 >= self.parties {
            self.generation += 1;
            let mut released: SmallVec<[ThreadId; 4]> =
                std::mem::take(&mut self.arrived).into_iter().collect();
            released.sort_unstable();

            return Ok(BarrierWait::Tripped { generation: self.generation, released });
        }

        Ok(BarrierWait::Waiting {
            waiting: self.arrived.len() as u32,
            needed: self.parties - self.arrived.len() as u32,
        })
    }
}

/// One entry in the synchronization event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    pub timestamp: u64,
    pub thread: ThreadId,
    pub kind: SyncEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEventKind {
    LockAcquired { lock: LockId, contended: bool },
    LockBlocked { lock: LockId, holder: ThreadId },
    LockReleased { lock: LockId, handed_to: Option<ThreadId> },
    BarrierArrived { barrier: BarrierId, waiting: u32, needed: u32 },
    BarrierTripped { barrier: BarrierId, generation: u64 },
}

/// Per-lock counters for the statistics report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStats {
    pub lock: LockId,
    pub holder: Option<ThreadId>,
    pub waiting: usize,
    pub acquisitions: u64,
    pub contentions: u64,
}

/// Owns every lock and barrier, records their event history and tracks which
/// primitive each parked thread is waiting on.
///
/// Primitives are created on first use; ids are chosen by the guest program.
#[derive(Debug, Default)]
pub struct SyncManager {
    locks: FnvHashMap<LockId, Lock>,
    barriers: FnvHashMap<BarrierId, Barrier>,
    waits: FnvHashMap<ThreadId, (WaitReason, u64)>,
    events: Vec<SyncEvent>,
}

impl SyncManager {
    pub fn new() -> Self { Self::default() }

    /// Attempts to acquire `lock` for `thread`. With `blocking` set, a failed
    /// attempt queues the thread FIFO behind the holder; without it the
    /// attempt leaves no trace and the caller may retry later.
    pub fn acquire_lock(
        &mut self,
        lock: LockId,
        thread: ThreadId,
        blocking: bool,
        timestamp: u64,
    ) -> LockAcquire {
        let entry = self.locks.entry(lock).or_insert_with(|| Lock::new(lock));
        let contended = entry.holder().is_some_and(|h| h != thread);
        let outcome = entry.acquire(thread, blocking);

        match outcome {
            LockAcquire::Acquired => {
                debug!("{thread} acquired {lock}");
                self.waits.remove(&thread);
                self.events.push(SyncEvent {
                    timestamp,
                    thread,
                    kind: SyncEventKind::LockAcquired { lock, contended },
                });
            }
            LockAcquire::Blocked { holder } => {
                debug!("{thread} blocked on {lock} held by {holder}");
                if blocking {
                    self.waits.insert(thread, (WaitReason::Lock(lock), timestamp));
                }
                self.events.push(SyncEvent {
                    timestamp,
                    thread,
                    kind: SyncEventKind::LockBlocked { lock, holder },
                });
            }
        }

        outcome
    }

    /// Releases `lock`. On success the returned thread (if any) now holds the
    /// lock and must be unblocked by the caller.
    pub fn release_lock(
        &mut self,
        lock: LockId,
        thread: ThreadId,
        timestamp: u64,
    ) -> Result<Option<ThreadId>, SyncError> {
        let entry = self
            .locks
            .get_mut(&lock)
            .ok_or(SyncError::ReleaseUnheld { lock })?;
        let next = entry.release(thread)?;

        debug!("{thread} released {lock}, handed to {next:?}");

        if let Some(next) = next {
            self.waits.remove(&next);
            self.events.push(SyncEvent {
                timestamp,
                thread: next,
                kind: SyncEventKind::LockAcquired { lock, contended: true },
            });
        }
        self.events.push(SyncEvent {
            timestamp,
            thread,
            kind: SyncEventKind::LockReleased { lock, handed_to: next },
        });

        Ok(next)
    }

    /// Registers `thread`'s arrival at `barrier`.
    pub fn await_barrier(
        &mut self,
        barrier: BarrierId,
        thread: ThreadId,
        parties: u32,
        timestamp: u64,
    ) -> Result<BarrierWait, SyncError> {
        let entry = self
            .barriers
            .entry(barrier)
            .or_insert_with(|| Barrier::new(barrier, parties));
        if entry.parties() != parties {
            return Err(SyncError::PartiesMismatch {
                barrier,
                expected: entry.parties(),
                got: parties,
            });
        }

        let outcome = entry.arrive(thread)?;

        match &outcome {
            BarrierWait::Tripped { generation, released } => {
                debug!("{barrier} tripped (generation {generation}) releasing {released:?}");
                for released_thread in released {
                    self.waits.remove(released_thread);
                }
                self.events.push(SyncEvent {
                    timestamp,
                    thread,
                    kind: SyncEventKind::BarrierTripped { barrier, generation: *generation },
                });
            }
            BarrierWait::Waiting { waiting, needed } => {
                debug!("{thread} waiting at {barrier} ({waiting} arrived, {needed} needed)");
                self.waits.insert(thread, (WaitReason::Barrier(barrier), timestamp));
                self.events.push(SyncEvent {
                    timestamp,
                    thread,
                    kind: SyncEventKind::BarrierArrived {
                        barrier,
                        waiting: *waiting,
                        needed: *needed,
                    },
                });
            }
        }

        Ok(outcome)
    }

    /// Releases every lock `thread` holds, in ascending lock-id order.
    /// Runs when a thread terminates so waiters are never stranded behind a
    /// dead holder. Returns each released lock with its new holder.
    pub fn release_all_held(
        &mut self,
        thread: ThreadId,
        timestamp: u64,
    ) -> SmallVec<[(LockId, Option<ThreadId>); 2]> {
        let mut held: SmallVec<[LockId; 2]> = self
            .locks
            .values()
            .filter(|lock| lock.is_held_by(thread))
            .map(|lock| lock.id)
            .collect();
        held.sort_unstable();

        let mut released = SmallVec::new();
        for lock in held {
            // The holder check above makes this infallible.
            if let Ok(next) = self.release_lock(lock, thread, timestamp) {
                released.push((lock, next));
            }
        }

        self.waits.remove(&thread);
        released
    }

    pub fn lock(&self, lock: LockId) -> Option<&Lock> {
        self.locks.get(&lock)
    }

    pub fn barrier(&self, barrier: BarrierId) -> Option<&Barrier> {
        self.barriers.get(&barrier)
    }

    /// What `thread` is parked on and since when, if the manager parked it.
    pub fn wait_info(&self, thread: ThreadId) -> Option<(WaitReason, u64)> {
        self.waits.get(&thread).copied()
    }

    pub fn events(&self) -> &[SyncEvent] { &self.events }

    pub fn lock_statistics(&self) -> Vec<LockStats> {
        let mut stats: Vec<LockStats> = self
            .locks
            .values()
            .map(|lock| LockStats {
                lock: lock.id,
                holder: lock.holder,
                waiting: lock.waiter_count(),
                acquisitions: lock.acquisitions,
                contentions: lock.contentions,
            })
            .collect();
        stats.sort_unstable_by_key(|s| s.lock);
        stats
    }

    pub fn reset(&mut self) {
        self.locks.clear();
        self.barriers.clear();
        self.waits.clear();
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_acquire_succeeds() {
        let mut sync = SyncManager::new();
        let got = sync.acquire_lock(LockId(1), ThreadId(0), true, 0);
        assert_eq!(got, LockAcquire::Acquired);
        assert!(sync.lock(LockId(1)).unwrap().is_held_by(ThreadId(0)));
    }

    #[test]
    fn contended_lock_is_handed_off_fifo() {
        let mut sync = SyncManager::new();
        sync.acquire_lock(LockId(1), ThreadId(0), true, 0);
        assert!(matches!(
            sync.acquire_lock(LockId(1), ThreadId(1), true, 1),
            LockAcquire::Blocked { holder: ThreadId(0) }
        ));
        assert!(matches!(
            sync.acquire_lock(LockId(1), ThreadId(2), true, 2),
            LockAcquire::Blocked { .. }
        ));

        let next = sync.release_lock(LockId(1), ThreadId(0), 3).unwrap();
        assert_eq!(next, Some(ThreadId(1)));
        assert!(sync.lock(LockId(1)).unwrap().is_held_by(ThreadId(1)));

        let next = sync.release_lock(LockId(1), ThreadId(1), 4).unwrap();
        assert_eq!(next, Some(ThreadId(2)));

        let next = sync.release_lock(LockId(1), ThreadId(2), 5).unwrap();
        assert_eq!(next, None);
        assert!(sync.lock(LockId(1)).unwrap().holder().is_none());
    }

    #[test]
    fn release_by_non_holder_is_an_error() {
        let mut sync = SyncManager::new();
        sync.acquire_lock(LockId(1), ThreadId(0), true, 0);
        assert!(matches!(
            sync.release_lock(LockId(1), ThreadId(9), 1),
            Err(SyncError::NotHolder { .. })
        ));
        assert!(matches!(
            sync.release_lock(LockId(7), ThreadId(0), 1),
            Err(SyncError::ReleaseUnheld { .. })
        ));
    }

    #[test]
    fn barrier_trips_on_last_arrival_and_reuses() {
        let mut sync = SyncManager::new();

        for generation in 1..=2u64 {
            assert!(matches!(
                sync.await_barrier(BarrierId(0), ThreadId(0), 3, 0).unwrap(),
                BarrierWait::Waiting { waiting: 1, needed: 2 }
            ));
            assert!(matches!(
                sync.await_barrier(BarrierId(0), ThreadId(2), 3, 1).unwrap(),
                BarrierWait::Waiting { waiting: 2, needed: 1 }
            ));

            match sync.await_barrier(BarrierId(0), ThreadId(1), 3, 2).unwrap() {
                BarrierWait::Tripped { generation: g, released } => {
                    assert_eq!(g, generation);
                    assert_eq!(
                        released.as_slice(),
                        &[ThreadId(0), ThreadId(1), ThreadId(2)]
                    );
                }
                other => panic!("expected trip, got {other:?}"),
            }
        }
    }

    #[test]
    fn double_arrival_is_rejected() {
        let mut sync = SyncManager::new();
        sync.await_barrier(BarrierId(0), ThreadId(0), 2, 0).unwrap();
        assert!(matches!(
            sync.await_barrier(BarrierId(0), ThreadId(0), 2, 1),
            Err(SyncError::AlreadyAtBarrier { .. })
        ));
    }

    #[test]
    fn termination_releases_held_locks_in_order() {
        let mut sync = SyncManager::new();
        sync.acquire_lock(LockId(5), ThreadId(0), true, 0);
        sync.acquire_lock(LockId(2), ThreadId(0), true, 0);
        sync.acquire_lock(LockId(2), ThreadId(1), true, 1);

        let released = sync.release_all_held(ThreadId(0), 2);
        assert_eq!(
            released.as_slice(),
            &[(LockId(2), Some(ThreadId(1))), (LockId(5), None)]
        );
        assert!(sync.lock(LockId(2)).unwrap().is_held_by(ThreadId(1)));
    }

    #[test]
    fn non_blocking_attempt_leaves_no_waiter() {
        let mut sync = SyncManager::new();
        sync.acquire_lock(LockId(1), ThreadId(0), true, 0);
        sync.acquire_lock(LockId(1), ThreadId(1), false, 1);
        assert_eq!(sync.lock(LockId(1)).unwrap().waiter_count(), 0);
        assert!(sync.wait_info(ThreadId(1)).is_none());
    }
}
