use std::fmt;

use byteyarn::yarn;
use fnv::FnvHashMap;
use tracing::{debug, trace};

use crate::error::VmError;
use crate::instruction::{Instruction, Op, Program, ProgramId};
use crate::memory::bus::{BusStats, BusTransaction};
use crate::memory::cache::{CacheConfig, CacheStats};
use crate::memory::MemorySystem;
use crate::processor::{Effect, Processor};
use crate::race::{RaceDetector, RaceReport};
use crate::register::RegisterFile;
use crate::scheduler::Scheduler;
use crate::sync::{BarrierWait, LockAcquire, LockId, LockStats, SyncEvent, SyncManager};
use crate::thread::{Thread, ThreadId, ThreadState, WaitReason};
use crate::trace::{EventKind, ExecutionEvent, ExecutionTrace, TraceFilter, UnblockReason};
use crate::value::Value;

/// States of the virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Idle,
    Running,
    Paused,
    Finished,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Idle => write!(f, "IDLE"),
            VmState::Running => write!(f, "RUNNING"),
            VmState::Paused => write!(f, "PAUSED"),
            VmState::Finished => write!(f, "FINISHED"),
        }
    }
}

/// Construction-time configuration.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub num_processors: usize,
    /// Main memory size in words.
    pub memory_size: usize,
    pub cache: CacheConfig,
    pub bus_latency: u64,
    pub enable_tracing: bool,
    pub enable_race_detection: bool,
    pub enable_cache_coherence: bool,
    pub privilege_enforcement: bool,
    /// Recorded in statistics for run provenance; the machine itself is
    /// fully deterministic.
    pub random_seed: Option<u64>,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            num_processors: 4,
            memory_size: 1 << 16,
            cache: CacheConfig::default(),
            bus_latency: 1,
            enable_tracing: true,
            enable_race_detection: true,
            enable_cache_coherence: false,
            privilege_enforcement: true,
            random_seed: None,
        }
    }
}

/// Optional knobs for [`VirtualMachine::create_thread_with`].
#[derive(Debug, Clone, Default)]
pub struct ThreadOptions {
    /// Overrides the program's entry point.
    pub entry_point: Option<usize>,
    /// Initial register contents (the PC inside is ignored).
    pub registers: Option<RegisterFile>,
    pub parent: Option<ThreadId>,
    pub priority: i32,
}

/// Aggregate counters reported by [`VirtualMachine::statistics`].
#[derive(Debug, Clone, PartialEq)]
pub struct VmStatistics {
    pub state: VmState,
    pub processors: usize,
    pub threads: usize,
    pub global_clock: u64,
    pub instructions_retired: u64,
    pub context_switches: u64,
    /// Percentage of processor cycles spent executing threads.
    pub processor_utilization: f64,
    pub race_conditions: usize,
    pub random_seed: Option<u64>,
}

/// The machine driver: processors, shared memory, scheduler, synchronization
/// and instrumentation advanced by one global clock.
///
/// Each [`step`](Self::step) runs one cycle on every busy processor in
/// ascending processor-id order and routes the resulting [`Effect`]s, which
/// makes any run with a fixed thread-creation order fully deterministic.
pub struct VirtualMachine {
    config: VmConfig,
    state: VmState,
    global_clock: u64,
    processors: Vec<Processor>,
    memory: MemorySystem,
    scheduler: Scheduler,
    sync: SyncManager,
    race: RaceDetector,
    trace: ExecutionTrace,
    threads: FnvHashMap<ThreadId, Thread>,
    programs: FnvHashMap<ProgramId, Program>,
    last_releaser: FnvHashMap<LockId, ThreadId>,
    next_thread_id: u32,
    next_program_id: u32,
    instructions_retired: u64,
}

impl VirtualMachine {
    pub fn new(config: VmConfig) -> Self {
        let num_processors = config.num_processors.max(1);
        let processors = (0..num_processors)
            .map(|id| Processor::new(id, config.privilege_enforcement))
            .collect();
        let memory = if config.enable_cache_coherence {
            MemorySystem::coherent(config.memory_size, num_processors, config.cache, config.bus_latency)
        } else {
            MemorySystem::flat(config.memory_size)
        };

        VirtualMachine {
            state: VmState::Idle,
            global_clock: 0,
            processors,
            memory,
            scheduler: Scheduler::new(),
            sync: SyncManager::new(),
            race: RaceDetector::new(config.enable_race_detection),
            trace: ExecutionTrace::new(config.enable_tracing),
            threads: FnvHashMap::default(),
            programs: FnvHashMap::default(),
            last_releaser: FnvHashMap::default(),
            next_thread_id: 0,
            next_program_id: 0,
            instructions_retired: 0,
            config,
        }
    }

    pub fn state(&self) -> VmState { self.state }

    pub fn global_clock(&self) -> u64 { self.global_clock }

    pub fn config(&self) -> &VmConfig { &self.config }

    /// Loads a program into the program table and writes its data segment
    /// into main memory.
    pub fn load_program(&mut self, program: Program) -> Result<ProgramId, VmError> {
        let id = ProgramId(self.next_program_id);
        self.next_program_id += 1;

        for &(addr, value) in program.data_segment() {
            self.memory.poke(addr, value)?;
        }

        debug!("loaded {} as {id} ({} instructions)", program.name(), program.len());
        self.programs.insert(id, program);
        Ok(id)
    }

    /// Creates a thread at the program's entry point with default options.
    pub fn create_thread(&mut self, program: ProgramId) -> Result<ThreadId, VmError> {
        self.create_thread_with(program, ThreadOptions::default())
    }

    pub fn create_thread_with(
        &mut self,
        program: ProgramId,
        options: ThreadOptions,
    ) -> Result<ThreadId, VmError> {
        let entry = {
            let program = self.programs.get(&program).ok_or(VmError::UnknownProgram(program))?;
            options.entry_point.unwrap_or_else(|| program.entry_point())
        };

        let id = ThreadId(self.next_thread_id);
        self.next_thread_id += 1;

        let mut thread = Thread::new(id, program, entry, self.global_clock)
            .with_priority(options.priority);
        if let Some(registers) = options.registers {
            thread = thread.with_registers(registers);
        }
        if let Some(parent) = options.parent {
            thread = thread.with_parent(parent);
        }

        self.trace.record(
            self.global_clock,
            EventKind::ThreadCreated { thread: id, parent: thread.parent, entry },
        );
        self.scheduler.enqueue(id, thread.priority);
        self.threads.insert(id, thread);

        Ok(id)
    }

    /// Starts or resumes execution.
    pub fn start(&mut self) {
        if self.state == VmState::Idle || self.state == VmState::Paused {
            self.state = VmState::Running;
            self.trace.record(self.global_clock, EventKind::VmStarted);
        }
    }

    pub fn pause(&mut self) {
        if self.state == VmState::Running {
            self.state = VmState::Paused;
            self.trace.record(self.global_clock, EventKind::VmPaused);
        }
    }

    /// Executes one global clock tick. Returns whether the VM is still
    /// running afterwards.
    pub fn step(&mut self) -> Result<bool, VmError> {
        if self.state == VmState::Finished {
            return Ok(false);
        }
        self.start();

        self.schedule();

        let mut active = 0usize;
        for idx in 0..self.processors.len() {
            if !self.processors[idx].is_busy() {
                continue;
            }
            active += 1;

            let Some(thread_id) = self.processors[idx].current_thread() else { continue };
            let Some(thread) = self.threads.get(&thread_id) else { continue };
            let program_id = thread.program;

            let pc = self.processors[idx].registers().pc();
            let fetched = self
                .programs
                .get(&program_id)
                .and_then(|program| program.fetch(pc))
                .cloned();

            let Some(instruction) = fetched else {
                // Ran off the end of the program: clean termination.
                self.terminate_thread(thread_id, None)?;
                continue;
            };

            if let Some(thread) = self.threads.get_mut(&thread_id) {
                thread.execution_cycles += 1;
            }

            match self.processors[idx].execute_instruction(&instruction) {
                Err(fault) => {
                    debug!("{thread_id} faulted: {fault}");
                    self.terminate_thread(thread_id, Some(yarn!("{fault}")))?;
                }
                Ok(execution) => {
                    if execution.completed {
                        self.instructions_retired += 1;
                        self.trace.record(
                            self.global_clock,
                            EventKind::InstructionRetired {
                                thread: thread_id,
                                processor: idx,
                                pc,
                                instruction: yarn!("{instruction}"),
                            },
                        );

                        for effect in execution.effects {
                            self.route_effect(idx, thread_id, &instruction, effect)?;
                            // A routed effect can terminate or park the
                            // thread; stop applying its remaining effects.
                            if self.processors[idx].current_thread() != Some(thread_id) {
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.charge_cycles();
        self.memory.tick(self.global_clock);

        if active == 0 && !self.scheduler.has_ready() {
            let stuck = self.waiting_threads();
            if stuck.is_empty() {
                self.finish()?;
                self.global_clock += 1;
                return Ok(false);
            }

            // Nothing runs and nothing ever will: every unblock comes from a
            // running thread. Surface the deadlock instead of spinning.
            self.trace.record(
                self.global_clock,
                EventKind::DeadlockDetected {
                    threads: stuck.iter().map(|(thread, _)| *thread).collect(),
                },
            );
            self.state = VmState::Paused;
            return Err(VmError::Deadlock { stuck });
        }

        self.global_clock += 1;
        Ok(true)
    }

    /// Runs until completion or until the cycle budget is exhausted, in
    /// which case the VM is left paused and [`VmError::ExecutionLimit`] is
    /// returned (the error carries how far execution got).
    pub fn run(&mut self, max_cycles: Option<u64>) -> Result<u64, VmError> {
        self.start();

        let mut executed = 0u64;
        loop {
            if let Some(budget) = max_cycles {
                if executed >= budget {
                    self.pause();
                    return Err(VmError::ExecutionLimit { budget, executed });
                }
            }

            if !self.step()? {
                return Ok(executed + 1);
            }
            executed += 1;
        }
    }

    fn schedule(&mut self) {
        for idx in 0..self.processors.len() {
            if self.processors[idx].is_busy() || !self.scheduler.has_ready() {
                continue;
            }

            let Some(thread_id) = self.scheduler.pop_next() else { break };
            let Some(thread) = self.threads.get_mut(&thread_id) else { continue };

            thread.state = ThreadState::Running;
            thread.processor = Some(idx);
            self.processors[idx].begin_thread(thread_id, thread.registers.clone());
            self.scheduler.record_context_switch();

            self.trace.record(
                self.global_clock,
                EventKind::ThreadScheduled { thread: thread_id, processor: idx },
            );
            self.trace.record(
                self.global_clock,
                EventKind::ContextSwitch { thread: thread_id, processor: idx },
            );
        }
    }

    fn route_effect(
        &mut self,
        idx: usize,
        thread_id: ThreadId,
        instruction: &Instruction,
        effect: Effect,
    ) -> Result<(), VmError> {
        trace!("{thread_id}@P{idx}: {effect:?}");

        match effect {
            Effect::MemoryRead { addr, dest } => {
                let value = match self.memory.read(addr, idx, thread_id, self.global_clock) {
                    Ok(value) => value,
                    Err(fault) => return self.fault_thread(thread_id, &fault),
                };

                self.race.record_access(thread_id, idx, self.global_clock, addr, false, value);
                if let Err(fault) = self.processors[idx].registers_mut().set(dest, value) {
                    return self.fault_thread(thread_id, &fault);
                }

                if matches!(instruction.op, Op::Pop { .. }) {
                    if let Some(thread) = self.threads.get_mut(&thread_id) {
                        thread.stack.pop();
                    }
                }

                self.trace.record(
                    self.global_clock,
                    EventKind::MemoryRead { thread: thread_id, processor: idx, address: addr, value },
                );
            }
            Effect::MemoryWrite { addr, value } => {
                if let Err(fault) = self.memory.write(addr, value, idx, thread_id, self.global_clock)
                {
                    return self.fault_thread(thread_id, &fault);
                }

                self.race.record_access(thread_id, idx, self.global_clock, addr, true, value);

                if matches!(instruction.op, Op::Push { .. } | Op::Call { .. }) {
                    if let Some(thread) = self.threads.get_mut(&thread_id) {
                        thread.stack.push(value);
                    }
                }

                self.trace.record(
                    self.global_clock,
                    EventKind::MemoryWrite { thread: thread_id, processor: idx, address: addr, value },
                );
            }
            Effect::Return { addr } => {
                let value = match self.memory.read(addr, idx, thread_id, self.global_clock) {
                    Ok(value) => value,
                    Err(fault) => return self.fault_thread(thread_id, &fault),
                };

                self.race.record_access(thread_id, idx, self.global_clock, addr, false, value);
                self.processors[idx].registers_mut().set_pc(value.to_address());
                if let Some(thread) = self.threads.get_mut(&thread_id) {
                    thread.stack.pop();
                }

                self.trace.record(
                    self.global_clock,
                    EventKind::MemoryRead { thread: thread_id, processor: idx, address: addr, value },
                );
            }
            Effect::SyncLock { lock } => {
                match self.sync.acquire_lock(lock, thread_id, true, self.global_clock) {
                    LockAcquire::Acquired => {
                        self.race.lock_acquired(thread_id, lock);
                        if let Some(&releaser) = self.last_releaser.get(&lock) {
                            self.race.record_synchronization(releaser, thread_id, self.global_clock);
                        }
                        self.trace.record(
                            self.global_clock,
                            EventKind::LockAcquired { thread: thread_id, lock },
                        );
                    }
                    LockAcquire::Blocked { holder } => {
                        self.trace.record(
                            self.global_clock,
                            EventKind::LockBlocked { thread: thread_id, lock, holder },
                        );
                        self.park_thread(idx, thread_id, WaitReason::Lock(lock));
                    }
                }
            }
            Effect::SyncUnlock { lock } => {
                let next = self.sync.release_lock(lock, thread_id, self.global_clock)?;
                self.race.lock_released(thread_id, lock);
                self.last_releaser.insert(lock, thread_id);

                if let Some(next) = next {
                    // FIFO hand-off: the front waiter already owns the lock.
                    self.race.lock_acquired(next, lock);
                    self.race.record_synchronization(thread_id, next, self.global_clock);
                    self.unblock_thread(next, UnblockReason::LockGranted(lock));
                    self.trace.record(
                        self.global_clock,
                        EventKind::LockAcquired { thread: next, lock },
                    );
                }

                self.trace.record(
                    self.global_clock,
                    EventKind::LockReleased { thread: thread_id, lock, handed_to: next },
                );
            }
            Effect::Barrier { barrier, parties } => {
                match self.sync.await_barrier(barrier, thread_id, parties, self.global_clock)? {
                    BarrierWait::Tripped { generation, released } => {
                        for &a in &released {
                            for &b in &released {
                                if a != b {
                                    self.race.record_synchronization(a, b, self.global_clock);
                                }
                            }
                        }

                        for &waiter in &released {
                            if waiter != thread_id {
                                self.unblock_thread(waiter, UnblockReason::BarrierReleased(barrier));
                            }
                        }

                        self.trace.record(
                            self.global_clock,
                            EventKind::BarrierTripped {
                                thread: thread_id,
                                barrier,
                                generation,
                                released: released.to_vec(),
                            },
                        );
                    }
                    BarrierWait::Waiting { waiting, needed } => {
                        self.trace.record(
                            self.global_clock,
                            EventKind::BarrierWaiting { thread: thread_id, barrier, waiting, needed },
                        );
                        self.park_thread(idx, thread_id, WaitReason::Barrier(barrier));
                    }
                }
            }
            Effect::Fence => {
                self.trace.record(
                    self.global_clock,
                    EventKind::MemoryFence { thread: thread_id, processor: idx },
                );
            }
            Effect::Cas { addr, expected, new, dest } => {
                let (success, observed) = match self
                    .memory
                    .compare_and_swap(addr, expected, new, idx, thread_id, self.global_clock)
                {
                    Ok(outcome) => outcome,
                    Err(fault) => return self.fault_thread(thread_id, &fault),
                };

                self.race.record_access(thread_id, idx, self.global_clock, addr, false, observed);
                if success {
                    self.race.record_access(thread_id, idx, self.global_clock, addr, true, new);
                }
                let flag = Value(u32::from(success));
                if let Err(fault) = self.processors[idx].registers_mut().set(dest, flag) {
                    return self.fault_thread(thread_id, &fault);
                }

                self.trace.record(
                    self.global_clock,
                    EventKind::CasResolved {
                        thread: thread_id,
                        processor: idx,
                        address: addr,
                        expected,
                        new,
                        success,
                    },
                );
            }
            Effect::Halt => {
                self.terminate_thread(thread_id, None)?;
            }
            Effect::Yield => {
                let registers = self.processors[idx].park();
                if let Some(thread) = self.threads.get_mut(&thread_id) {
                    thread.registers = registers;
                    thread.state = ThreadState::Ready;
                    thread.processor = None;
                    self.scheduler.enqueue(thread_id, thread.priority);
                }

                self.trace.record(
                    self.global_clock,
                    EventKind::ThreadYielded { thread: thread_id, processor: idx },
                );
            }
            Effect::Syscall { number } => {
                self.trace.record(
                    self.global_clock,
                    EventKind::Syscall { thread: thread_id, processor: idx, number },
                );
            }
            Effect::Spawn { entry, arg, dest } => {
                let program = match self.threads.get(&thread_id) {
                    Some(thread) => thread.program,
                    None => return Ok(()),
                };

                let mut registers = RegisterFile::new();
                if let Err(fault) = registers.set(crate::register::Register::R(0), arg) {
                    return self.fault_thread(thread_id, &fault);
                }

                let child = self.create_thread_with(
                    program,
                    ThreadOptions {
                        entry_point: Some(entry),
                        registers: Some(registers),
                        parent: Some(thread_id),
                        priority: 0,
                    },
                )?;

                if let Err(fault) = self.processors[idx].registers_mut().set(dest, Value(child.0)) {
                    return self.fault_thread(thread_id, &fault);
                }
            }
            Effect::Join { target } => {
                let target_state = self
                    .threads
                    .get(&target)
                    .map(|thread| thread.state)
                    .ok_or(VmError::UnknownThread(target))?;

                if target_state.is_terminated() {
                    // Already done; joining is ordered after the join target.
                    self.race.record_synchronization(target, thread_id, self.global_clock);
                    self.processors[idx].resume_running();
                } else {
                    self.trace.record(
                        self.global_clock,
                        EventKind::JoinWait { thread: thread_id, target },
                    );
                    self.park_thread(idx, thread_id, WaitReason::Join(target));
                }
            }
        }

        Ok(())
    }

    /// Detaches a thread from its processor and parks it until an explicit
    /// unblock.
    fn park_thread(&mut self, idx: usize, thread_id: ThreadId, reason: WaitReason) {
        let registers = self.processors[idx].park();
        if let Some(thread) = self.threads.get_mut(&thread_id) {
            thread.registers = registers;
            thread.state = ThreadState::Waiting(reason);
            thread.processor = None;
        }

        debug!("{thread_id} parked on {reason}");
    }

    fn unblock_thread(&mut self, thread_id: ThreadId, reason: UnblockReason) {
        let Some(thread) = self.threads.get_mut(&thread_id) else { return };
        if !thread.state.is_waiting() {
            return;
        }

        thread.state = ThreadState::Ready;
        self.scheduler.enqueue(thread_id, thread.priority);
        self.trace.record(
            self.global_clock,
            EventKind::ThreadUnblocked { thread: thread_id, reason },
        );
    }

    /// Guest-level fault: the offending thread dies, the VM survives.
    fn fault_thread(
        &mut self,
        thread_id: ThreadId,
        fault: &dyn std::error::Error,
    ) -> Result<(), VmError> {
        debug!("{thread_id} faulted: {fault}");
        self.terminate_thread(thread_id, Some(yarn!("{fault}")))
    }

    /// Terminates a thread: frees its processor, deterministically releases
    /// every lock it holds and wakes joiners.
    fn terminate_thread(
        &mut self,
        thread_id: ThreadId,
        fault: Option<byteyarn::Yarn>,
    ) -> Result<(), VmError> {
        let processor = self.threads.get(&thread_id).and_then(|thread| thread.processor);
        if let Some(idx) = processor {
            if self.processors[idx].current_thread() == Some(thread_id) {
                let registers = self.processors[idx].park();
                if let Some(thread) = self.threads.get_mut(&thread_id) {
                    thread.registers = registers;
                }
            }
        }

        self.scheduler.remove(thread_id);
        if let Some(thread) = self.threads.get_mut(&thread_id) {
            thread.state = ThreadState::Terminated;
            thread.processor = None;
        }

        // Lock cleanup: waiters must never be stranded behind a dead holder.
        for (lock, next) in self.sync.release_all_held(thread_id, self.global_clock) {
            self.race.lock_released(thread_id, lock);
            self.last_releaser.insert(lock, thread_id);
            if let Some(next) = next {
                self.race.lock_acquired(next, lock);
                self.race.record_synchronization(thread_id, next, self.global_clock);
                self.unblock_thread(next, UnblockReason::LockGranted(lock));
                self.trace.record(
                    self.global_clock,
                    EventKind::LockAcquired { thread: next, lock },
                );
            }
            self.trace.record(
                self.global_clock,
                EventKind::LockReleased { thread: thread_id, lock, handed_to: next },
            );
        }

        // Wake joiners.
        let joiners: Vec<ThreadId> = self
            .threads
            .values()
            .filter(|thread| thread.state == ThreadState::Waiting(WaitReason::Join(thread_id)))
            .map(|thread| thread.id)
            .collect();
        for joiner in joiners {
            self.race.record_synchronization(thread_id, joiner, self.global_clock);
            self.unblock_thread(joiner, UnblockReason::JoinCompleted(thread_id));
        }

        self.trace.record(
            self.global_clock,
            EventKind::ThreadTerminated { thread: thread_id, fault },
        );

        Ok(())
    }

    fn charge_cycles(&mut self) {
        for thread in self.threads.values() {
            match thread.state {
                ThreadState::Running => self.scheduler.add_run_cycle(thread.id),
                ThreadState::Waiting(_) => self.scheduler.add_wait_cycle(thread.id),
                _ => {}
            }
        }
    }

    fn waiting_threads(&self) -> Vec<(ThreadId, WaitReason)> {
        let mut stuck: Vec<(ThreadId, WaitReason)> = self
            .threads
            .values()
            .filter_map(|thread| match thread.state {
                ThreadState::Waiting(reason) => Some((thread.id, reason)),
                _ => None,
            })
            .collect();
        stuck.sort_unstable_by_key(|(thread, _)| *thread);
        stuck
    }

    fn finish(&mut self) -> Result<(), VmError> {
        // Leave main memory consistent for post-run assertions.
        self.memory.flush_caches()?;
        self.state = VmState::Finished;
        self.trace.record(self.global_clock, EventKind::VmFinished);
        debug!("VM finished at clock {}", self.global_clock);
        Ok(())
    }

    /// Drops all execution state, keeping loaded programs (their data
    /// segments are written back into the fresh memory).
    pub fn reset(&mut self) -> Result<(), VmError> {
        for processor in &mut self.processors {
            processor.reset();
        }
        self.memory.reset();
        self.scheduler.reset();
        self.sync.reset();
        self.race.reset();
        self.trace.clear();
        self.threads.clear();
        self.last_releaser.clear();
        self.state = VmState::Idle;
        self.global_clock = 0;
        self.next_thread_id = 0;
        self.instructions_retired = 0;

        for program in self.programs.values() {
            for &(addr, value) in program.data_segment() {
                self.memory.poke(addr, value)?;
            }
        }

        Ok(())
    }

    // ---- introspection ----------------------------------------------------

    pub fn thread(&self, thread: ThreadId) -> Option<&Thread> {
        self.threads.get(&thread)
    }

    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    pub fn processor(&self, idx: usize) -> Option<&Processor> {
        self.processors.get(idx)
    }

    pub fn memory_system(&self) -> &MemorySystem {
        &self.memory
    }

    pub fn execution_trace(&self) -> &[ExecutionEvent] {
        self.trace.events()
    }

    pub fn trace_query(&self, filter: &TraceFilter) -> Vec<&ExecutionEvent> {
        self.trace.query(filter)
    }

    pub fn race_conditions(&self) -> &[RaceReport] {
        self.race.races()
    }

    pub fn shared_addresses(&self) -> Vec<usize> {
        self.race.shared_addresses()
    }

    pub fn sync_events(&self) -> &[SyncEvent] {
        self.sync.events()
    }

    pub fn lock_statistics(&self) -> Vec<LockStats> {
        self.sync.lock_statistics()
    }

    /// Bus transaction log, when coherence is enabled.
    pub fn coherence_events(&self) -> &[BusTransaction] {
        self.memory.coherence().map(|c| c.transactions()).unwrap_or(&[])
    }

    pub fn bus_statistics(&self) -> Option<BusStats> {
        self.memory.coherence().map(|c| c.bus_stats())
    }

    pub fn cache_statistics(&self) -> Vec<CacheStats> {
        self.memory.coherence().map(|c| c.cache_stats()).unwrap_or_default()
    }

    /// Writes every dirty cache line back so [`peek_memory`](Self::peek_memory)
    /// observes a consistent view.
    pub fn flush_caches(&mut self) -> Result<(), VmError> {
        self.memory.flush_caches().map_err(VmError::from)
    }

    pub fn peek_memory(&self, addr: usize) -> Result<Value, VmError> {
        self.memory.peek(addr).map_err(VmError::from)
    }

    pub fn statistics(&self) -> VmStatistics {
        let executed: u64 = self.threads.values().map(|t| t.execution_cycles).sum();
        let possible = self.global_clock * self.processors.len() as u64;
        let utilization = if possible == 0 {
            0.0
        } else {
            executed as f64 / possible as f64 * 100.0
        };

        VmStatistics {
            state: self.state,
            processors: self.processors.len(),
            threads: self.threads.len(),
            global_clock: self.global_clock,
            instructions_retired: self.instructions_retired,
            context_switches: self.scheduler.context_switches(),
            processor_utilization: utilization,
            race_conditions: self.race.races().len(),
            random_seed: self.config.random_seed,
        }
    }
}
