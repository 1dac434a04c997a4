pub mod bus;
pub mod cache;

use thiserror::Error;
use tracing::debug;

use crate::thread::ThreadId;
use crate::value::Value;

use self::bus::{BusOp, BusRequest, BusResult, BusStats, BusTransaction, MemoryBus};
use self::cache::{Cache, CacheConfig, CacheStats, MesiState, WriteProbe};

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("address {addr:#x} out of range (memory holds {size} words)")]
    AddressOutOfRange { addr: usize, size: usize },
}

/// Flat word-addressable main memory.
#[derive(Debug)]
pub struct MainMemory {
    words: Vec<Value>,
}

impl MainMemory {
    pub fn new(size: usize) -> Self {
        MainMemory { words: vec![Value::ZERO; size] }
    }

    pub fn size(&self) -> usize { self.words.len() }

    pub fn read(&self, addr: usize) -> Result<Value, MemoryError> {
        self.words
            .get(addr)
            .copied()
            .ok_or(MemoryError::AddressOutOfRange { addr, size: self.words.len() })
    }

    pub fn write(&mut self, addr: usize, value: Value) -> Result<(), MemoryError> {
        let size = self.words.len();
        match self.words.get_mut(addr) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(MemoryError::AddressOutOfRange { addr, size }),
        }
    }

    /// Reads the whole line starting at the line-aligned `base`.
    pub fn read_line(&self, base: usize, line_size: usize) -> Result<Vec<Value>, MemoryError> {
        let end = base + line_size;
        if end > self.words.len() {
            return Err(MemoryError::AddressOutOfRange { addr: end - 1, size: self.words.len() });
        }
        Ok(self.words[base..end].to_vec())
    }

    pub fn write_line(&mut self, base: usize, data: &[Value]) -> Result<(), MemoryError> {
        let end = base + data.len();
        if end > self.words.len() {
            return Err(MemoryError::AddressOutOfRange { addr: end - 1, size: self.words.len() });
        }
        self.words[base..end].copy_from_slice(data);
        Ok(())
    }
}

/// Snooping MESI controller: one private cache per processor, connected by
/// the latency-modelled [`MemoryBus`].
///
/// Protocol resolution is synchronous (the snoop happens at access time);
/// the matching bus request is queued so latency and traffic statistics
/// still reflect every transaction.
#[derive(Debug)]
pub struct CoherenceController {
    caches: Vec<Cache>,
    bus: MemoryBus,
    line_size: usize,
}

impl CoherenceController {
    pub fn new(num_processors: usize, config: CacheConfig, bus_latency: u64) -> Self {
        let caches = (0..num_processors).map(|id| Cache::new(id, config)).collect();
        CoherenceController { caches, bus: MemoryBus::new(bus_latency), line_size: config.line_size.max(1) }
    }

    pub fn cache(&self, processor: usize) -> Option<&Cache> {
        self.caches.get(processor)
    }

    pub fn bus(&self) -> &MemoryBus { &self.bus }

    pub fn bus_stats(&self) -> BusStats { self.bus.stats() }

    pub fn transactions(&self) -> &[BusTransaction] { self.bus.transactions() }

    pub fn cache_stats(&self) -> Vec<CacheStats> {
        self.caches.iter().map(|c| c.stats()).collect()
    }

    pub fn read(
        &mut self,
        addr: usize,
        processor: usize,
        thread: ThreadId,
        timestamp: u64,
        main: &mut MainMemory,
    ) -> Result<Value, MemoryError> {
        // Bounds are checked against main memory even on a cache hit, so a
        // wild address faults deterministically.
        main.read(addr)?;

        if let Some(value) = self.caches[processor].probe_read(addr) {
            return Ok(value);
        }

        let base = self.caches[processor].line_base(addr);
        let offset = addr - base;

        // Miss: snoop the other caches, falling back to main memory.
        let mut snooped = None;
        for other in 0..self.caches.len() {
            if other == processor {
                continue;
            }
            if let Some((data, was_modified)) = self.caches[other].handle_bus_read(base) {
                if was_modified {
                    main.write_line(base, &data)?;
                }
                snooped = Some(data);
                break;
            }
        }

        let (data, state) = match snooped {
            Some(data) => (data, MesiState::Shared),
            None => (main.read_line(base, self.line_size)?, MesiState::Exclusive),
        };
        let value = data[offset];

        debug!("P{processor} miss @ {addr:#x}: fill {base:#x} as {state}");

        self.bus.request(
            BusRequest::new(BusOp::ReadShared, addr, processor, thread)
                .with_result(BusResult::Data { data: data.clone(), state }),
            timestamp,
        );
        self.install(processor, base, data, state, thread, timestamp, main)?;

        Ok(value)
    }

    pub fn write(
        &mut self,
        addr: usize,
        value: Value,
        processor: usize,
        thread: ThreadId,
        timestamp: u64,
        main: &mut MainMemory,
    ) -> Result<(), MemoryError> {
        main.read(addr)?;

        match self.caches[processor].probe_write(addr, value) {
            WriteProbe::Done => Ok(()),
            WriteProbe::NeedInvalidate => {
                let base = self.caches[processor].line_base(addr);
                let mut invalidated = false;
                for other in 0..self.caches.len() {
                    if other != processor && self.caches[other].handle_bus_invalidate(base) {
                        invalidated = true;
                    }
                }

                self.bus.request(
                    BusRequest::new(BusOp::Invalidate, addr, processor, thread)
                        .with_result(BusResult::Ack { invalidated }),
                    timestamp,
                );
                Ok(())
            }
            WriteProbe::NeedExclusive => {
                let base = self.caches[processor].line_base(addr);
                let offset = addr - base;

                // Claim exclusive ownership: every other copy is dropped and
                // a Modified owner hands the dirty line over.
                let mut owned = None;
                for other in 0..self.caches.len() {
                    if other == processor {
                        continue;
                    }
                    if let Some(data) = self.caches[other].handle_bus_read_exclusive(base) {
                        main.write_line(base, &data)?;
                        owned = Some(data);
                    }
                }

                let mut data = match owned {
                    Some(data) => data,
                    None => main.read_line(base, self.line_size)?,
                };
                data[offset] = value;

                debug!("P{processor} write miss @ {addr:#x}: own {base:#x} as M");

                self.bus.request(
                    BusRequest::new(BusOp::ReadExclusive, addr, processor, thread)
                        .with_result(BusResult::Data { data: data.clone(), state: MesiState::Modified }),
                    timestamp,
                );
                self.install(processor, base, data, MesiState::Modified, thread, timestamp, main)
            }
        }
    }

    fn install(
        &mut self,
        processor: usize,
        base: usize,
        data: Vec<Value>,
        state: MesiState,
        thread: ThreadId,
        timestamp: u64,
        main: &mut MainMemory,
    ) -> Result<(), MemoryError> {
        if let Some(evicted) = self.caches[processor].allocate(base, data, state) {
            if evicted.dirty {
                main.write_line(evicted.address, &evicted.data)?;
                self.bus.request(
                    BusRequest::new(BusOp::WriteBack, evicted.address, processor, thread)
                        .with_data(evicted.data)
                        .with_result(BusResult::Ack { invalidated: false }),
                    timestamp,
                );
            }
        }
        Ok(())
    }

    /// Completes due bus requests. Called once per VM clock tick.
    pub fn tick(&mut self, timestamp: u64) {
        for request in self.bus.tick(timestamp) {
            debug!("bus -> {} {:#x} complete", request.op, request.address);
        }
    }

    /// Writes every dirty line back so main memory is a consistent view.
    pub fn flush(&mut self, main: &mut MainMemory) -> Result<(), MemoryError> {
        for cache in &mut self.caches {
            for (addr, data) in cache.flush() {
                main.write_line(addr, &data)?;
            }
        }
        Ok(())
    }

    /// MESI safety check: at most one cache holds a line in M, and an M/E
    /// holder excludes every other valid copy.
    pub fn coherence_holds(&self, addr: usize) -> bool {
        let mut modified = 0usize;
        let mut exclusive = 0usize;
        let mut valid = 0usize;

        for cache in &self.caches {
            match cache.line_state(addr) {
                MesiState::Modified => {
                    modified += 1;
                    valid += 1;
                }
                MesiState::Exclusive => {
                    exclusive += 1;
                    valid += 1;
                }
                MesiState::Shared => valid += 1,
                MesiState::Invalid => {}
            }
        }

        let owners = modified + exclusive;
        modified <= 1 && owners <= 1 && (owners == 0 || valid == owners)
    }

    pub fn reset(&mut self) {
        let config = self.caches.first().map(|c| c.config()).unwrap_or_default();
        let n = self.caches.len();
        self.caches = (0..n).map(|id| Cache::new(id, config)).collect();
        self.bus.reset();
    }
}

/// The VM's view of memory: flat main memory, optionally fronted by the
/// coherent cache hierarchy.
#[derive(Debug)]
pub struct MemorySystem {
    main: MainMemory,
    coherence: Option<CoherenceController>,
}

impl MemorySystem {
    pub fn flat(size: usize) -> Self {
        MemorySystem { main: MainMemory::new(size), coherence: None }
    }

    pub fn coherent(
        size: usize,
        num_processors: usize,
        config: CacheConfig,
        bus_latency: u64,
    ) -> Self {
        MemorySystem {
            main: MainMemory::new(size),
            coherence: Some(CoherenceController::new(num_processors, config, bus_latency)),
        }
    }

    pub fn size(&self) -> usize { self.main.size() }

    pub fn coherence(&self) -> Option<&CoherenceController> {
        self.coherence.as_ref()
    }

    pub fn read(
        &mut self,
        addr: usize,
        processor: usize,
        thread: ThreadId,
        timestamp: u64,
    ) -> Result<Value, MemoryError> {
        match &mut self.coherence {
            Some(controller) => controller.read(addr, processor, thread, timestamp, &mut self.main),
            None => self.main.read(addr),
        }
    }

    pub fn write(
        &mut self,
        addr: usize,
        value: Value,
        processor: usize,
        thread: ThreadId,
        timestamp: u64,
    ) -> Result<(), MemoryError> {
        match &mut self.coherence {
            Some(controller) => {
                controller.write(addr, value, processor, thread, timestamp, &mut self.main)
            }
            None => self.main.write(addr, value),
        }
    }

    /// Atomic compare-and-swap. Runs through the same coherence path as the
    /// surrounding reads and writes; the driver calls it while no other
    /// processor's effects are in flight, which makes it atomic. Returns the
    /// success flag and the value observed before any swap.
    pub fn compare_and_swap(
        &mut self,
        addr: usize,
        expected: Value,
        new: Value,
        processor: usize,
        thread: ThreadId,
        timestamp: u64,
    ) -> Result<(bool, Value), MemoryError> {
        let current = self.read(addr, processor, thread, timestamp)?;
        if current != expected {
            return Ok((false, current));
        }
        self.write(addr, new, processor, thread, timestamp)?;
        Ok((true, current))
    }

    /// Direct main-memory write, used when loading program data segments.
    pub fn poke(&mut self, addr: usize, value: Value) -> Result<(), MemoryError> {
        self.main.write(addr, value)
    }

    /// Direct main-memory read. Only guaranteed consistent after
    /// [`flush_caches`](Self::flush_caches).
    pub fn peek(&self, addr: usize) -> Result<Value, MemoryError> {
        self.main.read(addr)
    }

    pub fn tick(&mut self, timestamp: u64) {
        if let Some(controller) = &mut self.coherence {
            controller.tick(timestamp);
        }
    }

    pub fn flush_caches(&mut self) -> Result<(), MemoryError> {
        match &mut self.coherence {
            Some(controller) => controller.flush(&mut self.main),
            None => Ok(()),
        }
    }

    pub fn reset(&mut self) {
        self.main = MainMemory::new(self.main.size());
        if let Some(controller) = &mut self.coherence {
            controller.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coherent() -> MemorySystem {
        MemorySystem::coherent(
            1 << 12,
            2,
            CacheConfig { size: 64, line_size: 8, associativity: 2 },
            1,
        )
    }

    #[test]
    fn out_of_range_access_faults() {
        let mut mem = MemorySystem::flat(16);
        assert!(mem.read(16, 0, ThreadId(0), 0).is_err());
        assert!(mem.write(100, Value(1), 0, ThreadId(0), 0).is_err());
    }

    #[test]
    fn cross_processor_round_trip_ends_shared() {
        let mut mem = coherent();

        mem.write(32, Value(7), 0, ThreadId(0), 0).unwrap();
        let got = mem.read(32, 1, ThreadId(1), 1).unwrap();
        assert_eq!(got, Value(7));

        let controller = mem.coherence().unwrap();
        assert_eq!(controller.cache(0).unwrap().line_state(32), MesiState::Shared);
        assert_eq!(controller.cache(1).unwrap().line_state(32), MesiState::Shared);
        assert!(controller.coherence_holds(32));
    }

    #[test]
    fn write_invalidates_other_sharers() {
        let mut mem = coherent();

        mem.write(8, Value(1), 0, ThreadId(0), 0).unwrap();
        mem.read(8, 1, ThreadId(1), 1).unwrap();

        // Both shared now; a new write from P1 must invalidate P0.
        mem.write(8, Value(2), 1, ThreadId(1), 2).unwrap();
        let controller = mem.coherence().unwrap();
        assert_eq!(controller.cache(1).unwrap().line_state(8), MesiState::Modified);
        assert_eq!(controller.cache(0).unwrap().line_state(8), MesiState::Invalid);
        assert!(controller.coherence_holds(8));

        assert_eq!(mem.read(8, 0, ThreadId(0), 3).unwrap(), Value(2));
    }

    #[test]
    fn flush_makes_main_memory_consistent() {
        let mut mem = coherent();
        mem.write(40, Value(9), 0, ThreadId(0), 0).unwrap();

        // Dirty data lives in P0's cache, not main memory.
        assert_eq!(mem.peek(40).unwrap(), Value::ZERO);

        mem.flush_caches().unwrap();
        assert_eq!(mem.peek(40).unwrap(), Value(9));
    }

    #[test]
    fn cas_succeeds_once() {
        let mut mem = coherent();
        mem.write(16, Value(0), 0, ThreadId(0), 0).unwrap();

        let (ok, observed) = mem.compare_and_swap(16, Value(0), Value(1), 0, ThreadId(0), 1).unwrap();
        assert!(ok);
        assert_eq!(observed, Value(0));

        let (ok, observed) = mem.compare_and_swap(16, Value(0), Value(2), 1, ThreadId(1), 2).unwrap();
        assert!(!ok);
        assert_eq!(observed, Value(1));
        assert_eq!(mem.read(16, 1, ThreadId(1), 3).unwrap(), Value(1));
    }
}
