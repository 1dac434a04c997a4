use std::fmt;

use crate::value::Value;

/// MESI coherence states of a cache line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MesiState {
    /// Dirty, sole copy system-wide.
    Modified,
    /// Clean, sole copy system-wide.
    Exclusive,
    /// Clean, other caches may hold copies.
    Shared,
    /// Slot holds no usable data.
    Invalid,
}

impl fmt::Display for MesiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MesiState::Modified => write!(f, "M"),
            MesiState::Exclusive => write!(f, "E"),
            MesiState::Shared => write!(f, "S"),
            MesiState::Invalid => write!(f, "I"),
        }
    }
}

/// Geometry of one processor cache, in words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Total capacity in words.
    pub size: usize,
    /// Words per line.
    pub line_size: usize,
    /// Ways per set.
    pub associativity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig { size: 1024, line_size: 8, associativity: 4 }
    }
}

impl CacheConfig {
    fn normalized(self) -> Self {
        CacheConfig {
            size: self.size.max(1),
            line_size: self.line_size.max(1),
            associativity: self.associativity.max(1),
        }
    }
}

/// A filled cache line.
#[derive(Debug, Clone)]
pub struct CacheLine {
    /// Line-aligned base address.
    pub address: usize,
    pub data: Vec<Value>,
    pub state: MesiState,
    pub dirty: bool,
    last_access: u64,
}

/// A line pushed out to make room, handed back so the caller can write it
/// back before the slot is reused.
#[derive(Debug, Clone, PartialEq)]
pub struct EvictedLine {
    pub address: usize,
    pub data: Vec<Value>,
    pub dirty: bool,
}

/// What a local write needs from the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProbe {
    /// Hit in M or E; the write went through locally.
    Done,
    /// Hit in S; the write went through, other sharers must be invalidated.
    NeedInvalidate,
    /// Miss; the line must be fetched with exclusive ownership first.
    NeedExclusive,
}

/// Per-cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub reads: u64,
    pub writes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub state_transitions: u64,
    pub invalidations_sent: u64,
    pub invalidations_received: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.reads + self.writes;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// A set-associative write-back cache owned by one processor, with MESI
/// state per line and LRU victim selection.
#[derive(Debug)]
pub struct Cache {
    id: usize,
    config: CacheConfig,
    num_sets: usize,
    sets: Vec<Vec<Option<CacheLine>>>,
    stats: CacheStats,
    access_clock: u64,
}

impl Cache {
    pub fn new(id: usize, config: CacheConfig) -> Self {
        let config = config.normalized();
        let num_sets = (config.size / (config.line_size * config.associativity)).max(1);
        let sets = (0..num_sets)
            .map(|_| (0..config.associativity).map(|_| None).collect())
            .collect();

        Cache { id, config, num_sets, sets, stats: CacheStats::default(), access_clock: 0 }
    }

    pub fn id(&self) -> usize { self.id }

    pub fn config(&self) -> CacheConfig { self.config }

    pub fn num_sets(&self) -> usize { self.num_sets }

    pub fn stats(&self) -> CacheStats { self.stats }

    pub fn line_base(&self, addr: usize) -> usize {
        addr / self.config.line_size * self.config.line_size
    }

    fn set_index(&self, addr: usize) -> usize {
        (addr / self.config.line_size) % self.num_sets
    }

    fn offset(&self, addr: usize) -> usize {
        addr % self.config.line_size
    }

    fn find(&self, addr: usize) -> Option<(usize, usize)> {
        let base = self.line_base(addr);
        let set = self.set_index(addr);
        self.sets[set]
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|line| line.address == base))
            .map(|way| (set, way))
    }

    /// Current MESI state of the line covering `addr`; `Invalid` when the
    /// cache holds no such line.
    pub fn line_state(&self, addr: usize) -> MesiState {
        self.find(addr)
            .and_then(|(set, way)| self.sets[set][way].as_ref())
            .map(|line| line.state)
            .unwrap_or(MesiState::Invalid)
    }

    /// Local read probe. `Some` on a hit (any valid state); `None` means the
    /// controller must fetch the line over the bus.
    pub fn probe_read(&mut self, addr: usize) -> Option<Value> {
        self.stats.reads += 1;
        self.access_clock += 1;

        let Some((set, way)) = self.find(addr) else {
            self.stats.misses += 1;
            return None;
        };

        self.stats.hits += 1;
        let offset = self.offset(addr);
        let line = self.sets[set][way].as_mut()?;
        line.last_access = self.access_clock;
        Some(line.data[offset])
    }

    /// Local write probe. On a hit the word is written and the line moves to
    /// M; the return value says which bus operation (if any) the controller
    /// still owes the protocol.
    pub fn probe_write(&mut self, addr: usize, value: Value) -> WriteProbe {
        self.stats.writes += 1;
        self.access_clock += 1;

        let Some((set, way)) = self.find(addr) else {
            self.stats.misses += 1;
            return WriteProbe::NeedExclusive;
        };

        self.stats.hits += 1;
        let offset = self.offset(addr);
        let Some(line) = self.sets[set][way].as_mut() else {
            return WriteProbe::NeedExclusive;
        };
        line.last_access = self.access_clock;
        line.data[offset] = value;
        line.dirty = true;

        match line.state {
            MesiState::Modified => WriteProbe::Done,
            MesiState::Exclusive => {
                line.state = MesiState::Modified;
                self.stats.state_transitions += 1;
                WriteProbe::Done
            }
            MesiState::Shared => {
                line.state = MesiState::Modified;
                self.stats.state_transitions += 1;
                self.stats.invalidations_sent += 1;
                WriteProbe::NeedInvalidate
            }
            // A hit can only come from a valid line.
            MesiState::Invalid => WriteProbe::NeedExclusive,
        }
    }

    /// Installs a line, evicting LRU if the set is full. The evicted line is
    /// returned with its dirty flag so the caller can write it back.
    pub fn allocate(
        &mut self,
        addr: usize,
        data: Vec<Value>,
        state: MesiState,
    ) -> Option<EvictedLine> {
        let base = self.line_base(addr);
        self.access_clock += 1;

        if let Some((set, way)) = self.find(base) {
            if let Some(line) = self.sets[set][way].as_mut() {
                if line.state != state {
                    self.stats.state_transitions += 1;
                }
                line.data = data;
                line.state = state;
                line.dirty = state == MesiState::Modified;
                line.last_access = self.access_clock;
                return None;
            }
        }

        let set = self.set_index(base);
        let way = self.victim(set);
        let evicted = self.sets[set][way].take().map(|line| {
            self.stats.evictions += 1;
            EvictedLine { address: line.address, data: line.data, dirty: line.dirty }
        });

        self.stats.state_transitions += 1;
        self.sets[set][way] = Some(CacheLine {
            address: base,
            data,
            state,
            dirty: state == MesiState::Modified,
            last_access: self.access_clock,
        });

        evicted
    }

    fn victim(&self, set: usize) -> usize {
        let slots = &self.sets[set];

        if let Some(way) = slots.iter().position(|slot| slot.is_none()) {
            return way;
        }

        slots
            .iter()
            .enumerate()
            .filter_map(|(way, slot)| slot.as_ref().map(|line| (way, line.last_access)))
            .min_by_key(|&(_, last_access)| last_access)
            .map(|(way, _)| way)
            .unwrap_or(0)
    }

    /// Snoop: another cache wants a shared copy. Supplies data if we hold
    /// the line, demoting M/E to S. Returns the data and whether it was
    /// modified (the caller owes main memory a write-back in that case).
    pub fn handle_bus_read(&mut self, addr: usize) -> Option<(Vec<Value>, bool)> {
        let (set, way) = self.find(addr)?;
        let line = self.sets[set][way].as_mut()?;

        let was_modified = line.state == MesiState::Modified;
        if line.state != MesiState::Shared {
            line.state = MesiState::Shared;
            line.dirty = false;
            self.stats.state_transitions += 1;
        }

        Some((line.data.clone(), was_modified))
    }

    /// Snoop: another cache wants exclusive ownership. We drop our copy;
    /// only a Modified line answers with data (dirty write-back).
    pub fn handle_bus_read_exclusive(&mut self, addr: usize) -> Option<Vec<Value>> {
        let (set, way) = self.find(addr)?;
        let line = self.sets[set][way].take()?;
        self.stats.state_transitions += 1;
        self.stats.invalidations_received += 1;

        match line.state {
            MesiState::Modified => Some(line.data),
            _ => None,
        }
    }

    /// Snoop: invalidation broadcast. S and E drop the line; a Modified line
    /// is left untouched (its data is the only copy).
    pub fn handle_bus_invalidate(&mut self, addr: usize) -> bool {
        let Some((set, way)) = self.find(addr) else { return false };
        let Some(state) = self.sets[set][way].as_ref().map(|line| line.state) else {
            return false;
        };

        match state {
            MesiState::Shared | MesiState::Exclusive => {
                self.sets[set][way] = None;
                self.stats.state_transitions += 1;
                self.stats.invalidations_received += 1;
                true
            }
            _ => false,
        }
    }

    /// Drains every dirty line for write-back, leaving the lines resident
    /// and clean.
    pub fn flush(&mut self) -> Vec<(usize, Vec<Value>)> {
        let mut dirty = Vec::new();

        for set in &mut self.sets {
            for slot in set.iter_mut().flatten() {
                if slot.dirty {
                    dirty.push((slot.address, slot.data.clone()));
                    slot.dirty = false;
                }
            }
        }

        dirty
    }

    /// Iterates the resident lines, for invariant checks and reports.
    pub fn lines(&self) -> impl Iterator<Item = &CacheLine> {
        self.sets.iter().flatten().flatten()
    }
}
