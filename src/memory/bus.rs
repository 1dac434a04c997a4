use std::collections::VecDeque;
use std::fmt;

use tracing::debug;

use crate::memory::cache::MesiState;
use crate::thread::ThreadId;
use crate::value::Value;

/// Operations a cache can put on the memory bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusOp {
    /// Fetch a line with intent to share.
    ReadShared,
    /// Fetch a line with intent to modify.
    ReadExclusive,
    /// Write a dirty line back to main memory.
    WriteBack,
    /// Drop every other cache's copy of a line.
    Invalidate,
}

impl fmt::Display for BusOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusOp::ReadShared => write!(f, "READ_SHARED"),
            BusOp::ReadExclusive => write!(f, "READ_EXCLUSIVE"),
            BusOp::WriteBack => write!(f, "WRITE_BACK"),
            BusOp::Invalidate => write!(f, "INVALIDATE"),
        }
    }
}

/// Outcome attached to a completed bus request.
#[derive(Debug, Clone, PartialEq)]
pub enum BusResult {
    /// Line data and the MESI state the requester installs it with.
    Data { data: Vec<Value>, state: MesiState },
    /// Acknowledgement for write-backs and invalidations.
    Ack { invalidated: bool },
}

/// One request in flight on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusRequest {
    pub op: BusOp,
    pub address: usize,
    pub processor: usize,
    pub thread: ThreadId,
    /// Payload for write-backs.
    pub data: Option<Vec<Value>>,
    pub result: Option<BusResult>,
    pub completed: bool,
}

impl BusRequest {
    pub fn new(op: BusOp, address: usize, processor: usize, thread: ThreadId) -> Self {
        BusRequest { op, address, processor, thread, data: None, result: None, completed: false }
    }

    pub fn with_data(mut self, data: Vec<Value>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_result(mut self, result: BusResult) -> Self {
        self.result = Some(result);
        self
    }
}

/// One line of the bus transaction log; doubles as the coherence-event
/// record the VM exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusTransaction {
    pub timestamp: u64,
    pub op: BusOp,
    pub address: usize,
    pub processor: usize,
    pub thread: ThreadId,
    pub completed: bool,
}

/// Bus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub total_requests: u64,
    pub read_requests: u64,
    pub write_requests: u64,
    pub invalidation_requests: u64,
    pub max_queue_length: usize,
    pub busy_cycles: u64,
}

#[derive(Debug)]
struct Pending {
    request: BusRequest,
    due_at: u64,
}

/// The shared memory bus: a latency-delayed request queue.
///
/// Every request completes exactly `latency` ticks after submission; the
/// protocol resolution itself is the coherence controller's job, so a
/// request usually arrives here with its result already attached.
#[derive(Debug)]
pub struct MemoryBus {
    latency: u64,
    pending: VecDeque<Pending>,
    stats: BusStats,
    log: Vec<BusTransaction>,
}

impl MemoryBus {
    pub fn new(latency: u64) -> Self {
        MemoryBus { latency, pending: VecDeque::new(), stats: BusStats::default(), log: Vec::new() }
    }

    pub fn latency(&self) -> u64 { self.latency }

    pub fn stats(&self) -> BusStats { self.stats }

    pub fn pending_len(&self) -> usize { self.pending.len() }

    pub fn transactions(&self) -> &[BusTransaction] { &self.log }

    /// Submits a request; it will be reported complete `latency` ticks after
    /// `timestamp`.
    pub fn request(&mut self, request: BusRequest, timestamp: u64) {
        debug!("bus <- {} {:#x} from P{}", request.op, request.address, request.processor);

        self.stats.total_requests += 1;
        match request.op {
            BusOp::ReadShared | BusOp::ReadExclusive => self.stats.read_requests += 1,
            BusOp::WriteBack => self.stats.write_requests += 1,
            BusOp::Invalidate => self.stats.invalidation_requests += 1,
        }

        self.log.push(BusTransaction {
            timestamp,
            op: request.op,
            address: request.address,
            processor: request.processor,
            thread: request.thread,
            completed: false,
        });

        self.pending.push_back(Pending { request, due_at: timestamp + self.latency });
        self.stats.max_queue_length = self.stats.max_queue_length.max(self.pending.len());
    }

    /// Advances the bus to `timestamp` and hands back every request whose
    /// latency has elapsed.
    pub fn tick(&mut self, timestamp: u64) -> Vec<BusRequest> {
        if !self.pending.is_empty() {
            self.stats.busy_cycles += 1;
        }

        let mut completed = Vec::new();
        while self.pending.front().is_some_and(|front| front.due_at <= timestamp) {
            let Some(mut pending) = self.pending.pop_front() else { break };
            pending.request.completed = true;

            self.log.push(BusTransaction {
                timestamp,
                op: pending.request.op,
                address: pending.request.address,
                processor: pending.request.processor,
                thread: pending.request.thread,
                completed: true,
            });

            completed.push(pending.request);
        }

        completed
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.stats = BusStats::default();
        self.log.clear();
    }
}
