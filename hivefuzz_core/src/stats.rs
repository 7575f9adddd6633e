use crate::device::WorkerId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatsError {
    /// A record for this worker identity is already registered.
    #[error("Worker {0} is already registered")]
    DuplicateWorker(WorkerId),
}

/// Live counters of one worker. Written only through its [`StatsHandle`].
#[derive(Debug)]
struct WorkerRecord {
    device: String,
    iterations: AtomicU64,
    execs_per_sec_bits: AtomicU64,
    crashes: AtomicU64,
    hangs: AtomicU64,
    edges: AtomicU64,
    /// Unix milliseconds of the last crash or hang; zero when none yet.
    last_finding_ms: AtomicU64,
}

impl WorkerRecord {
    fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            iterations: AtomicU64::new(0),
            execs_per_sec_bits: AtomicU64::new(0f64.to_bits()),
            crashes: AtomicU64::new(0),
            hangs: AtomicU64::new(0),
            edges: AtomicU64::new(0),
            last_finding_ms: AtomicU64::new(0),
        }
    }

    fn snapshot(&self, id: &WorkerId) -> WorkerSnapshot {
        let last_finding_ms = self.last_finding_ms.load(Ordering::Relaxed);
        WorkerSnapshot {
            worker: id.to_string(),
            device: self.device.clone(),
            instance: id.instance(),
            iterations: self.iterations.load(Ordering::Relaxed),
            execs_per_sec: f64::from_bits(self.execs_per_sec_bits.load(Ordering::Relaxed)),
            crashes: self.crashes.load(Ordering::Relaxed),
            hangs: self.hangs.load(Ordering::Relaxed),
            edges: self.edges.load(Ordering::Relaxed),
            last_finding_ms: (last_finding_ms != 0).then_some(last_finding_ms),
        }
    }
}

/// Exclusive write access to one worker's record.
///
/// Not `Clone`: the worker that registered the record is its only writer.
#[derive(Debug)]
pub struct StatsHandle {
    id: WorkerId,
    record: Arc<WorkerRecord>,
}

impl StatsHandle {
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn add_iterations(&self, count: u64) {
        self.record.iterations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_execs_per_sec(&self, rate: f64) {
        self.record
            .execs_per_sec_bits
            .store(rate.to_bits(), Ordering::Relaxed);
    }

    pub fn record_crash(&self) {
        self.record.crashes.fetch_add(1, Ordering::Relaxed);
        self.touch_last_finding();
    }

    pub fn record_hang(&self) {
        self.record.hangs.fetch_add(1, Ordering::Relaxed);
        self.touch_last_finding();
    }

    /// Coverage edges seen so far, for executors that report coverage.
    pub fn set_edges(&self, edges: u64) {
        self.record.edges.fetch_max(edges, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        self.record.snapshot(&self.id)
    }

    fn touch_last_finding(&self) {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
            .max(1);
        // fetch_max keeps the timestamp monotonic across wall-clock adjustments.
        self.record
            .last_finding_ms
            .fetch_max(now_ms, Ordering::Relaxed);
    }
}

/// Point-in-time copy of one worker's statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSnapshot {
    pub worker: String,
    pub device: String,
    pub instance: usize,
    pub iterations: u64,
    pub execs_per_sec: f64,
    pub crashes: u64,
    pub hangs: u64,
    pub edges: u64,
    pub last_finding_ms: Option<u64>,
}

/// Point-in-time copy of every registered worker, sorted by worker identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_iterations: u64,
    pub total_execs_per_sec: f64,
    pub total_crashes: u64,
    pub total_hangs: u64,
    pub workers: Vec<WorkerSnapshot>,
}

impl StatsSnapshot {
    fn from_workers(workers: Vec<WorkerSnapshot>) -> Self {
        Self {
            total_iterations: workers.iter().map(|w| w.iterations).sum(),
            total_execs_per_sec: workers.iter().map(|w| w.execs_per_sec).sum(),
            total_crashes: workers.iter().map(|w| w.crashes).sum(),
            total_hangs: workers.iter().map(|w| w.hangs).sum(),
            workers,
        }
    }
}

/// Registry of per-worker records.
///
/// The map lock is only taken to register a worker or to walk the map for a
/// snapshot; counter updates go straight to the worker's own atomics.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    records: RwLock<BTreeMap<WorkerId, Arc<WorkerRecord>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: WorkerId, device: &str) -> Result<StatsHandle, StatsError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if records.contains_key(&id) {
            return Err(StatsError::DuplicateWorker(id));
        }
        let record = Arc::new(WorkerRecord::new(device));
        records.insert(id.clone(), Arc::clone(&record));
        Ok(StatsHandle { id, record })
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let workers = records
            .iter()
            .map(|(id, record)| record.snapshot(id))
            .collect();
        StatsSnapshot::from_workers(workers)
    }
}
