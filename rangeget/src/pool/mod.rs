//! Byte-range allocation for multi-connection downloads.
//!
//! The [`RangePool`] owns the byte space `[0, length)` of the remote
//! resource and hands out disjoint [`Worker`] ranges to connections. Work is
//! rebalanced by splitting the laziest active worker in half whenever a new
//! connection needs something to do.
//!
//! # Layout
//!
//! ```text
//! 0                                                              length
//! ├──────── w1 ────────┼──────── w3 ────────┼──────── w2 ────────┤
//! │written│ in flight │ remaining          │ ...                │
//!         ^ current                                             ^ limit
//! ```
//!
//! Invariant: the live workers' `[current, limit)` ranges are pairwise
//! disjoint and, together with the bytes already advanced, cover the whole
//! resource exactly once.
//!
//! The pool itself is a plain data structure. Connections and the download
//! loop share it through [`SharedPool`], whose mutex makes every operation
//! linearizable.

mod worker;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use worker::{Worker, WorkerId, WorkerRecord, WorkerState};

/// A new worker must own at least this many bytes (2 MiB).
pub const MIN_WORKER_SIZE: u64 = 2 * 1024 * 1024;

/// Current pool snapshot schema version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Pool shared between the download loop and its connections.
pub type SharedPool = Arc<Mutex<RangePool>>;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors raised by pool bookkeeping.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    #[error("worker {id} cannot advance {bytes} bytes past its limit")]
    AdvancePastLimit { id: WorkerId, bytes: u64 },

    #[error("unsupported pool snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("invalid pool snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Portion of a worker's range granted to one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// File offset the bytes must be written at.
    pub offset: u64,
    /// Number of bytes granted (may be less than requested).
    pub len: u64,
}

/// Serializable pool state, stored in the download manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub version: u32,
    pub length: Option<u64>,
    pub last_chunk_id: u64,
    pub workers: Vec<WorkerRecord>,
}

/// Allocator over the byte range of a single resource.
#[derive(Debug, Clone)]
pub struct RangePool {
    length: Option<u64>,
    workers: Vec<Worker>,
    last_chunk_id: u64,
    completed: u64,
}

impl RangePool {
    /// Create a pool with a single idle worker covering the whole resource.
    ///
    /// With `length == None` that worker is unbounded and serves as the
    /// size-discovery probe.
    pub fn new(length: Option<u64>) -> Self {
        let mut pool = Self {
            length,
            workers: Vec::new(),
            last_chunk_id: 0,
            completed: 0,
        };
        if length != Some(0) {
            let id = pool.next_id();
            pool.workers.push(Worker::new(id, 0, length));
        }
        pool
    }

    /// Wrap the pool for sharing with connections.
    pub fn shared(self) -> SharedPool {
        Arc::new(Mutex::new(self))
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub fn last_chunk_id(&self) -> u64 {
        self.last_chunk_id
    }

    /// Bytes confirmed written across the whole pool.
    pub fn completed_bytes(&self) -> u64 {
        self.completed
    }

    /// True once the length is known and every byte has been advanced past.
    pub fn has_completed(&self) -> bool {
        matches!(self.length, Some(length) if self.completed >= length)
    }

    /// Completion in percent, `None` while the length is unknown.
    pub fn completion_percent(&self) -> Option<f64> {
        match self.length {
            Some(0) => Some(100.0),
            Some(length) => Some(self.completed as f64 / length as f64 * 100.0),
            None => None,
        }
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn worker(&self, id: WorkerId) -> Option<&Worker> {
        self.workers.iter().find(|w| w.id == id)
    }

    pub fn active_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.state == WorkerState::Active)
            .count()
    }

    pub fn has_idle(&self) -> bool {
        self.workers
            .iter()
            .any(|w| w.state == WorkerState::Idle && !w.is_complete())
    }

    /// Hand out the next worker for a new connection.
    ///
    /// Idle workers are handed out first. Otherwise the laziest active
    /// worker gives up the upper half of its unreserved remainder, unless
    /// that half would be smaller than [`MIN_WORKER_SIZE`].
    pub fn allocate(&mut self) -> Option<Worker> {
        if let Some(worker) = self
            .workers
            .iter_mut()
            .find(|w| w.state == WorkerState::Idle && !w.is_complete())
        {
            worker.state = WorkerState::Active;
            return Some(worker.clone());
        }

        let (index, unreserved) = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.state == WorkerState::Active)
            .filter_map(|(i, w)| w.unreserved().map(|u| (i, u)))
            .max_by_key(|&(_, unreserved)| unreserved)?;

        let half = unreserved / 2;
        if half < MIN_WORKER_SIZE {
            return None;
        }

        let donor = &self.workers[index];
        let split_at = donor.current + donor.in_flight + (unreserved - half);
        let limit = donor.limit;

        self.workers[index].limit = Some(split_at);
        let id = self.next_id();
        let mut worker = Worker::new(id, split_at, limit);
        worker.state = WorkerState::Active;
        self.workers.push(worker.clone());
        Some(worker)
    }

    /// The active worker with the most bytes left, if any is bounded.
    pub fn laziest_worker(&self) -> Option<&Worker> {
        self.workers
            .iter()
            .filter(|w| w.state == WorkerState::Active)
            .filter(|w| w.limit.is_some())
            .max_by_key(|w| w.remaining())
    }

    /// Claim up to `len` bytes at the worker's cursor for one write.
    ///
    /// The grant is cropped at the worker's limit; bytes past it belong to
    /// another worker or lie beyond the end of the resource.
    pub fn reserve(&mut self, id: WorkerId, len: u64) -> PoolResult<Reservation> {
        let worker = self.worker_mut(id)?;
        let offset = worker.current + worker.in_flight;
        let granted = match worker.unreserved() {
            Some(unreserved) => unreserved.min(len),
            None => len,
        };
        worker.in_flight += granted;
        Ok(Reservation {
            offset,
            len: granted,
        })
    }

    /// Confirm that `bytes` have been written at the worker's cursor.
    pub fn advance(&mut self, id: WorkerId, bytes: u64) -> PoolResult<()> {
        let worker = self.worker_mut(id)?;
        if let Some(remaining) = worker.remaining() {
            if bytes > remaining {
                return Err(PoolError::AdvancePastLimit { id, bytes });
            }
        }
        worker.current += bytes;
        worker.in_flight = worker.in_flight.saturating_sub(bytes);
        self.completed += bytes;
        Ok(())
    }

    /// Drop any reservation that was never written (failed write or
    /// aborted connection).
    pub fn cancel_reservation(&mut self, id: WorkerId) -> PoolResult<()> {
        self.worker_mut(id)?.in_flight = 0;
        Ok(())
    }

    /// Count a connection failure against the worker, returning the total.
    pub fn record_failure(&mut self, id: WorkerId) -> PoolResult<u32> {
        let worker = self.worker_mut(id)?;
        worker.in_flight = 0;
        worker.failures += 1;
        Ok(worker.failures)
    }

    /// Return an active worker to the idle set.
    pub fn release(&mut self, id: WorkerId) -> PoolResult<()> {
        let worker = self.worker_mut(id)?;
        worker.state = WorkerState::Idle;
        worker.in_flight = 0;
        Ok(())
    }

    /// Remove a fully consumed worker. Returns false if it still has work.
    pub fn mark_done(&mut self, id: WorkerId) -> PoolResult<bool> {
        let index = self
            .workers
            .iter()
            .position(|w| w.id == id)
            .ok_or(PoolError::UnknownWorker(id))?;
        if !self.workers[index].is_complete() {
            return Ok(false);
        }
        self.workers.remove(index);
        Ok(true)
    }

    /// Fix the resource length once a response reveals it.
    ///
    /// The unbounded worker is closed at `length` (or at its cursor, if it
    /// has already written more than that).
    pub fn bound(&mut self, length: u64) {
        let mut effective = length;
        for worker in self.workers.iter_mut().filter(|w| w.limit.is_none()) {
            let limit = length.max(worker.current + worker.in_flight);
            worker.limit = Some(limit);
            effective = effective.max(limit);
        }
        self.length = Some(effective);
    }

    /// Close an unbounded stream at its cursor: the body has ended, so
    /// whatever has been written is the whole resource.
    pub fn finalize(&mut self) -> u64 {
        for worker in self.workers.iter_mut().filter(|w| w.limit.is_none()) {
            worker.limit = Some(worker.current);
            worker.in_flight = 0;
        }
        let length = self.length.unwrap_or(self.completed).max(self.completed);
        self.length = Some(length);
        length
    }

    /// Snapshot of the pool for the manifest.
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            version: SNAPSHOT_VERSION,
            length: self.length,
            last_chunk_id: self.last_chunk_id,
            workers: self.workers.iter().map(Worker::to_record).collect(),
        }
    }

    /// Rebuild a pool from a snapshot. All restored workers start idle.
    pub fn restore(snapshot: PoolSnapshot) -> PoolResult<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(PoolError::UnsupportedVersion(snapshot.version));
        }
        let length = snapshot
            .length
            .ok_or_else(|| PoolError::InvalidSnapshot("length is unknown".to_string()))?;

        let mut records = snapshot.workers;
        records.sort_by_key(|r| r.start);

        let mut workers = Vec::with_capacity(records.len());
        let mut previous_limit = 0u64;
        let mut remaining = 0u64;
        let mut max_id = 0u64;

        for record in records {
            let limit = record.limit.ok_or_else(|| {
                PoolError::InvalidSnapshot(format!("worker {} is unbounded", record.id))
            })?;
            if record.start > record.current || record.current > limit || limit > length {
                return Err(PoolError::InvalidSnapshot(format!(
                    "worker {} has invalid range {}..{}..{} for length {}",
                    record.id, record.start, record.current, limit, length
                )));
            }
            if record.start < previous_limit {
                return Err(PoolError::InvalidSnapshot(format!(
                    "worker {} overlaps a previous worker",
                    record.id
                )));
            }
            if workers.iter().any(|w: &Worker| w.id == record.id) {
                return Err(PoolError::InvalidSnapshot(format!(
                    "duplicate worker id {}",
                    record.id
                )));
            }
            previous_limit = limit;
            max_id = max_id.max(record.id);

            if record.current == limit {
                continue;
            }
            remaining += limit - record.current;
            let mut worker = Worker::new(record.id, record.start, Some(limit));
            worker.current = record.current;
            workers.push(worker);
        }

        Ok(Self {
            length: Some(length),
            workers,
            last_chunk_id: snapshot.last_chunk_id.max(max_id),
            completed: length - remaining,
        })
    }

    fn next_id(&mut self) -> WorkerId {
        self.last_chunk_id += 1;
        self.last_chunk_id
    }

    fn worker_mut(&mut self, id: WorkerId) -> PoolResult<&mut Worker> {
        self.workers
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or(PoolError::UnknownWorker(id))
    }
}
