//! A claimed byte sub-range of the pool.

use serde::{Deserialize, Serialize};

/// Identifier of a worker, stable across manifest save/restore.
pub type WorkerId = u64;

/// Whether a worker is currently driven by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for a connection (fresh pool or restored from a manifest).
    Idle,
    /// Owned by exactly one live connection.
    Active,
}

/// A claimed sub-range `[start, limit)` with a progress cursor `current`.
///
/// `limit == None` means unbounded: only the very first probe worker of a
/// pool whose length is not known yet has no upper bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    pub(crate) id: WorkerId,
    pub(crate) start: u64,
    pub(crate) current: u64,
    pub(crate) limit: Option<u64>,
    pub(crate) state: WorkerState,
    /// Bytes handed out by `reserve` but not yet confirmed by `advance`.
    pub(crate) in_flight: u64,
    /// Number of times a connection for this worker has failed.
    pub(crate) failures: u32,
}

impl Worker {
    pub(crate) fn new(id: WorkerId, start: u64, limit: Option<u64>) -> Self {
        Self {
            id,
            start,
            current: start,
            limit,
            state: WorkerState::Idle,
            in_flight: 0,
            failures: 0,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// Offset of the next byte this worker will write.
    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Bytes left to write, `None` when unbounded.
    pub fn remaining(&self) -> Option<u64> {
        self.limit.map(|limit| limit - self.current)
    }

    /// Bytes left that are not already reserved by an in-flight write.
    pub(crate) fn unreserved(&self) -> Option<u64> {
        self.remaining().map(|r| r.saturating_sub(self.in_flight))
    }

    /// Bytes written through this worker so far.
    pub fn completed(&self) -> u64 {
        self.current - self.start
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == Some(0)
    }

    /// Value for the HTTP `Range` header, `None` for a plain full GET.
    pub fn range_header(&self) -> Option<String> {
        match self.limit {
            None if self.current == 0 => None,
            None => Some(format!("bytes={}-", self.current)),
            Some(limit) => Some(format!("bytes={}-{}", self.current, limit.saturating_sub(1))),
        }
    }

    pub(crate) fn to_record(&self) -> WorkerRecord {
        WorkerRecord {
            id: self.id,
            start: self.start,
            current: self.current,
            limit: self.limit,
        }
    }
}

/// Serialized form of a worker inside a pool snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub start: u64,
    pub current: u64,
    pub limit: Option<u64>,
}
