//! The single outstanding query slot.
//!
//! At most one query may be in flight. Starting a new one hands back
//! the previous request so the caller can fail it; there is no queue.

use std::fmt;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::error::DevlinkError;
use crate::message::StatePatch;
use crate::state::PeerId;

/// Outcome delivered to a query's completion callback.
pub type QueryResult = Result<StatePatch, DevlinkError>;

/// Completion callback for a query. Invoked exactly once.
pub type QueryCallback = Box<dyn FnOnce(QueryResult) + Send + 'static>;

// ── PendingRequest ───────────────────────────────────────────────

/// A query awaiting its `status` reply.
pub struct PendingRequest {
    id: u64,
    peer: PeerId,
    callback: QueryCallback,
    timer: Option<JoinHandle<()>>,
    sent_at: Instant,
    deadline: Duration,
}

impl PendingRequest {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// How long this request has been in flight.
    pub fn elapsed(&self) -> Duration {
        self.sent_at.elapsed()
    }

    /// Cancel the deadline timer and hand `result` to the callback.
    pub fn complete(mut self, result: QueryResult) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        (self.callback)(result);
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("deadline", &self.deadline)
            .field("armed", &self.timer.is_some())
            .finish()
    }
}

// ── PendingSlot ──────────────────────────────────────────────────

/// Holds the one in-flight query, if any.
#[derive(Debug)]
pub struct PendingSlot {
    current: Option<PendingRequest>,
    next_id: u64,
}

impl PendingSlot {
    pub fn new() -> Self {
        Self {
            current: None,
            next_id: 1,
        }
    }

    /// Install a new request, returning its id and whatever it replaced.
    pub fn begin(
        &mut self,
        peer: PeerId,
        deadline: Duration,
        callback: QueryCallback,
    ) -> (u64, Option<PendingRequest>) {
        let id = self.next_id;
        self.next_id += 1;
        let previous = self.current.replace(PendingRequest {
            id,
            peer,
            callback,
            timer: None,
            sent_at: Instant::now(),
            deadline,
        });
        (id, previous)
    }

    /// Attach the deadline timer to request `id`.
    ///
    /// If `id` is no longer pending the timer is aborted immediately.
    pub fn arm(&mut self, id: u64, timer: JoinHandle<()>) {
        match self.current.as_mut() {
            Some(req) if req.id == id => req.timer = Some(timer),
            _ => timer.abort(),
        }
    }

    /// Take the request if it targets `peer`.
    pub fn take_for_peer(&mut self, peer: &PeerId) -> Option<PendingRequest> {
        if self.current.as_ref().is_some_and(|r| &r.peer == peer) {
            self.current.take()
        } else {
            None
        }
    }

    /// Take the request if its id is `id`. Stale deadlines get `None`.
    pub fn take_by_id(&mut self, id: u64) -> Option<PendingRequest> {
        if self.current.as_ref().is_some_and(|r| r.id == id) {
            self.current.take()
        } else {
            None
        }
    }

    pub fn take(&mut self) -> Option<PendingRequest> {
        self.current.take()
    }

    pub fn current(&self) -> Option<&PendingRequest> {
        self.current.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        self.current.is_some()
    }
}

impl Default for PendingSlot {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────
