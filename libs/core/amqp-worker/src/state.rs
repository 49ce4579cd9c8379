//! Lifecycle state shared by the dispatch loop, the middleware and `stop()`.

use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Lifecycle phase of a worker.
///
/// `Running → ShuttingDown → Draining → Closed`; there is no way back to
/// `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    /// Accepting new deliveries
    Running,
    /// Intake blocked, nothing in flight
    ShuttingDown,
    /// Intake blocked, waiting for in-flight messages
    Draining,
    /// Channel and connection closed
    Closed,
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerPhase::Running => write!(f, "running"),
            WorkerPhase::ShuttingDown => write!(f, "shutting_down"),
            WorkerPhase::Draining => write!(f, "draining"),
            WorkerPhase::Closed => write!(f, "closed"),
        }
    }
}

/// Mutable state of one worker instance.
///
/// `shutting_down` and `in_flight` are only mutated by the middleware and the
/// shutdown coordinator. The consumer tag is written once by `run()`.
#[derive(Debug, Default)]
pub struct WorkerState {
    shutting_down: AtomicBool,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    consumer_tag: OnceLock<String>,
}

impl WorkerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Block intake of new messages. Returns `false` if already set.
    pub fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::SeqCst)
    }

    /// Number of admitted messages whose ack/nack has not been issued yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Admit one message for processing.
    ///
    /// The count is decremented when the returned guard is dropped, whichever
    /// way processing ends.
    pub fn admit(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard { state: self }
    }

    /// Consumer tag of the active subscription, if any.
    pub fn consumer_tag(&self) -> Option<&str> {
        self.consumer_tag.get().map(String::as_str)
    }

    /// Record the consumer tag. Returns `false` if one was already recorded.
    pub fn set_consumer_tag(&self, tag: impl Into<String>) -> bool {
        self.consumer_tag.set(tag.into()).is_ok()
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> WorkerPhase {
        if self.closed.load(Ordering::SeqCst) {
            WorkerPhase::Closed
        } else if !self.is_shutting_down() {
            WorkerPhase::Running
        } else if self.in_flight() > 0 {
            WorkerPhase::Draining
        } else {
            WorkerPhase::ShuttingDown
        }
    }
}

/// Scoped in-flight registration returned by [`WorkerState::admit`].
#[must_use = "dropping the guard immediately releases the in-flight slot"]
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    state: &'a WorkerState,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let previous = self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "in-flight count underflow");
    }
}
