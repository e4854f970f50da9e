//! Publication acknowledgement tracking.
//!
//! A cycle registers one pending ack per published event and waits for all of
//! them before advancing its cursors. Cancelling the tracker's token releases
//! the waiter early so shutdown is never blocked on a stalled pipeline.

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// How [`TxTracker::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Every registered event was acknowledged.
    Drained,
    /// Cancelled while acks were still outstanding.
    Cancelled {
        /// Unacknowledged events at the time of cancellation.
        pending: usize,
    },
}

/// Counts published-but-unacknowledged events.
#[derive(Debug, Clone)]
pub struct TxTracker {
    pending: Arc<watch::Sender<usize>>,
    cancel: CancellationToken,
}

impl TxTracker {
    /// Create a tracker released early by `cancel`.
    pub fn new(cancel: CancellationToken) -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            pending: Arc::new(tx),
            cancel,
        }
    }

    /// Register one pending event and return its ack handle.
    pub fn add(&self) -> PendingAck {
        self.pending.send_modify(|n| *n += 1);
        PendingAck {
            tracker: self.clone(),
        }
    }

    /// Acknowledge one event. Extra acks are ignored.
    pub fn ack(&self) {
        self.pending.send_if_modified(|n| {
            if *n == 0 {
                return false;
            }
            *n -= 1;
            true
        });
    }

    /// Events still waiting for acknowledgement.
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Wait until every registered event is acknowledged or the tracker is
    /// cancelled. Returns immediately when nothing is pending.
    pub async fn wait(&self) -> WaitOutcome {
        let mut rx = self.pending.subscribe();
        tokio::select! {
            biased;
            result = rx.wait_for(|n| *n == 0) => {
                // The sender lives in self, so the channel cannot close here.
                debug_assert!(result.is_ok());
                WaitOutcome::Drained
            }
            _ = self.cancel.cancelled() => WaitOutcome::Cancelled {
                pending: self.pending(),
            },
        }
    }
}

/// Ack handle for a single published event.
///
/// Handed to the publisher alongside the event; the pipeline calls
/// [`PendingAck::ack`] once the event has been accepted downstream.
#[derive(Debug)]
#[must_use = "an unacknowledged event blocks the cycle"]
pub struct PendingAck {
    tracker: TxTracker,
}

impl PendingAck {
    /// Acknowledge the event.
    pub fn ack(self) {
        self.tracker.ack();
    }
}
