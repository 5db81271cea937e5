//! Delayed-visibility holding queue.
//!
//! A [`DelayLine`] holds messages keyed on a not-before instant. One release
//! loop per line sleeps until the earliest deadline, takes every due message
//! under the lock and hands each to the release callback, which routes it.
//! Messages with equal deadlines leave in publish order.

use super::OutboundMessage;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// One message waiting for its deadline.
#[derive(Debug)]
pub(crate) struct Held {
    pub not_before: Instant,
    seq: u64,
    pub routing_key: String,
    pub message: OutboundMessage,
}

// Reversed so `BinaryHeap` pops the earliest deadline first.
impl Ord for Held {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .not_before
            .cmp(&self.not_before)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Held {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Held {
    fn eq(&self, other: &Self) -> bool {
        self.not_before == other.not_before && self.seq == other.seq
    }
}

impl Eq for Held {}

#[derive(Default)]
pub(crate) struct DelayLine {
    held: Mutex<BinaryHeap<Held>>,
    seq: AtomicU64,
    wake: Notify,
    stopped: AtomicBool,
}

impl DelayLine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hold a message until `delay` from now.
    pub fn hold(&self, routing_key: String, message: OutboundMessage, delay: Duration) {
        let held = Held {
            not_before: Instant::now() + delay,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            routing_key,
            message,
        };
        self.held.lock().push(held);
        // The new message may be due before whatever the loop is sleeping on.
        self.wake.notify_one();
    }

    /// Remove and return every message due at `now`, earliest first.
    pub fn take_due(&self, now: Instant) -> Vec<Held> {
        let mut held = self.held.lock();
        let mut due = Vec::new();
        while held.peek().is_some_and(|next| next.not_before <= now) {
            if let Some(next) = held.pop() {
                due.push(next);
            }
        }
        due
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.held.lock().peek().map(|next| next.not_before)
    }

    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Spawn the release loop for a line.
pub(crate) fn spawn_release_loop<F>(line: Arc<DelayLine>, release: F) -> tokio::task::JoinHandle<()>
where
    F: Fn(String, OutboundMessage) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            if line.is_stopped() {
                break;
            }

            for held in line.take_due(Instant::now()) {
                debug!(routing_key = %held.routing_key, "Releasing delayed message");
                release(held.routing_key, held.message);
            }

            match line.next_deadline() {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = line.wake.notified() => {}
                    }
                }
                None => line.wake.notified().await,
            }
        }
        debug!("Delay release loop stopped");
    })
}
