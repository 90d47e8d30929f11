//! Per-service request queue: holds inbound requests while their service
//! warms up and releases them, in FIFO order, the moment it becomes ready.
//!
//! A waiter is a single-shot [`tokio::sync::oneshot`] channel; the deadline
//! race is expressed as a `tokio::select!` between the receiver and a
//! `tokio::time::sleep`, rather than a separate timer thread.

use {
    dashmap::DashMap,
    std::{collections::VecDeque, time::Duration},
    tokio::sync::{Mutex, oneshot},
};

/// Why a queued waiter's wait resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    Released,
    TimedOut,
    Cancelled,
}

struct Waiter {
    /// Identifies this waiter for `timeout`'s idempotent removal-by-identity.
    fingerprint: u64,
    resolver: oneshot::Sender<QueueOutcome>,
}

#[derive(Default)]
struct ServiceQueue {
    waiters: VecDeque<Waiter>,
}

/// Bounded, per-service FIFO queue of waiters for a cold-starting service.
pub struct RequestQueue {
    queues: DashMap<String, Mutex<ServiceQueue>>,
    next_fingerprint: std::sync::atomic::AtomicU64,
}

/// Returned by [`RequestQueue::queue`]: a receiver that resolves to how the
/// wait ended, and the fingerprint used to cancel it early via `timeout`.
pub struct QueueTicket {
    pub fingerprint: u64,
    pub receiver: oneshot::Receiver<QueueOutcome>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            next_fingerprint: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn queue_for(
        &self,
        service_id: &str,
    ) -> dashmap::mapref::one::Ref<'_, String, Mutex<ServiceQueue>> {
        self.queues.entry(service_id.to_string()).or_default();
        self.queues.get(service_id).unwrap()
    }

    /// Enqueues a new waiter. Fails with `None` if the queue is already at
    /// `queue_size` capacity ("queue full" — the caller should answer with
    /// *service busy*).
    pub async fn queue(&self, service_id: &str, queue_size: usize) -> Option<QueueTicket> {
        let entry = self.queue_for(service_id);
        let mut service_queue = entry.lock().await;
        if service_queue.waiters.len() >= queue_size {
            return None;
        }

        let fingerprint = self
            .next_fingerprint
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        service_queue.waiters.push_back(Waiter {
            fingerprint,
            resolver: tx,
        });

        Some(QueueTicket {
            fingerprint,
            receiver: rx,
        })
    }

    /// Waits on a ticket up to `deadline`, racing the release channel
    /// against the timer. On expiry, removes the waiter by identity (a
    /// no-op if it was already released or cancelled) and reports timeout.
    pub async fn wait(
        &self,
        service_id: &str,
        ticket: QueueTicket,
        deadline: Duration,
    ) -> QueueOutcome {
        tokio::select! {
            result = ticket.receiver => result.unwrap_or(QueueOutcome::Cancelled),
            _ = tokio::time::sleep(deadline) => {
                self.remove(service_id, ticket.fingerprint).await;
                QueueOutcome::TimedOut
            }
        }
    }

    async fn remove(&self, service_id: &str, fingerprint: u64) {
        let entry = self.queue_for(service_id);
        let mut service_queue = entry.lock().await;
        service_queue
            .waiters
            .retain(|w| w.fingerprint != fingerprint);
    }

    /// Releases every waiter for `service_id`, in FIFO order. Called exactly
    /// once per successful startup.
    pub async fn release_all(&self, service_id: &str, _payload: ()) {
        let entry = self.queue_for(service_id);
        let mut service_queue = entry.lock().await;
        while let Some(waiter) = service_queue.waiters.pop_front() {
            let _ = waiter.resolver.send(QueueOutcome::Released);
        }
    }

    /// Completes every waiter for `service_id` with cancellation. Called on
    /// startup failure.
    pub async fn cancel_all(&self, service_id: &str) {
        let entry = self.queue_for(service_id);
        let mut service_queue = entry.lock().await;
        while let Some(waiter) = service_queue.waiters.pop_front() {
            let _ = waiter.resolver.send(QueueOutcome::Cancelled);
        }
    }

    /// Current number of waiters for `service_id`, for status reporting.
    pub fn pending(&self, service_id: &str) -> usize {
        self.queues
            .get(service_id)
            .map(|q| q.try_lock().map(|g| g.waiters.len()).unwrap_or(0))
            .unwrap_or(0)
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}
