//! Single-consumer delivery queue with exponential backoff on rate limiting.
//!
//! Producers hand messages to a [`QueueSender`] and return immediately; one
//! worker task drains the queue in submission order and performs the HTTP
//! calls. Per message:
//!
//! ```text
//! Pending ─► Sending ─┬─► Delivered
//!                     ├─► Pending(attempt + 1), back at the tail   (429)
//!                     └─► Dropped, logged                          (anything else)
//! ```
//!
//! A re-queued message waits `backoff_unit × 1.5^(attempt-1)` before its next
//! attempt, so it may be delivered after messages submitted later. Rate-limited
//! messages are retried without limit.

use crate::matrix::client::{DeliveryError, HomeserverClient, Request};
use crate::matrix::message::Message;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Growth factor between successive retries of the same message.
const BACKOFF_RATIO: f64 = 1.5;

/// Tuning for the delivery worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueOptions {
    /// Wait before the first retry; later retries grow by 1.5x each.
    pub backoff_unit: Duration,
    /// Upper bound on a single backoff wait.
    pub max_backoff: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            backoff_unit: Duration::from_secs(1),
            max_backoff: Duration::from_secs(3600),
        }
    }
}

impl QueueOptions {
    /// Wait before sending a message on its `attempt`-th retry.
    ///
    /// Zero for a first attempt, then 1x, 1.5x, 2.25x, ... the backoff unit,
    /// clamped to `max_backoff`. A cap below the unit is raised to the unit,
    /// so a retry never goes out without waiting.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let cap = self.max_backoff.max(self.backoff_unit);
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.backoff_unit.as_secs_f64() * BACKOFF_RATIO.powi(exponent);
        if !secs.is_finite() || secs >= cap.as_secs_f64() {
            return cap;
        }
        Duration::from_secs_f64(secs)
    }
}

/// A request owned by the queue, with the number of times it was rate limited.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub room_id: String,
    pub request: Request,
    pub attempt: u32,
}

/// Point-in-time counters for the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Messages waiting to be picked up by the worker.
    pub depth: usize,
    pub delivered: u64,
    pub rate_limited: u64,
    pub dropped: u64,
    /// Backoff sleeps taken before retries.
    pub backoffs: u64,
}

#[derive(Debug, Default)]
struct Counters {
    depth: AtomicUsize,
    delivered: AtomicU64,
    rate_limited: AtomicU64,
    dropped: AtomicU64,
    backoffs: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            depth: self.depth.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            backoffs: self.backoffs.load(Ordering::Relaxed),
        }
    }
}

/// Producer side of the queue. Cheap to clone; every feed poller holds one.
#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<Outbound>,
    counters: Arc<Counters>,
}

impl QueueSender {
    /// Appends a request to the tail of the queue. Never blocks.
    ///
    /// After the queue has shut down the request is discarded with a warning.
    pub fn enqueue(&self, room_id: impl Into<String>, request: Request) {
        let outbound = Outbound {
            room_id: room_id.into(),
            request,
            attempt: 0,
        };
        push(&self.tx, &self.counters, outbound);
    }

    /// Queues a join for `room_id` followed by `message`.
    pub fn send_message(&self, room_id: &str, message: Message) {
        self.enqueue(room_id, Request::Join);
        self.enqueue(room_id, Request::Send(message));
    }

    pub fn depth(&self) -> usize {
        self.counters.depth.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> DeliveryStats {
        self.counters.snapshot()
    }
}

fn push(tx: &mpsc::UnboundedSender<Outbound>, counters: &Counters, outbound: Outbound) {
    counters.depth.fetch_add(1, Ordering::Relaxed);
    if let Err(mpsc::error::SendError(lost)) = tx.send(outbound) {
        counters.depth.fetch_sub(1, Ordering::Relaxed);
        tracing::warn!(
            room = %lost.room_id,
            kind = lost.request.kind(),
            "Delivery queue is shut down, discarding request"
        );
    }
}

/// Owner of the delivery worker.
///
/// Dropping the queue stops the worker at its next suspension point; call
/// [`shutdown`](Self::shutdown) to also wait for it to finish.
pub struct DeliveryQueue {
    sender: QueueSender,
    shutdown_tx: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl DeliveryQueue {
    /// Spawns the worker on the current tokio runtime.
    pub fn start(client: HomeserverClient, options: QueueOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());

        let worker = Worker {
            client,
            options,
            rx,
            requeue: tx.clone(),
            counters: Arc::clone(&counters),
            joined: HashSet::new(),
        };
        let worker = tokio::spawn(worker.run(shutdown_rx));

        Self {
            sender: QueueSender { tx, counters },
            shutdown_tx,
            worker,
        }
    }

    pub fn sender(&self) -> QueueSender {
        self.sender.clone()
    }

    pub fn stats(&self) -> DeliveryStats {
        self.sender.stats()
    }

    /// Stops the worker and waits for it. Messages still queued are lost.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.worker.await {
            tracing::warn!(error = %e, "Delivery worker panicked");
        }

        let pending = self.sender.depth();
        if pending > 0 {
            tracing::warn!(pending = pending, "Delivery queue stopped with undelivered messages");
        } else {
            tracing::info!("Delivery queue stopped");
        }
    }
}

struct Worker {
    client: HomeserverClient,
    options: QueueOptions,
    rx: mpsc::UnboundedReceiver<Outbound>,
    requeue: mpsc::UnboundedSender<Outbound>,
    counters: Arc<Counters>,
    /// Rooms joined successfully; later joins for them are skipped.
    joined: HashSet<String>,
}

impl Worker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!("Delivery worker started");

        loop {
            let outbound = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = self.rx.recv() => match next {
                    Some(outbound) => outbound,
                    None => break,
                },
            };
            self.counters.depth.fetch_sub(1, Ordering::Relaxed);

            if outbound.attempt > 0 {
                let delay = self.options.backoff_delay(outbound.attempt);
                tracing::debug!(
                    room = %outbound.room_id,
                    kind = outbound.request.kind(),
                    attempt = outbound.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Backing off before retry"
                );
                self.counters.backoffs.fetch_add(1, Ordering::Relaxed);

                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = self.process(outbound) => {}
            }
        }

        tracing::debug!("Delivery worker stopped");
    }

    async fn process(&mut self, outbound: Outbound) {
        if outbound.request == Request::Join && self.joined.contains(&outbound.room_id) {
            tracing::trace!(room = %outbound.room_id, "Already joined, skipping join");
            return;
        }

        match self.client.deliver(&outbound.room_id, &outbound.request).await {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                if outbound.request == Request::Join {
                    self.joined.insert(outbound.room_id.clone());
                }
                tracing::debug!(
                    room = %outbound.room_id,
                    kind = outbound.request.kind(),
                    attempt = outbound.attempt,
                    "Delivered"
                );
            }
            Err(DeliveryError::RateLimited) => {
                self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                let retry = Outbound {
                    attempt: outbound.attempt.saturating_add(1),
                    ..outbound
                };
                tracing::warn!(
                    room = %retry.room_id,
                    kind = retry.request.kind(),
                    attempt = retry.attempt,
                    "Rate limited by homeserver, re-queueing"
                );
                push(&self.requeue, &self.counters, retry);
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                if matches!(outbound.request, Request::Send(_)) {
                    // Membership may be gone; join again before the next send.
                    self.joined.remove(&outbound.room_id);
                }
                tracing::error!(
                    room = %outbound.room_id,
                    kind = outbound.request.kind(),
                    attempt = outbound.attempt,
                    error = %e,
                    "Dropping request after delivery failure"
                );
            }
        }
    }
}
