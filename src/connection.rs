use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::BackpressurePolicy;

/// Identity of a listener, unique for the lifetime of its registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of handing one chunk to one listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queued after evicting the oldest chunk.
    DroppedOldest,
    /// The incoming chunk was discarded.
    DroppedNewest,
    /// The listener has already been told to stop.
    Stopped,
}

impl Delivery {
    pub fn is_drop(self) -> bool {
        matches!(self, Delivery::DroppedOldest | Delivery::DroppedNewest)
    }
}

/// Per-listener state: a bounded chunk queue drained by the listener's write
/// loop, and a stop signal that fires at most once.
pub struct Connection {
    id: ConnectionId,
    capacity: usize,
    queue: Mutex<VecDeque<Bytes>>,
    readable: Notify,
    writable: Notify,
    stop: CancellationToken,
    stopped: AtomicBool,
    dropped: AtomicU64,
    created_at: Instant,
}

impl Connection {
    pub fn new(id: ConnectionId, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            id,
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            readable: Notify::new(),
            writable: Notify::new(),
            stop: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Chunks lost to backpressure so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Copy of the queued chunks, oldest first.
    pub fn queued(&self) -> Vec<Bytes> {
        self.queue.lock().iter().cloned().collect()
    }

    /// Fires the stop signal. Returns `true` only for the call that fired it.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.stop.cancel();
        true
    }

    /// Stops the connection and throws away whatever is still queued.
    pub fn close(&self) {
        self.stop();
        self.queue.lock().clear();
    }

    /// Pushes without ever waiting. `BlockWithTimeout` degrades to drop-newest.
    pub fn try_push(&self, chunk: Bytes, policy: BackpressurePolicy) -> Delivery {
        if self.is_stopped() {
            return Delivery::Stopped;
        }
        let outcome = {
            let mut queue = self.queue.lock();
            if queue.len() < self.capacity {
                queue.push_back(chunk);
                Delivery::Queued
            } else {
                match policy {
                    BackpressurePolicy::DropOldest => {
                        queue.pop_front();
                        queue.push_back(chunk);
                        Delivery::DroppedOldest
                    }
                    BackpressurePolicy::DropNewest | BackpressurePolicy::BlockWithTimeout(_) => {
                        Delivery::DroppedNewest
                    }
                }
            }
        };
        if outcome.is_drop() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        if outcome != Delivery::DroppedNewest {
            self.readable.notify_one();
        }
        outcome
    }

    /// Pushes according to `policy`. Only `BlockWithTimeout` can suspend, and
    /// never for longer than its timeout.
    pub async fn push(&self, chunk: Bytes, policy: BackpressurePolicy) -> Delivery {
        let BackpressurePolicy::BlockWithTimeout(timeout) = policy else {
            return self.try_push(chunk, policy);
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_stopped() {
                return Delivery::Stopped;
            }
            {
                let mut queue = self.queue.lock();
                if queue.len() < self.capacity {
                    queue.push_back(chunk);
                    drop(queue);
                    self.readable.notify_one();
                    return Delivery::Queued;
                }
            }
            tokio::select! {
                _ = self.writable.notified() => {}
                _ = self.stop.cancelled() => return Delivery::Stopped,
                _ = tokio::time::sleep_until(deadline) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return Delivery::DroppedNewest;
                }
            }
        }
    }

    fn pop(&self) -> Option<Bytes> {
        let chunk = self.queue.lock().pop_front();
        if chunk.is_some() {
            self.writable.notify_one();
        }
        chunk
    }

    /// Next queued chunk. Chunks already queued are still handed out after the
    /// stop signal fires; `None` means stopped and drained.
    pub async fn recv(&self) -> Option<Bytes> {
        loop {
            if let Some(chunk) = self.pop() {
                return Some(chunk);
            }
            if self.is_stopped() {
                return None;
            }
            tokio::select! {
                _ = self.readable.notified() => {}
                _ = self.stop.cancelled() => {}
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("queued", &self.len())
            .field("dropped", &self.dropped())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
