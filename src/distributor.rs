use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use futures_util::future::join_all;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::BackpressurePolicy;
use crate::connection::Delivery;
use crate::downloader::UpstreamEvent;
use crate::registry::ConnectionRegistry;

/// Why a distribution loop ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    UpstreamClosed,
    UpstreamReadError(String),
    /// The session was stopped from outside (idle listeners or shutdown).
    Cancelled,
    /// The downloader went away without reporting why.
    SourceGone,
}

impl SessionEnd {
    /// Whether listeners must be told the broadcast is over.
    pub fn signals_listeners(&self) -> bool {
        !matches!(self, SessionEnd::Cancelled)
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::UpstreamClosed => f.write_str("upstream closed"),
            SessionEnd::UpstreamReadError(e) => write!(f, "upstream read error: {e}"),
            SessionEnd::Cancelled => f.write_str("cancelled"),
            SessionEnd::SourceGone => f.write_str("downloader gone"),
        }
    }
}

/// Tally of one fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub dropped: usize,
    pub stopped: usize,
}

/// Copies every upstream chunk into the queue of every registered listener.
pub struct Distributor {
    registry: Arc<ConnectionRegistry>,
    policy: BackpressurePolicy,
    cancel: CancellationToken,
    drops: AtomicU64,
    finished: AtomicBool,
}

impl Distributor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        policy: BackpressurePolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            policy,
            cancel,
            drops: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        }
    }

    /// Backpressure drops across all listeners since this distributor started.
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Set once [`run`](Self::run) has stopped consuming events.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    /// Delivers one chunk to the listeners registered right now. Listeners
    /// registered while this runs get the next chunk instead.
    pub async fn fan_out(&self, chunk: &Bytes) -> FanOut {
        let targets = self.registry.snapshot();
        let outcomes: Vec<Delivery> = match self.policy {
            BackpressurePolicy::BlockWithTimeout(_) => {
                join_all(targets.iter().map(|conn| conn.push(chunk.clone(), self.policy))).await
            }
            policy => targets
                .iter()
                .map(|conn| conn.try_push(chunk.clone(), policy))
                .collect(),
        };

        let mut tally = FanOut::default();
        for (conn, outcome) in targets.iter().zip(outcomes) {
            match outcome {
                Delivery::Queued => tally.delivered += 1,
                Delivery::DroppedOldest | Delivery::DroppedNewest => {
                    if outcome == Delivery::DroppedOldest {
                        tally.delivered += 1;
                    }
                    tally.dropped += 1;
                    self.drops.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Backpressure drop ({:?}) on connection {}: {} dropped so far",
                        outcome,
                        conn.id(),
                        conn.dropped()
                    );
                }
                Delivery::Stopped => tally.stopped += 1,
            }
        }
        tally
    }

    /// Consumes downloader events in order until the upstream ends or the
    /// session is cancelled. Listeners are not signalled here; see
    /// [`terminate`](Self::terminate).
    pub async fn run(&self, mut events: mpsc::Receiver<UpstreamEvent>) -> SessionEnd {
        let end = loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break SessionEnd::Cancelled,
                event = events.recv() => event,
            };
            match event {
                Some(UpstreamEvent::Chunk(chunk)) => {
                    self.fan_out(&chunk).await;
                }
                Some(UpstreamEvent::Closed) => break SessionEnd::UpstreamClosed,
                Some(UpstreamEvent::ReadError(e)) => break SessionEnd::UpstreamReadError(e),
                None => break SessionEnd::SourceGone,
            }
        };
        self.mark_finished();
        match &end {
            SessionEnd::UpstreamReadError(_) | SessionEnd::SourceGone => {
                warn!("Distribution ended: {}", end)
            }
            SessionEnd::UpstreamClosed | SessionEnd::Cancelled => {
                info!("Distribution ended: {}", end)
            }
        }
        end
    }

    /// Fires the stop signal of every registered listener so their write loops
    /// finish once their queues are drained. Returns how many were signalled.
    pub fn terminate(&self) -> usize {
        let fired = self.registry.stop_all();
        info!("Signalled {} listener(s) to stop", fired);
        fired
    }
}
