use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, error, info, trace, warn};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result};

/// Chunks buffered between the downloader and the distributor.
pub const EVENT_CHANNEL_CAPACITY: usize = 16;

/// What the downloader hands to the distributor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpstreamEvent {
    Chunk(Bytes),
    /// The upstream body ended cleanly.
    Closed,
    /// The upstream body failed mid-stream.
    ReadError(String),
}

#[derive(Clone, Debug)]
pub struct DownloaderConfig {
    pub url: String,
    pub read_buffer_size: usize,
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
}

/// Why a read loop ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadOutcome {
    Closed,
    ReadError(String),
    /// The cancellation token fired.
    Stopped,
    /// Nobody is consuming chunks any more.
    SinkClosed,
}

impl fmt::Display for DownloadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadOutcome::Closed => f.write_str("EOF"),
            DownloadOutcome::ReadError(e) => write!(f, "read error: {e}"),
            DownloadOutcome::Stopped => f.write_str("stop requested"),
            DownloadOutcome::SinkClosed => f.write_str("distributor gone"),
        }
    }
}

/// Packet and byte counters for one download.
#[derive(Debug, Default)]
pub struct DownloadStats {
    chunks: AtomicUsize,
    bytes: AtomicUsize,
}

impl DownloadStats {
    pub fn chunks(&self) -> usize {
        self.chunks.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    fn record(&self, len: usize) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len, Ordering::Relaxed);
    }
}

type UpstreamBody = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

/// Owns the single upstream connection of a broadcast session and pulls it at
/// a fixed cadence.
pub struct Downloader {
    config: DownloaderConfig,
    body: UpstreamBody,
    cancel: CancellationToken,
    stats: Arc<DownloadStats>,
}

impl Downloader {
    /// Opens the upstream GET. Nothing is read until [`run`](Self::run).
    pub async fn connect(
        client: &reqwest::Client,
        config: DownloaderConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        info!("Starting stream download from {}", config.url);
        let unavailable = |reason: String| {
            error!("HTTP request to {} failed: {}", config.url, reason);
            RelayError::UpstreamUnavailable {
                url: config.url.clone(),
                reason,
            }
        };

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(unavailable("cancelled while connecting".into())),
            sent = tokio::time::timeout(config.connect_timeout, client.get(&config.url).send()) => sent,
        };
        let response = response
            .map_err(|_| unavailable(format!("no response within {:?}", config.connect_timeout)))?
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| unavailable(e.to_string()))?;
        info!(
            "HTTP request successful: {} ({})",
            response.status(),
            response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("no content type")
        );

        let stream = response.bytes_stream().map(|r| r.map_err(io::Error::other)).boxed();
        Ok(Self {
            config,
            body: StreamReader::new(stream),
            cancel,
            stats: Arc::new(DownloadStats::default()),
        })
    }

    /// Reads at most one buffer per tick and forwards it. The stop signal is
    /// checked before every read; the upstream connection is dropped when this
    /// returns.
    pub async fn run(self, output: mpsc::Sender<UpstreamEvent>) -> DownloadOutcome {
        let Downloader {
            config,
            mut body,
            cancel,
            stats,
        } = self;

        let mut buf = vec![0u8; config.read_buffer_size];
        let mut ticker = tokio::time::interval(config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break DownloadOutcome::Stopped,
                _ = ticker.tick() => {}
            }

            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break DownloadOutcome::Stopped,
                read = body.read(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    let _ = output.send(UpstreamEvent::Closed).await;
                    break DownloadOutcome::Closed;
                }
                Ok(n) => {
                    stats.record(n);
                    trace!("Downloaded chunk of {} bytes", n);
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if output.send(UpstreamEvent::Chunk(chunk)).await.is_err() {
                        break DownloadOutcome::SinkClosed;
                    }
                }
                Err(e) => {
                    warn!("Error downloading chunk: {}", e);
                    let _ = output.send(UpstreamEvent::ReadError(e.to_string())).await;
                    break DownloadOutcome::ReadError(e.to_string());
                }
            }
        };

        drop(body);
        info!(
            "Downloader stopped with: {} ({} chunks, {} bytes)",
            outcome,
            stats.chunks(),
            stats.bytes()
        );
        outcome
    }

    /// Runs the read loop on its own task.
    pub fn spawn(self) -> (DownloaderHandle, mpsc::Receiver<UpstreamEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = self.cancel.clone();
        let stats = self.stats.clone();
        let url = self.config.url.clone();
        let task = tokio::spawn(self.run(tx));
        debug!("Downloader task spawned for {}", url);
        (DownloaderHandle { cancel, stats, task }, rx)
    }
}

/// Control side of a spawned [`Downloader`].
pub struct DownloaderHandle {
    cancel: CancellationToken,
    stats: Arc<DownloadStats>,
    task: JoinHandle<DownloadOutcome>,
}

impl DownloaderHandle {
    /// Requests termination; honoured at the next tick or in-flight read.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn stats(&self) -> &Arc<DownloadStats> {
        &self.stats
    }

    pub async fn join(self) -> DownloadOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => DownloadOutcome::ReadError(format!("download task failed: {e}")),
        }
    }
}
