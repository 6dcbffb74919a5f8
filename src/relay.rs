//! Broadcast sessions and listener lifecycle.
//!
//! A [`Relay`] owns the listener registry and at most one running broadcast
//! session (a downloader plus the distributor feeding the registry). The first
//! listener starts a session, later listeners join it, and depending on the
//! idle policy the last one to leave stops it.
//!
//! Session start, session teardown and listener registration are serialised by
//! one async lock, so a listener is never registered into a session that has
//! already told its listeners to stop.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use futures_util::Stream;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{IdlePolicy, RelayConfig};
use crate::connection::{Connection, ConnectionId};
use crate::distributor::{Distributor, SessionEnd};
use crate::downloader::{Downloader, DownloaderConfig, DownloaderHandle};
use crate::error::{RelayError, Result};
use crate::registry::ConnectionRegistry;

struct Session {
    id: u64,
    cancel: CancellationToken,
    downloader: DownloaderHandle,
    distributor: Arc<Distributor>,
    started_at: Instant,
}

impl Session {
    /// Stops the session's tasks and tells its listeners to finish.
    fn retire(&self) -> usize {
        self.cancel.cancel();
        self.distributor.terminate()
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            id: self.id,
            uptime_secs: self.started_at.elapsed().as_secs(),
            chunks: self.downloader.stats().chunks(),
            bytes: self.downloader.stats().bytes(),
            drops: self.distributor.drops(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionStatus {
    pub id: u64,
    pub uptime_secs: u64,
    pub chunks: usize,
    pub bytes: usize,
    pub drops: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RelayStatus {
    pub upstream_url: String,
    pub listeners: usize,
    /// Backpressure drops summed over the listeners attached right now.
    pub listener_drops: u64,
    pub session: Option<SessionStatus>,
    pub sessions_started: u64,
    pub backpressure: String,
    pub idle_policy: String,
}

pub struct Relay {
    config: RelayConfig,
    client: reqwest::Client,
    registry: Arc<ConnectionRegistry>,
    session: Mutex<Option<Session>>,
    sessions_started: AtomicU64,
    shutdown: CancellationToken,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| RelayError::Config(format!("http client: {e}")))?;
        let registry = Arc::new(ConnectionRegistry::new(
            config.queue_capacity,
            config.max_listeners,
        ));
        Ok(Arc::new(Self {
            config,
            client,
            registry,
            session: Mutex::new(None),
            sessions_started: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn sessions_started(&self) -> u64 {
        self.sessions_started.load(Ordering::Relaxed)
    }

    pub async fn session_active(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Registers a new listener, starting a broadcast session first if none is
    /// running. If the upstream cannot be reached nothing is registered.
    pub async fn attach(self: &Arc<Self>) -> Result<Listener> {
        if self.shutdown.is_cancelled() {
            return Err(RelayError::RegistrationFailed("relay is shutting down".into()));
        }

        let mut slot = self.session.lock().await;
        // Distribution may have ended before its supervisor got the lock.
        if let Some(stale) = slot.take_if(|s| s.distributor.is_finished()) {
            let fired = stale.retire();
            info!(
                "Broadcast session {} already ended; {} listener(s) signalled",
                stale.id, fired
            );
        }
        let pending = match slot.as_ref() {
            Some(_) => None,
            None => {
                let cancel = self.shutdown.child_token();
                let downloader = Downloader::connect(
                    &self.client,
                    self.downloader_config(),
                    cancel.clone(),
                )
                .await?;
                Some((downloader, cancel))
            }
        };

        // Registered before the session's tasks exist, so the first listener
        // sees the upstream from its first byte.
        let connection = self.registry.register()?;
        if let Some((downloader, cancel)) = pending {
            *slot = Some(self.spawn_session(downloader, cancel));
        }
        drop(slot);

        Ok(Listener {
            relay: self.clone(),
            connection,
            finished: false,
        })
    }

    fn downloader_config(&self) -> DownloaderConfig {
        DownloaderConfig {
            url: self.config.upstream_url.clone(),
            read_buffer_size: self.config.read_buffer_size,
            poll_interval: self.config.poll_interval,
            connect_timeout: self.config.connect_timeout,
        }
    }

    fn spawn_session(self: &Arc<Self>, downloader: Downloader, cancel: CancellationToken) -> Session {
        let id = self.sessions_started.fetch_add(1, Ordering::Relaxed);
        let (handle, events) = downloader.spawn();
        let distributor = Arc::new(Distributor::new(
            self.registry.clone(),
            self.config.backpressure,
            cancel.clone(),
        ));

        let relay = self.clone();
        let dist = distributor.clone();
        tokio::spawn(async move {
            let end = dist.run(events).await;
            relay.finish_session(id, end).await;
        });

        info!(
            "Broadcast session {} started for {} ({} policy)",
            id, self.config.upstream_url, self.config.backpressure
        );
        Session {
            id,
            cancel,
            downloader: handle,
            distributor,
            started_at: Instant::now(),
        }
    }

    async fn finish_session(&self, id: u64, end: SessionEnd) {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.take_if(|s| s.id == id) else {
            debug!("Broadcast session {} already detached ({})", id, end);
            return;
        };
        let fired = session.retire();
        drop(slot);

        let status = session.status();
        info!(
            "Broadcast session {} ended: {} after {}s ({} chunks, {} bytes, {} drops, {} listeners signalled)",
            id, end, status.uptime_secs, status.chunks, status.bytes, status.drops, fired
        );
    }

    /// Idle check after a listener has left.
    async fn release_idle(&self) {
        if self.config.idle_policy == IdlePolicy::KeepRunning {
            return;
        }
        let mut slot = self.session.lock().await;
        if !self.registry.is_empty() {
            return;
        }
        if let Some(session) = slot.take() {
            session.cancel.cancel();
            info!("Last listener left; stopping broadcast session {}", session.id);
        }
    }

    fn detach(self: &Arc<Self>, connection: &Connection) {
        if let Some(conn) = self.registry.unregister(connection.id()) {
            conn.close();
        }
        if self.config.idle_policy == IdlePolicy::KeepRunning {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let relay = self.clone();
                handle.spawn(async move { relay.release_idle().await });
            }
            Err(_) => warn!(
                "Connection {} released outside the runtime; idle check skipped",
                connection.id()
            ),
        }
    }

    pub async fn status(&self) -> RelayStatus {
        let session = self.session.lock().await.as_ref().map(Session::status);
        RelayStatus {
            upstream_url: self.config.upstream_url.clone(),
            listeners: self.registry.len(),
            listener_drops: self.registry.total_dropped(),
            session,
            sessions_started: self.sessions_started(),
            backpressure: self.config.backpressure.to_string(),
            idle_policy: self.config.idle_policy.to_string(),
        }
    }

    /// Stops the running session, tells every listener to finish and refuses
    /// new ones. Returns once the upstream connection is closed.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let session = self.session.lock().await.take();
        let fired = self.registry.stop_all();
        info!("Relay shutting down; {} listener(s) signalled", fired);

        if let Some(session) = session {
            session.cancel.cancel();
            let outcome = session.downloader.join().await;
            info!("Broadcast session {} closed: {}", session.id, outcome);
        }
    }
}

/// One attached listener. Dropping it unregisters the connection; if nobody
/// is left the session is stopped under [`IdlePolicy::Stop`].
pub struct Listener {
    relay: Arc<Relay>,
    connection: Arc<Connection>,
    finished: bool,
}

impl Listener {
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Next chunk for this listener; `None` once the broadcast has ended for it.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        let chunk = self.connection.recv().await;
        if chunk.is_none() {
            self.finished = true;
        }
        chunk
    }

    /// Response body stream. Dropping it (client gone, write failed) releases
    /// the listener.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        futures_util::stream::unfold(self, |mut listener| async move {
            listener
                .next_chunk()
                .await
                .map(|chunk| (Ok::<Bytes, io::Error>(chunk), listener))
        })
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.finished {
            info!("Stream ended for connection with id: {}", self.id().get());
        } else {
            info!(
                "Stopping connection with id: {}: client disconnected",
                self.id().get()
            );
        }
        self.relay.detach(&self.connection);
    }
}
