//! In-process upstream used by the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;

use relayd::config::RelayConfig;
use relayd::relay::Relay;

#[derive(Clone)]
pub enum Script {
    /// Sends each chunk after `gap`, then ends the body.
    Finite { chunks: Vec<Bytes>, gap: Duration },
    /// Sends a numbered chunk every `gap` until the client goes away.
    Endless { gap: Duration },
}

struct UpstreamState {
    script: Script,
    fetches: AtomicUsize,
    open_bodies: AtomicUsize,
    search_page: String,
}

/// Lives inside a response body stream; counts bodies hyper has not dropped.
struct OpenBody(Arc<UpstreamState>);

impl OpenBody {
    fn new(state: Arc<UpstreamState>) -> Self {
        state.open_bodies.fetch_add(1, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for OpenBody {
    fn drop(&mut self) {
        self.0.open_bodies.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Upstream {
    pub addr: SocketAddr,
    state: Arc<UpstreamState>,
}

impl Upstream {
    pub fn stream_url(&self) -> String {
        format!("http://{}/stream.mp3", self.addr)
    }

    pub fn missing_url(&self) -> String {
        format!("http://{}/missing.mp3", self.addr)
    }

    pub fn search_url(&self) -> String {
        format!("http://{}/music-search", self.addr)
    }

    /// Number of GETs the stream endpoint has served.
    pub fn fetches(&self) -> usize {
        self.state.fetches.load(Ordering::SeqCst)
    }

    /// Stream bodies the upstream is still serving.
    pub fn open_bodies(&self) -> usize {
        self.state.open_bodies.load(Ordering::SeqCst)
    }

    /// Waits up to two seconds for every stream body to be released.
    pub async fn bodies_close(&self) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if self.open_bodies() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            upstream_url: self.stream_url(),
            poll_interval: Duration::from_millis(5),
            connect_timeout: Duration::from_secs(2),
            search_endpoint: self.search_url(),
            ..RelayConfig::default()
        }
    }
}

pub fn chunks(parts: &[&'static str]) -> Vec<Bytes> {
    parts.iter().map(|p| Bytes::from_static(p.as_bytes())).collect()
}

async fn stream(State(state): State<Arc<UpstreamState>>) -> Response {
    state.fetches.fetch_add(1, Ordering::SeqCst);
    let guard = OpenBody::new(state.clone());
    let body = match state.script.clone() {
        Script::Finite { chunks, gap } => Body::from_stream(futures_util::stream::unfold(
            (chunks.into_iter(), guard),
            move |(mut rest, guard)| async move {
                let next = rest.next()?;
                tokio::time::sleep(gap).await;
                Some((Ok::<Bytes, std::io::Error>(next), (rest, guard)))
            },
        )),
        Script::Endless { gap } => Body::from_stream(futures_util::stream::unfold(
            (0u64, guard),
            move |(n, guard)| async move {
                tokio::time::sleep(gap).await;
                Some((
                    Ok::<Bytes, std::io::Error>(Bytes::from(format!("{n};"))),
                    (n + 1, guard),
                ))
            },
        )),
    };
    ([("content-type", "audio/mpeg")], body).into_response()
}

async fn search(State(state): State<Arc<UpstreamState>>) -> Html<String> {
    Html(state.search_page.clone())
}

pub async fn spawn_upstream(script: Script) -> Upstream {
    spawn_upstream_with_search(script, String::new()).await
}

pub async fn spawn_upstream_with_search(script: Script, search_page: String) -> Upstream {
    let state = Arc::new(UpstreamState {
        script,
        fetches: AtomicUsize::new(0),
        open_bodies: AtomicUsize::new(0),
        search_page,
    });
    let app = Router::new()
        .route("/stream.mp3", get(stream))
        .route("/missing.mp3", get(|| async { StatusCode::NOT_FOUND }))
        .route("/music-search", get(search))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Upstream { addr, state }
}

/// Waits up to two seconds for the relay's broadcast session to go away.
pub async fn session_ends(relay: &Relay) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if !relay.session_active().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
