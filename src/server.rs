//! HTTP surface.
//!
//! | Path | Description |
//! |------|-------------|
//! | `/` | Live `audio/mpeg` relay (chunked transfer encoding) |
//! | `/search` | Track URL lookup on the configured search endpoint |
//! | `/status` | JSON snapshot of listeners and the running session |

use std::io;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::header,
    response::Response,
    routing::get,
};
use log::info;

use crate::error::{RelayError, Result};
use crate::relay::{Relay, RelayStatus};
use crate::search::{SearchClient, SearchQuery, SearchResults};

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub search: SearchClient,
}

impl AppState {
    pub fn new(relay: Arc<Relay>) -> Self {
        let search = SearchClient::new(
            relay.client().clone(),
            relay.config().search_endpoint.clone(),
        );
        Self { relay, search }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(stream_handler))
        .route("/search", get(search_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

/// Attaches a listener and streams the broadcast until the client goes away
/// or the broadcast ends.
async fn stream_handler(State(state): State<AppState>) -> Result<Response> {
    let listener = state.relay.attach().await?;
    info!(
        "Listener {} attached ({} active)",
        listener.id(),
        state.relay.registry().len()
    );

    Response::builder()
        .header(header::CONTENT_TYPE, "audio/mpeg")
        .header(header::CONNECTION, "keep-alive")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(listener.into_stream()))
        .map_err(|e| RelayError::Io(io::Error::other(e)))
}

async fn search_handler(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResults>> {
    state.search.search(&query).await.map(Json)
}

async fn status_handler(State(state): State<AppState>) -> Json<RelayStatus> {
    Json(state.relay.status().await)
}
