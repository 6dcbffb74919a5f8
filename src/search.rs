use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

use log::{debug, error, info};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

const SEARCH_TIMEOUT: Duration = Duration::from_secs(15);

// data-url="https://ncsmusic.s3.eu-west-1.amazonaws.com/tracks/000/001/127/on-on-nuumi-remix-1652349640-5EszNOOTne.mp3"
static TRACK_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"data-url="(https://ncsmusic\.s3\.eu-west-1\.amazonaws\.com/tracks/\d{3}/\d{3}/\d{3}/[\w\-]+\.mp3)""#,
    )
    .expect("track url pattern is valid")
});

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub mood: String,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct SearchResults {
    pub tracks: Vec<String>,
}

/// Track URLs found in a search results page, first occurrence first.
pub fn extract_track_urls(page: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    TRACK_URL
        .captures_iter(page)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

/// Thin wrapper over the third-party music search page.
#[derive(Clone)]
pub struct SearchClient {
    client: reqwest::Client,
    endpoint: String,
}

impl SearchClient {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResults> {
        info!(
            "Searching tracks: name={:?} genre={:?} mood={:?}",
            query.name, query.genre, query.mood
        );
        let page = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("q", query.name.as_str()),
                ("genre", query.genre.as_str()),
                ("mood", query.mood.as_str()),
            ])
            .timeout(SEARCH_TIMEOUT)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| {
                error!("Search request failed: {}", e);
                RelayError::Search(e.to_string())
            })?
            .text()
            .await
            .map_err(|e| RelayError::Search(e.to_string()))?;

        let tracks = extract_track_urls(&page);
        debug!("Search page of {} bytes yielded {} tracks", page.len(), tracks.len());
        Ok(SearchResults { tracks })
    }
}
