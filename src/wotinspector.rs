//! Replay listing service client.

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Jitter, Quota, RateLimiter};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, AUTHORIZATION, USER_AGENT};

use crate::models::{Replay, ReplayData};
use crate::prelude::*;

/// The replay operations the crawler relies on.
#[async_trait]
pub trait ReplayApi: Send + Sync {
    /// Fetches one listing page as HTML.
    async fn get_replay_listing_page(&self, page: i32) -> Result<String>;

    /// Fetches a single replay. `None` means the service has no such replay.
    async fn get_replay(&self, replay_id: &str) -> Result<Option<Replay>>;
}

/// Extracts replay IDs from a listing page.
pub fn parse_replay_ids(html: &str) -> HashSet<String> {
    // Replay links look like `…/view/<32 hex digits>`.
    static PATTERN: &str = "/view/([0-9a-f]{32})";
    let regex = Regex::new(PATTERN).expect("the pattern is valid");
    regex
        .captures_iter(html)
        .map(|captures| captures[1].to_string())
        .collect()
}

#[derive(Clone)]
pub struct WotInspector {
    client: reqwest::Client,
    rate_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl WotInspector {
    const LISTING_URL: &'static str = "https://replays.wotinspector.com/en/sort/ut/page";
    const REPLAY_URL: &'static str = "https://api.wotinspector.com/replay";

    pub fn new(
        timeout: time::Duration,
        max_rps: NonZeroU32,
        auth_token: Option<&str>,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"))),
        );
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("br, deflate, gzip"));
        if let Some(auth_token) = auth_token {
            let mut value = HeaderValue::from_str(&format!("Token {auth_token}"))
                .context("the authentication token is not a valid header")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        Ok(Self {
            client: reqwest::ClientBuilder::new()
                .default_headers(headers)
                .https_only(true)
                .timeout(timeout)
                .connect_timeout(timeout)
                .brotli(true)
                .gzip(true)
                .deflate(true)
                .build()?,
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(max_rps))),
        })
    }

    async fn throttle(&self) {
        self.rate_limiter
            .until_ready_with_jitter(Jitter::up_to(time::Duration::from_millis(100)))
            .await;
    }
}

#[async_trait]
impl ReplayApi for WotInspector {
    #[instrument(skip_all, fields(page = page))]
    async fn get_replay_listing_page(&self, page: i32) -> Result<String> {
        self.throttle().await;
        self.client
            .get(format!("{}/{page}/", Self::LISTING_URL))
            .send()
            .await
            .with_context(|| format!("failed to fetch listing page #{page}"))?
            .error_for_status()
            .context("HTTP error")?
            .text()
            .await
            .with_context(|| format!("failed to read listing page #{page}"))
    }

    #[instrument(skip_all, fields(replay_id = replay_id))]
    async fn get_replay(&self, replay_id: &str) -> Result<Option<Replay>> {
        self.throttle().await;
        let response = self
            .client
            .get(format!("{}/{replay_id}", Self::REPLAY_URL))
            .send()
            .await
            .with_context(|| format!("failed to fetch replay `{replay_id}`"))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let envelope: ReplayEnvelope = response
            .error_for_status()
            .context("HTTP error")?
            .json()
            .await
            .with_context(|| format!("failed to deserialize replay `{replay_id}`"))?;
        Ok(envelope.data.map(|data| Replay {
            id: replay_id.to_string(),
            data,
        }))
    }
}

#[derive(serde::Deserialize)]
struct ReplayEnvelope {
    #[serde(default)]
    data: Option<ReplayData>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_ids_are_extracted_and_deduplicated() {
        let html = r#"
            <a href="/en/view/00e0b1a29e493c7f5f701984eeef5a5a">1</a>
            <a href="/en/view/00e0b1a29e493c7f5f701984eeef5a5a">1 again</a>
            <a href="/en/view/fe1e0336a68ba4e5e2824dfbe65a4d24">2</a>
            <a href="/other">not a replay</a>
        "#;
        let ids = parse_replay_ids(html);
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("00e0b1a29e493c7f5f701984eeef5a5a"));
        assert!(ids.contains("fe1e0336a68ba4e5e2824dfbe65a4d24"));
    }
}
