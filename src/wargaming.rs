//! Wargaming.net API client.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Jitter, Quota, RateLimiter};
use reqwest::header::HeaderValue;
use reqwest::{header, Url};
use serde::de::DeserializeOwned;
use tokio::time::sleep;

use crate::models::{AccountId, PlayerAchievements, Region, TankStat, Vehicle};
use crate::prelude::*;
use crate::wargaming::response::{Message, Response};

pub mod response;

/// The stats operations the fetch pipelines rely on. `None` results mean
/// "the upstream has no stats for this account", which also covers an
/// exhausted retry budget, so callers treat it as retryable at their layer.
#[async_trait]
pub trait StatsApi: Send + Sync {
    async fn get_tank_stats(
        &self,
        region: Region,
        account_id: AccountId,
    ) -> Result<Option<Vec<TankStat>>>;

    async fn get_player_achievements(
        &self,
        region: Region,
        account_id: AccountId,
    ) -> Result<Option<PlayerAchievements>>;
}

#[derive(Clone)]
pub struct WargamingApi {
    pub request_counter: Arc<AtomicU32>,

    application_id: Arc<String>,
    client: reqwest::Client,
    rate_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl WargamingApi {
    const USER_AGENT: &'static str =
        concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
    const MAX_ATTEMPTS: u32 = 10;

    pub fn new(application_id: &str, timeout: time::Duration, max_rps: NonZeroU32) -> Result<Self> {
        info!(max_rps = max_rps.get());

        let mut headers = header::HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(Self::USER_AGENT));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("br, deflate, gzip"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));

        let rate_limiter = RateLimiter::direct(Quota::per_second(max_rps));

        let this = Self {
            application_id: Arc::new(application_id.to_string()),
            client: reqwest::ClientBuilder::new()
                .default_headers(headers)
                .https_only(true)
                .timeout(timeout)
                .connect_timeout(timeout)
                .brotli(true)
                .gzip(true)
                .deflate(true)
                .tcp_nodelay(true)
                .pool_max_idle_per_host(0) // https://github.com/hyperium/hyper/issues/2312
                .build()?,
            request_counter: Arc::new(AtomicU32::new(0)),
            rate_limiter: Arc::new(rate_limiter),
        };
        Ok(this)
    }

    /// See <https://developers.wargaming.net/reference/all/wotb/encyclopedia/vehicles/>.
    #[instrument(skip_all)]
    pub async fn get_tankopedia(&self) -> Result<Vec<Vehicle>> {
        info!("retrieving the tankopedia…");
        let map: BTreeMap<String, Vehicle> = self
            .call(Url::parse_with_params(
                "https://api.wotblitz.eu/wotb/encyclopedia/vehicles/",
                &[
                    ("application_id", self.application_id.as_str()),
                    ("language", "en"),
                ],
            )?)
            .await
            .context("failed to get the tankopedia")?
            .ok_or_else(|| anyhow!("the tankopedia response is empty"))?;
        Ok(map.into_values().collect())
    }

    fn endpoint(region: Region, method: &str) -> String {
        let host = match region {
            Region::Asia => "api.wotblitz.asia",
            Region::Europe => "api.wotblitz.eu",
            Region::Russia => "api.wotblitz.ru",
            Region::NorthAmerica => "api.wotblitz.com",
        };
        format!("https://{host}/wotb/{method}/")
    }

    /// Convenience method for endpoints that return data keyed by account ID.
    #[instrument(skip_all, level = "debug", fields(account_id = account_id))]
    async fn call_by_account<T: DeserializeOwned>(
        &self,
        url: String,
        account_id: AccountId,
    ) -> Result<Option<T>> {
        let account_id = account_id.to_string();
        let map: Option<HashMap<String, Option<T>>> = self
            .call(Url::parse_with_params(
                &url,
                &[
                    ("application_id", self.application_id.as_str()),
                    ("account_id", account_id.as_str()),
                ],
            )?)
            .await?;
        Ok(map.and_then(|mut map| map.remove(&account_id).flatten()))
    }

    /// Calls the API with bounded retries on transient failures. `None` means
    /// the retry budget ran out, so the caller can re-queue the work.
    #[instrument(skip_all, fields(path = url.path()))]
    async fn call<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>> {
        for nr_attempt in 1..=Self::MAX_ATTEMPTS {
            match self.call_once(url.clone()).await {
                Ok(Response::Data { data }) => {
                    trace!(nr_attempt, "ok");
                    return Ok(Some(data));
                }
                Ok(Response::Error { error }) => {
                    let message = &error.message;
                    if message.is_transient() {
                        warn!(error.code, nr_attempt, ?message);
                        if *message == Message::SourceNotAvailable {
                            sleep(time::Duration::from_secs(1)).await;
                        }
                    } else {
                        bail!("#{nr_attempt} {}/{:?}", error.code, message);
                    }
                }
                Err(error) => {
                    warn!(path = url.path(), nr_attempt, "{:#}", error);
                }
            };
            debug!(nr_attempt, "retrying…");
        }
        warn!(path = url.path(), "all attempts have failed");
        Ok(None)
    }

    #[instrument(skip_all, level = "debug", fields(path = url.path()))]
    async fn call_once<T: DeserializeOwned>(&self, url: Url) -> Result<Response<T>> {
        self.rate_limiter
            .until_ready_with_jitter(Jitter::up_to(time::Duration::from_millis(100)))
            .await;

        let nr_request = self.request_counter.fetch_add(1, Ordering::Relaxed);
        trace!(nr_request, path = url.path(), "sending the request…");

        let start_instant = Instant::now();
        let result = self
            .client
            .get(url)
            .send()
            .await
            .context("failed to send the request")?
            .error_for_status()
            .context("HTTP error")?
            .json::<Response<T>>()
            .await
            .context("failed to deserialize the response");
        trace!(nr_request, elapsed = ?start_instant.elapsed(), "done");
        result
    }
}

#[async_trait]
impl StatsApi for WargamingApi {
    /// See <https://developers.wargaming.net/reference/all/wotb/tanks/stats/>.
    #[instrument(skip_all, level = "debug", fields(region = ?region, account_id = account_id))]
    async fn get_tank_stats(
        &self,
        region: Region,
        account_id: AccountId,
    ) -> Result<Option<Vec<TankStat>>> {
        let mut stats: Option<Vec<TankStat>> = self
            .call_by_account(Self::endpoint(region, "tanks/stats"), account_id)
            .await
            .with_context(|| format!("failed to get tank stats for #{account_id}"))?;
        if let Some(stats) = &mut stats {
            for stat in stats.iter_mut() {
                stat.region = Some(region);
            }
        }
        Ok(stats)
    }

    /// See <https://developers.wargaming.net/reference/all/wotb/account/achievements/>.
    #[instrument(skip_all, level = "debug", fields(region = ?region, account_id = account_id))]
    async fn get_player_achievements(
        &self,
        region: Region,
        account_id: AccountId,
    ) -> Result<Option<PlayerAchievements>> {
        let series: Option<AccountAchievements> = self
            .call_by_account(Self::endpoint(region, "account/achievements"), account_id)
            .await
            .with_context(|| format!("failed to get achievements for #{account_id}"))?;
        Ok(series.map(|series| PlayerAchievements::new(account_id, series.max_series)))
    }
}

#[derive(serde::Deserialize)]
struct AccountAchievements {
    #[serde(default)]
    max_series: BTreeMap<String, i64>,
}
