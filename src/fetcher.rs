//! The stats fetcher pipeline:
//!
//! ```text
//! account queue ──▶ API workers ──▶ batch queue ──▶ backend writer
//!        ▲              │
//!        └── retry queue ┘ (second pass)
//! ```
//!
//! An account that yields no stats on the first pass is re-queued once; on
//! the second pass it is marked disabled instead. The `accounts total`
//! counter is decremented by the re-queued count after the first pass, so
//! the final total counts unique accounts. This convention is uniform across
//! all stats kinds.

use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::spawn;

use crate::accounts::{count_accounts, create_account_feed, AccountSource};
use crate::config::Config;
use crate::counter::EventCounter;
use crate::database::{AccountField, Backend, InsertOutcome};
use crate::helpers::periodic::Periodic;
use crate::helpers::time::from_minutes;
use crate::models::{Account, AccountId, ErrorLogEntry, Region, StatsKind};
use crate::opts::FetchOpts;
use crate::prelude::*;
use crate::queue::{QueueDone, WorkQueue};
use crate::releases::{release_mapper, ReleaseMapper};
use crate::wargaming::{StatsApi, WargamingApi};

const ACCOUNT_QUEUE_CAPACITY: usize = 10_000;
const BATCH_QUEUE_CAPACITY: usize = 1_000;
const API_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// One fetchable stats family. The pipeline is generic over this seam so the
/// tank stats and achievements flows share the worker and writer code, and so
/// the tests can drive the pipeline with a scripted API.
#[async_trait]
pub trait FetchKind: 'static {
    type Row: Clone + serde::de::DeserializeOwned + Send + Sync + 'static;

    const KIND: StatsKind;
    const FETCHED_COUNTER: &'static str;
    const ADDED_COUNTER: &'static str;
    const SKIPPED_COUNTER: &'static str;

    async fn fetch(
        api: &dyn StatsApi,
        region: Region,
        account_id: AccountId,
    ) -> Result<Option<Vec<Self::Row>>>;

    fn account_id(row: &Self::Row) -> AccountId;

    fn timestamp(row: &Self::Row) -> i64;

    fn set_release(row: &mut Self::Row, release: Option<String>);

    async fn insert(
        backend: &dyn Backend,
        rows: &[Self::Row],
        force: bool,
    ) -> Result<InsertOutcome>;
}

pub struct TankStatsKind;

#[async_trait]
impl FetchKind for TankStatsKind {
    type Row = crate::models::TankStat;

    const KIND: StatsKind = StatsKind::TankStats;
    const FETCHED_COUNTER: &'static str = "tank stats fetched";
    const ADDED_COUNTER: &'static str = "tank stats added";
    const SKIPPED_COUNTER: &'static str = "old tank stats found";

    async fn fetch(
        api: &dyn StatsApi,
        region: Region,
        account_id: AccountId,
    ) -> Result<Option<Vec<Self::Row>>> {
        api.get_tank_stats(region, account_id).await
    }

    fn account_id(row: &Self::Row) -> AccountId {
        row.account_id
    }

    fn timestamp(row: &Self::Row) -> i64 {
        row.last_battle_time
    }

    fn set_release(row: &mut Self::Row, release: Option<String>) {
        row.release = release;
    }

    async fn insert(
        backend: &dyn Backend,
        rows: &[Self::Row],
        force: bool,
    ) -> Result<InsertOutcome> {
        backend.tank_stats_insert(rows, force).await
    }
}

pub struct PlayerAchievementsKind;

#[async_trait]
impl FetchKind for PlayerAchievementsKind {
    type Row = crate::models::PlayerAchievements;

    const KIND: StatsKind = StatsKind::PlayerAchievements;
    const FETCHED_COUNTER: &'static str = "player achievements fetched";
    const ADDED_COUNTER: &'static str = "player achievements added";
    const SKIPPED_COUNTER: &'static str = "old player achievements found";

    async fn fetch(
        api: &dyn StatsApi,
        region: Region,
        account_id: AccountId,
    ) -> Result<Option<Vec<Self::Row>>> {
        let achievements = api.get_player_achievements(region, account_id).await?;
        Ok(achievements.map(|achievements| vec![achievements]))
    }

    fn account_id(row: &Self::Row) -> AccountId {
        row.account_id
    }

    fn timestamp(row: &Self::Row) -> i64 {
        row.updated
    }

    fn set_release(row: &mut Self::Row, release: Option<String>) {
        row.release = release;
    }

    async fn insert(
        backend: &dyn Backend,
        rows: &[Self::Row],
        force: bool,
    ) -> Result<InsertOutcome> {
        backend.player_achievements_insert(rows, force).await
    }
}

#[instrument(skip_all, fields(kind = %kind))]
pub async fn cmd_fetch(
    backend: Arc<dyn Backend>,
    config: &Config,
    kind: StatsKind,
    opts: &FetchOpts,
    force: bool,
) -> Result {
    let application_id = opts
        .wg_app_id
        .clone()
        .or_else(|| config.wg.application_id.clone())
        .ok_or_else(|| anyhow!("the Wargaming.net application ID is not specified"))?;
    let rate_limit = opts.rate_limit.unwrap_or(config.wg.rate_limit);
    let max_rps = NonZeroU32::new(rate_limit.round().max(1.0) as u32)
        .expect("the rate limit is at least one");
    let api = Arc::new(WargamingApi::new(&application_id, API_TIMEOUT, max_rps)?);
    let n_workers = opts.workers.unwrap_or(config.wg.api_workers);

    let source = account_source(opts);
    let stats = match kind {
        StatsKind::TankStats => {
            run_fetch::<TankStatsKind>(backend, api.clone(), source, n_workers, opts.check_disabled, force)
                .await?
        }
        StatsKind::PlayerAchievements => {
            run_fetch::<PlayerAchievementsKind>(
                backend,
                api.clone(),
                source,
                n_workers,
                opts.check_disabled,
                force,
            )
            .await?
        }
    };
    stats.print();
    info!(
        n_requests = api.request_counter.load(std::sync::atomic::Ordering::Relaxed),
        "upstream requests",
    );
    Ok(())
}

fn account_source(opts: &FetchOpts) -> AccountSource {
    let regions = if opts.regions.is_empty() {
        Region::api_regions().to_vec()
    } else {
        opts.regions.clone()
    };
    AccountSource {
        accounts: opts.accounts.clone(),
        file: opts.file.clone(),
        filter: crate::database::AccountFilter {
            regions,
            inactive: opts.inactive,
            disabled: opts.check_disabled,
            sample: opts.sample,
            cache_valid_secs: opts.cache_valid.map(|days| days as i64 * 86_400),
            distributed: opts.distributed,
        },
    }
}

/// Runs the full pipeline: feed, first pass, retry pass, writer drain.
pub async fn run_fetch<K: FetchKind>(
    backend: Arc<dyn Backend>,
    api: Arc<dyn StatsApi>,
    source: AccountSource,
    n_workers: usize,
    check_disabled: bool,
    force: bool,
) -> Result<EventCounter> {
    let mut stats = EventCounter::new(format!("{} fetch", K::KIND));

    info!("counting accounts…");
    let total = count_accounts(backend.as_ref(), Some(K::KIND), &source).await?;
    info!(total, "fetching…");

    let account_queue: WorkQueue<Account> = WorkQueue::new(ACCOUNT_QUEUE_CAPACITY);
    let batch_queue: WorkQueue<Vec<K::Row>> = WorkQueue::new(BATCH_QUEUE_CAPACITY);
    let retry_queue: WorkQueue<Account> = WorkQueue::unbounded();

    let mapper = Arc::new(release_mapper(backend.as_ref()).await?);
    let writer = spawn(stats_writer::<K>(
        Arc::clone(&backend),
        batch_queue.clone(),
        Arc::clone(&mapper),
        force,
    ));

    // First pass. Fewer workers than accounts keeps a nearly-empty queue from
    // bursting through the rate limiter.
    let mut workers = Vec::new();
    for _ in 0..worker_count(n_workers, total) {
        workers.push(spawn(fetch_worker::<K>(
            Arc::clone(&api),
            Arc::clone(&backend),
            account_queue.clone(),
            batch_queue.clone(),
            Some(retry_queue.clone()),
            check_disabled,
        )));
    }
    stats.merge_child(
        create_account_feed(Arc::clone(&backend), Some(K::KIND), source, account_queue.clone())
            .await?,
    );
    account_queue.join().await;
    stats.gather_stats(workers).await?;

    // Retry pass: accounts that yielded nothing the first time around.
    let n_retries = retry_queue.len() as u64;
    if n_retries > 0 {
        info!(n_retries, "retrying failed accounts…");
        let mut workers = Vec::new();
        for _ in 0..worker_count(n_workers, n_retries) {
            workers.push(spawn(fetch_worker::<K>(
                Arc::clone(&api),
                Arc::clone(&backend),
                retry_queue.clone(),
                batch_queue.clone(),
                None,
                check_disabled,
            )));
        }
        retry_queue.join().await;
        stats.gather_stats(workers).await?;
    }

    batch_queue.join().await;
    stats.gather_stats(vec![writer]).await?;
    Ok(stats)
}

fn worker_count(n_workers: usize, n_accounts: u64) -> usize {
    n_workers.min(((n_accounts + 3) / 4) as usize).max(1)
}

/// Dequeues accounts and calls the upstream API. A `None` result is re-queued
/// on the first pass and disables the account on the second.
async fn fetch_worker<K: FetchKind>(
    api: Arc<dyn StatsApi>,
    backend: Arc<dyn Backend>,
    account_queue: WorkQueue<Account>,
    batch_queue: WorkQueue<Vec<K::Row>>,
    retry_queue: Option<WorkQueue<Account>>,
    check_disabled: bool,
) -> Result<EventCounter> {
    let mut stats = EventCounter::new(if retry_queue.is_some() { "fetch" } else { "re-try" });
    let batch_producer = batch_queue.producer();
    let retry_producer = retry_queue.as_ref().map(WorkQueue::producer);

    loop {
        let job = match account_queue.get().await {
            Ok(job) => job,
            Err(QueueDone) => break,
        };
        let mut account = job.clone();
        stats.log("accounts total");

        let region = match account.region {
            Some(region) => region,
            None => {
                error!(account_id = account.id, "the account has no region");
                stats.log("errors");
                continue;
            }
        };

        match K::fetch(api.as_ref(), region, account.id).await {
            Err(error) => {
                error!(account_id = account.id, "failed to fetch: {error:#}");
                stats.log("errors");
                let entry = ErrorLogEntry::new(account.id, K::KIND);
                if let Err(error) = backend.error_log_append(&entry).await {
                    debug!("failed to log the fetch error: {error:#}");
                }
            }
            Ok(None) => match &retry_producer {
                Some(retry_producer) => {
                    stats.log("accounts to re-try");
                    retry_producer.put(account).await;
                }
                None => {
                    stats.log("accounts w/o stats");
                    account.disabled = true;
                    match backend.account_update(&account, &[AccountField::Disabled]).await {
                        Ok(_) => stats.log("accounts disabled"),
                        Err(error) => {
                            error!(account_id = account.id, "failed to disable: {error:#}");
                            stats.log("errors");
                        }
                    }
                }
            },
            Ok(Some(rows)) => {
                stats.log_n(K::FETCHED_COUNTER, rows.len() as i64);
                stats.log("accounts /w stats");
                if check_disabled && account.disabled {
                    account.disabled = false;
                    match backend.account_update(&account, &[AccountField::Disabled]).await {
                        Ok(_) => stats.log("accounts enabled"),
                        Err(error) => {
                            error!(account_id = account.id, "failed to enable: {error:#}");
                            stats.log("errors");
                        }
                    }
                }
                batch_producer.put(rows).await;
            }
        }
    }

    // Final totals count unique accounts, not attempts.
    stats.log_n("accounts total", -stats.get("accounts to re-try"));
    Ok(stats)
}

/// Dequeues per-account batches, assigns releases, inserts the rows and
/// refreshes the owning account.
async fn stats_writer<K: FetchKind>(
    backend: Arc<dyn Backend>,
    batch_queue: WorkQueue<Vec<K::Row>>,
    mapper: Arc<ReleaseMapper>,
    force: bool,
) -> Result<EventCounter> {
    let mut stats = EventCounter::new(format!("db: {}", backend.driver()));
    let mut progress = Periodic::new(from_minutes(1));

    loop {
        let mut job = match batch_queue.get().await {
            Ok(job) => job,
            Err(QueueDone) => break,
        };
        if job.is_empty() {
            stats.log("empty batches");
            continue;
        }
        match write_batch::<K>(backend.as_ref(), &mapper, &mut job, force, &mut stats).await {
            Ok(()) => {}
            Err(error) if !crate::database::is_fatal(&error) => {
                error!("failed to write a batch: {error:#}");
                stats.log("errors");
            }
            Err(error) => return Err(error),
        }
        if progress.should_trigger() {
            info!(added = stats.get(K::ADDED_COUNTER), "writing…");
        }
    }
    Ok(stats)
}

async fn write_batch<K: FetchKind>(
    backend: &dyn Backend,
    mapper: &ReleaseMapper,
    rows: &mut [K::Row],
    force: bool,
    stats: &mut EventCounter,
) -> Result {
    let account_id = K::account_id(&rows[0]);
    let last_battle_time = rows
        .iter()
        .map(|row| K::timestamp(row))
        .max()
        .expect("the batch is not empty");
    for row in rows.iter_mut() {
        let release = mapper
            .get(K::timestamp(row))
            .map(|release| release.release.clone());
        K::set_release(row, release);
    }

    let outcome = K::insert(backend, rows, force).await?;
    stats.log_n(K::ADDED_COUNTER, outcome.inserted as i64);
    stats.log_n(K::SKIPPED_COUNTER, outcome.skipped as i64);

    let mut account = backend
        .account_get(account_id)
        .await?
        .unwrap_or_else(|| Account::new(account_id));
    account.last_battle_time = Some(last_battle_time);
    account.mark_stats_updated(K::KIND);
    if outcome.inserted > 0 {
        stats.log("accounts /w new stats");
        if account.inactive {
            stats.log("accounts marked active");
        }
        account.inactive = false;
    } else {
        stats.log("accounts w/o new stats");
        if account.is_inactive() {
            if !account.inactive {
                stats.log("accounts marked inactive");
            }
            account.inactive = true;
        }
    }
    backend.account_replace(&account, true).await?;
    backend.error_log_clear(account_id, K::KIND).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::database::memory::MemoryBackend;
    use crate::models::{BasicStats, PlayerAchievements, TankStat};

    /// Scripted upstream: per-account responses, in call order.
    #[derive(Default)]
    struct FakeApi {
        responses: Mutex<HashMap<AccountId, Vec<Option<Vec<TankStat>>>>>,
    }

    impl FakeApi {
        fn respond(&self, account_id: AccountId, response: Option<Vec<TankStat>>) {
            self.responses
                .lock()
                .unwrap()
                .entry(account_id)
                .or_default()
                .push(response);
        }
    }

    #[async_trait]
    impl StatsApi for FakeApi {
        async fn get_tank_stats(
            &self,
            _region: Region,
            account_id: AccountId,
        ) -> Result<Option<Vec<TankStat>>> {
            let mut responses = self.responses.lock().unwrap();
            let scripted = responses
                .get_mut(&account_id)
                .ok_or_else(|| anyhow!("unexpected account #{account_id}"))?;
            if scripted.is_empty() {
                bail!("no response left for #{account_id}");
            }
            Ok(scripted.remove(0))
        }

        async fn get_player_achievements(
            &self,
            _region: Region,
            _account_id: AccountId,
        ) -> Result<Option<PlayerAchievements>> {
            unreachable!("the tests only fetch tank stats")
        }
    }

    fn stat(account_id: AccountId, last_battle_time: i64) -> TankStat {
        TankStat {
            account_id,
            tank_id: 1,
            last_battle_time,
            battle_life_time: 0,
            release: None,
            region: Region::from_account_id(account_id),
            all: BasicStats::default(),
        }
    }

    /// An account that yields nothing on the first pass is retried once and
    /// the final totals count unique accounts.
    #[tokio::test]
    async fn failed_account_is_retried_once() -> Result {
        let backend = Arc::new(MemoryBackend::default());
        let api = Arc::new(FakeApi::default());
        api.respond(42, None);
        api.respond(42, Some(vec![stat(42, 100)]));
        api.respond(43, Some(vec![stat(43, 110)]));

        let source = AccountSource {
            accounts: vec![42, 43],
            ..AccountSource::default()
        };
        let stats =
            run_fetch::<TankStatsKind>(Arc::clone(&backend) as _, api, source, 8, false, false)
                .await?;

        assert_eq!(stats.get("accounts total"), 2);
        assert_eq!(stats.get("accounts to re-try"), 1);
        assert_eq!(stats.get("accounts w/o stats"), 0);
        assert_eq!(stats.get("accounts disabled"), 0);
        assert_eq!(stats.get("accounts /w stats"), 2);
        assert_eq!(stats.get("tank stats fetched"), 2);
        assert_eq!(stats.get("tank stats added"), 2);

        let state = backend.state.lock().unwrap();
        assert_eq!(state.tank_stats.len(), 2);
        assert_eq!(state.accounts[&42].last_battle_time, Some(100));
        assert_eq!(state.accounts[&43].last_battle_time, Some(110));
        Ok(())
    }

    /// Without a retry queue the second pass disables the silent account.
    #[tokio::test]
    async fn silent_account_is_disabled_on_the_second_pass() -> Result {
        let backend = Arc::new(MemoryBackend::default());
        backend
            .accounts_insert(&[Account::new(42)])
            .await?;
        let api = Arc::new(FakeApi::default());
        api.respond(42, None);
        api.respond(42, None);

        let source = AccountSource {
            accounts: vec![42],
            ..AccountSource::default()
        };
        let stats =
            run_fetch::<TankStatsKind>(Arc::clone(&backend) as _, api, source, 1, false, false)
                .await?;

        assert_eq!(stats.get("accounts total"), 1);
        assert_eq!(stats.get("accounts to re-try"), 1);
        assert_eq!(stats.get("accounts w/o stats"), 1);
        assert_eq!(stats.get("accounts disabled"), 1);
        assert!(backend.state.lock().unwrap().accounts[&42].disabled);
        Ok(())
    }

    #[test]
    fn worker_count_scales_down_with_few_accounts() {
        assert_eq!(worker_count(10, 2), 1);
        assert_eq!(worker_count(10, 16), 4);
        assert_eq!(worker_count(2, 1000), 2);
        assert_eq!(worker_count(10, 0), 1);
    }
}
