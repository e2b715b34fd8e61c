//! The replay crawler: spiders the replay listing, fetches new replays and
//! feeds the participating account IDs into the account table.

use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::spawn;

use crate::accounts::{accounts_add_worker, read_accounts_file};
use crate::config::Config;
use crate::counter::EventCounter;
use crate::database::Backend;
use crate::models::AccountId;
use crate::opts::AccountsUpdateOpts;
use crate::prelude::*;
use crate::queue::{QueueDone, WorkQueue};
use crate::wotinspector::{parse_replay_ids, ReplayApi, WotInspector};

const ACCOUNT_QUEUE_CAPACITY: usize = 10_000;
const API_TIMEOUT: StdDuration = StdDuration::from_secs(30);

pub struct CrawlOptions {
    pub start_page: i32,
    pub max_pages: i32,
    pub max_old_replays: usize,
    pub n_workers: usize,
    pub force: bool,
}

/// The spider either accepts new replay IDs or drains: the early-stop on
/// "enough stale data seen" is an explicit state transition, checked at each
/// page iteration.
#[derive(Debug, PartialEq, Eq)]
enum SpiderState {
    Spidering,
    Draining,
}

#[instrument(skip_all)]
pub async fn cmd_update(
    backend: Arc<dyn Backend>,
    config: &Config,
    force: bool,
    opts: &AccountsUpdateOpts,
) -> Result {
    let mut stats = EventCounter::new("accounts update");
    let account_queue: WorkQueue<Vec<AccountId>> = WorkQueue::new(ACCOUNT_QUEUE_CAPACITY);
    let add_worker = spawn(accounts_add_worker(Arc::clone(&backend), account_queue.clone()));

    match &opts.file {
        Some(path) => {
            info!(path = %path.display(), "importing accounts…");
            let producer = account_queue.producer();
            let account_ids: Vec<AccountId> = read_accounts_file(path)
                .await?
                .into_iter()
                .map(|account| account.id)
                .collect();
            for batch in account_ids.chunks(100) {
                producer.put(batch.to_vec()).await;
            }
            producer.finish();
        }
        None => {
            let rate_limit = opts.rate_limit.unwrap_or(config.wotinspector.rate_limit);
            let max_rps = NonZeroU32::new(rate_limit.round().max(1.0) as u32)
                .expect("the rate limit is at least one");
            let auth_token = opts
                .auth_token
                .as_deref()
                .or(config.wotinspector.auth_token.as_deref());
            let api = Arc::new(WotInspector::new(API_TIMEOUT, max_rps, auth_token)?);
            let crawl_options = CrawlOptions {
                start_page: opts.start_page,
                max_pages: opts.max_pages.unwrap_or(config.wotinspector.max_pages),
                max_old_replays: opts.max_old_replays,
                n_workers: opts.workers.unwrap_or(config.wotinspector.workers),
                force,
            };
            stats.merge_child(
                run_crawl(Arc::clone(&backend), api, account_queue.clone(), &crawl_options)
                    .await?,
            );
        }
    }

    account_queue.join().await;
    stats.gather_stats(vec![add_worker]).await?;
    stats.print();
    Ok(())
}

/// Spiders the listing and fans replay fetches out to the workers, which feed
/// the account queue.
pub async fn run_crawl(
    backend: Arc<dyn Backend>,
    api: Arc<dyn ReplayApi>,
    account_queue: WorkQueue<Vec<AccountId>>,
    options: &CrawlOptions,
) -> Result<EventCounter> {
    let mut stats = EventCounter::new("crawler");
    let replay_queue: WorkQueue<String> = WorkQueue::unbounded();

    let mut workers = Vec::new();
    for _ in 0..options.n_workers.max(1) {
        workers.push(spawn(replay_fetch_worker(
            Arc::clone(&backend),
            Arc::clone(&api),
            replay_queue.clone(),
            account_queue.clone(),
        )));
    }

    stats.merge_child(spider(backend.as_ref(), api.as_ref(), &replay_queue, options).await?);
    replay_queue.join().await;
    stats.gather_stats(workers).await?;
    Ok(stats)
}

/// The single producer of replay IDs. Skips already-stored replays, counting
/// them, and transitions to [`SpiderState::Draining`] once enough of them
/// have been seen.
async fn spider(
    backend: &dyn Backend,
    api: &dyn ReplayApi,
    replay_queue: &WorkQueue<String>,
    options: &CrawlOptions,
) -> Result<EventCounter> {
    let mut stats = EventCounter::new("spider");
    let producer = replay_queue.producer();
    let mut state = SpiderState::Spidering;
    let mut n_old_replays = 0;

    for page in pages(options.start_page, options.max_pages) {
        if state == SpiderState::Draining {
            break;
        }
        debug!(page, "spidering…");
        let html = match api.get_replay_listing_page(page).await {
            Ok(html) => html,
            // Transient listing errors only skip the page.
            Err(error) => {
                error!(page, "failed to fetch the listing: {error:#}");
                stats.log("errors");
                continue;
            }
        };
        let replay_ids = parse_replay_ids(&html);
        debug!(page, n_replays = replay_ids.len());
        if replay_ids.is_empty() {
            break;
        }
        for replay_id in replay_ids {
            if backend.replay_get(&replay_id).await?.is_some() {
                stats.log("old replays found");
                if !options.force {
                    n_old_replays += 1;
                }
            } else {
                producer.put(replay_id).await;
                stats.log("new replays");
            }
        }
        if n_old_replays >= options.max_old_replays {
            info!(n_old_replays, "enough stale replays seen, draining");
            state = SpiderState::Draining;
        }
    }

    producer.finish();
    Ok(stats)
}

/// The page sequence: steps up for a positive page count, down otherwise.
fn pages(start_page: i32, max_pages: i32) -> Vec<i32> {
    if max_pages >= 0 {
        (start_page..start_page.saturating_add(max_pages)).collect()
    } else {
        (start_page.saturating_add(max_pages + 1)..=start_page)
            .rev()
            .collect()
    }
}

/// Fetches replays by ID, extracts both teams' account IDs and stores the
/// replay itself for later analysis.
async fn replay_fetch_worker(
    backend: Arc<dyn Backend>,
    api: Arc<dyn ReplayApi>,
    replay_queue: WorkQueue<String>,
    account_queue: WorkQueue<Vec<AccountId>>,
) -> Result<EventCounter> {
    let mut stats = EventCounter::new("fetch replays");
    let producer = account_queue.producer();

    loop {
        let job = match replay_queue.get().await {
            Ok(job) => job,
            Err(QueueDone) => break,
        };
        match api.get_replay(&job).await {
            Err(error) => {
                error!(replay_id = job.as_str(), "failed to fetch: {error:#}");
                stats.log("errors");
            }
            Ok(None) => {
                debug!(replay_id = job.as_str(), "not found");
                stats.log("replays not found");
            }
            Ok(Some(replay)) => {
                let players = replay.player_ids();
                stats.log_n("players found", players.len() as i64);
                producer.put(players).await;
                match backend.replay_insert(&replay).await {
                    Ok(true) => stats.log("replays added"),
                    Ok(false) => stats.log("replays not added"),
                    Err(error) if !crate::database::is_fatal(&error) => {
                        error!(replay_id = job.as_str(), "failed to insert: {error:#}");
                        stats.log("errors");
                    }
                    Err(error) => return Err(error),
                }
            }
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::database::memory::MemoryBackend;
    use crate::models::{Replay, ReplayData};

    struct FakeListing {
        requested_pages: Mutex<Vec<i32>>,
        replay_ids: Vec<String>,
    }

    #[async_trait]
    impl ReplayApi for FakeListing {
        async fn get_replay_listing_page(&self, page: i32) -> Result<String> {
            self.requested_pages.lock().unwrap().push(page);
            Ok(self
                .replay_ids
                .iter()
                .map(|id| format!("<a href=\"/en/view/{id}\">replay</a>"))
                .collect())
        }

        async fn get_replay(&self, replay_id: &str) -> Result<Option<Replay>> {
            Ok(Some(Replay {
                id: replay_id.to_string(),
                data: ReplayData::default(),
            }))
        }
    }

    fn replay_id(n: u8) -> String {
        format!("{n:032x}")
    }

    /// Every listed replay is already stored: the spider stops after the
    /// first page and the replay queue stays empty.
    #[tokio::test]
    async fn spider_stops_on_enough_old_replays() -> Result {
        let backend = MemoryBackend::default();
        for n in 0..5 {
            backend
                .replay_insert(&Replay {
                    id: replay_id(n),
                    data: ReplayData::default(),
                })
                .await?;
        }
        let api = FakeListing {
            requested_pages: Mutex::new(Vec::new()),
            replay_ids: (0..5).map(replay_id).collect(),
        };
        let replay_queue = WorkQueue::unbounded();
        let options = CrawlOptions {
            start_page: 1,
            max_pages: 10,
            max_old_replays: 3,
            n_workers: 1,
            force: false,
        };

        let stats = spider(&backend, &api, &replay_queue, &options).await?;

        assert_eq!(stats.get("old replays found"), 5);
        assert_eq!(stats.get("new replays"), 0);
        assert_eq!(replay_queue.len(), 0);
        assert_eq!(*api.requested_pages.lock().unwrap(), vec![1]);
        Ok(())
    }

    /// New replays flow through to the account queue as player ID batches.
    #[tokio::test]
    async fn crawl_extracts_players_from_new_replays() -> Result {
        let backend = Arc::new(MemoryBackend::default());
        let mut replay = Replay {
            id: replay_id(1),
            data: ReplayData::default(),
        };
        replay.data.summary.allies = vec![1, 2];
        replay.data.summary.enemies = vec![3];

        struct OneReplay(Replay);

        #[async_trait]
        impl ReplayApi for OneReplay {
            async fn get_replay_listing_page(&self, _page: i32) -> Result<String> {
                Ok(format!("<a href=\"/en/view/{}\">replay</a>", self.0.id))
            }

            async fn get_replay(&self, _replay_id: &str) -> Result<Option<Replay>> {
                Ok(Some(self.0.clone()))
            }
        }

        let account_queue = WorkQueue::new(16);
        let options = CrawlOptions {
            start_page: 1,
            max_pages: 1,
            max_old_replays: 100,
            n_workers: 1,
            force: false,
        };
        let stats = run_crawl(
            Arc::clone(&backend) as _,
            Arc::new(OneReplay(replay)),
            account_queue.clone(),
            &options,
        )
        .await?;

        assert_eq!(stats.get("new replays"), 1);
        assert_eq!(stats.get("replays added"), 1);
        assert_eq!(stats.get("players found"), 3);
        let batch = account_queue.get().await.unwrap();
        assert_eq!(*batch, vec![1, 2, 3]);
        assert!(backend.state.lock().unwrap().replays.contains_key(&replay_id(1)));
        Ok(())
    }

    #[test]
    fn page_ranges_step_both_ways() {
        assert_eq!(pages(1, 3), vec![1, 2, 3]);
        assert_eq!(pages(5, -3), vec![5, 4, 3]);
        assert_eq!(pages(1, 0), Vec::<i32>::new());
    }
}
