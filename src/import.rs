//! Bulk imports: copying rows from another backend.
//!
//! The source backend yields raw untyped rows; they are mapped onto the
//! typed models before insertion, and releases are re-assigned on the way in
//! unless `--no-release-map` is given.

use std::sync::Arc;

use futures::TryStreamExt;
use tokio::spawn;

use crate::counter::EventCounter;
use crate::database::{open_import, Backend, Table};
use crate::fetcher::{FetchKind, PlayerAchievementsKind, TankStatsKind};
use crate::models::{Account, Replay, StatsKind};
use crate::opts::ImportOpts;
use crate::prelude::*;
use crate::queue::{QueueDone, WorkQueue};
use crate::releases::{release_mapper, ReleaseMapper};

const IMPORT_BATCH: usize = 1_000;
const IMPORT_QUEUE_CAPACITY: usize = 100;

#[instrument(skip_all, fields(kind = %kind, uri = opts.uri.as_str()))]
pub async fn cmd_stats_import(
    backend: Arc<dyn Backend>,
    kind: StatsKind,
    opts: &ImportOpts,
    force: bool,
) -> Result {
    let source = open_import(opts.driver, &opts.uri).await?;
    let mapper = if opts.no_release_map {
        None
    } else {
        Some(Arc::new(release_mapper(backend.as_ref()).await?))
    };
    let stats = match kind {
        StatsKind::TankStats => {
            run_import::<TankStatsKind>(backend, source, Table::TankStats, mapper, opts, force)
                .await?
        }
        StatsKind::PlayerAchievements => {
            run_import::<PlayerAchievementsKind>(
                backend,
                source,
                Table::PlayerAchievements,
                mapper,
                opts,
                force,
            )
            .await?
        }
    };
    stats.print();
    Ok(())
}

async fn run_import<K: FetchKind>(
    backend: Arc<dyn Backend>,
    source: Arc<dyn Backend>,
    table: Table,
    mapper: Option<Arc<ReleaseMapper>>,
    opts: &ImportOpts,
    force: bool,
) -> Result<EventCounter> {
    let mut stats = EventCounter::new(format!("{} import", K::KIND));
    let queue: WorkQueue<Vec<K::Row>> = WorkQueue::new(IMPORT_QUEUE_CAPACITY);

    let mut workers = Vec::new();
    for _ in 0..opts.workers {
        workers.push(spawn(insert_worker::<K>(
            Arc::clone(&backend),
            queue.clone(),
            force,
        )));
    }

    let producer = queue.producer();
    let mut rows = source.objs_export(table, opts.sample).await?;
    let mut batch: Vec<K::Row> = Vec::with_capacity(IMPORT_BATCH);
    while let Some(value) = rows.try_next().await? {
        let mut row: K::Row = match serde_json::from_value(value) {
            Ok(row) => row,
            // A malformed source row is counted and skipped.
            Err(error) => {
                error!("failed to transform a row: {error:#}");
                stats.log("errors");
                continue;
            }
        };
        if let Some(mapper) = &mapper {
            let release = mapper
                .get(K::timestamp(&row))
                .map(|release| release.release.clone());
            K::set_release(&mut row, release);
        }
        stats.log("read");
        batch.push(row);
        if batch.len() == IMPORT_BATCH {
            producer.put(std::mem::take(&mut batch)).await;
        }
    }
    if !batch.is_empty() {
        producer.put(batch).await;
    }
    producer.finish();

    queue.join().await;
    stats.gather_stats(workers).await?;
    Ok(stats)
}

async fn insert_worker<K: FetchKind>(
    backend: Arc<dyn Backend>,
    queue: WorkQueue<Vec<K::Row>>,
    force: bool,
) -> Result<EventCounter> {
    let mut stats = EventCounter::new(format!("db: {}", backend.driver()));
    loop {
        let job = match queue.get().await {
            Ok(job) => job,
            Err(QueueDone) => break,
        };
        match K::insert(backend.as_ref(), &job, force).await {
            Ok(outcome) => {
                stats.log_n(K::ADDED_COUNTER, outcome.inserted as i64);
                stats.log_n(K::SKIPPED_COUNTER, outcome.skipped as i64);
            }
            Err(error) if !crate::database::is_fatal(&error) => {
                error!("failed to insert a batch: {error:#}");
                stats.log("errors");
            }
            Err(error) => return Err(error),
        }
    }
    Ok(stats)
}

#[instrument(skip_all, fields(uri = opts.uri.as_str()))]
pub async fn cmd_accounts_import(
    backend: Arc<dyn Backend>,
    opts: &ImportOpts,
    _force: bool,
) -> Result {
    let source = open_import(opts.driver, &opts.uri).await?;
    let mut stats = EventCounter::new("accounts import");

    let mut rows = source.objs_export(Table::Accounts, opts.sample).await?;
    let mut batch: Vec<Account> = Vec::with_capacity(IMPORT_BATCH);
    while let Some(value) = rows.try_next().await? {
        match serde_json::from_value::<Account>(value) {
            Ok(account) => {
                stats.log("read");
                batch.push(account);
            }
            Err(error) => {
                error!("failed to transform an account: {error:#}");
                stats.log("errors");
            }
        }
        if batch.len() == IMPORT_BATCH {
            let outcome = backend.accounts_insert(&batch).await?;
            stats.log_n("accounts added", outcome.inserted as i64);
            stats.log_n("old accounts found", outcome.skipped as i64);
            batch.clear();
        }
    }
    if !batch.is_empty() {
        let outcome = backend.accounts_insert(&batch).await?;
        stats.log_n("accounts added", outcome.inserted as i64);
        stats.log_n("old accounts found", outcome.skipped as i64);
    }
    stats.print();
    Ok(())
}

#[instrument(skip_all, fields(uri = opts.uri.as_str()))]
pub async fn cmd_replays_import(backend: Arc<dyn Backend>, opts: &ImportOpts) -> Result {
    let source = open_import(opts.driver, &opts.uri).await?;
    let mut stats = EventCounter::new("replays import");

    let mut rows = source.objs_export(Table::Replays, opts.sample).await?;
    let mut batch: Vec<Replay> = Vec::with_capacity(IMPORT_BATCH);
    while let Some(value) = rows.try_next().await? {
        match serde_json::from_value::<Replay>(value) {
            Ok(replay) => {
                stats.log("read");
                batch.push(replay);
            }
            Err(error) => {
                error!("failed to transform a replay: {error:#}");
                stats.log("errors");
            }
        }
        if batch.len() == IMPORT_BATCH {
            let outcome = backend.replays_insert(&batch).await?;
            stats.log_n("replays added", outcome.inserted as i64);
            stats.log_n("old replays found", outcome.skipped as i64);
            batch.clear();
        }
    }
    if !batch.is_empty() {
        let outcome = backend.replays_insert(&batch).await?;
        stats.log_n("replays added", outcome.inserted as i64);
        stats.log_n("old replays found", outcome.skipped as i64);
    }
    stats.print();
    Ok(())
}
