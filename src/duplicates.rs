//! Duplicate analysis and pruning.
//!
//! Within a release window, only the newest row per identity key is
//! canonical. The analyzer nominates everything older into the
//! `StatsToDelete` staging table; the pruner deletes the nominated rows with
//! a window-bounded delete and unstages them. The check phase validates a
//! sample of the nominations without touching data. Each successfully
//! completed phase appends to the update log.

use std::sync::Arc;

use futures::TryStreamExt;
use rand::seq::SliceRandom;
use tokio::spawn;

use crate::counter::EventCounter;
use crate::database::{Backend, StatsFilter};
use crate::models::{
    Partition, PlayerAchievements, Release, StatsKind, StatsToDelete, TankStat, UpdateLogEntry,
};
use crate::opts::PruneOpts;
use crate::prelude::*;
use crate::queue::{QueueDone, WorkQueue};
use crate::releases::get_release;

const DUPLICATES_QUEUE_CAPACITY: usize = 1_000;
const PRUNE_BATCH: usize = 1_000;
const DEFAULT_CHECK_SAMPLE: f64 = 1_000.0;

#[instrument(skip_all, fields(kind = %kind, release = opts.release.as_str()))]
pub async fn cmd_prune(backend: Arc<dyn Backend>, kind: StatsKind, opts: &PruneOpts) -> Result {
    let release = get_release(backend.as_ref(), &opts.release).await?;
    let delete_kind = kind.delete_kind(opts.archive);

    if opts.reset {
        let n_reset = backend.stats_to_delete_reset(delete_kind).await?;
        info!(n_reset, "dropped the staged duplicates");
        let entry = UpdateLogEntry::new("reset dups", kind, Some(&release.release));
        backend.update_log_append(&entry).await?;
        return Ok(());
    }

    if opts.check {
        let stats = run_check(backend.as_ref(), kind, &release, opts).await?;
        stats.print();
        let entry = UpdateLogEntry::new("check", kind, Some(&release.release));
        backend.update_log_append(&entry).await?;
        return Ok(());
    }

    let mut stats = run_analyze(Arc::clone(&backend), kind, &release, opts).await?;
    let entry = UpdateLogEntry::new("analyze", kind, Some(&release.release));
    backend.update_log_append(&entry).await?;

    if opts.commit {
        info!(
            uri = backend.table_uri(table_of(kind, opts.archive)).as_str(),
            "pruning the staged duplicates…",
        );
        stats.merge_child(run_prune(Arc::clone(&backend), kind, &release, opts).await?);
        let entry = UpdateLogEntry::new("prune", kind, Some(&release.release));
        backend.update_log_append(&entry).await?;
    } else {
        let staged = backend
            .stats_to_delete_count(delete_kind, Some(&release.release))
            .await?;
        info!(staged, "dry run: use `--commit` to prune the staged duplicates");
    }
    stats.print();
    Ok(())
}

const fn table_of(kind: StatsKind, archive: bool) -> crate::database::Table {
    use crate::database::Table;
    match (kind, archive) {
        (StatsKind::TankStats, false) => Table::TankStats,
        (StatsKind::TankStats, true) => Table::TankStatsArchive,
        (StatsKind::PlayerAchievements, false) => Table::PlayerAchievements,
        (StatsKind::PlayerAchievements, true) => Table::PlayerAchievementsArchive,
    }
}

/// Partitions the release window, finds all-but-the-newest per identity key
/// and stages the result.
pub async fn run_analyze(
    backend: Arc<dyn Backend>,
    kind: StatsKind,
    release: &Release,
    opts: &PruneOpts,
) -> Result<EventCounter> {
    let mut stats = EventCounter::new("analyze");
    let mut partitions = match kind {
        StatsKind::TankStats => {
            let tank_ids = backend.tank_stats_unique_tank_ids(opts.archive).await?;
            Partition::account_tank_ranges(Partition::ACCOUNT_ID_STEP, &tank_ids)
        }
        StatsKind::PlayerAchievements => Partition::account_ranges(Partition::ACCOUNT_ID_STEP),
    };
    // Shuffled partitions keep the progress rate representative.
    partitions.shuffle(&mut rand::thread_rng());
    info!(n_partitions = partitions.len(), "analyzing…");

    let partition_queue: WorkQueue<Partition> = WorkQueue::unbounded();
    let duplicates_queue: WorkQueue<Vec<String>> = WorkQueue::new(DUPLICATES_QUEUE_CAPACITY);

    let saver = spawn(save_duplicates_worker(
        Arc::clone(&backend),
        kind.delete_kind(opts.archive).to_string(),
        release.release.clone(),
        duplicates_queue.clone(),
    ));
    let mut workers = Vec::new();
    for _ in 0..opts.workers {
        workers.push(spawn(find_duplicates_worker(
            Arc::clone(&backend),
            kind,
            partition_queue.clone(),
            duplicates_queue.clone(),
            release.window(),
            opts.archive,
        )));
    }

    let producer = partition_queue.producer();
    for partition in partitions {
        producer.put(partition).await;
    }
    producer.finish();

    partition_queue.join().await;
    stats.gather_stats(workers).await?;
    duplicates_queue.join().await;
    stats.gather_stats(vec![saver]).await?;
    Ok(stats)
}

async fn find_duplicates_worker(
    backend: Arc<dyn Backend>,
    kind: StatsKind,
    partition_queue: WorkQueue<Partition>,
    duplicates_queue: WorkQueue<Vec<String>>,
    window: (i64, i64),
    archive: bool,
) -> Result<EventCounter> {
    let mut stats = EventCounter::new("find duplicates");
    let producer = duplicates_queue.producer();
    loop {
        let partition = match partition_queue.get().await {
            Ok(job) => *job,
            Err(QueueDone) => break,
        };
        let result: Result = async {
            let mut groups = match kind {
                StatsKind::TankStats => {
                    backend
                        .tank_stats_duplicates(&partition, Some(window), archive)
                        .await?
                }
                StatsKind::PlayerAchievements => {
                    backend
                        .player_achievements_duplicates(&partition, Some(window), archive)
                        .await?
                }
            };
            while let Some(ids) = groups.try_next().await? {
                stats.log_n("found", ids.len() as i64);
                producer.put(ids).await;
            }
            Ok(())
        }
        .await;
        match result {
            Ok(()) => stats.log("partitions processed"),
            Err(error) if !crate::database::is_fatal(&error) => {
                error!(?partition, "failed to analyze: {error:#}");
                stats.log("errors");
            }
            Err(error) => return Err(error),
        }
    }
    Ok(stats)
}

/// Persists nominated row IDs in batches.
async fn save_duplicates_worker(
    backend: Arc<dyn Backend>,
    delete_kind: String,
    release: String,
    duplicates_queue: WorkQueue<Vec<String>>,
) -> Result<EventCounter> {
    let mut stats = EventCounter::new("save duplicates");
    loop {
        let job = match duplicates_queue.get().await {
            Ok(job) => job,
            Err(QueueDone) => break,
        };
        let entries: Vec<StatsToDelete> = job
            .iter()
            .map(|id| StatsToDelete {
                kind: delete_kind.clone(),
                id: id.clone(),
                release: Some(release.clone()),
            })
            .collect();
        match backend.stats_to_delete_insert(&entries).await {
            Ok(n_saved) => stats.log_n("saved", n_saved as i64),
            Err(error) if !crate::database::is_fatal(&error) => {
                error!("failed to stage duplicates: {error:#}");
                stats.log("errors");
            }
            Err(error) => return Err(error),
        }
    }
    Ok(stats)
}

/// Deletes the staged rows with a window-bounded delete, then unstages them.
pub async fn run_prune(
    backend: Arc<dyn Backend>,
    kind: StatsKind,
    release: &Release,
    opts: &PruneOpts,
) -> Result<EventCounter> {
    let delete_kind = kind.delete_kind(opts.archive);
    let total = backend
        .stats_to_delete_count(delete_kind, Some(&release.release))
        .await?;
    info!(total, "pruning…");

    let batch_queue: WorkQueue<Vec<String>> = WorkQueue::new(DUPLICATES_QUEUE_CAPACITY);
    let mut workers = Vec::new();
    for _ in 0..opts.workers {
        workers.push(spawn(prune_worker(
            Arc::clone(&backend),
            kind,
            delete_kind,
            release.window(),
            opts.archive,
            opts.check_archive,
            batch_queue.clone(),
        )));
    }

    let mut stats = EventCounter::new("prune");
    let producer = batch_queue.producer();
    let mut entries = backend
        .stats_to_delete_get(delete_kind, Some(&release.release), opts.sample)
        .await?;
    let mut batch = Vec::with_capacity(PRUNE_BATCH);
    while let Some(entry) = entries.try_next().await? {
        batch.push(entry.id);
        if batch.len() == PRUNE_BATCH {
            producer.put(std::mem::take(&mut batch)).await;
        }
    }
    if !batch.is_empty() {
        producer.put(batch).await;
    }
    producer.finish();

    batch_queue.join().await;
    stats.gather_stats(workers).await?;
    Ok(stats)
}

async fn prune_worker(
    backend: Arc<dyn Backend>,
    kind: StatsKind,
    delete_kind: &'static str,
    window: (i64, i64),
    archive: bool,
    check_archive: bool,
    batch_queue: WorkQueue<Vec<String>>,
) -> Result<EventCounter> {
    let mut stats = EventCounter::new("prune");
    loop {
        let job = match batch_queue.get().await {
            Ok(job) => job,
            Err(QueueDone) => break,
        };
        let ids = &*job;
        let result: Result = async {
            if check_archive && !archive {
                let n_archived = match kind {
                    StatsKind::TankStats => backend.tank_stats_count_by_ids(ids, true).await?,
                    StatsKind::PlayerAchievements => {
                        backend.player_achievements_count_by_ids(ids, true).await?
                    }
                };
                if n_archived != ids.len() as u64 {
                    error!(
                        n_archived,
                        n_ids = ids.len(),
                        "archive check failed, skipping the batch",
                    );
                    stats.log_n("archive check failed", ids.len() as i64);
                    return Ok(());
                }
            }
            let n_deleted = match kind {
                StatsKind::TankStats => {
                    backend.tank_stats_delete(ids, Some(window), archive).await?
                }
                StatsKind::PlayerAchievements => {
                    backend
                        .player_achievements_delete(ids, Some(window), archive)
                        .await?
                }
            };
            stats.log_n("pruned", n_deleted as i64);
            stats.log_n("not found", ids.len() as i64 - n_deleted as i64);
            backend.stats_to_delete_remove(delete_kind, ids).await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => {}
            Err(error) if !crate::database::is_fatal(&error) => {
                error!("failed to prune a batch: {error:#}");
                stats.log("errors");
            }
            Err(error) => return Err(error),
        }
    }
    Ok(stats)
}

/// Validates a random sample of the staged nominations: a nomination is OK
/// when a strictly newer row with the same identity key exists in the window.
pub async fn run_check(
    backend: &dyn Backend,
    kind: StatsKind,
    release: &Release,
    opts: &PruneOpts,
) -> Result<EventCounter> {
    let delete_kind = kind.delete_kind(opts.archive);
    let sample = if opts.sample > 0.0 { opts.sample } else { DEFAULT_CHECK_SAMPLE };
    let (_, window_end) = release.window();
    let mut stats = EventCounter::new("check duplicates");

    let mut entries = backend
        .stats_to_delete_get(delete_kind, Some(&release.release), sample)
        .await?;
    while let Some(entry) = entries.try_next().await? {
        let result: Result = async {
            match kind {
                StatsKind::TankStats => {
                    let (account_id, tank_id, last_battle_time) =
                        TankStat::parse_object_id(&entry.id)?;
                    let filter = StatsFilter {
                        accounts: Some(vec![account_id]),
                        tanks: Some(vec![tank_id]),
                        since: Some(last_battle_time),
                        until: Some(window_end),
                        ..StatsFilter::default()
                    };
                    let n_rows = backend.tank_stats_count(&filter, opts.archive).await?;
                    classify(&mut stats, n_rows);
                }
                StatsKind::PlayerAchievements => {
                    let (account_id, updated) = PlayerAchievements::parse_object_id(&entry.id)?;
                    let filter = StatsFilter {
                        accounts: Some(vec![account_id]),
                        since: Some(updated),
                        until: Some(window_end),
                        ..StatsFilter::default()
                    };
                    let n_rows = backend
                        .player_achievements_count(&filter, opts.archive)
                        .await?;
                    classify(&mut stats, n_rows);
                }
            }
            Ok(())
        }
        .await;
        if let Err(error) = result {
            error!(id = entry.id.as_str(), "failed to check: {error:#}");
            stats.log("skipped");
        }
    }
    Ok(stats)
}

/// `n_rows` counts the nominated row and everything newer in the window.
fn classify(stats: &mut EventCounter, n_rows: u64) {
    match n_rows {
        0 => stats.log("not found"),
        1 => stats.log("invalid"),
        _ => stats.log("ok"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryBackend;
    use crate::models::{BasicStats, TankStat};

    fn release() -> Release {
        Release::new("6.1", 200, 300)
    }

    fn stat(account_id: i64, tank_id: u32, last_battle_time: i64) -> TankStat {
        TankStat {
            account_id,
            tank_id,
            last_battle_time,
            battle_life_time: 0,
            release: Some("6.1".to_string()),
            region: None,
            all: BasicStats::default(),
        }
    }

    fn opts(commit: bool) -> PruneOpts {
        PruneOpts {
            release: "6.1".to_string(),
            commit,
            archive: false,
            check_archive: false,
            check: false,
            reset: false,
            regions: Vec::new(),
            sample: 0.0,
            workers: 2,
        }
    }

    async fn seeded_backend() -> Result<Arc<MemoryBackend>> {
        let backend = Arc::new(MemoryBackend::with_releases(vec![release()]));
        backend
            .tank_stats_insert(
                &[stat(7, 100, 210), stat(7, 100, 250), stat(7, 100, 290)],
                false,
            )
            .await?;
        Ok(backend)
    }

    /// Analyze nominates everything but the newest row in the window,
    /// prune deletes exactly those, and a re-run is a no-op.
    #[tokio::test]
    async fn analyze_then_prune_keeps_the_newest_row() -> Result {
        let backend = seeded_backend().await?;

        let stats =
            run_analyze(Arc::clone(&backend) as _, StatsKind::TankStats, &release(), &opts(false))
                .await?;
        assert_eq!(stats.get("found"), 2);
        assert_eq!(stats.get("saved"), 2);
        {
            let state = backend.state.lock().unwrap();
            let staged: Vec<&str> =
                state.stats_to_delete.iter().map(|entry| entry.id.as_str()).collect();
            assert_eq!(staged.len(), 2);
            assert!(staged.contains(&"0000000007:100:210"));
            assert!(staged.contains(&"0000000007:100:250"));
        }

        let stats =
            run_prune(Arc::clone(&backend) as _, StatsKind::TankStats, &release(), &opts(true))
                .await?;
        assert_eq!(stats.get("pruned"), 2);
        {
            let state = backend.state.lock().unwrap();
            assert_eq!(state.tank_stats.len(), 1);
            assert!(state.tank_stats.contains_key("0000000007:100:290"));
            assert!(state.stats_to_delete.is_empty());
        }

        // A second pass finds nothing to do.
        let stats =
            run_analyze(Arc::clone(&backend) as _, StatsKind::TankStats, &release(), &opts(false))
                .await?;
        assert_eq!(stats.get("found"), 0);
        let stats =
            run_prune(Arc::clone(&backend) as _, StatsKind::TankStats, &release(), &opts(true))
                .await?;
        assert_eq!(stats.get("pruned"), 0);
        assert_eq!(backend.state.lock().unwrap().tank_stats.len(), 1);
        Ok(())
    }

    /// Rows outside the release window are not nominated.
    #[tokio::test]
    async fn analyze_is_bounded_by_the_window() -> Result {
        let backend = seeded_backend().await?;
        backend
            .tank_stats_insert(&[stat(7, 100, 150), stat(7, 100, 350)], false)
            .await?;

        let stats =
            run_analyze(Arc::clone(&backend) as _, StatsKind::TankStats, &release(), &opts(false))
                .await?;
        assert_eq!(stats.get("found"), 2);

        run_prune(Arc::clone(&backend) as _, StatsKind::TankStats, &release(), &opts(true))
            .await?;
        let state = backend.state.lock().unwrap();
        assert!(state.tank_stats.contains_key("0000000007:100:150"));
        assert!(state.tank_stats.contains_key("0000000007:100:290"));
        assert!(state.tank_stats.contains_key("0000000007:100:350"));
        assert_eq!(state.tank_stats.len(), 3);
        Ok(())
    }

    /// With `--check-archive`, a batch missing from the archive is skipped.
    #[tokio::test]
    async fn archive_check_aborts_the_batch() -> Result {
        let backend = seeded_backend().await?;
        run_analyze(Arc::clone(&backend) as _, StatsKind::TankStats, &release(), &opts(false))
            .await?;

        let mut prune_opts = opts(true);
        prune_opts.check_archive = true;
        let stats =
            run_prune(Arc::clone(&backend) as _, StatsKind::TankStats, &release(), &prune_opts)
                .await?;
        assert_eq!(stats.get("pruned"), 0);
        assert_eq!(stats.get("archive check failed"), 2);
        assert_eq!(backend.state.lock().unwrap().tank_stats.len(), 3);
        Ok(())
    }

    /// The check phase classifies nominations without touching data.
    #[tokio::test]
    async fn check_classifies_nominations() -> Result {
        let backend = seeded_backend().await?;
        run_analyze(Arc::clone(&backend) as _, StatsKind::TankStats, &release(), &opts(false))
            .await?;

        let mut check_opts = opts(false);
        check_opts.check = true;
        let stats =
            run_check(backend.as_ref(), StatsKind::TankStats, &release(), &check_opts).await?;
        assert_eq!(stats.get("ok"), 2);
        assert_eq!(stats.get("invalid"), 0);
        assert_eq!(backend.state.lock().unwrap().tank_stats.len(), 3);
        Ok(())
    }
}
