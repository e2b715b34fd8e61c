//! The archive snapshotter: per partition, merges the newest archived row
//! per identity key into the latest collection, keeping existing rows.

use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::spawn;

use crate::counter::EventCounter;
use crate::database::Backend;
use crate::models::{Partition, StatsKind, UpdateLogEntry};
use crate::opts::SnapshotOpts;
use crate::prelude::*;
use crate::queue::{QueueDone, WorkQueue};

#[instrument(skip_all, fields(kind = %kind))]
pub async fn cmd_snapshot(
    backend: Arc<dyn Backend>,
    kind: StatsKind,
    opts: &SnapshotOpts,
) -> Result {
    let stats = run_snapshot(Arc::clone(&backend), kind, opts).await?;
    let entry = UpdateLogEntry::new("snapshot", kind, None);
    backend.update_log_append(&entry).await?;
    stats.print();
    Ok(())
}

pub async fn run_snapshot(
    backend: Arc<dyn Backend>,
    kind: StatsKind,
    opts: &SnapshotOpts,
) -> Result<EventCounter> {
    let mut partitions = match kind {
        StatsKind::TankStats => {
            let tank_ids = if opts.tanks.is_empty() {
                backend.tank_stats_unique_tank_ids(true).await?
            } else {
                opts.tanks.clone()
            };
            Partition::account_tank_ranges(Partition::ACCOUNT_ID_STEP, &tank_ids)
        }
        StatsKind::PlayerAchievements => Partition::account_ranges(Partition::ACCOUNT_ID_STEP),
    };
    // Shuffled partitions keep the progress rate representative.
    partitions.shuffle(&mut rand::thread_rng());
    info!(n_partitions = partitions.len(), "snapshotting…");

    let partition_queue: WorkQueue<Partition> = WorkQueue::unbounded();
    let mut workers = Vec::new();
    for _ in 0..opts.workers {
        workers.push(spawn(snapshot_worker(
            Arc::clone(&backend),
            kind,
            partition_queue.clone(),
        )));
    }

    let producer = partition_queue.producer();
    for partition in partitions {
        producer.put(partition).await;
    }
    producer.finish();
    partition_queue.join().await;

    let mut stats = EventCounter::new("snapshot");
    stats.gather_stats(workers).await?;
    Ok(stats)
}

async fn snapshot_worker(
    backend: Arc<dyn Backend>,
    kind: StatsKind,
    partition_queue: WorkQueue<Partition>,
) -> Result<EventCounter> {
    let mut stats = EventCounter::new("snapshot");
    loop {
        let partition = match partition_queue.get().await {
            Ok(job) => *job,
            Err(QueueDone) => break,
        };
        let result = match kind {
            StatsKind::TankStats => backend.tank_stats_snapshot_partition(&partition).await,
            StatsKind::PlayerAchievements => {
                backend.player_achievements_snapshot_partition(&partition).await
            }
        };
        match result {
            Ok(n_rows) => {
                stats.log_n("snapshotted", n_rows as i64);
                stats.log("partitions processed");
            }
            Err(error) if !crate::database::is_fatal(&error) => {
                error!(?partition, "failed to snapshot: {error:#}");
                stats.log("errors");
            }
            Err(error) => return Err(error),
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryBackend;
    use crate::models::{BasicStats, TankStat};

    fn archived(account_id: i64, tank_id: u32, last_battle_time: i64) -> (String, TankStat) {
        let stat = TankStat {
            account_id,
            tank_id,
            last_battle_time,
            battle_life_time: 0,
            release: None,
            region: None,
            all: BasicStats::default(),
        };
        (stat.object_id(), stat)
    }

    fn opts() -> SnapshotOpts {
        SnapshotOpts {
            tanks: Vec::new(),
            workers: 2,
        }
    }

    /// The newest archived row per key lands in the latest collection, and
    /// running the snapshot twice changes nothing.
    #[tokio::test]
    async fn snapshot_is_idempotent() -> Result {
        let backend = Arc::new(MemoryBackend::default());
        {
            let mut state = backend.state.lock().unwrap();
            state.tank_stats_archive.extend([
                archived(5, 1, 100),
                archived(5, 1, 200),
                archived(6, 1, 150),
            ]);
        }

        let stats = run_snapshot(Arc::clone(&backend) as _, StatsKind::TankStats, &opts()).await?;
        assert_eq!(stats.get("snapshotted"), 3);
        {
            let state = backend.state.lock().unwrap();
            assert_eq!(state.tank_stats.len(), 2);
            assert!(state.tank_stats.contains_key("0000000005:1:200"));
            assert!(state.tank_stats.contains_key("0000000006:1:150"));
        }

        run_snapshot(Arc::clone(&backend) as _, StatsKind::TankStats, &opts()).await?;
        let state = backend.state.lock().unwrap();
        assert_eq!(state.tank_stats.len(), 2);
        assert!(state.tank_stats.contains_key("0000000005:1:200"));
        assert!(state.tank_stats.contains_key("0000000006:1:150"));
        Ok(())
    }
}
