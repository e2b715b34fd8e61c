//! Text and data exports.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::TryStreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::spawn;
use tokio::task::spawn_blocking;

use crate::accounts::{create_account_feed, split_accounts_by_region, AccountSource};
use crate::config::Config;
use crate::counter::EventCounter;
use crate::database::{AccountFilter, Backend, Distributed, StatsFilter};
use crate::models::{Account, Region, StatsKind};
use crate::opts::{
    AccountsExportOpts, ExportDataOpts, ExportFormat, ReplaysExportOpts, StatsExportOpts,
};
use crate::prelude::*;
use crate::queue::{QueueDone, WorkQueue};
use crate::releases::get_release;

const EXPORT_QUEUE_CAPACITY: usize = 10_000;
const DATA_EXPORT_WORKERS: usize = 4;

enum Sink {
    Stdout(tokio::io::Stdout),
    File(BufWriter<tokio::fs::File>),
}

impl Sink {
    /// `None` or `-` opens standard output.
    async fn open(target: Option<&Path>, force: bool) -> Result<Self> {
        match target {
            None => Ok(Self::Stdout(tokio::io::stdout())),
            Some(path) => {
                if !force && path.exists() {
                    bail!("`{}` already exists, use `--force` to overwrite", path.display());
                }
                if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty())
                {
                    tokio::fs::create_dir_all(parent).await.with_context(|| {
                        format!("failed to create `{}`", parent.display())
                    })?;
                }
                let file = tokio::fs::File::create(path)
                    .await
                    .with_context(|| format!("failed to create `{}`", path.display()))?;
                Ok(Self::File(BufWriter::new(file)))
            }
        }
    }

    fn writer(&mut self) -> &mut (dyn AsyncWrite + Unpin + Send) {
        match self {
            Self::Stdout(stdout) => stdout,
            Self::File(file) => file,
        }
    }

    async fn write_line(&mut self, line: &str) -> Result {
        let writer = self.writer();
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result {
        self.writer().flush().await?;
        Ok(())
    }
}

fn format_account(account: &Account, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Txt => Ok(account.id.to_string()),
        ExportFormat::Json => Ok(serde_json::to_string(account)?),
        ExportFormat::Csv => Ok(format!(
            "{},{},{},{},{},{}",
            account.id,
            account.region.map(Region::to_str).unwrap_or_default(),
            account.added,
            account.last_battle_time.unwrap_or_default(),
            account.disabled,
            account.inactive,
        )),
    }
}

const ACCOUNT_CSV_HEADER: &str = "account_id,region,added,last_battle_time,disabled,inactive";

/// Drains the queue into one file (or standard output).
async fn write_accounts_worker(
    queue: WorkQueue<Account>,
    format: ExportFormat,
    target: Option<PathBuf>,
    force: bool,
) -> Result<EventCounter> {
    let mut stats = EventCounter::new("export");
    let mut sink = Sink::open(target.as_deref(), force).await?;
    if format == ExportFormat::Csv {
        sink.write_line(ACCOUNT_CSV_HEADER).await?;
    }
    loop {
        let job = match queue.get().await {
            Ok(job) => job,
            Err(QueueDone) => break,
        };
        match format_account(&job, format) {
            Ok(line) => {
                sink.write_line(&line).await?;
                stats.log("written");
            }
            Err(error) => {
                error!(account_id = job.id, "failed to format: {error:#}");
                stats.log("errors");
            }
        }
    }
    sink.flush().await?;
    Ok(stats)
}

#[instrument(skip_all)]
pub async fn cmd_accounts_export(
    backend: Arc<dyn Backend>,
    config: &Config,
    opts: &AccountsExportOpts,
    force: bool,
) -> Result {
    let format = resolve_format(opts.format, config.accounts.export_format.as_deref())?;
    let filename = opts
        .filename
        .clone()
        .or_else(|| config.accounts.export_file.clone())
        .unwrap_or_else(|| "accounts".to_string());
    let to_stdout = filename == "-";
    let regions = if opts.regions.is_empty() {
        Region::api_regions().to_vec()
    } else {
        opts.regions.clone()
    };
    let filter = AccountFilter {
        regions: regions.clone(),
        inactive: opts.inactive,
        disabled: opts.disabled,
        sample: opts.sample,
        cache_valid_secs: None,
        distributed: None,
    };

    let total = backend.accounts_count(None, &filter).await?;
    info!(total, "exporting accounts…");
    let mut stats = EventCounter::new("accounts export");
    let mut workers = Vec::new();

    if let Some(n_shards) = opts.shards {
        // Disjoint shard files: `id mod N == i` goes into file `i`.
        for index in 0..n_shards {
            let queue = WorkQueue::new(EXPORT_QUEUE_CAPACITY);
            let source = AccountSource {
                filter: AccountFilter {
                    distributed: Some(Distributed {
                        index: index as u64,
                        modulus: n_shards as u64,
                    }),
                    ..filter.clone()
                },
                ..AccountSource::default()
            };
            workers.push(spawn(create_account_feed(
                Arc::clone(&backend),
                None,
                source,
                queue.clone(),
            )));
            workers.push(spawn(write_accounts_worker(
                queue,
                format,
                Some(PathBuf::from(format!("{filename}.{index}"))),
                force,
            )));
        }
    } else if opts.by_region {
        let all_queue = WorkQueue::pass_through(EXPORT_QUEUE_CAPACITY);
        let mut region_queues = std::collections::HashMap::new();
        for region in &regions {
            let queue = WorkQueue::new(EXPORT_QUEUE_CAPACITY);
            region_queues.insert(*region, queue.clone());
            workers.push(spawn(write_accounts_worker(
                queue,
                format,
                Some(PathBuf::from(format!("{filename}.{region}"))),
                force,
            )));
        }
        workers.push(spawn(split_accounts_by_region(all_queue.clone(), region_queues)));
        workers.push(spawn(create_account_feed(
            Arc::clone(&backend),
            None,
            AccountSource {
                filter,
                ..AccountSource::default()
            },
            all_queue,
        )));
    } else {
        let queue = WorkQueue::new(EXPORT_QUEUE_CAPACITY);
        let target = (!to_stdout).then(|| PathBuf::from(format!("{filename}.all")));
        workers.push(spawn(write_accounts_worker(queue.clone(), format, target, force)));
        workers.push(spawn(create_account_feed(
            Arc::clone(&backend),
            None,
            AccountSource {
                filter,
                ..AccountSource::default()
            },
            queue,
        )));
    }

    stats.gather_stats(workers).await?;
    if !to_stdout {
        stats.print();
    }
    Ok(())
}

#[instrument(skip_all, fields(kind = %kind))]
pub async fn cmd_stats_export(
    backend: Arc<dyn Backend>,
    config: &Config,
    kind: StatsKind,
    opts: &StatsExportOpts,
    force: bool,
) -> Result {
    let format = resolve_format(opts.format, config.tank_stats.export_format.as_deref())?;
    if format != ExportFormat::Json {
        bail!("stats export supports the JSON format only");
    }
    let filename = opts
        .filename
        .clone()
        .or_else(|| config.tank_stats.export_file.clone())
        .unwrap_or_else(|| kind.as_str().to_string());
    let to_stdout = filename == "-";
    let regions = if opts.regions.is_empty() {
        Region::api_regions().to_vec()
    } else {
        opts.regions.clone()
    };
    let filter = StatsFilter {
        release: opts.release.clone(),
        regions: regions.clone(),
        accounts: (!opts.accounts.is_empty()).then(|| opts.accounts.clone()),
        tanks: (!opts.tanks.is_empty()).then(|| opts.tanks.clone()),
        since: None,
        until: None,
        sample: opts.sample,
    };

    let mut stats = EventCounter::new(format!("{kind} export"));
    if opts.by_region {
        for region in regions {
            let filter = StatsFilter {
                regions: vec![region],
                ..filter.clone()
            };
            let target = Some(PathBuf::from(format!("{filename}.{region}")));
            write_stats_rows(backend.as_ref(), kind, &filter, target, force, &mut stats).await?;
        }
    } else {
        let target = (!to_stdout).then(|| PathBuf::from(format!("{filename}.all")));
        write_stats_rows(backend.as_ref(), kind, &filter, target, force, &mut stats).await?;
    }
    if !to_stdout {
        stats.print();
    }
    Ok(())
}

/// Streams the matching rows into one JSON-lines file.
async fn write_stats_rows(
    backend: &dyn Backend,
    kind: StatsKind,
    filter: &StatsFilter,
    target: Option<PathBuf>,
    force: bool,
    stats: &mut EventCounter,
) -> Result {
    let mut sink = Sink::open(target.as_deref(), force).await?;
    match kind {
        StatsKind::TankStats => {
            let mut rows = backend.tank_stats_get(filter, false).await?;
            while let Some(row) = rows.try_next().await? {
                sink.write_line(&serde_json::to_string(&row)?).await?;
                stats.log("written");
            }
        }
        StatsKind::PlayerAchievements => {
            let mut rows = backend.player_achievements_get(filter, false).await?;
            while let Some(row) = rows.try_next().await? {
                sink.write_line(&serde_json::to_string(&row)?).await?;
                stats.log("written");
            }
        }
    }
    sink.flush().await
}

#[instrument(skip_all)]
pub async fn cmd_replays_export(
    backend: Arc<dyn Backend>,
    opts: &ReplaysExportOpts,
    force: bool,
) -> Result {
    let target = opts
        .filename
        .as_deref()
        .filter(|filename| *filename != "-")
        .map(PathBuf::from);
    let mut sink = Sink::open(target.as_deref(), force).await?;
    let mut stats = EventCounter::new("replays export");
    let mut replays = backend.replays_get(opts.sample).await?;
    while let Some(replay) = replays.try_next().await? {
        sink.write_line(&serde_json::to_string(&replay)?).await?;
        stats.log("written");
    }
    sink.flush().await?;
    if target.is_some() {
        stats.print();
    }
    Ok(())
}

/// `tank-stats export-data`: one LZ4-framed file of flattened JSON rows per
/// tank, under `basedir/<release>/`.
#[instrument(skip_all, fields(release = opts.release.as_str()))]
pub async fn cmd_export_data(
    backend: Arc<dyn Backend>,
    config: &Config,
    opts: &ExportDataOpts,
    force: bool,
) -> Result {
    let release = get_release(backend.as_ref(), &opts.release).await?;
    let filename = config
        .tank_stats
        .export_data_file
        .clone()
        .unwrap_or_else(|| opts.filename.clone());
    let directory = opts.basedir.join(&release.release);
    tokio::fs::create_dir_all(&directory)
        .await
        .with_context(|| format!("failed to create `{}`", directory.display()))?;
    let regions = if opts.regions.is_empty() {
        Region::api_regions().to_vec()
    } else {
        opts.regions.clone()
    };

    let tank_ids = backend.tank_stats_unique_tank_ids(false).await?;
    info!(n_tanks = tank_ids.len(), "exporting…");

    let tank_queue: WorkQueue<crate::models::TankId> = WorkQueue::unbounded();
    let mut workers = Vec::new();
    for _ in 0..DATA_EXPORT_WORKERS {
        let filter = StatsFilter::for_release(&release, &regions);
        let prefix = directory.join(&filename);
        workers.push(spawn(export_data_worker(
            Arc::clone(&backend),
            filter,
            prefix,
            tank_queue.clone(),
            force,
        )));
    }

    let producer = tank_queue.producer();
    for tank_id in tank_ids {
        producer.put(tank_id).await;
    }
    producer.finish();
    tank_queue.join().await;

    let mut stats = EventCounter::new("tank stats export-data");
    stats.gather_stats(workers).await?;
    stats.print();
    Ok(())
}

async fn export_data_worker(
    backend: Arc<dyn Backend>,
    filter: StatsFilter,
    prefix: PathBuf,
    tank_queue: WorkQueue<crate::models::TankId>,
    force: bool,
) -> Result<EventCounter> {
    let mut stats = EventCounter::new("fetch");
    loop {
        let tank_id = match tank_queue.get().await {
            Ok(job) => *job,
            Err(QueueDone) => break,
        };
        let path = prefix.with_extension(format!("{tank_id}.lz4"));
        if !force && path.exists() {
            stats.log("tanks skipped");
            continue;
        }
        let filter = StatsFilter {
            tanks: Some(vec![tank_id]),
            ..filter.clone()
        };

        let mut rows = backend.tank_stats_get(&filter, false).await?;
        let mut lines = Vec::new();
        while let Some(row) = rows.try_next().await? {
            lines.push(serde_json::to_string(&row.flattened())?);
        }
        stats.log_n("rows written", lines.len() as i64);

        let frame = spawn_blocking(move || -> Result<Vec<u8>> {
            let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
            for line in &lines {
                encoder.write_all(line.as_bytes())?;
                encoder.write_all(b"\n")?;
            }
            Ok(encoder.finish()?)
        })
        .await??;
        tokio::fs::write(&path, frame)
            .await
            .with_context(|| format!("failed to write `{}`", path.display()))?;
        stats.log("tanks processed");
    }
    Ok(stats)
}

fn resolve_format(
    cli: Option<ExportFormat>,
    configured: Option<&str>,
) -> Result<ExportFormat> {
    if let Some(format) = cli {
        return Ok(format);
    }
    match configured {
        None => Ok(ExportFormat::Json),
        Some("json") => Ok(ExportFormat::Json),
        Some("csv") => Ok(ExportFormat::Csv),
        Some("txt") => Ok(ExportFormat::Txt),
        Some(other) => bail!("`{other}` is not a valid export format"),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn account_lines_match_the_format() -> Result {
        let account = Account::new(600_000_000);
        assert_eq!(format_account(&account, ExportFormat::Txt)?, "600000000");
        let csv = format_account(&account, ExportFormat::Csv)?;
        assert!(csv.starts_with("600000000,eu,"));
        let json: Account = serde_json::from_str(&format_account(&account, ExportFormat::Json)?)?;
        assert_eq!(json.id, 600_000_000);
        Ok(())
    }

    #[test]
    fn lz4_frames_round_trip() -> Result {
        let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
        encoder.write_all(b"{\"account_id\":1}\n")?;
        let frame = encoder.finish()?;

        let mut decoder = lz4_flex::frame::FrameDecoder::new(frame.as_slice());
        let mut contents = String::new();
        decoder.read_to_string(&mut contents)?;
        assert_eq!(contents, "{\"account_id\":1}\n");
        Ok(())
    }
}
