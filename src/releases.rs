//! The release table and the release mapper.

use std::path::Path;
use std::sync::Arc;

use futures::TryStreamExt;

use crate::bucket::BucketMapper;
use crate::counter::EventCounter;
use crate::database::{Backend, StatsField, StatsFilter};
use crate::models::{Release, StatsKind};
use crate::opts::{ReleasesExportOpts, ReleasesImportOpts, RemapReleaseOpts};
use crate::prelude::*;

/// Assigns stats to releases by timestamp. Read-only after construction,
/// shared freely between workers.
pub struct ReleaseMapper {
    mapper: BucketMapper<Release>,
}

impl ReleaseMapper {
    pub fn new(releases: impl IntoIterator<Item = Release>) -> Self {
        Self {
            mapper: BucketMapper::new(
                releases
                    .into_iter()
                    .map(|release| (release.launch_time, release)),
            ),
        }
    }

    /// The release whose window contains the timestamp.
    ///
    /// A stat timed exactly at a launch belongs to the previous release,
    /// because the window is open at its launch end: `launch < t ≤ cutoff`.
    /// The very first release has no previous one and keeps such a stat.
    pub fn get(&self, timestamp: i64) -> Option<&Release> {
        let index = self.mapper.position(timestamp)?;
        let (launch_time, release) = self.mapper.bucket(index).expect("the index is in range");
        if timestamp == *launch_time && index > 0 {
            self.mapper.bucket(index - 1).map(|(_, release)| release)
        } else {
            Some(release)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mapper.is_empty()
    }
}

/// Builds the release mapper from the release table.
pub async fn release_mapper(backend: &dyn Backend) -> Result<ReleaseMapper> {
    let releases = backend.releases_get(None).await?;
    if releases.is_empty() {
        warn!("the release table is empty, no releases will be assigned");
    }
    Ok(ReleaseMapper::new(releases))
}

/// `… edit remap-release`: streams stored rows, recomputes their release and
/// either applies or logs the change, gated by `--commit`.
#[instrument(skip_all, fields(kind = %kind, commit = opts.commit))]
pub async fn cmd_remap_release(
    backend: Arc<dyn Backend>,
    kind: StatsKind,
    opts: &RemapReleaseOpts,
) -> Result {
    let mapper = release_mapper(backend.as_ref()).await?;
    if mapper.is_empty() {
        bail!("cannot remap: the release table is empty");
    }
    let filter = StatsFilter {
        release: opts.release.clone(),
        regions: opts.regions.clone(),
        accounts: (!opts.accounts.is_empty()).then(|| opts.accounts.clone()),
        tanks: (!opts.tanks.is_empty()).then(|| opts.tanks.clone()),
        since: opts.since,
        until: None,
        sample: opts.sample,
    };

    info!("counting rows to scan…");
    let total = match kind {
        StatsKind::TankStats => backend.tank_stats_count(&filter, false).await?,
        StatsKind::PlayerAchievements => {
            backend.player_achievements_count(&filter, false).await?
        }
    };
    info!(total, "remapping…");

    let mut stats = EventCounter::new("remap releases");
    match kind {
        StatsKind::TankStats => {
            let mut rows = backend.tank_stats_get(&filter, false).await?;
            while let Some(mut row) = rows.try_next().await? {
                let correct = match mapper.get(row.last_battle_time) {
                    Some(release) => release.release.clone(),
                    None => {
                        error!(id = row.object_id().as_str(), "could not map the row");
                        stats.log("errors");
                        continue;
                    }
                };
                if row.release.as_deref() == Some(correct.as_str()) {
                    stats.log("no need");
                } else if !opts.commit {
                    info!(
                        id = row.object_id().as_str(),
                        from = row.release.as_deref(),
                        to = correct.as_str(),
                        "would update",
                    );
                    stats.log("would update");
                } else {
                    row.release = Some(correct);
                    if backend.tank_stat_update(&row, &[StatsField::Release]).await? {
                        stats.log("updated");
                    } else {
                        stats.log("failed to update");
                    }
                }
            }
        }
        StatsKind::PlayerAchievements => {
            let mut rows = backend.player_achievements_get(&filter, false).await?;
            while let Some(mut row) = rows.try_next().await? {
                let correct = match mapper.get(row.updated) {
                    Some(release) => release.release.clone(),
                    None => {
                        error!(id = row.object_id().as_str(), "could not map the row");
                        stats.log("errors");
                        continue;
                    }
                };
                if row.release.as_deref() == Some(correct.as_str()) {
                    stats.log("no need");
                } else if !opts.commit {
                    info!(
                        id = row.object_id().as_str(),
                        from = row.release.as_deref(),
                        to = correct.as_str(),
                        "would update",
                    );
                    stats.log("would update");
                } else {
                    row.release = Some(correct);
                    if backend
                        .player_achievements_update(&row, &[StatsField::Release])
                        .await?
                    {
                        stats.log("updated");
                    } else {
                        stats.log("failed to update");
                    }
                }
            }
        }
    }
    stats.print();
    Ok(())
}

/// Resolves the named release, with its effective window.
pub async fn get_release(backend: &dyn Backend, release: &str) -> Result<Release> {
    backend
        .release_get(release)
        .await?
        .ok_or_else(|| anyhow!("unknown release `{release}`"))
}

#[instrument(skip_all)]
pub async fn cmd_list(backend: Arc<dyn Backend>) -> Result {
    for release in backend.releases_get(None).await? {
        let cutoff = match release.cutoff_time {
            0 => "current".to_string(),
            cutoff_time => cutoff_time.to_string(),
        };
        println!("{}\t{}\t{}", release.release, release.launch_time, cutoff);
    }
    Ok(())
}

#[instrument(skip_all, fields(file = %opts.file.display()))]
pub async fn cmd_import(
    backend: Arc<dyn Backend>,
    opts: &ReleasesImportOpts,
    force: bool,
) -> Result {
    let releases = read_releases(&opts.file).await?;
    let outcome = backend.releases_insert(&releases, force).await?;
    info!(inserted = outcome.inserted, skipped = outcome.skipped, "done");
    Ok(())
}

#[instrument(skip_all)]
pub async fn cmd_export(
    backend: Arc<dyn Backend>,
    opts: &ReleasesExportOpts,
    force: bool,
) -> Result {
    let releases = backend.releases_get(None).await?;
    let contents = serde_json::to_string_pretty(&releases)?;
    match opts.filename.as_deref() {
        None | Some("-") => println!("{contents}"),
        Some(path) => {
            if !force && Path::new(path).exists() {
                bail!("`{path}` already exists, use `--force` to overwrite");
            }
            tokio::fs::write(path, contents)
                .await
                .with_context(|| format!("failed to write `{path}`"))?;
        }
    }
    Ok(())
}

async fn read_releases(path: &Path) -> Result<Vec<Release>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read `{}`", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse `{}`", path.display()))
}
