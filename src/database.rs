//! The persistence contract the pipelines consume, and the driver registry.

use std::sync::Arc;

use clap::ValueEnum;
use futures::stream::BoxStream;

use crate::models::{
    Account, AccountId, ErrorLogEntry, Partition, PlayerAchievements, Region, Release, Replay,
    StatsKind, StatsToDelete, TankId, TankStat, UpdateLogEntry, Vehicle,
};
use crate::prelude::*;

#[cfg(test)]
pub mod memory;
pub mod mongodb;

/// Backend failure kinds. Drivers retry transient failures internally up to a
/// bounded count before surfacing them; fatal failures terminate the command.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("transient backend failure")]
    Transient(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("fatal backend failure")]
    Fatal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Whether the error must terminate the running command instead of being
/// counted and skipped.
pub fn is_fatal(error: &anyhow::Error) -> bool {
    matches!(error.downcast_ref::<BackendError>(), Some(BackendError::Fatal(_)))
}

#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum Driver {
    Mongodb,
    Postgresql,
    Files,
}

/// Logical tables the engine persists into, referenced by name.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Table {
    Accounts,
    TankStats,
    TankStatsArchive,
    PlayerAchievements,
    PlayerAchievementsArchive,
    Replays,
    Releases,
    Tankopedia,
    StatsToDelete,
    UpdateLog,
    ErrorLog,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: usize,
    pub skipped: usize,
}

/// Inactive-account selection, mirroring the `--inactive` option.
#[derive(ValueEnum, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum InactiveAccounts {
    /// Include inactive accounts only when their cached stats have expired.
    #[default]
    Auto,
    /// Exclude inactive accounts.
    No,
    /// Only inactive accounts.
    Yes,
    /// Do not filter on activity.
    Both,
}

/// `I:N` sharding across cooperating invocations: only accounts with
/// `id mod N == I` are selected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Distributed {
    pub index: u64,
    pub modulus: u64,
}

impl std::str::FromStr for Distributed {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let (index, modulus) = value
            .split_once(':')
            .ok_or_else(|| anyhow!("expected `I:N`, got `{value}`"))?;
        let (index, modulus) = (index.parse()?, modulus.parse()?);
        if modulus == 0 || index >= modulus {
            bail!("`{value}` is not a valid shard: expected I < N, N ≥ 1");
        }
        Ok(Self { index, modulus })
    }
}

#[derive(Clone, Debug, Default)]
pub struct AccountFilter {
    pub regions: Vec<Region>,
    pub inactive: InactiveAccounts,
    /// Select disabled accounts instead of enabled ones.
    pub disabled: bool,
    /// `0` – everything, `(0, 1)` – fraction, `≥ 1` – absolute count.
    pub sample: f64,
    /// Only accounts whose per-kind stats are older than this many seconds.
    pub cache_valid_secs: Option<i64>,
    pub distributed: Option<Distributed>,
}

#[derive(Clone, Debug, Default)]
pub struct StatsFilter {
    pub release: Option<String>,
    pub regions: Vec<Region>,
    pub accounts: Option<Vec<AccountId>>,
    pub tanks: Option<Vec<TankId>>,
    /// Only rows with a timestamp of at least this value.
    pub since: Option<i64>,
    /// Only rows with a timestamp up to and including this value.
    pub until: Option<i64>,
    pub sample: f64,
}

impl StatsFilter {
    pub fn for_release(release: &Release, regions: &[Region]) -> Self {
        Self {
            release: Some(release.release.clone()),
            regions: regions.to_vec(),
            ..Self::default()
        }
    }
}

/// Typed field selectors for partial updates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccountField {
    Region,
    LastBattleTime,
    Disabled,
    Inactive,
    StatsUpdated,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StatsField {
    Release,
}

/// The persistence contract. Every operation may fail with
/// [`BackendError::Transient`] (already retried by the driver) or
/// [`BackendError::Fatal`] in the error chain.
///
/// Batch inserts are idempotent by identity key. Result streams tolerate the
/// caller pausing. A driver may reorder results unless documented otherwise.
#[async_trait]
pub trait Backend: Send + Sync {
    fn driver(&self) -> &'static str;

    /// Physical table/collection URI for logging.
    fn table_uri(&self, table: Table) -> String;

    async fn setup_indexes(&self) -> Result;

    // Accounts.

    async fn accounts_count(&self, kind: Option<StatsKind>, filter: &AccountFilter)
        -> Result<u64>;

    async fn accounts_get(
        &self,
        kind: Option<StatsKind>,
        filter: &AccountFilter,
    ) -> Result<BoxStream<'_, Result<Account>>>;

    async fn accounts_insert(&self, accounts: &[Account]) -> Result<InsertOutcome>;

    async fn account_get(&self, account_id: AccountId) -> Result<Option<Account>>;

    async fn account_update(&self, account: &Account, fields: &[AccountField]) -> Result<bool>;

    async fn account_replace(&self, account: &Account, upsert: bool) -> Result;

    // Tank stats.

    async fn tank_stats_count(&self, filter: &StatsFilter, archive: bool) -> Result<u64>;

    async fn tank_stats_get(
        &self,
        filter: &StatsFilter,
        archive: bool,
    ) -> Result<BoxStream<'_, Result<TankStat>>>;

    /// Inserts a batch; with `force`, rows replace existing rows sharing the
    /// identity key instead of being skipped.
    async fn tank_stats_insert(&self, stats: &[TankStat], force: bool) -> Result<InsertOutcome>;

    async fn tank_stat_update(&self, stat: &TankStat, fields: &[StatsField]) -> Result<bool>;

    /// Distinct tank IDs present in the (archive) table.
    async fn tank_stats_unique_tank_ids(&self, archive: bool) -> Result<Vec<TankId>>;

    /// Per identity key in the partition and window: all row IDs except the
    /// newest one.
    async fn tank_stats_duplicates(
        &self,
        partition: &Partition,
        window: Option<(i64, i64)>,
        archive: bool,
    ) -> Result<BoxStream<'_, Result<Vec<String>>>>;

    /// Bounded delete: `id ∈ ids` and the row timestamp within the window.
    /// Returns the number of deleted rows.
    async fn tank_stats_delete(
        &self,
        ids: &[String],
        window: Option<(i64, i64)>,
        archive: bool,
    ) -> Result<u64>;

    /// How many of the given row IDs exist in the (archive) table.
    async fn tank_stats_count_by_ids(&self, ids: &[String], archive: bool) -> Result<u64>;

    /// Merges the newest archived row per account in the partition into the
    /// latest table, keeping existing rows. Returns the archived row count of
    /// the partition, re-queried after the merge.
    async fn tank_stats_snapshot_partition(&self, partition: &Partition) -> Result<u64>;

    // Player achievements.

    async fn player_achievements_count(&self, filter: &StatsFilter, archive: bool) -> Result<u64>;

    async fn player_achievements_get(
        &self,
        filter: &StatsFilter,
        archive: bool,
    ) -> Result<BoxStream<'_, Result<PlayerAchievements>>>;

    async fn player_achievements_insert(
        &self,
        achievements: &[PlayerAchievements],
        force: bool,
    ) -> Result<InsertOutcome>;

    async fn player_achievements_update(
        &self,
        achievements: &PlayerAchievements,
        fields: &[StatsField],
    ) -> Result<bool>;

    async fn player_achievements_duplicates(
        &self,
        partition: &Partition,
        window: Option<(i64, i64)>,
        archive: bool,
    ) -> Result<BoxStream<'_, Result<Vec<String>>>>;

    async fn player_achievements_delete(
        &self,
        ids: &[String],
        window: Option<(i64, i64)>,
        archive: bool,
    ) -> Result<u64>;

    async fn player_achievements_count_by_ids(&self, ids: &[String], archive: bool)
        -> Result<u64>;

    async fn player_achievements_snapshot_partition(&self, partition: &Partition) -> Result<u64>;

    // Replays.

    async fn replay_get(&self, replay_id: &str) -> Result<Option<Replay>>;

    /// Returns `false` when the replay was already stored.
    async fn replay_insert(&self, replay: &Replay) -> Result<bool>;

    async fn replays_insert(&self, replays: &[Replay]) -> Result<InsertOutcome>;

    async fn replays_get(&self, sample: f64) -> Result<BoxStream<'_, Result<Replay>>>;

    // Releases.

    async fn release_get(&self, release: &str) -> Result<Option<Release>>;

    /// All releases, ordered by launch time.
    async fn releases_get(&self, since: Option<i64>) -> Result<Vec<Release>>;

    async fn releases_insert(&self, releases: &[Release], force: bool) -> Result<InsertOutcome>;

    // Tankopedia.

    async fn tankopedia_get(&self) -> Result<Vec<Vehicle>>;

    async fn tankopedia_count(&self) -> Result<u64>;

    async fn tankopedia_insert(&self, vehicles: &[Vehicle]) -> Result<InsertOutcome>;

    // Stats-to-delete staging.

    async fn stats_to_delete_insert(&self, entries: &[StatsToDelete]) -> Result<usize>;

    async fn stats_to_delete_count(&self, kind: &str, release: Option<&str>) -> Result<u64>;

    async fn stats_to_delete_get(
        &self,
        kind: &str,
        release: Option<&str>,
        sample: f64,
    ) -> Result<BoxStream<'_, Result<StatsToDelete>>>;

    async fn stats_to_delete_remove(&self, kind: &str, ids: &[String]) -> Result<u64>;

    async fn stats_to_delete_reset(&self, kind: &str) -> Result<u64>;

    // Logs.

    async fn update_log_append(&self, entry: &UpdateLogEntry) -> Result;

    async fn error_log_append(&self, entry: &ErrorLogEntry) -> Result;

    async fn error_log_clear(&self, account_id: AccountId, kind: StatsKind) -> Result;

    // Import helpers.

    /// Raw untyped rows for bulk imports and cross-backend copies.
    async fn objs_export(
        &self,
        table: Table,
        sample: f64,
    ) -> Result<BoxStream<'_, Result<serde_json::Value>>>;
}

/// Opens the configured backend. Only the MongoDB reference driver ships;
/// the other drivers are rejected here with a fatal configuration error.
pub async fn open(driver: Driver, uri: &str) -> Result<Arc<dyn Backend>> {
    match driver {
        Driver::Mongodb => Ok(Arc::new(mongodb::MongoDb::open(uri).await?)),
        Driver::Postgresql | Driver::Files => {
            bail!("the `{driver:?}` driver is not implemented, use `mongodb`")
        }
    }
}

/// Opens a second backend to copy rows from during imports.
pub async fn open_import(driver: Driver, uri: &str) -> Result<Arc<dyn Backend>> {
    open(driver, uri).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distributed_shard_is_parsed_and_validated() {
        assert_eq!(
            "1:4".parse::<Distributed>().unwrap(),
            Distributed { index: 1, modulus: 4 }
        );
        assert!("4:4".parse::<Distributed>().is_err());
        assert!("1".parse::<Distributed>().is_err());
        assert!("1:0".parse::<Distributed>().is_err());
    }
}
