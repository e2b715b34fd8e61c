//! A naive in-memory backend for pipeline tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use futures::stream::BoxStream;
use futures::StreamExt;
use itertools::Itertools;

use crate::database::{
    AccountField, AccountFilter, Backend, InsertOutcome, StatsField, StatsFilter, Table,
};
use crate::models::{
    Account, AccountId, ErrorLogEntry, Partition, PlayerAchievements, Release, Replay, StatsKind,
    StatsToDelete, TankId, TankStat, UpdateLogEntry, Vehicle,
};
use crate::prelude::*;

#[derive(Default)]
pub struct MemoryBackend {
    pub state: Mutex<State>,
}

#[derive(Default)]
pub struct State {
    pub accounts: BTreeMap<AccountId, Account>,
    pub tank_stats: BTreeMap<String, TankStat>,
    pub tank_stats_archive: BTreeMap<String, TankStat>,
    pub player_achievements: BTreeMap<String, PlayerAchievements>,
    pub player_achievements_archive: BTreeMap<String, PlayerAchievements>,
    pub replays: BTreeMap<String, Replay>,
    pub releases: Vec<Release>,
    pub tankopedia: BTreeMap<TankId, Vehicle>,
    pub stats_to_delete: Vec<StatsToDelete>,
    pub update_log: Vec<UpdateLogEntry>,
    pub error_log: Vec<ErrorLogEntry>,
}

impl MemoryBackend {
    pub fn with_releases(releases: Vec<Release>) -> Self {
        let this = Self::default();
        this.state.lock().unwrap().releases = releases;
        this
    }

    fn tank_stats_table(state: &mut State, archive: bool) -> &mut BTreeMap<String, TankStat> {
        if archive {
            &mut state.tank_stats_archive
        } else {
            &mut state.tank_stats
        }
    }

    fn achievements_table(
        state: &mut State,
        archive: bool,
    ) -> &mut BTreeMap<String, PlayerAchievements> {
        if archive {
            &mut state.player_achievements_archive
        } else {
            &mut state.player_achievements
        }
    }
}

fn in_partition(partition: &Partition, account_id: AccountId, tank_id: Option<TankId>) -> bool {
    let (start, end) = partition.account_ids;
    if !(start..end).contains(&account_id) {
        return false;
    }
    match (partition.tank_id, tank_id) {
        (Some(wanted), Some(actual)) => wanted == actual,
        (Some(_), None) => false,
        (None, _) => true,
    }
}

fn in_window(window: Option<(i64, i64)>, timestamp: i64) -> bool {
    match window {
        Some((start, end)) => start < timestamp && timestamp <= end,
        None => true,
    }
}

fn sample_vec<T>(mut items: Vec<T>, sample: f64) -> Vec<T> {
    if sample >= 1.0 {
        items.truncate(sample as usize);
    }
    items
}

fn stream_of<T: Send + 'static>(items: Vec<T>) -> BoxStream<'static, Result<T>> {
    futures::stream::iter(items.into_iter().map(Ok)).boxed()
}

/// Groups the rows by key, keeps them newest-first and returns all but the
/// newest ID per key.
fn older_ids_per_key<K: Ord, I: IntoIterator<Item = (K, i64, String)>>(rows: I) -> Vec<Vec<String>> {
    let mut groups: BTreeMap<K, Vec<(i64, String)>> = BTreeMap::new();
    for (key, timestamp, id) in rows {
        groups.entry(key).or_default().push((timestamp, id));
    }
    groups
        .into_values()
        .filter(|group| group.len() > 1)
        .map(|group| {
            group
                .into_iter()
                .sorted_by_key(|(timestamp, _)| -timestamp)
                .skip(1)
                .map(|(_, id)| id)
                .collect()
        })
        .collect()
}

#[async_trait]
impl Backend for MemoryBackend {
    fn driver(&self) -> &'static str {
        "memory"
    }

    fn table_uri(&self, table: Table) -> String {
        format!("memory:{table:?}")
    }

    async fn setup_indexes(&self) -> Result {
        Ok(())
    }

    async fn accounts_count(&self, _kind: Option<StatsKind>, filter: &AccountFilter) -> Result<u64> {
        Ok(self.state.lock().unwrap().accounts.len().min(if filter.sample >= 1.0 {
            filter.sample as usize
        } else {
            usize::MAX
        }) as u64)
    }

    async fn accounts_get(
        &self,
        _kind: Option<StatsKind>,
        filter: &AccountFilter,
    ) -> Result<BoxStream<'_, Result<Account>>> {
        let accounts: Vec<Account> = {
            let state = self.state.lock().unwrap();
            state
                .accounts
                .values()
                .filter(|account| match filter.distributed {
                    Some(distributed) => {
                        account.id as u64 % distributed.modulus == distributed.index
                    }
                    None => true,
                })
                .cloned()
                .collect()
        };
        Ok(stream_of(sample_vec(accounts, filter.sample)))
    }

    async fn accounts_insert(&self, accounts: &[Account]) -> Result<InsertOutcome> {
        let mut state = self.state.lock().unwrap();
        let mut outcome = InsertOutcome::default();
        for account in accounts {
            if state.accounts.contains_key(&account.id) {
                outcome.skipped += 1;
            } else {
                state.accounts.insert(account.id, account.clone());
                outcome.inserted += 1;
            }
        }
        Ok(outcome)
    }

    async fn account_get(&self, account_id: AccountId) -> Result<Option<Account>> {
        Ok(self.state.lock().unwrap().accounts.get(&account_id).cloned())
    }

    async fn account_update(&self, account: &Account, fields: &[AccountField]) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state.accounts.get_mut(&account.id) {
            None => Ok(false),
            Some(stored) => {
                for field in fields {
                    match field {
                        AccountField::Region => stored.region = account.region,
                        AccountField::LastBattleTime => {
                            stored.last_battle_time = account.last_battle_time;
                        }
                        AccountField::Disabled => stored.disabled = account.disabled,
                        AccountField::Inactive => stored.inactive = account.inactive,
                        AccountField::StatsUpdated => {
                            stored.stats_updated = account.stats_updated.clone();
                        }
                    }
                }
                Ok(true)
            }
        }
    }

    async fn account_replace(&self, account: &Account, upsert: bool) -> Result {
        let mut state = self.state.lock().unwrap();
        if upsert || state.accounts.contains_key(&account.id) {
            state.accounts.insert(account.id, account.clone());
        }
        Ok(())
    }

    async fn tank_stats_count(&self, filter: &StatsFilter, archive: bool) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        Ok(Self::tank_stats_table(&mut state, archive)
            .values()
            .filter(|stat| filter.release.is_none() || stat.release == filter.release)
            .filter(|stat| match &filter.accounts {
                Some(accounts) => accounts.contains(&stat.account_id),
                None => true,
            })
            .filter(|stat| match &filter.tanks {
                Some(tanks) => tanks.contains(&stat.tank_id),
                None => true,
            })
            .filter(|stat| match filter.since {
                Some(since) => stat.last_battle_time >= since,
                None => true,
            })
            .filter(|stat| match filter.until {
                Some(until) => stat.last_battle_time <= until,
                None => true,
            })
            .count() as u64)
    }

    async fn tank_stats_get(
        &self,
        filter: &StatsFilter,
        archive: bool,
    ) -> Result<BoxStream<'_, Result<TankStat>>> {
        let stats: Vec<TankStat> = {
            let mut state = self.state.lock().unwrap();
            Self::tank_stats_table(&mut state, archive)
                .values()
                .filter(|stat| filter.release.is_none() || stat.release == filter.release)
                .filter(|stat| match &filter.accounts {
                    Some(accounts) => accounts.contains(&stat.account_id),
                    None => true,
                })
                .filter(|stat| match &filter.tanks {
                    Some(tanks) => tanks.contains(&stat.tank_id),
                    None => true,
                })
                .filter(|stat| match filter.since {
                    Some(since) => stat.last_battle_time >= since,
                    None => true,
                })
                .filter(|stat| match filter.until {
                    Some(until) => stat.last_battle_time <= until,
                    None => true,
                })
                .cloned()
                .collect()
        };
        Ok(stream_of(sample_vec(stats, filter.sample)))
    }

    async fn tank_stats_insert(&self, stats: &[TankStat], force: bool) -> Result<InsertOutcome> {
        let mut state = self.state.lock().unwrap();
        let table = Self::tank_stats_table(&mut state, false);
        let mut outcome = InsertOutcome::default();
        for stat in stats {
            let id = stat.object_id();
            if table.contains_key(&id) {
                if force {
                    table.insert(id, stat.clone());
                }
                outcome.skipped += 1;
            } else {
                table.insert(id, stat.clone());
                outcome.inserted += 1;
            }
        }
        Ok(outcome)
    }

    async fn tank_stat_update(&self, stat: &TankStat, _fields: &[StatsField]) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let table = Self::tank_stats_table(&mut state, false);
        match table.get_mut(&stat.object_id()) {
            Some(stored) => {
                stored.release = stat.release.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn tank_stats_unique_tank_ids(&self, archive: bool) -> Result<Vec<TankId>> {
        let mut state = self.state.lock().unwrap();
        Ok(Self::tank_stats_table(&mut state, archive)
            .values()
            .map(|stat| stat.tank_id)
            .unique()
            .sorted()
            .collect())
    }

    async fn tank_stats_duplicates(
        &self,
        partition: &Partition,
        window: Option<(i64, i64)>,
        archive: bool,
    ) -> Result<BoxStream<'_, Result<Vec<String>>>> {
        let mut state = self.state.lock().unwrap();
        let rows = Self::tank_stats_table(&mut state, archive)
            .values()
            .filter(|stat| in_partition(partition, stat.account_id, Some(stat.tank_id)))
            .filter(|stat| in_window(window, stat.last_battle_time))
            .map(|stat| {
                ((stat.account_id, stat.tank_id), stat.last_battle_time, stat.object_id())
            })
            .collect::<Vec<_>>();
        Ok(stream_of(older_ids_per_key(rows)))
    }

    async fn tank_stats_delete(
        &self,
        ids: &[String],
        window: Option<(i64, i64)>,
        archive: bool,
    ) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let table = Self::tank_stats_table(&mut state, archive);
        let mut deleted = 0;
        for id in ids {
            if let Some(stat) = table.get(id) {
                if in_window(window, stat.last_battle_time) {
                    table.remove(id);
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    async fn tank_stats_count_by_ids(&self, ids: &[String], archive: bool) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let table = Self::tank_stats_table(&mut state, archive);
        Ok(ids.iter().filter(|id| table.contains_key(*id)).count() as u64)
    }

    async fn tank_stats_snapshot_partition(&self, partition: &Partition) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let archived: Vec<TankStat> = state
            .tank_stats_archive
            .values()
            .filter(|stat| in_partition(partition, stat.account_id, Some(stat.tank_id)))
            .cloned()
            .collect();
        let newest = archived
            .iter()
            .map(|stat| ((stat.account_id, stat.tank_id), stat))
            .into_group_map()
            .into_values()
            .map(|group| {
                (*group
                    .into_iter()
                    .max_by_key(|stat| stat.last_battle_time)
                    .expect("the group is not empty"))
                .clone()
            })
            .collect::<Vec<TankStat>>();
        for stat in newest {
            state.tank_stats.entry(stat.object_id()).or_insert(stat);
        }
        Ok(archived.len() as u64)
    }

    async fn player_achievements_count(&self, filter: &StatsFilter, archive: bool) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        Ok(Self::achievements_table(&mut state, archive)
            .values()
            .filter(|row| filter.release.is_none() || row.release == filter.release)
            .filter(|row| match &filter.accounts {
                Some(accounts) => accounts.contains(&row.account_id),
                None => true,
            })
            .filter(|row| match filter.since {
                Some(since) => row.updated >= since,
                None => true,
            })
            .filter(|row| match filter.until {
                Some(until) => row.updated <= until,
                None => true,
            })
            .count() as u64)
    }

    async fn player_achievements_get(
        &self,
        filter: &StatsFilter,
        archive: bool,
    ) -> Result<BoxStream<'_, Result<PlayerAchievements>>> {
        let rows: Vec<PlayerAchievements> = {
            let mut state = self.state.lock().unwrap();
            Self::achievements_table(&mut state, archive)
                .values()
                .filter(|row| filter.release.is_none() || row.release == filter.release)
                .cloned()
                .collect()
        };
        Ok(stream_of(sample_vec(rows, filter.sample)))
    }

    async fn player_achievements_insert(
        &self,
        achievements: &[PlayerAchievements],
        force: bool,
    ) -> Result<InsertOutcome> {
        let mut state = self.state.lock().unwrap();
        let table = Self::achievements_table(&mut state, false);
        let mut outcome = InsertOutcome::default();
        for row in achievements {
            let id = row.object_id();
            if table.contains_key(&id) {
                if force {
                    table.insert(id, row.clone());
                }
                outcome.skipped += 1;
            } else {
                table.insert(id, row.clone());
                outcome.inserted += 1;
            }
        }
        Ok(outcome)
    }

    async fn player_achievements_update(
        &self,
        achievements: &PlayerAchievements,
        _fields: &[StatsField],
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let table = Self::achievements_table(&mut state, false);
        match table.get_mut(&achievements.object_id()) {
            Some(stored) => {
                stored.release = achievements.release.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn player_achievements_duplicates(
        &self,
        partition: &Partition,
        window: Option<(i64, i64)>,
        archive: bool,
    ) -> Result<BoxStream<'_, Result<Vec<String>>>> {
        let mut state = self.state.lock().unwrap();
        let rows = Self::achievements_table(&mut state, archive)
            .values()
            .filter(|row| in_partition(partition, row.account_id, None))
            .filter(|row| in_window(window, row.updated))
            .map(|row| (row.account_id, row.updated, row.object_id()))
            .collect::<Vec<_>>();
        Ok(stream_of(older_ids_per_key(rows)))
    }

    async fn player_achievements_delete(
        &self,
        ids: &[String],
        window: Option<(i64, i64)>,
        archive: bool,
    ) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let table = Self::achievements_table(&mut state, archive);
        let mut deleted = 0;
        for id in ids {
            if let Some(row) = table.get(id) {
                if in_window(window, row.updated) {
                    table.remove(id);
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    async fn player_achievements_count_by_ids(
        &self,
        ids: &[String],
        archive: bool,
    ) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let table = Self::achievements_table(&mut state, archive);
        Ok(ids.iter().filter(|id| table.contains_key(*id)).count() as u64)
    }

    async fn player_achievements_snapshot_partition(&self, partition: &Partition) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let archived: Vec<PlayerAchievements> = state
            .player_achievements_archive
            .values()
            .filter(|row| in_partition(partition, row.account_id, None))
            .cloned()
            .collect();
        let newest = archived
            .iter()
            .map(|row| (row.account_id, row))
            .into_group_map()
            .into_values()
            .map(|group| {
                (*group
                    .into_iter()
                    .max_by_key(|row| row.updated)
                    .expect("the group is not empty"))
                .clone()
            })
            .collect::<Vec<PlayerAchievements>>();
        for row in newest {
            state.player_achievements.entry(row.object_id()).or_insert(row);
        }
        Ok(archived.len() as u64)
    }

    async fn replay_get(&self, replay_id: &str) -> Result<Option<Replay>> {
        Ok(self.state.lock().unwrap().replays.get(replay_id).cloned())
    }

    async fn replay_insert(&self, replay: &Replay) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.replays.contains_key(&replay.id) {
            Ok(false)
        } else {
            state.replays.insert(replay.id.clone(), replay.clone());
            Ok(true)
        }
    }

    async fn replays_insert(&self, replays: &[Replay]) -> Result<InsertOutcome> {
        let mut outcome = InsertOutcome::default();
        for replay in replays {
            if self.replay_insert(replay).await? {
                outcome.inserted += 1;
            } else {
                outcome.skipped += 1;
            }
        }
        Ok(outcome)
    }

    async fn replays_get(&self, sample: f64) -> Result<BoxStream<'_, Result<Replay>>> {
        let replays: Vec<Replay> = self.state.lock().unwrap().replays.values().cloned().collect();
        Ok(stream_of(sample_vec(replays, sample)))
    }

    async fn release_get(&self, release: &str) -> Result<Option<Release>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .releases
            .iter()
            .find(|stored| stored.release == release)
            .cloned())
    }

    async fn releases_get(&self, _since: Option<i64>) -> Result<Vec<Release>> {
        let mut releases = self.state.lock().unwrap().releases.clone();
        releases.sort_by_key(|release| release.launch_time);
        Ok(releases)
    }

    async fn releases_insert(&self, releases: &[Release], _force: bool) -> Result<InsertOutcome> {
        let mut state = self.state.lock().unwrap();
        state.releases.extend_from_slice(releases);
        Ok(InsertOutcome {
            inserted: releases.len(),
            skipped: 0,
        })
    }

    async fn tankopedia_get(&self) -> Result<Vec<Vehicle>> {
        Ok(self.state.lock().unwrap().tankopedia.values().cloned().collect())
    }

    async fn tankopedia_count(&self) -> Result<u64> {
        Ok(self.state.lock().unwrap().tankopedia.len() as u64)
    }

    async fn tankopedia_insert(&self, vehicles: &[Vehicle]) -> Result<InsertOutcome> {
        let mut state = self.state.lock().unwrap();
        for vehicle in vehicles {
            state.tankopedia.insert(vehicle.tank_id, vehicle.clone());
        }
        Ok(InsertOutcome {
            inserted: vehicles.len(),
            skipped: 0,
        })
    }

    async fn stats_to_delete_insert(&self, entries: &[StatsToDelete]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.stats_to_delete.extend_from_slice(entries);
        Ok(entries.len())
    }

    async fn stats_to_delete_count(&self, kind: &str, release: Option<&str>) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .stats_to_delete
            .iter()
            .filter(|entry| entry.kind == kind)
            .filter(|entry| release.is_none() || entry.release.as_deref() == release)
            .count() as u64)
    }

    async fn stats_to_delete_get(
        &self,
        kind: &str,
        release: Option<&str>,
        sample: f64,
    ) -> Result<BoxStream<'_, Result<StatsToDelete>>> {
        let entries: Vec<StatsToDelete> = self
            .state
            .lock()
            .unwrap()
            .stats_to_delete
            .iter()
            .filter(|entry| entry.kind == kind)
            .filter(|entry| release.is_none() || entry.release.as_deref() == release)
            .cloned()
            .collect();
        Ok(stream_of(sample_vec(entries, sample)))
    }

    async fn stats_to_delete_remove(&self, kind: &str, ids: &[String]) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let before = state.stats_to_delete.len();
        state
            .stats_to_delete
            .retain(|entry| entry.kind != kind || !ids.contains(&entry.id));
        Ok((before - state.stats_to_delete.len()) as u64)
    }

    async fn stats_to_delete_reset(&self, kind: &str) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let before = state.stats_to_delete.len();
        state.stats_to_delete.retain(|entry| entry.kind != kind);
        Ok((before - state.stats_to_delete.len()) as u64)
    }

    async fn update_log_append(&self, entry: &UpdateLogEntry) -> Result {
        self.state.lock().unwrap().update_log.push(entry.clone());
        Ok(())
    }

    async fn error_log_append(&self, entry: &ErrorLogEntry) -> Result {
        self.state.lock().unwrap().error_log.push(entry.clone());
        Ok(())
    }

    async fn error_log_clear(&self, account_id: AccountId, kind: StatsKind) -> Result {
        self.state
            .lock()
            .unwrap()
            .error_log
            .retain(|entry| entry.account_id != account_id || entry.kind != kind);
        Ok(())
    }

    async fn objs_export(
        &self,
        _table: Table,
        _sample: f64,
    ) -> Result<BoxStream<'_, Result<serde_json::Value>>> {
        Ok(stream_of(Vec::new()))
    }
}
