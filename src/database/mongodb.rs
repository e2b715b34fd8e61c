//! The MongoDB reference driver.

use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use itertools::Itertools;
use mongodb::bson::{doc, from_document, to_document, Bson, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::AggregateOptions;
use mongodb::{Collection, Database};
use tokio::time::sleep;

use self::traits::{Indexes, TypedDocument};
use crate::database::{
    AccountField, AccountFilter, Backend, BackendError, Distributed, InactiveAccounts,
    InsertOutcome, StatsField, StatsFilter, Table,
};
use crate::models::{
    Account, AccountId, ErrorLogEntry, Partition, PlayerAchievements, Release, Replay, StatsKind,
    StatsToDelete, TankId, TankStat, UpdateLogEntry, Vehicle,
};
use crate::prelude::*;

pub mod traits;

const MAX_ATTEMPTS: u32 = 3;
const DUPLICATE_KEY: i32 = 11000;

pub struct MongoDb {
    database: Database,
}

impl MongoDb {
    #[instrument(skip_all, fields(uri = uri))]
    pub async fn open(uri: &str) -> Result<Self> {
        info!("connecting…");
        let client = mongodb::Client::with_uri_str(uri)
            .await
            .context("failed to parse the specified MongoDB URI")?;
        let database = client
            .default_database()
            .ok_or_else(|| anyhow!("the MongoDB database name is not specified"))?;
        info!("connected");
        Ok(Self { database })
    }

    fn tank_stats(&self, archive: bool) -> Collection<Document> {
        self.database
            .collection(table_name(if archive { Table::TankStatsArchive } else { Table::TankStats }))
    }

    fn player_achievements(&self, archive: bool) -> Collection<Document> {
        self.database.collection(table_name(if archive {
            Table::PlayerAchievementsArchive
        } else {
            Table::PlayerAchievements
        }))
    }

    /// Runs the operation, retrying transient failures with a backoff.
    /// The final error is classified into [`BackendError`].
    async fn with_retries<T, M, F>(&self, what: &'static str, mut operation: M) -> Result<T>
    where
        M: FnMut() -> F + Send,
        F: std::future::Future<Output = StdResult<T, mongodb::error::Error>> + Send,
    {
        let mut nr_attempt = 1;
        loop {
            match operation().await {
                Ok(value) => break Ok(value),
                Err(error) if is_transient(&error) && nr_attempt < MAX_ATTEMPTS => {
                    warn!(what, nr_attempt, "{error:#}, retrying…");
                    sleep(StdDuration::from_millis(250 << nr_attempt)).await;
                    nr_attempt += 1;
                }
                Err(error) => {
                    break Err(anyhow::Error::new(classify(error)).context(what));
                }
            }
        }
    }

    /// Streams the matching documents, optionally `$sample`-ing them down.
    async fn stream<T: serde::de::DeserializeOwned + Send + Sync + 'static>(
        &self,
        collection: Collection<Document>,
        match_doc: Document,
        sample: f64,
    ) -> Result<BoxStream<'_, Result<T>>> {
        let pipeline = match self.sample_stage(&collection, &match_doc, sample).await? {
            Some(sample_stage) => vec![doc! { "$match": match_doc }, sample_stage],
            None => vec![doc! { "$match": match_doc }],
        };
        let cursor = collection
            .aggregate(pipeline, aggregate_options())
            .await
            .map_err(classify)?;
        let stream = cursor
            .map_err(|error| anyhow::Error::new(classify(error)))
            .and_then(|document| async move {
                from_document::<T>(document).context("failed to deserialize a document")
            })
            .boxed();
        Ok(stream)
    }

    async fn sample_stage(
        &self,
        collection: &Collection<Document>,
        match_doc: &Document,
        sample: f64,
    ) -> Result<Option<Document>> {
        match self.sample_count(collection, match_doc, sample).await? {
            Some(size) => Ok(Some(doc! { "$sample": { "size": size as i64 } })),
            None => Ok(None),
        }
    }

    /// Resolves the `--sample` convention: a fraction below 1 is converted to
    /// an absolute count of the matching rows.
    async fn sample_count(
        &self,
        collection: &Collection<Document>,
        match_doc: &Document,
        sample: f64,
    ) -> Result<Option<u64>> {
        if sample <= 0.0 {
            Ok(None)
        } else if sample >= 1.0 {
            Ok(Some(sample as u64))
        } else {
            let count = self
                .with_retries("count", || {
                    collection.count_documents(match_doc.clone(), None)
                })
                .await?;
            Ok(Some((count as f64 * sample).ceil() as u64))
        }
    }

    async fn count(
        &self,
        collection: Collection<Document>,
        match_doc: Document,
        sample: f64,
    ) -> Result<u64> {
        let count = self
            .with_retries("count", || {
                collection.count_documents(match_doc.clone(), None)
            })
            .await?;
        match self.sample_count(&collection, &match_doc, sample).await? {
            Some(size) => Ok(count.min(size)),
            None => Ok(count),
        }
    }

    /// Idempotent batch insert: rows whose `_id` already exists are skipped.
    async fn insert_documents(
        &self,
        collection: Collection<Document>,
        documents: Vec<Document>,
    ) -> Result<InsertOutcome> {
        if documents.is_empty() {
            return Ok(InsertOutcome::default());
        }
        let options = mongodb::options::InsertManyOptions::builder()
            .ordered(false)
            .build();
        match collection.insert_many(&documents, options).await {
            Ok(result) => Ok(InsertOutcome {
                inserted: result.inserted_ids.len(),
                skipped: documents.len() - result.inserted_ids.len(),
            }),
            Err(error) => match *error.kind {
                ErrorKind::BulkWrite(ref failure)
                    if failure.write_errors.as_ref().map_or(false, |errors| {
                        !errors.is_empty()
                            && errors.iter().all(|error| error.code == DUPLICATE_KEY)
                    }) =>
                {
                    let skipped = failure.write_errors.iter().flatten().count();
                    Ok(InsertOutcome {
                        inserted: documents.len() - skipped,
                        skipped,
                    })
                }
                _ => Err(anyhow::Error::new(classify(error)).context("failed to insert the batch")),
            },
        }
    }

    /// Force insert: rows replace existing rows with the same `_id`.
    async fn replace_documents(
        &self,
        collection: Collection<Document>,
        documents: Vec<Document>,
    ) -> Result<InsertOutcome> {
        let mut outcome = InsertOutcome::default();
        for document in documents {
            let id = document
                .get("_id")
                .cloned()
                .ok_or_else(|| anyhow!("the document is missing its `_id`"))?;
            let result = self
                .with_retries("replace", || {
                    let options = mongodb::options::ReplaceOptions::builder()
                        .upsert(true)
                        .build();
                    collection.replace_one(doc! { "_id": id.clone() }, &document, options)
                })
                .await?;
            if result.upserted_id.is_some() {
                outcome.inserted += 1;
            } else {
                outcome.skipped += 1;
            }
        }
        Ok(outcome)
    }

    /// The duplicate aggregation: per identity key within the partition and
    /// window, emits all row IDs but the newest one.
    async fn duplicates(
        &self,
        collection: Collection<Document>,
        match_doc: Document,
        timestamp_field: &str,
        group_by: &str,
    ) -> Result<BoxStream<'_, Result<Vec<String>>>> {
        let pipeline = vec![
            doc! { "$match": match_doc },
            doc! { "$sort": { timestamp_field: -1 } },
            doc! { "$group": {
                "_id": group_by,
                "all_ids": { "$push": "$_id" },
                "len": { "$sum": 1 },
            } },
            doc! { "$match": { "len": { "$gt": 1 } } },
            doc! { "$project": { "ids": { "$slice": [ "$all_ids", 1, "$len" ] } } },
        ];
        let cursor = collection
            .aggregate(pipeline, aggregate_options())
            .await
            .map_err(classify)?;
        let stream = cursor
            .map_err(|error| anyhow::Error::new(classify(error)))
            .and_then(|document| async move {
                document
                    .get_array("ids")
                    .context("the aggregation did not emit `ids`")?
                    .iter()
                    .map(|id| match id {
                        Bson::String(id) => Ok(id.clone()),
                        _ => Err(anyhow!("unexpected row ID type: {id}")),
                    })
                    .collect::<Result<Vec<String>>>()
            })
            .boxed();
        Ok(stream)
    }

    /// Merges the newest row per account within the partition from the
    /// archive collection into the latest collection, keeping existing rows.
    /// Returns the archived row count of the partition, re-queried after the
    /// merge: the `$merge` cursor itself yields nothing reliable.
    async fn snapshot_partition(
        &self,
        archive: Collection<Document>,
        into: Table,
        match_doc: Document,
        timestamp_field: &str,
    ) -> Result<u64> {
        let pipeline = vec![
            doc! { "$match": match_doc.clone() },
            doc! { "$sort": { timestamp_field: -1 } },
            doc! { "$group": { "_id": "$account_id", "doc": { "$first": "$$ROOT" } } },
            doc! { "$replaceRoot": { "newRoot": "$doc" } },
            doc! { "$merge": {
                "into": table_name(into),
                "on": "_id",
                "whenMatched": "keepExisting",
                "whenNotMatched": "insert",
            } },
        ];
        let mut cursor = archive
            .aggregate(pipeline, aggregate_options())
            .await
            .map_err(classify)?;
        while let Some(result) = cursor.next().await {
            result.map_err(classify)?;
        }
        self.with_retries("snapshot count", || {
            archive.count_documents(match_doc.clone(), None)
        })
        .await
    }

    async fn delete_window(
        &self,
        collection: Collection<Document>,
        ids: &[String],
        timestamp_field: &str,
        window: Option<(i64, i64)>,
    ) -> Result<u64> {
        let ids = ids.to_vec();
        let query = match window {
            Some((start, end)) => doc! { "$and": [
                { "_id": { "$in": ids } },
                { timestamp_field: { "$gt": start } },
                { timestamp_field: { "$lte": end } },
            ] },
            None => doc! { "_id": { "$in": ids } },
        };
        let result = self
            .with_retries("delete", || collection.delete_many(query.clone(), None))
            .await?;
        Ok(result.deleted_count)
    }

    async fn count_by_ids(&self, collection: Collection<Document>, ids: &[String]) -> Result<u64> {
        let query = doc! { "_id": { "$in": ids.to_vec() } };
        self.with_retries("count by IDs", || collection.count_documents(query.clone(), None))
            .await
    }
}

#[async_trait]
impl Backend for MongoDb {
    fn driver(&self) -> &'static str {
        "mongodb"
    }

    fn table_uri(&self, table: Table) -> String {
        format!("mongodb://{}/{}", self.database.name(), table_name(table))
    }

    #[instrument(skip_all)]
    async fn setup_indexes(&self) -> Result {
        info!("ensuring indexes…");
        Account::ensure_indexes(&self.database).await?;
        Release::ensure_indexes(&self.database).await?;
        StatsToDelete::ensure_indexes(&self.database).await?;
        ErrorLogEntry::ensure_indexes(&self.database).await?;
        for archive in [false, true] {
            let indexes = traits::stats_indexes(
                &[("account_id", 1), ("tank_id", 1), ("last_battle_time", -1)],
                Some(&[("tank_id", 1), ("last_battle_time", -1)]),
            );
            self.tank_stats(archive)
                .create_indexes(indexes, None)
                .await
                .context("failed to create the tank stats indexes")?;
            let indexes = traits::stats_indexes(&[("account_id", 1), ("updated", -1)], None);
            self.player_achievements(archive)
                .create_indexes(indexes, None)
                .await
                .context("failed to create the player achievements indexes")?;
        }
        info!("indexes are in place");
        Ok(())
    }

    async fn accounts_count(
        &self,
        kind: Option<StatsKind>,
        filter: &AccountFilter,
    ) -> Result<u64> {
        let match_doc = account_filter_doc(kind, filter);
        self.count(self.database.collection(Account::NAME), match_doc, filter.sample)
            .await
    }

    async fn accounts_get(
        &self,
        kind: Option<StatsKind>,
        filter: &AccountFilter,
    ) -> Result<BoxStream<'_, Result<Account>>> {
        let match_doc = account_filter_doc(kind, filter);
        self.stream(self.database.collection(Account::NAME), match_doc, filter.sample)
            .await
    }

    async fn accounts_insert(&self, accounts: &[Account]) -> Result<InsertOutcome> {
        let documents = accounts
            .iter()
            .map(|account| to_document(account).context("failed to serialize the account"))
            .collect::<Result<Vec<Document>>>()?;
        self.insert_documents(self.database.collection(Account::NAME), documents)
            .await
    }

    async fn account_get(&self, account_id: AccountId) -> Result<Option<Account>> {
        self.with_retries("get account", || async move {
            Account::collection(&self.database)
                .find_one(doc! { "_id": account_id }, None)
                .await
        })
        .await
    }

    async fn account_update(&self, account: &Account, fields: &[AccountField]) -> Result<bool> {
        let mut set = Document::new();
        for field in fields {
            match field {
                AccountField::Region => {
                    set.insert("region", mongodb::bson::to_bson(&account.region)?);
                }
                AccountField::LastBattleTime => {
                    set.insert("last_battle_time", account.last_battle_time);
                }
                AccountField::Disabled => {
                    set.insert("disabled", account.disabled);
                }
                AccountField::Inactive => {
                    set.insert("inactive", account.inactive);
                }
                AccountField::StatsUpdated => {
                    set.insert("stats_updated", mongodb::bson::to_bson(&account.stats_updated)?);
                }
            }
        }
        let result = self
            .with_retries("update account", || {
                let set = set.clone();
                async move {
                    Account::collection(&self.database)
                        .update_one(doc! { "_id": account.id }, doc! { "$set": set }, None)
                        .await
                }
            })
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn account_replace(&self, account: &Account, upsert: bool) -> Result {
        self.with_retries("replace account", || async move {
            let options = mongodb::options::ReplaceOptions::builder()
                .upsert(upsert)
                .build();
            Account::collection(&self.database)
                .replace_one(doc! { "_id": account.id }, account, options)
                .await
        })
        .await?;
        Ok(())
    }

    async fn tank_stats_count(&self, filter: &StatsFilter, archive: bool) -> Result<u64> {
        let match_doc = stats_filter_doc(filter, "last_battle_time");
        self.count(self.tank_stats(archive), match_doc, filter.sample).await
    }

    async fn tank_stats_get(
        &self,
        filter: &StatsFilter,
        archive: bool,
    ) -> Result<BoxStream<'_, Result<TankStat>>> {
        let match_doc = stats_filter_doc(filter, "last_battle_time");
        self.stream(self.tank_stats(archive), match_doc, filter.sample).await
    }

    async fn tank_stats_insert(&self, stats: &[TankStat], force: bool) -> Result<InsertOutcome> {
        let documents = stats
            .iter()
            .map(|stat| {
                let mut document = to_document(stat)?;
                document.insert("_id", stat.object_id());
                Ok(document)
            })
            .collect::<Result<Vec<Document>>>()?;
        let collection = self.tank_stats(false);
        if force {
            self.replace_documents(collection, documents).await
        } else {
            self.insert_documents(collection, documents).await
        }
    }

    async fn tank_stat_update(&self, stat: &TankStat, fields: &[StatsField]) -> Result<bool> {
        let mut set = Document::new();
        for field in fields {
            match field {
                StatsField::Release => {
                    set.insert("release", stat.release.as_deref());
                }
            }
        }
        let result = self
            .with_retries("update tank stat", || {
                let set = set.clone();
                async move {
                    self.tank_stats(false)
                        .update_one(doc! { "_id": stat.object_id() }, doc! { "$set": set }, None)
                        .await
                }
            })
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn tank_stats_unique_tank_ids(&self, archive: bool) -> Result<Vec<TankId>> {
        let values = self
            .with_retries("distinct tank IDs", || async move {
                self.tank_stats(archive).distinct("tank_id", None, None).await
            })
            .await?;
        let mut tank_ids = values
            .into_iter()
            .map(|value| match value {
                Bson::Int32(tank_id) => Ok(tank_id as TankId),
                Bson::Int64(tank_id) => Ok(tank_id as TankId),
                _ => Err(anyhow!("unexpected tank ID: {value}")),
            })
            .collect::<Result<Vec<TankId>>>()?;
        tank_ids.sort_unstable();
        Ok(tank_ids)
    }

    async fn tank_stats_duplicates(
        &self,
        partition: &Partition,
        window: Option<(i64, i64)>,
        archive: bool,
    ) -> Result<BoxStream<'_, Result<Vec<String>>>> {
        let tank_id = partition
            .tank_id
            .ok_or_else(|| anyhow!("tank stats partitions must specify a tank"))?;
        let mut match_and = vec![
            doc! { "tank_id": tank_id },
            doc! { "account_id": { "$gte": partition.account_ids.0 } },
            doc! { "account_id": { "$lt": partition.account_ids.1 } },
        ];
        push_window(&mut match_and, "last_battle_time", window);
        self.duplicates(
            self.tank_stats(archive),
            doc! { "$and": match_and },
            "last_battle_time",
            "$account_id",
        )
        .await
    }

    async fn tank_stats_delete(
        &self,
        ids: &[String],
        window: Option<(i64, i64)>,
        archive: bool,
    ) -> Result<u64> {
        self.delete_window(self.tank_stats(archive), ids, "last_battle_time", window)
            .await
    }

    async fn tank_stats_count_by_ids(&self, ids: &[String], archive: bool) -> Result<u64> {
        self.count_by_ids(self.tank_stats(archive), ids).await
    }

    async fn tank_stats_snapshot_partition(&self, partition: &Partition) -> Result<u64> {
        let tank_id = partition
            .tank_id
            .ok_or_else(|| anyhow!("tank stats partitions must specify a tank"))?;
        let match_doc = doc! { "$and": [
            { "tank_id": tank_id },
            { "account_id": { "$gte": partition.account_ids.0 } },
            { "account_id": { "$lt": partition.account_ids.1 } },
        ] };
        self.snapshot_partition(
            self.tank_stats(true),
            Table::TankStats,
            match_doc,
            "last_battle_time",
        )
        .await
    }

    async fn player_achievements_count(&self, filter: &StatsFilter, archive: bool) -> Result<u64> {
        let match_doc = stats_filter_doc(filter, "updated");
        self.count(self.player_achievements(archive), match_doc, filter.sample)
            .await
    }

    async fn player_achievements_get(
        &self,
        filter: &StatsFilter,
        archive: bool,
    ) -> Result<BoxStream<'_, Result<PlayerAchievements>>> {
        let match_doc = stats_filter_doc(filter, "updated");
        self.stream(self.player_achievements(archive), match_doc, filter.sample)
            .await
    }

    async fn player_achievements_insert(
        &self,
        achievements: &[PlayerAchievements],
        force: bool,
    ) -> Result<InsertOutcome> {
        let documents = achievements
            .iter()
            .map(|row| {
                let mut document = to_document(row)?;
                document.insert("_id", row.object_id());
                Ok(document)
            })
            .collect::<Result<Vec<Document>>>()?;
        let collection = self.player_achievements(false);
        if force {
            self.replace_documents(collection, documents).await
        } else {
            self.insert_documents(collection, documents).await
        }
    }

    async fn player_achievements_update(
        &self,
        achievements: &PlayerAchievements,
        fields: &[StatsField],
    ) -> Result<bool> {
        let mut set = Document::new();
        for field in fields {
            match field {
                StatsField::Release => {
                    set.insert("release", achievements.release.as_deref());
                }
            }
        }
        let result = self
            .with_retries("update player achievements", || {
                let set = set.clone();
                async move {
                    self.player_achievements(false)
                        .update_one(
                            doc! { "_id": achievements.object_id() },
                            doc! { "$set": set },
                            None,
                        )
                        .await
                }
            })
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn player_achievements_duplicates(
        &self,
        partition: &Partition,
        window: Option<(i64, i64)>,
        archive: bool,
    ) -> Result<BoxStream<'_, Result<Vec<String>>>> {
        let mut match_and = vec![
            doc! { "account_id": { "$gte": partition.account_ids.0 } },
            doc! { "account_id": { "$lt": partition.account_ids.1 } },
        ];
        push_window(&mut match_and, "updated", window);
        self.duplicates(
            self.player_achievements(archive),
            doc! { "$and": match_and },
            "updated",
            "$account_id",
        )
        .await
    }

    async fn player_achievements_delete(
        &self,
        ids: &[String],
        window: Option<(i64, i64)>,
        archive: bool,
    ) -> Result<u64> {
        self.delete_window(self.player_achievements(archive), ids, "updated", window)
            .await
    }

    async fn player_achievements_count_by_ids(
        &self,
        ids: &[String],
        archive: bool,
    ) -> Result<u64> {
        self.count_by_ids(self.player_achievements(archive), ids).await
    }

    async fn player_achievements_snapshot_partition(&self, partition: &Partition) -> Result<u64> {
        let match_doc = doc! { "$and": [
            { "account_id": { "$gte": partition.account_ids.0 } },
            { "account_id": { "$lt": partition.account_ids.1 } },
        ] };
        self.snapshot_partition(
            self.player_achievements(true),
            Table::PlayerAchievements,
            match_doc,
            "updated",
        )
        .await
    }

    async fn replay_get(&self, replay_id: &str) -> Result<Option<Replay>> {
        self.with_retries("get replay", || async move {
            Replay::collection(&self.database)
                .find_one(doc! { "_id": replay_id }, None)
                .await
        })
        .await
    }

    async fn replay_insert(&self, replay: &Replay) -> Result<bool> {
        match Replay::collection(&self.database).insert_one(replay, None).await {
            Ok(_) => Ok(true),
            Err(error) if is_duplicate_key(&error) => Ok(false),
            Err(error) => {
                Err(anyhow::Error::new(classify(error)).context("failed to insert the replay"))
            }
        }
    }

    async fn replays_insert(&self, replays: &[Replay]) -> Result<InsertOutcome> {
        let documents = replays
            .iter()
            .map(|replay| to_document(replay).context("failed to serialize the replay"))
            .collect::<Result<Vec<Document>>>()?;
        self.insert_documents(self.database.collection(Replay::NAME), documents)
            .await
    }

    async fn replays_get(&self, sample: f64) -> Result<BoxStream<'_, Result<Replay>>> {
        self.stream(self.database.collection(Replay::NAME), Document::new(), sample)
            .await
    }

    async fn release_get(&self, release: &str) -> Result<Option<Release>> {
        self.with_retries("get release", || async move {
            Release::collection(&self.database)
                .find_one(doc! { "_id": release }, None)
                .await
        })
        .await
    }

    async fn releases_get(&self, since: Option<i64>) -> Result<Vec<Release>> {
        let filter = match since {
            Some(since) => doc! { "launch_time": { "$gte": since } },
            None => Document::new(),
        };
        let options = mongodb::options::FindOptions::builder()
            .sort(doc! { "launch_time": 1 })
            .build();
        self.with_retries("get releases", || {
            let filter = filter.clone();
            let options = options.clone();
            async move {
                Release::collection(&self.database)
                    .find(filter, options)
                    .await?
                    .try_collect::<Vec<Release>>()
                    .await
            }
        })
        .await
    }

    async fn releases_insert(&self, releases: &[Release], force: bool) -> Result<InsertOutcome> {
        let documents = releases
            .iter()
            .map(|release| to_document(release).context("failed to serialize the release"))
            .collect::<Result<Vec<Document>>>()?;
        let collection = self.database.collection(Release::NAME);
        if force {
            self.replace_documents(collection, documents).await
        } else {
            self.insert_documents(collection, documents).await
        }
    }

    async fn tankopedia_get(&self) -> Result<Vec<Vehicle>> {
        self.with_retries("get tankopedia", || async {
            Vehicle::collection(&self.database)
                .find(None, None)
                .await?
                .try_collect::<Vec<Vehicle>>()
                .await
        })
        .await
    }

    async fn tankopedia_count(&self) -> Result<u64> {
        self.with_retries("count tankopedia", || async {
            Vehicle::collection(&self.database).count_documents(None, None).await
        })
        .await
    }

    async fn tankopedia_insert(&self, vehicles: &[Vehicle]) -> Result<InsertOutcome> {
        let documents = vehicles
            .iter()
            .map(|vehicle| {
                let mut document = to_document(vehicle)?;
                document.insert("_id", vehicle.tank_id);
                Ok(document)
            })
            .collect::<Result<Vec<Document>>>()?;
        self.replace_documents(self.database.collection(Vehicle::NAME), documents)
            .await
    }

    async fn stats_to_delete_insert(&self, entries: &[StatsToDelete]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        self.with_retries("stage deletions", || async {
            StatsToDelete::collection(&self.database).insert_many(entries, None).await
        })
        .await
        .map(|result| result.inserted_ids.len())
    }

    async fn stats_to_delete_count(&self, kind: &str, release: Option<&str>) -> Result<u64> {
        let match_doc = stats_to_delete_doc(kind, release);
        self.with_retries("count staged deletions", || {
            let match_doc = match_doc.clone();
            async move {
                StatsToDelete::collection(&self.database)
                    .count_documents(match_doc, None)
                    .await
            }
        })
        .await
    }

    async fn stats_to_delete_get(
        &self,
        kind: &str,
        release: Option<&str>,
        sample: f64,
    ) -> Result<BoxStream<'_, Result<StatsToDelete>>> {
        let match_doc = stats_to_delete_doc(kind, release);
        self.stream(
            self.database.collection(StatsToDelete::NAME),
            match_doc,
            sample,
        )
        .await
    }

    async fn stats_to_delete_remove(&self, kind: &str, ids: &[String]) -> Result<u64> {
        let query = doc! { "type": kind, "id": { "$in": ids.to_vec() } };
        let result = self
            .with_retries("unstage deletions", || {
                let query = query.clone();
                async move {
                    StatsToDelete::collection(&self.database).delete_many(query, None).await
                }
            })
            .await?;
        Ok(result.deleted_count)
    }

    async fn stats_to_delete_reset(&self, kind: &str) -> Result<u64> {
        let result = self
            .with_retries("reset staged deletions", || async {
                StatsToDelete::collection(&self.database)
                    .delete_many(doc! { "type": kind }, None)
                    .await
            })
            .await?;
        Ok(result.deleted_count)
    }

    async fn update_log_append(&self, entry: &UpdateLogEntry) -> Result {
        self.with_retries("append to the update log", || async {
            UpdateLogEntry::collection(&self.database).insert_one(entry, None).await
        })
        .await?;
        Ok(())
    }

    async fn error_log_append(&self, entry: &ErrorLogEntry) -> Result {
        self.with_retries("append to the error log", || async {
            ErrorLogEntry::collection(&self.database).insert_one(entry, None).await
        })
        .await?;
        Ok(())
    }

    async fn error_log_clear(&self, account_id: AccountId, kind: StatsKind) -> Result {
        self.with_retries("clear the error log", || async move {
            ErrorLogEntry::collection(&self.database)
                .delete_many(doc! { "account_id": account_id, "type": kind.as_str() }, None)
                .await
        })
        .await?;
        Ok(())
    }

    async fn objs_export(
        &self,
        table: Table,
        sample: f64,
    ) -> Result<BoxStream<'_, Result<serde_json::Value>>> {
        let collection = self.database.collection::<Document>(table_name(table));
        let pipeline = match self.sample_stage(&collection, &Document::new(), sample).await? {
            Some(sample_stage) => vec![sample_stage],
            None => vec![],
        };
        let cursor = collection
            .aggregate(pipeline, aggregate_options())
            .await
            .map_err(classify)?;
        let stream = cursor
            .map_err(|error| anyhow::Error::new(classify(error)))
            .map_ok(|document| Bson::Document(document).into_relaxed_extjson())
            .boxed();
        Ok(stream)
    }
}

pub const fn table_name(table: Table) -> &'static str {
    match table {
        Table::Accounts => "accounts",
        Table::TankStats => "tank_stats",
        Table::TankStatsArchive => "tank_stats_archive",
        Table::PlayerAchievements => "player_achievements",
        Table::PlayerAchievementsArchive => "player_achievements_archive",
        Table::Replays => "replays",
        Table::Releases => "releases",
        Table::Tankopedia => "tankopedia",
        Table::StatsToDelete => "stats_to_delete",
        Table::UpdateLog => "update_log",
        Table::ErrorLog => "error_log",
    }
}

fn aggregate_options() -> AggregateOptions {
    AggregateOptions::builder().allow_disk_use(true).build()
}

fn is_transient(error: &mongodb::error::Error) -> bool {
    match &*error.kind {
        ErrorKind::Io(_)
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::ServerSelection { .. } => true,
        ErrorKind::Write(WriteFailure::WriteConcernError(_)) => true,
        _ => false,
    }
}

fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    match &*error.kind {
        ErrorKind::Write(WriteFailure::WriteError(error)) => error.code == DUPLICATE_KEY,
        _ => false,
    }
}

fn classify(error: mongodb::error::Error) -> BackendError {
    if is_transient(&error) {
        BackendError::Transient(Box::new(error))
    } else {
        BackendError::Fatal(Box::new(error))
    }
}

fn account_filter_doc(kind: Option<StatsKind>, filter: &AccountFilter) -> Document {
    let mut and = vec![doc! { "_id": { "$lt": crate::models::Region::ACCOUNT_ID_MAX } }];
    if !filter.regions.is_empty() {
        let regions = filter.regions.iter().map(|region| region.to_str()).collect_vec();
        and.push(doc! { "region": { "$in": regions } });
    }
    if filter.disabled {
        and.push(doc! { "disabled": true });
    } else {
        and.push(doc! { "disabled": { "$ne": true } });
    }
    match filter.inactive {
        InactiveAccounts::No => and.push(doc! { "inactive": { "$ne": true } }),
        InactiveAccounts::Yes => and.push(doc! { "inactive": true }),
        InactiveAccounts::Both => {}
        // Inactive accounts are only re-checked once their cache expires.
        InactiveAccounts::Auto => {
            if filter.cache_valid_secs.is_none() {
                and.push(doc! { "inactive": { "$ne": true } });
            }
        }
    }
    if let (Some(kind), Some(cache_valid_secs)) = (kind, filter.cache_valid_secs) {
        let key = format!("stats_updated.{}", kind.as_str());
        let threshold = now() - cache_valid_secs;
        let mut missing = Document::new();
        missing.insert(&key, doc! { "$exists": false });
        let mut expired = Document::new();
        expired.insert(&key, doc! { "$lt": threshold });
        and.push(doc! { "$or": [ missing, expired ] });
    }
    if let Some(Distributed { index, modulus }) = filter.distributed {
        and.push(doc! { "_id": { "$mod": [ modulus as i64, index as i64 ] } });
    }
    doc! { "$and": and }
}

fn stats_filter_doc(filter: &StatsFilter, timestamp_field: &str) -> Document {
    let mut and = vec![];
    if let Some(release) = &filter.release {
        and.push(doc! { "release": release.as_str() });
    }
    if !filter.regions.is_empty() {
        let regions = filter.regions.iter().map(|region| region.to_str()).collect_vec();
        and.push(doc! { "region": { "$in": regions } });
    }
    if let Some(accounts) = &filter.accounts {
        and.push(doc! { "account_id": { "$in": accounts.clone() } });
    }
    if let Some(tanks) = &filter.tanks {
        let tanks: Vec<i64> = tanks.iter().map(|tank_id| *tank_id as i64).collect();
        and.push(doc! { "tank_id": { "$in": tanks } });
    }
    if let Some(since) = filter.since {
        and.push(doc! { timestamp_field: { "$gte": since } });
    }
    if let Some(until) = filter.until {
        and.push(doc! { timestamp_field: { "$lte": until } });
    }
    if and.is_empty() {
        Document::new()
    } else {
        doc! { "$and": and }
    }
}

fn push_window(match_and: &mut Vec<Document>, timestamp_field: &str, window: Option<(i64, i64)>) {
    if let Some((start, end)) = window {
        match_and.push(doc! { timestamp_field: { "$gt": start } });
        match_and.push(doc! { timestamp_field: { "$lte": end } });
    }
}

fn stats_to_delete_doc(kind: &str, release: Option<&str>) -> Document {
    match release {
        Some(release) => doc! { "type": kind, "release": release },
        None => doc! { "type": kind },
    }
}
