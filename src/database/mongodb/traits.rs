use mongodb::bson::doc;
use mongodb::options::IndexOptions;
use mongodb::{Collection, Database, IndexModel};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::models;
use crate::prelude::*;

/// A model with a collection of its own.
pub trait TypedDocument: 'static + Sized + Send + Sync + Serialize + DeserializeOwned + Unpin {
    const NAME: &'static str;

    #[inline]
    fn collection(in_: &Database) -> Collection<Self> {
        in_.collection(Self::NAME)
    }
}

#[async_trait]
pub trait Indexes: TypedDocument {
    type I: IntoIterator<Item = IndexModel> + Send;

    fn indexes() -> Self::I;

    #[instrument(skip_all, fields(collection = Self::NAME))]
    async fn ensure_indexes(on: &Database) -> Result {
        let indexes = Vec::from_iter(Self::indexes());
        if indexes.is_empty() {
            return Ok(());
        }
        Self::collection(on)
            .create_indexes(indexes, None)
            .await
            .with_context(|| format!("failed to create the indexes in `{}`", Self::NAME))?;
        Ok(())
    }
}

impl TypedDocument for models::Account {
    const NAME: &'static str = "accounts";
}

#[async_trait]
impl Indexes for models::Account {
    type I = [IndexModel; 1];

    fn indexes() -> Self::I {
        [IndexModel::builder()
            .keys(doc! { "region": 1, "inactive": 1, "disabled": 1 })
            .build()]
    }
}

impl TypedDocument for models::Replay {
    const NAME: &'static str = "replays";
}

impl TypedDocument for models::Release {
    const NAME: &'static str = "releases";
}

#[async_trait]
impl Indexes for models::Release {
    type I = [IndexModel; 1];

    fn indexes() -> Self::I {
        [IndexModel::builder().keys(doc! { "launch_time": 1 }).build()]
    }
}

impl TypedDocument for models::Vehicle {
    const NAME: &'static str = "tankopedia";
}

impl TypedDocument for models::StatsToDelete {
    const NAME: &'static str = "stats_to_delete";
}

#[async_trait]
impl Indexes for models::StatsToDelete {
    type I = [IndexModel; 1];

    fn indexes() -> Self::I {
        [IndexModel::builder().keys(doc! { "type": 1, "id": 1 }).build()]
    }
}

impl TypedDocument for models::UpdateLogEntry {
    const NAME: &'static str = "update_log";
}

impl TypedDocument for models::ErrorLogEntry {
    const NAME: &'static str = "error_log";
}

#[async_trait]
impl Indexes for models::ErrorLogEntry {
    type I = [IndexModel; 1];

    fn indexes() -> Self::I {
        [IndexModel::builder()
            .keys(doc! { "account_id": 1, "time": -1, "type": 1 })
            .build()]
    }
}

/// The identity-key indexes of a stats collection and its archive twin.
pub fn stats_indexes(
    key_fields: &[(&str, i32)],
    secondary: Option<&[(&str, i32)]>,
) -> Vec<IndexModel> {
    fn keys_document(fields: &[(&str, i32)]) -> mongodb::bson::Document {
        let mut keys = mongodb::bson::Document::new();
        for (field, direction) in fields {
            keys.insert(*field, *direction);
        }
        keys
    }

    let mut indexes = vec![IndexModel::builder()
        .keys(keys_document(key_fields))
        .options(IndexOptions::builder().unique(true).build())
        .build()];
    if let Some(secondary) = secondary {
        indexes.push(IndexModel::builder().keys(keys_document(secondary)).build());
    }
    indexes
}
