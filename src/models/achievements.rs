use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{AccountId, Region};
use crate::prelude::*;

/// Achievement series maxima of a single account at a single point in time.
/// The identity key is `(account_id, updated)`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PlayerAchievements {
    pub account_id: AccountId,

    /// When the snapshot was taken, epoch seconds; part of the identity key.
    pub updated: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,

    #[serde(default)]
    pub max_series: BTreeMap<String, i64>,
}

impl PlayerAchievements {
    pub fn new(account_id: AccountId, max_series: BTreeMap<String, i64>) -> Self {
        Self {
            account_id,
            updated: now(),
            release: None,
            region: Region::from_account_id(account_id),
            max_series,
        }
    }

    pub fn object_id(&self) -> String {
        format!("{:010}:{}", self.account_id, self.updated)
    }

    /// Recovers the identity key from a stored document ID.
    pub fn parse_object_id(id: &str) -> Result<(AccountId, i64)> {
        let (account_id, updated) = id
            .split_once(':')
            .ok_or_else(|| anyhow!("`{id}` is not an achievements ID"))?;
        Ok((account_id.parse()?, updated.parse()?))
    }
}
