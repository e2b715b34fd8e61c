use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::helpers::time::from_days;
use crate::models::{AccountId, Region, StatsKind};
use crate::prelude::*;

/// An account is considered inactive once its last battle is older than this.
pub const INACTIVITY_WINDOW: StdDuration = from_days(90);

/// A player account known to the engine.
///
/// Created by the crawler or by bulk import, mutated by the fetcher writer,
/// never deleted by the engine itself.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Account {
    #[serde(rename = "_id")]
    pub id: AccountId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,

    /// When the account was first discovered, epoch seconds.
    #[serde(default)]
    pub added: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_battle_time: Option<i64>,

    /// The upstream API no longer returns stats for this account.
    #[serde(default)]
    pub disabled: bool,

    /// No new stats have been observed for longer than [`INACTIVITY_WINDOW`].
    #[serde(default)]
    pub inactive: bool,

    /// Per-kind timestamp of the last successful stats refresh.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stats_updated: BTreeMap<StatsKind, i64>,
}

impl Account {
    pub fn new(id: AccountId) -> Self {
        Self {
            id,
            region: Region::from_account_id(id),
            added: now(),
            last_battle_time: None,
            disabled: false,
            inactive: false,
            stats_updated: BTreeMap::new(),
        }
    }

    pub fn mark_stats_updated(&mut self, kind: StatsKind) {
        self.stats_updated.insert(kind, now());
    }

    /// Whether the account has gone quiet: its last battle – if any is known –
    /// is older than the inactivity window.
    pub fn is_inactive(&self) -> bool {
        match self.last_battle_time {
            Some(last_battle_time) => {
                now() - last_battle_time > INACTIVITY_WINDOW.as_secs() as i64
            }
            None => false,
        }
    }
}
