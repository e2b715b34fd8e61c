use serde::{Deserialize, Serialize};

use crate::models::{AccountId, StatsKind, TankId};
use crate::prelude::*;

/// A staged deletion: the analyzer nominates a stat row, the pruner deletes it
/// and removes the staging entry afterwards.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StatsToDelete {
    /// [`StatsKind::delete_kind`] of the nominated row.
    #[serde(rename = "type")]
    pub kind: String,

    /// Document ID of the nominated row.
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
}

/// One row per successfully completed curation phase. A failed phase writes
/// nothing, so the log doubles as the cross-run protocol between phases.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UpdateLogEntry {
    pub action: String,

    #[serde(rename = "type")]
    pub kind: StatsKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,

    pub time: i64,
}

impl UpdateLogEntry {
    pub fn new(action: &str, kind: StatsKind, release: Option<&str>) -> Self {
        Self {
            action: action.to_string(),
            kind,
            release: release.map(str::to_string),
            time: now(),
        }
    }
}

/// A fetch-side failure for one account, kept for retry selection.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ErrorLogEntry {
    pub account_id: AccountId,

    #[serde(rename = "type")]
    pub kind: StatsKind,

    pub time: i64,
}

impl ErrorLogEntry {
    pub fn new(account_id: AccountId, kind: StatsKind) -> Self {
        Self {
            account_id,
            kind,
            time: now(),
        }
    }
}

/// A curation work partition: an account ID range, optionally narrowed
/// to a single tank.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    pub account_ids: (AccountId, AccountId),
    pub tank_id: Option<TankId>,
}

impl Partition {
    pub const ACCOUNT_ID_STEP: AccountId = 50_000_000;

    /// Account ID ranges covering the whole ID space.
    pub fn account_ranges(step: AccountId) -> Vec<Partition> {
        let mut partitions = Vec::new();
        let mut start = 0;
        while start < crate::models::Region::ACCOUNT_ID_MAX {
            partitions.push(Partition {
                account_ids: (start, start + step),
                tank_id: None,
            });
            start += step;
        }
        partitions
    }

    /// The cross product of account ID ranges and the given tanks.
    pub fn account_tank_ranges(step: AccountId, tank_ids: &[TankId]) -> Vec<Partition> {
        Self::account_ranges(step)
            .into_iter()
            .flat_map(|range| {
                tank_ids.iter().map(move |tank_id| Partition {
                    tank_id: Some(*tank_id),
                    ..range
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_ranges_cover_the_id_space() {
        let partitions = Partition::account_ranges(1_000_000_000);
        assert_eq!(partitions.len(), 4);
        assert_eq!(partitions[0].account_ids, (0, 1_000_000_000));
        assert!(partitions.last().unwrap().account_ids.1 >= crate::models::Region::ACCOUNT_ID_MAX);
    }

    #[test]
    fn account_tank_ranges_take_the_cross_product() {
        let partitions = Partition::account_tank_ranges(2_000_000_000, &[1, 2]);
        assert_eq!(partitions.len(), 4);
        assert!(partitions.iter().all(|partition| partition.tank_id.is_some()));
    }
}
