use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::AccountId;

/// A battle replay as listed by the replay service. Replays are the cheapest
/// source of previously unseen account IDs and are kept for later analysis.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Replay {
    #[serde(rename = "_id")]
    pub id: String,

    pub data: ReplayData,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ReplayData {
    #[serde(default)]
    pub summary: ReplaySummary,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ReplaySummary {
    #[serde(default)]
    pub allies: Vec<AccountId>,

    #[serde(default)]
    pub enemies: Vec<AccountId>,

    #[serde(default)]
    pub battle_start_timestamp: f64,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Replay {
    /// All participating account IDs, both teams.
    pub fn player_ids(&self) -> Vec<AccountId> {
        let summary = &self.data.summary;
        let mut players = Vec::with_capacity(summary.allies.len() + summary.enemies.len());
        players.extend_from_slice(&summary.allies);
        players.extend_from_slice(&summary.enemies);
        players
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::*;

    #[test]
    fn players_come_from_both_teams() -> Result {
        let replay = serde_json::from_str::<Replay>(
            // language=json
            r#"{"_id": "0b3ba419c1d38f3d4b4b72ac26e47112", "data": {"summary": {"allies": [1, 2], "enemies": [3], "battle_start_timestamp": 1666104416.0, "title": "win"}}}"#,
        )?;
        assert_eq!(replay.player_ids(), vec![1, 2, 3]);
        Ok(())
    }
}
