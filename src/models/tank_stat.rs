use serde::{Deserialize, Serialize};

use crate::models::{AccountId, Region, TankId};

/// Per-tank statistics of a single account at a single point in time.
/// The identity key is `(account_id, tank_id, last_battle_time)`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TankStat {
    pub account_id: AccountId,
    pub tank_id: TankId,

    /// Epoch seconds; part of the identity key.
    pub last_battle_time: i64,

    #[serde(default)]
    pub battle_life_time: i64,

    /// The release whose window contains `last_battle_time`,
    /// filled in by the release mapper.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,

    pub all: BasicStats,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BasicStats {
    pub battles: i32,
    pub wins: i32,
    pub survived_battles: i32,
    pub win_and_survived: i32,
    pub damage_dealt: i32,
    pub damage_received: i32,
    pub shots: i32,
    pub hits: i32,
    pub frags: i32,
    pub xp: i32,
}

impl TankStat {
    /// The stored document ID. Zero-padding the account ID keeps the IDs
    /// of one account lexicographically adjacent.
    pub fn object_id(&self) -> String {
        format!("{:010}:{}:{}", self.account_id, self.tank_id, self.last_battle_time)
    }

    /// Recovers the identity key from a stored document ID.
    pub fn parse_object_id(id: &str) -> crate::prelude::Result<(AccountId, TankId, i64)> {
        let mut parts = id.splitn(3, ':');
        let account_id = parts.next().unwrap_or_default().parse()?;
        let tank_id = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("`{id}` is not a tank stat ID"))?
            .parse()?;
        let last_battle_time = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("`{id}` is not a tank stat ID"))?
            .parse()?;
        Ok((account_id, tank_id, last_battle_time))
    }

    /// The full flattened record used by the data export.
    pub fn flattened(&self) -> serde_json::Value {
        serde_json::json!({
            "account_id": self.account_id,
            "tank_id": self.tank_id,
            "last_battle_time": self.last_battle_time,
            "battle_life_time": self.battle_life_time,
            "release": self.release,
            "region": self.region,
            "all.battles": self.all.battles,
            "all.wins": self.all.wins,
            "all.survived_battles": self.all.survived_battles,
            "all.win_and_survived": self.all.win_and_survived,
            "all.damage_dealt": self.all.damage_dealt,
            "all.damage_received": self.all.damage_received,
            "all.shots": self.all.shots,
            "all.hits": self.all.hits,
            "all.frags": self.all.frags,
            "all.xp": self.all.xp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::*;

    #[test]
    fn parse_api_row_ok() -> Result {
        let stat = serde_json::from_str::<TankStat>(
            // language=json
            r#"{"account_id": 523988817, "tank_id": 3697, "last_battle_time": 1666104416, "battle_life_time": 34992, "all": {"battles": 399, "wins": 239, "survived_battles": 196, "win_and_survived": 181, "damage_dealt": 512798, "damage_received": 413467, "shots": 3209, "hits": 2632, "frags": 425, "xp": 272283}}"#,
        )?;
        assert_eq!(stat.tank_id, 3697);
        assert_eq!(stat.all.battles, 399);
        assert_eq!(stat.object_id(), "0523988817:3697:1666104416");
        Ok(())
    }
}
