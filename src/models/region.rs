use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::models::AccountId;
use crate::prelude::*;

/// Upstream API namespace. Each region owns a fixed account ID range,
/// so the region of an account is derivable from its ID and never changes.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum)]
pub enum Region {
    #[serde(rename = "ru")]
    #[value(name = "ru")]
    Russia,

    #[serde(rename = "eu")]
    #[value(name = "eu")]
    Europe,

    #[serde(rename = "com")]
    #[value(name = "com")]
    NorthAmerica,

    #[serde(rename = "asia")]
    #[value(name = "asia")]
    Asia,
}

impl Region {
    /// Upper bounds of the account ID ranges, in range order.
    const RANGES: [(Region, AccountId, AccountId); 4] = [
        (Region::Russia, 0, 500_000_000),
        (Region::Europe, 500_000_000, 1_000_000_000),
        (Region::NorthAmerica, 1_000_000_000, 2_000_000_000),
        (Region::Asia, 2_000_000_000, 3_100_000_000),
    ];

    pub const ACCOUNT_ID_MAX: AccountId = 3_100_000_000;

    /// The regions queried by default: the ones whose API is still serving stats.
    pub const fn api_regions() -> [Region; 3] {
        [Region::Europe, Region::NorthAmerica, Region::Asia]
    }

    pub const fn all() -> [Region; 4] {
        [Region::Europe, Region::NorthAmerica, Region::Asia, Region::Russia]
    }

    pub fn from_account_id(account_id: AccountId) -> Option<Region> {
        Self::RANGES
            .iter()
            .find(|(_, start, end)| (*start..*end).contains(&account_id))
            .map(|(region, _, _)| *region)
    }

    pub const fn to_str(self) -> &'static str {
        match self {
            Self::Russia => "ru",
            Self::Europe => "eu",
            Self::NorthAmerica => "com",
            Self::Asia => "asia",
        }
    }
}

impl std::str::FromStr for Region {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "ru" => Ok(Self::Russia),
            "eu" => Ok(Self::Europe),
            "com" | "na" => Ok(Self::NorthAmerica),
            "asia" => Ok(Self::Asia),
            _ => bail!("`{value}` is not a valid region"),
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.to_str())
    }
}
