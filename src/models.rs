//! Domain models shared by the pipelines and the backends.

pub use self::account::*;
pub use self::achievements::*;
pub use self::curation::*;
pub use self::region::*;
pub use self::release::*;
pub use self::replay::*;
pub use self::tank_stat::*;
pub use self::vehicle::*;

pub mod account;
pub mod achievements;
pub mod curation;
pub mod region;
pub mod release;
pub mod replay;
pub mod tank_stat;
pub mod vehicle;

use serde::{Deserialize, Serialize};

pub type AccountId = i64;
pub type TankId = u32;

/// The stats families the engine curates.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatsKind {
    #[serde(rename = "tank_stats")]
    TankStats,

    #[serde(rename = "player_achievements")]
    PlayerAchievements,
}

impl StatsKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TankStats => "tank_stats",
            Self::PlayerAchievements => "player_achievements",
        }
    }

    /// Key of the corresponding staging entries in `StatsToDelete`.
    /// The archive variant is kept separate so that concurrent
    /// hot and archive runs do not collide.
    pub const fn delete_kind(self, archive: bool) -> &'static str {
        match (self, archive) {
            (Self::TankStats, false) => "tank_stats",
            (Self::TankStats, true) => "tank_stats-archive",
            (Self::PlayerAchievements, false) => "player_achievements",
            (Self::PlayerAchievements, true) => "player_achievements-archive",
        }
    }
}

impl std::fmt::Display for StatsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
