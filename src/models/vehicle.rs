use serde::{Deserialize, Serialize};

use crate::models::TankId;

/// A vehicle from the tankopedia. Effectively immutable during a run.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Vehicle {
    pub tank_id: TankId,
    pub name: String,
    pub tier: i32,
    pub is_premium: bool,
    pub nation: Nation,

    #[serde(rename = "type")]
    pub type_: TankType,
}

#[derive(Serialize, Deserialize, Clone, Debug, Copy, Ord, Eq, PartialEq, PartialOrd)]
pub enum Nation {
    #[serde(rename = "ussr")]
    Ussr,

    #[serde(rename = "germany")]
    Germany,

    #[serde(rename = "usa")]
    Usa,

    #[serde(rename = "china")]
    China,

    #[serde(rename = "france")]
    France,

    #[serde(rename = "uk")]
    Uk,

    #[serde(rename = "japan")]
    Japan,

    #[serde(rename = "european")]
    Europe,

    #[serde(other, rename = "other")]
    Other,
}

#[derive(Serialize, Deserialize, Clone, Debug, Copy, Ord, Eq, PartialEq, PartialOrd)]
pub enum TankType {
    #[serde(rename = "lightTank")]
    Light,

    #[serde(rename = "mediumTank")]
    Medium,

    #[serde(rename = "heavyTank")]
    Heavy,

    #[serde(rename = "AT-SPG")]
    AT,

    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::*;

    #[test]
    fn parse_tankopedia_entry_ok() -> Result {
        let vehicle = serde_json::from_str::<Vehicle>(
            // language=json
            r#"{"tank_id": 3697, "name": "T-54", "tier": 9, "is_premium": false, "nation": "ussr", "type": "mediumTank"}"#,
        )?;
        assert_eq!(vehicle.nation, Nation::Ussr);
        assert_eq!(vehicle.type_, TankType::Medium);
        Ok(())
    }
}
