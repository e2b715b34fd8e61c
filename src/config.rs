//! The optional TOML configuration file.
//!
//! Command-line flags override config values, config values override the
//! built-in defaults.

use std::path::Path;

use serde::Deserialize;

use crate::database::Driver;
use crate::prelude::*;

#[derive(Deserialize, Default, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default, alias = "GENERAL")]
    pub general: General,

    #[serde(default, alias = "WG")]
    pub wg: Wg,

    #[serde(default, alias = "WOTINSPECTOR")]
    pub wotinspector: WotInspector,

    #[serde(default, alias = "ACCOUNTS")]
    pub accounts: Files,

    #[serde(default, alias = "TANK_STATS")]
    pub tank_stats: TankStatsFiles,

    #[serde(default, alias = "DATABASE")]
    pub database: DatabaseSection,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct General {
    pub backend: Option<String>,
}

impl Default for General {
    fn default() -> Self {
        Self { backend: None }
    }
}

impl General {
    pub fn driver(&self) -> Result<Option<Driver>> {
        match self.backend.as_deref() {
            None => Ok(None),
            Some("mongodb") => Ok(Some(Driver::Mongodb)),
            Some("postgresql") => Ok(Some(Driver::Postgresql)),
            Some("files") => Ok(Some(Driver::Files)),
            Some(other) => bail!("`{other}` is not a valid backend"),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct Wg {
    #[serde(alias = "wg_app_id")]
    pub application_id: Option<String>,

    /// Requests per second.
    #[serde(default = "Wg::default_rate_limit")]
    pub rate_limit: f64,

    #[serde(default = "Wg::default_api_workers")]
    pub api_workers: usize,
}

impl Wg {
    const fn default_rate_limit() -> f64 {
        10.0
    }

    const fn default_api_workers() -> usize {
        10
    }
}

impl Default for Wg {
    fn default() -> Self {
        Self {
            application_id: None,
            rate_limit: Self::default_rate_limit(),
            api_workers: Self::default_api_workers(),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct WotInspector {
    /// Requests per second.
    #[serde(default = "WotInspector::default_rate_limit")]
    pub rate_limit: f64,

    #[serde(default = "WotInspector::default_max_pages")]
    pub max_pages: i32,

    #[serde(default = "WotInspector::default_workers")]
    pub workers: usize,

    pub auth_token: Option<String>,
}

impl WotInspector {
    const fn default_rate_limit() -> f64 {
        2.0
    }

    const fn default_max_pages() -> i32 {
        10
    }

    const fn default_workers() -> usize {
        5
    }
}

impl Default for WotInspector {
    fn default() -> Self {
        Self {
            rate_limit: Self::default_rate_limit(),
            max_pages: Self::default_max_pages(),
            workers: Self::default_workers(),
            auth_token: None,
        }
    }
}

#[derive(Deserialize, Default, Debug)]
#[serde(deny_unknown_fields)]
pub struct Files {
    pub export_format: Option<String>,
    pub export_file: Option<String>,
}

#[derive(Deserialize, Default, Debug)]
#[serde(deny_unknown_fields)]
pub struct TankStatsFiles {
    pub export_format: Option<String>,
    pub export_file: Option<String>,
    pub export_data_format: Option<String>,
    pub export_data_file: Option<String>,
}

#[derive(Deserialize, Default, Debug)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSection {
    pub uri: Option<String>,
}

impl Config {
    pub fn read(path: Option<&Path>) -> Result<Self> {
        match path {
            None => Ok(Self::default()),
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read `{}`", path.display()))?;
                toml::from_str(&contents)
                    .with_context(|| format!("failed to parse `{}`", path.display()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_ok() -> Result {
        let config: Config = toml::from_str(
            // language=TOML
            r#"
            [GENERAL]
            backend = "mongodb"

            [WG]
            wg_app_id = "0123456789abcdef"
            rate_limit = 20.0

            [WOTINSPECTOR]
            max_pages = 25
            auth_token = "secret"

            [DATABASE]
            uri = "mongodb://localhost/blitz-stats"
            "#,
        )?;
        assert_eq!(config.general.driver()?, Some(Driver::Mongodb));
        assert_eq!(config.wg.rate_limit, 20.0);
        assert_eq!(config.wg.api_workers, 10);
        assert_eq!(config.wotinspector.max_pages, 25);
        assert_eq!(config.database.uri.as_deref(), Some("mongodb://localhost/blitz-stats"));
        Ok(())
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("[WG]\nrate = 1.0\n").is_err());
    }
}
