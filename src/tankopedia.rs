//! The tankopedia: the vehicle catalog stats are joined against.

use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::config::Config;
use crate::database::Backend;
use crate::models::Vehicle;
use crate::opts::{TankopediaImportOpts, TankopediaUpdateOpts};
use crate::prelude::*;
use crate::wargaming::WargamingApi;

const API_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// Fetches the vehicle catalog from the upstream API and upserts it.
#[instrument(skip_all)]
pub async fn cmd_update(
    backend: Arc<dyn Backend>,
    config: &Config,
    opts: &TankopediaUpdateOpts,
) -> Result {
    let application_id = opts
        .wg_app_id
        .clone()
        .or_else(|| config.wg.application_id.clone())
        .ok_or_else(|| anyhow!("the Wargaming.net application ID is not specified"))?;
    let max_rps = NonZeroU32::new(1).expect("one is not zero");
    let api = WargamingApi::new(&application_id, API_TIMEOUT, max_rps)?;

    let vehicles = api.get_tankopedia().await?;
    let outcome = backend.tankopedia_insert(&vehicles).await?;
    info!(inserted = outcome.inserted, updated = outcome.skipped, "done");
    Ok(())
}

/// Imports the vehicle catalog from a JSON file: either an array of vehicles
/// or the raw API map keyed by tank ID.
#[instrument(skip_all, fields(file = %opts.file.display()))]
pub async fn cmd_import(backend: Arc<dyn Backend>, opts: &TankopediaImportOpts) -> Result {
    let contents = tokio::fs::read_to_string(&opts.file)
        .await
        .with_context(|| format!("failed to read `{}`", opts.file.display()))?;
    let vehicles: Vec<Vehicle> = match serde_json::from_str::<Vec<Vehicle>>(&contents) {
        Ok(vehicles) => vehicles,
        Err(_) => serde_json::from_str::<BTreeMap<String, Vehicle>>(&contents)
            .with_context(|| format!("failed to parse `{}`", opts.file.display()))?
            .into_values()
            .collect(),
    };
    let outcome = backend.tankopedia_insert(&vehicles).await?;
    info!(inserted = outcome.inserted, updated = outcome.skipped, "done");
    Ok(())
}
