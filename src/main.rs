#![warn(
    clippy::all,
    clippy::missing_const_for_fn,
    clippy::trivially_copy_pass_by_ref,
    clippy::map_unwrap_or,
    clippy::explicit_into_iter_loop,
    clippy::unused_self,
    clippy::needless_pass_by_value
)]

use std::sync::Arc;

use clap::Parser;
use sentry::integrations::anyhow::capture_anyhow;

use crate::config::Config;
use crate::database::{Backend, Driver};
use crate::models::StatsKind;
use crate::opts::{
    AccountsCommand, EditCommand, Opts, ReleasesCommand, ReplaysCommand, SetupCommand,
    StatsCommand, Subcommand, TankopediaCommand,
};
use crate::prelude::*;

mod accounts;
mod bucket;
mod config;
mod counter;
mod crawler;
pub mod database;
mod duplicates;
mod export;
mod fetcher;
mod helpers;
mod import;
pub mod models;
mod opts;
mod prelude;
mod queue;
mod releases;
mod snapshot;
mod tankopedia;
pub mod wargaming;
mod wotinspector;

const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result {
    let opts: Opts = Opts::parse();
    let directive = if opts.debug {
        "blitz_stats=trace"
    } else if opts.verbose {
        "blitz_stats=debug"
    } else if opts.silent {
        "blitz_stats=error"
    } else {
        "blitz_stats=info"
    };
    let _sentry_guard = helpers::tracing::init(
        opts.sentry_dsn.clone(),
        opts.traces_sample_rate,
        directive,
        opts.log.as_deref(),
    )?;
    info!(version = CRATE_VERSION);

    tokio::runtime::Builder::new_multi_thread()
        .thread_stack_size(8 * 1024 * 1024)
        .enable_all()
        .build()?
        .block_on(run_subcommand(opts))
}

async fn run_subcommand(opts: Opts) -> Result {
    let start_instant = Instant::now();
    let config = Config::read(opts.config.as_deref())?;
    let driver = match opts.backend {
        Some(driver) => driver,
        None => config.general.driver()?.unwrap_or(Driver::Mongodb),
    };
    let uri = opts
        .database
        .clone()
        .or_else(|| config.database.uri.clone())
        .ok_or_else(|| anyhow!("the database URI is not specified, use `--database`"))?;
    let backend = database::open(driver, &uri).await?;

    let result = match opts.subcommand {
        Subcommand::Accounts { ref command } => match command {
            AccountsCommand::Update(update) => {
                crawler::cmd_update(backend, &config, opts.force, update).await
            }
            AccountsCommand::Export(export) => {
                export::cmd_accounts_export(backend, &config, export, opts.force).await
            }
            AccountsCommand::Import(import) => {
                import::cmd_accounts_import(backend, import, opts.force).await
            }
        },
        Subcommand::TankStats { ref command } => {
            run_stats_command(backend, &config, &opts, StatsKind::TankStats, command).await
        }
        Subcommand::PlayerAchievements { ref command } => {
            run_stats_command(backend, &config, &opts, StatsKind::PlayerAchievements, command)
                .await
        }
        Subcommand::Replays { ref command } => match command {
            ReplaysCommand::Export(export) => {
                export::cmd_replays_export(backend, export, opts.force).await
            }
            ReplaysCommand::Import(import) => {
                import::cmd_replays_import(backend, import).await
            }
        },
        Subcommand::Tankopedia { ref command } => match command {
            TankopediaCommand::Update(update) => {
                tankopedia::cmd_update(backend, &config, update).await
            }
            TankopediaCommand::Import(import) => tankopedia::cmd_import(backend, import).await,
        },
        Subcommand::Releases { ref command } => match command {
            ReleasesCommand::List => releases::cmd_list(backend).await,
            ReleasesCommand::Import(import) => {
                releases::cmd_import(backend, import, opts.force).await
            }
            ReleasesCommand::Export(export) => {
                releases::cmd_export(backend, export, opts.force).await
            }
        },
        Subcommand::Setup { ref command } => match command {
            SetupCommand::Indexes => backend.setup_indexes().await,
        },
    };

    info!(elapsed = ?start_instant.elapsed(), "the command has finished");
    if let Err(error) = &result {
        capture_anyhow(error);
    }
    result
}

async fn run_stats_command(
    backend: Arc<dyn Backend>,
    config: &Config,
    opts: &Opts,
    kind: StatsKind,
    command: &StatsCommand,
) -> Result {
    match command {
        StatsCommand::Fetch(fetch) => {
            fetcher::cmd_fetch(backend, config, kind, fetch, opts.force).await
        }
        StatsCommand::Export(export) => {
            export::cmd_stats_export(backend, config, kind, export, opts.force).await
        }
        StatsCommand::ExportData(export) => {
            if kind != StatsKind::TankStats {
                bail!("the data export supports tank stats only");
            }
            export::cmd_export_data(backend, config, export, opts.force).await
        }
        StatsCommand::Import(import) => {
            import::cmd_stats_import(backend, kind, import, opts.force).await
        }
        StatsCommand::Edit {
            command: EditCommand::RemapRelease(remap),
        } => releases::cmd_remap_release(backend, kind, remap).await,
        StatsCommand::Prune(prune) => duplicates::cmd_prune(backend, kind, prune).await,
        StatsCommand::Snapshot(snapshot) => snapshot::cmd_snapshot(backend, kind, snapshot).await,
    }
}
