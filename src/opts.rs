//! CLI options.

pub mod parsers;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand as ClapSubcommand, ValueEnum};

use crate::database::{Distributed, Driver, InactiveAccounts};
use crate::models::{AccountId, Region, TankId};

#[derive(Parser)]
#[command(author, version, about)]
pub struct Opts {
    /// Sentry DSN
    #[arg(long, env = "BLITZ_STATS_SENTRY_DSN")]
    pub sentry_dsn: Option<String>,

    #[arg(long, env = "BLITZ_STATS_TRACES_SAMPLE_RATE", default_value = "0.0")]
    pub traces_sample_rate: f32,

    /// Log everything the engine does
    #[arg(long, conflicts_with_all = ["verbose", "silent"])]
    pub debug: bool,

    /// Log the progress of each worker
    #[arg(short, long, conflicts_with = "silent")]
    pub verbose: bool,

    /// Log errors only
    #[arg(long)]
    pub silent: bool,

    /// Append the log to the file instead of standard error
    #[arg(long, value_name = "FILE")]
    pub log: Option<PathBuf>,

    /// Configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Storage driver
    #[arg(long, value_enum)]
    pub backend: Option<Driver>,

    /// Database URI, e.g. `mongodb://localhost/blitz-stats`
    #[arg(long, env = "BLITZ_STATS_DATABASE_URI", value_name = "URI")]
    pub database: Option<String>,

    /// Ignore existing data: refetch, overwrite or re-import it
    #[arg(long)]
    pub force: bool,

    #[command(subcommand)]
    pub subcommand: Subcommand,
}

#[derive(ClapSubcommand)]
pub enum Subcommand {
    /// Manage the account table
    Accounts {
        #[command(subcommand)]
        command: AccountsCommand,
    },

    /// Manage per-tank statistics
    TankStats {
        #[command(subcommand)]
        command: StatsCommand,
    },

    /// Manage player achievements
    PlayerAchievements {
        #[command(subcommand)]
        command: StatsCommand,
    },

    /// Manage stored replays
    Replays {
        #[command(subcommand)]
        command: ReplaysCommand,
    },

    /// Manage the tankopedia
    Tankopedia {
        #[command(subcommand)]
        command: TankopediaCommand,
    },

    /// Manage the release table
    Releases {
        #[command(subcommand)]
        command: ReleasesCommand,
    },

    /// One-off installation tasks
    Setup {
        #[command(subcommand)]
        command: SetupCommand,
    },
}

#[derive(ClapSubcommand)]
pub enum AccountsCommand {
    /// Discover new accounts from replays, or import IDs from a file
    Update(AccountsUpdateOpts),

    /// Export accounts to text files
    Export(AccountsExportOpts),

    /// Import accounts from another backend
    Import(ImportOpts),
}

#[derive(ClapSubcommand)]
pub enum StatsCommand {
    /// Fetch the latest stats from the upstream API
    Fetch(FetchOpts),

    /// Export stats to text files
    Export(StatsExportOpts),

    /// Export release-scoped stats as LZ4-framed data files
    ExportData(ExportDataOpts),

    /// Import stats from another backend
    Import(ImportOpts),

    /// Bulk-edit stored stats
    Edit {
        #[command(subcommand)]
        command: EditCommand,
    },

    /// Find and delete duplicate rows within a release window
    Prune(PruneOpts),

    /// Merge the newest archived row per key into the latest collection
    Snapshot(SnapshotOpts),
}

#[derive(ClapSubcommand)]
pub enum EditCommand {
    /// Recompute the release field from the release table
    RemapRelease(RemapReleaseOpts),
}

#[derive(ClapSubcommand)]
pub enum ReplaysCommand {
    /// Export stored replays as JSON lines
    Export(ReplaysExportOpts),

    /// Import replays from another backend
    Import(ImportOpts),
}

#[derive(ClapSubcommand)]
pub enum TankopediaCommand {
    /// Fetch the vehicle catalog from the upstream API
    Update(TankopediaUpdateOpts),

    /// Import the vehicle catalog from a JSON file
    Import(TankopediaImportOpts),
}

#[derive(ClapSubcommand)]
pub enum ReleasesCommand {
    /// Print the release table
    List,

    /// Import releases from a JSON file
    Import(ReleasesImportOpts),

    /// Export the release table as JSON
    Export(ReleasesExportOpts),
}

#[derive(ClapSubcommand)]
pub enum SetupCommand {
    /// Create the required indexes
    Indexes,
}

#[derive(Args)]
pub struct FetchOpts {
    /// Number of asynchronous API workers
    #[arg(long, value_parser = parsers::non_zero_usize)]
    pub workers: Option<usize>,

    /// Wargaming.net application ID
    #[arg(long, env = "BLITZ_STATS_WG_APP_ID")]
    pub wg_app_id: Option<String>,

    /// Upstream rate limit, requests per second
    #[arg(long, value_parser = parsers::rate_limit)]
    pub rate_limit: Option<f64>,

    /// Filter by region, may be repeated
    #[arg(long = "region", value_enum)]
    pub regions: Vec<Region>,

    /// Fraction (below 1) or absolute number of accounts
    #[arg(long, default_value = "0", value_parser = parsers::sample)]
    pub sample: f64,

    /// Only refresh accounts whose stats are older than the given number of days
    #[arg(long, value_name = "DAYS")]
    pub cache_valid: Option<u64>,

    /// Process only accounts with `id mod N == I`
    #[arg(long, value_name = "I:N", value_parser = parsers::distributed)]
    pub distributed: Option<Distributed>,

    /// Re-check accounts that were marked disabled
    #[arg(long)]
    pub check_disabled: bool,

    /// Inactive account selection
    #[arg(long, value_enum, default_value = "auto")]
    pub inactive: InactiveAccounts,

    /// Explicit account IDs to fetch
    #[arg(long = "accounts", value_parser = parsers::account_id, num_args = 1..)]
    pub accounts: Vec<AccountId>,

    /// Read account IDs from the file (`.txt`, `.csv` or `.json`)
    #[arg(long, value_name = "FILE", conflicts_with = "accounts")]
    pub file: Option<PathBuf>,
}

#[derive(Args)]
pub struct AccountsUpdateOpts {
    /// Import account IDs from the file instead of crawling replays
    #[arg(long, value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// First listing page to spider
    #[arg(long, default_value = "1")]
    pub start_page: i32,

    /// Number of listing pages to spider; negative steps backwards
    #[arg(long)]
    pub max_pages: Option<i32>,

    /// Stop spidering after seeing this many already-stored replays
    #[arg(long, default_value = "30")]
    pub max_old_replays: usize,

    /// Number of replay fetch workers
    #[arg(long, value_parser = parsers::non_zero_usize)]
    pub workers: Option<usize>,

    /// Replay service rate limit, requests per second
    #[arg(long, value_parser = parsers::rate_limit)]
    pub rate_limit: Option<f64>,

    /// Replay service authentication token
    #[arg(long, env = "BLITZ_STATS_WI_AUTH_TOKEN")]
    pub auth_token: Option<String>,
}

#[derive(Args)]
pub struct AccountsExportOpts {
    /// Export file format
    #[arg(value_enum)]
    pub format: Option<ExportFormat>,

    /// File to export to, `-` for standard output
    #[arg(value_name = "FILE")]
    pub filename: Option<String>,

    /// Filter by region, may be repeated
    #[arg(long = "region", value_enum)]
    pub regions: Vec<Region>,

    /// Fraction (below 1) or absolute number of accounts
    #[arg(long, default_value = "0", value_parser = parsers::sample)]
    pub sample: f64,

    /// Export disabled accounts instead of enabled ones
    #[arg(long)]
    pub disabled: bool,

    /// Inactive account selection
    #[arg(long, value_enum, default_value = "auto")]
    pub inactive: InactiveAccounts,

    /// Split the export into one file per region
    #[arg(long, conflicts_with = "shards")]
    pub by_region: bool,

    /// Split the export into N disjoint shard files by `id mod N`
    #[arg(long, value_name = "N", value_parser = parsers::non_zero_usize)]
    pub shards: Option<usize>,
}

#[derive(Args)]
pub struct StatsExportOpts {
    /// Export file format
    #[arg(value_enum)]
    pub format: Option<ExportFormat>,

    /// File to export to, `-` for standard output
    #[arg(value_name = "FILE")]
    pub filename: Option<String>,

    /// Filter by region, may be repeated
    #[arg(long = "region", value_enum)]
    pub regions: Vec<Region>,

    /// Explicit account IDs to export
    #[arg(long = "accounts", value_parser = parsers::account_id, num_args = 1..)]
    pub accounts: Vec<AccountId>,

    /// Explicit tank IDs to export
    #[arg(long = "tanks", num_args = 1..)]
    pub tanks: Vec<TankId>,

    /// Export stats of the release only
    #[arg(long)]
    pub release: Option<String>,

    /// Fraction (below 1) or absolute number of rows
    #[arg(long, default_value = "0", value_parser = parsers::sample)]
    pub sample: f64,

    /// Split the export into one file per region
    #[arg(long)]
    pub by_region: bool,
}

#[derive(Args)]
pub struct ExportDataOpts {
    /// Release to export
    pub release: String,

    /// Data file format
    #[arg(long, value_enum, default_value = "lz4")]
    pub format: DataExportFormat,

    /// Base directory of the export tree
    #[arg(long, default_value = "export")]
    pub basedir: PathBuf,

    /// File name stem within the release directory
    #[arg(long, default_value = "update_totals")]
    pub filename: String,

    /// Filter by region, may be repeated
    #[arg(long = "region", value_enum)]
    pub regions: Vec<Region>,
}

#[derive(Args)]
pub struct ImportOpts {
    /// Driver of the backend to import from
    #[arg(long, value_enum, default_value = "mongodb")]
    pub driver: Driver,

    /// URI of the backend to import from
    #[arg(long, value_name = "URI")]
    pub uri: String,

    /// Fraction (below 1) or absolute number of rows
    #[arg(long, default_value = "0", value_parser = parsers::sample)]
    pub sample: f64,

    /// Number of insert workers
    #[arg(long, default_value = "5", value_parser = parsers::non_zero_usize)]
    pub workers: usize,

    /// Do not assign releases while importing
    #[arg(long)]
    pub no_release_map: bool,
}

#[derive(Args)]
pub struct RemapReleaseOpts {
    /// Apply the changes instead of logging what would change
    #[arg(long)]
    pub commit: bool,

    /// Fraction (below 1) or absolute number of rows
    #[arg(long, default_value = "0", value_parser = parsers::sample)]
    pub sample: f64,

    /// Filter by region, may be repeated
    #[arg(long = "region", value_enum)]
    pub regions: Vec<Region>,

    /// Only remap rows currently assigned to the release
    #[arg(long)]
    pub release: Option<String>,

    /// Only remap rows newer than the date
    #[arg(long, value_name = "YYYY-MM-DD", value_parser = parsers::date_to_epoch)]
    pub since: Option<i64>,

    /// Explicit account IDs to remap
    #[arg(long = "accounts", value_parser = parsers::account_id, num_args = 1..)]
    pub accounts: Vec<AccountId>,

    /// Explicit tank IDs to remap
    #[arg(long = "tanks", num_args = 1..)]
    pub tanks: Vec<TankId>,
}

#[derive(Args)]
pub struct PruneOpts {
    /// Release whose window is pruned
    pub release: String,

    /// Delete the duplicates and unstage them; a dry run otherwise
    #[arg(long)]
    pub commit: bool,

    /// Work on the archive collection instead of the latest one
    #[arg(long)]
    pub archive: bool,

    /// Before deleting from the latest collection, verify that every row
    /// exists in the archive; abort the batch otherwise
    #[arg(long, conflicts_with = "archive")]
    pub check_archive: bool,

    /// Validate a sample of the staged duplicates instead of pruning
    #[arg(long, conflicts_with_all = ["commit", "reset"])]
    pub check: bool,

    /// Drop the staged duplicates of this kind and exit
    #[arg(long, conflicts_with = "commit")]
    pub reset: bool,

    /// Filter by region, may be repeated
    #[arg(long = "region", value_enum)]
    pub regions: Vec<Region>,

    /// Fraction (below 1) or absolute number of rows
    #[arg(long, default_value = "0", value_parser = parsers::sample)]
    pub sample: f64,

    /// Number of analyze/prune workers
    #[arg(long, default_value = "4", value_parser = parsers::non_zero_usize)]
    pub workers: usize,
}

#[derive(Args)]
pub struct SnapshotOpts {
    /// Only snapshot the given tank IDs
    #[arg(long = "tanks", num_args = 1..)]
    pub tanks: Vec<TankId>,

    /// Number of snapshot workers
    #[arg(long, default_value = "4", value_parser = parsers::non_zero_usize)]
    pub workers: usize,
}

#[derive(Args)]
pub struct ReplaysExportOpts {
    /// File to export to, `-` for standard output
    #[arg(value_name = "FILE")]
    pub filename: Option<String>,

    /// Fraction (below 1) or absolute number of replays
    #[arg(long, default_value = "0", value_parser = parsers::sample)]
    pub sample: f64,
}

#[derive(Args)]
pub struct TankopediaUpdateOpts {
    /// Wargaming.net application ID
    #[arg(long, env = "BLITZ_STATS_WG_APP_ID")]
    pub wg_app_id: Option<String>,
}

#[derive(Args)]
pub struct TankopediaImportOpts {
    /// JSON file with the vehicle catalog
    pub file: PathBuf,
}

#[derive(Args)]
pub struct ReleasesImportOpts {
    /// JSON file with an array of releases
    pub file: PathBuf,
}

#[derive(Args)]
pub struct ReleasesExportOpts {
    /// File to export to, `-` for standard output
    #[arg(value_name = "FILE")]
    pub filename: Option<String>,
}

#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
    Txt,
}

#[derive(ValueEnum, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DataExportFormat {
    /// JSON lines in an LZ4 frame.
    #[default]
    Lz4,
}
