//! Account streams: the source composer and the region splitter.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::TryStreamExt;

use crate::counter::EventCounter;
use crate::database::{AccountFilter, Backend};
use crate::models::{Account, AccountId, Region, StatsKind};
use crate::prelude::*;
use crate::queue::{QueueDone, WorkQueue};

/// Where the account stream comes from. Precedence: an explicit ID list,
/// then a file, then a backend query.
#[derive(Default)]
pub struct AccountSource {
    pub accounts: Vec<AccountId>,
    pub file: Option<PathBuf>,
    pub filter: AccountFilter,
}

impl AccountSource {
    /// Whether a list- or file-sourced account passes the common filters.
    /// Backend-sourced accounts are filtered by the driver instead.
    fn selects(&self, account: &Account, stats: &mut EventCounter) -> bool {
        if let Some(distributed) = self.filter.distributed {
            if account.id as u64 % distributed.modulus != distributed.index {
                return false;
            }
        }
        if self.filter.regions.is_empty() {
            return true;
        }
        match account.region {
            Some(region) => self.filter.regions.contains(&region),
            None => {
                // An account ID outside every known range cannot be queried.
                error!(account_id = account.id, "the account has no region");
                stats.log("errors");
                false
            }
        }
    }
}

/// The number of accounts the source will yield. Used as the progress total:
/// the queue's own size must not be used for that, it is wrong with more than
/// one producer.
pub async fn count_accounts(
    backend: &dyn Backend,
    kind: Option<StatsKind>,
    source: &AccountSource,
) -> Result<u64> {
    if !source.accounts.is_empty() {
        Ok(source.accounts.len() as u64)
    } else if let Some(path) = &source.file {
        Ok(read_accounts_file(path).await?.len() as u64)
    } else {
        backend.accounts_count(kind, &source.filter).await
    }
}

/// Feeds the source's accounts into the queue.
///
/// Registers exactly one producer on the queue and releases it in every exit
/// path, so consumers always observe the queue draining.
#[instrument(skip_all)]
pub async fn create_account_feed(
    backend: Arc<dyn Backend>,
    kind: Option<StatsKind>,
    source: AccountSource,
    queue: WorkQueue<Account>,
) -> Result<EventCounter> {
    let mut stats = EventCounter::new(format!("{}: accounts", backend.driver()));
    let producer = queue.producer();

    if !source.accounts.is_empty() {
        for account_id in &source.accounts {
            let account = Account::new(*account_id);
            if source.selects(&account, &mut stats) {
                producer.put(account).await;
                stats.log("read");
            }
        }
    } else if let Some(path) = &source.file {
        info!(path = %path.display(), "reading accounts…");
        for account in read_accounts_file(path).await? {
            if source.selects(&account, &mut stats) {
                producer.put(account).await;
                stats.log("read");
            }
        }
    } else {
        let mut accounts = backend.accounts_get(kind, &source.filter).await?;
        while let Some(account) = accounts.try_next().await? {
            producer.put(account).await;
            stats.log("read");
        }
    }

    producer.finish();
    Ok(stats)
}

/// Parses an account file by extension: `.txt` is one ID per line, `.csv` has
/// a header row, `.json` is an array of accounts or plain IDs.
pub async fn read_accounts_file(path: &Path) -> Result<Vec<Account>> {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read `{}`", path.display()))?;
    match extension.as_str() {
        "txt" => parse_txt(&contents),
        "csv" => parse_csv(&contents),
        "json" => parse_json(&contents),
        _ => bail!("unsupported account file extension: `{}`", path.display()),
    }
}

fn parse_txt(contents: &str) -> Result<Vec<Account>> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let account_id = line
                .parse()
                .with_context(|| format!("`{line}` is not an account ID"))?;
            Ok(Account::new(account_id))
        })
        .collect()
}

fn parse_csv(contents: &str) -> Result<Vec<Account>> {
    let mut reader = csv::Reader::from_reader(contents.as_bytes());
    let column = reader
        .headers()
        .context("the CSV file has no header row")?
        .iter()
        .position(|header| header == "account_id")
        .unwrap_or_default();
    let mut accounts = Vec::new();
    for record in reader.records() {
        let record = record.context("failed to read a CSV record")?;
        let field = record
            .get(column)
            .ok_or_else(|| anyhow!("the CSV record is missing the account ID"))?;
        let account_id = field
            .parse()
            .with_context(|| format!("`{field}` is not an account ID"))?;
        accounts.push(Account::new(account_id));
    }
    Ok(accounts)
}

fn parse_json(contents: &str) -> Result<Vec<Account>> {
    if let Ok(accounts) = serde_json::from_str::<Vec<Account>>(contents) {
        return Ok(accounts);
    }
    let account_ids: Vec<AccountId> =
        serde_json::from_str(contents).context("failed to parse the JSON account file")?;
    Ok(account_ids.into_iter().map(Account::new).collect())
}

/// Moves accounts from the pass-through queue into the matching per-region
/// queue. Accounts of unrequested regions are counted and dropped.
pub async fn split_accounts_by_region(
    source: WorkQueue<Account>,
    regions: HashMap<Region, WorkQueue<Account>>,
) -> Result<EventCounter> {
    let mut stats = EventCounter::new("split accounts");
    let producers: HashMap<Region, _> = regions
        .iter()
        .map(|(region, queue)| (*region, queue.producer()))
        .collect();
    loop {
        let account = match source.get().await {
            Ok(job) => job.into_inner(),
            Err(QueueDone) => break,
        };
        stats.log("total");
        match account.region.and_then(|region| producers.get(&region)) {
            Some(producer) => {
                let region = account.region.expect("the producer was found by region");
                producer.put(account).await;
                stats.log(region.to_str());
            }
            None => {
                stats.log("excluded");
            }
        }
    }
    Ok(stats)
}

/// Reads account ID batches and inserts them as new accounts.
/// Insertion is idempotent, so already known accounts are only counted.
pub async fn accounts_add_worker(
    backend: Arc<dyn Backend>,
    queue: WorkQueue<Vec<AccountId>>,
) -> Result<EventCounter> {
    let mut stats = EventCounter::new(format!("{}: add accounts", backend.driver()));
    loop {
        let batch = match queue.get().await {
            Ok(job) => job,
            Err(QueueDone) => break,
        };
        stats.log_n("accounts total", batch.len() as i64);
        let accounts: Vec<Account> = batch.iter().copied().map(Account::new).collect();
        match backend.accounts_insert(&accounts).await {
            Ok(outcome) => {
                stats.log_n("accounts added", outcome.inserted as i64);
                stats.log_n("old accounts found", outcome.skipped as i64);
            }
            Err(error) if !crate::database::is_fatal(&error) => {
                error!("failed to add accounts: {error:#}");
                stats.log("errors");
            }
            Err(error) => return Err(error),
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::database::Distributed;

    #[test]
    fn txt_and_csv_and_json_files_are_parsed() -> Result {
        let accounts = parse_txt("1\n2\n\n3\n")?;
        assert_eq!(accounts.len(), 3);

        let accounts = parse_csv("account_id,region\n4,eu\n5,eu\n")?;
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].id, 4);

        let accounts = parse_json("[6, 7]")?;
        assert_eq!(accounts.len(), 2);
        Ok(())
    }

    /// For any `N`, the shards `i ∈ [0, N)` cover every account exactly once.
    #[test]
    fn distributed_shards_are_a_disjoint_cover() {
        let account_ids = [1, 2, 3, 4, 5, 6];
        let mut seen = HashSet::new();
        for index in 0..3 {
            let source = AccountSource {
                filter: AccountFilter {
                    distributed: Some(Distributed { index, modulus: 3 }),
                    ..AccountFilter::default()
                },
                ..AccountSource::default()
            };
            let mut stats = EventCounter::new("test");
            for account_id in account_ids {
                if source.selects(&Account::new(account_id), &mut stats) {
                    assert!(seen.insert(account_id), "#{account_id} is in two shards");
                }
            }
        }
        assert_eq!(seen.len(), account_ids.len());
    }
}
