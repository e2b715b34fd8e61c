use std::str::FromStr;

use chrono::NaiveDate;

use crate::database::Distributed;
use crate::models::AccountId;
use crate::prelude::*;

pub fn account_id(value: &str) -> Result<AccountId> {
    match AccountId::from_str(value)? {
        account_id if account_id >= 1 => Ok(account_id),
        account_id => Err(anyhow!("{account_id} is an invalid account ID")),
    }
}

/// `0` – everything, a fraction below 1 – a share of the matching rows,
/// `1` and above – an absolute count.
pub fn sample(value: &str) -> Result<f64> {
    match f64::from_str(value)? {
        sample if sample >= 0.0 => Ok(sample),
        _ => Err(anyhow!("the sample must not be negative")),
    }
}

pub fn rate_limit(value: &str) -> Result<f64> {
    match f64::from_str(value)? {
        rate_limit if rate_limit > 0.0 => Ok(rate_limit),
        _ => Err(anyhow!("the rate limit must be positive")),
    }
}

pub fn distributed(value: &str) -> Result<Distributed> {
    value.parse()
}

/// `YYYY-MM-DD` → epoch seconds at midnight UTC.
pub fn date_to_epoch(value: &str) -> Result<i64> {
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("`{value}` is not a valid date, expected `YYYY-MM-DD`"))?;
    let datetime = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow!("`{value}` is not a valid date"))?;
    Ok(Utc.from_utc_datetime(&datetime).timestamp())
}

pub fn non_zero_usize(value: &str) -> Result<usize> {
    match FromStr::from_str(value)? {
        count if count >= 1 => Ok(count),
        _ => Err(anyhow!("expected a positive number")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_accepts_fractions_and_counts() {
        assert_eq!(sample("0").unwrap(), 0.0);
        assert_eq!(sample("0.25").unwrap(), 0.25);
        assert_eq!(sample("5000").unwrap(), 5000.0);
        assert!(sample("-1").is_err());
    }

    #[test]
    fn dates_are_parsed_to_epoch_seconds() {
        assert_eq!(date_to_epoch("1970-01-02").unwrap(), 86400);
        assert!(date_to_epoch("02.01.1970").is_err());
    }
}
