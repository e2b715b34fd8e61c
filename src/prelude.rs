pub use std::result::Result as StdResult;
pub use std::time;
pub use std::time::{Duration as StdDuration, Instant};

pub use anyhow::{anyhow, bail, Context};
pub use async_trait::async_trait;
pub use chrono::{TimeZone, Utc};
pub use tracing::{debug, error, info, instrument, trace, warn};

#[allow(dead_code)]
pub type AHashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

pub type DateTime = chrono::DateTime<chrono::Utc>;
pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;

/// Current wall clock in epoch seconds – the time unit of the upstream API.
pub fn now() -> i64 {
    Utc::now().timestamp()
}
