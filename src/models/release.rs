use serde::{Deserialize, Serialize};

use crate::prelude::*;

/// A game release. Releases form a strictly ordered, non-overlapping sequence
/// by launch time; the cutoff of a release is the launch of the next one,
/// or "now" for the latest.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Release {
    /// Dotted version, e.g. `9.8`.
    #[serde(rename = "_id")]
    pub release: String,

    pub launch_time: i64,

    /// Zero means the release is still current.
    #[serde(default)]
    pub cutoff_time: i64,
}

impl Release {
    pub fn new(release: impl Into<String>, launch_time: i64, cutoff_time: i64) -> Self {
        Self {
            release: release.into(),
            launch_time,
            cutoff_time,
        }
    }

    /// The stats window of this release: `launch_time < t ≤ cutoff`.
    pub fn window(&self) -> (i64, i64) {
        (self.launch_time, self.cutoff_or_now())
    }

    pub fn cutoff_or_now(&self) -> i64 {
        if self.cutoff_time != 0 {
            self.cutoff_time
        } else {
            now()
        }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.launch_time < timestamp && timestamp <= self.cutoff_or_now()
    }
}

impl std::fmt::Display for Release {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.release)
    }
}
