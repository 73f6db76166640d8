//! Cache retention policy.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

const GIB: u64 = 1024 * 1024 * 1024;

/// Limits applied to a cache store after every save and on explicit prune.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Entries kept per rendered key; older saves beyond this are evicted.
    pub max_entries_per_key: usize,
    /// Total payload bytes across the store.
    pub max_total_bytes: u64,
    /// Entries older than this are evicted regardless of use.
    pub max_age_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_entries_per_key: 3,
            max_total_bytes: 10 * GIB,
            max_age_days: 14,
        }
    }
}

impl RetentionPolicy {
    /// Keep everything; useful for tests.
    pub fn unbounded() -> Self {
        Self {
            max_entries_per_key: usize::MAX,
            max_total_bytes: u64::MAX,
            max_age_days: u32::MAX,
        }
    }

    /// Creation time before which an entry is expired.
    pub fn expiry_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        Duration::try_days(i64::from(self.max_age_days)).and_then(|age| now.checked_sub_signed(age))
    }
}
