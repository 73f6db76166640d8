//! Cache types.

use crate::ids::CacheEntryId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Separator between a semantic cache key and its uniqueness suffix.
pub const SUFFIX_SEPARATOR: char = '#';

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: CacheEntryId,
    /// Rendered key the entry was saved under.
    pub key: String,
    /// Distinguishes repeated saves of the same key.
    pub suffix: String,
    pub size_bytes: u64,
    pub checksum_sha256: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u32,
}

impl CacheEntry {
    /// Key under which the payload is physically stored.
    pub fn storage_key(&self) -> String {
        format!("{}{}{}", self.key, SUFFIX_SEPARATOR, self.suffix)
    }
}

/// A payload returned by a cache lookup.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub entry: CacheEntry,
    pub payload: Vec<u8>,
    /// Whether the requested key matched exactly rather than by prefix.
    pub exact: bool,
}

/// Outcome of a resolver restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Hit {
        /// Key that was asked for.
        requested: String,
        /// Key of the restored entry.
        matched: String,
        exact: bool,
        size_bytes: u64,
    },
    Miss {
        requested: Vec<String>,
    },
}

impl RestoreOutcome {
    pub fn is_hit(&self) -> bool {
        matches!(self, RestoreOutcome::Hit { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheEvictionReason {
    Expired,
    KeySurplus,
    Capacity,
    Manual,
}
