//! Sorted index of cache entries.
//!
//! Entries are grouped by rendered key in a `BTreeMap`, so a prefix lookup
//! is a range scan starting at the prefix rather than a walk over every key.

use crate::retention::RetentionPolicy;
use chrono::{DateTime, Utc};
use kiln_core::CacheEntryId;
use kiln_core::cache::{CacheEntry, CacheEvictionReason};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Default)]
pub struct CacheIndex {
    /// Key -> saves of that key, oldest first.
    entries: BTreeMap<String, Vec<CacheEntry>>,
}

fn recency(entry: &CacheEntry) -> (DateTime<Utc>, &str) {
    (entry.created_at, entry.suffix.as_str())
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: CacheEntry) {
        let saves = self.entries.entry(entry.key.clone()).or_default();
        saves.push(entry);
        saves.sort_by(|a, b| recency(a).cmp(&recency(b)));
    }

    /// Most recent save of exactly `key`.
    pub fn latest_exact(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key).and_then(|saves| saves.last())
    }

    /// Most recent save among all keys starting with `prefix`.
    pub fn latest_with_prefix(&self, prefix: &str) -> Option<&CacheEntry> {
        self.entries
            .range::<str, _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter_map(|(_, saves)| saves.last())
            .max_by(|a, b| recency(a).cmp(&recency(b)))
    }

    pub fn get(&self, id: &CacheEntryId) -> Option<&CacheEntry> {
        self.iter().find(|e| &e.id == id)
    }

    /// Record a read of an entry.
    pub fn touch(&mut self, id: &CacheEntryId, now: DateTime<Utc>) -> Option<CacheEntry> {
        let entry = self
            .entries
            .values_mut()
            .flat_map(|saves| saves.iter_mut())
            .find(|e| &e.id == id)?;
        entry.last_accessed_at = now;
        entry.access_count = entry.access_count.saturating_add(1);
        Some(entry.clone())
    }

    pub fn remove(&mut self, id: &CacheEntryId) -> Option<CacheEntry> {
        let (key, pos) = self.entries.iter().find_map(|(key, saves)| {
            saves
                .iter()
                .position(|e| &e.id == id)
                .map(|pos| (key.clone(), pos))
        })?;
        let saves = self.entries.get_mut(&key)?;
        let removed = saves.remove(pos);
        if saves.is_empty() {
            self.entries.remove(&key);
        }
        Some(removed)
    }

    /// All entries, ordered by key then age.
    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values().flatten()
    }

    /// Entries whose key starts with `prefix`, or all entries.
    pub fn list(&self, prefix: Option<&str>) -> Vec<CacheEntry> {
        match prefix {
            Some(prefix) => self
                .entries
                .range::<str, _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
                .take_while(|(key, _)| key.starts_with(prefix))
                .flat_map(|(_, saves)| saves.iter().cloned())
                .collect(),
            None => self.iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.iter().map(|e| e.size_bytes).sum()
    }

    /// Remove entries violating `policy`, returning them with the reason.
    ///
    /// Order: expired entries, then per-key surplus (oldest first), then
    /// least recently accessed entries until the byte cap holds.
    pub fn evict(
        &mut self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Vec<(CacheEntry, CacheEvictionReason)> {
        let mut doomed: Vec<(CacheEntryId, CacheEvictionReason)> = Vec::new();
        let mut marked = HashSet::new();

        if let Some(cutoff) = policy.expiry_cutoff(now) {
            for entry in self.iter().filter(|e| e.created_at < cutoff) {
                marked.insert(entry.id);
                doomed.push((entry.id, CacheEvictionReason::Expired));
            }
        }

        for saves in self.entries.values() {
            let live: Vec<&CacheEntry> = saves.iter().filter(|e| !marked.contains(&e.id)).collect();
            let surplus = live.len().saturating_sub(policy.max_entries_per_key);
            for entry in live.into_iter().take(surplus) {
                marked.insert(entry.id);
                doomed.push((entry.id, CacheEvictionReason::KeySurplus));
            }
        }

        let mut remaining: Vec<&CacheEntry> = self.iter().filter(|e| !marked.contains(&e.id)).collect();
        let mut total: u64 = remaining.iter().map(|e| e.size_bytes).sum();
        if total > policy.max_total_bytes {
            remaining.sort_by(|a, b| {
                (a.last_accessed_at, a.created_at).cmp(&(b.last_accessed_at, b.created_at))
            });
            for entry in remaining {
                if total <= policy.max_total_bytes {
                    break;
                }
                total -= entry.size_bytes;
                doomed.push((entry.id, CacheEvictionReason::Capacity));
            }
        }

        doomed
            .into_iter()
            .filter_map(|(id, reason)| self.remove(&id).map(|entry| (entry, reason)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn entry(key: &str, size: u64, age_minutes: i64) -> CacheEntry {
        let created = Utc::now() - Duration::minutes(age_minutes);
        CacheEntry {
            id: CacheEntryId::new(),
            key: key.to_string(),
            suffix: format!("{}-0000", created.timestamp_millis()),
            size_bytes: size,
            checksum_sha256: String::new(),
            created_at: created,
            last_accessed_at: created,
            access_count: 0,
        }
    }

    #[test]
    fn test_prefix_lookup_returns_most_recent() {
        let mut index = CacheIndex::new();
        index.insert(entry("v1-cargo-x86_64-aaa", 10, 30));
        index.insert(entry("v1-cargo-x86_64-bbb", 10, 5));
        index.insert(entry("v1-cargo-aarch64-ccc", 10, 1));
        index.insert(entry("v1-cargo-x86_640", 10, 0));

        let hit = index.latest_with_prefix("v1-cargo-x86_64-").unwrap();
        assert_eq!(hit.key, "v1-cargo-x86_64-bbb");
        assert!(index.latest_with_prefix("v2-").is_none());
        assert_eq!(index.list(Some("v1-cargo-x86_64-")).len(), 2);
    }

    #[test]
    fn test_exact_lookup_prefers_latest_save() {
        let mut index = CacheIndex::new();
        let old = entry("deps", 1, 10);
        let new = entry("deps", 2, 1);
        index.insert(new.clone());
        index.insert(old);
        assert_eq!(index.latest_exact("deps").unwrap().id, new.id);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_evict_surplus_and_expired() {
        let mut index = CacheIndex::new();
        let ancient = entry("deps", 1, 60 * 24 * 30);
        index.insert(ancient.clone());
        for age in [40, 30, 20, 10] {
            index.insert(entry("deps", 1, age));
        }

        let evicted = index.evict(&RetentionPolicy::default(), Utc::now());
        let reasons: Vec<CacheEvictionReason> = evicted.iter().map(|(_, r)| *r).collect();
        assert_eq!(
            reasons,
            vec![CacheEvictionReason::Expired, CacheEvictionReason::KeySurplus]
        );
        assert_eq!(evicted[0].0.id, ancient.id);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_evict_capacity_least_recently_used() {
        let mut index = CacheIndex::new();
        let cold = entry("a", 60, 10);
        let warm = entry("b", 60, 20);
        index.insert(cold.clone());
        index.insert(warm.clone());
        index.touch(&warm.id, Utc::now());

        let policy = RetentionPolicy {
            max_total_bytes: 100,
            ..RetentionPolicy::default()
        };
        let evicted = index.evict(&policy, Utc::now());
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0.id, cold.id);
        assert_eq!(evicted[0].1, CacheEvictionReason::Capacity);
        assert_eq!(index.total_bytes(), 60);
    }
}
