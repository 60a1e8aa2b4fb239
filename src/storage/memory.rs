// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process implementations of the storage seams.
//!
//! [`MemoryBackend`] reproduces the Redis semantics the engine relies on
//! (score-ordered sets, TTL keys, set-if-absent, compare-and-delete) so a
//! single process, a test, or a demo can run without a Redis server.
//! [`InMemorySourceStore`] stands in for the SQL source of truth.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use super::traits::{CacheBackend, SourceStore, StorageError};
use crate::ad::Ad;

struct KvEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: Some(Instant::now() + ttl),
        }
    }

    #[inline]
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
struct SortedSet {
    ordered: BTreeSet<(i64, String)>,
    scores: HashMap<String, i64>,
}

impl SortedSet {
    /// Returns true if the member is new.
    fn insert(&mut self, score: i64, member: &str) -> bool {
        match self.scores.insert(member.to_string(), score) {
            Some(old) => {
                self.ordered.remove(&(old, member.to_string()));
                self.ordered.insert((score, member.to_string()));
                false
            }
            None => {
                self.ordered.insert((score, member.to_string()));
                true
            }
        }
    }

    fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Resolve Redis-style inclusive, possibly negative indices.
    fn resolve_range(&self, start: isize, stop: isize) -> Option<(usize, usize)> {
        let len = self.len() as isize;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if len == 0 || start > stop || start >= len {
            return None;
        }
        Some((start as usize, stop as usize))
    }
}

/// In-process cache backend.
#[derive(Default)]
pub struct MemoryBackend {
    kv: DashMap<String, KvEntry>,
    sets: RwLock<HashMap<String, SortedSet>>,
    fail: AtomicBool,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a backend error (simulates an
    /// unreachable cache).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.fail.store(unavailable, Ordering::SeqCst);
    }

    /// Number of members in a sorted set.
    #[must_use]
    pub fn zcard(&self, key: &str) -> usize {
        self.sets.read().get(key).map_or(0, SortedSet::len)
    }

    /// Insert a raw member, bypassing serialization (for corruption tests).
    pub fn zadd_raw(&self, key: &str, score: i64, member: &str) {
        self.sets.write().entry(key.to_string()).or_default().insert(score, member);
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(StorageError::Backend("cache backend unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn zadd(&self, key: &str, members: &[(i64, String)]) -> Result<usize, StorageError> {
        self.check_available()?;
        if members.is_empty() {
            return Ok(0);
        }
        let mut sets = self.sets.write();
        let set = sets.entry(key.to_string()).or_default();
        Ok(members
            .iter()
            .filter(|(score, member)| set.insert(*score, member))
            .count())
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StorageError> {
        self.check_available()?;
        let sets = self.sets.read();
        let Some(set) = sets.get(key) else {
            return Ok(Vec::new());
        };
        let Some((start, stop)) = set.resolve_range(start, stop) else {
            return Ok(Vec::new());
        };
        Ok(set
            .ordered
            .iter()
            .skip(start)
            .take(stop - start + 1)
            .map(|(_, member)| member.clone())
            .collect())
    }

    async fn zremrange_below(&self, key: &str, cutoff: i64) -> Result<usize, StorageError> {
        self.check_available()?;
        let mut sets = self.sets.write();
        let Some(set) = sets.get_mut(key) else {
            return Ok(0);
        };
        let expired: Vec<(i64, String)> = set
            .ordered
            .iter()
            .take_while(|(score, _)| *score < cutoff)
            .cloned()
            .collect();
        for entry in &expired {
            set.ordered.remove(entry);
            set.scores.remove(&entry.1);
        }
        Ok(expired.len())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check_available()?;
        match self.kv.get(key) {
            Some(entry) if !entry.is_expired() => Ok(Some(entry.value.clone())),
            _ => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        self.check_available()?;
        self.kv.insert(key.to_string(), KvEntry::new(value, ttl));
        Ok(())
    }

    async fn set_nx_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        self.check_available()?;
        // The entry guard holds the shard lock, making check-and-set atomic
        match self.kv.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(KvEntry::new(value, ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(KvEntry::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StorageError> {
        self.check_available()?;
        let removed = self
            .kv
            .remove_if(key, |_, entry| !entry.is_expired() && entry.value == expected);
        Ok(removed.is_some())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StorageError> {
        self.check_available()?;
        let mut sets = self.sets.write();
        for key in keys {
            self.kv.remove(key);
            sets.remove(key);
        }
        Ok(())
    }
}

/// In-process source of truth.
#[derive(Default)]
pub struct InMemorySourceStore {
    ads: DashMap<Uuid, Ad>,
    fail: AtomicBool,
}

impl InMemorySourceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ads.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ads.is_empty()
    }

    /// Make every subsequent call fail with a backend error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.fail.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(StorageError::Backend("source store unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SourceStore for InMemorySourceStore {
    async fn find_ads_with_time(
        &self,
        start_before: DateTime<Utc>,
        end_after: DateTime<Utc>,
    ) -> Result<Vec<Ad>, StorageError> {
        self.check_available()?;
        let mut ads: Vec<Ad> = self
            .ads
            .iter()
            .filter(|ad| ad.start_at < start_before && ad.end_at > end_after)
            .map(|ad| ad.value().clone())
            .collect();
        ads.sort_by_key(|ad| ad.start_at);
        Ok(ads)
    }

    async fn insert_ad(&self, ad: &Ad) -> Result<(), StorageError> {
        self.check_available()?;
        match self.ads.entry(ad.id) {
            Entry::Occupied(_) => Err(StorageError::Backend(format!("ad {} already exists", ad.id))),
            Entry::Vacant(vacant) => {
                vacant.insert(ad.clone());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;

    const KEY: &str = "active_ads";

    fn members(pairs: &[(i64, &str)]) -> Vec<(i64, String)> {
        pairs.iter().map(|(s, m)| (*s, m.to_string())).collect()
    }

    #[tokio::test]
    async fn test_zadd_orders_by_score_then_member() {
        let backend = MemoryBackend::new();
        backend.zadd(KEY, &members(&[(30, "c"), (10, "b"), (10, "a"), (20, "d")])).await.unwrap();

        let all = backend.zrange(KEY, 0, -1).await.unwrap();
        assert_eq!(all, vec!["a", "b", "d", "c"]);
    }

    #[tokio::test]
    async fn test_zadd_is_idempotent_per_member() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.zadd(KEY, &members(&[(1, "x"), (2, "y")])).await.unwrap(), 2);
        assert_eq!(backend.zadd(KEY, &members(&[(1, "x")])).await.unwrap(), 0);
        assert_eq!(backend.zcard(KEY), 2);

        // Re-adding with a new score moves the member
        backend.zadd(KEY, &members(&[(5, "x")])).await.unwrap();
        assert_eq!(backend.zrange(KEY, 0, -1).await.unwrap(), vec!["y", "x"]);
    }

    #[tokio::test]
    async fn test_zrange_windows() {
        let backend = MemoryBackend::new();
        backend.zadd(KEY, &members(&[(1, "a"), (2, "b"), (3, "c"), (4, "d")])).await.unwrap();

        assert_eq!(backend.zrange(KEY, 1, 2).await.unwrap(), vec!["b", "c"]);
        assert_eq!(backend.zrange(KEY, 2, 100).await.unwrap(), vec!["c", "d"]);
        assert_eq!(backend.zrange(KEY, -2, -1).await.unwrap(), vec!["c", "d"]);
        assert!(backend.zrange(KEY, 10, 20).await.unwrap().is_empty());
        assert!(backend.zrange(KEY, 3, 1).await.unwrap().is_empty());
        assert!(backend.zrange("missing", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zremrange_below_is_exclusive() {
        let backend = MemoryBackend::new();
        backend.zadd(KEY, &members(&[(10, "a"), (20, "b"), (30, "c")])).await.unwrap();

        assert_eq!(backend.zremrange_below(KEY, 20).await.unwrap(), 1);
        assert_eq!(backend.zrange(KEY, 0, -1).await.unwrap(), vec!["b", "c"]);

        // Removed members can be re-added as new
        assert_eq!(backend.zadd(KEY, &members(&[(10, "a")])).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_nx_only_when_absent() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(60);

        assert!(backend.set_nx_with_ttl("lock", "t1", ttl).await.unwrap());
        assert!(!backend.set_nx_with_ttl("lock", "t2", ttl).await.unwrap());
        assert_eq!(backend.get("lock").await.unwrap().as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_ttl_expiry_frees_key() {
        let backend = MemoryBackend::new();
        backend.set_nx_with_ttl("lock", "t1", Duration::from_millis(20)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(backend.get("lock").await.unwrap(), None);
        assert!(backend.set_nx_with_ttl("lock", "t2", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_if_equals() {
        let backend = MemoryBackend::new();
        backend.set_with_ttl("lock", "owner", Duration::from_secs(60)).await.unwrap();

        assert!(!backend.delete_if_equals("lock", "intruder").await.unwrap());
        assert_eq!(backend.get("lock").await.unwrap().as_deref(), Some("owner"));

        assert!(backend.delete_if_equals("lock", "owner").await.unwrap());
        assert_eq!(backend.get("lock").await.unwrap(), None);

        assert!(!backend.delete_if_equals("lock", "owner").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_clears_sets_and_keys() {
        let backend = MemoryBackend::new();
        backend.zadd(KEY, &members(&[(1, "a")])).await.unwrap();
        backend.set_with_ttl("last_update", "x", Duration::from_secs(60)).await.unwrap();

        backend.delete(&[KEY.to_string(), "last_update".to_string()]).await.unwrap();

        assert_eq!(backend.zcard(KEY), 0);
        assert_eq!(backend.get("last_update").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unavailable_backend_errors() {
        let backend = MemoryBackend::new();
        backend.set_unavailable(true);
        assert!(matches!(backend.get("k").await, Err(StorageError::Backend(_))));
        assert!(matches!(backend.zrange(KEY, 0, -1).await, Err(StorageError::Backend(_))));

        backend.set_unavailable(false);
        assert!(backend.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_set_nx_single_winner() {
        let backend = Arc::new(MemoryBackend::new());
        let mut handles = vec![];

        for i in 0..16 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend
                    .set_nx_with_ttl("lock", &format!("token-{}", i), Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    fn ad(start_offset_h: i64, end_offset_h: i64) -> Ad {
        let now = Utc::now();
        Ad {
            id: Uuid::new_v4(),
            title: format!("ad {}..{}", start_offset_h, end_offset_h),
            start_at: now + ChronoDuration::hours(start_offset_h),
            end_at: now + ChronoDuration::hours(end_offset_h),
            conditions: vec![],
        }
    }

    #[tokio::test]
    async fn test_source_store_time_filter() {
        let store = InMemorySourceStore::new();
        let live = ad(-1, 1);
        let ended = ad(-2, -1);
        let future = ad(5, 6);
        for a in [&live, &ended, &future] {
            store.insert_ad(a).await.unwrap();
        }

        let now = Utc::now();
        let found = store.find_ads_with_time(now, now).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, live.id);

        let with_lookahead = store
            .find_ads_with_time(now + ChronoDuration::hours(10), now)
            .await
            .unwrap();
        assert_eq!(with_lookahead.len(), 2);
        assert!(with_lookahead[0].start_at <= with_lookahead[1].start_at);
    }

    #[tokio::test]
    async fn test_source_store_rejects_duplicate_id() {
        let store = InMemorySourceStore::new();
        let a = ad(-1, 1);
        store.insert_ad(&a).await.unwrap();
        assert!(store.insert_ad(&a).await.is_err());
        assert_eq!(store.len(), 1);
    }
}
