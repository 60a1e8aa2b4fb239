// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared sorted index of active ads.
//!
//! Each member is an ad serialized as JSON, scored by its end time in epoch
//! seconds. Ascending score order therefore means "ends soonest first",
//! which is the order pages are served in.
//!
//! Ads whose start lies inside the lookahead window are stored ahead of
//! time; reads filter out anything that has not started yet.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::ad::Ad;
use crate::metrics::{self, LatencyTimer};
use crate::storage::traits::{CacheBackend, StorageError};

pub struct SortedActiveIndex {
    backend: Arc<dyn CacheBackend>,
    key: String,
}

fn encode(ad: &Ad) -> Result<(i64, String), StorageError> {
    let member = serde_json::to_string(ad).map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok((ad.score(), member))
}

fn decode(member: &str) -> Result<Ad, StorageError> {
    serde_json::from_str(member).map_err(|e| StorageError::Serialization(e.to_string()))
}

impl SortedActiveIndex {
    pub fn new(backend: Arc<dyn CacheBackend>, key: impl Into<String>) -> Self {
        Self { backend, key: key.into() }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Insert one ad. Re-adding an identical ad is a no-op.
    pub async fn add(&self, ad: &Ad) -> Result<(), StorageError> {
        let _timer = LatencyTimer::new("index", "add");
        let member = encode(ad)?;
        self.backend
            .zadd(&self.key, std::slice::from_ref(&member))
            .await
            .inspect_err(|_| metrics::record_error("index", "add"))?;
        Ok(())
    }

    /// Insert many ads in one round trip. Returns how many were new.
    pub async fn add_batch(&self, ads: &[Ad]) -> Result<usize, StorageError> {
        if ads.is_empty() {
            return Ok(0);
        }
        let _timer = LatencyTimer::new("index", "add_batch");
        let members = ads.iter().map(encode).collect::<Result<Vec<_>, _>>()?;
        let added = self
            .backend
            .zadd(&self.key, &members)
            .await
            .inspect_err(|_| metrics::record_error("index", "add_batch"))?;
        debug!(key = %self.key, submitted = ads.len(), added, "Index batch added");
        Ok(added)
    }

    /// Ads at ranks `[skip, skip + count)` that have started by `now`.
    ///
    /// Entries in the window that have not started are dropped, so the
    /// result may be shorter than `count` even when more ads follow. Any
    /// member that fails to decode aborts the whole read.
    pub async fn range_by_offset(
        &self,
        skip: usize,
        count: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Ad>, StorageError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        // Past isize::MAX no member can exist; a wrapped index would count from the end
        let Ok(start) = isize::try_from(skip) else {
            return Ok(Vec::new());
        };
        let _timer = LatencyTimer::new("index", "range");
        let stop = isize::try_from(skip.saturating_add(count - 1)).unwrap_or(isize::MAX);

        let members = self
            .backend
            .zrange(&self.key, start, stop)
            .await
            .inspect_err(|_| metrics::record_error("index", "range"))?;

        let mut ads = Vec::with_capacity(members.len());
        for member in &members {
            let ad = decode(member).inspect_err(|e| {
                warn!(key = %self.key, error = %e, "Corrupt index entry");
                metrics::record_error("index", "decode");
            })?;
            if ad.has_started(now) {
                ads.push(ad);
            }
        }
        Ok(ads)
    }

    /// Remove every ad whose end (epoch seconds) is strictly before `cutoff`.
    pub async fn remove_expired(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let _timer = LatencyTimer::new("index", "remove_expired");
        let removed = self
            .backend
            .zremrange_below(&self.key, cutoff.timestamp())
            .await
            .inspect_err(|_| metrics::record_error("index", "remove_expired"))?;
        if removed > 0 {
            debug!(key = %self.key, removed, "Expired ads removed from index");
        }
        Ok(removed)
    }

    /// Largest start time among indexed ads, or the Unix epoch when empty.
    ///
    /// Scans every member.
    pub async fn max_start_at(&self) -> Result<DateTime<Utc>, StorageError> {
        let _timer = LatencyTimer::new("index", "max_start_at");
        let members = self
            .backend
            .zrange(&self.key, 0, -1)
            .await
            .inspect_err(|_| metrics::record_error("index", "max_start_at"))?;

        let mut watermark = DateTime::<Utc>::UNIX_EPOCH;
        for member in &members {
            let ad = decode(member)?;
            watermark = watermark.max(ad.start_at);
        }
        Ok(watermark)
    }

    /// Drop the whole index.
    pub async fn clear(&self) -> Result<(), StorageError> {
        self.backend.delete(std::slice::from_ref(&self.key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryBackend;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    const KEY: &str = "active_ads";

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn ad(title: &str, start_h: i64, end_h: i64) -> Ad {
        Ad {
            id: Uuid::new_v4(),
            title: title.into(),
            start_at: base() + Duration::hours(start_h),
            end_at: base() + Duration::hours(end_h),
            conditions: vec![],
        }
    }

    fn index() -> (Arc<MemoryBackend>, SortedActiveIndex) {
        let backend = Arc::new(MemoryBackend::new());
        let index = SortedActiveIndex::new(backend.clone(), KEY);
        (backend, index)
    }

    #[tokio::test]
    async fn test_range_orders_by_end_time() {
        let (_, index) = index();
        index
            .add_batch(&[ad("late", -1, 9), ad("soon", -1, 1), ad("mid", -1, 5)])
            .await
            .unwrap();

        let titles: Vec<_> = index
            .range_by_offset(0, 10, base())
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.title)
            .collect();
        assert_eq!(titles, vec!["soon", "mid", "late"]);
    }

    #[tokio::test]
    async fn test_range_window_excludes_upper_bound() {
        let (_, index) = index();
        let ads: Vec<Ad> = (0..5).map(|i| ad(&format!("ad{}", i), -1, i + 1)).collect();
        index.add_batch(&ads).await.unwrap();

        let page = index.range_by_offset(1, 2, base()).await.unwrap();
        let titles: Vec<_> = page.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(titles, vec!["ad1", "ad2"]);

        assert!(index.range_by_offset(0, 0, base()).await.unwrap().is_empty());
        assert!(index.range_by_offset(10, 5, base()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_range_far_past_end_is_empty() {
        let (_, index) = index();
        let ads: Vec<Ad> = (1..=3).map(|i| ad(&format!("ad{}", i), -1, i)).collect();
        index.add_batch(&ads).await.unwrap();

        assert!(index.range_by_offset(usize::MAX, 1, base()).await.unwrap().is_empty());
        assert!(index.range_by_offset(isize::MAX as usize + 1, 10, base()).await.unwrap().is_empty());

        // A huge count from a valid offset clamps rather than wrapping
        let tail = index.range_by_offset(1, usize::MAX, base()).await.unwrap();
        let titles: Vec<_> = tail.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(titles, vec!["ad2", "ad3"]);
    }

    #[tokio::test]
    async fn test_range_filters_not_yet_started() {
        let (_, index) = index();
        index.add_batch(&[ad("live", -1, 2), ad("upcoming", 1, 3)]).await.unwrap();

        let now_page = index.range_by_offset(0, 10, base()).await.unwrap();
        assert_eq!(now_page.len(), 1);
        assert_eq!(now_page[0].title, "live");

        let later_page = index.range_by_offset(0, 10, base() + Duration::hours(1)).await.unwrap();
        assert_eq!(later_page.len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_member_fails_read() {
        let (backend, index) = index();
        index.add(&ad("fine", -1, 2)).await.unwrap();
        backend.zadd_raw(KEY, base().timestamp(), "{not json");

        let result = index.range_by_offset(0, 10, base()).await;
        assert!(matches!(result, Err(StorageError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_add_batch_counts_new_members_only() {
        let (backend, index) = index();
        let a = ad("a", -1, 1);
        let b = ad("b", -1, 2);

        assert_eq!(index.add_batch(&[]).await.unwrap(), 0);
        assert_eq!(index.add_batch(&[a.clone(), b.clone()]).await.unwrap(), 2);
        assert_eq!(index.add_batch(&[a, b]).await.unwrap(), 0);
        assert_eq!(backend.zcard(KEY), 2);
    }

    #[tokio::test]
    async fn test_remove_expired_uses_strict_cutoff() {
        let (backend, index) = index();
        index
            .add_batch(&[ad("ended", -3, -1), ad("ends_now", -3, 0), ad("live", -3, 2)])
            .await
            .unwrap();

        let removed = index.remove_expired(base()).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(backend.zcard(KEY), 2);
    }

    #[tokio::test]
    async fn test_max_start_at() {
        let (_, index) = index();
        assert_eq!(index.max_start_at().await.unwrap(), DateTime::<Utc>::UNIX_EPOCH);

        index
            .add_batch(&[ad("a", -5, 9), ad("b", -2, 1), ad("c", -4, 3)])
            .await
            .unwrap();
        assert_eq!(index.max_start_at().await.unwrap(), base() - Duration::hours(2));
    }

    #[tokio::test]
    async fn test_clear() {
        let (backend, index) = index();
        index.add(&ad("a", -1, 1)).await.unwrap();
        index.clear().await.unwrap();
        assert_eq!(backend.zcard(KEY), 0);
    }
}
