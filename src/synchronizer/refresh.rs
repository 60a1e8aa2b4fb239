// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Locked refresh-and-merge.
//!
//! ```text
//! acquire lock ─► purge ended ─► watermark ─► fetch lookahead window
//!      │                                             │
//!   (held elsewhere: Contended)          keep start > watermark
//!                                                    │
//!            release lock ◄── stamp refresh ◄── add batch
//! ```
//!
//! The lock is released on every path once acquired, including failures.

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ad::Ad;
use crate::metrics::{self, LatencyTimer};
use crate::storage::traits::StorageError;

use super::{ActiveAdSynchronizer, RefreshOutcome};

impl ActiveAdSynchronizer {
    /// Repopulate the shared index from the source store, if no other
    /// instance is already doing so.
    #[tracing::instrument(skip(self))]
    pub async fn refresh(&self) -> Result<RefreshOutcome, StorageError> {
        let _timer = LatencyTimer::new("refresh", "run");
        let token = Uuid::new_v4().to_string();

        let acquired = self
            .lock
            .try_acquire(&token, self.config.lock_ttl())
            .await
            .inspect_err(|_| metrics::record_refresh("failed"))?;
        if !acquired {
            debug!("Refresh already running on another instance");
            metrics::record_refresh(RefreshOutcome::Contended.label());
            return Ok(RefreshOutcome::Contended);
        }

        let result = self.refresh_locked().await;

        if let Err(e) = self.lock.release(&token).await {
            // TTL may have lapsed mid-refresh; the merge itself still stands
            warn!(error = %e, "Failed to release refresh lock");
        }

        match &result {
            Ok(outcome) => {
                info!(%outcome, "Active ad index refreshed");
                metrics::record_refresh(outcome.label());
            }
            Err(e) => {
                error!(error = %e, kind = e.kind(), "Active ad index refresh failed");
                metrics::record_refresh("failed");
                metrics::record_error("refresh", "run");
            }
        }
        result
    }

    async fn refresh_locked(&self) -> Result<RefreshOutcome, StorageError> {
        let now = self.clock.now();

        let expired_removed = self.index.remove_expired(now).await?;
        metrics::record_expired_removed(expired_removed);

        let watermark = self.index.max_start_at().await?;
        debug!(%watermark, "Index watermark");

        let candidates = self
            .source
            .find_ads_with_time(now + self.config.lookahead(), now)
            .await
            .inspect_err(|_| metrics::record_error("source", "find"))?;
        let fetched = candidates.len();

        let fresh: Vec<Ad> = candidates
            .into_iter()
            .filter(|ad| ad.start_at > watermark)
            .collect();

        let inserted = self.index.add_batch(&fresh).await?;
        if inserted != fresh.len() {
            warn!(submitted = fresh.len(), inserted, "Some refreshed ads were already indexed");
        }
        metrics::record_refresh_inserted(inserted);

        self.stamp.mark(now, self.config.last_refresh_ttl()).await?;

        debug!(fetched, skipped = fetched - fresh.len(), inserted, expired_removed, "Refresh merged");
        Ok(RefreshOutcome::Refreshed { inserted, expired_removed })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{ad_at, fixture};
    use super::*;
    use crate::clock::Clock;
    use chrono::Duration;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn test_refresh_inserts_then_is_idempotent() {
        let f = fixture();
        f.seed(&[ad_at(&f, "a", -1, 1), ad_at(&f, "b", -2, 3)]).await;

        let first = f.sync.refresh().await.unwrap();
        assert_eq!(first, RefreshOutcome::Refreshed { inserted: 2, expired_removed: 0 });

        let second = f.sync.refresh().await.unwrap();
        assert_eq!(second.inserted(), 0);
        assert_eq!(f.backend.zcard(&f.sync.config().index_key()), 2);
    }

    #[tokio::test]
    async fn test_refresh_contended_when_lock_held() {
        let f = fixture();
        f.seed(&[ad_at(&f, "a", -1, 1)]).await;

        let lock = crate::lock::RefreshLock::new(f.backend.clone(), f.sync.config().lock_key());
        assert!(lock.try_acquire("other-instance", StdDuration::from_secs(60)).await.unwrap());

        assert_eq!(f.sync.refresh().await.unwrap(), RefreshOutcome::Contended);
        assert_eq!(f.backend.zcard(&f.sync.config().index_key()), 0);
        assert!(!f.sync.check_valid().await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_releases_lock_on_failure() {
        let f = fixture();
        f.seed(&[ad_at(&f, "a", -1, 1)]).await;
        f.source.set_unavailable(true);

        assert!(matches!(f.sync.refresh().await, Err(StorageError::Backend(_))));

        f.source.set_unavailable(false);
        assert!(f.sync.refresh().await.unwrap().is_refreshed());
    }

    #[tokio::test]
    async fn test_refresh_purges_ended_and_prewarms_lookahead() {
        let f = fixture();
        f.seed(&[ad_at(&f, "live", -1, 1)]).await;
        f.sync.refresh().await.unwrap();

        // Outside the first refresh's lookahead, inside the second one's
        let upcoming = Ad {
            start_at: f.clock.now() + Duration::minutes(90),
            end_at: f.clock.now() + Duration::hours(5),
            ..ad_at(&f, "upcoming", 0, 5)
        };
        f.seed(&[upcoming]).await;

        f.clock.advance(Duration::hours(1) + Duration::minutes(1));
        let outcome = f.sync.refresh().await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Refreshed { inserted: 1, expired_removed: 1 });
    }
}
