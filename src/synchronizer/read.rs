// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read paths: paged reads, deadline-bounded reads and targeted reads.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::ad::{AdSummary, MatchedPage, Page};
use crate::metrics::{self, LatencyTimer};
use crate::storage::traits::StorageError;
use crate::targeting::ConditionParams;

use super::ActiveAdSynchronizer;

impl ActiveAdSynchronizer {
    /// Active ads at ranks `[skip, skip + count)`, ascending by end time.
    ///
    /// Served from the index while it is fresh. When stale (or when the
    /// staleness check itself fails) a refresh is attempted and the page is
    /// read from the source store regardless of how the refresh went.
    #[tracing::instrument(skip(self))]
    pub async fn get_page(&self, skip: usize, count: usize) -> Result<Page, StorageError> {
        let _timer = LatencyTimer::new("read", "page");
        let now = self.clock.now();

        let valid = match self.stamp.is_valid(now, self.config.staleness_interval()).await {
            Ok(valid) => valid,
            Err(e) => {
                warn!(error = %e, "Staleness check failed, treating index as stale");
                metrics::record_error("stamp", "check");
                false
            }
        };

        if valid {
            let mut ads = self.index.range_by_offset(skip, count, now).await?;
            // The index may hold lookahead entries
            ads.retain(|ad| ad.has_started(now));
            metrics::record_page_read("cache");
            let end = ads.len() < count;
            return Ok(Page { ads, end });
        }

        match self.refresh().await {
            Ok(outcome) => debug!(%outcome, "Refresh on stale read"),
            Err(e) => warn!(error = %e, "Refresh on stale read failed, serving from source"),
        }

        let page = self.read_from_source(skip, count, now).await?;
        metrics::record_page_read("store");
        Ok(page)
    }

    /// [`get_page`](Self::get_page) bounded by `deadline`.
    ///
    /// On expiry the in-flight cache or store calls are dropped and
    /// [`StorageError::Timeout`] is returned. Work already committed to the
    /// cache by a refresh stays.
    pub async fn get_page_within(
        &self,
        skip: usize,
        count: usize,
        deadline: Duration,
    ) -> Result<Page, StorageError> {
        match tokio::time::timeout(deadline, self.get_page(skip, count)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(skip, count, ?deadline, "Page read timed out");
                metrics::record_error("read", "timeout");
                Err(StorageError::Timeout(deadline))
            }
        }
    }

    /// Collect up to `limit` ads that should be shown for `params`,
    /// scanning forward from rank `offset`.
    ///
    /// Stops early when a page reports the end. The returned cursor is the
    /// rank to resume from.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_matched(
        &self,
        offset: usize,
        limit: usize,
        params: ConditionParams,
    ) -> Result<MatchedPage, StorageError> {
        let mut cursor = offset;
        let mut items = Vec::new();
        let mut end = false;

        while items.len() < limit {
            // Never request more than can still be kept, so the cursor never
            // skips past an unreturned match
            let want = limit - items.len();
            let page = self.get_page(cursor, want).await?;
            cursor = cursor.saturating_add(want);

            let now = self.clock.now();
            items.extend(
                page.ads
                    .iter()
                    .filter(|ad| ad.should_show(&params, now))
                    .map(AdSummary::from),
            );

            if page.end {
                end = true;
                break;
            }
        }

        debug!(matched = items.len(), cursor, end, "Matched page collected");
        Ok(MatchedPage { cursor, items, end })
    }

    async fn read_from_source(
        &self,
        skip: usize,
        count: usize,
        now: DateTime<Utc>,
    ) -> Result<Page, StorageError> {
        let mut ads = self
            .source
            .find_ads_with_time(now, now)
            .await
            .inspect_err(|_| metrics::record_error("source", "find"))?;
        ads.sort_by(|a, b| a.end_at.cmp(&b.end_at).then_with(|| a.id.cmp(&b.id)));

        let ads: Vec<_> = ads.into_iter().skip(skip).take(count).collect();
        let end = ads.len() < count;
        Ok(Page { ads, end })
    }
}
