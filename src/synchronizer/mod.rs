// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Active ad synchronizer.
//!
//! The [`ActiveAdSynchronizer`] keeps the shared sorted index of active ads
//! consistent with the source store, cache-aside:
//!
//! ```text
//!             get_page(skip, count)
//!                      │
//!               index fresh? ──yes──► range from index
//!                      │no
//!        refresh (best effort, locked)
//!                      │
//!           read window from source
//! ```
//!
//! A stale read always answers from the source store, whatever the refresh
//! did, so the cache is never a correctness dependency for the request that
//! noticed the staleness.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ad_sync_engine::{ActiveAdSynchronizer, InMemorySourceStore, MemoryBackend, SyncConfig, SystemClock};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let sync = ActiveAdSynchronizer::new(
//!     SyncConfig::default(),
//!     Arc::new(MemoryBackend::new()),
//!     Arc::new(InMemorySourceStore::new()),
//!     Arc::new(SystemClock),
//! );
//!
//! let page = sync.get_page(0, 10).await.expect("page read");
//! assert!(page.ads.is_empty() && page.end);
//! # }
//! ```

mod types;
mod refresh;
mod read;

pub use types::RefreshOutcome;

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::ad::AdDraft;
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::freshness::RefreshStamp;
use crate::index::SortedActiveIndex;
use crate::lock::RefreshLock;
use crate::metrics;
use crate::storage::redis::RedisBackend;
use crate::storage::sql::SqlStore;
use crate::storage::traits::{CacheBackend, SourceStore, StorageError};

/// Cache-aside coordinator for active ads.
///
/// Holds no process-local mutable state: every instance sharing the same
/// cache backend cooperates through the refresh lock and stamp.
pub struct ActiveAdSynchronizer {
    pub(super) config: SyncConfig,
    pub(super) index: SortedActiveIndex,
    pub(super) lock: RefreshLock,
    pub(super) stamp: RefreshStamp,
    pub(super) source: Arc<dyn SourceStore>,
    pub(super) clock: Arc<dyn Clock>,
}

impl ActiveAdSynchronizer {
    pub fn new(
        config: SyncConfig,
        backend: Arc<dyn CacheBackend>,
        source: Arc<dyn SourceStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let index = SortedActiveIndex::new(backend.clone(), config.index_key());
        let lock = RefreshLock::new(backend.clone(), config.lock_key());
        let stamp = RefreshStamp::new(backend, config.last_refresh_key());

        Self { config, index, lock, stamp, source, clock }
    }

    /// Connect to Redis and the SQL store named in `config`.
    ///
    /// Both connections go through the startup retry schedule; the SQL
    /// schema is created if missing.
    pub async fn connect(config: SyncConfig) -> Result<Self, StorageError> {
        let redis_url = config
            .redis_url
            .clone()
            .ok_or_else(|| StorageError::Backend("redis_url is not configured".into()))?;
        let sql_url = config
            .sql_url
            .clone()
            .ok_or_else(|| StorageError::Backend("sql_url is not configured".into()))?;

        let backend = RedisBackend::connect(&redis_url).await?;
        let source = SqlStore::new(&sql_url, config.sql_max_connections).await?;
        info!(index_key = %config.index_key(), "Ad synchronizer connected");

        Ok(Self::new(config, Arc::new(backend), Arc::new(source), Arc::new(SystemClock)))
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn index(&self) -> &SortedActiveIndex {
        &self.index
    }

    /// Whether the index was refreshed within the staleness interval.
    pub async fn check_valid(&self) -> Result<bool, StorageError> {
        self.stamp
            .is_valid(self.clock.now(), self.config.staleness_interval())
            .await
    }

    /// Validate and persist a new ad, returning its identifier.
    ///
    /// With `write_through` on, an ad that has already started is also put
    /// in the index straight away; a cache failure there is only logged.
    #[tracing::instrument(skip(self, draft), fields(title = %draft.title))]
    pub async fn create_ad(&self, draft: AdDraft) -> Result<Uuid, StorageError> {
        let now = self.clock.now();
        draft
            .validate(now, self.config.max_title_len)
            .inspect_err(|_| metrics::record_error("write", "validate"))?;

        let ad = draft.into_ad();
        self.source
            .insert_ad(&ad)
            .await
            .inspect_err(|_| metrics::record_error("write", "insert"))?;

        if self.config.write_through && ad.has_started(now) {
            if let Err(e) = self.index.add(&ad).await {
                warn!(ad_id = %ad.id, error = %e, "Write-through to index failed");
            }
        }

        info!(ad_id = %ad.id, "Ad created");
        Ok(ad.id)
    }

    /// Drop the index and the refresh stamp; the next read refreshes.
    pub async fn reset_cache(&self) -> Result<(), StorageError> {
        self.index.clear().await?;
        self.stamp.clear().await?;
        info!("Active ad cache reset");
        Ok(())
    }
}
