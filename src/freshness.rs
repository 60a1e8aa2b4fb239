// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Last successful refresh time, shared through the cache.
//!
//! Stored as an RFC 3339 string with nanosecond precision under its own key
//! and TTL. A missing key reads as "never refreshed", which is always stale.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::storage::traits::{CacheBackend, StorageError};

pub struct RefreshStamp {
    backend: Arc<dyn CacheBackend>,
    key: String,
}

impl RefreshStamp {
    pub fn new(backend: Arc<dyn CacheBackend>, key: impl Into<String>) -> Self {
        Self { backend, key: key.into() }
    }

    pub async fn last_refresh(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let Some(raw) = self.backend.get(&self.key).await? else {
            return Ok(None);
        };
        let parsed = DateTime::parse_from_rfc3339(&raw)
            .map_err(|e| StorageError::Serialization(format!("bad refresh stamp '{}': {}", raw, e)))?;
        Ok(Some(parsed.with_timezone(&Utc)))
    }

    /// Record a successful refresh at `at`. The key expires after `ttl`.
    pub async fn mark(&self, at: DateTime<Utc>, ttl: Duration) -> Result<(), StorageError> {
        let value = at.to_rfc3339_opts(SecondsFormat::Nanos, true);
        self.backend.set_with_ttl(&self.key, &value, ttl).await
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        self.backend.delete(std::slice::from_ref(&self.key)).await
    }

    /// True iff the last refresh happened less than `interval` before `now`.
    pub async fn is_valid(&self, now: DateTime<Utc>, interval: chrono::Duration) -> Result<bool, StorageError> {
        Ok(self
            .last_refresh()
            .await?
            .is_some_and(|last| now.signed_duration_since(last) < interval))
    }
}
