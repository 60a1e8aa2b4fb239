// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ad::{Ad, ValidationError};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Lock is not held by this token")]
    LockNotHeld,
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Invalid ad: {0}")]
    Validation(#[from] ValidationError),
}

impl StorageError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Backend(_) => "backend",
            Self::Serialization(_) => "serialization",
            Self::LockNotHeld => "lock_not_held",
            Self::Timeout(_) => "timeout",
            Self::Validation(_) => "validation",
        }
    }
}

/// Primitives the shared cache must offer: an ordered set of
/// `(member, score)` pairs plus a plain key store with TTLs and a
/// conditional set used for the refresh lock.
///
/// Sorted-set ordering is ascending by score, ties broken by member bytes.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Insert members with their scores. Re-adding an existing member only
    /// updates its score. Returns how many members were new.
    async fn zadd(&self, key: &str, members: &[(i64, String)]) -> Result<usize, StorageError>;

    /// Members at ranks `start..=stop` (inclusive, zero based, ascending by
    /// score). Negative indices count from the end, `-1` being the last.
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StorageError>;

    /// Remove every member with a score strictly below `cutoff`.
    /// Returns how many were removed.
    async fn zremrange_below(&self, key: &str, cutoff: i64) -> Result<usize, StorageError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError>;

    /// Set `key` only if it is absent. Returns whether the value was set.
    async fn set_nx_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError>;

    /// Delete `key` only if it currently holds `expected`.
    /// Returns whether it was deleted.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StorageError>;

    async fn delete(&self, keys: &[String]) -> Result<(), StorageError>;
}

/// Relational source of truth for ads and their conditions.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Every ad with `start_at < start_before` and `end_at > end_after`,
    /// each with its full, ordered condition list.
    async fn find_ads_with_time(
        &self,
        start_before: DateTime<Utc>,
        end_after: DateTime<Utc>,
    ) -> Result<Vec<Ad>, StorageError>;

    /// Persist the ad header and every condition row atomically.
    async fn insert_ad(&self, ad: &Ad) -> Result<(), StorageError>;
}
