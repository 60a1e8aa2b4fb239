// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backends.
//!
//! - [`traits`]: the [`CacheBackend`](traits::CacheBackend) and
//!   [`SourceStore`](traits::SourceStore) seams plus [`StorageError`](traits::StorageError)
//! - [`redis`]: shared cache over a Redis connection manager
//! - [`sql`]: MySQL/SQLite source of truth via the sqlx `Any` driver
//! - [`memory`]: in-process stand-ins for both seams

pub mod traits;
pub mod redis;
pub mod sql;
pub mod memory;
