// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis implementation of the cache primitives.
//!
//! | Primitive | Redis command |
//! |-----------|---------------|
//! | `zadd` | `ZADD key score member [score member ...]` |
//! | `zrange` | `ZRANGE key start stop` |
//! | `zremrange_below` | `ZREMRANGEBYSCORE key -inf (cutoff` |
//! | `set_with_ttl` | `SET key value PX ttl` |
//! | `set_nx_with_ttl` | `SET key value NX PX ttl` |
//! | `delete_if_equals` | Lua: `GET` + compare + `DEL` in one script |
//!
//! The compare-and-delete runs server-side so a slow holder whose TTL has
//! already lapsed can never delete a lock that now belongs to someone else.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::debug;

use super::traits::{CacheBackend, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

#[inline]
fn backend_err(e: redis::RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}

#[inline]
fn ttl_millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by Redis
    (ttl.as_millis() as u64).max(1)
}

#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
    compare_and_delete: Script,
}

impl RedisBackend {
    /// Connect with the startup retry schedule (fails fast on a bad URL).
    pub async fn connect(connection_string: &str) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(backend_err)?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(backend_err)?;

        debug!("Redis cache backend connected");
        Ok(Self::from_connection(connection))
    }

    /// Wrap an existing connection manager (shared with other components).
    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
        }
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn zadd(&self, key: &str, members: &[(i64, String)]) -> Result<usize, StorageError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        let added: usize = conn.zadd_multiple(key, members).await.map_err(backend_err)?;
        Ok(added)
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StorageError> {
        let mut conn = self.connection.clone();
        let members: Vec<String> = conn.zrange(key, start, stop).await.map_err(backend_err)?;
        Ok(members)
    }

    async fn zremrange_below(&self, key: &str, cutoff: i64) -> Result<usize, StorageError> {
        let mut conn = self.connection.clone();
        // "(" makes the upper bound exclusive
        let removed: usize = conn
            .zrembyscore(key, "-inf", format!("({}", cutoff))
            .await
            .map_err(backend_err)?;
        Ok(removed)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(key).await.map_err(backend_err)?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn set_nx_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        // Replies "OK" when set, nil when the key already exists
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(deleted > 0)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StorageError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let _: () = conn.del(keys).await.map_err(backend_err)?;
        Ok(())
    }
}
