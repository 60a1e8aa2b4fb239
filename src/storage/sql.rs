// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL source of truth for ads and their targeting conditions.
//!
//! Two tables, one row per ad and one row per condition:
//! ```sql
//! CREATE TABLE ads (
//!   id VARCHAR(36) PRIMARY KEY,
//!   title VARCHAR(255) NOT NULL,
//!   start_at BIGINT NOT NULL,   -- epoch millis
//!   end_at BIGINT NOT NULL      -- epoch millis
//! )
//! CREATE TABLE ad_conditions (
//!   ad_id VARCHAR(36) NOT NULL,
//!   position BIGINT NOT NULL,   -- order within the ad
//!   min_age BIGINT, max_age BIGINT,
//!   male, female, ios, android, web, jp, tw  -- 0/1 flags
//!   PRIMARY KEY (ad_id, position)
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! Times are stored as epoch millis and flags as integers because the `Any`
//! driver has no portable mapping for MySQL `DATETIME` or `TINYINT(1)`.
//! A dimension with no flag set decodes to an empty (wildcard) list.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::sync::Once;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::traits::{SourceStore, StorageError};
use crate::ad::Ad;
use crate::resilience::retry::{retry, RetryConfig};
use crate::targeting::{Condition, Country, Gender, Platform};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

#[inline]
fn backend_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

const SQLITE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS ads (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        start_at INTEGER NOT NULL,
        end_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_ads_window ON ads (start_at, end_at)",
    r#"
    CREATE TABLE IF NOT EXISTS ad_conditions (
        ad_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        min_age INTEGER NOT NULL DEFAULT 0,
        max_age INTEGER NOT NULL DEFAULT 0,
        male INTEGER NOT NULL DEFAULT 0,
        female INTEGER NOT NULL DEFAULT 0,
        ios INTEGER NOT NULL DEFAULT 0,
        android INTEGER NOT NULL DEFAULT 0,
        web INTEGER NOT NULL DEFAULT 0,
        jp INTEGER NOT NULL DEFAULT 0,
        tw INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (ad_id, position)
    )
    "#,
];

const MYSQL_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS ads (
        id VARCHAR(36) PRIMARY KEY,
        title VARCHAR(255) NOT NULL,
        start_at BIGINT NOT NULL,
        end_at BIGINT NOT NULL,
        INDEX idx_ads_window (start_at, end_at)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ad_conditions (
        ad_id VARCHAR(36) NOT NULL,
        position BIGINT NOT NULL,
        min_age BIGINT NOT NULL DEFAULT 0,
        max_age BIGINT NOT NULL DEFAULT 0,
        male BIGINT NOT NULL DEFAULT 0,
        female BIGINT NOT NULL DEFAULT 0,
        ios BIGINT NOT NULL DEFAULT 0,
        android BIGINT NOT NULL DEFAULT 0,
        web BIGINT NOT NULL DEFAULT 0,
        jp BIGINT NOT NULL DEFAULT 0,
        tw BIGINT NOT NULL DEFAULT 0,
        PRIMARY KEY (ad_id, position)
    )
    "#,
];

const SELECT_WITH_CONDITIONS: &str = r#"
    SELECT a.id, a.title, a.start_at, a.end_at,
           c.position, c.min_age, c.max_age,
           c.male, c.female, c.ios, c.android, c.web, c.jp, c.tw
    FROM ads a
    LEFT JOIN ad_conditions c ON c.ad_id = a.id
    WHERE a.start_at < ? AND a.end_at > ?
    ORDER BY a.start_at, a.id, c.position
"#;

const INSERT_AD: &str = "INSERT INTO ads (id, title, start_at, end_at) VALUES (?, ?, ?, ?)";

const INSERT_CONDITION: &str = "INSERT INTO ad_conditions \
    (ad_id, position, min_age, max_age, male, female, ios, android, web, jp, tw) \
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

/// One `ad_conditions` row in column form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ConditionRow {
    min_age: i64,
    max_age: i64,
    male: i64,
    female: i64,
    ios: i64,
    android: i64,
    web: i64,
    jp: i64,
    tw: i64,
}

#[inline]
fn flag(set: bool) -> i64 {
    i64::from(set)
}

impl ConditionRow {
    fn from_condition(condition: &Condition) -> Self {
        Self {
            min_age: i64::from(condition.age_start),
            max_age: i64::from(condition.age_end),
            male: flag(condition.gender.contains(&Gender::Male)),
            female: flag(condition.gender.contains(&Gender::Female)),
            ios: flag(condition.platform.contains(&Platform::Ios)),
            android: flag(condition.platform.contains(&Platform::Android)),
            web: flag(condition.platform.contains(&Platform::Web)),
            jp: flag(condition.country.contains(&Country::Japan)),
            tw: flag(condition.country.contains(&Country::Taiwan)),
        }
    }

    fn read(row: &AnyRow) -> Result<Self, StorageError> {
        let get = |column: &str| -> Result<i64, StorageError> { row.try_get(column).map_err(backend_err) };
        Ok(Self {
            min_age: get("min_age")?,
            max_age: get("max_age")?,
            male: get("male")?,
            female: get("female")?,
            ios: get("ios")?,
            android: get("android")?,
            web: get("web")?,
            jp: get("jp")?,
            tw: get("tw")?,
        })
    }

    fn into_condition(self) -> Result<Condition, StorageError> {
        let age = |value: i64| {
            u32::try_from(value).map_err(|_| StorageError::Serialization(format!("age out of range: {}", value)))
        };
        let country = Country::ALL
            .into_iter()
            .filter(|c| match c {
                Country::Taiwan => self.tw != 0,
                Country::Japan => self.jp != 0,
            })
            .collect();
        let gender = Gender::ALL
            .into_iter()
            .filter(|g| match g {
                Gender::Male => self.male != 0,
                Gender::Female => self.female != 0,
            })
            .collect();
        let platform = Platform::ALL
            .into_iter()
            .filter(|p| match p {
                Platform::Android => self.android != 0,
                Platform::Ios => self.ios != 0,
                Platform::Web => self.web != 0,
            })
            .collect();
        Ok(Condition {
            age_start: age(self.min_age)?,
            age_end: age(self.max_age)?,
            country,
            gender,
            platform,
        })
    }
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::Serialization(format!("timestamp out of range: {}", millis)))
}

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlStore {
    /// Create a new SQL store with startup-mode retry (fails fast if config is wrong).
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(backend_err)
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        debug!(sqlite = is_sqlite, "SQL source store ready");
        Ok(store)
    }

    /// Enable WAL mode for SQLite so readers don't block the write path.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements = if self.is_sqlite { SQLITE_SCHEMA } else { MYSQL_SCHEMA };

        for &sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(backend_err)
            })
            .await?;
        }

        Ok(())
    }

    pub async fn count_ads(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM ads")
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;
        let count: i64 = row.try_get("cnt").map_err(backend_err)?;
        Ok(count as u64)
    }

    /// Fold joined rows (ordered by ad, then position) into ads.
    fn assemble(rows: Vec<AnyRow>) -> Result<Vec<Ad>, StorageError> {
        let mut ads: Vec<Ad> = Vec::new();

        for row in rows {
            let id: String = row.try_get("id").map_err(backend_err)?;
            let id = Uuid::parse_str(&id)
                .map_err(|e| StorageError::Serialization(format!("bad ad id '{}': {}", id, e)))?;

            if ads.last().map(|ad| ad.id) != Some(id) {
                let title: String = row.try_get("title").map_err(backend_err)?;
                let start_at: i64 = row.try_get("start_at").map_err(backend_err)?;
                let end_at: i64 = row.try_get("end_at").map_err(backend_err)?;
                ads.push(Ad {
                    id,
                    title,
                    start_at: millis_to_datetime(start_at)?,
                    end_at: millis_to_datetime(end_at)?,
                    conditions: Vec::new(),
                });
            }

            // NULL position: the LEFT JOIN found no condition rows
            let position: Option<i64> = row.try_get("position").map_err(backend_err)?;
            if position.is_some() {
                let condition = ConditionRow::read(&row)?.into_condition()?;
                if let Some(ad) = ads.last_mut() {
                    ad.conditions.push(condition);
                }
            }
        }

        Ok(ads)
    }
}

#[async_trait]
impl SourceStore for SqlStore {
    async fn find_ads_with_time(
        &self,
        start_before: DateTime<Utc>,
        end_after: DateTime<Utc>,
    ) -> Result<Vec<Ad>, StorageError> {
        let rows = sqlx::query(SELECT_WITH_CONDITIONS)
            .bind(start_before.timestamp_millis())
            .bind(end_after.timestamp_millis())
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

        Self::assemble(rows)
    }

    async fn insert_ad(&self, ad: &Ad) -> Result<(), StorageError> {
        let id = ad.id.to_string();
        let mut tx = self.pool.begin().await.map_err(backend_err)?;

        sqlx::query(INSERT_AD)
            .bind(&id)
            .bind(&ad.title)
            .bind(ad.start_at.timestamp_millis())
            .bind(ad.end_at.timestamp_millis())
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;

        for (position, condition) in ad.conditions.iter().enumerate() {
            let row = ConditionRow::from_condition(condition);
            sqlx::query(INSERT_CONDITION)
                .bind(&id)
                .bind(position as i64)
                .bind(row.min_age)
                .bind(row.max_age)
                .bind(row.male)
                .bind(row.female)
                .bind(row.ios)
                .bind(row.android)
                .bind(row.web)
                .bind(row.jp)
                .bind(row.tw)
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;
        }

        // Dropping an uncommitted transaction rolls it back
        tx.commit().await.map_err(backend_err)?;
        debug!(ad_id = %ad.id, conditions = ad.conditions.len(), "Ad persisted");
        Ok(())
    }
}
