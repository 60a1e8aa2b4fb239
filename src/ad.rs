// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ad data structure.
//!
//! The [`Ad`] is the unit that flows between the SQL source of truth and the
//! shared active index. It is immutable once created: the write path builds
//! it from an [`AdDraft`] and nothing updates it afterwards.
//!
//! # Example
//!
//! ```
//! use ad_sync_engine::{AdDraft, Condition, Country};
//! use chrono::{Duration, Utc};
//!
//! let now = Utc::now();
//! let draft = AdDraft {
//!     title: "Spring sale".into(),
//!     start_at: now - Duration::hours(1),
//!     end_at: now + Duration::days(7),
//!     conditions: vec![Condition {
//!         age_start: 18,
//!         age_end: 35,
//!         country: vec![Country::Taiwan],
//!         ..Default::default()
//!     }],
//! };
//!
//! assert!(draft.validate(now, 100).is_ok());
//! let ad = draft.into_ad();
//! assert_eq!(ad.title, "Spring sale");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::targeting::Condition;

/// A time-bounded advertisement with its targeting conditions.
///
/// Invariant: `start_at < end_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ad {
    pub id: Uuid,
    pub title: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    /// Ordered; owned exclusively by this ad
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Ad {
    /// Sorted-set score: end time in epoch seconds.
    #[inline]
    #[must_use]
    pub fn score(&self) -> i64 {
        self.end_at.timestamp()
    }

    /// Whether the ad has started at `at` (used to filter lookahead entries).
    #[inline]
    pub fn has_started(&self, at: DateTime<Utc>) -> bool {
        self.start_at <= at
    }
}

/// Write-path rejection reasons.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("start time must be before end time")]
    EmptyWindow,
    #[error("end time must be in the future")]
    AlreadyEnded,
    #[error("title too long: {actual} characters (max {max})")]
    TitleTooLong { max: usize, actual: usize },
    #[error("invalid age range {start}..{end}")]
    InvalidAgeRange { start: u32, end: u32 },
}

/// Caller-supplied data for a new ad (the write request).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdDraft {
    pub title: String,
    #[serde(rename = "startAt")]
    pub start_at: DateTime<Utc>,
    #[serde(rename = "endAt")]
    pub end_at: DateTime<Utc>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl AdDraft {
    /// Check the draft against the write-path rules.
    pub fn validate(&self, now: DateTime<Utc>, max_title_len: usize) -> Result<(), ValidationError> {
        if self.start_at >= self.end_at {
            return Err(ValidationError::EmptyWindow);
        }
        if self.end_at <= now {
            return Err(ValidationError::AlreadyEnded);
        }
        let title_len = self.title.chars().count();
        if title_len > max_title_len {
            return Err(ValidationError::TitleTooLong { max: max_title_len, actual: title_len });
        }
        for condition in &self.conditions {
            if !condition.is_age_unrestricted() && condition.age_start >= condition.age_end {
                return Err(ValidationError::InvalidAgeRange {
                    start: condition.age_start,
                    end: condition.age_end,
                });
            }
        }
        Ok(())
    }

    /// Assign a fresh identifier and produce the immutable ad.
    #[must_use]
    pub fn into_ad(self) -> Ad {
        Ad {
            id: Uuid::new_v4(),
            title: self.title,
            start_at: self.start_at,
            end_at: self.end_at,
            conditions: self.conditions,
        }
    }
}

/// Public view of an ad in a page response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdSummary {
    pub id: Uuid,
    pub title: String,
    #[serde(rename = "endAt")]
    pub end_at: DateTime<Utc>,
}

impl From<&Ad> for AdSummary {
    fn from(ad: &Ad) -> Self {
        Self {
            id: ad.id,
            title: ad.title.clone(),
            end_at: ad.end_at,
        }
    }
}

/// One window of active ads, ascending by end time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub ads: Vec<Ad>,
    /// Fewer ads came back than were asked for
    pub end: bool,
}

/// Ads that passed targeting for one set of query parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedPage {
    /// Offset to pass back to continue after this page
    pub cursor: usize,
    pub items: Vec<AdSummary>,
    pub end: bool,
}
