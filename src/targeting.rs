// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Audience targeting predicates.
//!
//! An [`Ad`] carries zero or more [`Condition`]s. A query supplies one
//! [`ConditionParams`] value per dimension, and the ad is shown when it is
//! live and either has no conditions or at least one condition matches.
//!
//! Within a single condition every dimension must match:
//!
//! | Dimension | Rule |
//! |-----------|------|
//! | age       | `age_start < age < age_end`, or both bounds zero (unrestricted) |
//! | country   | empty set matches anything, otherwise membership |
//! | gender    | empty set matches anything, otherwise membership |
//! | platform  | empty set matches anything, otherwise membership |
//!
//! Everything here is pure and safe to call from any number of readers.
//!
//! # Example
//!
//! ```
//! use ad_sync_engine::{Condition, ConditionParams, Country, Gender, Platform};
//!
//! let condition = Condition {
//!     age_start: 20,
//!     age_end: 30,
//!     country: vec![Country::Taiwan],
//!     platform: vec![Platform::Web],
//!     ..Default::default()
//! };
//!
//! let params = ConditionParams {
//!     age: 25,
//!     gender: Gender::Female,
//!     country: Country::Taiwan,
//!     platform: Platform::Web,
//! };
//! assert!(condition.matches(&params));
//! assert!(!condition.matches(&ConditionParams { country: Country::Japan, ..params }));
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ad::Ad;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {kind}: '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Country {
    #[serde(rename = "TW")]
    Taiwan,
    #[serde(rename = "JP")]
    Japan,
}

impl Country {
    pub const ALL: [Country; 2] = [Country::Taiwan, Country::Japan];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Taiwan => "TW",
            Self::Japan => "JP",
        }
    }
}

impl FromStr for Country {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TW" => Ok(Self::Taiwan),
            "JP" => Ok(Self::Japan),
            other => Err(ParseEnumError { kind: "country", value: other.to_string() }),
        }
    }
}

impl fmt::Display for Country {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Gender {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
}

impl Gender {
    pub const ALL: [Gender; 2] = [Gender::Male, Gender::Female];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Male => "M",
            Self::Female => "F",
        }
    }
}

impl FromStr for Gender {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "M" => Ok(Self::Male),
            "F" => Ok(Self::Female),
            other => Err(ParseEnumError { kind: "gender", value: other.to_string() }),
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
    Web,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Android, Platform::Ios, Platform::Web];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Android => "android",
            Self::Ios => "ios",
            Self::Web => "web",
        }
    }
}

impl FromStr for Platform {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "android" => Ok(Self::Android),
            "ios" => Ok(Self::Ios),
            "web" => Ok(Self::Web),
            other => Err(ParseEnumError { kind: "platform", value: other.to_string() }),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audience targeting rule owned by a single ad.
///
/// An empty set in any dimension is a wildcard. Both age bounds at zero
/// means the age dimension is unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "ageStart", default)]
    pub age_start: u32,
    #[serde(rename = "ageEnd", default)]
    pub age_end: u32,
    #[serde(default)]
    pub country: Vec<Country>,
    #[serde(default)]
    pub gender: Vec<Gender>,
    #[serde(default)]
    pub platform: Vec<Platform>,
}

/// Query-side values matched against an ad's conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionParams {
    pub age: u32,
    pub gender: Gender,
    pub country: Country,
    pub platform: Platform,
}

impl Condition {
    /// True when the age dimension carries no restriction.
    #[inline]
    pub fn is_age_unrestricted(&self) -> bool {
        self.age_start == 0 && self.age_end == 0
    }

    /// Bounds are exclusive on both ends.
    #[inline]
    fn age_matches(&self, age: u32) -> bool {
        self.is_age_unrestricted() || (self.age_start < age && age < self.age_end)
    }

    /// Evaluate this condition against query parameters (logical AND of
    /// every dimension).
    #[must_use]
    pub fn matches(&self, params: &ConditionParams) -> bool {
        self.age_matches(params.age)
            && dimension_matches(&self.platform, &params.platform)
            && dimension_matches(&self.country, &params.country)
            && dimension_matches(&self.gender, &params.gender)
    }
}

#[inline]
fn dimension_matches<T: PartialEq>(allowed: &[T], value: &T) -> bool {
    allowed.is_empty() || allowed.contains(value)
}

impl Ad {
    /// Whether `at` falls inside `[start_at, end_at]`.
    #[inline]
    pub fn is_live_at(&self, at: DateTime<Utc>) -> bool {
        self.start_at <= at && at <= self.end_at
    }

    /// Whether this ad should be shown to a viewer described by `params` at
    /// time `now`: live, and either unconditioned or matching any condition.
    #[must_use]
    pub fn should_show(&self, params: &ConditionParams, now: DateTime<Utc>) -> bool {
        if !self.is_live_at(now) {
            return false;
        }
        if self.conditions.is_empty() {
            return true;
        }
        self.conditions.iter().any(|condition| condition.matches(params))
    }
}
