// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::fmt;

/// What a refresh attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// This instance held the lock and merged the source into the index
    Refreshed {
        inserted: usize,
        expired_removed: usize,
    },
    /// Another instance holds the refresh lock; nothing was done
    Contended,
}

impl RefreshOutcome {
    #[must_use]
    pub fn is_refreshed(&self) -> bool {
        matches!(self, Self::Refreshed { .. })
    }

    /// Ads newly added to the index (zero when contended).
    #[must_use]
    pub fn inserted(&self) -> usize {
        match self {
            Self::Refreshed { inserted, .. } => *inserted,
            Self::Contended => 0,
        }
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            Self::Refreshed { .. } => "refreshed",
            Self::Contended => "contended",
        }
    }
}

impl fmt::Display for RefreshOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refreshed { inserted, expired_removed } => {
                write!(f, "refreshed (inserted {}, expired {})", inserted, expired_removed)
            }
            Self::Contended => f.write_str("contended"),
        }
    }
}
