//! Core domain model for the contest calendar.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ccal-core";

/// Path prefix every contest link on the source site starts with.
pub const CONTEST_PATH_PREFIX: &str = "/contests/";

/// The listing pages print wall-clock times in this fixed zone (UTC+9).
pub const SOURCE_UTC_OFFSET_SECS: i32 = 9 * 3600;

pub const DEFAULT_UPCOMING_URL: &str = "https://atcoder.jp/contests/?lang=en";
pub const DEFAULT_ARCHIVE_URL: &str = "https://atcoder.jp/contests/archive?lang=en";

/// Heading text that introduces the upcoming-contests table.
pub const UPCOMING_SECTION_LABEL: &str = "Upcoming Contests";

/// Which listing a crawl targets. Each kind owns one persisted snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContestKind {
    Upcoming,
    Archive,
}

impl ContestKind {
    pub const ALL: [ContestKind; 2] = [ContestKind::Upcoming, ContestKind::Archive];

    pub fn as_str(self) -> &'static str {
        match self {
            ContestKind::Upcoming => "upcoming",
            ContestKind::Archive => "archive",
        }
    }
}

impl fmt::Display for ContestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown contest kind `{0}` (expected `upcoming` or `archive`)")]
pub struct UnknownContestKind(pub String);

impl FromStr for ContestKind {
    type Err = UnknownContestKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upcoming" => Ok(ContestKind::Upcoming),
            "archive" => Ok(ContestKind::Archive),
            other => Err(UnknownContestKind(other.to_string())),
        }
    }
}

/// Row text exactly as it appeared in the listing table. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawContestRecord {
    /// Contest link with [`CONTEST_PATH_PREFIX`] stripped; empty when the row had no link.
    pub identifier: String,
    pub title: String,
    pub start_time_text: String,
    pub duration_text: String,
    pub rated_range_text: String,
}

/// Canonical persisted contest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContestRecord {
    pub id: String,
    pub title: String,
    /// Seconds since the Unix epoch.
    pub start_time: i64,
    /// Length in seconds.
    pub duration: i64,
    /// Free-form label such as `All`, `- 1999` or `-`.
    pub rated_range: String,
}

impl ContestRecord {
    pub fn end_time(&self) -> i64 {
        self.start_time.saturating_add(self.duration)
    }
}
