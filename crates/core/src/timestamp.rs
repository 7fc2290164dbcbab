//! Task timestamps and task file names.
//!
//! Every task file is named `YYYY_MM_DD_HHMMSS_slug.ext`. The timestamp prefix
//! is the ordering key; the stem (`timestamp_slug`) is the task name.

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;

const FORMAT: &str = "%Y_%m_%d_%H%M%S";

/// Errors raised while parsing timestamps and task file names.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimestampError {
    /// The timestamp prefix has the right shape but is not a valid date/time
    #[error("malformed timestamp '{0}'")]
    Malformed(String),

    /// The slug after the timestamp is empty or has invalid characters
    #[error("invalid slug in task file '{0}'")]
    InvalidSlug(String),
}

/// A sortable task timestamp (`YYYY_MM_DD_HHMMSS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskTimestamp(NaiveDateTime);

impl TaskTimestamp {
    /// Parse a full `YYYY_MM_DD_HHMMSS` timestamp.
    pub fn parse(s: &str) -> Result<Self, TimestampError> {
        NaiveDateTime::parse_from_str(s, FORMAT)
            .map(Self)
            .map_err(|_| TimestampError::Malformed(s.to_string()))
    }

    /// Parse a `--from` floor: a full timestamp, a bare `YYYY_MM_DD` date
    /// (midnight), or a full task name whose prefix is a timestamp.
    pub fn parse_floor(s: &str) -> Result<Self, TimestampError> {
        let s = s.trim();
        if let Ok(ts) = Self::parse(s) {
            return Ok(ts);
        }
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y_%m_%d") {
            if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                return Ok(Self(midnight));
            }
        }
        if s.len() > 17 && s.is_char_boundary(17) {
            if let Ok(ts) = Self::parse(&s[..17]) {
                return Ok(ts);
            }
        }
        Err(TimestampError::Malformed(s.to_string()))
    }

    /// The underlying date/time.
    pub fn as_datetime(&self) -> NaiveDateTime {
        self.0
    }
}

impl std::fmt::Display for TaskTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format(FORMAT))
    }
}

impl std::str::FromStr for TaskTimestamp {
    type Err = TimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A parsed task file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFileName {
    /// Ordering key
    pub timestamp: TaskTimestamp,
    /// Slug after the timestamp
    pub slug: String,
    /// Task name (`timestamp_slug`)
    pub name: String,
    /// File extension, without the dot (may be empty)
    pub extension: String,
    /// Full file name, used as the ordering tie-break
    pub file_name: String,
}

fn shape() -> &'static Regex {
    static SHAPE: OnceLock<Regex> = OnceLock::new();
    SHAPE.get_or_init(|| {
        Regex::new(r"^(\d{4}_\d{2}_\d{2}_\d{6})_(.*)$").expect("task file pattern is valid")
    })
}

fn valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl TaskFileName {
    /// Parse a file name.
    ///
    /// Returns `Ok(None)` for files that are not task files at all (hidden
    /// files, READMEs); returns an error for files that look like task files
    /// but carry a malformed timestamp or slug.
    pub fn parse(file_name: &str) -> Result<Option<Self>, TimestampError> {
        if file_name.starts_with('.') {
            return Ok(None);
        }

        let (stem, extension) = match file_name.rsplit_once('.') {
            Some((stem, ext)) => (stem, ext),
            None => (file_name, ""),
        };

        let Some(caps) = shape().captures(stem) else {
            return Ok(None);
        };

        let timestamp = TaskTimestamp::parse(&caps[1])
            .map_err(|_| TimestampError::Malformed(file_name.to_string()))?;
        let slug = caps[2].to_string();
        if !valid_slug(&slug) {
            return Err(TimestampError::InvalidSlug(file_name.to_string()));
        }

        Ok(Some(Self {
            timestamp,
            slug,
            name: stem.to_string(),
            extension: extension.to_string(),
            file_name: file_name.to_string(),
        }))
    }

    /// Parse the final component of a path.
    pub fn from_path(path: &Path) -> Result<Option<Self>, TimestampError> {
        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => Self::parse(name),
            None => Ok(None),
        }
    }
}
