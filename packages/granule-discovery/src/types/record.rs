//! Persisted records and the rules that govern them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::candidate::Candidate;

/// Lifecycle state of a stored record.
///
/// The only transition is `Discovered -> Queued`, made by `read_batch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    #[default]
    Discovered,
    Queued,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Queued => "queued",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(Self::Discovered),
            "queued" => Ok(Self::Queued),
            other => Err(format!("unknown status {other:?}")),
        }
    }
}

/// Durable representation of a candidate after at least one flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub name: String,
    pub granule_id: String,
    pub collection_id: String,
    pub etag: String,
    /// Normalized RFC 3339 text, see [`crate::types::candidate::format_last_modified`]
    pub last_modified: Option<String>,
    pub size: u64,
    pub status: RecordStatus,
    pub discovered_date: DateTime<Utc>,
}

impl StoredRecord {
    /// A freshly inserted (or replaced) record.
    pub fn discovered(candidate: &Candidate, now: DateTime<Utc>) -> Self {
        Self {
            name: candidate.name.clone(),
            granule_id: candidate.granule_id.clone(),
            collection_id: candidate.collection_id.clone(),
            etag: candidate.etag.clone(),
            last_modified: candidate.last_modified_text(),
            size: candidate.size,
            status: RecordStatus::Discovered,
            discovered_date: now,
        }
    }

    pub fn matches(&self, collection_id: &str, path_filter: &str) -> bool {
        self.collection_id == collection_id && self.name.contains(path_filter)
    }
}

/// How re-discovery of an existing `name` is resolved at flush time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateHandling {
    /// Update only when etag, last_modified or size changed
    #[default]
    Skip,
    /// Always overwrite and re-queue
    Replace,
    /// Fail the sub-batch if any name already exists
    Error,
}

impl DuplicateHandling {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Replace => "replace",
            Self::Error => "error",
        }
    }

    /// Whether re-discovering the same name within one buffer is tolerated.
    pub fn collapses_repeats(&self) -> bool {
        !matches!(self, Self::Error)
    }
}

impl fmt::Display for DuplicateHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What `count` counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountType {
    Files,
    Granules,
}

/// Selection shared by `read_batch` and `count`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFilter {
    pub collection_id: String,
    /// Substring every matching `name` must contain ("" matches all)
    pub path_filter: String,
}

impl RecordFilter {
    pub fn new(collection_id: impl Into<String>, path_filter: impl Into<String>) -> Self {
        Self {
            collection_id: collection_id.into(),
            path_filter: path_filter.into(),
        }
    }
}
