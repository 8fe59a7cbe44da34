//! Candidate files produced by crawlers.

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CrawlError, CrawlResult};

/// Etag used by protocols that have no content-version token (FTP, SFTP).
pub const NO_ETAG: &str = "N/A";

/// How a listing entry was classified by its protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Neither a file nor a directory (symlink, device, folder marker, parent link)
    Other,
}

/// A classified child of a listed path.
///
/// `path` is what the protocol needs to list or fetch the entry again
/// (object key, URL, remote path). `name` is the fully-qualified location
/// that becomes the candidate's unique key.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingEntry {
    pub path: String,
    pub name: String,
    pub kind: EntryKind,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub size: u64,
}

impl ListingEntry {
    pub fn new(path: impl Into<String>, name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            kind,
            etag: None,
            last_modified: None,
            size: 0,
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_last_modified(mut self, last_modified: Option<DateTime<Utc>>) -> Self {
        self.last_modified = last_modified;
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Final path segment, ignoring a trailing slash.
    pub fn basename(&self) -> &str {
        basename(&self.path)
    }
}

/// Final segment of a `/`-separated path or URL.
pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// A file observed during one crawl, not yet reconciled against storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Fully-qualified location, unique within a collection
    pub name: String,
    pub granule_id: String,
    pub collection_id: String,
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub size: u64,
}

impl Candidate {
    pub fn new(
        name: impl Into<String>,
        granule_id: impl Into<String>,
        collection_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            granule_id: granule_id.into(),
            collection_id: collection_id.into(),
            etag: NO_ETAG.to_string(),
            last_modified: None,
            size: 0,
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = etag.into();
        self
    }

    pub fn with_last_modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = Some(last_modified);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Build a candidate from a classified file entry.
    pub fn from_entry(entry: ListingEntry, collection_id: &str, extractor: &GranuleIdExtractor) -> Self {
        let granule_id = extractor.extract(entry.basename());
        Self {
            name: entry.name,
            granule_id,
            collection_id: collection_id.to_string(),
            etag: entry.etag.unwrap_or_else(|| NO_ETAG.to_string()),
            last_modified: entry.last_modified,
            size: entry.size,
        }
    }

    /// `last_modified` in the normalized text form the stores persist.
    pub fn last_modified_text(&self) -> Option<String> {
        self.last_modified.map(format_last_modified)
    }
}

/// Normalize a provider timestamp to RFC 3339 with second precision.
///
/// Fixed width, so lexical and chronological order agree.
pub fn format_last_modified(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Derives a granule id from a file basename.
#[derive(Debug, Clone, Default)]
pub struct GranuleIdExtractor {
    pattern: Option<Regex>,
}

impl GranuleIdExtractor {
    pub fn new(pattern: Option<&str>) -> CrawlResult<Self> {
        let pattern = pattern
            .map(|p| {
                Regex::new(p).map_err(|source| CrawlError::InvalidPattern {
                    pattern: p.to_string(),
                    source,
                })
            })
            .transpose()?;
        Ok(Self { pattern })
    }

    /// Capture group 1 of the pattern, else the whole match, else the
    /// basename without its final extension.
    pub fn extract(&self, basename: &str) -> String {
        if let Some(caps) = self.pattern.as_ref().and_then(|p| p.captures(basename)) {
            if let Some(m) = caps.get(1).or_else(|| caps.get(0)) {
                return m.as_str().to_string();
            }
        }

        if self.pattern.is_some() {
            tracing::debug!(file = basename, "Granule id pattern did not match, using file stem");
        }

        match basename.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => basename.to_string(),
        }
    }
}
