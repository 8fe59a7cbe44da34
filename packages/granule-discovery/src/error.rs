//! Typed errors for the discovery library.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so the orchestrator
//! can tell a broken provider listing apart from a duplicate violation or a
//! database outage.

use std::fmt;

use thiserror::Error;

/// Errors that abort a discovery pass.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Crawl of the provider failed
    #[error("crawl failed for collection {collection_id}: {source}")]
    Crawl {
        collection_id: String,
        #[source]
        source: CrawlError,
    },

    /// Reconciliation store failed
    #[error("store failed for collection {collection_id}: {source}")]
    Store {
        collection_id: String,
        #[source]
        source: StoreError,
    },

    /// Invalid or incomplete configuration
    #[error("config error: {0}")]
    Config(String),

    /// Config document could not be read
    #[error("failed to read config {path}: {source}")]
    ConfigIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config document is not valid JSON for this schema
    #[error("invalid config document: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl DiscoveryError {
    pub fn crawl(collection_id: impl Into<String>, source: CrawlError) -> Self {
        Self::Crawl {
            collection_id: collection_id.into(),
            source,
        }
    }

    pub fn store(collection_id: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            collection_id: collection_id.into(),
            source,
        }
    }
}

/// Errors that can occur while listing a provider.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Listing row did not have the shape the protocol guarantees
    #[error("malformed listing row under {path}: {reason} ({row:?})")]
    MalformedListing {
        path: String,
        row: String,
        reason: String,
    },

    /// A file, directory or granule-id pattern failed to compile
    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Transport-level failure (HTTP status, FTP reply, SSH error, SDK error)
    #[error("transport error at {path}: {source}")]
    Transport {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Connection or read timeout
    #[error("timeout listing: {path}")]
    Timeout { path: String },

    /// Invalid URL format
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// One or more worker-pool units failed
    #[error("{} of {total} worker tasks failed: {}", .failures.len(), join_failures(.failures))]
    Workers {
        total: usize,
        failures: Vec<WorkerFailure>,
    },
}

impl CrawlError {
    pub fn transport(
        path: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Transport {
            path: path.into(),
            source: source.into(),
        }
    }
}

/// A single failed unit of work from the bounded worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    /// What the unit was working on (object key, URL)
    pub unit: String,
    pub message: String,
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.unit, self.message)
    }
}

fn join_failures(failures: &[WorkerFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised by the reconciliation store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `error` duplicate handling found names that are already stored
    #[error("duplicate exists: {}", .names.join(", "))]
    DuplicateExists { names: Vec<String> },

    /// Store settings are missing or inconsistent
    #[error("store config error: {0}")]
    Config(String),

    /// Persistence engine failure
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Upstream cross-check could not be completed
    #[error("cross-check against system of record failed: {0}")]
    CrossCheck(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A stored row could not be decoded
    #[error("corrupt record {name}: {reason}")]
    Corrupt { name: String, reason: String },

    /// Store was used after `close()`
    #[error("store is closed")]
    Closed,
}

/// Result type alias for discovery passes.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Result type alias for crawl operations.
pub type CrawlResult<T> = std::result::Result<T, CrawlError>;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
