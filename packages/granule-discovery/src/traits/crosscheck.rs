//! Upstream cross-check consulted under `skip` duplicate handling.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreResult;

/// A candidate granule and the newest provider timestamp among its files.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GranuleStamp {
    pub granule_id: String,
    pub last_modified: Option<DateTime<Utc>>,
}

impl GranuleStamp {
    pub fn new(granule_id: impl Into<String>, last_modified: Option<DateTime<Utc>>) -> Self {
        Self {
            granule_id: granule_id.into(),
            last_modified,
        }
    }
}

/// Authoritative system of record for already-ingested granules.
#[async_trait]
pub trait CrossCheck: Send + Sync {
    /// Return the ids of `collection_id` granules that are already current
    /// upstream.
    ///
    /// Granule ids are only unique within a collection, so lookups are
    /// scoped to it. A granule is current when it exists upstream and the upstream
    /// timestamp is not older than the candidate's. Errors are fatal to the
    /// pass; implementations must never fall back to "all new" or "all
    /// current".
    async fn filter(&self, collection_id: &str, granules: &[GranuleStamp]) -> StoreResult<HashSet<String>>;

    /// Backend name (for logging/debugging).
    fn name(&self) -> &str {
        "unknown"
    }
}
