//! Persistence engine trait behind the reconciliation store.
//!
//! Engines only know how to write one chunk atomically, dequeue a batch
//! and count. Buffering, chunk planning, duplicate collapsing and the
//! upstream cross-check live in [`crate::stores::ReconciliationStore`].

use async_trait::async_trait;
use serde::Serialize;

use crate::error::StoreResult;
use crate::types::record::{CountType, DuplicateHandling, RecordFilter, RecordStatus, StoredRecord};

/// Result of committing one chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    /// Rows inserted or updated (unchanged rows under `skip` are excluded)
    pub persisted: usize,
}

/// Summary of one `flush`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Rows inserted or updated
    pub persisted: usize,
    /// Rows left untouched because nothing changed (`skip` only)
    pub unchanged: usize,
    /// Rows dropped because their granule is already current upstream
    pub filtered: usize,
    /// Committed chunks
    pub chunks: usize,
}

/// A backing store for [`StoredRecord`]s.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Engine name (for logging/debugging).
    fn name(&self) -> &'static str;

    /// Maximum bound parameters a single statement may carry.
    fn param_ceiling(&self) -> usize;

    /// Persist `rows` under `policy` as one atomic unit.
    ///
    /// Every row is a fresh `discovered` record stamped with the flush
    /// time. Names within one chunk are unique. Under
    /// [`DuplicateHandling::Error`], any name already stored fails the
    /// whole chunk with `StoreError::DuplicateExists` and commits nothing.
    async fn write_chunk(&self, policy: DuplicateHandling, rows: &[StoredRecord]) -> StoreResult<ChunkOutcome>;

    /// Atomically select up to `limit` granules in `discovered` status,
    /// oldest `discovered_date` first, flip all their records to `queued`
    /// and return those records ordered by `discovered_date`.
    ///
    /// Two concurrent callers must never both dequeue the same record.
    async fn read_batch(&self, filter: &RecordFilter, limit: usize) -> StoreResult<Vec<StoredRecord>>;

    async fn count(&self, filter: &RecordFilter, status: RecordStatus, count_type: CountType) -> StoreResult<u64>;

    /// Release the underlying connection(s). Idempotent.
    async fn close(&self) -> StoreResult<()>;
}
