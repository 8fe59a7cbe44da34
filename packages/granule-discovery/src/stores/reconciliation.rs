//! Buffered, policy-aware front end over a [`StorageEngine`].
//!
//! ```text
//! add() -> buffer --(transaction_size reached | flush())--> collapse repeats
//!       -> cross-check (skip only) -> chunk by param ceiling -> write_chunk()*
//! ```
//!
//! The store is owned by exactly one discovery pass and must be closed on
//! every exit path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::stores::chunking::{rows_per_chunk, BINDS_PER_ROW};
use crate::traits::crosscheck::{CrossCheck, GranuleStamp};
use crate::traits::store::{FlushReport, StorageEngine};
use crate::types::candidate::Candidate;
use crate::types::record::{CountType, DuplicateHandling, RecordFilter, RecordStatus, StoredRecord};

/// Default buffered candidates before an implicit flush.
pub const DEFAULT_TRANSACTION_SIZE: usize = 100_000;

/// Reconciliation store for one discovery pass.
pub struct ReconciliationStore<E: StorageEngine> {
    engine: E,
    policy: DuplicateHandling,
    transaction_size: usize,
    cross_check: Option<Arc<dyn CrossCheck>>,
    buffer: Vec<Candidate>,
    discovered_files: usize,
    closed: bool,
}

impl<E: StorageEngine> ReconciliationStore<E> {
    pub fn new(engine: E, policy: DuplicateHandling) -> Self {
        Self {
            engine,
            policy,
            transaction_size: DEFAULT_TRANSACTION_SIZE,
            cross_check: None,
            buffer: Vec::new(),
            discovered_files: 0,
            closed: false,
        }
    }

    /// Buffered candidates that trigger an implicit flush (minimum 1).
    pub fn with_transaction_size(mut self, transaction_size: usize) -> Self {
        self.transaction_size = transaction_size.max(1);
        self
    }

    /// Consult `cross_check` before persisting under `skip`.
    ///
    /// Ignored under `replace` and `error`.
    pub fn with_cross_check(mut self, cross_check: Arc<dyn CrossCheck>) -> Self {
        if self.policy != DuplicateHandling::Skip {
            warn!(policy = %self.policy, filter = cross_check.name(), "Cross-check only applies under skip");
        }
        self.cross_check = Some(cross_check);
        self
    }

    pub fn policy(&self) -> DuplicateHandling {
        self.policy
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Records actually persisted across all flushes of this store.
    pub fn discovered_files(&self) -> usize {
        self.discovered_files
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Buffer one candidate, flushing when the buffer is full.
    ///
    /// Returns the remaining buffer capacity.
    pub async fn add(&mut self, candidate: Candidate) -> StoreResult<usize> {
        self.ensure_open()?;
        self.buffer.push(candidate);

        if self.buffer.len() >= self.transaction_size {
            debug!(buffered = self.buffer.len(), "Transaction size reached, flushing");
            self.flush().await?;
        }
        Ok(self.transaction_size - self.buffer.len())
    }

    /// Buffer every candidate in order.
    pub async fn add_all(&mut self, candidates: impl IntoIterator<Item = Candidate>) -> StoreResult<()> {
        for candidate in candidates {
            self.add(candidate).await?;
        }
        Ok(())
    }

    /// Apply the duplicate policy to the buffer and persist it.
    ///
    /// The buffer is cleared even on failure; rows from chunks committed
    /// before the failure stay durable and are counted.
    pub async fn flush(&mut self) -> StoreResult<FlushReport> {
        self.ensure_open()?;
        let pending = std::mem::take(&mut self.buffer);
        if pending.is_empty() {
            return Ok(FlushReport::default());
        }

        let received = pending.len();
        let candidates = collapse_repeats(pending, self.policy)?;
        let (candidates, filtered) = self.apply_cross_check(candidates).await?;

        let now = flush_time();
        let rows: Vec<StoredRecord> = candidates.iter().map(|c| StoredRecord::discovered(c, now)).collect();
        let per_chunk = rows_per_chunk(self.engine.param_ceiling(), BINDS_PER_ROW);

        let mut report = FlushReport {
            filtered,
            ..FlushReport::default()
        };
        for chunk in rows.chunks(per_chunk) {
            let outcome = self.engine.write_chunk(self.policy, chunk).await?;
            self.discovered_files += outcome.persisted;
            report.persisted += outcome.persisted;
            report.chunks += 1;
        }
        report.unchanged = rows.len() - report.persisted;

        info!(
            engine = self.engine.name(),
            policy = %self.policy,
            received,
            persisted = report.persisted,
            unchanged = report.unchanged,
            filtered = report.filtered,
            chunks = report.chunks,
            "Flushed candidates"
        );
        Ok(report)
    }

    /// Drop candidates whose granule is already current upstream.
    async fn apply_cross_check(&self, candidates: Vec<Candidate>) -> StoreResult<(Vec<Candidate>, usize)> {
        let Some(cross_check) = self.cross_check.as_ref() else {
            return Ok((candidates, 0));
        };
        if self.policy != DuplicateHandling::Skip || candidates.is_empty() {
            return Ok((candidates, 0));
        }

        let mut current: HashMap<String, HashSet<String>> = HashMap::new();
        for (collection_id, stamps) in granule_stamps(&candidates) {
            let ids = cross_check.filter(&collection_id, &stamps).await?;
            if !ids.is_empty() {
                current.insert(collection_id, ids);
            }
        }
        if current.is_empty() {
            return Ok((candidates, 0));
        }

        let before = candidates.len();
        let survivors: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| {
                !current
                    .get(&c.collection_id)
                    .is_some_and(|ids| ids.contains(&c.granule_id))
            })
            .collect();
        let filtered = before - survivors.len();

        debug!(
            filter = cross_check.name(),
            granules = current.values().map(HashSet::len).sum::<usize>(),
            files = filtered,
            "Dropped files already current upstream"
        );
        Ok((survivors, filtered))
    }

    /// Dequeue up to `limit` granules for `collection_id` under `path_filter`.
    pub async fn read_batch(
        &self,
        collection_id: &str,
        path_filter: &str,
        limit: usize,
    ) -> StoreResult<Vec<StoredRecord>> {
        self.ensure_open()?;
        let filter = RecordFilter::new(collection_id, path_filter);
        self.engine.read_batch(&filter, limit).await
    }

    pub async fn count(
        &self,
        collection_id: &str,
        path_filter: &str,
        status: RecordStatus,
        count_type: CountType,
    ) -> StoreResult<u64> {
        self.ensure_open()?;
        let filter = RecordFilter::new(collection_id, path_filter);
        self.engine.count(&filter, status, count_type).await
    }

    /// Release the engine. Unflushed candidates are discarded. Idempotent.
    pub async fn close(&mut self) -> StoreResult<()> {
        if self.closed {
            return Ok(());
        }
        if !self.buffer.is_empty() {
            warn!(buffered = self.buffer.len(), "Closing store with unflushed candidates");
            self.buffer.clear();
        }
        self.closed = true;
        self.engine.close().await
    }
}

/// One timestamp per flush, at the precision every engine can store.
fn flush_time() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Collapse names repeated within one buffer.
///
/// Under `skip`/`replace` the last occurrence wins, at the position of the
/// first. Under `error` any repeat is a duplicate.
fn collapse_repeats(candidates: Vec<Candidate>, policy: DuplicateHandling) -> StoreResult<Vec<Candidate>> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(candidates.len());
    let mut unique: Vec<Candidate> = Vec::with_capacity(candidates.len());
    let mut repeated = Vec::new();

    for candidate in candidates {
        match positions.get(&candidate.name) {
            Some(&index) => {
                if !policy.collapses_repeats() && !repeated.contains(&candidate.name) {
                    repeated.push(candidate.name.clone());
                }
                unique[index] = candidate;
            }
            None => {
                positions.insert(candidate.name.clone(), unique.len());
                unique.push(candidate);
            }
        }
    }

    if !repeated.is_empty() {
        return Err(StoreError::DuplicateExists { names: repeated });
    }
    Ok(unique)
}

/// Per collection, one stamp per granule carrying the newest
/// `last_modified` of its files. Both levels keep first-seen order.
fn granule_stamps(candidates: &[Candidate]) -> Vec<(String, Vec<GranuleStamp>)> {
    let mut groups: Vec<(String, Vec<GranuleStamp>)> = Vec::new();
    let mut slots: HashMap<(&str, &str), (usize, usize)> = HashMap::new();

    for candidate in candidates {
        let key = (candidate.collection_id.as_str(), candidate.granule_id.as_str());
        if let Some(&(group, index)) = slots.get(&key) {
            let stamp = &mut groups[group].1[index];
            stamp.last_modified = stamp.last_modified.max(candidate.last_modified);
            continue;
        }

        let group = match groups.iter().position(|(id, _)| *id == candidate.collection_id) {
            Some(group) => group,
            None => {
                groups.push((candidate.collection_id.clone(), Vec::new()));
                groups.len() - 1
            }
        };
        let stamps = &mut groups[group].1;
        stamps.push(GranuleStamp::new(&candidate.granule_id, candidate.last_modified));
        slots.insert(key, (group, stamps.len() - 1));
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::memory::MemoryEngine;
    use crate::testing::{candidate, MemoryCrossCheck};
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_new_names_insert_once_under_every_policy() {
        for policy in [DuplicateHandling::Skip, DuplicateHandling::Replace, DuplicateHandling::Error] {
            let mut store = ReconciliationStore::new(MemoryEngine::new(), policy);
            store
                .add_all(vec![candidate("a", "e1"), candidate("b", "e1")])
                .await
                .unwrap();

            let report = store.flush().await.unwrap();

            assert_eq!(report.persisted, 2, "policy {policy}");
            assert_eq!(store.discovered_files(), 2);
            assert_eq!(store.engine().len().await, 2);
        }
    }

    #[tokio::test]
    async fn test_skip_updates_only_changed_records() {
        let mut store = ReconciliationStore::new(MemoryEngine::new(), DuplicateHandling::Skip);
        store.add_all(vec![candidate("a", "e1"), candidate("b", "e1")]).await.unwrap();
        store.flush().await.unwrap();
        store.read_batch("C___1", "", 10).await.unwrap();

        store.add_all(vec![candidate("a", "e1"), candidate("b", "e2")]).await.unwrap();
        let report = store.flush().await.unwrap();

        assert_eq!(report.persisted, 1);
        assert_eq!(report.unchanged, 1);
        assert_eq!(store.discovered_files(), 3);
        assert_eq!(store.engine().get("a").await.unwrap().status, RecordStatus::Queued);
        let b = store.engine().get("b").await.unwrap();
        assert_eq!(b.status, RecordStatus::Discovered);
        assert_eq!(b.etag, "e2");
    }

    #[tokio::test]
    async fn test_replace_always_requeues() {
        let mut store = ReconciliationStore::new(MemoryEngine::new(), DuplicateHandling::Replace);
        store.add(candidate("a", "e1")).await.unwrap();
        store.flush().await.unwrap();
        let first = store.engine().get("a").await.unwrap().discovered_date;
        store.read_batch("C___1", "", 10).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.add(candidate("a", "e1")).await.unwrap();
        let report = store.flush().await.unwrap();

        let record = store.engine().get("a").await.unwrap();
        assert_eq!(report.persisted, 1);
        assert_eq!(record.status, RecordStatus::Discovered);
        assert!(record.discovered_date > first);
    }

    #[tokio::test]
    async fn test_error_policy_rejects_stored_and_repeated_names() {
        let mut store = ReconciliationStore::new(MemoryEngine::new(), DuplicateHandling::Error);
        store.add(candidate("a", "e1")).await.unwrap();
        store.flush().await.unwrap();

        store.add(candidate("a", "e2")).await.unwrap();
        assert!(matches!(store.flush().await, Err(StoreError::DuplicateExists { .. })));
        assert_eq!(store.buffered(), 0);

        store.add_all(vec![candidate("x", "e1"), candidate("x", "e2")]).await.unwrap();
        match store.flush().await {
            Err(StoreError::DuplicateExists { names }) => assert_eq!(names, vec!["x".to_string()]),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(store.engine().get("x").await.is_none());
    }

    #[tokio::test]
    async fn test_repeats_collapse_to_last_occurrence() {
        let mut store = ReconciliationStore::new(MemoryEngine::new(), DuplicateHandling::Skip);
        store
            .add_all(vec![candidate("a", "e1"), candidate("b", "e1"), candidate("a", "e3")])
            .await
            .unwrap();

        let report = store.flush().await.unwrap();

        assert_eq!(report.persisted, 2);
        assert_eq!(store.engine().get("a").await.unwrap().etag, "e3");
    }

    #[tokio::test]
    async fn test_add_flushes_at_transaction_size() {
        let mut store = ReconciliationStore::new(MemoryEngine::new(), DuplicateHandling::Skip).with_transaction_size(3);

        assert_eq!(store.add(candidate("a", "e")).await.unwrap(), 2);
        assert_eq!(store.add(candidate("b", "e")).await.unwrap(), 1);
        assert_eq!(store.add(candidate("c", "e")).await.unwrap(), 3);

        assert_eq!(store.buffered(), 0);
        assert_eq!(store.discovered_files(), 3);
    }

    #[tokio::test]
    async fn test_cross_check_drops_current_granules() {
        let upstream = MemoryCrossCheck::new()
            .with_granule("C___1", "g-old", Some(ts(10)))
            .with_granule("C___1", "g-stale", Some(ts(1)));
        let mut store = ReconciliationStore::new(MemoryEngine::new(), DuplicateHandling::Skip)
            .with_cross_check(Arc::new(upstream));

        store
            .add_all(vec![
                Candidate::new("old.h5", "g-old", "C___1").with_last_modified(ts(5)),
                Candidate::new("old.xml", "g-old", "C___1").with_last_modified(ts(6)),
                Candidate::new("stale.h5", "g-stale", "C___1").with_last_modified(ts(3)),
                Candidate::new("new.h5", "g-new", "C___1").with_last_modified(ts(3)),
            ])
            .await
            .unwrap();
        let report = store.flush().await.unwrap();

        assert_eq!(report.filtered, 2);
        assert_eq!(report.persisted, 2);
        assert!(store.engine().get("old.h5").await.is_none());
        assert!(store.engine().get("stale.h5").await.is_some());
    }

    #[tokio::test]
    async fn test_cross_check_failure_is_fatal() {
        let mut store = ReconciliationStore::new(MemoryEngine::new(), DuplicateHandling::Skip)
            .with_cross_check(Arc::new(MemoryCrossCheck::failing()));
        store.add(candidate("a", "e1")).await.unwrap();

        assert!(matches!(store.flush().await, Err(StoreError::CrossCheck(_))));
        assert!(store.engine().is_empty().await);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let mut store = ReconciliationStore::new(MemoryEngine::new(), DuplicateHandling::Skip);
        store.add(candidate("a", "e1")).await.unwrap();
        store.close().await.unwrap();
        store.close().await.unwrap();

        assert!(matches!(store.add(candidate("b", "e1")).await, Err(StoreError::Closed)));
        assert!(matches!(store.read_batch("C___1", "", 1).await, Err(StoreError::Closed)));
        assert!(store.engine().is_empty().await);
    }

    #[tokio::test]
    async fn test_cross_check_is_scoped_to_collection() {
        let upstream = MemoryCrossCheck::new().with_granule("OTHER___1", "g1", Some(ts(10)));
        let mut store = ReconciliationStore::new(MemoryEngine::new(), DuplicateHandling::Skip)
            .with_cross_check(Arc::new(upstream));

        store
            .add_all(vec![
                Candidate::new("mine.h5", "g1", "C___1").with_last_modified(ts(3)),
                Candidate::new("theirs.h5", "g1", "OTHER___1").with_last_modified(ts(3)),
            ])
            .await
            .unwrap();
        let report = store.flush().await.unwrap();

        assert_eq!(report.filtered, 1);
        assert!(store.engine().get("mine.h5").await.is_some());
        assert!(store.engine().get("theirs.h5").await.is_none());
    }

    #[test]
    fn test_granule_stamps_use_newest_file() {
        let candidates = vec![
            Candidate::new("a.h5", "g1", "C___1").with_last_modified(ts(2)),
            Candidate::new("a.xml", "g1", "C___1").with_last_modified(ts(4)),
            Candidate::new("b.h5", "g2", "C___1"),
            Candidate::new("c.h5", "g1", "C___2").with_last_modified(ts(1)),
        ];

        let stamps = granule_stamps(&candidates);

        assert_eq!(
            stamps,
            vec![
                (
                    "C___1".to_string(),
                    vec![GranuleStamp::new("g1", Some(ts(4))), GranuleStamp::new("g2", None)]
                ),
                ("C___2".to_string(), vec![GranuleStamp::new("g1", Some(ts(1)))]),
            ]
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn chunked_flush_commits_expected_sub_batches(rows in 0usize..400, ceiling in 7usize..200) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let (report, commits) = runtime.block_on(async {
                let mut store = ReconciliationStore::new(MemoryEngine::with_param_ceiling(ceiling), DuplicateHandling::Skip);
                store
                    .add_all((0..rows).map(|i| candidate(&format!("f{i}"), "e")))
                    .await
                    .unwrap();
                let report = store.flush().await.unwrap();
                (report, store.engine().commits())
            });

            let per_chunk = ceiling / BINDS_PER_ROW;
            prop_assert_eq!(report.chunks, rows.div_ceil(per_chunk));
            prop_assert_eq!(commits, report.chunks);
            prop_assert_eq!(report.persisted, rows);
        }

        #[test]
        fn granule_count_never_exceeds_file_count(
            files in prop::collection::vec((0u8..20, 0u8..6), 0..60),
            limit in 0usize..10,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let mut store = ReconciliationStore::new(MemoryEngine::new(), DuplicateHandling::Skip);
                for (file, granule) in &files {
                    let c = Candidate::new(format!("data/f{file}"), format!("g{granule}"), "C___1");
                    store.add(c).await.unwrap();
                }
                store.flush().await.unwrap();
                store.read_batch("C___1", "data", limit).await.unwrap();

                for status in [RecordStatus::Discovered, RecordStatus::Queued] {
                    let files = store.count("C___1", "data", status, CountType::Files).await.unwrap();
                    let granules = store.count("C___1", "data", status, CountType::Granules).await.unwrap();
                    assert!(granules <= files);
                }
            });
        }
    }
}
