//! In-memory engine for tests and dry runs.
//!
//! Holds every record behind one async mutex, which gives the same
//! at-most-once dequeue guarantee as a row lock. The parameter ceiling is
//! configurable so chunk planning can be exercised without a database.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::stores::chunking::SQLITE_PARAM_CEILING;
use crate::traits::store::{ChunkOutcome, StorageEngine};
use crate::types::record::{CountType, DuplicateHandling, RecordFilter, RecordStatus, StoredRecord};

/// In-memory [`StorageEngine`].
pub struct MemoryEngine {
    records: Mutex<HashMap<String, StoredRecord>>,
    param_ceiling: usize,
    commits: AtomicUsize,
    closed: AtomicBool,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Create an empty engine with the embedded engine's ceiling.
    pub fn new() -> Self {
        Self::with_param_ceiling(SQLITE_PARAM_CEILING)
    }

    pub fn with_param_ceiling(param_ceiling: usize) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            param_ceiling,
            commits: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of chunks committed so far.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub async fn get(&self, name: &str) -> Option<StoredRecord> {
        self.records.lock().await.get(name).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Backdate a record, for ordering tests.
    pub async fn set_discovered_date(&self, name: &str, discovered_date: DateTime<Utc>) -> bool {
        match self.records.lock().await.get_mut(name) {
            Some(record) => {
                record.discovered_date = discovered_date;
                true
            }
            None => false,
        }
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn param_ceiling(&self) -> usize {
        self.param_ceiling
    }

    async fn write_chunk(&self, policy: DuplicateHandling, rows: &[StoredRecord]) -> StoreResult<ChunkOutcome> {
        self.ensure_open()?;
        let mut records = self.records.lock().await;

        if policy == DuplicateHandling::Error {
            let names: Vec<String> = rows
                .iter()
                .filter(|row| records.contains_key(&row.name))
                .map(|row| row.name.clone())
                .collect();
            if !names.is_empty() {
                return Err(StoreError::DuplicateExists { names });
            }
        }

        let mut persisted = 0;
        for row in rows {
            let changed = match records.get(&row.name) {
                None => true,
                Some(existing) => match policy {
                    DuplicateHandling::Skip => {
                        existing.etag != row.etag
                            || existing.last_modified != row.last_modified
                            || existing.size != row.size
                    }
                    DuplicateHandling::Replace | DuplicateHandling::Error => true,
                },
            };
            if changed {
                records.insert(row.name.clone(), row.clone());
                persisted += 1;
            }
        }

        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(ChunkOutcome { persisted })
    }

    async fn read_batch(&self, filter: &RecordFilter, limit: usize) -> StoreResult<Vec<StoredRecord>> {
        self.ensure_open()?;
        let mut records = self.records.lock().await;

        let mut oldest: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
        for record in records.values() {
            if record.status == RecordStatus::Discovered
                && record.matches(&filter.collection_id, &filter.path_filter)
            {
                oldest
                    .entry(record.granule_id.as_str())
                    .and_modify(|ts| *ts = (*ts).min(record.discovered_date))
                    .or_insert(record.discovered_date);
            }
        }

        let mut granules: Vec<(DateTime<Utc>, &str)> = oldest.into_iter().map(|(id, ts)| (ts, id)).collect();
        granules.sort();
        let picked: HashSet<String> = granules
            .into_iter()
            .take(limit)
            .map(|(_, id)| id.to_string())
            .collect();

        let mut batch = Vec::new();
        for record in records.values_mut() {
            if record.status == RecordStatus::Discovered
                && picked.contains(&record.granule_id)
                && record.matches(&filter.collection_id, &filter.path_filter)
            {
                record.status = RecordStatus::Queued;
                batch.push(record.clone());
            }
        }

        batch.sort_by(|a, b| {
            a.discovered_date
                .cmp(&b.discovered_date)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(batch)
    }

    async fn count(&self, filter: &RecordFilter, status: RecordStatus, count_type: CountType) -> StoreResult<u64> {
        self.ensure_open()?;
        let records = self.records.lock().await;

        let matching = records
            .values()
            .filter(|r| r.status == status && r.matches(&filter.collection_id, &filter.path_filter));

        let count = match count_type {
            CountType::Files => matching.count(),
            CountType::Granules => matching.map(|r| r.granule_id.as_str()).collect::<HashSet<_>>().len(),
        };
        Ok(count as u64)
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::candidate::Candidate;
    use chrono::TimeZone;

    fn row(name: &str, granule: &str, etag: &str) -> StoredRecord {
        let candidate = Candidate::new(name, granule, "C___1").with_etag(etag);
        StoredRecord::discovered(&candidate, Utc::now())
    }

    #[tokio::test]
    async fn test_skip_only_writes_changes() {
        let engine = MemoryEngine::new();
        let first = vec![row("a", "g1", "e1"), row("b", "g2", "e1")];
        assert_eq!(engine.write_chunk(DuplicateHandling::Skip, &first).await.unwrap().persisted, 2);

        let again = vec![row("a", "g1", "e1"), row("b", "g2", "e2")];
        assert_eq!(engine.write_chunk(DuplicateHandling::Skip, &again).await.unwrap().persisted, 1);
        assert_eq!(engine.get("b").await.unwrap().etag, "e2");
        assert_eq!(engine.commits(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_read_batches_are_disjoint() {
        let engine = MemoryEngine::new();
        let rows: Vec<_> = (0..200).map(|i| row(&format!("f{i}"), &format!("g{i}"), "e")).collect();
        engine.write_chunk(DuplicateHandling::Skip, &rows).await.unwrap();
        let filter = RecordFilter::new("C___1", "");

        let (a, b) = tokio::join!(engine.read_batch(&filter, 150), engine.read_batch(&filter, 150));
        let (a, b) = (a.unwrap(), b.unwrap());

        let names: HashSet<&str> = a.iter().chain(&b).map(|r| r.name.as_str()).collect();
        assert_eq!(a.len() + b.len(), 200);
        assert_eq!(names.len(), 200);
        assert_eq!(a.len().max(b.len()), 150);
    }

    #[tokio::test]
    async fn test_error_policy_commits_nothing() {
        let engine = MemoryEngine::new();
        engine
            .write_chunk(DuplicateHandling::Error, &[row("a", "g1", "e1")])
            .await
            .unwrap();

        let err = engine
            .write_chunk(DuplicateHandling::Error, &[row("new", "g2", "e1"), row("a", "g1", "e1")])
            .await
            .unwrap_err();

        match err {
            StoreError::DuplicateExists { names } => assert_eq!(names, vec!["a".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(engine.get("new").await.is_none());
    }

    #[tokio::test]
    async fn test_read_batch_groups_by_granule_oldest_first() {
        let engine = MemoryEngine::new();
        engine
            .write_chunk(
                DuplicateHandling::Skip,
                &[row("g1.h5", "g1", "e"), row("g1.xml", "g1", "e"), row("g2.h5", "g2", "e"), row("g3.h5", "g3", "e")],
            )
            .await
            .unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        engine.set_discovered_date("g3.h5", base).await;
        engine.set_discovered_date("g1.h5", base + chrono::Duration::seconds(1)).await;
        engine.set_discovered_date("g1.xml", base + chrono::Duration::seconds(2)).await;
        engine.set_discovered_date("g2.h5", base + chrono::Duration::seconds(3)).await;

        let filter = RecordFilter::new("C___1", "");
        let batch = engine.read_batch(&filter, 2).await.unwrap();

        let names: Vec<_> = batch.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["g3.h5", "g1.h5", "g1.xml"]);
        assert!(batch.iter().all(|r| r.status == RecordStatus::Queued));
        assert_eq!(engine.get("g2.h5").await.unwrap().status, RecordStatus::Discovered);
    }

    #[tokio::test]
    async fn test_closed_engine_rejects_calls() {
        let engine = MemoryEngine::new();
        engine.close().await.unwrap();
        engine.close().await.unwrap();

        let filter = RecordFilter::new("C___1", "");
        assert!(matches!(engine.read_batch(&filter, 1).await, Err(StoreError::Closed)));
    }
}
