//! Testing utilities including mock implementations.
//!
//! These let discovery passes run against scripted providers and an
//! in-memory system of record, without network or database access.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::crawlers::ftp::LineListing;
use crate::crawlers::http::{HeadMetadata, PageFetcher};
use crate::crawlers::s3::{ObjectPage, ObjectStoreClient, ObjectSummary};
use crate::crawlers::sftp::{StatEntry, StatListing};
use crate::error::{CrawlError, CrawlResult, StoreError, StoreResult};
use crate::filters::current_granules;
use crate::traits::crosscheck::{CrossCheck, GranuleStamp};
use crate::types::candidate::Candidate;

/// Collection id used by [`candidate`].
pub const TEST_COLLECTION: &str = "C___1";

/// A candidate in [`TEST_COLLECTION`] whose granule id is its name.
pub fn candidate(name: &str, etag: &str) -> Candidate {
    Candidate::new(name, name, TEST_COLLECTION).with_etag(etag)
}

/// Scripted FTP session returning fixed `LIST` lines per directory.
#[derive(Default)]
pub struct MockLineSession {
    dirs: HashMap<String, Vec<String>>,
    calls: Arc<RwLock<Vec<String>>>,
}

impl MockLineSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines returned when `path` is listed.
    pub fn with_dir(mut self, path: impl Into<String>, lines: &[&str]) -> Self {
        self.dirs
            .insert(path.into(), lines.iter().map(|l| l.to_string()).collect());
        self
    }

    /// Paths listed so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.read().unwrap().clone()
    }
}

#[async_trait]
impl LineListing for MockLineSession {
    async fn list_lines(&self, path: &str) -> CrawlResult<Vec<String>> {
        self.calls.write().unwrap().push(path.to_string());
        self.dirs
            .get(path)
            .cloned()
            .ok_or_else(|| CrawlError::transport(path, "550 No such file or directory"))
    }
}

/// Scripted SFTP session. Entries are grouped under their parent directory
/// in insertion order.
#[derive(Default)]
pub struct MockStatSession {
    dirs: HashMap<String, Vec<StatEntry>>,
}

impl MockStatSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Regular file at `path` with `size` bytes and `mtime` epoch seconds.
    pub fn with_file(self, path: &str, size: u64, mtime: u64) -> Self {
        self.with_entry(StatEntry {
            path: path.to_string(),
            perm: Some(0o100644),
            size: Some(size),
            mtime: Some(mtime),
        })
    }

    pub fn with_dir(mut self, path: &str) -> Self {
        self.dirs.entry(path.to_string()).or_default();
        self.with_entry(StatEntry {
            path: path.to_string(),
            perm: Some(0o040755),
            size: None,
            mtime: None,
        })
    }

    /// Append `entry` to `parent` exactly as given.
    pub fn with_raw(mut self, parent: &str, entry: StatEntry) -> Self {
        self.dirs.entry(parent.to_string()).or_default().push(entry);
        self
    }

    fn with_entry(self, entry: StatEntry) -> Self {
        let parent = match entry.path.rsplit_once('/') {
            Some(("", _)) | None => "/".to_string(),
            Some((parent, _)) => parent.to_string(),
        };
        self.with_raw(&parent, entry)
    }
}

#[async_trait]
impl StatListing for MockStatSession {
    async fn read_dir(&self, path: &str) -> CrawlResult<Vec<StatEntry>> {
        self.dirs
            .get(path)
            .cloned()
            .ok_or_else(|| CrawlError::transport(path, "no such file"))
    }
}

/// Scripted object store.
///
/// Calling [`MockObjectClient::with_page`] repeatedly for one prefix
/// chains the pages through continuation tokens.
#[derive(Default)]
pub struct MockObjectClient {
    pages: HashMap<String, Vec<ObjectPage>>,
    failing_copies: HashSet<String>,
    copies: Arc<RwLock<Vec<(String, String, String)>>>,
}

impl MockObjectClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, prefix: &str, objects: Vec<ObjectSummary>, prefixes: Vec<&str>) -> Self {
        self.pages.entry(prefix.to_string()).or_default().push(ObjectPage {
            objects,
            prefixes: prefixes.into_iter().map(str::to_string).collect(),
            next_token: None,
        });
        self
    }

    /// Fail every copy of `key`.
    pub fn failing_copy(mut self, key: &str) -> Self {
        self.failing_copies.insert(key.to_string());
        self
    }

    /// Successful copies as `(source_bucket, key, target_bucket)`.
    pub fn copies(&self) -> Vec<(String, String, String)> {
        self.copies.read().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStoreClient for MockObjectClient {
    async fn list_page(&self, bucket: &str, prefix: &str, continuation: Option<String>) -> CrawlResult<ObjectPage> {
        let Some(pages) = self.pages.get(prefix) else {
            return Ok(ObjectPage::default());
        };

        let index = match continuation {
            Some(token) => token
                .parse::<usize>()
                .map_err(|e| CrawlError::transport(format!("s3://{bucket}/{prefix}"), e))?,
            None => 0,
        };
        let mut page = pages
            .get(index)
            .cloned()
            .ok_or_else(|| CrawlError::transport(format!("s3://{bucket}/{prefix}"), "invalid continuation token"))?;
        if index + 1 < pages.len() {
            page.next_token = Some((index + 1).to_string());
        }
        Ok(page)
    }

    async fn copy_object(&self, source_bucket: &str, key: &str, target_bucket: &str) -> CrawlResult<()> {
        if self.failing_copies.contains(key) {
            return Err(CrawlError::transport(format!("s3://{source_bucket}/{key}"), "AccessDenied"));
        }
        self.copies.write().unwrap().push((
            source_bucket.to_string(),
            key.to_string(),
            target_bucket.to_string(),
        ));
        Ok(())
    }
}

/// Scripted HTTP server. Unknown URLs fail like a 404.
#[derive(Default)]
pub struct MockPageFetcher {
    pages: HashMap<String, String>,
    heads: HashMap<String, HeadMetadata>,
}

impl MockPageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.pages.insert(url.into(), html.into());
        self
    }

    pub fn with_head(mut self, url: impl Into<String>, metadata: HeadMetadata) -> Self {
        self.heads.insert(url.into(), metadata);
        self
    }
}

#[async_trait]
impl PageFetcher for MockPageFetcher {
    async fn get_text(&self, url: &str) -> CrawlResult<String> {
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| CrawlError::transport(url, "404 Not Found"))
    }

    async fn head(&self, url: &str) -> CrawlResult<HeadMetadata> {
        self.heads
            .get(url)
            .cloned()
            .ok_or_else(|| CrawlError::transport(url, "404 Not Found"))
    }
}

/// In-memory system of record.
#[derive(Default)]
pub struct MemoryCrossCheck {
    granules: HashMap<String, HashMap<String, Option<DateTime<Utc>>>>,
    fail: bool,
    calls: Arc<RwLock<usize>>,
}

impl MemoryCrossCheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// A system of record that is unreachable.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Record `granule_id` of `collection_id` upstream with timestamp `updated_at`.
    pub fn with_granule(
        mut self,
        collection_id: impl Into<String>,
        granule_id: impl Into<String>,
        updated_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.granules
            .entry(collection_id.into())
            .or_default()
            .insert(granule_id.into(), updated_at);
        self
    }

    /// Number of `filter` calls so far.
    pub fn calls(&self) -> usize {
        *self.calls.read().unwrap()
    }
}

#[async_trait]
impl CrossCheck for MemoryCrossCheck {
    async fn filter(&self, collection_id: &str, granules: &[GranuleStamp]) -> StoreResult<HashSet<String>> {
        *self.calls.write().unwrap() += 1;
        if self.fail {
            return Err(StoreError::CrossCheck("connection refused".into()));
        }
        match self.granules.get(collection_id) {
            Some(upstream) => Ok(current_granules(granules, upstream)),
            None => Ok(HashSet::new()),
        }
    }

    fn name(&self) -> &str {
        "memory"
    }
}
