//! Crawler trait and the depth-limited traversal every protocol shares.
//!
//! A protocol supplies three primitives:
//! - `list_children` - raw listing rows for one path
//! - `classify_entry` - turn a raw row into a file/directory/other entry
//! - `finish` - optional post-processing once traversal is complete
//!
//! [`Crawler::discover`] composes them into the recursive walk:
//!
//! ```text
//! list_children(path) -> classify_entry(row)* -> files: pattern match -> Candidate
//!                                             -> dirs:  pattern match && depth > 0 -> recurse(depth - 1)
//! ```
//!
//! Each level returns its own candidates; the caller appends them. Nothing
//! is accumulated in shared state.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use regex::Regex;
use tracing::{debug, info};

use crate::error::{CrawlError, CrawlResult};
use crate::types::candidate::{Candidate, EntryKind, GranuleIdExtractor, ListingEntry};
use crate::types::config::{clamp_depth, CollectionConfig};

/// Filters and limits applied during traversal.
#[derive(Debug, Clone)]
pub struct TraversalRules {
    pub collection_id: String,
    file_pattern: Option<Regex>,
    dir_pattern: Option<Regex>,
    granule_id: GranuleIdExtractor,
    depth: u32,
}

impl TraversalRules {
    /// Build rules with no patterns and depth 0.
    pub fn new(collection_id: impl Into<String>) -> Self {
        Self {
            collection_id: collection_id.into(),
            file_pattern: None,
            dir_pattern: None,
            granule_id: GranuleIdExtractor::default(),
            depth: 0,
        }
    }

    pub fn from_collection(collection: &CollectionConfig) -> CrawlResult<Self> {
        Ok(Self::new(collection.collection_id())
            .with_file_pattern(collection.file_pattern.as_deref())?
            .with_dir_pattern(collection.dir_pattern.as_deref())?
            .with_granule_id_pattern(collection.granule_id_extraction.as_deref())?
            .with_depth(collection.depth))
    }

    pub fn with_file_pattern(mut self, pattern: Option<&str>) -> CrawlResult<Self> {
        self.file_pattern = compile(pattern)?;
        Ok(self)
    }

    pub fn with_dir_pattern(mut self, pattern: Option<&str>) -> CrawlResult<Self> {
        self.dir_pattern = compile(pattern)?;
        Ok(self)
    }

    pub fn with_granule_id_pattern(mut self, pattern: Option<&str>) -> CrawlResult<Self> {
        self.granule_id = GranuleIdExtractor::new(pattern)?;
        Ok(self)
    }

    /// Requested depth, clamped to `min(|depth|, 3)`.
    pub fn with_depth(mut self, depth: i32) -> Self {
        self.depth = clamp_depth(depth);
        self
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn accepts_file(&self, entry: &ListingEntry) -> bool {
        self.file_pattern
            .as_ref()
            .map_or(true, |p| p.is_match(entry.basename()))
    }

    pub fn accepts_dir(&self, entry: &ListingEntry) -> bool {
        self.dir_pattern
            .as_ref()
            .map_or(true, |p| p.is_match(entry.basename()))
    }

    pub fn candidate(&self, entry: ListingEntry) -> Candidate {
        Candidate::from_entry(entry, &self.collection_id, &self.granule_id)
    }
}

fn compile(pattern: Option<&str>) -> CrawlResult<Option<Regex>> {
    pattern
        .map(|p| {
            Regex::new(p).map_err(|source| CrawlError::InvalidPattern {
                pattern: p.to_string(),
                source,
            })
        })
        .transpose()
}

/// A protocol-specific provider listing.
#[async_trait]
pub trait Crawler: Send + Sync {
    /// One raw listing row as the transport returns it.
    type Row: Send;

    /// Path traversal starts from.
    fn root(&self) -> &str;

    fn rules(&self) -> &TraversalRules;

    /// List the immediate children of `path`.
    ///
    /// Paginated listings must be fully drained before returning.
    async fn list_children(&self, path: &str) -> CrawlResult<Vec<Self::Row>>;

    /// Classify one raw row found under `parent`.
    ///
    /// A row that violates the protocol's format is an error, never `Other`.
    fn classify_entry(&self, parent: &str, row: Self::Row) -> CrawlResult<ListingEntry>;

    /// Runs after traversal with every accepted candidate.
    async fn finish(&self, candidates: Vec<Candidate>) -> CrawlResult<Vec<Candidate>> {
        Ok(candidates)
    }

    /// Walk the provider from `root()` and return every accepted file.
    async fn discover(&self) -> CrawlResult<Vec<Candidate>> {
        let rules = self.rules();
        info!(
            root = self.root(),
            collection_id = %rules.collection_id,
            depth = rules.depth(),
            "Discovery starting"
        );

        let candidates = traverse(self, self.root().to_string(), rules.depth()).await?;
        let candidates = self.finish(candidates).await?;

        info!(
            root = self.root(),
            collection_id = %rules.collection_id,
            candidates = candidates.len(),
            "Discovery completed"
        );
        Ok(candidates)
    }

    /// Protocol name (for logging/debugging).
    fn name(&self) -> &str {
        "unknown"
    }
}

/// One level of the depth-first walk. Returns this level's candidates
/// followed by those of each accepted subdirectory, in listing order.
fn traverse<'a, C>(crawler: &'a C, path: String, depth: u32) -> BoxFuture<'a, CrawlResult<Vec<Candidate>>>
where
    C: Crawler + ?Sized,
{
    async move {
        let rules = crawler.rules();
        let rows = crawler.list_children(&path).await?;

        let mut found = Vec::new();
        let mut subdirs = Vec::new();
        let mut ignored = 0usize;

        for row in rows {
            let entry = crawler.classify_entry(&path, row)?;
            match entry.kind {
                EntryKind::File if rules.accepts_file(&entry) => {
                    found.push(rules.candidate(entry));
                }
                EntryKind::File => {
                    debug!(path = %path, name = %entry.name, "File does not match pattern");
                }
                EntryKind::Directory if depth == 0 => {
                    debug!(path = %path, name = %entry.name, "Depth exhausted, not descending");
                }
                EntryKind::Directory if rules.accepts_dir(&entry) => {
                    subdirs.push(entry.path);
                }
                EntryKind::Directory => {
                    debug!(path = %path, name = %entry.name, "Directory does not match pattern");
                }
                EntryKind::Other => {
                    ignored += 1;
                    debug!(path = %path, name = %entry.name, "Entry is neither file nor directory");
                }
            }
        }

        debug!(
            path = %path,
            depth,
            files = found.len(),
            subdirs = subdirs.len(),
            ignored,
            "Listed path"
        );

        for dir in subdirs {
            let nested = traverse(crawler, dir, depth - 1).await?;
            found.extend(nested);
        }

        Ok(found)
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory tree: path -> (child path, kind).
    struct TreeCrawler {
        tree: HashMap<String, Vec<(String, EntryKind)>>,
        rules: TraversalRules,
        listed: Mutex<Vec<String>>,
    }

    impl TreeCrawler {
        fn new(rules: TraversalRules) -> Self {
            Self {
                tree: HashMap::new(),
                rules,
                listed: Mutex::new(Vec::new()),
            }
        }

        fn dir(mut self, path: &str, children: &[(&str, EntryKind)]) -> Self {
            self.tree.insert(
                path.to_string(),
                children
                    .iter()
                    .map(|(name, kind)| (format!("{path}/{name}"), *kind))
                    .collect(),
            );
            self
        }
    }

    #[async_trait]
    impl Crawler for TreeCrawler {
        type Row = (String, EntryKind);

        fn root(&self) -> &str {
            "root"
        }

        fn rules(&self) -> &TraversalRules {
            &self.rules
        }

        async fn list_children(&self, path: &str) -> CrawlResult<Vec<Self::Row>> {
            self.listed.lock().unwrap().push(path.to_string());
            Ok(self.tree.get(path).cloned().unwrap_or_default())
        }

        fn classify_entry(&self, _parent: &str, row: Self::Row) -> CrawlResult<ListingEntry> {
            if row.0.ends_with("broken") {
                return Err(CrawlError::MalformedListing {
                    path: row.0.clone(),
                    row: row.0,
                    reason: "test".into(),
                });
            }
            Ok(ListingEntry::new(row.0.clone(), format!("mem://{}", row.0), row.1))
        }
    }

    /// root/l1/l2/l3/l4/l5, one file per level.
    fn deep_tree(rules: TraversalRules) -> TreeCrawler {
        use EntryKind::*;
        TreeCrawler::new(rules)
            .dir("root", &[("f0.h5", File), ("l1", Directory)])
            .dir("root/l1", &[("f1.h5", File), ("l2", Directory)])
            .dir("root/l1/l2", &[("f2.h5", File), ("l3", Directory)])
            .dir("root/l1/l2/l3", &[("f3.h5", File), ("l4", Directory)])
            .dir("root/l1/l2/l3/l4", &[("f4.h5", File), ("l5", Directory)])
            .dir("root/l1/l2/l3/l4/l5", &[("f5.h5", File)])
    }

    #[tokio::test]
    async fn test_depth_is_clamped_to_three_levels() {
        let crawler = deep_tree(TraversalRules::new("C___1").with_depth(100));

        let candidates = crawler.discover().await.unwrap();
        let names: Vec<_> = candidates.iter().map(|c| c.granule_id.as_str()).collect();

        assert_eq!(names, vec!["f0", "f1", "f2", "f3"]);
        assert_eq!(crawler.listed.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_depth_zero_lists_root_only() {
        let crawler = deep_tree(TraversalRules::new("C___1"));

        let candidates = crawler.discover().await.unwrap();

        assert_eq!(candidates.len(), 1);
        assert_eq!(*crawler.listed.lock().unwrap(), vec!["root".to_string()]);
    }

    #[tokio::test]
    async fn test_patterns_filter_files_and_dirs() {
        use EntryKind::*;
        let rules = TraversalRules::new("C___1")
            .with_file_pattern(Some(r"\.h5$"))
            .unwrap()
            .with_dir_pattern(Some(r"^20\d\d$"))
            .unwrap()
            .with_depth(2);
        let crawler = TreeCrawler::new(rules)
            .dir(
                "root",
                &[
                    ("a.h5", File),
                    ("a.txt", File),
                    ("2020", Directory),
                    ("tmp", Directory),
                    ("link", Other),
                ],
            )
            .dir("root/2020", &[("b.h5", File)])
            .dir("root/tmp", &[("c.h5", File)]);

        let candidates = crawler.discover().await.unwrap();
        let names: Vec<_> = candidates.iter().map(|c| c.name.as_str()).collect();

        assert_eq!(names, vec!["mem://root/a.h5", "mem://root/2020/b.h5"]);
        assert!(!crawler.listed.lock().unwrap().contains(&"root/tmp".to_string()));
    }

    #[tokio::test]
    async fn test_malformed_row_aborts_crawl() {
        use EntryKind::*;
        let crawler = TreeCrawler::new(TraversalRules::new("C___1").with_depth(1))
            .dir("root", &[("a.h5", File), ("sub", Directory)])
            .dir("root/sub", &[("broken", File)]);

        let err = crawler.discover().await.unwrap_err();
        assert!(matches!(err, CrawlError::MalformedListing { .. }));
    }

    #[test]
    fn test_from_collection_rejects_bad_pattern() {
        let collection: CollectionConfig = serde_json::from_value(serde_json::json!({
            "name": "C", "version": "1", "file_pattern": "[unclosed"
        }))
        .unwrap();

        let err = TraversalRules::from_collection(&collection).unwrap_err();
        assert!(matches!(err, CrawlError::InvalidPattern { .. }));
    }
}
