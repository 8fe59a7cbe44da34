//! S3 crawler over delimiter-based object listings.
//!
//! Keys are listed with `/` as delimiter, so each call returns one
//! "directory" worth of objects plus its common prefixes. Common prefixes
//! are directories; zero-byte keys ending in `/` are folder markers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{CrawlError, CrawlResult};
use crate::traits::crawler::{Crawler, TraversalRules};
use crate::types::candidate::{Candidate, EntryKind, ListingEntry};
use crate::workers::run_bounded;

/// One object from a listing page.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSummary {
    pub key: String,
    pub etag: Option<String>,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

impl ObjectSummary {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            etag: None,
            size: 0,
            last_modified: None,
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_last_modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = Some(last_modified);
        self
    }
}

/// One page of a delimiter listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectPage {
    pub objects: Vec<ObjectSummary>,
    pub prefixes: Vec<String>,
    /// Present when more pages follow
    pub next_token: Option<String>,
}

/// Minimal object-store surface the crawler needs.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// List one page of `prefix` using `/` as the delimiter.
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<String>,
    ) -> CrawlResult<ObjectPage>;

    /// Server-side copy of `key` from `source_bucket` into `target_bucket`.
    async fn copy_object(&self, source_bucket: &str, key: &str, target_bucket: &str) -> CrawlResult<()>;
}

/// Raw listing row: either a common prefix or an object.
#[derive(Debug, Clone, PartialEq)]
pub enum S3Row {
    Prefix(String),
    Object(ObjectSummary),
}

/// Crawler for S3 buckets.
pub struct S3Crawler<C: ObjectStoreClient> {
    client: C,
    bucket: String,
    root: String,
    rules: TraversalRules,
    staging_bucket: Option<String>,
    concurrency: usize,
}

impl<C: ObjectStoreClient> S3Crawler<C> {
    pub fn new(client: C, bucket: impl Into<String>, root: &str, rules: TraversalRules) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            root: normalize_prefix(root),
            rules,
            staging_bucket: None,
            concurrency: 8,
        }
    }

    /// Copy every accepted object into `bucket` before `discover` returns.
    pub fn with_staging_bucket(mut self, bucket: Option<String>) -> Self {
        self.staging_bucket = bucket;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    fn object_uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    fn key_of<'a>(&self, name: &'a str) -> Option<&'a str> {
        name.strip_prefix("s3://")?
            .strip_prefix(self.bucket.as_str())?
            .strip_prefix('/')
    }
}

/// Listing prefix for a provider path: no leading slash, trailing slash
/// unless it is the bucket root.
pub fn normalize_prefix(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

#[async_trait]
impl<C: ObjectStoreClient> Crawler for S3Crawler<C> {
    type Row = S3Row;

    fn root(&self) -> &str {
        &self.root
    }

    fn rules(&self) -> &TraversalRules {
        &self.rules
    }

    async fn list_children(&self, path: &str) -> CrawlResult<Vec<S3Row>> {
        let mut rows = Vec::new();
        let mut continuation = None;
        let mut pages = 0usize;

        loop {
            let page = self.client.list_page(&self.bucket, path, continuation).await?;
            pages += 1;

            rows.extend(page.prefixes.into_iter().map(S3Row::Prefix));
            rows.extend(page.objects.into_iter().map(S3Row::Object));

            match page.next_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        debug!(bucket = %self.bucket, prefix = %path, pages, rows = rows.len(), "Drained listing");
        Ok(rows)
    }

    fn classify_entry(&self, parent: &str, row: S3Row) -> CrawlResult<ListingEntry> {
        match row {
            S3Row::Prefix(prefix) => {
                if !prefix.starts_with(parent) || prefix == parent {
                    return Err(CrawlError::MalformedListing {
                        path: parent.to_string(),
                        row: prefix,
                        reason: "common prefix outside the listed prefix".into(),
                    });
                }
                let name = self.object_uri(&prefix);
                Ok(ListingEntry::new(prefix, name, EntryKind::Directory))
            }
            S3Row::Object(object) => {
                let kind = if object.key.ends_with('/') || object.key == parent {
                    EntryKind::Other
                } else {
                    EntryKind::File
                };
                let name = self.object_uri(&object.key);
                let mut entry = ListingEntry::new(object.key, name, kind)
                    .with_last_modified(object.last_modified)
                    .with_size(object.size);
                if let Some(etag) = object.etag {
                    entry = entry.with_etag(etag.trim_matches('"'));
                }
                Ok(entry)
            }
        }
    }

    async fn finish(&self, candidates: Vec<Candidate>) -> CrawlResult<Vec<Candidate>> {
        let Some(staging) = self.staging_bucket.as_deref() else {
            return Ok(candidates);
        };

        let keys = candidates
            .iter()
            .map(|c| {
                self.key_of(&c.name)
                    .map(str::to_string)
                    .ok_or_else(|| CrawlError::InvalidUrl { url: c.name.clone() })
            })
            .collect::<CrawlResult<Vec<_>>>()?;
        let total = keys.len();
        let client = &self.client;
        let bucket = self.bucket.as_str();

        run_bounded(keys, self.concurrency, |key| key.clone(), move |key| async move {
            client.copy_object(bucket, &key, staging).await
        })
        .await?;

        info!(bucket = %self.bucket, staging_bucket = staging, objects = total, "Staged objects");
        Ok(candidates)
    }

    fn name(&self) -> &str {
        "s3"
    }
}

#[cfg(feature = "s3")]
pub use self::sdk::AwsObjectClient;

#[cfg(feature = "s3")]
mod sdk {
    use async_trait::async_trait;
    use aws_sdk_s3::Client;
    use chrono::{DateTime, Utc};

    use super::{ObjectPage, ObjectStoreClient, ObjectSummary};
    use crate::error::{CrawlError, CrawlResult};

    /// `aws-sdk-s3` backed client. Credentials and region come from the
    /// standard AWS environment chain.
    pub struct AwsObjectClient {
        client: Client,
    }

    impl AwsObjectClient {
        pub async fn from_env() -> Self {
            let config = aws_config::load_from_env().await;
            Self {
                client: Client::new(&config),
            }
        }

        pub fn new(client: Client) -> Self {
            Self { client }
        }
    }

    fn to_chrono(ts: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
    }

    #[async_trait]
    impl ObjectStoreClient for AwsObjectClient {
        async fn list_page(
            &self,
            bucket: &str,
            prefix: &str,
            continuation: Option<String>,
        ) -> CrawlResult<ObjectPage> {
            let output = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .delimiter("/")
                .set_continuation_token(continuation)
                .send()
                .await
                .map_err(|e| CrawlError::transport(format!("s3://{bucket}/{prefix}"), e))?;

            let objects = output
                .contents()
                .iter()
                .filter_map(|object| {
                    let key = object.key()?;
                    Some(ObjectSummary {
                        key: key.to_string(),
                        etag: object.e_tag().map(str::to_string),
                        size: object.size().and_then(|s| u64::try_from(s).ok()).unwrap_or(0),
                        last_modified: object.last_modified().and_then(to_chrono),
                    })
                })
                .collect();
            let prefixes = output
                .common_prefixes()
                .iter()
                .filter_map(|p| p.prefix().map(str::to_string))
                .collect();

            Ok(ObjectPage {
                objects,
                prefixes,
                next_token: output.next_continuation_token().map(str::to_string),
            })
        }

        async fn copy_object(&self, source_bucket: &str, key: &str, target_bucket: &str) -> CrawlResult<()> {
            self.client
                .copy_object()
                .copy_source(format!("{source_bucket}/{key}"))
                .bucket(target_bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| CrawlError::transport(format!("s3://{source_bucket}/{key}"), e))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockObjectClient;
    use chrono::TimeZone;

    fn rules(depth: i32) -> TraversalRules {
        TraversalRules::new("C___1")
            .with_file_pattern(Some(r"\.h5$"))
            .unwrap()
            .with_depth(depth)
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix("/data/2020"), "data/2020/");
        assert_eq!(normalize_prefix("data/"), "data/");
        assert_eq!(normalize_prefix("/"), "");
        assert_eq!(normalize_prefix(""), "");
    }

    #[tokio::test]
    async fn test_pagination_is_drained() {
        let ts = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let client = MockObjectClient::new()
            .with_page("data/", vec![ObjectSummary::new("data/a.h5").with_etag("\"e1\"").with_size(5).with_last_modified(ts)], vec![])
            .with_page("data/", vec![ObjectSummary::new("data/b.h5")], vec![])
            .with_page("data/", vec![ObjectSummary::new("data/c.h5")], vec![]);
        let crawler = S3Crawler::new(client, "bucket", "/data", rules(0));

        let candidates = crawler.discover().await.unwrap();

        let names: Vec<_> = candidates.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["s3://bucket/data/a.h5", "s3://bucket/data/b.h5", "s3://bucket/data/c.h5"]);
        assert_eq!(candidates[0].etag, "e1");
        assert_eq!(candidates[0].size, 5);
        assert_eq!(candidates[0].last_modified, Some(ts));
    }

    #[tokio::test]
    async fn test_prefixes_are_directories_and_markers_are_ignored() {
        let client = MockObjectClient::new()
            .with_page(
                "data/",
                vec![ObjectSummary::new("data/"), ObjectSummary::new("data/a.h5")],
                vec!["data/2020/"],
            )
            .with_page("data/2020/", vec![ObjectSummary::new("data/2020/b.h5")], vec![]);
        let crawler = S3Crawler::new(client, "bucket", "data", rules(1));

        let candidates = crawler.discover().await.unwrap();

        let names: Vec<_> = candidates.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["s3://bucket/data/a.h5", "s3://bucket/data/2020/b.h5"]);
    }

    #[tokio::test]
    async fn test_staging_copies_every_candidate() {
        let client = MockObjectClient::new().with_page(
            "data/",
            vec![ObjectSummary::new("data/a.h5"), ObjectSummary::new("data/b.h5")],
            vec![],
        );
        let crawler = S3Crawler::new(client, "bucket", "data", rules(0))
            .with_staging_bucket(Some("staging".into()))
            .with_concurrency(2);

        crawler.discover().await.unwrap();

        let mut copies = crawler.client.copies();
        copies.sort();
        assert_eq!(
            copies,
            vec![
                ("bucket".to_string(), "data/a.h5".to_string(), "staging".to_string()),
                ("bucket".to_string(), "data/b.h5".to_string(), "staging".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_staging_failures_are_aggregated() {
        let client = MockObjectClient::new()
            .with_page(
                "data/",
                vec![
                    ObjectSummary::new("data/a.h5"),
                    ObjectSummary::new("data/b.h5"),
                    ObjectSummary::new("data/c.h5"),
                ],
                vec![],
            )
            .failing_copy("data/b.h5");
        let crawler = S3Crawler::new(client, "bucket", "data", rules(0))
            .with_staging_bucket(Some("staging".into()));

        let err = crawler.discover().await.unwrap_err();

        match err {
            CrawlError::Workers { total, failures } => {
                assert_eq!(total, 3);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].unit, "data/b.h5");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(crawler.client.copies().len(), 2);
    }
}
