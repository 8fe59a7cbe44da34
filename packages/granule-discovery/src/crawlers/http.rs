//! HTTP crawler over server-generated directory index pages.
//!
//! Handles the two common index layouts:
//! - Apache `FancyIndexing` tables: one `<tr>` per entry, date and size in cells
//! - nginx/Apache `<pre>` listings: anchor followed by "date time size" text
//!
//! Anchors ending in `/` are directories. Sort links, fragments and anything
//! outside the listed URL (parent directory, absolute links elsewhere) are
//! classified as `Other`.

use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::header::{CONTENT_LENGTH, ETAG, LAST_MODIFIED};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{CrawlError, CrawlResult};
use crate::traits::crawler::{Crawler, TraversalRules};
use crate::types::candidate::{Candidate, EntryKind, ListingEntry};
use crate::workers::run_bounded;

static ANCHOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").expect("valid selector"));
static CELL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").expect("valid selector"));

const INDEX_DATE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S", "%d-%b-%Y %H:%M"];

/// One anchor from an index page plus whatever metadata sat next to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRow {
    pub href: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub size: Option<u64>,
}

/// Metadata returned by a `HEAD` request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadMetadata {
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub size: Option<u64>,
}

/// Transport used by the HTTP crawler.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// GET `url` and return the body of a successful response.
    async fn get_text(&self, url: &str) -> CrawlResult<String>;

    async fn head(&self, url: &str) -> CrawlResult<HeadMetadata>;
}

/// `reqwest` implementation of [`PageFetcher`].
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> CrawlResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("granule-discovery/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CrawlError::transport("http client", e))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn map_reqwest_error(url: &str, error: reqwest::Error) -> CrawlError {
    if error.is_timeout() {
        CrawlError::Timeout { path: url.to_string() }
    } else {
        CrawlError::transport(url, error)
    }
}

#[async_trait]
impl PageFetcher for ReqwestFetcher {
    async fn get_text(&self, url: &str) -> CrawlResult<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| map_reqwest_error(url, e))?
            .error_for_status()
            .map_err(|e| map_reqwest_error(url, e))?;

        response.text().await.map_err(|e| map_reqwest_error(url, e))
    }

    async fn head(&self, url: &str) -> CrawlResult<HeadMetadata> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| map_reqwest_error(url, e))?
            .error_for_status()
            .map_err(|e| map_reqwest_error(url, e))?;

        let headers = response.headers();
        let header = |name: reqwest::header::HeaderName| headers.get(name).and_then(|v| v.to_str().ok());

        Ok(HeadMetadata {
            etag: header(ETAG).map(|v| v.trim_matches('"').to_string()),
            last_modified: header(LAST_MODIFIED)
                .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
                .map(|ts| ts.with_timezone(&Utc)),
            size: header(CONTENT_LENGTH).and_then(|v| v.parse().ok()),
        })
    }
}

/// Crawler for HTTP(S) directory indexes.
pub struct HttpCrawler<F: PageFetcher> {
    fetcher: F,
    root: String,
    rules: TraversalRules,
    head_metadata: bool,
    concurrency: usize,
}

impl<F: PageFetcher> HttpCrawler<F> {
    /// `root` must be an absolute URL; a trailing `/` is added if missing.
    pub fn new(fetcher: F, root: &str, rules: TraversalRules) -> CrawlResult<Self> {
        let mut url = Url::parse(root).map_err(|_| CrawlError::InvalidUrl { url: root.to_string() })?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }

        Ok(Self {
            fetcher,
            root: url.to_string(),
            rules,
            head_metadata: false,
            concurrency: 8,
        })
    }

    /// Issue a `HEAD` per accepted file to fill in etag, size and date.
    pub fn with_head_metadata(mut self, enabled: bool) -> Self {
        self.head_metadata = enabled;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

#[async_trait]
impl<F: PageFetcher> Crawler for HttpCrawler<F> {
    type Row = IndexRow;

    fn root(&self) -> &str {
        &self.root
    }

    fn rules(&self) -> &TraversalRules {
        &self.rules
    }

    async fn list_children(&self, path: &str) -> CrawlResult<Vec<IndexRow>> {
        let html = self.fetcher.get_text(path).await?;
        Ok(parse_index(&html))
    }

    fn classify_entry(&self, parent: &str, row: IndexRow) -> CrawlResult<ListingEntry> {
        let base = Url::parse(parent).map_err(|_| CrawlError::InvalidUrl { url: parent.to_string() })?;

        let resolved = match base.join(&row.href) {
            Ok(url) if !row.href.starts_with(|c: char| c == '?' || c == '#') => url,
            _ => return Ok(ListingEntry::new(row.href.clone(), row.href, EntryKind::Other)),
        };
        let location = resolved.to_string();

        let kind = if location.len() <= parent.len() || !location.starts_with(parent) || resolved.query().is_some() {
            EntryKind::Other
        } else if resolved.path().ends_with('/') {
            EntryKind::Directory
        } else {
            EntryKind::File
        };

        Ok(ListingEntry::new(location.clone(), location, kind)
            .with_last_modified(row.last_modified)
            .with_size(row.size.unwrap_or(0)))
    }

    async fn finish(&self, candidates: Vec<Candidate>) -> CrawlResult<Vec<Candidate>> {
        if !self.head_metadata || candidates.is_empty() {
            return Ok(candidates);
        }

        let total = candidates.len();
        let fetcher = &self.fetcher;
        let enriched = run_bounded(candidates, self.concurrency, |c| c.name.clone(), move |mut candidate| async move {
            let head = fetcher.head(&candidate.name).await?;
            if let Some(etag) = head.etag {
                candidate.etag = etag;
            }
            if head.last_modified.is_some() {
                candidate.last_modified = head.last_modified;
            }
            if let Some(size) = head.size {
                candidate.size = size;
            }
            Ok(candidate)
        })
        .await?;

        info!(root = %self.root, files = total, "Enriched candidates from HEAD");
        Ok(enriched)
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Extract every anchor from an index page, in document order, with the
/// date and size the server printed alongside it.
pub fn parse_index(html: &str) -> Vec<IndexRow> {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut rows = Vec::new();

    for anchor in document.select(&ANCHOR) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if !seen.insert(href.to_string()) {
            continue;
        }

        let (last_modified, size) = match enclosing_row(&anchor) {
            Some(tr) => table_metadata(&tr, &anchor),
            None => trailing_text_metadata(&anchor),
        };

        rows.push(IndexRow {
            href: href.to_string(),
            last_modified,
            size,
        });
    }

    debug!(anchors = rows.len(), "Parsed index page");
    rows
}

fn enclosing_row<'a>(anchor: &ElementRef<'a>) -> Option<ElementRef<'a>> {
    anchor
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "tr")
}

fn table_metadata(tr: &ElementRef<'_>, anchor: &ElementRef<'_>) -> (Option<DateTime<Utc>>, Option<u64>) {
    let mut last_modified = None;
    let mut size = None;

    for cell in tr.select(&CELL) {
        if cell.descendants().any(|n| n.id() == anchor.id()) {
            continue;
        }
        let text = cell.text().collect::<String>();
        let text = text.trim();
        if last_modified.is_none() {
            if let Some(ts) = parse_index_date(text) {
                last_modified = Some(ts);
                continue;
            }
        }
        if size.is_none() {
            size = parse_size(text);
        }
    }

    (last_modified, size)
}

fn trailing_text_metadata(anchor: &ElementRef<'_>) -> (Option<DateTime<Utc>>, Option<u64>) {
    let Some(text) = anchor.next_sibling().and_then(|n| n.value().as_text().map(|t| t.to_string())) else {
        return (None, None);
    };
    let line = text.lines().next().unwrap_or_default();
    let tokens: Vec<&str> = line.split_whitespace().collect();

    match tokens.as_slice() {
        [date, time, size, ..] => (parse_index_date(&format!("{date} {time}")), parse_size(size)),
        [date, time] => (parse_index_date(&format!("{date} {time}")), None),
        _ => (None, None),
    }
}

/// Parse the timestamp formats Apache and nginx print in index pages.
pub fn parse_index_date(text: &str) -> Option<DateTime<Utc>> {
    INDEX_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Parse a human-readable size column ("512", "1.2K", "3M", "1.5G").
///
/// `-` (directories) and anything unparseable yield `None`.
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let (number, multiplier) = match text.char_indices().last()? {
        (i, c) if c.is_ascii_alphabetic() => {
            let multiplier = match c.to_ascii_uppercase() {
                'K' => 1u64 << 10,
                'M' => 1 << 20,
                'G' => 1 << 30,
                'T' => 1 << 40,
                _ => return None,
            };
            (&text[..i], multiplier)
        }
        _ => (text, 1),
    };

    if multiplier == 1 {
        return number.parse().ok();
    }
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        warn!(size = text, "Ignoring unparseable size column");
        return None;
    }
    Some((value * multiplier as f64).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPageFetcher;
    use chrono::TimeZone;

    const APACHE_TABLE: &str = r#"
        <html><body><table>
        <tr><th><a href="?C=N;O=D">Name</a></th><th><a href="?C=M;O=A">Last modified</a></th><th>Size</th></tr>
        <tr><td><a href="/pub/">Parent Directory</a></td><td>&nbsp;</td><td align="right">-</td></tr>
        <tr><td><a href="2020/">2020/</a></td><td align="right">2023-01-05 13:45  </td><td align="right">-</td></tr>
        <tr><td><a href="GPM_001.h5">GPM_001.h5</a></td><td align="right">2023-01-06 08:00  </td><td align="right">1.5M</td></tr>
        </table></body></html>"#;

    const NGINX_PRE: &str = "<html><body><h1>Index of /data/</h1><hr><pre><a href=\"../\">../</a>\n\
        <a href=\"2021/\">2021/</a>                                              05-Jan-2023 13:45                   -\n\
        <a href=\"b.h5\">b.h5</a>                                                06-Jan-2023 09:30                2048\n\
        </pre><hr></body></html>";

    #[test]
    fn test_parse_apache_table() {
        let rows = parse_index(APACHE_TABLE);

        let hrefs: Vec<_> = rows.iter().map(|r| r.href.as_str()).collect();
        assert_eq!(hrefs, vec!["?C=N;O=D", "?C=M;O=A", "/pub/", "2020/", "GPM_001.h5"]);

        let file = &rows[4];
        assert_eq!(file.last_modified, Some(Utc.with_ymd_and_hms(2023, 1, 6, 8, 0, 0).unwrap()));
        assert_eq!(file.size, Some(1_572_864));
        assert_eq!(rows[3].size, None);
    }

    #[test]
    fn test_parse_pre_listing() {
        let rows = parse_index(NGINX_PRE);

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].href, "2021/");
        assert_eq!(rows[1].last_modified, Some(Utc.with_ymd_and_hms(2023, 1, 5, 13, 45, 0).unwrap()));
        assert_eq!(rows[2].size, Some(2048));
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("512K"), Some(524_288));
        assert_eq!(parse_size("1.2M"), Some(1_258_291));
        assert_eq!(parse_size("-"), None);
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("12Q"), None);
    }

    #[test]
    fn test_classify_entries() {
        let crawler = HttpCrawler::new(MockPageFetcher::new(), "https://host/pub/data", TraversalRules::new("C___1")).unwrap();
        let parent = crawler.root().to_string();
        assert_eq!(parent, "https://host/pub/data/");

        let kind = |href: &str| {
            crawler
                .classify_entry(&parent, IndexRow { href: href.into(), last_modified: None, size: None })
                .unwrap()
                .kind
        };

        assert_eq!(kind("a.h5"), EntryKind::File);
        assert_eq!(kind("2020/"), EntryKind::Directory);
        assert_eq!(kind("https://host/pub/data/b.h5"), EntryKind::File);
        assert_eq!(kind("../"), EntryKind::Other);
        assert_eq!(kind("/pub/"), EntryKind::Other);
        assert_eq!(kind("?C=N;O=D"), EntryKind::Other);
        assert_eq!(kind("#top"), EntryKind::Other);
        assert_eq!(kind("https://elsewhere/a.h5"), EntryKind::Other);
    }

    #[tokio::test]
    async fn test_crawl_table_and_pre_pages() {
        let fetcher = MockPageFetcher::new()
            .with_page("https://host/pub/", APACHE_TABLE)
            .with_page("https://host/pub/2020/", NGINX_PRE);
        let rules = TraversalRules::new("C___1")
            .with_file_pattern(Some(r"\.h5$"))
            .unwrap()
            .with_depth(1);
        let crawler = HttpCrawler::new(fetcher, "https://host/pub/", rules).unwrap();

        let candidates = crawler.discover().await.unwrap();

        let names: Vec<_> = candidates.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["https://host/pub/GPM_001.h5", "https://host/pub/2020/b.h5"]);
        assert_eq!(candidates[0].granule_id, "GPM_001");
    }

    #[tokio::test]
    async fn test_head_enrichment() {
        let ts = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let fetcher = MockPageFetcher::new()
            .with_page("https://host/pub/", APACHE_TABLE)
            .with_head(
                "https://host/pub/GPM_001.h5",
                HeadMetadata {
                    etag: Some("abc".into()),
                    last_modified: Some(ts),
                    size: Some(99),
                },
            );
        let crawler = HttpCrawler::new(fetcher, "https://host/pub/", TraversalRules::new("C___1"))
            .unwrap()
            .with_head_metadata(true);

        let candidates = crawler.discover().await.unwrap();

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].etag, "abc");
        assert_eq!(candidates[0].last_modified, Some(ts));
        assert_eq!(candidates[0].size, 99);
    }

    #[tokio::test]
    async fn test_missing_page_fails_crawl() {
        let crawler = HttpCrawler::new(MockPageFetcher::new(), "https://host/pub/", TraversalRules::new("C___1")).unwrap();

        assert!(matches!(crawler.discover().await, Err(CrawlError::Transport { .. })));
    }
}
