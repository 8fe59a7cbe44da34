//! FTP crawler over line-oriented `LIST` output.
//!
//! Rows are Unix `ls -l` lines:
//!
//! ```text
//! -rw-r--r--   1 owner group   1048576 Mar 14 09:26 GPM_2020_001.h5
//! drwxr-xr-x   2 owner group      4096 Jan 05  2019 archive
//! ```
//!
//! A row with fewer than nine columns means the server is not speaking the
//! format we parse, so the crawl fails rather than guessing.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc};

use crate::error::{CrawlError, CrawlResult};
use crate::traits::crawler::{Crawler, TraversalRules};
use crate::types::candidate::{EntryKind, ListingEntry, NO_ETAG};

/// Columns in an `ls -l` row; the last one (name) may contain spaces.
const LIST_COLUMNS: usize = 9;

/// A session that returns raw `LIST` lines for a directory.
#[async_trait]
pub trait LineListing: Send + Sync {
    async fn list_lines(&self, path: &str) -> CrawlResult<Vec<String>>;
}

/// Parsed `ls -l` row.
#[derive(Debug, Clone, PartialEq)]
pub struct ListLine {
    pub kind: EntryKind,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub name: String,
}

/// Parse one `LIST` line. `now` resolves rows that omit the year.
pub fn parse_list_line(path: &str, line: &str, now: DateTime<Utc>) -> CrawlResult<ListLine> {
    let malformed = |reason: &str| CrawlError::MalformedListing {
        path: path.to_string(),
        row: line.to_string(),
        reason: reason.to_string(),
    };

    let (fields, name) = split_columns(line, LIST_COLUMNS - 1)
        .ok_or_else(|| malformed("expected 9 columns"))?;

    let kind = match fields[0].chars().next() {
        Some('d') => EntryKind::Directory,
        Some('-') => EntryKind::File,
        Some(_) => EntryKind::Other,
        None => return Err(malformed("empty permission column")),
    };

    let size = fields[4]
        .parse::<u64>()
        .map_err(|_| malformed("size column is not a number"))?;

    // Symlinks list as "name -> target"
    let name = match kind {
        EntryKind::Other => name.split(" -> ").next().unwrap_or(name),
        _ => name,
    };

    Ok(ListLine {
        kind,
        size,
        last_modified: parse_list_timestamp(fields[5], fields[6], fields[7], now),
        name: name.to_string(),
    })
}

/// Split off `count` whitespace-separated columns and return them with the
/// untouched remainder of the line.
fn split_columns(line: &str, count: usize) -> Option<(Vec<&str>, &str)> {
    let mut fields = Vec::with_capacity(count);
    let mut rest = line.trim_start();

    while fields.len() < count {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }

    let rest = rest.trim_end_matches(['\r', '\n']);
    if rest.is_empty() {
        None
    } else {
        Some((fields, rest))
    }
}

/// `Mar 14 09:26` (this year, or last year if that would be in the future)
/// or `Jan 05 2019`.
fn parse_list_timestamp(month: &str, day: &str, year_or_time: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let month = match month.to_ascii_lowercase().as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    let day: u32 = day.parse().ok()?;

    if let Some((hour, minute)) = year_or_time.split_once(':') {
        let time = NaiveTime::from_hms_opt(hour.parse().ok()?, minute.parse().ok()?, 0)?;
        // Feb 29 only exists in one of the two candidate years
        let this_year = NaiveDate::from_ymd_opt(now.year(), month, day)
            .map(|date| Utc.from_utc_datetime(&date.and_time(time)))
            .filter(|ts| *ts <= now);
        if this_year.is_some() {
            return this_year;
        }
        let last_year = NaiveDate::from_ymd_opt(now.year() - 1, month, day)?.and_time(time);
        return Some(Utc.from_utc_datetime(&last_year));
    }

    let year: i32 = year_or_time.parse().ok()?;
    let midnight = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&midnight))
}

pub(crate) fn join_remote(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Crawler for FTP providers.
pub struct FtpCrawler<S: LineListing> {
    session: S,
    host: String,
    root: String,
    rules: TraversalRules,
}

impl<S: LineListing> FtpCrawler<S> {
    pub fn new(session: S, host: impl Into<String>, root: impl Into<String>, rules: TraversalRules) -> Self {
        let root = root.into();
        Self {
            session,
            host: host.into(),
            root: if root.starts_with('/') { root } else { format!("/{root}") },
            rules,
        }
    }
}

#[async_trait]
impl<S: LineListing> Crawler for FtpCrawler<S> {
    type Row = String;

    fn root(&self) -> &str {
        &self.root
    }

    fn rules(&self) -> &TraversalRules {
        &self.rules
    }

    async fn list_children(&self, path: &str) -> CrawlResult<Vec<String>> {
        let lines = self.session.list_lines(path).await?;
        // Some servers prefix the listing with a "total N" summary
        Ok(lines
            .into_iter()
            .filter(|l| !l.trim().is_empty() && !l.starts_with("total "))
            .collect())
    }

    fn classify_entry(&self, parent: &str, row: String) -> CrawlResult<ListingEntry> {
        let line = parse_list_line(parent, &row, Utc::now())?;
        let kind = match line.name.as_str() {
            "." | ".." => EntryKind::Other,
            _ => line.kind,
        };
        let path = join_remote(parent, &line.name);
        let name = format!("ftp://{}{}", self.host, path);

        Ok(ListingEntry::new(path, name, kind)
            .with_etag(NO_ETAG)
            .with_last_modified(line.last_modified)
            .with_size(line.size))
    }

    fn name(&self) -> &str {
        "ftp"
    }
}

#[cfg(feature = "ftp")]
pub use self::session::SuppaFtpSession;

#[cfg(feature = "ftp")]
mod session {
    use std::io::ErrorKind;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use suppaftp::{FtpError, FtpStream};
    use tracing::info;

    use super::LineListing;
    use crate::error::{CrawlError, CrawlResult};

    /// Blocking `suppaftp` stream driven from the tokio blocking pool.
    pub struct SuppaFtpSession {
        stream: Arc<Mutex<FtpStream>>,
    }

    impl SuppaFtpSession {
        pub async fn connect(
            host: &str,
            port: u16,
            username: Option<&str>,
            password: Option<&str>,
            timeout: Duration,
        ) -> CrawlResult<Self> {
            let addr = format!("{host}:{port}");
            let user = username.unwrap_or("anonymous").to_string();
            let pass = password.unwrap_or("").to_string();

            let stream = tokio::task::spawn_blocking(move || -> Result<FtpStream, FtpError> {
                let mut stream = FtpStream::connect(addr.as_str())?;
                stream
                    .get_ref()
                    .set_read_timeout(Some(timeout))
                    .map_err(FtpError::ConnectionError)?;
                stream.login(user.as_str(), pass.as_str())?;
                Ok(stream)
            })
            .await
            .map_err(|e| CrawlError::transport(host, e))?
            .map_err(|e| map_ftp_error(host, e))?;

            info!(host, port, "FTP session established");
            Ok(Self {
                stream: Arc::new(Mutex::new(stream)),
            })
        }
    }

    fn map_ftp_error(path: &str, error: FtpError) -> CrawlError {
        match error {
            FtpError::ConnectionError(ref e)
                if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) =>
            {
                CrawlError::Timeout {
                    path: path.to_string(),
                }
            }
            other => CrawlError::transport(path, other),
        }
    }

    #[async_trait]
    impl LineListing for SuppaFtpSession {
        async fn list_lines(&self, path: &str) -> CrawlResult<Vec<String>> {
            let stream = self.stream.clone();
            let target = path.to_string();

            tokio::task::spawn_blocking(move || -> CrawlResult<Vec<String>> {
                let mut stream = stream
                    .lock()
                    .map_err(|_| CrawlError::transport(target.as_str(), "FTP session lock poisoned"))?;
                stream
                    .list(Some(target.as_str()))
                    .map_err(|e| map_ftp_error(&target, e))
            })
            .await
            .map_err(|e| CrawlError::transport(path, e))?
        }
    }
}
