//! SFTP crawler over stat-based directory listings.
//!
//! Each `readdir` row carries the file mode, so classification comes from
//! the `S_IFMT` bits instead of name heuristics.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::crawlers::ftp::join_remote;
use crate::error::CrawlResult;
use crate::traits::crawler::{Crawler, TraversalRules};
use crate::types::candidate::{basename, EntryKind, ListingEntry, NO_ETAG};

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// One `readdir` row: the child's full remote path plus its stat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatEntry {
    pub path: String,
    pub perm: Option<u32>,
    pub size: Option<u64>,
    /// Seconds since the Unix epoch
    pub mtime: Option<u64>,
}

impl StatEntry {
    pub fn kind(&self) -> EntryKind {
        match self.perm.map(|p| p & S_IFMT) {
            Some(S_IFDIR) => EntryKind::Directory,
            Some(S_IFREG) => EntryKind::File,
            _ => EntryKind::Other,
        }
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.mtime?).ok()?;
        Utc.timestamp_opt(secs, 0).single()
    }
}

/// A session that returns stat rows for a directory.
#[async_trait]
pub trait StatListing: Send + Sync {
    async fn read_dir(&self, path: &str) -> CrawlResult<Vec<StatEntry>>;
}

/// Crawler for SFTP providers.
pub struct SftpCrawler<S: StatListing> {
    session: S,
    host: String,
    root: String,
    rules: TraversalRules,
}

impl<S: StatListing> SftpCrawler<S> {
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
impl<S: StatListing> Crawler for SftpCrawler<S> {
    type Row = StatEntry;

    fn root(&self) -> &str {
        &self.root
    }

    fn rules(&self) -> &TraversalRules {
        &self.rules
    }

    async fn list_children(&self, path: &str) -> CrawlResult<Vec<StatEntry>> {
        self.session.read_dir(path).await
    }

    fn classify_entry(&self, parent: &str, row: StatEntry) -> CrawlResult<ListingEntry> {
        // Servers disagree on whether readdir returns bare names or full paths
        let path = if row.path.starts_with('/') {
            row.path.clone()
        } else {
            join_remote(parent, &row.path)
        };
        let kind = match basename(&path) {
            "." | ".." => EntryKind::Other,
            _ => row.kind(),
        };
        let name = format!("sftp://{}{}", self.host, path);

        Ok(ListingEntry::new(path, name, kind)
            .with_etag(NO_ETAG)
            .with_last_modified(row.modified())
            .with_size(row.size.unwrap_or(0)))
    }

    fn name(&self) -> &str {
        "sftp"
    }
}

#[cfg(feature = "sftp")]
pub use self::session::Ssh2Session;

#[cfg(feature = "sftp")]
mod session {
    use std::net::TcpStream;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use ssh2::{ErrorCode, Session, Sftp};
    use tracing::info;

    use super::{StatEntry, StatListing};
    use crate::error::{CrawlError, CrawlResult};

    /// libssh2 returns this code when a blocking call exceeds the session timeout.
    const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

    /// Blocking `ssh2` SFTP channel driven from the tokio blocking pool.
    pub struct Ssh2Session {
        sftp: Arc<Mutex<Sftp>>,
        // Keeps the SSH transport alive for the channel's lifetime
        _session: Session,
    }

    impl Ssh2Session {
        pub async fn connect(
            host: &str,
            port: u16,
            username: &str,
            password: Option<&str>,
            timeout: Duration,
        ) -> CrawlResult<Self> {
            let addr = format!("{host}:{port}");
            let user = username.to_string();
            let pass = password.map(str::to_string);
            let target = host.to_string();

            let (session, sftp) = tokio::task::spawn_blocking(move || -> CrawlResult<(Session, Sftp)> {
                let tcp = TcpStream::connect(&addr).map_err(|e| CrawlError::transport(&addr, e))?;
                let mut session = Session::new().map_err(|e| map_ssh_error(&addr, e))?;
                session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
                session.set_tcp_stream(tcp);
                session.handshake().map_err(|e| map_ssh_error(&addr, e))?;
                match pass {
                    Some(pass) => session.userauth_password(&user, &pass),
                    None => session.userauth_agent(&user),
                }
                .map_err(|e| map_ssh_error(&addr, e))?;
                let sftp = session.sftp().map_err(|e| map_ssh_error(&addr, e))?;
                Ok((session, sftp))
            })
            .await
            .map_err(|e| CrawlError::transport(target.as_str(), e))??;

            info!(host, port, "SFTP session established");
            Ok(Self {
                sftp: Arc::new(Mutex::new(sftp)),
                _session: session,
            })
        }
    }

    fn map_ssh_error(path: &str, error: ssh2::Error) -> CrawlError {
        match error.code() {
            ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => CrawlError::Timeout {
                path: path.to_string(),
            },
            _ => CrawlError::transport(path, error),
        }
    }

    #[async_trait]
    impl StatListing for Ssh2Session {
        async fn read_dir(&self, path: &str) -> CrawlResult<Vec<StatEntry>> {
            let sftp = self.sftp.clone();
            let target = path.to_string();

            tokio::task::spawn_blocking(move || -> CrawlResult<Vec<StatEntry>> {
                let sftp = sftp
                    .lock()
                    .map_err(|_| CrawlError::transport(target.as_str(), "SFTP session lock poisoned"))?;
                let rows = sftp
                    .readdir(Path::new(&target))
                    .map_err(|e| map_ssh_error(&target, e))?;

                Ok(rows
                    .into_iter()
                    .map(|(path, stat)| StatEntry {
                        path: path.to_string_lossy().into_owned(),
                        perm: stat.perm,
                        size: stat.size,
                        mtime: stat.mtime,
                    })
                    .collect())
            })
            .await
            .map_err(|e| CrawlError::transport(path, e))?
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockStatSession;

    #[test]
    fn test_kind_from_mode_bits() {
        let entry = |perm| StatEntry {
            path: "/x".into(),
            perm,
            size: None,
            mtime: None,
        };

        assert_eq!(entry(Some(0o040755)).kind(), EntryKind::Directory);
        assert_eq!(entry(Some(0o100644)).kind(), EntryKind::File);
        assert_eq!(entry(Some(0o120777)).kind(), EntryKind::Other);
        assert_eq!(entry(None).kind(), EntryKind::Other);
    }

    #[test]
    fn test_modified_from_mtime() {
        let entry = StatEntry {
            path: "/x".into(),
            perm: Some(0o100644),
            size: Some(1),
            mtime: Some(1_577_836_800),
        };
        assert_eq!(
            entry.modified(),
            Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_crawl_relative_and_absolute_rows() {
        let session = MockStatSession::new()
            .with_file("/data/a.h5", 10, 1_577_836_800)
            .with_dir("/data/sub")
            .with_file("/data/sub/b.h5", 20, 1_577_836_801)
            .with_raw("/data", StatEntry {
                path: "c.h5".into(),
                perm: Some(0o100644),
                size: Some(30),
                mtime: None,
            });
        let crawler = SftpCrawler::new(session, "sftp.example.org", "/data", TraversalRules::new("C___1").with_depth(1));

        let candidates = crawler.discover().await.unwrap();
        let names: Vec<_> = candidates.iter().map(|c| c.name.as_str()).collect();

        assert_eq!(
            names,
            vec![
                "sftp://sftp.example.org/data/a.h5",
                "sftp://sftp.example.org/data/c.h5",
                "sftp://sftp.example.org/data/sub/b.h5",
            ]
        );
        assert_eq!(candidates[1].last_modified, None);
        assert_eq!(candidates[2].size, 20);
    }
}
