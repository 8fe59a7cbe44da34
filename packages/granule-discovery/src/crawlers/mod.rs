//! Crawler implementations, one per provider protocol.
//!
//! Each variant supplies only the listing primitives; traversal lives in
//! [`crate::traits::crawler`]. Real transport sessions are feature-gated:
//! - `S3Crawler` - object listings (`s3` feature for `AwsObjectClient`)
//! - `HttpCrawler` - HTML index pages (`reqwest`, always available)
//! - `FtpCrawler` - `LIST` output (`ftp` feature for `SuppaFtpSession`)
//! - `SftpCrawler` - `readdir` stats (`sftp` feature for `Ssh2Session`)

pub mod ftp;
pub mod http;
pub mod s3;
pub mod sftp;

pub use ftp::{FtpCrawler, LineListing};
pub use http::{HttpCrawler, PageFetcher, ReqwestFetcher};
pub use s3::{ObjectStoreClient, S3Crawler};
pub use sftp::{SftpCrawler, StatListing};

#[cfg(feature = "ftp")]
pub use ftp::SuppaFtpSession;

#[cfg(feature = "s3")]
pub use s3::AwsObjectClient;

#[cfg(feature = "sftp")]
pub use sftp::Ssh2Session;
