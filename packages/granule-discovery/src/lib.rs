//! Granule Discovery and Reconciliation Library
//!
//! Enumerates remote data files ("granules") exposed by a provider, records
//! which of them are new or changed, and hands back a bounded, oldest-first
//! batch of files ready to ingest.
//!
//! # Usage
//!
//! ```rust,ignore
//! use granule_discovery::{DuplicateHandling, MemoryEngine, ReconciliationStore};
//! use granule_discovery::crawlers::FtpCrawler;
//! use granule_discovery::pipeline::run_with;
//!
//! let crawler = FtpCrawler::new(session, "ftp.example.org", "/pub/gpm", rules);
//! let mut store = ReconciliationStore::new(MemoryEngine::new(), DuplicateHandling::Skip);
//!
//! let output = run_with(&crawler, &mut store, "GPM___1", "pub/gpm", 1000).await?;
//! store.close().await?;
//! ```
//!
//! # Modules
//!
//! - [`crawlers`] - Per-protocol listings (S3, HTTP, FTP, SFTP)
//! - [`stores`] - Persistence engines and the reconciliation store
//! - [`filters`] - Cross-check against the upstream system of record
//! - [`pipeline`] - One discovery pass end to end
//! - [`traits`] - Core trait abstractions (Crawler, StorageEngine, CrossCheck)
//! - [`types`] - Candidates, stored records and configuration
//! - [`workers`] - Bounded worker pool for per-file network calls
//! - [`testing`] - Mock implementations for testing

pub mod crawlers;
pub mod error;
pub mod filters;
pub mod pipeline;
pub mod stores;
pub mod testing;
pub mod traits;
pub mod types;
pub mod workers;

// Re-export core types at crate root
pub use error::{CrawlError, DiscoveryError, StoreError};
pub use pipeline::{run_discovery, DiscoveryOutput};
pub use stores::{open_store, AnyEngine, MemoryEngine, PostgresEngine, ReconciliationStore, SqliteEngine};
pub use traits::{
    crawler::{Crawler, TraversalRules},
    crosscheck::{CrossCheck, GranuleStamp},
    store::{FlushReport, StorageEngine},
};
pub use types::{
    candidate::{Candidate, EntryKind, ListingEntry},
    config::{DiscoveryConfig, EngineKind, Protocol},
    record::{CountType, DuplicateHandling, RecordStatus, StoredRecord},
};
