//! Configuration for a discovery pass.
//!
//! The orchestrator hands us one JSON document per pass. Secrets arrive
//! already decrypted, either inline or through the environment.

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DiscoveryError, Result};
use crate::types::record::DuplicateHandling;

/// Maximum directory levels explored below the provider path.
pub const MAX_DEPTH: u32 = 3;

/// Complete input for one discovery pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub provider: ProviderConfig,
    pub collection: CollectionConfig,
    pub store: StoreConfig,

    /// Maximum granules handed back by `read_batch`.
    ///
    /// Default: 1000.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
}

/// Transport used to reach the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    S3,
    Http,
    Https,
    Ftp,
    Sftp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S3 => "s3",
            Self::Http => "http",
            Self::Https => "https",
            Self::Ftp => "ftp",
            Self::Sftp => "sftp",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::S3 | Self::Https => 443,
            Self::Http => 80,
            Self::Ftp => 21,
            Self::Sftp => 22,
        }
    }
}

/// Provider connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub protocol: Protocol,

    /// Hostname, or the bucket name for S3
    pub host: String,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// S3 only: copy every accepted object into this bucket before returning.
    #[serde(default)]
    pub staging_bucket: Option<String>,

    /// HTTP only: issue a HEAD per accepted file for etag, size and date.
    #[serde(default)]
    pub head_metadata: bool,

    /// Connect/read timeout in seconds. Default: 30.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Worker-pool size for copies and HEAD requests. Default: 8.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl ProviderConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }
}

/// The collection this pass discovers granules for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub name: String,
    pub version: String,

    /// Root path (or key prefix) on the provider
    #[serde(default)]
    pub provider_path: String,

    /// Files whose basename matches are accepted; absent accepts all.
    #[serde(default)]
    pub file_pattern: Option<String>,

    /// Directories whose basename matches are descended; absent accepts all.
    #[serde(default)]
    pub dir_pattern: Option<String>,

    /// Pattern whose first capture group is the granule id.
    #[serde(default)]
    pub granule_id_extraction: Option<String>,

    #[serde(default)]
    pub duplicate_handling: DuplicateHandling,

    /// Requested traversal depth; clamped to `min(|depth|, 3)`.
    #[serde(default)]
    pub depth: i32,
}

impl CollectionConfig {
    /// `name___version`, the collection id stored on every record.
    pub fn collection_id(&self) -> String {
        format!("{}___{}", self.name, self.version)
    }

    /// Substring used to scope `read_batch` and `count` to this provider path.
    pub fn path_filter(&self) -> String {
        self.provider_path.trim_matches('/').to_string()
    }
}

/// Clamp a requested traversal depth to `min(|depth|, MAX_DEPTH)`.
pub fn clamp_depth(depth: i32) -> u32 {
    depth.unsigned_abs().min(MAX_DEPTH)
}

/// Which persistence engine backs the reconciliation store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// Single-writer SQLite file
    Embedded,
    /// Client/server Postgres
    Relational,
    /// Postgres with the upstream cross-check always on
    SystemOfRecord,
}

/// Persistence engine selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub engine: EngineKind,

    #[serde(default)]
    pub database_url: Option<String>,

    /// Authoritative upstream database consulted under `skip`.
    #[serde(default)]
    pub upstream_database_url: Option<String>,

    /// Buffered candidates that trigger an implicit flush. Default: 100000.
    #[serde(default = "default_transaction_size")]
    pub transaction_size: usize,
}

fn default_batch_limit() -> usize {
    1000
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_concurrency() -> usize {
    8
}

fn default_transaction_size() -> usize {
    100_000
}

impl DiscoveryConfig {
    /// Load a config document from disk and apply environment overrides.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| DiscoveryError::ConfigIo {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self = serde_json::from_str(&raw)?;
        config.apply_env();
        Ok(config)
    }

    /// `DATABASE_URL`, `UPSTREAM_DATABASE_URL` and `PROVIDER_PASSWORD`
    /// fill in values the document left out.
    pub fn apply_env(&mut self) {
        // Load .env file if present (development)
        let _ = dotenvy::dotenv();

        if self.store.database_url.is_none() {
            self.store.database_url = env::var("DATABASE_URL").ok();
        }
        if self.store.upstream_database_url.is_none() {
            self.store.upstream_database_url = env::var("UPSTREAM_DATABASE_URL").ok();
        }
        if self.provider.password.is_none() {
            self.provider.password = env::var("PROVIDER_PASSWORD").ok();
        }
    }

    /// Reject configs that cannot run before any network I/O happens.
    pub fn validate(&self) -> Result<()> {
        if self.provider.host.trim().is_empty() {
            return Err(DiscoveryError::Config("provider.host must be set".into()));
        }
        if self.collection.name.trim().is_empty() {
            return Err(DiscoveryError::Config("collection.name must be set".into()));
        }
        if self.store.transaction_size == 0 {
            return Err(DiscoveryError::Config(
                "store.transaction_size must be greater than 0".into(),
            ));
        }
        if self.provider.concurrency == 0 {
            return Err(DiscoveryError::Config(
                "provider.concurrency must be greater than 0".into(),
            ));
        }

        match self.store.engine {
            EngineKind::Embedded | EngineKind::Relational if self.store.database_url.is_none() => {
                Err(DiscoveryError::Config(
                    "store.database_url (or DATABASE_URL) must be set".into(),
                ))
            }
            EngineKind::SystemOfRecord if self.store.upstream_database_url.is_none() => {
                Err(DiscoveryError::Config(
                    "system-of-record engine requires store.upstream_database_url".into(),
                ))
            }
            _ => Ok(()),
        }
    }
}
