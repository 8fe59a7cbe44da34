//! Persistence engines and the reconciliation store built on them.
//!
//! Available engines:
//! - `MemoryEngine` - in-memory, configurable parameter ceiling (tests)
//! - `SqliteEngine` - embedded single-writer file
//! - `PostgresEngine` - relational and system-of-record selectors
//!
//! [`open_store`] picks one from [`StoreConfig`].

pub mod chunking;
pub mod memory;
pub mod postgres;
pub mod reconciliation;
pub mod schema;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::{StoreError, StoreResult};
use crate::filters::UpstreamGranules;
use crate::traits::store::{ChunkOutcome, StorageEngine};
use crate::types::config::{EngineKind, StoreConfig};
use crate::types::record::{CountType, DuplicateHandling, RecordFilter, RecordStatus, StoredRecord};

pub use memory::MemoryEngine;
pub use postgres::PostgresEngine;
pub use reconciliation::ReconciliationStore;
pub use sqlite::SqliteEngine;

/// An engine chosen at runtime from configuration.
pub enum AnyEngine {
    Memory(MemoryEngine),
    Sqlite(SqliteEngine),
    Postgres(PostgresEngine),
}

#[async_trait]
impl StorageEngine for AnyEngine {
    fn name(&self) -> &'static str {
        match self {
            Self::Memory(e) => e.name(),
            Self::Sqlite(e) => e.name(),
            Self::Postgres(e) => e.name(),
        }
    }

    fn param_ceiling(&self) -> usize {
        match self {
            Self::Memory(e) => e.param_ceiling(),
            Self::Sqlite(e) => e.param_ceiling(),
            Self::Postgres(e) => e.param_ceiling(),
        }
    }

    async fn write_chunk(&self, policy: DuplicateHandling, rows: &[StoredRecord]) -> StoreResult<ChunkOutcome> {
        match self {
            Self::Memory(e) => e.write_chunk(policy, rows).await,
            Self::Sqlite(e) => e.write_chunk(policy, rows).await,
            Self::Postgres(e) => e.write_chunk(policy, rows).await,
        }
    }

    async fn read_batch(&self, filter: &RecordFilter, limit: usize) -> StoreResult<Vec<StoredRecord>> {
        match self {
            Self::Memory(e) => e.read_batch(filter, limit).await,
            Self::Sqlite(e) => e.read_batch(filter, limit).await,
            Self::Postgres(e) => e.read_batch(filter, limit).await,
        }
    }

    async fn count(&self, filter: &RecordFilter, status: RecordStatus, count_type: CountType) -> StoreResult<u64> {
        match self {
            Self::Memory(e) => e.count(filter, status, count_type).await,
            Self::Sqlite(e) => e.count(filter, status, count_type).await,
            Self::Postgres(e) => e.count(filter, status, count_type).await,
        }
    }

    async fn close(&self) -> StoreResult<()> {
        match self {
            Self::Memory(e) => e.close().await,
            Self::Sqlite(e) => e.close().await,
            Self::Postgres(e) => e.close().await,
        }
    }
}

/// Open the engine selected by `config` and wrap it in a store.
///
/// - `embedded` - SQLite at `database_url`
/// - `relational` - Postgres at `database_url`, cross-checked when an
///   upstream URL is configured
/// - `system-of-record` - Postgres at `database_url` (falling back to the
///   upstream database itself), always cross-checked
pub async fn open_store(config: &StoreConfig, policy: DuplicateHandling) -> StoreResult<ReconciliationStore<AnyEngine>> {
    let database_url = config.database_url.as_deref();
    let upstream_url = config.upstream_database_url.as_deref();

    let (engine, upstream) = match config.engine {
        EngineKind::Embedded => {
            let url = database_url.ok_or_else(|| missing_url("store.database_url"))?;
            (AnyEngine::Sqlite(SqliteEngine::connect(url).await?), None)
        }
        EngineKind::Relational => {
            let url = database_url.ok_or_else(|| missing_url("store.database_url"))?;
            let engine = AnyEngine::Postgres(PostgresEngine::connect(url).await?);
            let upstream = match upstream_url {
                Some(url) => Some(UpstreamGranules::connect(url).await?),
                None => None,
            };
            (engine, upstream)
        }
        EngineKind::SystemOfRecord => {
            let upstream_url = upstream_url.ok_or_else(|| missing_url("store.upstream_database_url"))?;
            let url = database_url.unwrap_or(upstream_url);
            let engine = AnyEngine::Postgres(PostgresEngine::connect(url).await?);
            (engine, Some(UpstreamGranules::connect(upstream_url).await?))
        }
    };

    info!(
        engine = engine.name(),
        %policy,
        cross_check = upstream.is_some(),
        transaction_size = config.transaction_size,
        "Reconciliation store opened"
    );

    let mut store = ReconciliationStore::new(engine, policy).with_transaction_size(config.transaction_size);
    if let Some(upstream) = upstream {
        store = store.with_cross_check(Arc::new(upstream));
    }
    Ok(store)
}

fn missing_url(field: &str) -> StoreError {
    StoreError::Config(format!("{field} (or its environment override) must be set"))
}
