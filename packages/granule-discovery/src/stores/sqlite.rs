//! Embedded SQLite engine.
//!
//! Single writer: the pool holds exactly one connection in exclusive
//! locking mode, so a second process opening the same file fails fast on
//! the busy timeout instead of interleaving writes. Every `read_batch` is a
//! single `UPDATE ... RETURNING`, which SQLite executes atomically.
//!
//! `discovered_date` is stored as fixed-width RFC 3339 text with
//! microseconds so lexical and chronological order agree.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteLockingMode, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use tracing::{debug, info, instrument};

use crate::error::{StoreError, StoreResult};
use crate::stores::chunking::SQLITE_PARAM_CEILING;
use crate::stores::schema::{conflict_clause, rejected_names, COLUMNS, TABLE};
use crate::traits::store::{ChunkOutcome, StorageEngine};
use crate::types::record::{CountType, DuplicateHandling, RecordFilter, RecordStatus, StoredRecord};

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS granule_files (
        name TEXT PRIMARY KEY,
        granule_id TEXT NOT NULL,
        collection_id TEXT NOT NULL,
        etag TEXT NOT NULL,
        last_modified TEXT,
        size INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'discovered',
        discovered_date TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_granule_files_collection_status ON granule_files(collection_id, status, discovered_date)",
    "CREATE INDEX IF NOT EXISTS idx_granule_files_granule_id ON granule_files(granule_id)",
];

/// SQLite-backed [`StorageEngine`].
pub struct SqliteEngine {
    pool: SqlitePool,
}

impl SqliteEngine {
    /// Open (creating if missing) the database at `database_url`.
    ///
    /// # Example URLs
    /// - `sqlite::memory:` - in-memory database, lives as long as the engine
    /// - `sqlite://./discovery.db` - file-based database
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .locking_mode(SqliteLockingMode::Exclusive)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let engine = Self { pool };
        engine.run_migrations().await?;
        info!(database_url, "SQLite engine ready");
        Ok(engine)
    }

    /// Open a private in-memory database (for testing).
    pub async fn in_memory() -> StoreResult<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn run_migrations(&self) -> StoreResult<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.pool.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

pub(crate) fn format_discovered_date(ts: DateTime<Utc>) -> String {
    ts.format(DATE_FORMAT).to_string()
}

fn parse_discovered_date(name: &str, text: &str) -> StoreResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text, DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| StoreError::Corrupt {
            name: name.to_string(),
            reason: format!("invalid discovered_date {text:?}: {e}"),
        })
}

#[derive(Debug, FromRow)]
struct RecordRow {
    name: String,
    granule_id: String,
    collection_id: String,
    etag: String,
    last_modified: Option<String>,
    size: i64,
    status: String,
    discovered_date: String,
}

impl RecordRow {
    fn into_record(self) -> StoreResult<StoredRecord> {
        let discovered_date = parse_discovered_date(&self.name, &self.discovered_date)?;
        let status = self.status.parse::<RecordStatus>().map_err(|reason| StoreError::Corrupt {
            name: self.name.clone(),
            reason,
        })?;

        Ok(StoredRecord {
            size: u64::try_from(self.size).unwrap_or(0),
            name: self.name,
            granule_id: self.granule_id,
            collection_id: self.collection_id,
            etag: self.etag,
            last_modified: self.last_modified,
            status,
            discovered_date,
        })
    }
}

#[async_trait]
impl StorageEngine for SqliteEngine {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn param_ceiling(&self) -> usize {
        SQLITE_PARAM_CEILING
    }

    #[instrument(skip(self, policy, rows), fields(rows = rows.len(), policy = %policy))]
    async fn write_chunk(&self, policy: DuplicateHandling, rows: &[StoredRecord]) -> StoreResult<ChunkOutcome> {
        self.ensure_open()?;
        if rows.is_empty() {
            return Ok(ChunkOutcome::default());
        }

        let mut insert = QueryBuilder::<Sqlite>::new(format!("INSERT INTO {TABLE} ({COLUMNS}) "));
        insert.push_values(rows, |mut b, row| {
            b.push_bind(row.name.as_str())
                .push_bind(row.granule_id.as_str())
                .push_bind(row.collection_id.as_str())
                .push_bind(row.etag.as_str())
                .push_bind(row.last_modified.as_deref())
                .push_bind(i64::try_from(row.size).unwrap_or(i64::MAX))
                .push("'discovered'")
                .push_bind(format_discovered_date(row.discovered_date));
        });
        insert.push(conflict_clause(policy, "IS NOT"));

        let mut tx = self.pool.begin().await?;

        if policy == DuplicateHandling::Error {
            let inserted: Vec<String> = insert.build_query_scalar().fetch_all(&mut *tx).await?;
            let names = rejected_names(rows, &inserted);
            if !names.is_empty() {
                tx.rollback().await?;
                return Err(StoreError::DuplicateExists { names });
            }
            tx.commit().await?;
            debug!(persisted = inserted.len(), "Chunk committed");
            return Ok(ChunkOutcome {
                persisted: inserted.len(),
            });
        }

        let result = insert.build().execute(&mut *tx).await?;
        tx.commit().await?;

        let persisted = usize::try_from(result.rows_affected()).unwrap_or(usize::MAX);
        debug!(persisted, "Chunk committed");
        Ok(ChunkOutcome { persisted })
    }

    #[instrument(skip(self, filter), fields(collection_id = %filter.collection_id, path_filter = %filter.path_filter))]
    async fn read_batch(&self, filter: &RecordFilter, limit: usize) -> StoreResult<Vec<StoredRecord>> {
        self.ensure_open()?;

        let sql = format!(
            r#"
            UPDATE {TABLE} SET status = 'queued'
            WHERE status = 'discovered' AND collection_id = ? AND instr(name, ?) > 0
              AND granule_id IN (
                SELECT granule_id FROM {TABLE}
                WHERE status = 'discovered' AND collection_id = ? AND instr(name, ?) > 0
                GROUP BY granule_id
                ORDER BY MIN(discovered_date), granule_id
                LIMIT ?
              )
            RETURNING {COLUMNS}
            "#
        );

        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(&filter.collection_id)
            .bind(&filter.path_filter)
            .bind(&filter.collection_id)
            .bind(&filter.path_filter)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let mut batch = rows
            .into_iter()
            .map(RecordRow::into_record)
            .collect::<StoreResult<Vec<_>>>()?;
        batch.sort_by(|a, b| {
            a.discovered_date
                .cmp(&b.discovered_date)
                .then_with(|| a.name.cmp(&b.name))
        });

        debug!(records = batch.len(), "Dequeued batch");
        Ok(batch)
    }

    async fn count(&self, filter: &RecordFilter, status: RecordStatus, count_type: CountType) -> StoreResult<u64> {
        self.ensure_open()?;

        let target = match count_type {
            CountType::Files => "COUNT(*)",
            CountType::Granules => "COUNT(DISTINCT granule_id)",
        };
        let sql = format!(
            "SELECT {target} FROM {TABLE} WHERE collection_id = ? AND status = ? AND instr(name, ?) > 0"
        );

        let count: i64 = sqlx::query_scalar(&sql)
            .bind(&filter.collection_id)
            .bind(status.as_str())
            .bind(&filter.path_filter)
            .fetch_one(&self.pool)
            .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn close(&self) -> StoreResult<()> {
        self.pool.close().await;
        Ok(())
    }
}
