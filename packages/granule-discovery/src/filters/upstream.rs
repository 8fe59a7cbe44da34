//! Postgres-backed cross-check against the upstream `granules` table.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info, instrument};

use crate::error::{StoreError, StoreResult};
use crate::filters::current_granules;
use crate::stores::chunking::POSTGRES_PARAM_CEILING;
use crate::traits::crosscheck::{CrossCheck, GranuleStamp};

/// Upstream bindings per lookup: the collection id plus one per granule id.
const LOOKUP_CHUNK: usize = POSTGRES_PARAM_CEILING - 1;

/// Looks up candidate granules in the system of record's
/// `granules(collection_id, granule_id, updated_at)` table.
pub struct UpstreamGranules {
    pool: PgPool,
}

impl UpstreamGranules {
    /// Connect to the upstream database.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::CrossCheck(Box::new(e)))?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Membership lookup for one chunk of ids within `collection_id`.
    async fn lookup(&self, collection_id: &str, ids: &[&str]) -> StoreResult<Vec<(String, Option<DateTime<Utc>>)>> {
        let mut query = lookup_query(collection_id, ids);
        query
            .build_query_as::<(String, Option<DateTime<Utc>>)>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::CrossCheck(Box::new(e)))
    }
}

fn lookup_query<'a>(collection_id: &'a str, ids: &[&'a str]) -> QueryBuilder<'a, Postgres> {
    let mut query =
        QueryBuilder::<Postgres>::new("SELECT granule_id, updated_at FROM granules WHERE collection_id = ");
    query.push_bind(collection_id);
    query.push(" AND granule_id IN (");
    let mut list = query.separated(", ");
    for id in ids {
        list.push_bind(*id);
    }
    list.push_unseparated(")");
    query
}

#[async_trait]
impl CrossCheck for UpstreamGranules {
    #[instrument(skip(self, granules), fields(granules = granules.len()))]
    async fn filter(&self, collection_id: &str, granules: &[GranuleStamp]) -> StoreResult<HashSet<String>> {
        if granules.is_empty() {
            return Ok(HashSet::new());
        }

        let ids: Vec<&str> = granules.iter().map(|g| g.granule_id.as_str()).collect();
        let mut upstream = HashMap::new();
        for chunk in ids.chunks(LOOKUP_CHUNK) {
            let found = self.lookup(collection_id, chunk).await?;
            debug!(requested = chunk.len(), found = found.len(), "Upstream membership chunk");
            upstream.extend(found);
        }

        let current = current_granules(granules, &upstream);
        info!(
            candidates = granules.len(),
            upstream = upstream.len(),
            current = current.len(),
            "Cross-check complete"
        );
        Ok(current)
    }

    fn name(&self) -> &str {
        "upstream-postgres"
    }
}
