//! SQL shared by the SQLite and Postgres engines.

use std::collections::HashSet;

use crate::types::record::{DuplicateHandling, StoredRecord};

pub const TABLE: &str = "granule_files";

/// Column list for inserts and `RETURNING`, in bind order.
pub const COLUMNS: &str = "name, granule_id, collection_id, etag, last_modified, size, status, discovered_date";

/// Every column except the key is refreshed; `status` goes back to `discovered`.
const REFRESH: &str = "granule_id = excluded.granule_id, \
     collection_id = excluded.collection_id, \
     etag = excluded.etag, \
     last_modified = excluded.last_modified, \
     size = excluded.size, \
     status = 'discovered', \
     discovered_date = excluded.discovered_date";

/// Conflict clause appended to a multi-row insert for `policy`.
///
/// `distinct` is the dialect's null-safe inequality (`IS NOT` on SQLite,
/// `IS DISTINCT FROM` on Postgres). Under `error` existing rows are left
/// alone and the statement returns the names it did insert; any name
/// missing from that set already existed and the chunk is rolled back.
pub fn conflict_clause(policy: DuplicateHandling, distinct: &str) -> String {
    match policy {
        DuplicateHandling::Skip => format!(
            " ON CONFLICT (name) DO UPDATE SET {REFRESH} \
             WHERE {TABLE}.etag {distinct} excluded.etag \
             OR {TABLE}.last_modified {distinct} excluded.last_modified \
             OR {TABLE}.size {distinct} excluded.size"
        ),
        DuplicateHandling::Replace => format!(" ON CONFLICT (name) DO UPDATE SET {REFRESH}"),
        DuplicateHandling::Error => " ON CONFLICT (name) DO NOTHING RETURNING name".to_string(),
    }
}

/// Names from `rows` that an `error`-policy insert did not return.
pub fn rejected_names(rows: &[StoredRecord], inserted: &[String]) -> Vec<String> {
    let inserted: HashSet<&str> = inserted.iter().map(String::as_str).collect();
    rows.iter()
        .filter(|row| !inserted.contains(row.name.as_str()))
        .map(|row| row.name.clone())
        .collect()
}
