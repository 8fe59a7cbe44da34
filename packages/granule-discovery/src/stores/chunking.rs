//! Sub-batch planning against an engine's bound-parameter ceiling.

/// Bound values per inserted row: name, granule_id, collection_id, etag,
/// last_modified, size, discovered_date. `status` is written as a literal.
pub const BINDS_PER_ROW: usize = 7;

/// SQLite's default `SQLITE_MAX_VARIABLE_NUMBER`.
pub const SQLITE_PARAM_CEILING: usize = 999;

/// Postgres wire protocol limit (parameter count is an `i16`-sized field).
pub const POSTGRES_PARAM_CEILING: usize = 65_535;

/// Rows per sub-batch such that `binds_per_row * rows <= ceiling`.
///
/// Never returns 0; a ceiling below one row's worth still writes one row
/// per statement.
pub fn rows_per_chunk(ceiling: usize, binds_per_row: usize) -> usize {
    (ceiling / binds_per_row.max(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_engine_ceilings() {
        assert_eq!(rows_per_chunk(SQLITE_PARAM_CEILING, BINDS_PER_ROW), 142);
        assert_eq!(rows_per_chunk(POSTGRES_PARAM_CEILING, BINDS_PER_ROW), 9362);
        assert_eq!(rows_per_chunk(3, BINDS_PER_ROW), 1);
    }

    proptest! {
        #[test]
        fn chunks_never_exceed_ceiling(ceiling in 7usize..70_000, binds in 1usize..8) {
            let per_chunk = rows_per_chunk(ceiling, binds);
            prop_assert!(per_chunk * binds <= ceiling);
            prop_assert!((per_chunk + 1) * binds > ceiling);
        }
    }
}
