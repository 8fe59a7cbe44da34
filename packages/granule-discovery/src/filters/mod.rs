//! Cross-check filters against an upstream system of record.
//!
//! - [`UpstreamGranules`] - Postgres `granules` table lookup
//! - [`crate::testing::MemoryCrossCheck`] - in-memory fake for tests

pub mod upstream;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

pub use crate::traits::crosscheck::{CrossCheck, GranuleStamp};
pub use upstream::UpstreamGranules;

/// Whether an upstream copy makes a candidate redundant.
///
/// Timestamps are compared as instants, never as text. A candidate with no
/// provider timestamp cannot prove it is newer, so an existing upstream copy
/// wins. An upstream copy with no timestamp cannot prove it is current, so
/// the candidate survives.
pub fn is_current(candidate: Option<DateTime<Utc>>, upstream: Option<DateTime<Utc>>) -> bool {
    match (candidate, upstream) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(candidate), Some(upstream)) => upstream >= candidate,
    }
}

/// Granule ids from `candidates` that `upstream` already holds a current copy of.
///
/// `upstream` maps every granule id that exists upstream to its timestamp.
pub fn current_granules(
    candidates: &[GranuleStamp],
    upstream: &HashMap<String, Option<DateTime<Utc>>>,
) -> HashSet<String> {
    candidates
        .iter()
        .filter(|c| {
            upstream
                .get(&c.granule_id)
                .is_some_and(|ts| is_current(c.last_modified, *ts))
        })
        .map(|c| c.granule_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_is_current() {
        assert!(is_current(Some(ts(1)), Some(ts(2))));
        assert!(is_current(Some(ts(2)), Some(ts(2))));
        assert!(!is_current(Some(ts(3)), Some(ts(2))));
        assert!(is_current(None, Some(ts(2))));
        assert!(is_current(None, None));
        assert!(!is_current(Some(ts(1)), None));
    }

    #[test]
    fn test_current_granules_requires_membership() {
        let candidates = vec![
            GranuleStamp::new("same", Some(ts(2))),
            GranuleStamp::new("newer", Some(ts(5))),
            GranuleStamp::new("absent", Some(ts(1))),
        ];
        let upstream = HashMap::from([
            ("same".to_string(), Some(ts(2))),
            ("newer".to_string(), Some(ts(4))),
        ]);

        let current = current_granules(&candidates, &upstream);

        assert_eq!(current, HashSet::from(["same".to_string()]));
    }

    #[test]
    fn test_structural_comparison_beats_lexical() {
        // As text the upstream stamp sorts first; as instants it is 30 minutes newer
        let candidate = DateTime::parse_from_rfc3339("2024-01-10T01:00:00+02:00").unwrap().with_timezone(&Utc);
        let upstream = DateTime::parse_from_rfc3339("2024-01-09T23:30:00Z").unwrap().with_timezone(&Utc);

        assert!(is_current(Some(candidate), Some(upstream)));
    }
}
