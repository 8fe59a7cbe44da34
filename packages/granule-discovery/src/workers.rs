//! Bounded worker pool for independent per-file network operations.
//!
//! Used for cross-bucket copies and parallel HEAD requests. Every unit is
//! awaited before returning; a failing unit never cancels its siblings.
//! Failures are aggregated into one [`CrawlError::Workers`].

use std::future::Future;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::error::{CrawlError, CrawlResult, WorkerFailure};

/// Run `task` over every unit with at most `concurrency` in flight.
///
/// Results come back in input order regardless of completion order.
pub async fn run_bounded<T, R, F, Fut>(
    units: Vec<T>,
    concurrency: usize,
    label: impl Fn(&T) -> String,
    task: F,
) -> CrawlResult<Vec<R>>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = CrawlResult<R>>,
{
    let total = units.len();
    let concurrency = concurrency.max(1);

    debug!(total, concurrency, "Dispatching worker pool");

    let futures: Vec<_> = units
        .into_iter()
        .enumerate()
        .map(|(index, unit)| {
            let unit_label = label(&unit);
            let fut = task(unit);
            async move { (index, unit_label, fut.await) }
        })
        .collect();

    let mut outcomes: Vec<_> = stream::iter(futures)
        .buffer_unordered(concurrency)
        .collect()
        .await;
    outcomes.sort_by_key(|(index, _, _)| *index);

    let mut results = Vec::with_capacity(total);
    let mut failures = Vec::new();
    for (_, unit, outcome) in outcomes {
        match outcome {
            Ok(value) => results.push(value),
            Err(e) => {
                warn!(unit = %unit, error = %e, "Worker task failed");
                failures.push(WorkerFailure {
                    unit,
                    message: e.to_string(),
                });
            }
        }
    }

    if failures.is_empty() {
        Ok(results)
    } else {
        Err(CrawlError::Workers { total, failures })
    }
}
