//! Discovery pipeline - one pass from provider listing to queued batch.
//!
//! ```text
//! config -> crawler.discover() -> store.add/flush -> store.read_batch -> DiscoveryOutput
//! ```

pub mod discover;

pub use discover::{run_discovery, run_with, DiscoveryOutput};
