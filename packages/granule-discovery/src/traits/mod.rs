//! Core trait abstractions.
//!
//! Crawlers, persistence engines and the upstream cross-check are all
//! injected through these traits, so a discovery pass can run against
//! in-memory fakes as easily as against real providers and databases.

pub mod crawler;
pub mod crosscheck;
pub mod store;
