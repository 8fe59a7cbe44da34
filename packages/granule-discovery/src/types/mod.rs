//! Domain types for discovery and reconciliation.

pub mod candidate;
pub mod config;
pub mod record;
