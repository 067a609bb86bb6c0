//! Background reconciliation between the manager fleet and the durable
//! store, plus capability discovery.
//!
//! Two polling loops fan out idempotent per-entity jobs (sessions every
//! 30s, runs every 15s); a worker pool processes them with bounded
//! concurrency. Force-sync bypasses the cadence when a live stream hits
//! an unrecoverable failure.

pub mod discovery;
pub mod run_sync;
pub mod scheduler;
pub mod session_sync;

#[cfg(test)]
mod testsupport;

pub use scheduler::{SyncConfig, SyncDeps, SyncScheduler};
