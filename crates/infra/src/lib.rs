//! Infrastructure layer: config, Postgres and Redis adapters for the job
//! subsystem's store traits.

/// Configuration loading and representation.
pub mod config;

/// Database adapters (connection pool, record store, schema).
pub mod db;

/// Redis adapters (job queues, leader leases, dead letters, progress).
#[cfg(feature = "redis")]
pub mod redis;

pub use config::{ConfigError, Settings};
