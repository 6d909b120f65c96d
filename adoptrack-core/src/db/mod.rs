//! Database layer for adoptrack
//!
//! This module provides the storage layer using SQLite with:
//! - A small pool of WAL connections
//! - Schema migrations
//! - Transactional pairing and metric writes
//! - Keyed aggregate buckets derived from the log

mod pool;
pub mod repo;
pub mod schema;

pub use repo::{
    content_hash, ApplyOutcome, Database, DiffLineRecord, EditRecord, LogRows, MetricLog,
    PriorCheck,
};
