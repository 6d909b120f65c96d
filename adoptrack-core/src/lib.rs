//! # adoptrack-core
//!
//! Core library for adoptrack - measures how much AI-written code survives.
//!
//! An assistant reports each file edit as a `before` snapshot followed by an
//! `after` snapshot. The engine pairs them exactly once, diffs them line by
//! line, records how many lines were generated, and keeps running totals per
//! file, per session and per project.
//!
//! ## Architecture
//!
//! Data lives in two layers:
//! - **Log (append-only):** snapshots, edit events, metrics, generated-line
//!   detail and retention corrections. Never updated in place.
//! - **Buckets (derived):** totals per (dimension, key), maintained
//!   incrementally and rebuildable from the log at any time.
//!
//! ## Example
//!
//! ```rust,no_run
//! use adoptrack_core::{AdoptionEngine, Config};
//!
//! let config = Config::load().expect("failed to load config");
//! let engine = AdoptionEngine::from_config(&config).expect("failed to open engine");
//!
//! engine.record_before("session-1", "/work/app/src/main.rs", "fn main() {}\n").unwrap();
//! let summary = engine
//!     .record_after("session-1", "/work/app/src/main.rs", "fn main() {\n    run();\n}\n", None)
//!     .unwrap();
//! match &summary.metric {
//!     Some(metric) => println!("generated {} lines", metric.generated_lines),
//!     None => println!("metric pending"),
//! }
//! ```

// Re-export commonly used items at the crate root
pub use adoption::AdoptionCalculator;
pub use aggregate::{Aggregator, IntegrityReport};
pub use config::Config;
pub use db::Database;
pub use engine::{AdoptionEngine, AfterSummary};
pub use error::{Error, Result};
pub use project::{ProjectResolver, RootPrefixResolver};
pub use query::{EditDetail, QueryFacade};
pub use types::*;

// Public modules
pub mod adoption;
pub mod aggregate;
pub mod backup;
pub mod config;
pub mod db;
pub mod diff;
pub mod engine;
pub mod error;
pub mod locks;
pub mod logging;
pub mod pairing;
pub mod project;
pub mod query;
pub mod types;
