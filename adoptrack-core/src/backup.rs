//! JSON export and import of the append-only log
//!
//! Buckets are not exported: they are derived state and get rebuilt from the
//! imported log.

use crate::aggregate::Aggregator;
use crate::db::{Database, LogRows};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Version of the export file layout
pub const FORMAT_VERSION: u32 = 1;

/// On-disk export file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogExport {
    pub format_version: u32,
    pub exported_at: DateTime<Utc>,
    #[serde(flatten)]
    pub log: LogRows,
}

/// Row counts of an export or import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackupSummary {
    pub snapshots: usize,
    pub events: usize,
    pub metrics: usize,
    pub corrections: usize,
}

impl BackupSummary {
    fn of(log: &LogRows) -> Self {
        Self {
            snapshots: log.snapshots.len(),
            events: log.events.len(),
            metrics: log.metrics.len(),
            corrections: log.corrections.len(),
        }
    }
}

/// Write the whole log to `path` as pretty-printed JSON.
pub fn export_log(db: &Database, path: &Path) -> Result<BackupSummary> {
    let export = LogExport {
        format_version: FORMAT_VERSION,
        exported_at: Utc::now(),
        log: db.export_rows()?,
    };
    let summary = BackupSummary::of(&export.log);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&export)?)?;

    tracing::info!(path = %path.display(), ?summary, "Exported log");
    Ok(summary)
}

/// Load an export into an empty database and rebuild every bucket from it.
pub fn import_log(db: &Database, path: &Path) -> Result<BackupSummary> {
    let content = std::fs::read_to_string(path)?;
    let export: LogExport = serde_json::from_str(&content)?;
    if export.format_version != FORMAT_VERSION {
        return Err(Error::InvalidArgument(format!(
            "unsupported export format version {} (expected {})",
            export.format_version, FORMAT_VERSION
        )));
    }

    db.import_rows(&export.log)?;
    db.rebuild_buckets(Aggregator::replay)?;

    let summary = BackupSummary::of(&export.log);
    tracing::info!(path = %path.display(), ?summary, "Imported log");
    Ok(summary)
}
