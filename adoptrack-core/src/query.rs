//! Query Façade
//!
//! Read-only projections over the log and the buckets. Each query reads one
//! committed state, so it sees buckets either before or after a metric write,
//! never halfway through one.

use crate::db::{Database, EditRecord};
use crate::diff::{diff_text, DiffTag};
use crate::error::{Error, Result};
use crate::types::{
    AdoptionCorrection, AdoptionMetric, AggregateBucket, Dimension, EditEvent, GeneratedLine,
    GlobalDashboard, SnapshotRecord, SnapshotStatus,
};
use serde::Serialize;
use std::sync::Arc;

/// One line of a recomputed edit script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffLine {
    pub tag: DiffTag,
    pub text: String,
    /// 1-based line number in `before`
    pub old_line: Option<usize>,
    /// 1-based line number in `after`
    pub new_line: Option<usize>,
}

/// Everything known about one pairing.
#[derive(Debug, Clone, Serialize)]
pub struct EditDetail {
    pub event: EditEvent,
    /// `None` while the metric has not been written yet
    pub metric: Option<AdoptionMetric>,
    /// Edit script; `None` when the diff exceeds the line ceiling
    pub diff: Option<Vec<DiffLine>>,
    pub generated: Vec<GeneratedLine>,
    /// Retention correction recorded against this event's metric
    pub correction: Option<AdoptionCorrection>,
}

/// Read-only view over the engine's state.
pub struct QueryFacade {
    db: Arc<Database>,
    max_diff_lines: usize,
}

impl QueryFacade {
    pub fn new(db: Arc<Database>, max_diff_lines: usize) -> Self {
        Self { db, max_diff_lines }
    }

    /// Totals for a file; an untracked file reads as an empty bucket
    pub fn by_file(&self, file_path: &str) -> Result<AggregateBucket> {
        self.bucket(Dimension::File, file_path)
    }

    /// Totals for a session
    pub fn by_session(&self, session_id: &str) -> Result<AggregateBucket> {
        self.bucket(Dimension::Session, session_id)
    }

    /// Totals for a project
    pub fn by_project(&self, project_id: &str) -> Result<AggregateBucket> {
        self.bucket(Dimension::Project, project_id)
    }

    fn bucket(&self, dimension: Dimension, key: &str) -> Result<AggregateBucket> {
        Ok(self
            .db
            .get_bucket(dimension, key)?
            .unwrap_or_else(|| AggregateBucket::empty(dimension, key)))
    }

    /// Totals summed over every project bucket
    pub fn global_dashboard(&self) -> Result<GlobalDashboard> {
        self.db.dashboard()
    }

    /// Every bucket of a dimension, largest generated total first
    pub fn list_buckets(&self, dimension: Dimension) -> Result<Vec<AggregateBucket>> {
        self.db.list_buckets(dimension)
    }

    /// Drill-down for one edit event
    pub fn edit_detail(&self, event_id: i64) -> Result<EditDetail> {
        let EditRecord {
            event,
            metric,
            generated,
            correction,
        } = self
            .db
            .edit_record(event_id)?
            .ok_or(Error::EventNotFound(event_id))?;

        let diff = match diff_text(&event.before_content, &event.after_content, self.max_diff_lines)
        {
            Ok(diff) => Some(
                diff.ops
                    .iter()
                    .map(|op| DiffLine {
                        tag: op.tag,
                        text: op.text.to_string(),
                        old_line: op.old_index.map(|i| i + 1),
                        new_line: op.new_index.map(|i| i + 1),
                    })
                    .collect(),
            ),
            Err(Error::DiffTooLarge { .. }) => None,
            Err(err) => return Err(err),
        };

        Ok(EditDetail {
            event,
            metric,
            diff,
            generated,
            correction,
        })
    }

    /// Before snapshots in a diagnostic state (pending or abandoned)
    pub fn pairings(&self, status: SnapshotStatus) -> Result<Vec<SnapshotRecord>> {
        self.db.list_snapshots(Some(status))
    }
}
