//! Database repository layer
//!
//! Provides transactional writes for the pairing log, metric log and
//! aggregate buckets, plus the read queries built on them.

use crate::adoption::{CorrectionDraft, MetricDraft};
use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

use super::pool::{ConnectionPool, POOL_SIZE};

/// A generated line together with the metric it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLineRecord {
    pub metric_id: i64,
    #[serde(flatten)]
    pub line: GeneratedLine,
}

/// Every row of the append-only log, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogRows {
    pub snapshots: Vec<SnapshotRecord>,
    pub events: Vec<EditEvent>,
    pub metrics: Vec<AdoptionMetric>,
    pub diff_lines: Vec<DiffLineRecord>,
    pub corrections: Vec<AdoptionCorrection>,
}

/// Metric log plus the buckets maintained from it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricLog {
    pub metrics: Vec<AdoptionMetric>,
    pub corrections: Vec<AdoptionCorrection>,
    pub buckets: Vec<AggregateBucket>,
}

/// What [`Database::apply_metric`] must verify about the file's prior metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorCheck {
    /// Write without looking at earlier metrics
    Skip,
    /// Abort unless the file's latest metric is still this one (`None` = no metric yet)
    Expect(Option<i64>),
}

/// Result of [`Database::apply_metric`].
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Metric written and folded into its buckets
    Applied {
        metric: AdoptionMetric,
        correction: Option<AdoptionCorrection>,
    },
    /// The event already had a metric; nothing was written
    AlreadyApplied(AdoptionMetric),
    /// Another metric for the file landed since the prior was selected; nothing was written
    PriorChanged { latest: Option<i64> },
}

/// Everything stored about one pairing, read at a single point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct EditRecord {
    pub event: EditEvent,
    pub metric: Option<AdoptionMetric>,
    pub generated: Vec<GeneratedLine>,
    pub correction: Option<AdoptionCorrection>,
}

/// Database handle over a small pool of connections
pub struct Database {
    pool: ConnectionPool,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(Self {
            pool: ConnectionPool::file(path.to_path_buf(), POOL_SIZE)?,
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            pool: ConnectionPool::single(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        self.pool.with(|conn| super::schema::run_migrations(conn))
    }

    /// Run `f` inside a write transaction.
    ///
    /// The transaction takes SQLite's write lock up front, so a writer that
    /// reads before it writes waits on the busy timeout instead of failing
    /// when another connection committed in between.
    fn write<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        self.pool.with(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    /// Run `f` inside a read transaction, so every statement sees the same
    /// committed state.
    fn read<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        self.pool.with(|conn| {
            let tx = conn.transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    /// Run a single statement's worth of work on a pooled connection
    fn query<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.pool.with(|conn| f(conn))
    }

    // ============================================
    // Pairing operations
    // ============================================

    /// Open a new pending `before` snapshot for the key.
    ///
    /// Any snapshot still pending for the same key is marked abandoned in the
    /// same transaction. Returns the new snapshot and the abandoned IDs.
    pub fn open_pairing(
        &self,
        session_id: &str,
        file_path: &str,
        content: &str,
    ) -> Result<(SnapshotRecord, Vec<i64>)> {
        self.write(|tx| {
            let abandoned = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM snapshots
                     WHERE session_id = ?1 AND file_path = ?2 AND status = 'pending'
                     ORDER BY id",
                )?;
                let rows = stmt.query_map(params![session_id, file_path], |r| r.get(0))?;
                rows.collect::<rusqlite::Result<Vec<i64>>>()?
            };
            if !abandoned.is_empty() {
                tx.execute(
                    "UPDATE snapshots SET status = 'abandoned'
                     WHERE session_id = ?1 AND file_path = ?2 AND status = 'pending'",
                    params![session_id, file_path],
                )?;
            }

            let mut record = SnapshotRecord {
                id: 0,
                pairing_token: uuid::Uuid::new_v4().to_string(),
                session_id: session_id.to_string(),
                file_path: file_path.to_string(),
                phase: Phase::Before,
                content: content.to_string(),
                content_hash: content_hash(content),
                status: SnapshotStatus::Pending,
                recorded_at: now(),
            };
            record.id = insert_snapshot(tx, &record)?;
            Ok((record, abandoned))
        })
    }

    /// Complete the most recent pending pairing for the key.
    ///
    /// Marking the `before` completed, storing the `after` and writing the
    /// edit event happen in one transaction. With nothing pending, fails with
    /// [`Error::NoPendingBefore`] and writes nothing.
    pub fn complete_pairing(
        &self,
        session_id: &str,
        file_path: &str,
        content: &str,
        project_id: &str,
        session_info: Option<&str>,
    ) -> Result<EditEvent> {
        let no_pending = || Error::NoPendingBefore {
            session_id: session_id.to_string(),
            file_path: file_path.to_string(),
        };

        self.write(|tx| {
            let pending: Option<(i64, String, String)> = tx
                .query_row(
                    "SELECT id, pairing_token, content FROM snapshots
                     WHERE session_id = ?1 AND file_path = ?2 AND status = 'pending'
                     ORDER BY id DESC LIMIT 1",
                    params![session_id, file_path],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()?;
            let (before_id, token, before_content) = pending.ok_or_else(no_pending)?;

            let changed = tx.execute(
                "UPDATE snapshots SET status = 'completed' WHERE id = ?1 AND status = 'pending'",
                [before_id],
            )?;
            if changed != 1 {
                return Err(no_pending());
            }

            let paired_at = now();
            let after = SnapshotRecord {
                id: 0,
                pairing_token: token.clone(),
                session_id: session_id.to_string(),
                file_path: file_path.to_string(),
                phase: Phase::After,
                content: content.to_string(),
                content_hash: content_hash(content),
                status: SnapshotStatus::Completed,
                recorded_at: paired_at,
            };
            let after_id = insert_snapshot(tx, &after)?;

            let mut event = EditEvent {
                id: 0,
                pairing_token: token,
                session_id: session_id.to_string(),
                file_path: file_path.to_string(),
                project_id: project_id.to_string(),
                before_snapshot_id: before_id,
                after_snapshot_id: after_id,
                before_content,
                after_content: content.to_string(),
                session_info: session_info.map(str::to_string),
                paired_at,
            };
            event.id = insert_event(tx, &event)?;
            Ok(event)
        })
    }

    /// Get a snapshot by ID
    pub fn get_snapshot(&self, id: i64) -> Result<Option<SnapshotRecord>> {
        self.query(|conn| {
            conn.query_row(
                "SELECT * FROM snapshots WHERE id = ?",
                [id],
                Self::row_to_snapshot,
            )
            .optional()
            .map_err(Error::from)
        })
    }

    /// List snapshots, optionally filtered by status, oldest first
    pub fn list_snapshots(&self, status: Option<SnapshotStatus>) -> Result<Vec<SnapshotRecord>> {
        self.query(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM snapshots WHERE ?1 IS NULL OR status = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map([status.map(|s| s.as_str())], Self::row_to_snapshot)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(Error::from)
        })
    }

    fn row_to_snapshot(row: &Row) -> rusqlite::Result<SnapshotRecord> {
        let phase: String = row.get("phase")?;
        let status: String = row.get("status")?;
        let recorded_at: String = row.get("recorded_at")?;

        Ok(SnapshotRecord {
            id: row.get("id")?,
            pairing_token: row.get("pairing_token")?,
            session_id: row.get("session_id")?,
            file_path: row.get("file_path")?,
            phase: parse_enum(&phase)?,
            content: row.get("content")?,
            content_hash: row.get("content_hash")?,
            status: parse_enum(&status)?,
            recorded_at: parse_ts(&recorded_at)?,
        })
    }

    // ============================================
    // Edit event operations
    // ============================================

    /// Get an edit event with both snapshot contents
    pub fn get_edit_event(&self, id: i64) -> Result<Option<EditEvent>> {
        self.query(|conn| event_by_id(conn, id))
    }

    /// The event, its metric, generated lines and correction in one read
    pub fn edit_record(&self, event_id: i64) -> Result<Option<EditRecord>> {
        self.read(|tx| {
            let Some(event) = event_by_id(tx, event_id)? else {
                return Ok(None);
            };
            let metric = metric_for_event(tx, event_id)?;
            let (generated, correction) = match &metric {
                Some(m) => (
                    generated_lines(tx, m.id)?,
                    correction_for_metric(tx, m.id)?,
                ),
                None => (Vec::new(), None),
            };
            Ok(Some(EditRecord {
                event,
                metric,
                generated,
                correction,
            }))
        })
    }

    /// List every edit event in pairing order
    pub fn list_edit_events(&self) -> Result<Vec<EditEvent>> {
        self.query(|conn| {
            collect(
                conn,
                &format!("SELECT {EVENT_COLUMNS} {EVENT_FROM} ORDER BY e.id"),
                row_to_event,
            )
        })
    }

    /// Edit events that were paired but never got a metric (interrupted writes)
    pub fn events_without_metrics(&self) -> Result<Vec<EditEvent>> {
        self.query(|conn| {
            collect(
                conn,
                &format!(
                    "SELECT {EVENT_COLUMNS} {EVENT_FROM}
                     WHERE NOT EXISTS (SELECT 1 FROM adoption_metrics m WHERE m.event_id = e.id)
                     ORDER BY e.id"
                ),
                row_to_event,
            )
        })
    }

    // ============================================
    // Metric operations
    // ============================================

    /// Write a metric and fold it into its three buckets, atomically.
    ///
    /// With `correction`, the prior metric it names is also corrected (once)
    /// and its buckets adjusted by `retained - prior.adopted_lines`. Priors
    /// that are estimated or already corrected are left alone.
    pub fn apply_metric(
        &self,
        draft: &MetricDraft,
        generated: &[GeneratedLine],
        prior: PriorCheck,
        correction: Option<&CorrectionDraft>,
    ) -> Result<ApplyOutcome> {
        self.write(|tx| {
            if let Some(existing) = metric_for_event(tx, draft.event_id)? {
                return Ok(ApplyOutcome::AlreadyApplied(existing));
            }

            if let PriorCheck::Expect(expected) = prior {
                let latest = latest_metric_id(tx, &draft.file_path)?;
                if latest != expected {
                    return Ok(ApplyOutcome::PriorChanged { latest });
                }
            }

            let computed_at = now();
            let mut metric = AdoptionMetric {
                id: 0,
                event_id: draft.event_id,
                session_id: draft.session_id.clone(),
                file_path: draft.file_path.clone(),
                project_id: draft.project_id.clone(),
                generated_lines: draft.generated_lines,
                adopted_lines: draft.adopted_lines,
                removed_lines: draft.removed_lines,
                total_before_lines: draft.total_before_lines,
                total_after_lines: draft.total_after_lines,
                estimated: draft.estimated,
                computed_at,
            };
            metric.id = insert_metric(tx, &metric)?;
            for line in generated {
                insert_diff_line(tx, metric.id, line)?;
            }
            for (dimension, key) in BucketKeys::of(&metric).pairs() {
                let mut bucket = load_bucket(tx, dimension, key)?
                    .unwrap_or_else(|| AggregateBucket::empty(dimension, key));
                bucket.absorb_metric(&metric);
                store_bucket(tx, &bucket)?;
            }

            let correction = match correction {
                Some(draft) => apply_correction(tx, draft, computed_at)?,
                None => None,
            };
            Ok(ApplyOutcome::Applied { metric, correction })
        })
    }

    /// Get a metric by ID
    pub fn get_metric(&self, id: i64) -> Result<Option<AdoptionMetric>> {
        self.query(|conn| {
            conn.query_row(
                "SELECT * FROM adoption_metrics WHERE id = ?",
                [id],
                row_to_metric,
            )
            .optional()
            .map_err(Error::from)
        })
    }

    /// Get the metric derived from an edit event
    pub fn get_metric_for_event(&self, event_id: i64) -> Result<Option<AdoptionMetric>> {
        self.query(|conn| metric_for_event(conn, event_id))
    }

    /// Most recent metric for a file, across all sessions
    pub fn latest_file_metric(&self, file_path: &str) -> Result<Option<AdoptionMetric>> {
        self.query(|conn| {
            conn.query_row(
                "SELECT * FROM adoption_metrics WHERE file_path = ? ORDER BY id DESC LIMIT 1",
                [file_path],
                row_to_metric,
            )
            .optional()
            .map_err(Error::from)
        })
    }

    /// List every metric in log order
    pub fn list_metrics(&self) -> Result<Vec<AdoptionMetric>> {
        self.query(|conn| collect(conn, "SELECT * FROM adoption_metrics ORDER BY id", row_to_metric))
    }

    /// Generated line detail of a metric, in line order
    pub fn get_generated_lines(&self, metric_id: i64) -> Result<Vec<GeneratedLine>> {
        self.query(|conn| generated_lines(conn, metric_id))
    }

    /// Correction recorded against a metric, if any
    pub fn get_correction_for_metric(&self, metric_id: i64) -> Result<Option<AdoptionCorrection>> {
        self.query(|conn| correction_for_metric(conn, metric_id))
    }

    /// List every correction in log order
    pub fn list_corrections(&self) -> Result<Vec<AdoptionCorrection>> {
        self.query(|conn| {
            collect(
                conn,
                "SELECT * FROM adoption_corrections ORDER BY id",
                row_to_correction,
            )
        })
    }

    // ============================================
    // Bucket operations
    // ============================================

    /// Get a bucket; `None` until its first contribution
    pub fn get_bucket(&self, dimension: Dimension, key: &str) -> Result<Option<AggregateBucket>> {
        self.query(|conn| load_bucket(conn, dimension, key))
    }

    /// Buckets of one dimension, largest generated total first
    pub fn list_buckets(&self, dimension: Dimension) -> Result<Vec<AggregateBucket>> {
        self.query(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM aggregate_buckets WHERE dimension = ?
                 ORDER BY generated_total DESC, key ASC",
            )?;
            let rows = stmt.query_map([dimension.as_str()], row_to_bucket)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(Error::from)
        })
    }

    /// Every bucket, ordered by dimension then key
    pub fn all_buckets(&self) -> Result<Vec<AggregateBucket>> {
        self.query(|conn| {
            collect(
                conn,
                "SELECT * FROM aggregate_buckets ORDER BY dimension, key",
                row_to_bucket,
            )
        })
    }

    /// Read the metric log and the live buckets in one consistent view
    pub fn metric_log(&self) -> Result<MetricLog> {
        self.read(|tx| {
            Ok(MetricLog {
                metrics: collect(tx, "SELECT * FROM adoption_metrics ORDER BY id", row_to_metric)?,
                corrections: collect(
                    tx,
                    "SELECT * FROM adoption_corrections ORDER BY id",
                    row_to_correction,
                )?,
                buckets: collect(
                    tx,
                    "SELECT * FROM aggregate_buckets ORDER BY dimension, key",
                    row_to_bucket,
                )?,
            })
        })
    }

    /// Replace every live bucket with `replay(metrics, corrections)`.
    ///
    /// The log is read and the buckets rewritten in one transaction, so no
    /// metric can land between the two. Returns the number of buckets written.
    pub fn rebuild_buckets<F>(&self, replay: F) -> Result<usize>
    where
        F: FnOnce(&[AdoptionMetric], &[AdoptionCorrection]) -> Vec<AggregateBucket>,
    {
        self.write(|tx| {
            let metrics = collect(tx, "SELECT * FROM adoption_metrics ORDER BY id", row_to_metric)?;
            let corrections = collect(
                tx,
                "SELECT * FROM adoption_corrections ORDER BY id",
                row_to_correction,
            )?;
            let buckets = replay(&metrics, &corrections);

            tx.execute("DELETE FROM aggregate_buckets", [])?;
            for bucket in &buckets {
                store_bucket(tx, bucket)?;
            }
            Ok(buckets.len())
        })
    }

    /// Global totals from one consistent read
    pub fn dashboard(&self) -> Result<GlobalDashboard> {
        self.read(|tx| {
            let (generated_total, adopted_total, event_count, estimated_event_count, project_count): (
                i64,
                i64,
                i64,
                i64,
                i64,
            ) = tx.query_row(
                "SELECT COALESCE(SUM(generated_total), 0), COALESCE(SUM(adopted_total), 0),
                        COALESCE(SUM(event_count), 0), COALESCE(SUM(estimated_event_count), 0),
                        COUNT(*)
                 FROM aggregate_buckets WHERE dimension = 'project'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )?;
            let count = |dimension: Dimension| -> rusqlite::Result<i64> {
                tx.query_row(
                    "SELECT COUNT(*) FROM aggregate_buckets WHERE dimension = ?",
                    [dimension.as_str()],
                    |r| r.get(0),
                )
            };
            let file_count = count(Dimension::File)?;
            let session_count = count(Dimension::Session)?;

            // Current size of every tracked file, taken from its latest metric
            let tracked_lines: i64 = tx.query_row(
                "SELECT COALESCE(SUM(m.total_after_lines), 0) FROM adoption_metrics m
                 WHERE m.id = (SELECT MAX(id) FROM adoption_metrics WHERE file_path = m.file_path)",
                [],
                |r| r.get(0),
            )?;

            Ok(GlobalDashboard {
                generated_total,
                adopted_total,
                adoption_rate: adoption_rate(generated_total, adopted_total),
                generation_rate: percentage(generated_total, tracked_lines),
                file_count,
                session_count,
                project_count,
                event_count,
                estimated_event_count,
            })
        })
    }

    // ============================================
    // Log export / import
    // ============================================

    /// True when no snapshot has ever been recorded
    pub fn is_empty(&self) -> Result<bool> {
        self.query(log_is_empty)
    }

    /// Read the entire append-only log in one consistent pass
    pub fn export_rows(&self) -> Result<LogRows> {
        self.read(|tx| {
            Ok(LogRows {
                snapshots: collect(tx, "SELECT * FROM snapshots ORDER BY id", Self::row_to_snapshot)?,
                events: collect(
                    tx,
                    &format!("SELECT {EVENT_COLUMNS} {EVENT_FROM} ORDER BY e.id"),
                    row_to_event,
                )?,
                metrics: collect(tx, "SELECT * FROM adoption_metrics ORDER BY id", row_to_metric)?,
                diff_lines: collect(
                    tx,
                    "SELECT metric_id, line_number, kind, content FROM diff_lines ORDER BY id",
                    |row| {
                        Ok(DiffLineRecord {
                            metric_id: row.get("metric_id")?,
                            line: row_to_generated_line(row)?,
                        })
                    },
                )?,
                corrections: collect(
                    tx,
                    "SELECT * FROM adoption_corrections ORDER BY id",
                    row_to_correction,
                )?,
            })
        })
    }

    /// Load log rows, keeping their IDs, into an empty database.
    ///
    /// Buckets are not touched; rebuild them from the log afterwards.
    pub fn import_rows(&self, rows: &LogRows) -> Result<()> {
        self.write(|tx| {
            if !log_is_empty(tx)? {
                return Err(Error::InvalidArgument(
                    "import requires an empty database".to_string(),
                ));
            }

            for snapshot in &rows.snapshots {
                insert_snapshot(tx, snapshot)?;
            }
            for event in &rows.events {
                insert_event(tx, event)?;
            }
            for metric in &rows.metrics {
                insert_metric(tx, metric)?;
            }
            for record in &rows.diff_lines {
                insert_diff_line(tx, record.metric_id, &record.line)?;
            }
            for correction in &rows.corrections {
                insert_correction(tx, correction)?;
            }
            Ok(())
        })?;

        tracing::info!(
            snapshots = rows.snapshots.len(),
            events = rows.events.len(),
            metrics = rows.metrics.len(),
            corrections = rows.corrections.len(),
            "Imported log rows"
        );
        Ok(())
    }
}

const EVENT_COLUMNS: &str = "e.id AS id, e.pairing_token AS pairing_token, \
    e.session_id AS session_id, e.file_path AS file_path, e.project_id AS project_id, \
    e.before_snapshot_id AS before_snapshot_id, e.after_snapshot_id AS after_snapshot_id, \
    e.session_info AS session_info, e.paired_at AS paired_at, \
    b.content AS before_content, a.content AS after_content";

const EVENT_FROM: &str = "FROM edit_events e \
    JOIN snapshots b ON b.id = e.before_snapshot_id \
    JOIN snapshots a ON a.id = e.after_snapshot_id";

/// Hex-encoded SHA-256 of snapshot content
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Current time at the precision timestamps are stored with
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> rusqlite::Result<T> {
    s.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, e.into()))
}

fn collect<T>(
    conn: &Connection,
    sql: &str,
    map: impl FnMut(&Row) -> rusqlite::Result<T>,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], map)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Error::from)
}

fn log_is_empty(conn: &Connection) -> Result<bool> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM snapshots", [], |r| r.get(0))?;
    Ok(count == 0)
}

// ============================================
// Row writers (run inside the caller's transaction)
// ============================================

fn insert_snapshot(conn: &Connection, s: &SnapshotRecord) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO snapshots (id, pairing_token, session_id, file_path, phase, content,
                               content_hash, status, recorded_at)
        VALUES (NULLIF(?1, 0), ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            s.id,
            s.pairing_token,
            s.session_id,
            s.file_path,
            s.phase.as_str(),
            s.content,
            s.content_hash,
            s.status.as_str(),
            ts(&s.recorded_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn insert_event(conn: &Connection, e: &EditEvent) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO edit_events (id, pairing_token, session_id, file_path, project_id,
                                 before_snapshot_id, after_snapshot_id, session_info, paired_at)
        VALUES (NULLIF(?1, 0), ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            e.id,
            e.pairing_token,
            e.session_id,
            e.file_path,
            e.project_id,
            e.before_snapshot_id,
            e.after_snapshot_id,
            e.session_info,
            ts(&e.paired_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn insert_metric(conn: &Connection, m: &AdoptionMetric) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO adoption_metrics (id, event_id, session_id, file_path, project_id,
                                      generated_lines, adopted_lines, removed_lines,
                                      total_before_lines, total_after_lines, estimated, computed_at)
        VALUES (NULLIF(?1, 0), ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        params![
            m.id,
            m.event_id,
            m.session_id,
            m.file_path,
            m.project_id,
            m.generated_lines,
            m.adopted_lines,
            m.removed_lines,
            m.total_before_lines,
            m.total_after_lines,
            m.estimated,
            ts(&m.computed_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn insert_diff_line(conn: &Connection, metric_id: i64, line: &GeneratedLine) -> Result<()> {
    conn.execute(
        "INSERT INTO diff_lines (metric_id, line_number, kind, content) VALUES (?1, ?2, ?3, ?4)",
        params![metric_id, line.line_number, line.kind.as_str(), line.content],
    )?;
    Ok(())
}

fn insert_correction(conn: &Connection, c: &AdoptionCorrection) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO adoption_corrections (id, metric_id, observed_event_id, retained_lines,
                                          adopted_delta, applied_at)
        VALUES (NULLIF(?1, 0), ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            c.id,
            c.metric_id,
            c.observed_event_id,
            c.retained_lines,
            c.adopted_delta,
            ts(&c.applied_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Record a one-time correction and fold it into the prior's buckets.
fn apply_correction(
    conn: &Connection,
    draft: &CorrectionDraft,
    applied_at: DateTime<Utc>,
) -> Result<Option<AdoptionCorrection>> {
    let prior = conn
        .query_row(
            "SELECT * FROM adoption_metrics WHERE id = ?",
            [draft.prior_metric_id],
            row_to_metric,
        )
        .optional()?;
    let Some(prior) = prior else {
        return Ok(None);
    };
    if prior.estimated || correction_for_metric(conn, prior.id)?.is_some() {
        return Ok(None);
    }

    let retained = draft.retained_lines.clamp(0, prior.generated_lines);
    let mut correction = AdoptionCorrection {
        id: 0,
        metric_id: prior.id,
        observed_event_id: draft.observed_event_id,
        retained_lines: retained,
        adopted_delta: retained - prior.adopted_lines,
        applied_at,
    };
    correction.id = insert_correction(conn, &correction)?;

    for (dimension, key) in BucketKeys::of(&prior).pairs() {
        let mut bucket = load_bucket(conn, dimension, key)?
            .unwrap_or_else(|| AggregateBucket::empty(dimension, key));
        bucket.absorb_correction(&correction);
        store_bucket(conn, &bucket)?;
    }
    Ok(Some(correction))
}

// ============================================
// Row readers
// ============================================

fn event_by_id(conn: &Connection, id: i64) -> Result<Option<EditEvent>> {
    conn.query_row(
        &format!("SELECT {EVENT_COLUMNS} {EVENT_FROM} WHERE e.id = ?"),
        [id],
        row_to_event,
    )
    .optional()
    .map_err(Error::from)
}

fn generated_lines(conn: &Connection, metric_id: i64) -> Result<Vec<GeneratedLine>> {
    let mut stmt = conn.prepare(
        "SELECT line_number, kind, content FROM diff_lines
         WHERE metric_id = ? ORDER BY line_number, id",
    )?;
    let rows = stmt.query_map([metric_id], row_to_generated_line)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Error::from)
}

fn metric_for_event(conn: &Connection, event_id: i64) -> Result<Option<AdoptionMetric>> {
    conn.query_row(
        "SELECT * FROM adoption_metrics WHERE event_id = ?",
        [event_id],
        row_to_metric,
    )
    .optional()
    .map_err(Error::from)
}

fn latest_metric_id(conn: &Connection, file_path: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT MAX(id) FROM adoption_metrics WHERE file_path = ?",
        [file_path],
        |r| r.get(0),
    )
    .map_err(Error::from)
}

fn correction_for_metric(conn: &Connection, metric_id: i64) -> Result<Option<AdoptionCorrection>> {
    conn.query_row(
        "SELECT * FROM adoption_corrections WHERE metric_id = ?",
        [metric_id],
        row_to_correction,
    )
    .optional()
    .map_err(Error::from)
}

fn load_bucket(conn: &Connection, dimension: Dimension, key: &str) -> Result<Option<AggregateBucket>> {
    conn.query_row(
        "SELECT * FROM aggregate_buckets WHERE dimension = ?1 AND key = ?2",
        params![dimension.as_str(), key],
        row_to_bucket,
    )
    .optional()
    .map_err(Error::from)
}

fn store_bucket(conn: &Connection, b: &AggregateBucket) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO aggregate_buckets (dimension, key, generated_total, adopted_total,
                                       event_count, estimated_event_count, last_updated)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(dimension, key) DO UPDATE SET
            generated_total = excluded.generated_total,
            adopted_total = excluded.adopted_total,
            event_count = excluded.event_count,
            estimated_event_count = excluded.estimated_event_count,
            last_updated = excluded.last_updated
        "#,
        params![
            b.dimension.as_str(),
            b.key,
            b.generated_total,
            b.adopted_total,
            b.event_count,
            b.estimated_event_count,
            b.last_updated.as_ref().map(ts),
        ],
    )?;
    Ok(())
}

fn row_to_event(row: &Row) -> rusqlite::Result<EditEvent> {
    let paired_at: String = row.get("paired_at")?;

    Ok(EditEvent {
        id: row.get("id")?,
        pairing_token: row.get("pairing_token")?,
        session_id: row.get("session_id")?,
        file_path: row.get("file_path")?,
        project_id: row.get("project_id")?,
        before_snapshot_id: row.get("before_snapshot_id")?,
        after_snapshot_id: row.get("after_snapshot_id")?,
        before_content: row.get("before_content")?,
        after_content: row.get("after_content")?,
        session_info: row.get("session_info")?,
        paired_at: parse_ts(&paired_at)?,
    })
}

fn row_to_metric(row: &Row) -> rusqlite::Result<AdoptionMetric> {
    let computed_at: String = row.get("computed_at")?;

    Ok(AdoptionMetric {
        id: row.get("id")?,
        event_id: row.get("event_id")?,
        session_id: row.get("session_id")?,
        file_path: row.get("file_path")?,
        project_id: row.get("project_id")?,
        generated_lines: row.get("generated_lines")?,
        adopted_lines: row.get("adopted_lines")?,
        removed_lines: row.get("removed_lines")?,
        total_before_lines: row.get("total_before_lines")?,
        total_after_lines: row.get("total_after_lines")?,
        estimated: row.get("estimated")?,
        computed_at: parse_ts(&computed_at)?,
    })
}

fn row_to_generated_line(row: &Row) -> rusqlite::Result<GeneratedLine> {
    let kind: String = row.get("kind")?;
    Ok(GeneratedLine {
        line_number: row.get("line_number")?,
        kind: parse_enum(&kind)?,
        content: row.get("content")?,
    })
}

fn row_to_correction(row: &Row) -> rusqlite::Result<AdoptionCorrection> {
    let applied_at: String = row.get("applied_at")?;
    Ok(AdoptionCorrection {
        id: row.get("id")?,
        metric_id: row.get("metric_id")?,
        observed_event_id: row.get("observed_event_id")?,
        retained_lines: row.get("retained_lines")?,
        adopted_delta: row.get("adopted_delta")?,
        applied_at: parse_ts(&applied_at)?,
    })
}

fn row_to_bucket(row: &Row) -> rusqlite::Result<AggregateBucket> {
    let dimension: String = row.get("dimension")?;
    let last_updated: Option<String> = row.get("last_updated")?;

    Ok(AggregateBucket {
        dimension: parse_enum(&dimension)?,
        key: row.get("key")?,
        generated_total: row.get("generated_total")?,
        adopted_total: row.get("adopted_total")?,
        event_count: row.get("event_count")?,
        estimated_event_count: row.get("estimated_event_count")?,
        last_updated: last_updated.as_deref().map(parse_ts).transpose()?,
    })
}
