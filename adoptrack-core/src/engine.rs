//! Adoption engine
//!
//! Wires the pipeline together:
//!
//! ```text
//! record_before ──► EventStore (pending)
//! record_after  ──► EventStore (paired) ──► AdoptionCalculator ──► Aggregator
//!                                                                     │
//!                               QueryFacade ◄── buckets + metric log ◄┘
//! ```
//!
//! Pairing calls for the same `(session_id, file_path)` are serialized by a
//! per-key lock; different keys never wait on each other. Diffing happens
//! after the pairing commits and outside every lock.
//!
//! Once a pairing commits the `after` call succeeds. A metric write that keeps
//! failing leaves the event unmeasured and reported as pending; every later
//! pairing call first measures such events, as does
//! [`AdoptionEngine::recover`] on start.

use crate::adoption::AdoptionCalculator;
use crate::aggregate::{AppliedMetric, Aggregator};
use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::locks::KeyedLocks;
use crate::pairing::{validate_key, EventStore, PairingKey};
use crate::project::{ProjectResolver, RootPrefixResolver};
use crate::query::QueryFacade;
use crate::types::{AdoptionCorrection, AdoptionMetric, BeforeAck, EditEvent};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Metric writes attempted per `after` call while storage reports busy.
pub const MEASURE_ATTEMPTS: u32 = 3;

const MEASURE_BACKOFF: Duration = Duration::from_millis(50);

/// What a successful `after` call produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AfterSummary {
    pub event: EditEvent,
    /// `None` while the metric is pending; the next call records it
    pub metric: Option<AdoptionMetric>,
    /// Retention correction recorded against the file's previous metric
    pub correction: Option<AdoptionCorrection>,
}

impl AfterSummary {
    pub fn is_pending(&self) -> bool {
        self.metric.is_none()
    }

    pub fn adoption_rate(&self) -> Option<f64> {
        self.metric.as_ref().map(AdoptionMetric::adoption_rate)
    }
}

/// The edit pairing and adoption metrics engine.
pub struct AdoptionEngine {
    db: Arc<Database>,
    store: EventStore,
    calculator: AdoptionCalculator,
    aggregator: Aggregator,
    queries: QueryFacade,
    resolver: Box<dyn ProjectResolver>,
    locks: KeyedLocks<PairingKey>,
}

impl AdoptionEngine {
    /// Build an engine over a migrated database.
    pub fn new(db: Arc<Database>, max_diff_lines: usize, resolver: Box<dyn ProjectResolver>) -> Self {
        let calculator = AdoptionCalculator::new(max_diff_lines);
        Self {
            store: EventStore::new(Arc::clone(&db)),
            aggregator: Aggregator::new(Arc::clone(&db), calculator.clone()),
            queries: QueryFacade::new(Arc::clone(&db), max_diff_lines),
            calculator,
            resolver,
            locks: KeyedLocks::new(),
            db,
        }
    }

    /// Open the configured database, migrate it and build an engine.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let path = config.resolved_database_path();
        tracing::info!(path = %path.display(), "Opening database");

        let db = Database::open(&path)?;
        db.migrate()?;

        Ok(Self::new(
            Arc::new(db),
            config.diff.max_lines,
            Box::new(RootPrefixResolver::new(config.projects.roots.clone())),
        ))
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn queries(&self) -> &QueryFacade {
        &self.queries
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Record the file content an assistant is about to edit.
    pub fn record_before(
        &self,
        session_id: &str,
        file_path: &str,
        content: &str,
    ) -> Result<BeforeAck> {
        validate_key(session_id, file_path)?;
        self.catch_up();
        let key = (session_id.to_string(), file_path.to_string());
        self.locks
            .with_lock(&key, || self.store.record_before(session_id, file_path, content))
    }

    /// Record the file content after the edit, measure it and update buckets.
    pub fn record_after(
        &self,
        session_id: &str,
        file_path: &str,
        content: &str,
        session_info: Option<&str>,
    ) -> Result<AfterSummary> {
        validate_key(session_id, file_path)?;
        self.catch_up();
        let project_id = self.resolver.resolve(file_path);
        let key = (session_id.to_string(), file_path.to_string());

        let event = self.locks.with_lock(&key, || {
            self.store
                .record_after(session_id, file_path, content, &project_id, session_info)
        })?;

        // The pairing is committed; from here on the call succeeds.
        match with_retries(MEASURE_ATTEMPTS, MEASURE_BACKOFF, || self.measure(&event)) {
            Ok(AppliedMetric { metric, correction }) => Ok(AfterSummary {
                event,
                metric: Some(metric),
                correction,
            }),
            Err(e) => {
                tracing::warn!(
                    event_id = event.id,
                    file_path = %event.file_path,
                    error = %e,
                    "Metric write failed; leaving it pending"
                );
                Ok(AfterSummary {
                    event,
                    metric: None,
                    correction: None,
                })
            }
        }
    }

    fn measure(&self, event: &EditEvent) -> Result<AppliedMetric> {
        let computation = self.calculator.compute(event);
        self.aggregator.apply(&computation)
    }

    /// Measure events left pending by earlier calls. Failures are logged and
    /// left for the next call.
    fn catch_up(&self) {
        match self.measure_unmeasured() {
            Ok(0) => {}
            Ok(n) => tracing::info!(events = n, "Measured pending edit events"),
            Err(e) => tracing::warn!(error = %e, "Could not measure pending edit events"),
        }
    }

    fn measure_unmeasured(&self) -> Result<usize> {
        let orphaned = self.db.events_without_metrics()?;
        for event in &orphaned {
            self.measure(event)?;
        }
        Ok(orphaned.len())
    }

    /// Write metrics for paired events that never got one. Returns how many
    /// events were recovered.
    pub fn recover(&self) -> Result<usize> {
        let recovered = self.measure_unmeasured()?;
        if recovered > 0 {
            tracing::warn!(events = recovered, "Recovered edit events without metrics");
        }
        Ok(recovered)
    }
}

/// Run `op` up to `attempts` times while it fails with a retryable error,
/// sleeping `backoff * attempt` between tries.
fn with_retries<T>(
    attempts: u32,
    backoff: Duration,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_retryable() && attempt < attempts => {
                tracing::debug!(attempt, error = %e, "Storage busy, retrying");
                thread::sleep(backoff * attempt);
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adoption::MetricDraft;
    use crate::error::Error;
    use crate::types::Dimension;

    fn engine() -> AdoptionEngine {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        AdoptionEngine::new(
            Arc::new(db),
            100,
            Box::new(RootPrefixResolver::new(vec!["/repo".into()])),
        )
    }

    #[test]
    fn test_round_trip() {
        let engine = engine();
        engine.record_before("s1", "/repo/src/a.rs", "").unwrap();
        let summary = engine
            .record_after("s1", "/repo/src/a.rs", "a\nb\n", Some("claude"))
            .unwrap();

        let metric = summary.metric.as_ref().unwrap();
        assert_eq!(metric.generated_lines, 2);
        assert_eq!(summary.adoption_rate(), Some(100.0));
        assert_eq!(summary.event.project_id, "/repo");
        assert_eq!(summary.event.session_info.as_deref(), Some("claude"));

        let project = engine.queries().by_project("/repo").unwrap();
        assert_eq!(project.generated_total, 2);
        assert_eq!(project.event_count, 1);
    }

    #[test]
    fn test_invalid_arguments() {
        let engine = engine();
        assert!(matches!(
            engine.record_before("", "/f", ""),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.record_after("s", "", "", None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_recover_measures_orphaned_events() {
        let engine = engine();
        let db = engine.database();
        // A pairing that committed right before a crash
        db.open_pairing("s1", "/repo/a.rs", "x\n").unwrap();
        let event = db
            .complete_pairing("s1", "/repo/a.rs", "x\ny\n", "/repo", None)
            .unwrap();
        assert!(db.get_metric_for_event(event.id).unwrap().is_none());

        assert_eq!(engine.recover().unwrap(), 1);
        assert_eq!(engine.recover().unwrap(), 0);

        let metric = db.get_metric_for_event(event.id).unwrap().unwrap();
        assert_eq!(metric.generated_lines, 1);
        assert_eq!(
            engine
                .queries()
                .by_file("/repo/a.rs")
                .unwrap()
                .event_count,
            1
        );
    }

    #[test]
    fn test_closure_resolver() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let engine = AdoptionEngine::new(Arc::new(db), 100, Box::new(|_: &str| "mono".to_string()));

        engine.record_before("s1", "/x/y.rs", "").unwrap();
        engine.record_after("s1", "/x/y.rs", "1\n", None).unwrap();
        let buckets = engine.queries().list_buckets(Dimension::Project).unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].key, "mono");
    }

    #[test]
    fn test_metric_draft_carries_resolved_project() {
        let engine = engine();
        engine.record_before("s1", "/elsewhere/b.rs", "").unwrap();
        let summary = engine.record_after("s1", "/elsewhere/b.rs", "z\n", None).unwrap();
        let draft: MetricDraft = engine.calculator.compute(&summary.event).draft;
        assert_eq!(draft.project_id, "/elsewhere");
        assert_eq!(summary.metric.unwrap().project_id, "/elsewhere");
    }

    #[test]
    fn test_failed_metric_write_stays_pending_until_next_call() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("engine.db");
        let db = Database::open(&path).unwrap();
        db.migrate().unwrap();
        let engine = AdoptionEngine::new(
            Arc::new(db),
            100,
            Box::new(RootPrefixResolver::new(vec!["/repo".into()])),
        );

        // Metric inserts fail while the trigger exists
        let raw = rusqlite::Connection::open(&path).unwrap();
        raw.execute_batch(
            "CREATE TRIGGER reject_metrics BEFORE INSERT ON adoption_metrics
             BEGIN SELECT RAISE(ABORT, 'metrics offline'); END;",
        )
        .unwrap();

        engine.record_before("s1", "/repo/a.rs", "").unwrap();
        let summary = engine
            .record_after("s1", "/repo/a.rs", "a\nb\n", None)
            .unwrap();
        assert!(summary.is_pending());
        assert_eq!(summary.adoption_rate(), None);
        assert_eq!(engine.database().events_without_metrics().unwrap().len(), 1);

        // The pairing itself committed; the slot is consumed
        assert!(matches!(
            engine.record_after("s1", "/repo/a.rs", "a\nb\n", None),
            Err(Error::NoPendingBefore { .. })
        ));

        raw.execute_batch("DROP TRIGGER reject_metrics;").unwrap();
        engine.record_before("s1", "/repo/b.rs", "").unwrap();

        let metric = engine
            .database()
            .get_metric_for_event(summary.event.id)
            .unwrap()
            .unwrap();
        assert_eq!(metric.generated_lines, 2);
        assert!(engine.database().events_without_metrics().unwrap().is_empty());
        assert_eq!(engine.queries().by_file("/repo/a.rs").unwrap().generated_total, 2);
    }

    #[test]
    fn test_with_retries_only_retries_storage_errors() {
        let mut calls = 0;
        let result = with_retries(3, Duration::ZERO, || {
            calls += 1;
            if calls < 3 {
                Err(Error::StorageUnavailable("busy".into()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);

        let mut calls = 0;
        let result: Result<()> = with_retries(3, Duration::ZERO, || {
            calls += 1;
            Err(Error::InvalidArgument("bad".into()))
        });
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(calls, 1);

        let mut calls = 0;
        let result: Result<()> = with_retries(3, Duration::ZERO, || {
            calls += 1;
            Err(Error::StorageUnavailable("busy".into()))
        });
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls, 3);
    }
}
