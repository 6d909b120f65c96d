//! Aggregator
//!
//! Folds metrics into per-file, per-session and per-project buckets. Each
//! fold is a read-modify-write inside the metric's own storage transaction,
//! so a bucket only ever moves from one complete state to the next.
//!
//! Buckets are a cache over the log. [`Aggregator::replay`] recomputes them
//! from metrics and corrections alone; [`Aggregator::verify`] compares that
//! replay with the live rows and [`Aggregator::rebuild`] overwrites them.

use crate::adoption::{AdoptionCalculator, Computation, CorrectionDraft};
use crate::db::{ApplyOutcome, Database, PriorCheck};
use crate::error::{Error, Result};
use crate::types::{
    AdoptionCorrection, AdoptionMetric, AggregateBucket, BucketKeys, Dimension,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Attempts at writing a metric against a freshly selected prior before the
/// retention correction is given up.
pub const MAX_PRIOR_ATTEMPTS: usize = 3;

/// A metric that is now part of the log and its buckets.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedMetric {
    pub metric: AdoptionMetric,
    /// Correction this write recorded against the file's previous metric
    pub correction: Option<AdoptionCorrection>,
}

/// A bucket whose live value differs from the replayed one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketMismatch {
    pub dimension: Dimension,
    pub key: String,
    pub live: Option<AggregateBucket>,
    pub replayed: Option<AggregateBucket>,
}

/// Result of comparing live buckets against a replay of the log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IntegrityReport {
    pub metrics_replayed: usize,
    pub corrections_replayed: usize,
    pub buckets_checked: usize,
    pub mismatches: Vec<BucketMismatch>,
}

impl IntegrityReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Maintains the aggregate buckets.
pub struct Aggregator {
    db: Arc<Database>,
    calculator: AdoptionCalculator,
}

impl Aggregator {
    pub fn new(db: Arc<Database>, calculator: AdoptionCalculator) -> Self {
        Self { db, calculator }
    }

    /// Record a computed metric and fold it into its three buckets.
    ///
    /// The file's latest metric is picked as the retention prior before the
    /// write and re-checked inside it. When another writer got there first the
    /// prior is re-selected, up to [`MAX_PRIOR_ATTEMPTS`] times; after that the
    /// metric is written without a correction. Applying an event twice returns
    /// the existing metric.
    pub fn apply(&self, computation: &Computation) -> Result<AppliedMetric> {
        let draft = &computation.draft;
        let mut prior = self.db.latest_file_metric(&draft.file_path)?;

        for attempt in 1..=MAX_PRIOR_ATTEMPTS {
            let correction = self.correction_for(prior.as_ref(), computation)?;
            let check = PriorCheck::Expect(prior.as_ref().map(|m| m.id));

            match self
                .db
                .apply_metric(draft, &computation.generated, check, correction.as_ref())?
            {
                ApplyOutcome::PriorChanged { latest } => {
                    tracing::debug!(
                        event_id = draft.event_id,
                        file_path = %draft.file_path,
                        attempt,
                        latest_metric_id = latest,
                        "Prior metric changed during write, reselecting"
                    );
                    prior = match latest {
                        Some(id) => self.db.get_metric(id)?,
                        None => None,
                    };
                }
                outcome => return Self::finish(outcome),
            }
        }

        tracing::warn!(
            event_id = draft.event_id,
            file_path = %draft.file_path,
            attempts = MAX_PRIOR_ATTEMPTS,
            "Prior metric kept changing; writing without retention correction"
        );
        let outcome =
            self.db
                .apply_metric(draft, &computation.generated, PriorCheck::Skip, None)?;
        Self::finish(outcome)
    }

    fn finish(outcome: ApplyOutcome) -> Result<AppliedMetric> {
        match outcome {
            ApplyOutcome::Applied { metric, correction } => {
                tracing::info!(
                    event_id = metric.event_id,
                    metric_id = metric.id,
                    file_path = %metric.file_path,
                    generated_lines = metric.generated_lines,
                    removed_lines = metric.removed_lines,
                    estimated = metric.estimated,
                    "Recorded adoption metric"
                );
                if let Some(c) = &correction {
                    tracing::info!(
                        corrected_metric_id = c.metric_id,
                        retained_lines = c.retained_lines,
                        adopted_delta = c.adopted_delta,
                        "Applied retention correction"
                    );
                }
                Ok(AppliedMetric { metric, correction })
            }
            ApplyOutcome::AlreadyApplied(metric) => {
                tracing::debug!(event_id = metric.event_id, "Metric already recorded");
                Ok(AppliedMetric {
                    metric,
                    correction: None,
                })
            }
            ApplyOutcome::PriorChanged { .. } => Err(Error::StorageUnavailable(
                "metric write raced without a prior check".to_string(),
            )),
        }
    }

    /// Measure how much of `prior` survives in the new edit.
    fn correction_for(
        &self,
        prior: Option<&AdoptionMetric>,
        computation: &Computation,
    ) -> Result<Option<CorrectionDraft>> {
        let (Some(prior), Some(surviving)) = (prior, computation.surviving.as_ref()) else {
            return Ok(None);
        };
        if prior.estimated || prior.generated_lines == 0 {
            return Ok(None);
        }
        if self.db.get_correction_for_metric(prior.id)?.is_some() {
            return Ok(None);
        }

        let generated = self.db.get_generated_lines(prior.id)?;
        Ok(Some(CorrectionDraft {
            prior_metric_id: prior.id,
            observed_event_id: computation.draft.event_id,
            retained_lines: self.calculator.retained_lines(&generated, surviving),
        }))
    }

    /// Recompute every bucket from the log, starting from empty state.
    ///
    /// Folding is commutative, so the result does not depend on log order.
    pub fn replay(
        metrics: &[AdoptionMetric],
        corrections: &[AdoptionCorrection],
    ) -> Vec<AggregateBucket> {
        let mut buckets: BTreeMap<(Dimension, String), AggregateBucket> = BTreeMap::new();

        let mut by_id: HashMap<i64, BucketKeys> = HashMap::with_capacity(metrics.len());
        for metric in metrics {
            let keys = BucketKeys::of(metric);
            for (dimension, key) in keys.pairs() {
                slot(&mut buckets, dimension, key).absorb_metric(metric);
            }
            by_id.insert(metric.id, keys);
        }

        for correction in corrections {
            match by_id.get(&correction.metric_id) {
                Some(keys) => {
                    for (dimension, key) in keys.pairs() {
                        slot(&mut buckets, dimension, key).absorb_correction(correction);
                    }
                }
                None => tracing::warn!(
                    correction_id = correction.id,
                    metric_id = correction.metric_id,
                    "Correction refers to an unknown metric"
                ),
            }
        }

        buckets.into_values().collect()
    }

    /// Compare live buckets with a replay of the log.
    pub fn verify(&self) -> Result<IntegrityReport> {
        let log = self.db.metric_log()?;
        let replayed = Self::replay(&log.metrics, &log.corrections);

        let mut live: BTreeMap<(Dimension, String), AggregateBucket> = log
            .buckets
            .into_iter()
            .map(|b| ((b.dimension, b.key.clone()), b))
            .collect();

        let mut report = IntegrityReport {
            metrics_replayed: log.metrics.len(),
            corrections_replayed: log.corrections.len(),
            ..Default::default()
        };

        for bucket in replayed {
            report.buckets_checked += 1;
            let current = live.remove(&(bucket.dimension, bucket.key.clone()));
            if current.as_ref() != Some(&bucket) {
                report.mismatches.push(BucketMismatch {
                    dimension: bucket.dimension,
                    key: bucket.key.clone(),
                    live: current,
                    replayed: Some(bucket),
                });
            }
        }
        // Live buckets with no contribution in the log at all
        for ((dimension, key), bucket) in live {
            report.buckets_checked += 1;
            report.mismatches.push(BucketMismatch {
                dimension,
                key,
                live: Some(bucket),
                replayed: None,
            });
        }

        if report.is_consistent() {
            tracing::info!(buckets = report.buckets_checked, "Aggregate buckets verified");
        } else {
            tracing::warn!(
                buckets = report.buckets_checked,
                mismatches = report.mismatches.len(),
                "Aggregate buckets differ from the metric log"
            );
        }
        Ok(report)
    }

    /// Replace every live bucket with a replay of the log.
    pub fn rebuild(&self) -> Result<usize> {
        let written = self.db.rebuild_buckets(Self::replay)?;
        tracing::info!(buckets = written, "Rebuilt aggregate buckets from the log");
        Ok(written)
    }
}

fn slot<'m>(
    buckets: &'m mut BTreeMap<(Dimension, String), AggregateBucket>,
    dimension: Dimension,
    key: &str,
) -> &'m mut AggregateBucket {
    buckets
        .entry((dimension, key.to_string()))
        .or_insert_with(|| AggregateBucket::empty(dimension, key))
}
