//! Adoption Calculator
//!
//! Turns a completed [`EditEvent`] into line counts. Computation is pure: it
//! reads only the event and never touches storage, so it runs outside every
//! lock and transaction.
//!
//! ## Metrics Produced
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `generated_lines` | `Added` ops in the before/after diff |
//! | `adopted_lines` | Equal to `generated_lines` when written |
//! | `removed_lines` | `Removed` ops in the diff |
//! | `total_before_lines` / `total_after_lines` | Line counts of each side |
//! | `estimated` | Diff exceeded the line ceiling; counts are length-based |
//!
//! Whether generated lines survive is measured later: when the next edit of
//! the same file arrives, [`AdoptionCalculator::retained_lines`] counts how
//! many of the prior edit's generated lines are still unchanged in the new
//! diff. The aggregator records that as a one-time correction.

use crate::diff::{common_line_count, diff_lines, split_lines};
use crate::types::{EditEvent, GeneratedLine};
use std::collections::HashMap;

/// Metric values for an event, before they receive a row ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDraft {
    pub event_id: i64,
    pub session_id: String,
    pub file_path: String,
    pub project_id: String,
    pub generated_lines: i64,
    pub adopted_lines: i64,
    pub removed_lines: i64,
    pub total_before_lines: i64,
    pub total_after_lines: i64,
    pub estimated: bool,
}

/// Everything the calculator derives from one event.
#[derive(Debug, Clone)]
pub struct Computation {
    pub draft: MetricDraft,
    /// Generated line detail (empty when estimated)
    pub generated: Vec<GeneratedLine>,
    /// Lines unchanged by this edit, in order; `None` when estimated
    pub surviving: Option<Vec<String>>,
}

/// Retention measured for a prior metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrectionDraft {
    pub prior_metric_id: i64,
    pub observed_event_id: i64,
    pub retained_lines: i64,
}

/// Computes adoption metrics from edit events.
#[derive(Debug, Clone)]
pub struct AdoptionCalculator {
    max_lines: usize,
}

impl AdoptionCalculator {
    /// Create a calculator whose differ refuses inputs above `max_lines`.
    pub fn new(max_lines: usize) -> Self {
        Self { max_lines }
    }

    /// Diff the event and derive its metric.
    ///
    /// Never fails: an oversized diff degrades to an estimate flagged
    /// `estimated = true`.
    pub fn compute(&self, event: &EditEvent) -> Computation {
        let before = split_lines(&event.before_content);
        let after = split_lines(&event.after_content);
        let total_before = before.len() as i64;
        let total_after = after.len() as i64;

        let draft = |generated: i64, removed: i64, estimated: bool| MetricDraft {
            event_id: event.id,
            session_id: event.session_id.clone(),
            file_path: event.file_path.clone(),
            project_id: event.project_id.clone(),
            generated_lines: generated,
            adopted_lines: generated,
            removed_lines: removed,
            total_before_lines: total_before,
            total_after_lines: total_after,
            estimated,
        };

        match diff_lines(&before, &after, self.max_lines) {
            Ok(diff) => {
                let generated = diff.generated();
                Computation {
                    draft: draft(generated.len() as i64, diff.removed_count() as i64, false),
                    generated,
                    surviving: Some(diff.equal_lines().into_iter().map(String::from).collect()),
                }
            }
            Err(err) => {
                tracing::warn!(
                    event_id = event.id,
                    file_path = %event.file_path,
                    error = %err,
                    "Diff degraded to length estimate"
                );
                Computation {
                    draft: draft(
                        (total_after - total_before).max(0),
                        (total_before - total_after).max(0),
                        true,
                    ),
                    generated: Vec::new(),
                    surviving: None,
                }
            }
        }
    }

    /// How many of a prior edit's generated lines are still present, in order,
    /// among the lines a later edit left unchanged.
    pub fn retained_lines(&self, prior_generated: &[GeneratedLine], surviving: &[String]) -> i64 {
        let prior: Vec<&str> = prior_generated.iter().map(|g| g.content.as_str()).collect();
        let kept: Vec<&str> = surviving.iter().map(String::as_str).collect();

        match common_line_count(&prior, &kept, self.max_lines) {
            Ok(count) => count as i64,
            // Order-insensitive fallback keeps the check bounded on huge files
            Err(_) => multiset_overlap(&prior, &kept) as i64,
        }
    }
}

/// Count of lines present in both sequences, respecting multiplicity.
fn multiset_overlap(a: &[&str], b: &[&str]) -> usize {
    let mut available: HashMap<&str, usize> = HashMap::new();
    for line in b {
        *available.entry(line).or_default() += 1;
    }
    a.iter()
        .filter(|line| match available.get_mut(*line) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        })
        .count()
}
