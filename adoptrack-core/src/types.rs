//! Core domain types for adoptrack
//!
//! These types describe the append-only log (snapshots, edit events, metrics,
//! corrections) and the aggregate buckets derived from it.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Snapshot** | Full text of a file at one instant, tagged `before` or `after` |
//! | **Pairing** | A `before` snapshot completed by a matching `after` for the same key |
//! | **EditEvent** | The result of one successful pairing |
//! | **AdoptionMetric** | Line counts derived from one EditEvent; never mutated |
//! | **Correction** | One-time adjustment of a prior metric's adopted lines, applied to buckets |
//! | **Bucket** | Running totals for one file, session or project |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Compute an adoption rate as a percentage rounded to two decimals.
///
/// Returns 0.0 when nothing was generated.
pub fn adoption_rate(generated: i64, adopted: i64) -> f64 {
    percentage(adopted, generated)
}

/// `part / whole * 100`, rounded to two decimals; 0.0 when `whole` is not positive.
pub fn percentage(part: i64, whole: i64) -> f64 {
    if whole <= 0 {
        return 0.0;
    }
    ((part as f64 / whole as f64) * 10_000.0).round() / 100.0
}

// ============================================
// Snapshots
// ============================================

/// Which side of an edit a snapshot captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Before,
    After,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Before => "before",
            Phase::After => "after",
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "before" => Ok(Phase::Before),
            "after" => Ok(Phase::After),
            _ => Err(format!("unknown phase: {}", s)),
        }
    }
}

/// Pairing state of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    /// `before` waiting for its `after`
    Pending,
    /// Part of an EditEvent
    Completed,
    /// Superseded by a newer `before` for the same key; never paired
    Abandoned,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Pending => "pending",
            SnapshotStatus::Completed => "completed",
            SnapshotStatus::Abandoned => "abandoned",
        }
    }
}

impl std::str::FromStr for SnapshotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SnapshotStatus::Pending),
            "completed" => Ok(SnapshotStatus::Completed),
            "abandoned" => Ok(SnapshotStatus::Abandoned),
            _ => Err(format!("unknown snapshot status: {}", s)),
        }
    }
}

/// One half of a pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Row ID (0 before insertion)
    pub id: i64,
    /// Token shared by the `before` and `after` of one pairing
    pub pairing_token: String,
    /// Caller-assigned logical conversation ID
    pub session_id: String,
    /// Opaque file key
    pub file_path: String,
    pub phase: Phase,
    /// Full file text at this instant
    pub content: String,
    /// Hex-encoded SHA-256 of `content`
    pub content_hash: String,
    pub status: SnapshotStatus,
    pub recorded_at: DateTime<Utc>,
}

/// Acknowledgement returned by a successful `before` call.
#[derive(Debug, Clone, Serialize)]
pub struct BeforeAck {
    /// Snapshot row now pending for the key
    pub snapshot_id: i64,
    pub pairing_token: String,
    /// Snapshot IDs that this call superseded
    pub abandoned: Vec<i64>,
}

// ============================================
// Edit events
// ============================================

/// A completed before/after pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditEvent {
    pub id: i64,
    pub pairing_token: String,
    pub session_id: String,
    pub file_path: String,
    /// Project resolved from `file_path` at pairing time
    pub project_id: String,
    pub before_snapshot_id: i64,
    pub after_snapshot_id: i64,
    pub before_content: String,
    pub after_content: String,
    /// Free-form caller-provided session information
    pub session_info: Option<String>,
    pub paired_at: DateTime<Utc>,
}

// ============================================
// Metrics
// ============================================

/// Derived, immutable line counts for one EditEvent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdoptionMetric {
    pub id: i64,
    pub event_id: i64,
    pub session_id: String,
    pub file_path: String,
    pub project_id: String,
    /// Lines present in `after` but not in `before`
    pub generated_lines: i64,
    /// Equal to `generated_lines` when written; later survival is tracked by corrections
    pub adopted_lines: i64,
    /// Lines present in `before` but not in `after`
    pub removed_lines: i64,
    pub total_before_lines: i64,
    pub total_after_lines: i64,
    /// True when the diff was too large and counts are a length-based estimate
    pub estimated: bool,
    pub computed_at: DateTime<Utc>,
}

impl AdoptionMetric {
    /// Adoption rate of this event alone.
    pub fn adoption_rate(&self) -> f64 {
        adoption_rate(self.generated_lines, self.adopted_lines)
    }
}

/// How a generated line entered the file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    /// Pure insertion
    Added,
    /// Replaces removed lines in the same hunk
    Modified,
}

impl LineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineKind::Added => "added",
            LineKind::Modified => "modified",
        }
    }
}

impl std::str::FromStr for LineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "added" => Ok(LineKind::Added),
            "modified" => Ok(LineKind::Modified),
            _ => Err(format!("unknown line kind: {}", s)),
        }
    }
}

/// A single generated line of a metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedLine {
    /// 1-based line number in the `after` snapshot
    pub line_number: i64,
    pub kind: LineKind,
    pub content: String,
}

/// One-time, append-only adjustment of a prior metric's adopted lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdoptionCorrection {
    pub id: i64,
    /// The prior metric being corrected (at most one correction each)
    pub metric_id: i64,
    /// The edit event whose diff measured retention
    pub observed_event_id: i64,
    /// Prior generated lines still present in the later edit
    pub retained_lines: i64,
    /// `retained_lines - prior.adopted_lines`, added to the prior's buckets
    pub adopted_delta: i64,
    pub applied_at: DateTime<Utc>,
}

// ============================================
// Aggregates
// ============================================

/// Aggregation dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    File,
    Session,
    Project,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [Dimension::File, Dimension::Session, Dimension::Project];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::File => "file",
            Dimension::Session => "session",
            Dimension::Project => "project",
        }
    }
}

impl std::str::FromStr for Dimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Dimension::File),
            "session" => Ok(Dimension::Session),
            "project" => Ok(Dimension::Project),
            _ => Err(format!("unknown dimension: {}", s)),
        }
    }
}

/// The three bucket keys a metric contributes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketKeys {
    pub file_path: String,
    pub session_id: String,
    pub project_id: String,
}

impl BucketKeys {
    pub fn of(metric: &AdoptionMetric) -> Self {
        Self {
            file_path: metric.file_path.clone(),
            session_id: metric.session_id.clone(),
            project_id: metric.project_id.clone(),
        }
    }

    /// (dimension, key) pairs, one per dimension.
    pub fn pairs(&self) -> [(Dimension, &str); 3] {
        [
            (Dimension::File, self.file_path.as_str()),
            (Dimension::Session, self.session_id.as_str()),
            (Dimension::Project, self.project_id.as_str()),
        ]
    }
}

/// Running totals for one (dimension, key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateBucket {
    pub dimension: Dimension,
    pub key: String,
    pub generated_total: i64,
    pub adopted_total: i64,
    pub event_count: i64,
    pub estimated_event_count: i64,
    /// Timestamp of the newest contributing metric or correction
    pub last_updated: Option<DateTime<Utc>>,
}

impl AggregateBucket {
    /// A bucket with no contributions.
    pub fn empty(dimension: Dimension, key: &str) -> Self {
        Self {
            dimension,
            key: key.to_string(),
            generated_total: 0,
            adopted_total: 0,
            event_count: 0,
            estimated_event_count: 0,
            last_updated: None,
        }
    }

    /// Fold one metric into the totals.
    pub fn absorb_metric(&mut self, metric: &AdoptionMetric) {
        self.generated_total += metric.generated_lines;
        self.adopted_total += metric.adopted_lines;
        self.event_count += 1;
        if metric.estimated {
            self.estimated_event_count += 1;
        }
        self.touch(metric.computed_at);
    }

    /// Fold one correction into the totals.
    pub fn absorb_correction(&mut self, correction: &AdoptionCorrection) {
        self.adopted_total += correction.adopted_delta;
        self.touch(correction.applied_at);
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.last_updated = Some(match self.last_updated {
            Some(current) if current > at => current,
            _ => at,
        });
    }

    pub fn adoption_rate(&self) -> f64 {
        adoption_rate(self.generated_total, self.adopted_total)
    }
}

/// Global totals across every project bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalDashboard {
    pub generated_total: i64,
    pub adopted_total: i64,
    pub adoption_rate: f64,
    /// Generated total as a percentage of the latest line count of every tracked file
    pub generation_rate: f64,
    pub file_count: i64,
    pub session_count: i64,
    pub project_count: i64,
    pub event_count: i64,
    pub estimated_event_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn metric(generated: i64, estimated: bool, at: DateTime<Utc>) -> AdoptionMetric {
        AdoptionMetric {
            id: 1,
            event_id: 1,
            session_id: "s1".to_string(),
            file_path: "/p/f.rs".to_string(),
            project_id: "/p".to_string(),
            generated_lines: generated,
            adopted_lines: generated,
            removed_lines: 0,
            total_before_lines: 0,
            total_after_lines: generated,
            estimated,
            computed_at: at,
        }
    }

    #[test]
    fn test_adoption_rate_rounding() {
        assert_eq!(adoption_rate(0, 0), 0.0);
        assert_eq!(adoption_rate(3, 1), 33.33);
        assert_eq!(adoption_rate(3, 2), 66.67);
        assert_eq!(adoption_rate(4, 4), 100.0);
    }

    #[test]
    fn test_bucket_absorb() {
        let t1 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();

        let mut bucket = AggregateBucket::empty(Dimension::File, "/p/f.rs");
        bucket.absorb_metric(&metric(4, false, t2));
        bucket.absorb_metric(&metric(2, true, t1));

        assert_eq!(bucket.generated_total, 6);
        assert_eq!(bucket.adopted_total, 6);
        assert_eq!(bucket.event_count, 2);
        assert_eq!(bucket.estimated_event_count, 1);
        // Older contribution never moves last_updated backwards
        assert_eq!(bucket.last_updated, Some(t2));

        bucket.absorb_correction(&AdoptionCorrection {
            id: 1,
            metric_id: 1,
            observed_event_id: 2,
            retained_lines: 1,
            adopted_delta: -3,
            applied_at: t1,
        });
        assert_eq!(bucket.adopted_total, 3);
        assert_eq!(bucket.generated_total, 6);
        assert_eq!(bucket.adoption_rate(), 50.0);
    }

    #[test]
    fn test_enum_round_trip_strings() {
        for dim in Dimension::ALL {
            assert_eq!(dim.as_str().parse::<Dimension>().unwrap(), dim);
        }
        assert_eq!("abandoned".parse::<SnapshotStatus>().unwrap(), SnapshotStatus::Abandoned);
        assert_eq!("modified".parse::<LineKind>().unwrap(), LineKind::Modified);
        assert!("sideways".parse::<Phase>().is_err());
    }
}
