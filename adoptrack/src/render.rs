//! Plain-text rendering for CLI output
//!
//! Every renderer returns a `String` so output can be tested without a
//! terminal. JSON output bypasses this module and serializes core types.

use adoptrack_core::aggregate::IntegrityReport;
use adoptrack_core::backup::BackupSummary;
use adoptrack_core::diff::DiffTag;
use adoptrack_core::{AfterSummary, AggregateBucket, BeforeAck, EditDetail, GlobalDashboard, SnapshotRecord};
use chrono::{DateTime, Local, Utc};
use std::fmt::Write;

/// Longest snapshot preview shown in pairing listings
const PREVIEW_CHARS: usize = 40;

fn timestamp(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn before_ack(ack: &BeforeAck) -> String {
    let mut out = format!(
        "Recorded before snapshot {} (pairing {})\n",
        ack.snapshot_id, ack.pairing_token
    );
    for id in &ack.abandoned {
        let _ = writeln!(out, "  abandoned pending snapshot {}", id);
    }
    out
}

pub fn after_summary(summary: &AfterSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Edit event {} for {} (session {})",
        summary.event.id, summary.event.file_path, summary.event.session_id
    );
    let Some(m) = &summary.metric else {
        let _ = writeln!(out, "  metric pending; it will be recorded on the next call");
        return out;
    };
    let _ = writeln!(
        out,
        "  generated: {}  removed: {}  lines: {} -> {}{}",
        m.generated_lines,
        m.removed_lines,
        m.total_before_lines,
        m.total_after_lines,
        if m.estimated { "  (estimated)" } else { "" }
    );
    if let Some(c) = &summary.correction {
        let _ = writeln!(
            out,
            "  previous edit: {} generated lines retained (adjusted {:+})",
            c.retained_lines, c.adopted_delta
        );
    }
    out
}

pub fn bucket(bucket: &AggregateBucket) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} {}", bucket.dimension.as_str(), bucket.key);
    if bucket.event_count == 0 {
        let _ = writeln!(out, "  no edits recorded");
        return out;
    }
    let _ = writeln!(
        out,
        "  generated: {}  adopted: {}  adoption: {:.2}%",
        bucket.generated_total,
        bucket.adopted_total,
        bucket.adoption_rate()
    );
    let _ = writeln!(
        out,
        "  edits: {}{}",
        bucket.event_count,
        match bucket.estimated_event_count {
            0 => String::new(),
            n => format!(" ({} estimated)", n),
        }
    );
    if let Some(at) = &bucket.last_updated {
        let _ = writeln!(out, "  last updated: {}", timestamp(at));
    }
    out
}

pub fn bucket_table(buckets: &[AggregateBucket]) -> String {
    if buckets.is_empty() {
        return "No buckets recorded.\n".to_string();
    }
    let width = buckets.iter().map(|b| b.key.len()).max().unwrap_or(0).max(3);
    let mut out = format!(
        "{:<width$}  {:>9}  {:>9}  {:>8}  {:>6}\n",
        "KEY", "GENERATED", "ADOPTED", "RATE", "EDITS"
    );
    for b in buckets {
        let _ = writeln!(
            out,
            "{:<width$}  {:>9}  {:>9}  {:>7.2}%  {:>6}",
            b.key,
            b.generated_total,
            b.adopted_total,
            b.adoption_rate(),
            b.event_count
        );
    }
    out
}

pub fn dashboard(d: &GlobalDashboard) -> String {
    let mut out = String::from("Adoption dashboard\n");
    let _ = writeln!(out, "  generated lines: {}", d.generated_total);
    let _ = writeln!(out, "  adopted lines:   {}", d.adopted_total);
    let _ = writeln!(out, "  adoption rate:   {:.2}%", d.adoption_rate);
    let _ = writeln!(out, "  generation rate: {:.2}%", d.generation_rate);
    let _ = writeln!(
        out,
        "  files: {}  sessions: {}  projects: {}",
        d.file_count, d.session_count, d.project_count
    );
    let _ = writeln!(
        out,
        "  edits: {} ({} estimated)",
        d.event_count, d.estimated_event_count
    );
    out
}

pub fn edit_detail(detail: &EditDetail) -> String {
    let e = &detail.event;
    let mut out = String::new();
    let _ = writeln!(out, "Edit event {}", e.id);
    let _ = writeln!(out, "  file:    {}", e.file_path);
    let _ = writeln!(out, "  session: {}", e.session_id);
    let _ = writeln!(out, "  project: {}", e.project_id);
    let _ = writeln!(out, "  paired:  {}", timestamp(&e.paired_at));
    if let Some(info) = &e.session_info {
        let _ = writeln!(out, "  info:    {}", info);
    }

    match &detail.metric {
        Some(m) => {
            let _ = writeln!(
                out,
                "  generated: {}  removed: {}{}",
                m.generated_lines,
                m.removed_lines,
                if m.estimated { "  (estimated)" } else { "" }
            );
        }
        None => {
            let _ = writeln!(out, "  metric not yet recorded");
        }
    }
    if let Some(c) = &detail.correction {
        let _ = writeln!(
            out,
            "  retained by event {}: {} lines (adjusted {:+})",
            c.observed_event_id, c.retained_lines, c.adopted_delta
        );
    }

    match &detail.diff {
        Some(lines) => {
            out.push('\n');
            for line in lines {
                let marker = match line.tag {
                    DiffTag::Equal => ' ',
                    DiffTag::Added => '+',
                    DiffTag::Removed => '-',
                };
                let _ = writeln!(out, "{}{}", marker, line.text);
            }
        }
        None => {
            let _ = writeln!(out, "\n  (diff too large to display)");
        }
    }
    out
}

pub fn snapshots(records: &[SnapshotRecord]) -> String {
    if records.is_empty() {
        return "No pairings in that state.\n".to_string();
    }
    let mut out = String::new();
    for s in records {
        let first_line = s.content.lines().next().unwrap_or("");
        let preview: String = first_line.chars().take(PREVIEW_CHARS).collect();
        let _ = writeln!(
            out,
            "{:>6}  {}  {}  {}  {:?}",
            s.id,
            timestamp(&s.recorded_at),
            s.session_id,
            s.file_path,
            preview
        );
    }
    out
}

pub fn integrity(report: &IntegrityReport) -> String {
    let mut out = format!(
        "Replayed {} metrics and {} corrections into {} buckets\n",
        report.metrics_replayed, report.corrections_replayed, report.buckets_checked
    );
    if report.is_consistent() {
        out.push_str("All buckets match the log.\n");
        return out;
    }
    let _ = writeln!(out, "{} bucket(s) differ:", report.mismatches.len());
    let describe = |b: &Option<AggregateBucket>| match b {
        Some(b) => format!(
            "generated={} adopted={} events={}",
            b.generated_total, b.adopted_total, b.event_count
        ),
        None => "missing".to_string(),
    };
    for m in &report.mismatches {
        let _ = writeln!(
            out,
            "  {} {}: live [{}] vs log [{}]",
            m.dimension.as_str(),
            m.key,
            describe(&m.live),
            describe(&m.replayed)
        );
    }
    out
}

pub fn backup(verb: &str, summary: &BackupSummary) -> String {
    format!(
        "{} {} snapshots, {} edit events, {} metrics, {} corrections\n",
        verb, summary.snapshots, summary.events, summary.metrics, summary.corrections
    )
}
