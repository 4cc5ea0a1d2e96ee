use std::fmt::Write;

use crate::core::grouper::Grouping;
use crate::core::models::{BackupSet, TransferDirection};
use crate::core::orchestrator::{PruneReport, RestoreReport, SetTransferReport};
use crate::core::progress::{ProgressEvent, ProgressPhase};
use crate::db::sets::IndexedSet;

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

pub fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;

    if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

fn progress_bar(percentage: u8, width: usize) -> String {
    let percentage = percentage.min(100) as usize;
    let filled = (percentage * width) / 100;
    format!("[{}{}]", "#".repeat(filled), "-".repeat(width - filled))
}

/// One status line for a progress event.
pub fn progress_line(event: &ProgressEvent) -> String {
    let pct = event.percentage();
    let phase = match event.phase {
        ProgressPhase::Hashing => "hashing",
        ProgressPhase::Transferring => "copying",
        ProgressPhase::Verifying => "verifying",
        ProgressPhase::Succeeded => "done",
        ProgressPhase::Failed => "failed",
        ProgressPhase::Paused => "paused",
    };
    let mut line = format!(
        "{} {:>3}% {:<9} {} / {}",
        progress_bar(pct, 20),
        pct,
        phase,
        format_bytes(event.bytes_confirmed),
        format_bytes(event.total_bytes)
    );
    if event.smoothed_bps > 0.0 {
        let _ = write!(line, "  {}/s", format_bytes(event.smoothed_bps as u64));
    }
    if let Some(eta) = event.eta_secs.filter(|_| !event.phase.is_terminal()) {
        let _ = write!(line, "  eta {}", format_duration(eta));
    }
    let _ = write!(line, "  {}", event.file_name);
    line
}

pub fn set_summary(set: &BackupSet) -> String {
    let state = if set.is_full() {
        "full"
    } else if set.is_complete() {
        "complete"
    } else {
        "incomplete"
    };
    let mut out = format!(
        "{}  {}  {} file(s), {}  [{}]",
        set.key().timestamp,
        set.key().origin,
        set.members().len(),
        format_bytes(set.total_size()),
        state
    );
    let missing = set.missing_roles();
    if !missing.is_empty() {
        let names: Vec<&str> = missing.iter().map(|r| r.as_str()).collect();
        let _ = write!(out, "  missing: {}", names.join(", "));
    }
    out
}

pub fn grouping(grouping: &Grouping) -> String {
    let mut out = String::new();
    if grouping.sets.is_empty() {
        out.push_str("No backup sets found.\n");
    }
    for set in &grouping.sets {
        let _ = writeln!(out, "{}", set_summary(set));
        for member in set.members() {
            let _ = writeln!(
                out,
                "    {:<15} {:>10}  {}",
                member.role.as_str(),
                format_bytes(member.size),
                member.file_name
            );
        }
    }
    for warning in &grouping.warnings {
        let _ = writeln!(out, "warning: {warning}");
    }
    out
}

pub fn transfer_report(report: &SetTransferReport) -> String {
    let mut out = format!(
        "{} {}: {} ({} moved)\n",
        match report.direction {
            TransferDirection::Download => "Download",
            TransferDirection::Upload => "Upload",
        },
        report.key,
        report.presence.as_str(),
        format_bytes(report.bytes_transferred())
    );
    for member in &report.members {
        let state = if member.cancelled {
            "cancelled (resumable)".to_string()
        } else if let Some(failure) = &member.failure {
            format!("failed: {failure}")
        } else if member.bytes_transferred == 0 {
            "already present".to_string()
        } else {
            format!("ok after {} attempt(s)", member.attempts)
        };
        let _ = writeln!(out, "    {:<15} {}  {}", member.role.as_str(), member.file_name, state);
    }
    out
}

pub fn restore_report(report: &RestoreReport) -> String {
    let mut out = format!("Restored {}\n", report.key);
    if report.created_site {
        out.push_str("    site created first\n");
    }
    if let Some(verified) = &report.verified {
        let _ = writeln!(
            out,
            "    verified {} file(s), {}",
            verified.files_verified,
            format_bytes(verified.bytes_verified)
        );
    }
    if let Some(carry) = report.key_carry {
        let _ = writeln!(out, "    encryption key: {carry:?}");
    }
    for step in &report.maintenance {
        match &step.error {
            None => {
                let _ = writeln!(out, "    {}: ok", step.step.as_str());
            }
            Some(error) => {
                let _ = writeln!(out, "    {}: failed ({error})", step.step.as_str());
            }
        }
    }
    out
}

pub fn prune_report(report: &PruneReport) -> String {
    let mut out = String::new();
    for key in &report.removed {
        let _ = writeln!(out, "removed {key}");
    }
    let _ = writeln!(
        out,
        "Kept {} set(s), removed {}, freed {}",
        report.kept.len(),
        report.removed.len(),
        format_bytes(report.bytes_freed)
    );
    out
}

pub fn index_status(sets: &[IndexedSet]) -> String {
    if sets.is_empty() {
        return "Index is empty.\n".to_string();
    }
    let mut out = String::new();
    for set in sets {
        let _ = writeln!(
            out,
            "{}  {:<9} {}/{} member(s)",
            set.key,
            set.presence.as_str(),
            set.succeeded_members,
            set.expected_members
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_use_binary_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.0 MB");
    }

    #[test]
    fn durations_drop_small_units_for_long_spans() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(3 * 3600 + 60), "3h 1m");
    }

    #[test]
    fn prune_report_lists_removed_sets() {
        use crate::core::models::ProvenanceKey;
        let report = PruneReport {
            kept: vec![ProvenanceKey::new("erp", "20250910_010000")],
            removed: vec![ProvenanceKey::new("erp", "20250909_010000")],
            bytes_freed: 2048,
        };
        let text = prune_report(&report);
        assert!(text.starts_with("removed "));
        assert!(text.contains("20250909_010000"));
        assert!(text.ends_with("Kept 1 set(s), removed 1, freed 2.0 KB\n"));
    }

    #[test]
    fn bar_is_clamped() {
        assert_eq!(progress_bar(150, 4), "[####]");
        assert_eq!(progress_bar(50, 4), "[##--]");
    }
}
