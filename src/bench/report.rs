//! Task report formatting and export.

use super::{TaskReport, TaskStatus};
use crate::status::format_duration_secs;

/// Format a task report as a one-line human-readable summary.
pub fn format_summary(report: &TaskReport) -> String {
    let succeeded = report
        .trials
        .iter()
        .filter(|t| t.status == TaskStatus::Success)
        .count();
    let failed = report
        .trials
        .iter()
        .filter(|t| t.status == TaskStatus::Failure)
        .count();

    let mut summary = format!("{}: {}", report.name, report.status);
    if let Some(expected) = report.expected_trials {
        summary.push_str(&format!(
            ", {}/{} trial{} ({} succeeded, {} failed)",
            report.trials.len(),
            expected,
            if expected == 1 { "" } else { "s" },
            succeeded,
            failed,
        ));
    }
    if let Some(avg) = report.average_time {
        summary.push_str(&format!(", avg {}", format_duration_secs(avg)));
    }
    summary
}

/// Whether a report holds every trial it was started with.
pub fn is_downloadable(report: &TaskReport) -> bool {
    match report.expected_trials {
        Some(expected) => expected > 0 && report.trials.len() as u32 >= expected,
        None => false,
    }
}

/// Pretty JSON of the downloadable reports.
pub fn export_json(reports: &[TaskReport]) -> serde_json::Result<String> {
    let ready: Vec<&TaskReport> = reports.iter().filter(|r| is_downloadable(r)).collect();
    serde_json::to_string_pretty(&ready)
}
