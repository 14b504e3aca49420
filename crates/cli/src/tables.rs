//! Table rendering for CLI output.

use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};

use taskmerge_core::conflict::ResolutionStatus;
use taskmerge_core::db::queries::AuditLogEntry;
use taskmerge_core::models::{FileTimelineEntry, TaskStatus, WorktreeTask};
use taskmerge_core::report::MergeReport;

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header);
    table
}

/// First 10 characters of a commit SHA.
pub fn short_sha(sha: &str) -> &str {
    sha.get(..10).unwrap_or(sha)
}

pub fn print_tasks(tasks: &[WorktreeTask]) {
    let mut t = table(vec![
        "Task", "Branch", "Phase", "Depends on", "Status", "Merge commit",
    ]);
    for task in tasks {
        let status = match task.status {
            TaskStatus::Merged => Cell::new("merged").fg(Color::Green),
            TaskStatus::Blocked => Cell::new("blocked").fg(Color::Red),
            TaskStatus::Pending => Cell::new("pending").fg(Color::Yellow),
        };
        t.add_row(vec![
            Cell::new(&task.task_id),
            Cell::new(&task.branch_name),
            Cell::new(task.phase),
            Cell::new(task.depends_on.join(", ")),
            status,
            Cell::new(task.merge_commit.as_deref().map(short_sha).unwrap_or("-")),
        ]);
    }
    println!("{}", t);
}

pub fn print_report(report: &MergeReport) {
    println!();
    println!("Merge session {}", report.session_id);
    println!("  Target     : {}", report.target_branch);
    println!("  State      : {}", report.state);
    println!("  Started at : {}", report.started_at.to_rfc3339());
    if let Some(completed) = report.completed_at {
        println!("  Completed  : {}", completed.to_rfc3339());
    }
    println!();

    if report.tasks.is_empty() {
        println!("No tasks were merged in this session.");
    } else {
        let mut t = table(vec!["Task", "Outcome", "Commit", "Reason"]);
        for task in &report.tasks {
            let outcome = match task.outcome.as_str() {
                "merged" | "already_merged" => Cell::new(&task.outcome).fg(Color::Green),
                "blocked" => Cell::new(&task.outcome).fg(Color::Red),
                _ => Cell::new(&task.outcome).fg(Color::Yellow),
            };
            t.add_row(vec![
                Cell::new(&task.task_id),
                outcome,
                Cell::new(task.commit.as_deref().map(short_sha).unwrap_or("-")),
                Cell::new(task.reason.as_deref().unwrap_or("")),
            ]);
        }
        println!("{}", t);
    }

    if !report.conflicts.is_empty() {
        println!();
        let mut t = table(vec![
            "File", "Task", "Kind", "Confidence", "Status", "Strategy",
        ]);
        for conflict in &report.conflicts {
            let status = match conflict.resolution_status {
                ResolutionStatus::Unresolved => {
                    Cell::new(conflict.resolution_status).fg(Color::Red)
                }
                _ => Cell::new(conflict.resolution_status).fg(Color::Green),
            };
            t.add_row(vec![
                Cell::new(&conflict.file),
                Cell::new(&conflict.task_id),
                Cell::new(conflict.kind),
                Cell::new(format!("{:.2}", conflict.confidence)),
                status,
                Cell::new(
                    conflict
                        .strategy
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                ),
            ]);
        }
        println!("{}", t);
    }

    println!();
    println!(
        "merged: {}, already merged: {}, blocked: {}, busy: {}, cancelled: {}, unresolved conflicts: {}",
        report.count_outcome("merged"),
        report.count_outcome("already_merged"),
        report.count_outcome("blocked"),
        report.count_outcome("target_busy"),
        report.count_outcome("cancelled"),
        report.unresolved_conflicts(),
    );
}

pub fn print_timeline(entries: &[FileTimelineEntry]) {
    let mut t = table(vec!["Commit", "Time", "Change", "Path", "Parent"]);
    for entry in entries {
        let path = match &entry.old_path {
            Some(old) => format!("{} -> {}", old, entry.file_path),
            None => entry.file_path.clone(),
        };
        t.add_row(vec![
            Cell::new(short_sha(&entry.commit_sha)),
            Cell::new(entry.timestamp.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(entry.change_kind),
            Cell::new(path),
            Cell::new(entry.parent_sha.as_deref().map(short_sha).unwrap_or("-")),
        ]);
    }
    println!("{}", t);
}

pub fn print_audit(entries: &[AuditLogEntry]) {
    let mut t = table(vec!["Time", "Action", "Session", "Task", "Details"]);
    for entry in entries {
        let action = if entry.success {
            Cell::new(&entry.action)
        } else {
            Cell::new(&entry.action).fg(Color::Red)
        };
        t.add_row(vec![
            Cell::new(&entry.created_at),
            action,
            Cell::new(entry.session_id.as_deref().map(short_sha).unwrap_or("-")),
            Cell::new(entry.task_id.as_deref().unwrap_or("-")),
            Cell::new(entry.details.as_deref().unwrap_or("")),
        ]);
    }
    println!("{}", t);
}
