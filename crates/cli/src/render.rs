// crates/cli/src/render.rs
//! Plain-text rendering for the terminal.

use std::fmt::Write;

use todo_progress_client::{ConnectionState, TrackerPhase, TrackerView};
use todo_progress_core::{JobSession, JobState, TodoItem, TodoList};

pub fn lists(lists: &[TodoList]) -> String {
    if lists.is_empty() {
        return "  (no lists)\n".to_string();
    }
    let mut out = String::new();
    for list in lists {
        let _ = writeln!(
            out,
            "  {:>5}  {}  ({} open)",
            list.id, list.name, list.incomplete_item_count
        );
    }
    out
}

pub fn items(items: &[TodoItem]) -> String {
    if items.is_empty() {
        return "  (no items)\n".to_string();
    }
    let mut out = String::new();
    for item in items {
        let mark = if item.completed { "x" } else { " " };
        let _ = writeln!(out, "  [{mark}] {:>5}  {}", item.id, item.description);
    }
    out
}

/// Message shown next to the progress bar.
pub fn progress_message(view: &TrackerView, connection: ConnectionState) -> String {
    let mut message = match (&view.phase, &view.session) {
        (TrackerPhase::Subscribing, _) => "subscribing".to_string(),
        (_, Some(session)) if session.total_count > 0 => format!(
            "{} {}/{}",
            session.state.label(),
            session.processed_count,
            session.total_count
        ),
        (_, Some(session)) => session.state.label().to_string(),
        (_, None) => "idle".to_string(),
    };
    if connection != ConnectionState::Connected {
        let _ = write!(message, " ({connection})");
    }
    if view.stalled {
        message.push_str(" - no updates yet, the job may already be done");
    }
    message
}

/// Bar position out of `length`. Unknown totals stay at zero.
pub fn bar_position(session: &JobSession, length: u64) -> u64 {
    session
        .progress_ratio()
        .map_or(0, |ratio| (ratio * length as f64).round() as u64)
}

/// Final line for a settled job.
pub fn outcome_line(session: &JobSession) -> String {
    match session.state {
        JobState::Completed => format!(
            "  \u{2713} Job {} completed ({}/{} items)",
            session.job_id, session.processed_count, session.total_count
        ),
        JobState::Failed => format!(
            "  \u{2717} Job {} failed: {}",
            session.job_id,
            session.error_message.as_deref().unwrap_or_default()
        ),
        JobState::Queued | JobState::Processing => format!(
            "  ? Job {} is still {}",
            session.job_id, session.state
        ),
    }
}
