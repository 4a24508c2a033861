//! Per-cycle records written to the activity log.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::commands::SkippedCommand;

/// Longest summary kept for the activity log, in characters.
pub const SUMMARY_MAX_CHARS: usize = 150;

/// What happened during one cycle. Never persisted except as log text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleRecord {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub session_id: Option<String>,
    pub summary: String,
    pub commands_applied: usize,
    pub commands_skipped: Vec<SkippedCommand>,
    pub backup: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

impl CycleRecord {
    pub fn duration(&self) -> Duration {
        (self.ended_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Markdown body for the activity log.
    pub fn to_log_entry(&self) -> String {
        let mut buf = format!("**Cycle {}**\n\n", self.cycle);
        if let Some(session) = &self.session_id {
            buf.push_str(&format!("Session: {session}\n"));
        }
        buf.push_str(&format!("Summary: {}\n", self.summary));
        buf.push_str(&format!(
            "Memory Updates: {} applied, {} skipped\n",
            self.commands_applied,
            self.commands_skipped.len()
        ));
        for skipped in &self.commands_skipped {
            buf.push_str(&format!(
                "  - #{} {}: {}\n",
                skipped.index,
                skipped.kind.as_deref().unwrap_or("?"),
                skipped.error
            ));
        }
        if let Some(backup) = &self.backup {
            buf.push_str(&format!("Backup: {backup}\n"));
        }
        buf.push_str(&format!("Duration: {:.1?}\n", self.duration()));
        if self.success {
            buf.push_str("Status: success\n");
        } else {
            buf.push_str(&format!(
                "Status: failed ({})\n",
                self.error.as_deref().unwrap_or("unknown error")
            ));
        }
        buf
    }
}

/// First meaningful line of the agent's reply, stripped of markdown lead-in.
pub fn extract_summary(response: &str) -> String {
    let line = response
        .lines()
        .map(|line| line.trim_start_matches(|c: char| c == '#' || c == '*' || c == '-' || c.is_whitespace()))
        .find(|line| !line.trim().is_empty())
        .unwrap_or(response);
    truncate_chars(line.trim_end(), SUMMARY_MAX_CHARS)
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max - 3).collect();
    format!("{cut}...")
}
