//! Work model: one logical retrieval task per input record.
//!
//! A [`Work`] tracks an input record through search, selection, download, and
//! journal finalization. Its lifecycle is a small state machine:
//! `pending -> {completed | failed | deferred | no_match}`, with
//! `deferred -> {completed | failed}` on deferred-queue replay. Every status
//! transition is appended to `history` with a timestamp, and the whole record
//! is persisted as `work.json` in the work directory.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One row of the user-facing input file.
///
/// `fields` preserves every original column (including ones this tool does
/// not interpret) so the in-place rewrite at the end of a work loses nothing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputRecord {
    /// Stable identifier, unique within the input file.
    pub entry_id: String,
    /// Work title used for searching and scoring.
    pub title: String,
    /// Creator/author, if the input provides one.
    pub creator: Option<String>,
    /// Publication year, if the input provides one.
    pub year: Option<String>,
    /// All original columns, keyed by header name.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl InputRecord {
    /// Creates a record from the typed columns only (tests and adapters).
    #[must_use]
    pub fn new(entry_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
            title: title.into(),
            creator: None,
            year: None,
            fields: BTreeMap::new(),
        }
    }

    /// Sets the creator column.
    #[must_use]
    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = Some(creator.into());
        self
    }

    /// Sets the year column.
    #[must_use]
    pub fn with_year(mut self, year: impl Into<String>) -> Self {
        self.year = Some(year.into());
        self
    }

    /// Value of the `retrievable` column, if present.
    #[must_use]
    pub fn retrievable(&self) -> Option<&str> {
        self.fields.get("retrievable").map(String::as_str)
    }
}

/// Terminal and non-terminal lifecycle states of a work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Created but not yet resolved to a terminal state.
    Pending,
    /// At least one artifact was written (or, in dry-run, `work.json` persisted).
    Completed,
    /// All candidates failed for non-deferred reasons.
    Failed,
    /// Waiting in the deferred queue for a quota window to reset.
    Deferred,
    /// The selector found no acceptable candidate.
    NoMatch,
}

impl WorkStatus {
    /// Returns the stable string used in `index.csv` and `work.json`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Deferred => "deferred",
            Self::NoMatch => "no_match",
        }
    }

    /// True for states that end a work's lifecycle within a run.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A timestamped status-transition entry in `work.json.history`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEvent {
    /// When the transition happened.
    pub at: DateTime<Utc>,
    /// Event string, e.g. `ia:failed:transient` or `status:completed`.
    pub event: String,
}

/// One logical retrieval task corresponding to one input record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Work {
    /// Stable hash of `entry_id` + title; used in `index.csv` and state linkage.
    pub work_id: String,
    /// The originating input record.
    pub input: InputRecord,
    /// Directory all of this work's files live under.
    pub work_dir: PathBuf,
    /// Every scored candidate seen for this work, in ranked order.
    pub candidates: Vec<crate::select::ScoredCandidate>,
    /// The chosen primary and its ordered fallbacks, once selection ran.
    pub selected: Option<crate::select::Selection>,
    /// Current lifecycle state.
    pub status: WorkStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Status transitions, oldest first.
    pub history: Vec<HistoryEvent>,
}

impl Work {
    /// Creates a pending work for an input record.
    #[must_use]
    pub fn new(input: InputRecord, work_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            work_id: work_id(&input.entry_id, &input.title),
            input,
            work_dir,
            candidates: Vec::new(),
            selected: None,
            status: WorkStatus::Pending,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    /// Appends an event without changing status (e.g. a failed candidate).
    pub fn record_event(&mut self, event: impl Into<String>) {
        self.history.push(HistoryEvent {
            at: Utc::now(),
            event: event.into(),
        });
        self.updated_at = Utc::now();
    }

    /// Transitions to a new status, recording the transition in history.
    ///
    /// Invalid transitions (out of a terminal state other than `deferred`)
    /// are ignored with a warning; the journal keeps the first terminal state.
    pub fn transition(&mut self, next: WorkStatus) {
        let allowed = match self.status {
            WorkStatus::Pending => true,
            WorkStatus::Deferred => matches!(next, WorkStatus::Completed | WorkStatus::Failed),
            _ => false,
        };
        if !allowed {
            tracing::warn!(
                work_id = %self.work_id,
                from = self.status.as_str(),
                to = next.as_str(),
                "ignoring invalid status transition"
            );
            return;
        }
        self.status = next;
        self.record_event(format!("status:{}", next.as_str()));
    }

    /// The flattened candidate attempt order: primary first, then fallbacks.
    #[must_use]
    pub fn attempt_order(&self) -> Vec<&crate::select::ScoredCandidate> {
        match &self.selected {
            Some(sel) => std::iter::once(&sel.primary).chain(sel.fallbacks.iter()).collect(),
            None => Vec::new(),
        }
    }
}

/// Stable work identifier: first 16 hex chars of SHA-256 over entry id + title.
#[must_use]
pub fn work_id(entry_id: &str, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entry_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(title.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_work_id_is_stable_and_short() {
        let a = work_id("E1", "The Raven");
        let b = work_id("E1", "The Raven");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_work_id_differs_by_entry_and_title() {
        assert_ne!(work_id("E1", "The Raven"), work_id("E2", "The Raven"));
        assert_ne!(work_id("E1", "The Raven"), work_id("E1", "The Bells"));
        // The separator prevents concatenation collisions.
        assert_ne!(work_id("E1x", "y"), work_id("E1", "xy"));
    }

    #[test]
    fn test_status_terminal_classification() {
        assert!(!WorkStatus::Pending.is_terminal());
        assert!(WorkStatus::Completed.is_terminal());
        assert!(WorkStatus::Failed.is_terminal());
        assert!(WorkStatus::Deferred.is_terminal());
        assert!(WorkStatus::NoMatch.is_terminal());
    }

    #[test]
    fn test_transition_records_history() {
        let mut work = Work::new(InputRecord::new("E1", "The Raven"), PathBuf::from("/tmp/w"));
        assert_eq!(work.status, WorkStatus::Pending);

        work.transition(WorkStatus::Completed);
        assert_eq!(work.status, WorkStatus::Completed);
        assert_eq!(work.history.len(), 1);
        assert_eq!(work.history[0].event, "status:completed");
    }

    #[test]
    fn test_transition_out_of_terminal_is_ignored() {
        let mut work = Work::new(InputRecord::new("E1", "The Raven"), PathBuf::from("/tmp/w"));
        work.transition(WorkStatus::Failed);
        work.transition(WorkStatus::Completed);
        assert_eq!(work.status, WorkStatus::Failed, "failed is terminal");
    }

    #[test]
    fn test_deferred_can_resolve_to_completed() {
        let mut work = Work::new(InputRecord::new("E1", "The Raven"), PathBuf::from("/tmp/w"));
        work.transition(WorkStatus::Deferred);
        work.transition(WorkStatus::Completed);
        assert_eq!(work.status, WorkStatus::Completed);
        assert_eq!(work.history.len(), 2);
    }

    #[test]
    fn test_record_event_keeps_order() {
        let mut work = Work::new(InputRecord::new("E1", "The Raven"), PathBuf::from("/tmp/w"));
        work.record_event("ia:failed:transient");
        work.record_event("bnf:completed");
        let events: Vec<_> = work.history.iter().map(|h| h.event.as_str()).collect();
        assert_eq!(events, ["ia:failed:transient", "bnf:completed"]);
    }
}
