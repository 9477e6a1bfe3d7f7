//! Deferred download tasks awaiting a quota reset or scheduled retry.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::Candidate;

/// Why a task was deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    /// Daily quota exhausted.
    Quota,
    /// Provider-side rate limiting.
    Rate,
    /// Transient failure scheduled for a later retry.
    Transient,
}

/// Lifecycle of a deferred item across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferredStatus {
    /// Waiting for `ready_at`.
    Pending,
    /// Replayed and completed.
    Completed,
    /// Replayed and failed.
    Failed,
}

impl DeferredStatus {
    /// True for replayed items that no longer need scheduling.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One persisted deferred task.
///
/// Carries enough to rebuild the download after a restart: the work's
/// identity and directory plus the candidate that was being attempted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredItem {
    pub work_id: String,
    pub entry_id: String,
    pub work_dir: PathBuf,
    pub candidate: Candidate,
    pub reason: DeferReason,
    /// Earliest wall time the task may be replayed.
    pub ready_at: DateTime<Utc>,
    pub attempt_index: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_status")]
    pub status: DeferredStatus,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

fn default_status() -> DeferredStatus {
    DeferredStatus::Pending
}

impl DeferredItem {
    /// True when the item is pending and its ready time has passed.
    #[must_use]
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == DeferredStatus::Pending && self.ready_at <= now
    }

    /// True when the item is terminal and older than `max_age_days`.
    #[must_use]
    pub fn is_prunable(&self, now: DateTime<Utc>, max_age_days: i64) -> bool {
        if !self.status.is_terminal() {
            return false;
        }
        let reference = self.resolved_at.unwrap_or(self.created_at);
        now - reference >= chrono::Duration::days(max_age_days)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn item(ready_at: DateTime<Utc>) -> DeferredItem {
        DeferredItem {
            work_id: "abc".into(),
            entry_id: "E1".into(),
            work_dir: PathBuf::from("/tmp/w"),
            candidate: Candidate {
                provider_key: "annas".into(),
                provider_display_name: "Annas".into(),
                title: "T".into(),
                creators: vec![],
                date: None,
                source_id: "s".into(),
                item_url: None,
                iiif_manifest_url: None,
                download_hint: serde_json::Value::Null,
                raw_metadata: serde_json::Value::Null,
            },
            reason: DeferReason::Quota,
            ready_at,
            attempt_index: 0,
            created_at: ready_at - Duration::hours(24),
            status: DeferredStatus::Pending,
            resolved_at: None,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_is_ready_respects_time_and_status() {
        let pending = item(t0());
        assert!(!pending.is_ready(t0() - Duration::seconds(1)));
        assert!(pending.is_ready(t0()));
        assert!(pending.is_ready(t0() + Duration::hours(1)));

        let mut done = item(t0());
        done.status = DeferredStatus::Completed;
        assert!(!done.is_ready(t0() + Duration::hours(1)));
    }

    #[test]
    fn test_prunable_only_when_terminal_and_old() {
        let now = t0();
        let mut item = item(now);
        assert!(!item.is_prunable(now + Duration::days(30), 7), "pending never pruned");

        item.status = DeferredStatus::Failed;
        item.resolved_at = Some(now);
        assert!(!item.is_prunable(now + Duration::days(6), 7));
        assert!(item.is_prunable(now + Duration::days(7), 7));
    }

    #[test]
    fn test_serde_round_trip_preserves_item() {
        let original = item(t0());
        let text = serde_json::to_string(&original).unwrap();
        let back: DeferredItem = serde_json::from_str(&text).unwrap();
        assert_eq!(back, original);
    }
}
