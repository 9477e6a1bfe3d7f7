//! Persistent process state: quota ledger and deferred queue.
//!
//! Both structures live in a single JSON document
//! (`.downloader_state.json` under the output root) and are always persisted
//! together via write-to-temp-then-rename. A missing file on first run is
//! not an error. Terminal deferred items older than seven days are pruned on
//! save and via explicit compaction.

pub mod deferred;
pub mod quota;

pub use deferred::{DeferReason, DeferredItem, DeferredStatus};
pub use quota::{QuotaDecision, QuotaState};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::QuotaSettings;

/// File name of the state document under the output root.
pub const STATE_FILE_NAME: &str = ".downloader_state.json";

/// Current schema version of the state document.
pub const STATE_VERSION: u32 = 1;

/// Terminal deferred items older than this many days are pruned.
const DEFERRED_MAX_AGE_DAYS: i64 = 7;

/// Errors from state persistence.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse state file {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    version: u32,
    #[serde(default)]
    quota: BTreeMap<String, QuotaState>,
    #[serde(default)]
    deferred: Vec<DeferredItem>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            quota: BTreeMap::new(),
            deferred: Vec::new(),
        }
    }
}

/// Thread-safe store over the persisted quota ledger and deferred queue.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    inner: Mutex<PersistedState>,
}

impl StateStore {
    /// Opens the state file under `output_root`, tolerating a missing file.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when the file exists but cannot be read or
    /// parsed.
    pub fn load_or_default(output_root: &Path) -> Result<Self, StateError> {
        Self::open(output_root.join(STATE_FILE_NAME))
    }

    /// Opens an explicit state file path.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when the file exists but cannot be read or
    /// parsed.
    pub fn open(path: PathBuf) -> Result<Self, StateError> {
        let state = if path.exists() {
            let bytes = fs::read(&path).map_err(|source| StateError::Io {
                path: path.clone(),
                source,
            })?;
            serde_json::from_slice(&bytes).map_err(|source| StateError::Serde {
                path: path.clone(),
                source,
            })?
        } else {
            debug!(path = %path.display(), "no state file, starting fresh");
            PersistedState::default()
        };
        Ok(Self {
            path,
            inner: Mutex::new(state),
        })
    }

    /// Persists both structures atomically, pruning old terminal deferred
    /// items first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on serialization or filesystem failure.
    #[instrument(skip(self))]
    pub fn save(&self) -> Result<(), StateError> {
        let now = Utc::now();
        let bytes = {
            let mut state = self.lock();
            state
                .deferred
                .retain(|item| !item.is_prunable(now, DEFERRED_MAX_AGE_DAYS));
            serde_json::to_vec_pretty(&*state).map_err(|source| StateError::Serde {
                path: self.path.clone(),
                source,
            })?
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| StateError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).map_err(|source| StateError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| StateError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), "state persisted");
        Ok(())
    }

    /// Quota admission check for a provider, creating state on first use.
    pub fn quota_check(
        &self,
        provider_key: &str,
        settings: &QuotaSettings,
        now: DateTime<Utc>,
    ) -> QuotaDecision {
        let mut state = self.lock();
        let quota = state
            .quota
            .entry(provider_key.to_string())
            .or_insert_with(|| QuotaState::new(settings, now));
        quota.check(settings, now)
    }

    /// Records one successful quota-gated download for a provider.
    pub fn quota_record_use(
        &self,
        provider_key: &str,
        settings: &QuotaSettings,
        now: DateTime<Utc>,
    ) {
        let mut state = self.lock();
        let quota = state
            .quota
            .entry(provider_key.to_string())
            .or_insert_with(|| QuotaState::new(settings, now));
        quota.record_use();
    }

    /// Snapshot of the quota ledger.
    #[must_use]
    pub fn quota_snapshot(&self) -> BTreeMap<String, QuotaState> {
        self.lock().quota.clone()
    }

    /// Appends a deferred item (FIFO).
    pub fn push_deferred(&self, item: DeferredItem) {
        let mut state = self.lock();
        debug!(
            work_id = %item.work_id,
            provider = %item.candidate.provider_key,
            ready_at = %item.ready_at,
            "deferred task queued"
        );
        state.deferred.push(item);
    }

    /// Pending items whose `ready_at` has passed, in FIFO order.
    ///
    /// Items are returned by value and stay `pending` in the queue, so a
    /// crash before the replay completes replays them again on restart.
    #[must_use]
    pub fn ready_deferred(&self, now: DateTime<Utc>) -> Vec<DeferredItem> {
        self.lock()
            .deferred
            .iter()
            .filter(|item| item.is_ready(now))
            .cloned()
            .collect()
    }

    /// Drops the pending deferred items of a work (it is being re-deferred
    /// with a fresh ready time).
    pub fn drop_pending_deferred(&self, work_id: &str) {
        let mut state = self.lock();
        state
            .deferred
            .retain(|item| !(item.work_id == work_id && item.status == DeferredStatus::Pending));
    }

    /// Marks the pending deferred items of a work as resolved.
    pub fn resolve_deferred(&self, work_id: &str, status: DeferredStatus, now: DateTime<Utc>) {
        let mut state = self.lock();
        for item in state
            .deferred
            .iter_mut()
            .filter(|item| item.work_id == work_id && item.status == DeferredStatus::Pending)
        {
            item.status = status;
            item.resolved_at = Some(now);
        }
    }

    /// Snapshot of the deferred queue.
    #[must_use]
    pub fn deferred_snapshot(&self) -> Vec<DeferredItem> {
        self.lock().deferred.clone()
    }

    /// Removes terminal items older than seven days; returns how many.
    pub fn compact_deferred(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.lock();
        let before = state.deferred.len();
        state
            .deferred
            .retain(|item| !item.is_prunable(now, DEFERRED_MAX_AGE_DAYS));
        before - state.deferred.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PersistedState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn settings(daily_limit: u64) -> QuotaSettings {
        QuotaSettings {
            enabled: true,
            daily_limit,
            reset_hours: 24,
            wait_for_reset: true,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap()
    }

    fn item(work_id: &str, ready_at: DateTime<Utc>) -> DeferredItem {
        DeferredItem {
            work_id: work_id.into(),
            entry_id: "E1".into(),
            work_dir: PathBuf::from("/tmp/w"),
            candidate: crate::provider::Candidate {
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
            created_at: t0(),
            status: DeferredStatus::Pending,
            resolved_at: None,
        }
    }

    #[test]
    fn test_missing_file_starts_fresh() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::load_or_default(temp.path()).unwrap();
        assert!(store.quota_snapshot().is_empty());
        assert!(store.deferred_snapshot().is_empty());
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::load_or_default(temp.path()).unwrap();
        assert_eq!(
            store.quota_check("annas", &settings(1), t0()),
            QuotaDecision::Allowed
        );
        store.quota_record_use("annas", &settings(1), t0());
        store.push_deferred(item("w1", t0() + Duration::hours(24)));
        store.save().unwrap();

        let reloaded = StateStore::load_or_default(temp.path()).unwrap();
        let quota = reloaded.quota_snapshot();
        assert_eq!(quota.get("annas").unwrap().used_today, 1);
        let deferred = reloaded.deferred_snapshot();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].work_id, "w1");

        // Round trip once more: a second reload sees identical state.
        reloaded.save().unwrap();
        let again = StateStore::load_or_default(temp.path()).unwrap();
        assert_eq!(again.deferred_snapshot(), deferred);
        assert_eq!(again.quota_snapshot(), quota);
    }

    #[test]
    fn test_ready_deferred_is_fifo_and_nondestructive() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::load_or_default(temp.path()).unwrap();
        store.push_deferred(item("w1", t0()));
        store.push_deferred(item("w2", t0()));
        store.push_deferred(item("w3", t0() + Duration::hours(48)));

        let ready = store.ready_deferred(t0() + Duration::hours(1));
        let ids: Vec<_> = ready.iter().map(|i| i.work_id.as_str()).collect();
        assert_eq!(ids, ["w1", "w2"], "FIFO among equal ready times");

        // Items stay pending until explicitly resolved.
        assert_eq!(store.ready_deferred(t0() + Duration::hours(1)).len(), 2);
    }

    #[test]
    fn test_resolve_deferred_marks_terminal() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::load_or_default(temp.path()).unwrap();
        store.push_deferred(item("w1", t0()));
        store.resolve_deferred("w1", DeferredStatus::Completed, t0());

        assert!(store.ready_deferred(t0() + Duration::hours(1)).is_empty());
        let snapshot = store.deferred_snapshot();
        assert_eq!(snapshot[0].status, DeferredStatus::Completed);
        assert!(snapshot[0].resolved_at.is_some());
    }

    #[test]
    fn test_compact_removes_old_terminal_items() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::load_or_default(temp.path()).unwrap();
        store.push_deferred(item("old", t0()));
        store.push_deferred(item("fresh", t0()));
        store.resolve_deferred("old", DeferredStatus::Failed, t0());
        store.resolve_deferred("fresh", DeferredStatus::Failed, t0() + Duration::days(6));

        let removed = store.compact_deferred(t0() + Duration::days(7));
        assert_eq!(removed, 1);
        let remaining: Vec<_> = store
            .deferred_snapshot()
            .into_iter()
            .map(|i| i.work_id)
            .collect();
        assert_eq!(remaining, ["fresh"]);
    }

    #[test]
    fn test_quota_check_creates_state_on_first_use() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::load_or_default(temp.path()).unwrap();
        assert_eq!(
            store.quota_check("new-provider", &settings(0), t0()),
            QuotaDecision::Allowed
        );
        assert!(store.quota_snapshot().contains_key("new-provider"));
    }

    #[test]
    fn test_state_file_version_written() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::load_or_default(temp.path()).unwrap();
        store.save().unwrap();
        let text = std::fs::read_to_string(temp.path().join(STATE_FILE_NAME)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["version"], STATE_VERSION);
    }
}
