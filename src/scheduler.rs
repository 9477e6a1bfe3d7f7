//! Concurrent download scheduler.
//!
//! A bounded worker pool (`max_parallel_downloads` global permits) executes
//! [`DownloadTask`]s FIFO. Admission to a provider is additionally gated by a
//! per-provider semaphore; the global slot is held while waiting on it, so
//! operators should keep `max_parallel_downloads` at or above the sum of
//! per-provider caps or accept head-of-line blocking.
//!
//! Each task runs one candidate under the worker deadline. Failures walk the
//! selection's fallback list by re-enqueueing the next candidate; quota
//! exhaustion defers the work when the provider is configured to wait.
//! Terminal outcomes are reported to the pipeline driver, which owns journal
//! finalization.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::budget::BudgetAccountant;
use crate::config::{Config, OnExceed};
use crate::net::{FetchError, HttpExecutor};
use crate::provider::{DownloadContext, ProviderRegistry};
use crate::state::{DeferReason, DeferredItem, DeferredStatus, QuotaDecision, StateStore};
use crate::work::{Work, WorkStatus};

/// One unit of scheduler work: try one candidate of one work.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub work: Work,
    /// Index into the work's attempt order (primary, then fallbacks).
    pub candidate_index: usize,
    /// How many candidates were tried before this one.
    pub attempt_index: u32,
    /// Set when this task replays a deferred item.
    pub from_deferred: bool,
    /// True while every previous failure was `circuit-open`.
    only_circuit_open: bool,
}

impl DownloadTask {
    /// A fresh task starting at the work's primary candidate.
    #[must_use]
    pub fn new(work: Work) -> Self {
        Self {
            work,
            candidate_index: 0,
            attempt_index: 0,
            from_deferred: false,
            only_circuit_open: true,
        }
    }

    /// A replay task for a deferred item, starting at the deferred candidate.
    #[must_use]
    pub fn replay(work: Work, item: &DeferredItem) -> Self {
        let index = work
            .attempt_order()
            .iter()
            .position(|c| {
                c.candidate.provider_key == item.candidate.provider_key
                    && c.candidate.source_id == item.candidate.source_id
            })
            .unwrap_or(0);
        Self {
            work,
            candidate_index: index,
            attempt_index: item.attempt_index,
            from_deferred: true,
            only_circuit_open: true,
        }
    }
}

/// A work that reached a terminal state inside the scheduler.
#[derive(Debug)]
pub struct WorkOutcome {
    pub work: Work,
    pub from_deferred: bool,
}

struct SchedulerCore {
    config: Arc<Config>,
    registry: Arc<ProviderRegistry>,
    /// Shared executor; consulted for breaker feedback on worker deadlines.
    executor: Arc<HttpExecutor>,
    state: Arc<StateStore>,
    budget: Arc<BudgetAccountant>,
    pool: Arc<Semaphore>,
    provider_slots: DashMap<String, Arc<Semaphore>>,
    task_tx: mpsc::UnboundedSender<DownloadTask>,
    outcome_tx: mpsc::UnboundedSender<WorkOutcome>,
    /// Drain signal: child of the process shutdown token.
    cancel: CancellationToken,
}

impl SchedulerCore {
    fn provider_slot(&self, provider_key: &str) -> Arc<Semaphore> {
        self.provider_slots
            .entry(provider_key.to_string())
            .or_insert_with(|| {
                Arc::new(Semaphore::new(self.config.download.concurrency_for(provider_key)))
            })
            .clone()
    }
}

/// Handle to the running scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    task_rx: Arc<tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<DownloadTask>>>>,
}

impl Scheduler {
    /// Creates the scheduler and the channel terminal outcomes arrive on.
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        registry: Arc<ProviderRegistry>,
        executor: Arc<HttpExecutor>,
        state: Arc<StateStore>,
        budget: Arc<BudgetAccountant>,
        shutdown: &CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<WorkOutcome>) {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Semaphore::new(config.download.max_parallel_downloads));
        let core = Arc::new(SchedulerCore {
            config,
            registry,
            executor,
            state,
            budget,
            pool,
            provider_slots: DashMap::new(),
            task_tx,
            outcome_tx,
            cancel: shutdown.child_token(),
        });
        (
            Self {
                core,
                task_rx: Arc::new(tokio::sync::Mutex::new(Some(task_rx))),
            },
            outcome_rx,
        )
    }

    /// Enqueues a task. Silently dropped once draining started.
    pub fn submit(&self, task: DownloadTask) {
        if self.core.cancel.is_cancelled() {
            debug!(work_id = %task.work.work_id, "scheduler draining, task dropped");
            return;
        }
        let _ = self.core.task_tx.send(task);
    }

    /// Stops intake and lets in-flight tasks wind down.
    pub fn stop(&self) {
        self.core.cancel.cancel();
    }

    /// Dispatch loop: assigns queued tasks to pool slots until stopped.
    ///
    /// Returns after every in-flight task finished (cancelled tasks clean up
    /// their partial files before returning).
    pub async fn run(&self) {
        let Some(mut rx) = self.task_rx.lock().await.take() else {
            return;
        };
        let mut workers = JoinSet::new();

        loop {
            tokio::select! {
                () = self.core.cancel.cancelled() => break,
                maybe = rx.recv() => {
                    let Some(task) = maybe else { break };
                    let permit = tokio::select! {
                        () = self.core.cancel.cancelled() => break,
                        permit = Arc::clone(&self.core.pool).acquire_owned() => permit,
                    };
                    let Ok(permit) = permit else { break };
                    let core = Arc::clone(&self.core);
                    workers.spawn(async move {
                        let _permit = permit;
                        run_task(core, task).await;
                    });
                }
            }
        }

        debug!(in_flight = workers.len(), "scheduler draining");
        while workers.join_next().await.is_some() {}
        info!("scheduler stopped");
    }
}

/// Executes one candidate attempt of one work.
#[instrument(skip_all, fields(work_id = %task.work.work_id, entry_id = %task.work.input.entry_id, candidate = task.candidate_index))]
async fn run_task(core: Arc<SchedulerCore>, mut task: DownloadTask) {
    let order = task.work.attempt_order();
    let Some(scored) = order.get(task.candidate_index) else {
        fail_work(&core, task, "no-candidates");
        return;
    };
    let candidate = scored.candidate.clone();
    let provider_key = candidate.provider_key.clone();

    // Budget stop: do not start new downloads, fail the work out.
    if core.budget.stop_requested() {
        task.work
            .record_event(format!("{provider_key}:failed:budget-exceeded"));
        fail_work(&core, task, "budget-exceeded");
        return;
    }

    // Quota gate.
    let quota_settings = core.config.quota(&provider_key).clone();
    match core.state.quota_check(&provider_key, &quota_settings, Utc::now()) {
        QuotaDecision::Allowed => {}
        QuotaDecision::Exhausted { ready_at, wait } => {
            if wait {
                defer_work(&core, task, &provider_key, ready_at);
            } else {
                task.work
                    .record_event(format!("{provider_key}:failed:quota-exhausted"));
                task.only_circuit_open = false;
                next_candidate_or_fail(&core, task, "quota-exhausted");
            }
            return;
        }
    }

    let Some(adapter) = core.registry.get(&provider_key) else {
        task.work
            .record_event(format!("{provider_key}:failed:client-error"));
        task.only_circuit_open = false;
        next_candidate_or_fail(&core, task, "unknown-provider");
        return;
    };

    // Per-provider admission; the pool slot stays held while waiting.
    let slot = core.provider_slot(&provider_key);
    let slot_permit = tokio::select! {
        () = core.cancel.cancelled() => return,
        permit = slot.acquire_owned() => permit,
    };
    let Ok(_slot_permit) = slot_permit else { return };

    let work_id = task.work.work_id.clone();
    let entry_id = task.work.input.entry_id.clone();
    let work_dir = task.work.work_dir.clone();
    let namer =
        crate::journal::ArtifactNamer::for_record(&work_dir, &task.work.input, &core.config.naming);
    let task_cancel = core.cancel.child_token();
    let deadline = Duration::from_secs(core.config.download.worker_timeout_s);

    let result = {
        let ctx = DownloadContext {
            work_id: &work_id,
            entry_id: &entry_id,
            work_dir: &work_dir,
            namer: &namer,
            options: &core.config.download,
            cancel: &task_cancel,
        };
        let download = adapter.download(&candidate, &ctx);
        tokio::pin!(download);
        tokio::select! {
            result = &mut download => result,
            () = tokio::time::sleep(deadline) => {
                warn!(provider = %provider_key, "worker deadline hit, cancelling download");
                task_cancel.cancel();
                // Wait for the adapter to observe cancellation and clean up
                // partial files before reporting the timeout.
                let _ = (&mut download).await;
                // The cancelled request never reached the executor's breaker
                // feedback; a provider that hangs past the deadline must
                // still accumulate trips.
                core.executor.breaker_for(&provider_key).record_trip();
                Err(FetchError::timeout(format!("{provider_key}:{}", candidate.source_id)))
            }
        }
    };

    match result {
        Ok(outcome) if outcome.wrote_anything() => {
            if quota_settings.enabled {
                core.state
                    .quota_record_use(&provider_key, &quota_settings, Utc::now());
            }
            info!(
                provider = %provider_key,
                files = outcome.files_written.len(),
                bytes = outcome.bytes_written,
                "candidate download completed"
            );
            task.work.record_event(format!("{provider_key}:completed"));
            complete_work(&core, task);
        }
        Ok(outcome) => {
            let reason = outcome
                .skipped_reason
                .unwrap_or_else(|| "no-files-written".to_string());
            task.work
                .record_event(format!("{provider_key}:failed:{reason}"));
            task.only_circuit_open = false;
            next_candidate_or_fail(&core, task, &reason);
        }
        Err(error) => {
            if core.cancel.is_cancelled() {
                // Shutdown, not a candidate verdict; the work stays pending.
                debug!(provider = %provider_key, "task cancelled during drain");
                return;
            }
            let kind = error.kind();
            warn!(provider = %provider_key, error = %error, kind, "candidate download failed");
            task.work.record_event(format!("{provider_key}:failed:{kind}"));
            if kind != "circuit-open" {
                task.only_circuit_open = false;
            }

            if matches!(error, FetchError::BudgetExceeded { .. })
                && core.budget.policy() == OnExceed::Stop
            {
                fail_work(&core, task, "budget-exceeded");
                return;
            }
            next_candidate_or_fail(&core, task, kind);
        }
    }
}

/// Moves the work to the deferred queue and reports the `deferred` status.
fn defer_work(
    core: &Arc<SchedulerCore>,
    mut task: DownloadTask,
    provider_key: &str,
    ready_at: chrono::DateTime<Utc>,
) {
    let order = task.work.attempt_order();
    let Some(scored) = order.get(task.candidate_index) else {
        fail_work(core, task, "no-candidates");
        return;
    };
    let candidate = scored.candidate.clone();
    info!(
        provider = %provider_key,
        ready_at = %ready_at,
        "quota exhausted, deferring work"
    );
    if task.from_deferred {
        // Replace the replayed item rather than stacking a duplicate.
        core.state.drop_pending_deferred(&task.work.work_id);
    }
    core.state.push_deferred(DeferredItem {
        work_id: task.work.work_id.clone(),
        entry_id: task.work.input.entry_id.clone(),
        work_dir: task.work.work_dir.clone(),
        candidate,
        reason: DeferReason::Quota,
        ready_at,
        attempt_index: task.attempt_index,
        created_at: Utc::now(),
        status: DeferredStatus::Pending,
        resolved_at: None,
    });
    if let Err(error) = core.state.save() {
        warn!(error = %error, "failed to persist state after deferral");
    }

    task.work
        .record_event(format!("{provider_key}:deferred:quota-exhausted"));
    if task.work.status != WorkStatus::Deferred {
        task.work.transition(WorkStatus::Deferred);
    }
    let from_deferred = task.from_deferred;
    let _ = core.outcome_tx.send(WorkOutcome {
        work: task.work,
        from_deferred,
    });
}

/// Advances to the next fallback candidate, or fails the work.
fn next_candidate_or_fail(core: &Arc<SchedulerCore>, task: DownloadTask, last_kind: &str) {
    let next = task.candidate_index + 1;
    let have_next = next < task.work.attempt_order().len();
    if have_next && !core.cancel.is_cancelled() && !core.budget.stop_requested() {
        debug!(next_candidate = next, "invoking fallback candidate");
        let _ = core.task_tx.send(DownloadTask {
            candidate_index: next,
            attempt_index: task.attempt_index + 1,
            ..task
        });
        return;
    }
    // Every candidate bounced off an open breaker: nothing was reachable.
    let reason = if task.only_circuit_open {
        "all-providers-unavailable"
    } else {
        last_kind
    };
    fail_work(core, task, reason);
}

fn complete_work(core: &Arc<SchedulerCore>, mut task: DownloadTask) {
    if task.from_deferred {
        core.state
            .resolve_deferred(&task.work.work_id, DeferredStatus::Completed, Utc::now());
    }
    task.work.transition(WorkStatus::Completed);
    let from_deferred = task.from_deferred;
    let _ = core.outcome_tx.send(WorkOutcome {
        work: task.work,
        from_deferred,
    });
}

fn fail_work(core: &Arc<SchedulerCore>, mut task: DownloadTask, reason: &str) {
    if task.from_deferred {
        core.state
            .resolve_deferred(&task.work.work_id, DeferredStatus::Failed, Utc::now());
    }
    task.work.record_event(format!("work:failed:{reason}"));
    task.work.transition(WorkStatus::Failed);
    let from_deferred = task.from_deferred;
    let _ = core.outcome_tx.send(WorkOutcome {
        work: task.work,
        from_deferred,
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::provider::Candidate;
    use crate::select::{ScoredCandidate, Scores, Selection};
    use crate::work::InputRecord;
    use std::path::PathBuf;

    fn scored(provider: &str, source_id: &str) -> ScoredCandidate {
        ScoredCandidate {
            candidate: Candidate {
                provider_key: provider.into(),
                provider_display_name: provider.into(),
                title: "The Raven".into(),
                creators: vec![],
                date: None,
                source_id: source_id.into(),
                item_url: None,
                iiif_manifest_url: None,
                download_hint: serde_json::Value::Null,
                raw_metadata: serde_json::Value::Null,
            },
            scores: Scores {
                title_score: 95.0,
                creator_score: 100.0,
                quality_bonus: 0.0,
                total: 96.5,
            },
        }
    }

    fn work_with_selection() -> Work {
        let mut work = Work::new(InputRecord::new("E1", "The Raven"), PathBuf::from("/tmp/w"));
        work.selected = Some(Selection {
            primary: scored("ia", "a"),
            fallbacks: vec![scored("wellcome", "b")],
            rejected: vec![],
        });
        work
    }

    #[test]
    fn test_task_new_starts_at_primary() {
        let task = DownloadTask::new(work_with_selection());
        assert_eq!(task.candidate_index, 0);
        assert_eq!(task.attempt_index, 0);
        assert!(!task.from_deferred);
    }

    #[test]
    fn test_replay_task_finds_deferred_candidate() {
        let work = work_with_selection();
        let item = DeferredItem {
            work_id: work.work_id.clone(),
            entry_id: "E1".into(),
            work_dir: work.work_dir.clone(),
            candidate: scored("wellcome", "b").candidate,
            reason: DeferReason::Quota,
            ready_at: Utc::now(),
            attempt_index: 1,
            created_at: Utc::now(),
            status: DeferredStatus::Pending,
            resolved_at: None,
        };
        let task = DownloadTask::replay(work, &item);
        assert_eq!(task.candidate_index, 1, "replay resumes at the deferred candidate");
        assert_eq!(task.attempt_index, 1);
        assert!(task.from_deferred);
    }

    #[test]
    fn test_replay_task_unknown_candidate_falls_back_to_primary() {
        let work = work_with_selection();
        let item = DeferredItem {
            work_id: work.work_id.clone(),
            entry_id: "E1".into(),
            work_dir: work.work_dir.clone(),
            candidate: scored("gone", "zzz").candidate,
            reason: DeferReason::Quota,
            ready_at: Utc::now(),
            attempt_index: 0,
            created_at: Utc::now(),
            status: DeferredStatus::Pending,
            resolved_at: None,
        };
        let task = DownloadTask::replay(work, &item);
        assert_eq!(task.candidate_index, 0);
    }
}
