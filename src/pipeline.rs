//! Pipeline driver: the per-record lifecycle and the composition root.
//!
//! For each input record the driver applies the resume policy, runs the
//! selector, persists the work journal, and enqueues the download; the
//! scheduler reports terminal outcomes back and the driver finalizes them
//! (write `work.json`, upsert `index.csv`, update the input CSV row). One
//! background ticker replays deferred items whose ready time has passed.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::budget::{BudgetAccountant, BudgetReport};
use crate::config::{Config, ResumeMode};
use crate::input::{InputError, InputFile};
use crate::journal::{JournalError, WorkJournal};
use crate::net::HttpExecutor;
use crate::provider::{ProviderRegistry, build_default_registry};
use crate::scheduler::{DownloadTask, Scheduler, WorkOutcome};
use crate::select::Selector;
use crate::state::{StateError, StateStore};
use crate::work::{Work, WorkStatus};

/// Errors that abort a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Input(#[from] InputError),
}

/// Counts and totals for the end-of-run report.
#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub no_match: usize,
    pub deferred: usize,
    pub skipped: usize,
    pub budget: BudgetReport,
    /// True when a `stop` budget policy drained the run.
    pub budget_stopped: bool,
    /// True when the run was cancelled by signal.
    pub cancelled: bool,
}

impl RunSummary {
    fn count(&mut self, status: WorkStatus) {
        match status {
            WorkStatus::Completed => self.completed += 1,
            WorkStatus::Failed => self.failed += 1,
            WorkStatus::NoMatch => self.no_match += 1,
            WorkStatus::Deferred => self.deferred += 1,
            WorkStatus::Pending => {}
        }
    }
}

/// The composition root: owns every process-scope service and drives a run.
pub struct Pipeline {
    config: Arc<Config>,
    registry: Arc<ProviderRegistry>,
    executor: Arc<HttpExecutor>,
    budget: Arc<BudgetAccountant>,
    state: Arc<StateStore>,
    journal: Arc<WorkJournal>,
    selector: Selector,
    shutdown: CancellationToken,
    dry_run: bool,
    progress: Option<indicatif::ProgressBar>,
}

impl Pipeline {
    /// Builds the service graph for an output root.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] when the output root or state file cannot
    /// be prepared.
    pub fn new(
        config: Arc<Config>,
        output_root: &Path,
        shutdown: CancellationToken,
        dry_run: bool,
    ) -> Result<Self, PipelineError> {
        let budget = Arc::new(BudgetAccountant::from_config(&config));
        let executor = Arc::new(HttpExecutor::new(&config, Arc::clone(&budget)));
        let registry = Arc::new(build_default_registry(&config, Arc::clone(&executor)));
        let journal = Arc::new(WorkJournal::new(output_root, config.naming.clone())?);
        let state = Arc::new(StateStore::load_or_default(output_root)?);
        let selector = Selector::new(Arc::clone(&registry), Arc::clone(&config));
        Ok(Self {
            config,
            registry,
            executor,
            budget,
            state,
            journal,
            selector,
            shutdown,
            dry_run,
            progress: None,
        })
    }

    /// Attaches a progress bar advanced once per finished or skipped work.
    #[must_use]
    pub fn with_progress(mut self, progress: indicatif::ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Runs the whole input file to completion (or drain).
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] on journal, state, or input-file failures;
    /// individual work failures are reflected in the summary instead.
    #[instrument(skip_all, fields(records = input.records.len(), dry_run = self.dry_run))]
    pub async fn run(&self, input: &mut InputFile) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::default();
        let (scheduler, mut outcome_rx) = Scheduler::new(
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            Arc::clone(&self.executor),
            Arc::clone(&self.state),
            Arc::clone(&self.budget),
            &self.shutdown,
        );

        let scheduler_task = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run().await })
        };

        let pending = Arc::new(AtomicUsize::new(0));
        // Work ids already handed back to the scheduler this run.
        let in_flight = Arc::new(Mutex::new(HashSet::new()));
        let ticker_task = self.spawn_deferred_ticker(&scheduler, &pending, &in_flight);

        info!("pipeline starting");

        // Items that became ready between runs are replayed immediately.
        if !self.dry_run {
            replay_ready_deferred(
                &self.state,
                &self.journal,
                &scheduler,
                &pending,
                &in_flight,
            );
        }

        for record in input.records.clone() {
            if self.shutdown.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            if self.budget.stop_requested() {
                summary.budget_stopped = true;
                break;
            }

            if self.should_skip(&record) {
                debug!(entry_id = %record.entry_id, "resume policy skips record");
                summary.skipped += 1;
                self.tick_progress();
                continue;
            }

            let work_dir = self.journal.work_dir_for(&record);
            let mut work = Work::new(record.clone(), work_dir);
            self.budget.begin_work(&work.work_id);

            let outcome = self
                .selector
                .select(&record, &work.work_id, &self.shutdown)
                .await;
            work.candidates = outcome.candidates;

            match outcome.selection {
                None => {
                    work.transition(WorkStatus::NoMatch);
                    self.finalize(input, work, false, &mut summary)?;
                }
                Some(selection) => {
                    work.selected = Some(selection);
                    // Persist the pending work before handing it to the
                    // scheduler; candidates and scores survive any failure.
                    self.journal.write_work(&work)?;
                    if self.dry_run {
                        work.transition(WorkStatus::Completed);
                        self.finalize(input, work, false, &mut summary)?;
                    } else {
                        pending.fetch_add(1, Ordering::SeqCst);
                        scheduler.submit(DownloadTask::new(work));
                    }
                }
            }

            // Opportunistically finalize whatever finished meanwhile.
            while let Ok(outcome) = outcome_rx.try_recv() {
                pending.fetch_sub(1, Ordering::SeqCst);
                self.finalize_outcome(input, outcome, &mut summary)?;
            }
        }

        // Drain: wait for every enqueued work to reach a terminal state.
        while pending.load(Ordering::SeqCst) > 0 {
            tokio::select! {
                maybe = outcome_rx.recv() => {
                    let Some(outcome) = maybe else { break };
                    pending.fetch_sub(1, Ordering::SeqCst);
                    self.finalize_outcome(input, outcome, &mut summary)?;
                }
                () = self.shutdown.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                () = tokio::time::sleep(Duration::from_millis(250)) => {
                    if self.budget.stop_requested() {
                        summary.budget_stopped = true;
                        break;
                    }
                }
            }
        }

        scheduler.stop();
        ticker_task.abort();
        let _ = scheduler_task.await;

        // Cancelled/stopped runs may still have finalizable outcomes queued.
        while let Ok(outcome) = outcome_rx.try_recv() {
            pending.fetch_sub(1, Ordering::SeqCst);
            self.finalize_outcome(input, outcome, &mut summary)?;
        }

        if self.budget.stop_requested() {
            summary.budget_stopped = true;
        }
        self.state.save()?;
        summary.budget = self.budget.report();
        info!(
            completed = summary.completed,
            failed = summary.failed,
            no_match = summary.no_match,
            deferred = summary.deferred,
            skipped = summary.skipped,
            "pipeline finished"
        );
        Ok(summary)
    }

    /// Background ticker replaying deferred items whose time has come.
    fn spawn_deferred_ticker(
        &self,
        scheduler: &Scheduler,
        pending: &Arc<AtomicUsize>,
        in_flight: &Arc<Mutex<HashSet<String>>>,
    ) -> tokio::task::JoinHandle<()> {
        let scheduler = scheduler.clone();
        let pending = Arc::clone(pending);
        let in_flight = Arc::clone(in_flight);
        let state = Arc::clone(&self.state);
        let journal = Arc::clone(&self.journal);
        let shutdown = self.shutdown.clone();
        let poll = Duration::from_secs(self.config.download.deferred_poll_secs.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                replay_ready_deferred(&state, &journal, &scheduler, &pending, &in_flight);
            }
        })
    }

    /// Applies the configured resume policy to one record.
    fn should_skip(&self, record: &crate::work::InputRecord) -> bool {
        let work_dir = self.journal.work_dir_for(record);
        match self.config.download.resume_mode {
            ResumeMode::ReprocessAll => false,
            ResumeMode::SkipCompleted => self
                .journal
                .load_work(&work_dir)
                .ok()
                .flatten()
                .is_some_and(|work| work.status == WorkStatus::Completed),
            ResumeMode::SkipIfHasObjects => WorkJournal::has_objects(&work_dir),
            ResumeMode::ResumeFromCsv => record.retrievable() == Some("True"),
        }
    }

    fn finalize_outcome(
        &self,
        input: &mut InputFile,
        outcome: WorkOutcome,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        self.finalize(input, outcome.work, false, summary)
    }

    /// Persists a terminal work: `work.json`, `index.csv`, input CSV row.
    fn finalize(
        &self,
        input: &mut InputFile,
        work: Work,
        skip_csv: bool,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        self.journal.write_work(&work)?;
        self.journal.upsert_index(&work)?;

        if !skip_csv {
            let link = work
                .selected
                .as_ref()
                .and_then(|s| s.primary.candidate.item_url.as_deref());
            match work.status {
                WorkStatus::Completed => input.set_result(&work.input.entry_id, true, link),
                WorkStatus::Failed | WorkStatus::NoMatch => {
                    input.set_result(&work.input.entry_id, false, link);
                }
                WorkStatus::Deferred | WorkStatus::Pending => {}
            }
            input.rewrite()?;
        }

        summary.count(work.status);
        self.budget.end_work(&work.work_id);
        self.tick_progress();
        Ok(())
    }

    fn tick_progress(&self) {
        if let Some(progress) = &self.progress {
            progress.inc(1);
        }
    }
}

/// Re-enqueues every ready deferred item not already handed out this run.
fn replay_ready_deferred(
    state: &Arc<StateStore>,
    journal: &Arc<WorkJournal>,
    scheduler: &Scheduler,
    pending: &Arc<AtomicUsize>,
    in_flight: &Arc<Mutex<HashSet<String>>>,
) {
    for item in state.ready_deferred(Utc::now()) {
        {
            let mut seen = match in_flight.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !seen.insert(item.work_id.clone()) {
                continue;
            }
        }
        match journal.load_work(&item.work_dir) {
            Ok(Some(work)) => {
                info!(work_id = %item.work_id, "replaying deferred work");
                pending.fetch_add(1, Ordering::SeqCst);
                scheduler.submit(DownloadTask::replay(work, &item));
            }
            Ok(None) => {
                warn!(work_id = %item.work_id, "deferred work directory vanished");
                state.resolve_deferred(
                    &item.work_id,
                    crate::state::DeferredStatus::Failed,
                    Utc::now(),
                );
            }
            Err(error) => {
                warn!(work_id = %item.work_id, error = %error, "cannot load deferred work");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::work::InputRecord;
    use tempfile::TempDir;

    fn pipeline_for(temp: &TempDir, config: Config) -> Pipeline {
        Pipeline::new(
            Arc::new(config),
            temp.path(),
            CancellationToken::new(),
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_should_skip_reprocess_all_never_skips() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.download.resume_mode = ResumeMode::ReprocessAll;
        let pipeline = pipeline_for(&temp, config);
        let record = InputRecord::new("E1", "The Raven");
        assert!(!pipeline.should_skip(&record));
    }

    #[test]
    fn test_should_skip_completed_work() {
        let temp = TempDir::new().unwrap();
        let pipeline = pipeline_for(&temp, Config::default());
        let record = InputRecord::new("E1", "The Raven");
        assert!(!pipeline.should_skip(&record));

        let mut work = Work::new(record.clone(), pipeline.journal.work_dir_for(&record));
        work.transition(WorkStatus::Completed);
        pipeline.journal.write_work(&work).unwrap();
        assert!(pipeline.should_skip(&record));
    }

    #[test]
    fn test_should_skip_if_has_objects() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.download.resume_mode = ResumeMode::SkipIfHasObjects;
        let pipeline = pipeline_for(&temp, config);
        let record = InputRecord::new("E1", "The Raven");
        assert!(!pipeline.should_skip(&record));

        let objects = pipeline.journal.work_dir_for(&record).join("objects");
        std::fs::create_dir_all(&objects).unwrap();
        std::fs::write(objects.join("a.pdf"), b"x").unwrap();
        assert!(pipeline.should_skip(&record));
    }

    #[test]
    fn test_should_skip_resume_from_csv() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.download.resume_mode = ResumeMode::ResumeFromCsv;
        let pipeline = pipeline_for(&temp, config);

        let mut record = InputRecord::new("E1", "The Raven");
        assert!(!pipeline.should_skip(&record));
        record
            .fields
            .insert("retrievable".to_string(), "True".to_string());
        assert!(pipeline.should_skip(&record));
        record
            .fields
            .insert("retrievable".to_string(), "False".to_string());
        assert!(!pipeline.should_skip(&record));
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = RunSummary::default();
        summary.count(WorkStatus::Completed);
        summary.count(WorkStatus::Completed);
        summary.count(WorkStatus::Failed);
        summary.count(WorkStatus::NoMatch);
        summary.count(WorkStatus::Deferred);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.no_match, 1);
        assert_eq!(summary.deferred, 1);
    }
}
