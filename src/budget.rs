//! Storage budget accounting by content class and scope.
//!
//! The [`BudgetAccountant`] tracks bytes and file counts per content class
//! (`pdf`, `image`, `metadata`) at two scopes: the whole process (`total`)
//! and the current work (`per_work`). Downloads reserve before opening a
//! stream, check their cumulative size after every chunk, and commit actuals
//! on completion, so the committed counters account each on-disk artifact
//! exactly once.
//!
//! When a limit is hit the artifact fails with `BudgetExceeded`; with the
//! `stop` policy a process-wide stop flag is additionally raised for the
//! scheduler to drain on.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{Config, OnExceed, gb_to_bytes, mb_to_bytes};
use crate::net::FetchError;

/// Content classification of a downloaded artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentClass {
    /// Bundled documents: PDF and EPUB renderings.
    Pdf,
    /// Page images.
    Image,
    /// JSON/XML manifests and search payloads.
    Metadata,
}

impl ContentClass {
    /// Derives the class from a file extension (without dot, any case).
    #[must_use]
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" | "epub" => Self::Pdf,
            "jpg" | "jpeg" | "png" | "gif" | "tif" | "tiff" | "jp2" | "webp" | "bmp" => Self::Image,
            _ => Self::Metadata,
        }
    }
}

impl fmt::Display for ContentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pdf => "pdf",
            Self::Image => "image",
            Self::Metadata => "metadata",
        };
        f.write_str(name)
    }
}

/// Byte limits per class for one scope. 0 means unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeLimits {
    pub pdf_bytes: u64,
    pub image_bytes: u64,
    pub metadata_bytes: u64,
}

impl ScopeLimits {
    fn limit_for(&self, class: ContentClass) -> u64 {
        match class {
            ContentClass::Pdf => self.pdf_bytes,
            ContentClass::Image => self.image_bytes,
            ContentClass::Metadata => self.metadata_bytes,
        }
    }
}

/// Files/bytes committed for one (scope, class) cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counter {
    pub files: u64,
    pub bytes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    pdf: Counter,
    image: Counter,
    metadata: Counter,
}

impl Counters {
    fn cell(&self, class: ContentClass) -> Counter {
        match class {
            ContentClass::Pdf => self.pdf,
            ContentClass::Image => self.image,
            ContentClass::Metadata => self.metadata,
        }
    }

    fn cell_mut(&mut self, class: ContentClass) -> &mut Counter {
        match class {
            ContentClass::Pdf => &mut self.pdf,
            ContentClass::Image => &mut self.image,
            ContentClass::Metadata => &mut self.metadata,
        }
    }
}

/// Snapshot of total-scope counters for the run summary.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BudgetReport {
    pub pdf: Counter,
    pub image: Counter,
    pub metadata: Counter,
}

/// Tracks storage consumption and grants or denies pre-flight reservations.
///
/// Internally synchronized; shared as `Arc<BudgetAccountant>` between the
/// executor, scheduler, and pipeline driver.
#[derive(Debug)]
pub struct BudgetAccountant {
    total_limits: ScopeLimits,
    per_work_limits: ScopeLimits,
    policy: OnExceed,
    state: Mutex<BudgetState>,
    stop_flag: AtomicBool,
}

#[derive(Debug, Default)]
struct BudgetState {
    total: Counters,
    per_work: HashMap<String, Counters>,
}

impl BudgetAccountant {
    /// Builds the accountant from validated configuration, normalizing
    /// GB/MB limits to bytes.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let limits = &config.download_limits;
        Self::new(
            ScopeLimits {
                pdf_bytes: gb_to_bytes(limits.total.pdfs_gb),
                image_bytes: gb_to_bytes(limits.total.images_gb),
                metadata_bytes: gb_to_bytes(limits.total.metadata_gb),
            },
            ScopeLimits {
                pdf_bytes: mb_to_bytes(limits.per_work.pdfs_mb),
                image_bytes: mb_to_bytes(limits.per_work.images_mb),
                metadata_bytes: mb_to_bytes(limits.per_work.metadata_mb),
            },
            limits.on_exceed.unwrap_or(OnExceed::Skip),
        )
    }

    /// Creates an accountant with explicit byte limits.
    #[must_use]
    pub fn new(total_limits: ScopeLimits, per_work_limits: ScopeLimits, policy: OnExceed) -> Self {
        Self {
            total_limits,
            per_work_limits,
            policy,
            state: Mutex::new(BudgetState::default()),
            stop_flag: AtomicBool::new(false),
        }
    }

    /// An accountant with no limits (tests, dry-run).
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(ScopeLimits::default(), ScopeLimits::default(), OnExceed::Skip)
    }

    /// Resets the per-work counters for a work that is (re)starting.
    pub fn begin_work(&self, work_id: &str) {
        let mut state = self.lock();
        state.per_work.insert(work_id.to_string(), Counters::default());
    }

    /// Drops the per-work counters once a work reached a terminal state.
    pub fn end_work(&self, work_id: &str) {
        let mut state = self.lock();
        state.per_work.remove(work_id);
    }

    /// Pre-flight check before opening a download stream.
    ///
    /// `estimated_bytes = 0` means the size is unknown (streaming); the
    /// reservation is granted and enforcement happens per chunk.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::BudgetExceeded`] when any applicable limit
    /// cannot admit `estimated_bytes` more.
    pub fn reserve(
        &self,
        work_id: &str,
        class: ContentClass,
        estimated_bytes: u64,
    ) -> Result<(), FetchError> {
        let state = self.lock();
        self.check(&state, work_id, class, estimated_bytes)
    }

    /// Streaming check: would `cumulative_bytes` for the in-flight file
    /// violate any applicable limit on top of already-committed counters?
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::BudgetExceeded`] on the first violation; the
    /// caller must delete the in-flight file.
    pub fn charge_stream(
        &self,
        work_id: &str,
        class: ContentClass,
        cumulative_bytes: u64,
    ) -> Result<(), FetchError> {
        let state = self.lock();
        self.check(&state, work_id, class, cumulative_bytes)
    }

    /// Commits the actual size of a completed artifact.
    pub fn account(&self, work_id: &str, class: ContentClass, actual_bytes: u64) {
        let mut state = self.lock();
        let total = state.total.cell_mut(class);
        total.files += 1;
        total.bytes += actual_bytes;
        let work = state.per_work.entry(work_id.to_string()).or_default();
        let cell = work.cell_mut(class);
        cell.files += 1;
        cell.bytes += actual_bytes;
        debug!(work_id, %class, bytes = actual_bytes, "accounted artifact");
    }

    /// True once a `stop`-policy violation happened; the scheduler drains.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    /// The configured exceed policy.
    #[must_use]
    pub fn policy(&self) -> OnExceed {
        self.policy
    }

    /// Snapshot of the total-scope counters.
    #[must_use]
    pub fn report(&self) -> BudgetReport {
        let state = self.lock();
        BudgetReport {
            pdf: state.total.cell(ContentClass::Pdf),
            image: state.total.cell(ContentClass::Image),
            metadata: state.total.cell(ContentClass::Metadata),
        }
    }

    fn check(
        &self,
        state: &BudgetState,
        work_id: &str,
        class: ContentClass,
        additional: u64,
    ) -> Result<(), FetchError> {
        let total_limit = self.total_limits.limit_for(class);
        if total_limit > 0 {
            let used = state.total.cell(class).bytes;
            if used.saturating_add(additional) > total_limit {
                return Err(self.exceeded(class, "total", used, additional, total_limit));
            }
        }
        let work_limit = self.per_work_limits.limit_for(class);
        if work_limit > 0 {
            let used = state
                .per_work
                .get(work_id)
                .map_or(0, |c| c.cell(class).bytes);
            if used.saturating_add(additional) > work_limit {
                return Err(self.exceeded(class, "per-work", used, additional, work_limit));
            }
        }
        Ok(())
    }

    fn exceeded(
        &self,
        class: ContentClass,
        scope: &str,
        used: u64,
        additional: u64,
        limit: u64,
    ) -> FetchError {
        if self.policy == OnExceed::Stop && !self.stop_flag.swap(true, Ordering::SeqCst) {
            warn!(%class, scope, "storage budget exceeded with stop policy; draining");
        }
        FetchError::BudgetExceeded {
            class,
            detail: format!("{scope} limit {limit} bytes, {used} used, {additional} requested"),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BudgetState> {
        match self.state.lock() {
            Ok(guard) => guard,
            // A poisoned counter map is still internally consistent enough
            // to read; byte counts are plain integers.
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn mb(n: u64) -> u64 {
        n * 1024 * 1024
    }

    fn accountant_with_total_pdf(limit: u64) -> BudgetAccountant {
        BudgetAccountant::new(
            ScopeLimits {
                pdf_bytes: limit,
                ..ScopeLimits::default()
            },
            ScopeLimits::default(),
            OnExceed::Skip,
        )
    }

    #[test]
    fn test_content_class_from_extension() {
        assert_eq!(ContentClass::from_extension("pdf"), ContentClass::Pdf);
        assert_eq!(ContentClass::from_extension("EPUB"), ContentClass::Pdf);
        assert_eq!(ContentClass::from_extension("jpg"), ContentClass::Image);
        assert_eq!(ContentClass::from_extension("tiff"), ContentClass::Image);
        assert_eq!(ContentClass::from_extension("json"), ContentClass::Metadata);
        assert_eq!(ContentClass::from_extension("xml"), ContentClass::Metadata);
    }

    #[test]
    fn test_zero_limit_means_unlimited() {
        let budget = BudgetAccountant::unlimited();
        assert!(budget.reserve("w1", ContentClass::Pdf, u64::MAX / 2).is_ok());
        budget.account("w1", ContentClass::Pdf, mb(500));
        assert!(budget.charge_stream("w1", ContentClass::Pdf, mb(500)).is_ok());
    }

    #[test]
    fn test_reserve_denied_when_total_would_overflow() {
        let budget = accountant_with_total_pdf(mb(1));
        budget.account("w1", ContentClass::Pdf, mb(1) - 10);
        let err = budget.reserve("w2", ContentClass::Pdf, 100).unwrap_err();
        assert_eq!(err.kind(), "budget-exceeded");
    }

    #[test]
    fn test_streaming_check_does_not_commit() {
        let budget = accountant_with_total_pdf(mb(1));
        // Stream far below the limit; nothing committed yet.
        assert!(budget.charge_stream("w1", ContentClass::Pdf, mb(1) / 2).is_ok());
        assert_eq!(budget.report().pdf.bytes, 0);
        assert_eq!(budget.report().pdf.files, 0);

        // Crossing the limit mid-stream fails without committing.
        let err = budget.charge_stream("w1", ContentClass::Pdf, mb(1) + 1).unwrap_err();
        assert_eq!(err.kind(), "budget-exceeded");
        assert_eq!(budget.report().pdf.bytes, 0);
    }

    #[test]
    fn test_account_commits_files_and_bytes_exactly_once() {
        let budget = BudgetAccountant::unlimited();
        budget.account("w1", ContentClass::Pdf, 100);
        budget.account("w1", ContentClass::Image, 50);
        budget.account("w2", ContentClass::Pdf, 200);

        let report = budget.report();
        assert_eq!(report.pdf, Counter { files: 2, bytes: 300 });
        assert_eq!(report.image, Counter { files: 1, bytes: 50 });
        assert_eq!(report.metadata, Counter::default());
    }

    #[test]
    fn test_per_work_limit_independent_between_works() {
        let budget = BudgetAccountant::new(
            ScopeLimits::default(),
            ScopeLimits {
                pdf_bytes: 100,
                ..ScopeLimits::default()
            },
            OnExceed::Skip,
        );
        budget.begin_work("w1");
        budget.begin_work("w2");
        budget.account("w1", ContentClass::Pdf, 90);

        assert!(budget.reserve("w1", ContentClass::Pdf, 20).is_err());
        assert!(budget.reserve("w2", ContentClass::Pdf, 20).is_ok());
    }

    #[test]
    fn test_begin_work_resets_per_work_counters() {
        let budget = BudgetAccountant::new(
            ScopeLimits::default(),
            ScopeLimits {
                pdf_bytes: 100,
                ..ScopeLimits::default()
            },
            OnExceed::Skip,
        );
        budget.begin_work("w1");
        budget.account("w1", ContentClass::Pdf, 90);
        assert!(budget.reserve("w1", ContentClass::Pdf, 20).is_err());

        budget.begin_work("w1");
        assert!(budget.reserve("w1", ContentClass::Pdf, 20).is_ok());
    }

    #[test]
    fn test_stop_policy_raises_flag() {
        let budget = BudgetAccountant::new(
            ScopeLimits {
                pdf_bytes: 10,
                ..ScopeLimits::default()
            },
            ScopeLimits::default(),
            OnExceed::Stop,
        );
        assert!(!budget.stop_requested());
        let _ = budget.reserve("w1", ContentClass::Pdf, 100);
        assert!(budget.stop_requested());
    }

    #[test]
    fn test_skip_policy_does_not_raise_flag() {
        let budget = accountant_with_total_pdf(10);
        let _ = budget.reserve("w1", ContentClass::Pdf, 100);
        assert!(!budget.stop_requested());
    }

    #[test]
    fn test_from_config_normalizes_units() {
        let text = r#"
            [download_limits]
            on_exceed = "stop"

            [download_limits.total]
            pdfs_gb = 0.001
        "#;
        let config: crate::config::Config = toml::from_str(text).unwrap();
        let budget = BudgetAccountant::from_config(&config);
        assert_eq!(budget.policy(), OnExceed::Stop);
        // ~1 MB: 1 MB + 1 byte must be denied.
        assert!(budget.reserve("w", ContentClass::Pdf, 1_073_742).is_err());
        assert!(budget.reserve("w", ContentClass::Pdf, 1_000_000).is_ok());
    }
}
