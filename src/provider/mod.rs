//! Provider adapters: search and download against digital-library services.
//!
//! Each provider implements [`ProviderAdapter`]: `search` turns a query into
//! [`Candidate`]s, `download` writes a candidate's artifacts into a work
//! directory. All HTTP goes through the shared [`HttpExecutor`], so pacing,
//! circuit breaking, retries, and budgets apply uniformly; adapters hold no
//! cross-call state of their own.
//!
//! # Object Safety
//!
//! The trait uses `async_trait` to support dynamic dispatch via
//! `Arc<dyn ProviderAdapter>`. Rust 2024 native async traits are not
//! object-safe, so `async_trait` is required for the registry pattern.

mod ia;
mod iiif;
mod wellcome;

pub use ia::InternetArchiveAdapter;
pub use iiif::{IiifManifest, ManifestRendering, PageImage};
pub use wellcome::WellcomeAdapter;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, DownloadSettings};
use crate::journal::ArtifactNamer;
use crate::net::{FetchError, HttpExecutor};
use crate::work::InputRecord;

/// Static description of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderInfo {
    /// Short stable key, e.g. `ia`.
    pub key: &'static str,
    /// Human-readable name for summaries and `index.csv`.
    pub display_name: &'static str,
}

/// A search query derived from one input record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub title: String,
    pub creator: Option<String>,
    pub year: Option<String>,
}

impl SearchQuery {
    /// Builds the query from an input record.
    #[must_use]
    pub fn from_record(record: &InputRecord) -> Self {
        Self {
            title: record.title.clone(),
            creator: record.creator.clone(),
            year: record.year.clone(),
        }
    }
}

/// An item a provider claims satisfies a query.
///
/// `source_id` uniquely identifies the item within `provider_key`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub provider_key: String,
    pub provider_display_name: String,
    pub title: String,
    #[serde(default)]
    pub creators: Vec<String>,
    #[serde(default)]
    pub date: Option<String>,
    pub source_id: String,
    #[serde(default)]
    pub item_url: Option<String>,
    #[serde(default)]
    pub iiif_manifest_url: Option<String>,
    /// Opaque provider-specific download hint (e.g. a direct PDF URL).
    #[serde(default)]
    pub download_hint: serde_json::Value,
    /// The raw provider record the candidate was built from.
    #[serde(default)]
    pub raw_metadata: serde_json::Value,
}

/// Result of a provider download.
#[derive(Debug, Clone, Default)]
pub struct DownloadOutcome {
    pub files_written: Vec<PathBuf>,
    pub bytes_written: u64,
    /// Set when nothing was downloaded for a benign reason.
    pub skipped_reason: Option<String>,
}

impl DownloadOutcome {
    /// True when at least one artifact landed on disk.
    #[must_use]
    pub fn wrote_anything(&self) -> bool {
        !self.files_written.is_empty()
    }

    fn add(&mut self, path: PathBuf, bytes: u64) {
        self.files_written.push(path);
        self.bytes_written += bytes;
    }
}

/// Task-scoped context handed to `download`, carrying everything the adapter
/// needs without thread-local state.
#[derive(Debug)]
pub struct DownloadContext<'a> {
    pub work_id: &'a str,
    pub entry_id: &'a str,
    pub work_dir: &'a Path,
    pub namer: &'a ArtifactNamer,
    pub options: &'a DownloadSettings,
    pub cancel: &'a CancellationToken,
}

/// Capability set every provider exposes.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// The provider's key and display name.
    fn info(&self) -> ProviderInfo;

    /// Searches the provider; returns at most `max_results` candidates.
    ///
    /// Side-effect-free beyond HTTP calls routed through the executor.
    async fn search(
        &self,
        query: &SearchQuery,
        max_results: usize,
        work_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candidate>, FetchError>;

    /// Downloads a candidate's artifacts into the work directory.
    async fn download(
        &self,
        candidate: &Candidate,
        ctx: &DownloadContext<'_>,
    ) -> Result<DownloadOutcome, FetchError>;
}

/// Registry resolving `provider_key` to an adapter.
#[derive(Default)]
pub struct ProviderRegistry {
    adapters: BTreeMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under its own key. Later registrations win.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.info().key.to_string(), adapter);
    }

    /// Resolves an adapter by provider key.
    #[must_use]
    pub fn get(&self, provider_key: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider_key).cloned()
    }

    /// Registered provider keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.keys())
            .finish()
    }
}

/// Builds the default registry with every built-in adapter, honoring
/// per-provider endpoint overrides from the configuration.
#[must_use]
pub fn build_default_registry(config: &Config, executor: Arc<HttpExecutor>) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(InternetArchiveAdapter::new(
        Arc::clone(&executor),
        config.endpoint("ia"),
    )));
    registry.register(Arc::new(WellcomeAdapter::new(
        executor,
        config.endpoint("wellcome"),
    )));
    registry
}

/// Writes a metadata JSON document (raw candidate record or manifest) into
/// the work's `metadata/` directory, charging the `metadata` budget.
///
/// Returns `Ok(None)` when the file already exists and overwriting is off.
///
/// # Errors
///
/// Returns [`FetchError`] on budget or filesystem failures.
pub(crate) fn write_metadata_file(
    budget: &Arc<crate::budget::BudgetAccountant>,
    ctx: &DownloadContext<'_>,
    provider_key: &str,
    value: &serde_json::Value,
) -> Result<Option<PathBuf>, FetchError> {
    let path = ctx.namer.metadata_path(provider_key);
    if path.exists() && !ctx.options.overwrite_existing {
        return Ok(None);
    }
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| FetchError::protocol(provider_key, e.to_string()))?;
    budget.reserve(ctx.work_id, crate::budget::ContentClass::Metadata, bytes.len() as u64)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| FetchError::io(parent, e))?;
    }
    std::fs::write(&path, &bytes).map_err(|e| FetchError::io(&path, e))?;
    budget.account(ctx.work_id, crate::budget::ContentClass::Metadata, bytes.len() as u64);
    Ok(Some(path))
}

/// Extracts a file extension (lowercased, no dot) from a URL path.
#[must_use]
pub(crate) fn extension_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    let dot = last.rfind('.')?;
    let ext = &last[dot + 1..];
    if ext.is_empty() || ext.len() > 8 {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Maps a MIME type to the extension used for on-disk names.
#[must_use]
pub(crate) fn extension_from_mime(mime: &str) -> Option<&'static str> {
    match mime.split(';').next().unwrap_or("").trim() {
        "application/pdf" => Some("pdf"),
        "application/epub+zip" => Some("epub"),
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/tiff" => Some("tif"),
        "image/jp2" => Some("jp2"),
        _ => None,
    }
}
