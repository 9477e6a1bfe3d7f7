//! Configuration loading and validation.
//!
//! A single TOML document drives the whole process. The path is resolved from
//! the CLI flag, the `FOLIOFETCH_CONFIG` environment variable, or the XDG
//! config directory, in that order; a missing file yields built-in defaults.
//! All values are validated at load, and storage limits are normalized from
//! GB/MB to bytes here so the rest of the crate only ever sees bytes.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Environment variable that overrides the config file path.
pub const CONFIG_PATH_ENV: &str = "FOLIOFETCH_CONFIG";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for the expected schema.
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range or the document is internally inconsistent.
    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// What to do when a TLS certificate verification failure occurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SslErrorPolicy {
    /// TLS failures are terminal.
    Fail,
    /// Retry exactly once without certificate verification, then give up.
    RetryInsecureOnce,
}

/// How already-processed input records are skipped on re-runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    /// Skip when `work.json` exists with status `completed`.
    SkipCompleted,
    /// Skip when `objects/` exists and holds at least one regular file.
    SkipIfHasObjects,
    /// Skip when the input row's `retrievable` column equals `True`.
    ResumeFromCsv,
    /// Never skip.
    ReprocessAll,
}

/// Behavior when a storage budget is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnExceed {
    /// Fail the current artifact only.
    Skip,
    /// Fail the artifact and drain the scheduler.
    Stop,
}

/// Candidate selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Fan out across all enabled providers, then rank globally.
    CollectAndSelect,
    /// Walk the provider hierarchy and stop at the first acceptable hit.
    SequentialFirstHit,
}

/// Per-provider network policy: pacing, retries, timeouts, circuit breaking.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkSettings {
    /// Minimum spacing between request starts, in milliseconds.
    pub delay_ms: u64,
    /// Upper bound of the uniform jitter added to the spacing.
    pub jitter_ms: u64,
    /// Maximum attempts per request, including the first.
    pub max_attempts: u32,
    /// Base delay for exponential backoff, in seconds.
    pub base_backoff_s: f64,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
    /// Cap on any single backoff or Retry-After sleep, in seconds.
    pub max_backoff_s: f64,
    /// Per-request timeout, in seconds.
    pub timeout_s: u64,
    pub circuit_breaker_enabled: bool,
    /// Consecutive trip failures before the breaker opens.
    pub circuit_breaker_threshold: u32,
    /// Seconds the breaker stays open before admitting a probe.
    pub circuit_breaker_cooldown_s: u64,
    pub ssl_error_policy: SslErrorPolicy,
    /// Static headers attached to every request to this provider.
    pub headers: BTreeMap<String, String>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            delay_ms: 1000,
            jitter_ms: 250,
            max_attempts: 3,
            base_backoff_s: 1.0,
            backoff_multiplier: 2.0,
            max_backoff_s: 32.0,
            timeout_s: 60,
            circuit_breaker_enabled: true,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_s: 60,
            ssl_error_policy: SslErrorPolicy::Fail,
            headers: BTreeMap::new(),
        }
    }
}

/// Per-provider daily quota policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuotaSettings {
    pub enabled: bool,
    /// Successful downloads allowed per window; 0 means unlimited.
    pub daily_limit: u64,
    /// Window length in hours.
    pub reset_hours: u64,
    /// Defer work past exhaustion instead of falling back.
    pub wait_for_reset: bool,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            daily_limit: 0,
            reset_hours: 24,
            wait_for_reset: true,
        }
    }
}

/// Everything configurable per provider.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderSettings {
    pub network: NetworkSettings,
    pub quota: QuotaSettings,
    /// Base URL override, mainly for tests against a mock server.
    pub endpoint: Option<String>,
}

/// Download behavior shared by all providers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadSettings {
    pub resume_mode: ResumeMode,
    pub prefer_pdf_over_images: bool,
    /// Download bundled renderings (PDF/EPUB) referenced from IIIF manifests.
    pub download_manifest_renderings: bool,
    pub max_renderings_per_manifest: usize,
    pub rendering_mime_whitelist: Vec<String>,
    pub overwrite_existing: bool,
    /// Persist raw candidate metadata and manifests under `metadata/`.
    pub include_metadata: bool,
    pub allowed_object_extensions: Vec<String>,
    /// Page images downloaded per work; 0 means all pages.
    pub max_pages: usize,
    pub max_parallel_downloads: usize,
    /// Per-provider concurrent-download caps; key `default` is the fallback.
    pub provider_concurrency: BTreeMap<String, usize>,
    /// Deadline for a single download task, in seconds.
    pub worker_timeout_s: u64,
    /// Deferred-queue scan interval, in seconds.
    pub deferred_poll_secs: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        let mut provider_concurrency = BTreeMap::new();
        provider_concurrency.insert("default".to_string(), 2);
        Self {
            resume_mode: ResumeMode::SkipCompleted,
            prefer_pdf_over_images: true,
            download_manifest_renderings: true,
            max_renderings_per_manifest: 2,
            rendering_mime_whitelist: vec![
                "application/pdf".to_string(),
                "application/epub+zip".to_string(),
            ],
            overwrite_existing: false,
            include_metadata: true,
            allowed_object_extensions: vec![
                "pdf".to_string(),
                "epub".to_string(),
                "jpg".to_string(),
                "jpeg".to_string(),
                "png".to_string(),
                "tif".to_string(),
                "tiff".to_string(),
            ],
            max_pages: 0,
            max_parallel_downloads: 4,
            provider_concurrency,
            worker_timeout_s: 600,
            deferred_poll_secs: 30,
        }
    }
}

impl DownloadSettings {
    /// Concurrency cap for a provider, falling back to `default`, then 1.
    #[must_use]
    pub fn concurrency_for(&self, provider_key: &str) -> usize {
        self.provider_concurrency
            .get(provider_key)
            .or_else(|| self.provider_concurrency.get("default"))
            .copied()
            .unwrap_or(1)
            .max(1)
    }
}

/// Total-scope storage limits, configured in gigabytes. 0 means unlimited.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TotalLimits {
    pub pdfs_gb: f64,
    pub images_gb: f64,
    pub metadata_gb: f64,
}

/// Per-work storage limits, configured in megabytes. 0 means unlimited.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PerWorkLimits {
    pub pdfs_mb: f64,
    pub images_mb: f64,
    pub metadata_mb: f64,
}

/// Storage budget configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadLimits {
    pub on_exceed: Option<OnExceed>,
    pub total: TotalLimits,
    pub per_work: PerWorkLimits,
}

/// Candidate selection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SelectionSettings {
    pub strategy: SelectionStrategy,
    /// Provider keys in preference order; also the tie-break order.
    pub provider_hierarchy: Vec<String>,
    /// Minimum title score (0..100) for a candidate to be acceptable.
    pub min_title_score: f64,
    /// Weight of the creator score in the total (0..1).
    pub creator_weight: f64,
    pub max_candidates_per_provider: usize,
    /// Concurrent provider searches within one work.
    pub max_parallel_searches: usize,
}

impl Default for SelectionSettings {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::CollectAndSelect,
            provider_hierarchy: vec!["ia".to_string(), "wellcome".to_string()],
            min_title_score: 85.0,
            creator_weight: 0.3,
            max_candidates_per_provider: 5,
            max_parallel_searches: 4,
        }
    }
}

/// Filename/slug configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NamingSettings {
    pub title_slug_max_len: usize,
    pub creator_slug_max_len: usize,
}

impl Default for NamingSettings {
    fn default() -> Self {
        Self {
            title_slug_max_len: 60,
            creator_slug_max_len: 40,
        }
    }
}

/// Process-wide settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneralSettings {
    /// User-Agent override; a versioned default is used when absent.
    pub user_agent: Option<String>,
}

/// The whole configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub general: GeneralSettings,
    /// Enabled flags per provider key.
    pub providers: BTreeMap<String, bool>,
    pub provider_settings: BTreeMap<String, ProviderSettings>,
    pub download: DownloadSettings,
    pub download_limits: DownloadLimits,
    pub selection: SelectionSettings,
    pub naming: NamingSettings,
}

static DEFAULT_PROVIDER_SETTINGS: std::sync::OnceLock<ProviderSettings> = std::sync::OnceLock::new();

impl Config {
    /// Loads configuration from `explicit_path`, the `FOLIOFETCH_CONFIG`
    /// environment variable, or the default lookup locations.
    ///
    /// A missing file is not an error: built-in defaults are returned.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed, or
    /// when any value fails validation.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit_path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
            .or_else(default_config_path);

        let config = match path {
            Some(path) if path.exists() => {
                debug!(path = %path.display(), "loading config file");
                let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                toml::from_str(&text).map_err(|source| ConfigError::Parse { path, source })?
            }
            Some(path) => {
                debug!(path = %path.display(), "no config file; using defaults");
                Self::default()
            }
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Network policy for a provider, falling back to defaults.
    #[must_use]
    pub fn network(&self, provider_key: &str) -> &NetworkSettings {
        self.provider_settings
            .get(provider_key)
            .map_or_else(|| &default_provider_settings().network, |s| &s.network)
    }

    /// Quota policy for a provider, falling back to defaults (disabled).
    #[must_use]
    pub fn quota(&self, provider_key: &str) -> &QuotaSettings {
        self.provider_settings
            .get(provider_key)
            .map_or_else(|| &default_provider_settings().quota, |s| &s.quota)
    }

    /// Endpoint override for a provider, if configured.
    #[must_use]
    pub fn endpoint(&self, provider_key: &str) -> Option<&str> {
        self.provider_settings
            .get(provider_key)
            .and_then(|s| s.endpoint.as_deref())
    }

    /// Enabled provider keys, in hierarchy order.
    ///
    /// A provider listed in the hierarchy is enabled unless its flag says
    /// otherwise; providers flagged on but absent from the hierarchy are
    /// appended after it.
    #[must_use]
    pub fn enabled_providers(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .selection
            .provider_hierarchy
            .iter()
            .filter(|key| self.providers.get(*key).copied().unwrap_or(true))
            .cloned()
            .collect();
        for (key, enabled) in &self.providers {
            if *enabled && !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }

    /// Position of a provider in the hierarchy; unknown providers sort last.
    #[must_use]
    pub fn hierarchy_rank(&self, provider_key: &str) -> usize {
        self.selection
            .provider_hierarchy
            .iter()
            .position(|k| k == provider_key)
            .unwrap_or(usize::MAX)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.selection.creator_weight) {
            return Err(ConfigError::invalid(format!(
                "selection.creator_weight {} out of range 0..=1",
                self.selection.creator_weight
            )));
        }
        if !(0.0..=100.0).contains(&self.selection.min_title_score) {
            return Err(ConfigError::invalid(format!(
                "selection.min_title_score {} out of range 0..=100",
                self.selection.min_title_score
            )));
        }
        if self.selection.max_parallel_searches == 0 {
            return Err(ConfigError::invalid(
                "selection.max_parallel_searches must be at least 1",
            ));
        }
        if self.download.max_parallel_downloads == 0 {
            return Err(ConfigError::invalid(
                "download.max_parallel_downloads must be at least 1",
            ));
        }
        if self.download.worker_timeout_s == 0 {
            return Err(ConfigError::invalid(
                "download.worker_timeout_s must be at least 1",
            ));
        }
        if self.naming.title_slug_max_len == 0 {
            return Err(ConfigError::invalid(
                "naming.title_slug_max_len must be at least 1",
            ));
        }
        for (key, settings) in &self.provider_settings {
            let net = &settings.network;
            if net.max_attempts == 0 {
                return Err(ConfigError::invalid(format!(
                    "provider_settings.{key}.network.max_attempts must be at least 1"
                )));
            }
            if net.backoff_multiplier < 1.0 {
                return Err(ConfigError::invalid(format!(
                    "provider_settings.{key}.network.backoff_multiplier must be >= 1"
                )));
            }
            if net.timeout_s == 0 {
                return Err(ConfigError::invalid(format!(
                    "provider_settings.{key}.network.timeout_s must be at least 1"
                )));
            }
            if settings.quota.enabled && settings.quota.reset_hours == 0 {
                return Err(ConfigError::invalid(format!(
                    "provider_settings.{key}.quota.reset_hours must be at least 1"
                )));
            }
        }
        self.validate_limit_consistency()?;
        Ok(())
    }

    /// Rejects per-work limits larger than the corresponding non-zero total.
    fn validate_limit_consistency(&self) -> Result<(), ConfigError> {
        let pairs = [
            ("pdfs", self.download_limits.total.pdfs_gb, self.download_limits.per_work.pdfs_mb),
            (
                "images",
                self.download_limits.total.images_gb,
                self.download_limits.per_work.images_mb,
            ),
            (
                "metadata",
                self.download_limits.total.metadata_gb,
                self.download_limits.per_work.metadata_mb,
            ),
        ];
        for (name, total_gb, per_work_mb) in pairs {
            let total = gb_to_bytes(total_gb);
            let per_work = mb_to_bytes(per_work_mb);
            if total > 0 && per_work > total {
                return Err(ConfigError::invalid(format!(
                    "download_limits.per_work.{name}_mb ({per_work} bytes) exceeds download_limits.total.{name}_gb ({total} bytes)"
                )));
            }
        }
        Ok(())
    }
}

fn default_provider_settings() -> &'static ProviderSettings {
    DEFAULT_PROVIDER_SETTINGS.get_or_init(ProviderSettings::default)
}

/// Default lookup: `$XDG_CONFIG_HOME/foliofetch/config.toml`, then
/// `$HOME/.config/foliofetch/config.toml`.
fn default_config_path() -> Option<PathBuf> {
    if let Some(base) = env::var_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(base).join("foliofetch").join("config.toml"));
    }
    env::var_os("HOME").map(|home| {
        PathBuf::from(home)
            .join(".config")
            .join("foliofetch")
            .join("config.toml")
    })
}

/// Normalizes a GB limit to bytes. 0 (or negative) means unlimited.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn gb_to_bytes(gb: f64) -> u64 {
    if gb <= 0.0 {
        0
    } else {
        (gb * 1024.0 * 1024.0 * 1024.0) as u64
    }
}

/// Normalizes an MB limit to bytes. 0 (or negative) means unlimited.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn mb_to_bytes(mb: f64) -> u64 {
    if mb <= 0.0 {
        0
    } else {
        (mb * 1024.0 * 1024.0) as u64
    }
}
