//! Bounded-attempt HTTP request executor.
//!
//! Every outbound request (search API call or artifact download) flows
//! through [`HttpExecutor::execute`], which applies, in order: the provider's
//! circuit breaker, the provider's pacing gate, the per-request timeout, and
//! the retry loop (Retry-After for 429, exponential backoff for transients,
//! immediate surfacing for other 4xx). Terminal failures feed the breaker.
//!
//! Artifact downloads additionally reserve budget before the body stream is
//! opened, check the cumulative size after every chunk, and commit actuals on
//! completion; partial files are removed on any error or cancellation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER, USER_AGENT};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::budget::{BudgetAccountant, ContentClass};
use crate::config::{Config, NetworkSettings, SslErrorPolicy};
use crate::net::breaker::CircuitBreaker;
use crate::net::error::FetchError;
use crate::net::pacer::{Pacer, parse_retry_after};
use crate::net::retry::{FailureClass, RetryPolicy, classify_status, is_tls_error};

/// Default User-Agent identifying the tool (RFC 9308 good citizenship).
#[must_use]
pub fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("foliofetch/{version} (digital-library retrieval)")
}

/// Process-scope request executor shared by all provider adapters.
///
/// Holds the per-provider pacer and breaker registries; adapters obtain the
/// provider-keyed services implicitly by passing their key to each call.
#[derive(Debug)]
pub struct HttpExecutor {
    client: Client,
    /// Client without certificate verification, for `retry_insecure_once`.
    insecure_client: Client,
    user_agent: String,
    budget: Arc<BudgetAccountant>,
    default_settings: NetworkSettings,
    settings: HashMap<String, NetworkSettings>,
    pacers: DashMap<String, Arc<Pacer>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl HttpExecutor {
    /// Builds the executor from validated configuration.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static configuration,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new(config: &Config, budget: Arc<BudgetAccountant>) -> Self {
        let client = Client::builder()
            .gzip(true)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client with static configuration");
        let insecure_client = Client::builder()
            .gzip(true)
            .connect_timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(true)
            .build()
            .expect("failed to build insecure HTTP client with static configuration");

        let settings = config
            .provider_settings
            .iter()
            .map(|(key, ps)| (key.clone(), ps.network.clone()))
            .collect();

        Self {
            client,
            insecure_client,
            user_agent: config
                .general
                .user_agent
                .clone()
                .unwrap_or_else(default_user_agent),
            budget,
            default_settings: NetworkSettings::default(),
            settings,
            pacers: DashMap::new(),
            breakers: DashMap::new(),
        }
    }

    /// The budget accountant this executor charges downloads against.
    #[must_use]
    pub fn budget(&self) -> &Arc<BudgetAccountant> {
        &self.budget
    }

    /// Network settings for a provider, falling back to defaults.
    #[must_use]
    pub fn settings_for(&self, provider_key: &str) -> &NetworkSettings {
        self.settings.get(provider_key).unwrap_or(&self.default_settings)
    }

    /// The pacing gate for a provider (created on first use).
    #[must_use]
    pub fn pacer_for(&self, provider_key: &str) -> Arc<Pacer> {
        let settings = self.settings_for(provider_key);
        self.pacers
            .entry(provider_key.to_string())
            .or_insert_with(|| Arc::new(Pacer::from_millis(settings.delay_ms, settings.jitter_ms)))
            .clone()
    }

    /// The circuit breaker for a provider (created on first use).
    #[must_use]
    pub fn breaker_for(&self, provider_key: &str) -> Arc<CircuitBreaker> {
        let settings = self.settings_for(provider_key);
        self.breakers
            .entry(provider_key.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    provider_key,
                    settings.circuit_breaker_enabled,
                    settings.circuit_breaker_threshold,
                    Duration::from_secs(settings.circuit_breaker_cooldown_s),
                ))
            })
            .clone()
    }

    /// Fetches a JSON payload, counting its bytes against the `metadata`
    /// budget of `work_id`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] on any network, protocol, or budget failure.
    #[instrument(skip(self, cancel), fields(provider = provider_key))]
    pub async fn get_json(
        &self,
        provider_key: &str,
        url: &str,
        work_id: &str,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, FetchError> {
        self.budget.reserve(work_id, ContentClass::Metadata, 0)?;
        let response = self.execute(provider_key, url, cancel).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::transient(url, e.to_string()))?;
        let len = bytes.len() as u64;
        self.budget.charge_stream(work_id, ContentClass::Metadata, len)?;
        self.budget.account(work_id, ContentClass::Metadata, len);
        serde_json::from_slice(&bytes).map_err(|e| FetchError::protocol(url, e.to_string()))
    }

    /// Streams a response body to `dest`, enforcing the storage budget.
    ///
    /// Returns the number of bytes written. The destination's parent
    /// directory is created if missing. On any failure (including budget
    /// violations and cancellation) the partial file is removed.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] on network, budget, or filesystem failures.
    #[instrument(skip(self, cancel), fields(provider = provider_key, dest = %dest.display()))]
    pub async fn fetch_to_file(
        &self,
        provider_key: &str,
        url: &str,
        dest: &Path,
        class: ContentClass,
        work_id: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, FetchError> {
        let response = self.execute(provider_key, url, cancel).await?;
        let estimated = response.content_length().unwrap_or(0);
        self.budget.reserve(work_id, class, estimated)?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::io(parent, e))?;
        }
        let file = File::create(dest)
            .await
            .map_err(|e| FetchError::io(dest, e))?;

        match self.stream_body(response, url, dest, file, class, work_id, cancel).await {
            Ok(bytes) => {
                self.budget.account(work_id, class, bytes);
                info!(bytes, "download complete");
                Ok(bytes)
            }
            Err(error) => {
                debug!(path = %dest.display(), "removing partial file after error");
                let _ = tokio::fs::remove_file(dest).await;
                Err(error)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_body(
        &self,
        response: reqwest::Response,
        url: &str,
        dest: &Path,
        file: File,
        class: ContentClass,
        work_id: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, FetchError> {
        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let mut bytes_written: u64 = 0;

        loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => return Err(FetchError::Cancelled { url: url.to_string() }),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| FetchError::transient(url, e.to_string()))?;
            bytes_written += chunk.len() as u64;
            self.budget.charge_stream(work_id, class, bytes_written)?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| FetchError::io(dest, e))?;
        }

        writer.flush().await.map_err(|e| FetchError::io(dest, e))?;
        Ok(bytes_written)
    }

    /// Performs a GET with the full policy stack and returns the successful
    /// response.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::CircuitOpen`] without touching the network when
    /// the provider's breaker is open; otherwise the classified terminal
    /// error after the attempt budget is exhausted.
    #[instrument(skip(self, cancel), fields(provider = provider_key))]
    pub async fn execute(
        &self,
        provider_key: &str,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, FetchError> {
        let breaker = self.breaker_for(provider_key);
        if !breaker.admit() {
            return Err(FetchError::CircuitOpen {
                provider: provider_key.to_string(),
            });
        }

        let outcome = self.attempt_loop(provider_key, url, cancel).await;
        match &outcome {
            Ok(_) => breaker.record_success(),
            Err(error) => match error {
                // One trip per exhausted request.
                FetchError::RateLimited { .. }
                | FetchError::Transient { .. }
                | FetchError::Timeout { .. } => breaker.record_trip(),
                // The provider answered; it is not unhealthy.
                FetchError::ClientError { .. } => breaker.record_success(),
                // No verdict about provider health.
                _ => breaker.abandon(),
            },
        }
        outcome
    }

    async fn attempt_loop(
        &self,
        provider_key: &str,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, FetchError> {
        let settings = self.settings_for(provider_key);
        let policy = RetryPolicy::from_settings(settings);
        let pacer = self.pacer_for(provider_key);
        let timeout = Duration::from_secs(settings.timeout_s);
        let headers = self.header_map(settings);

        let mut attempt = 0u32;
        let mut insecure_retry_used = false;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(FetchError::Cancelled { url: url.to_string() });
                }
                () = pacer.acquire(provider_key) => {}
            }
            attempt += 1;

            let client = if insecure_retry_used {
                &self.insecure_client
            } else {
                &self.client
            };
            let request = client.get(url).timeout(timeout).headers(headers.clone());

            let result = tokio::select! {
                () = cancel.cancelled() => {
                    return Err(FetchError::Cancelled { url: url.to_string() });
                }
                result = request.send() => result,
            };

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        debug!(attempt, status = status.as_u16(), "request succeeded");
                        return Ok(response);
                    }
                    let code = status.as_u16();
                    let retry_after = response
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);

                    match classify_status(code) {
                        FailureClass::RateLimited => {
                            if !policy.allows_retry(FailureClass::RateLimited, attempt) {
                                return Err(FetchError::rate_limited(url, retry_after));
                            }
                            let delay = retry_after
                                .as_deref()
                                .and_then(parse_retry_after)
                                .map_or_else(|| policy.backoff_delay(attempt), |d| policy.cap_retry_after(d));
                            info!(
                                attempt,
                                delay_ms = delay.as_millis(),
                                honoring_retry_after = retry_after.is_some(),
                                "rate limited, retrying"
                            );
                            self.sleep(delay, url, cancel).await?;
                        }
                        FailureClass::Transient => {
                            if !policy.allows_retry(FailureClass::Transient, attempt) {
                                return Err(FetchError::transient(url, format!("HTTP {code}")));
                            }
                            let delay = policy.backoff_delay(attempt);
                            info!(attempt, status = code, delay_ms = delay.as_millis(), "server error, retrying");
                            self.sleep(delay, url, cancel).await?;
                        }
                        FailureClass::Permanent => {
                            return Err(FetchError::client(url, code));
                        }
                    }
                }
                Err(error) => {
                    if is_tls_error(&error) {
                        if settings.ssl_error_policy == SslErrorPolicy::RetryInsecureOnce
                            && !insecure_retry_used
                        {
                            warn!(url, "TLS verification failed, retrying once without verification");
                            insecure_retry_used = true;
                            continue;
                        }
                        return Err(FetchError::Tls {
                            url: url.to_string(),
                            detail: error.to_string(),
                        });
                    }
                    // Read timeouts are transient like any other network
                    // fault; the timeout kind is reserved for the worker
                    // deadline.
                    if !policy.allows_retry(FailureClass::Transient, attempt) {
                        return Err(FetchError::transient(url, error.to_string()));
                    }
                    let delay = policy.backoff_delay(attempt);
                    info!(attempt, error = %error, delay_ms = delay.as_millis(), "network error, retrying");
                    self.sleep(delay, url, cancel).await?;
                }
            }
        }
    }

    async fn sleep(&self, delay: Duration, url: &str, cancel: &CancellationToken) -> Result<(), FetchError> {
        tokio::select! {
            () = cancel.cancelled() => Err(FetchError::Cancelled { url: url.to_string() }),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn header_map(&self, settings: &NetworkSettings) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &settings.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "skipping invalid configured header"),
            }
        }
        if !headers.contains_key(USER_AGENT) {
            if let Ok(value) = HeaderValue::from_str(&self.user_agent) {
                headers.insert(USER_AGENT, value);
            }
        }
        headers
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_user_agent_contains_version() {
        let ua = default_user_agent();
        assert!(ua.starts_with("foliofetch/"));
        assert!(ua.contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_settings_fall_back_to_defaults_for_unknown_provider() {
        let config = Config::default();
        let executor = HttpExecutor::new(&config, Arc::new(BudgetAccountant::unlimited()));
        assert_eq!(executor.settings_for("nope").delay_ms, 1000);
    }

    #[test]
    fn test_pacer_and_breaker_are_cached_per_provider() {
        let config = Config::default();
        let executor = HttpExecutor::new(&config, Arc::new(BudgetAccountant::unlimited()));
        let a = executor.pacer_for("ia");
        let b = executor.pacer_for("ia");
        assert!(Arc::ptr_eq(&a, &b));

        let a = executor.breaker_for("ia");
        let b = executor.breaker_for("ia");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_header_map_includes_user_agent_and_custom_headers() {
        let text = r#"
            [provider_settings.ia.network.headers]
            "x-api-key" = "secret"
        "#;
        let config: Config = toml::from_str(text).unwrap();
        let executor = HttpExecutor::new(&config, Arc::new(BudgetAccountant::unlimited()));
        let headers = executor.header_map(executor.settings_for("ia"));
        assert_eq!(headers.get("x-api-key").unwrap(), "secret");
        assert!(headers.get(USER_AGENT).is_some());
    }

    #[test]
    fn test_configured_user_agent_override() {
        let text = r#"
            [general]
            user_agent = "custom/9.9"
        "#;
        let config: Config = toml::from_str(text).unwrap();
        let executor = HttpExecutor::new(&config, Arc::new(BudgetAccountant::unlimited()));
        let headers = executor.header_map(executor.settings_for("ia"));
        assert_eq!(headers.get(USER_AGENT).unwrap(), "custom/9.9");
    }
}
