//! Retry policy and failure classification for outbound requests.
//!
//! Failures are classified into [`FailureClass`] values that drive the
//! executor's retry loop: transient and rate-limited failures retry within
//! the attempt budget, permanent failures surface immediately.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::config::NetworkSettings;

/// Maximum jitter added to backoff delays.
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of a request failure for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// May succeed on retry: 5xx, connection resets, DNS failures, timeouts.
    Transient,
    /// Retrying cannot help: other 4xx, TLS, malformed payloads, IO.
    Permanent,
    /// HTTP 429; retried honoring Retry-After.
    RateLimited,
}

/// Retry configuration derived from a provider's network settings.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_backoff: Duration,
    backoff_multiplier: f64,
    max_backoff: Duration,
}

impl RetryPolicy {
    /// Builds a policy from per-provider network settings.
    #[must_use]
    pub fn from_settings(settings: &NetworkSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_backoff: Duration::from_secs_f64(settings.base_backoff_s.max(0.0)),
            backoff_multiplier: settings.backoff_multiplier.max(1.0),
            max_backoff: Duration::from_secs_f64(settings.max_backoff_s.max(0.0)),
        }
    }

    /// Maximum attempts including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt is allowed after `attempt` (1-indexed) failed.
    #[must_use]
    pub fn allows_retry(&self, class: FailureClass, attempt: u32) -> bool {
        if class == FailureClass::Permanent {
            return false;
        }
        let allowed = attempt < self.max_attempts;
        if !allowed {
            debug!(attempt, max = self.max_attempts, "attempt budget exhausted");
        }
        allowed
    }

    /// Backoff delay before the retry following failed attempt `attempt`
    /// (1-indexed): `min(base * multiplier^(attempt-1), max) + jitter`.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = f64::from(attempt.saturating_sub(1));
        let scaled = self.base_backoff.as_secs_f64() * self.backoff_multiplier.powf(exponent);
        let capped = scaled.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped) + sample_jitter()
    }

    /// Caps a server-supplied Retry-After delay at the configured maximum.
    #[must_use]
    pub fn cap_retry_after(&self, delay: Duration) -> Duration {
        delay.min(self.max_backoff)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn sample_jitter() -> Duration {
    let bound = MAX_JITTER.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=bound))
}

/// Classifies an HTTP status code.
#[must_use]
pub fn classify_status(status: u16) -> FailureClass {
    match status {
        429 => FailureClass::RateLimited,
        408 => FailureClass::Transient,
        400..=499 => FailureClass::Permanent,
        500..=599 => FailureClass::Transient,
        _ => FailureClass::Permanent,
    }
}

/// Heuristic TLS/certificate detection on a reqwest error chain.
///
/// TLS failures are permanent, subject to the insecure-retry policy handled
/// by the executor; other network-level errors may recover.
#[must_use]
pub fn is_tls_error(error: &reqwest::Error) -> bool {
    let text = error.to_string().to_lowercase();
    text.contains("certificate") || text.contains("tls") || text.contains("ssl") || text.contains("handshake")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::from_settings(&NetworkSettings {
            max_attempts,
            base_backoff_s: 1.0,
            backoff_multiplier: 2.0,
            max_backoff_s: 8.0,
            ..NetworkSettings::default()
        })
    }

    #[test]
    fn test_permanent_never_retries() {
        let p = policy(5);
        assert!(!p.allows_retry(FailureClass::Permanent, 1));
    }

    #[test]
    fn test_transient_retries_within_budget() {
        let p = policy(3);
        assert!(p.allows_retry(FailureClass::Transient, 1));
        assert!(p.allows_retry(FailureClass::Transient, 2));
        assert!(!p.allows_retry(FailureClass::Transient, 3));
    }

    #[test]
    fn test_rate_limited_retries_within_budget() {
        let p = policy(2);
        assert!(p.allows_retry(FailureClass::RateLimited, 1));
        assert!(!p.allows_retry(FailureClass::RateLimited, 2));
    }

    #[test]
    fn test_backoff_grows_exponentially_and_caps() {
        let p = policy(10);
        let jitter = MAX_JITTER;
        assert!(p.backoff_delay(1) >= Duration::from_secs(1));
        assert!(p.backoff_delay(1) <= Duration::from_secs(1) + jitter);
        assert!(p.backoff_delay(2) >= Duration::from_secs(2));
        assert!(p.backoff_delay(3) >= Duration::from_secs(4));
        // 2^5 = 32s would exceed the 8s cap.
        assert!(p.backoff_delay(6) <= Duration::from_secs(8) + jitter);
    }

    #[test]
    fn test_cap_retry_after() {
        let p = policy(3);
        assert_eq!(
            p.cap_retry_after(Duration::from_secs(100)),
            Duration::from_secs(8)
        );
        assert_eq!(
            p.cap_retry_after(Duration::from_secs(3)),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_classify_status_table() {
        assert_eq!(classify_status(429), FailureClass::RateLimited);
        assert_eq!(classify_status(408), FailureClass::Transient);
        assert_eq!(classify_status(404), FailureClass::Permanent);
        assert_eq!(classify_status(400), FailureClass::Permanent);
        assert_eq!(classify_status(451), FailureClass::Permanent);
        assert_eq!(classify_status(500), FailureClass::Transient);
        assert_eq!(classify_status(503), FailureClass::Transient);
        assert_eq!(classify_status(504), FailureClass::Transient);
    }

    #[test]
    fn test_max_attempts_minimum_is_one() {
        let p = policy(0);
        assert_eq!(p.max_attempts(), 1);
    }
}
