//! Per-provider request pacing.
//!
//! A [`Pacer`] enforces a minimum spacing of `delay_ms` plus a uniform
//! random jitter between consecutive request starts against one provider.
//! Waiters queue FIFO: the timing slot is guarded by a `tokio::sync::Mutex`,
//! which wakes waiters in arrival order, so no later request for the same
//! provider starts before an earlier one that is still waiting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Warning threshold for cumulative pacing delay per provider.
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(60);

/// Maximum Retry-After value honored (1 hour).
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Pacing gate for a single provider.
///
/// Designed to be wrapped in `Arc` and shared by every task that talks to
/// the same provider. A `delay_ms` of 0 disables pacing entirely.
#[derive(Debug)]
pub struct Pacer {
    delay: Duration,
    jitter: Duration,
    /// Time of the last request start; `None` until the first request.
    last_start: Mutex<Option<Instant>>,
    /// Cumulative delay applied, for excessive-pacing warnings.
    cumulative_delay_ms: AtomicU64,
}

impl Pacer {
    /// Creates a pacer with the given spacing and jitter bound.
    #[must_use]
    pub fn new(delay: Duration, jitter: Duration) -> Self {
        Self {
            delay,
            jitter,
            last_start: Mutex::new(None),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    /// Creates a pacer from millisecond settings.
    #[must_use]
    pub fn from_millis(delay_ms: u64, jitter_ms: u64) -> Self {
        Self::new(Duration::from_millis(delay_ms), Duration::from_millis(jitter_ms))
    }

    /// The configured minimum spacing.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Waits until this task may start a request, then claims the slot.
    ///
    /// The first request proceeds immediately. Subsequent requests wait out
    /// the remainder of `delay + uniform(0, jitter)` since the previous
    /// request start. The internal mutex is held across the sleep, which is
    /// what provides FIFO fairness among waiters.
    #[instrument(level = "debug", skip(self), fields(provider = provider_key))]
    pub async fn acquire(&self, provider_key: &str) {
        if self.delay.is_zero() {
            return;
        }

        let mut last_start = self.last_start.lock().await;
        if let Some(previous) = *last_start {
            let spacing = self.delay + self.sample_jitter();
            let elapsed = previous.elapsed();
            if elapsed < spacing {
                let wait = spacing - elapsed;
                let cumulative = self.add_cumulative(wait);
                debug!(wait_ms = wait.as_millis(), "pacing request");
                if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                    warn!(
                        provider = provider_key,
                        cumulative_delay_secs = cumulative.as_secs(),
                        "excessive pacing delay accumulated for provider"
                    );
                }
                tokio::time::sleep(wait).await;
            }
        } else {
            debug!("first request to provider, no pacing delay");
        }
        *last_start = Some(Instant::now());
    }

    #[allow(clippy::cast_possible_truncation)]
    fn sample_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return Duration::ZERO;
        }
        let bound = self.jitter.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=bound))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative(&self, delay: Duration) -> Duration {
        let ms = delay.as_millis() as u64;
        let total = self.cumulative_delay_ms.fetch_add(ms, Ordering::SeqCst) + ms;
        Duration::from_millis(total)
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports both RFC 7231 formats: integer seconds and HTTP-date (evaluated
/// against the current UTC wall time). Values are capped at 1 hour; negative
/// or unparseable values yield `None`.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        return Some(duration.min(MAX_RETRY_AFTER));
    }

    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        let now = std::time::SystemTime::now();
        return match datetime.duration_since(now) {
            Ok(duration) => Some(duration.min(MAX_RETRY_AFTER)),
            // Date in the past: no wait required.
            Err(_) => Some(Duration::ZERO),
        };
    }

    debug!(header_value, "unparseable Retry-After value");
    None
}
