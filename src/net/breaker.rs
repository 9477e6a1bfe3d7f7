//! Per-provider circuit breaker.
//!
//! Isolates a failing provider behind a three-state gate:
//!
//! - `CLOSED`: requests pass; consecutive trip failures are counted.
//! - `OPEN`: requests fail immediately until the cooldown elapses.
//! - `HALF_OPEN`: exactly one probe request is admitted; its outcome decides
//!   between `CLOSED` (success) and `OPEN` again (failure).
//!
//! A trip is one *exhausted* request whose final error was rate limiting or
//! a transient failure; ordinary 4xx responses prove the provider is alive
//! and count as successes.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

/// Breaker mode, as exposed in status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerMode {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerMode {
    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time view of a breaker, for `--quota-status` style reporting.
#[derive(Debug, Clone, Copy)]
pub struct BreakerSnapshot {
    pub mode: BreakerMode,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct BreakerCore {
    mode: BreakerMode,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Three-state failure gate for one provider.
///
/// Internally synchronized; shared as `Arc<CircuitBreaker>`. All operations
/// are non-blocking.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider_key: String,
    enabled: bool,
    threshold: u32,
    cooldown: Duration,
    core: Mutex<BreakerCore>,
}

impl CircuitBreaker {
    /// Creates a breaker; `enabled = false` makes it a no-op that always admits.
    #[must_use]
    pub fn new(provider_key: impl Into<String>, enabled: bool, threshold: u32, cooldown: Duration) -> Self {
        Self {
            provider_key: provider_key.into(),
            enabled,
            threshold: threshold.max(1),
            cooldown,
            core: Mutex::new(BreakerCore {
                mode: BreakerMode::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Asks to start a request. `false` means the circuit is open and the
    /// request must fail immediately with `CircuitOpen`.
    ///
    /// When the cooldown has elapsed, the breaker moves to `HALF_OPEN` and
    /// admits a single probe; concurrent callers are rejected until the
    /// probe's outcome is recorded.
    #[must_use]
    pub fn admit(&self) -> bool {
        if !self.enabled {
            return true;
        }
        let mut core = self.lock();
        match core.mode {
            BreakerMode::Closed => true,
            BreakerMode::Open => {
                let elapsed = core.opened_at.map_or(Duration::MAX, |t| t.elapsed());
                if elapsed >= self.cooldown {
                    core.mode = BreakerMode::HalfOpen;
                    core.probe_in_flight = true;
                    debug!(provider = %self.provider_key, "breaker half-open, admitting probe");
                    true
                } else {
                    false
                }
            }
            BreakerMode::HalfOpen => {
                if core.probe_in_flight {
                    false
                } else {
                    core.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Records a non-trip outcome: the provider answered.
    pub fn record_success(&self) {
        if !self.enabled {
            return;
        }
        let mut core = self.lock();
        if core.mode != BreakerMode::Closed {
            debug!(provider = %self.provider_key, "breaker closing after successful probe");
        }
        core.mode = BreakerMode::Closed;
        core.consecutive_failures = 0;
        core.opened_at = None;
        core.probe_in_flight = false;
    }

    /// Records a trip: an exhausted request ending in 429/5xx/network failure.
    pub fn record_trip(&self) {
        if !self.enabled {
            return;
        }
        let mut core = self.lock();
        core.probe_in_flight = false;
        match core.mode {
            BreakerMode::Closed => {
                core.consecutive_failures += 1;
                if core.consecutive_failures >= self.threshold {
                    core.mode = BreakerMode::Open;
                    core.opened_at = Some(Instant::now());
                    warn!(
                        provider = %self.provider_key,
                        failures = core.consecutive_failures,
                        cooldown_s = self.cooldown.as_secs(),
                        "circuit breaker opened"
                    );
                }
            }
            BreakerMode::HalfOpen => {
                core.mode = BreakerMode::Open;
                core.opened_at = Some(Instant::now());
                warn!(provider = %self.provider_key, "probe failed, breaker reopened");
            }
            BreakerMode::Open => {}
        }
    }

    /// Releases an admitted slot whose request never produced an outcome
    /// (cancellation). Leaves the mode unchanged.
    pub fn abandon(&self) {
        if !self.enabled {
            return;
        }
        let mut core = self.lock();
        core.probe_in_flight = false;
    }

    /// Current mode and failure count.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let core = self.lock();
        BreakerSnapshot {
            mode: core.mode,
            consecutive_failures: core.consecutive_failures,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerCore> {
        match self.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
