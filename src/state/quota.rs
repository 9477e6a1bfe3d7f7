//! Per-provider daily quota state.
//!
//! Each provider with quota enabled tracks `used_today` inside a wall-clock
//! window. The window advances in whole `reset_hours` steps and the counter
//! resets atomically with the advance. A `daily_limit` of 0 means unlimited.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::QuotaSettings;

/// Persistent quota counters for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub daily_limit: u64,
    pub used_today: u64,
    pub window_start_wall: DateTime<Utc>,
    pub wait_on_exhaustion: bool,
}

/// Outcome of a quota admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    /// The download may proceed.
    Allowed,
    /// The window is exhausted.
    Exhausted {
        /// When the window resets.
        ready_at: DateTime<Utc>,
        /// Whether the task should wait (defer) rather than fall back.
        wait: bool,
    },
}

impl QuotaState {
    /// Fresh state with a window starting now.
    #[must_use]
    pub fn new(settings: &QuotaSettings, now: DateTime<Utc>) -> Self {
        Self {
            daily_limit: settings.daily_limit,
            used_today: 0,
            window_start_wall: now,
            wait_on_exhaustion: settings.wait_for_reset,
        }
    }

    /// Advances the window in whole `reset_hours` steps until `now` falls
    /// inside it, resetting `used_today` with the advance.
    pub fn advance_window(&mut self, reset_hours: u64, now: DateTime<Utc>) {
        let window = Duration::hours(i64::try_from(reset_hours).unwrap_or(24));
        if window.is_zero() {
            return;
        }
        let mut advanced = false;
        while now - self.window_start_wall >= window {
            self.window_start_wall += window;
            advanced = true;
        }
        if advanced {
            self.used_today = 0;
        }
    }

    /// Checks whether another quota-gated download may start.
    ///
    /// Runtime settings win over persisted values for limit and policy, so a
    /// config edit between runs takes effect on the next check.
    pub fn check(&mut self, settings: &QuotaSettings, now: DateTime<Utc>) -> QuotaDecision {
        self.daily_limit = settings.daily_limit;
        self.wait_on_exhaustion = settings.wait_for_reset;
        self.advance_window(settings.reset_hours, now);

        if !settings.enabled || settings.daily_limit == 0 {
            return QuotaDecision::Allowed;
        }
        if self.used_today < settings.daily_limit {
            return QuotaDecision::Allowed;
        }
        let reset_hours = i64::try_from(settings.reset_hours).unwrap_or(24);
        QuotaDecision::Exhausted {
            ready_at: self.window_start_wall + Duration::hours(reset_hours),
            wait: settings.wait_for_reset,
        }
    }

    /// Records one successful quota-gated download.
    pub fn record_use(&mut self) {
        self.used_today += 1;
    }
}
