//! Auto-retry pacing: exponential backoff plus a crash-loop breaker.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::RestartSection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub min_interval: Duration,
    pub max_backoff: Duration,
    /// Sliding window in which restarts are counted.
    pub window: Duration,
    pub max_restarts: u32,
    /// An instance that ran at least this long resets the backoff.
    pub stable_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from(&RestartSection::default())
    }
}

impl From<&RestartSection> for RestartPolicy {
    fn from(section: &RestartSection) -> Self {
        Self {
            min_interval: Duration::from_millis(section.min_interval_ms),
            max_backoff: Duration::from_millis(section.max_backoff_ms),
            window: Duration::from_secs(section.window_secs),
            max_restarts: section.max_restarts,
            stable_after: Duration::from_secs(section.stable_after_secs),
        }
    }
}

impl RestartPolicy {
    /// Delay before the `attempt`-th consecutive restart (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.min_interval
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartDecision {
    RestartAfter(Duration),
    GiveUp { restarts: usize, window: Duration },
}

/// Per-task crash history.
#[derive(Debug, Default)]
pub struct CrashTracker {
    restarts: VecDeque<Instant>,
    attempt: u32,
}

impl CrashTracker {
    /// Record a crash at `now` of an instance that ran for `ran_for`.
    pub fn record(&mut self, now: Instant, ran_for: Duration, policy: &RestartPolicy) -> RestartDecision {
        if ran_for >= policy.stable_after {
            self.attempt = 0;
        }
        while let Some(&oldest) = self.restarts.front() {
            if now.duration_since(oldest) > policy.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        if self.restarts.len() >= policy.max_restarts as usize {
            return RestartDecision::GiveUp {
                restarts: self.restarts.len(),
                window: policy.window,
            };
        }

        let delay = policy.backoff(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.restarts.push_back(now);
        RestartDecision::RestartAfter(delay)
    }

    pub fn reset(&mut self) {
        self.restarts.clear();
        self.attempt = 0;
    }
}
