use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fixed-delay retry policy. `max_attempts: None` retries forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub delay_ms: u64,
}

impl RetryPolicy {
    pub const fn bounded(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            delay_ms,
        }
    }

    pub const fn unbounded(delay_ms: u64) -> Self {
        Self {
            max_attempts: None,
            delay_ms,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn attempts(&self) -> Attempts {
        Attempts {
            policy: *self,
            made: 0,
        }
    }

    /// Whether a retry scheduled at `last_attempt_ms` may run at `now_ms`.
    pub fn is_due(&self, last_attempt_ms: Option<u64>, now_ms: u64) -> bool {
        match last_attempt_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.delay_ms,
        }
    }
}

/// Attempt counter driven by the caller, so the sleeping stays outside.
#[derive(Debug, Clone)]
pub struct Attempts {
    policy: RetryPolicy,
    made: u32,
}

impl Attempts {
    /// Registers a new attempt and returns its 1-based number, or `None` once
    /// the policy is exhausted.
    pub fn next_attempt(&mut self) -> Option<u32> {
        if self.is_exhausted() {
            return None;
        }
        self.made = self.made.saturating_add(1);
        Some(self.made)
    }

    /// Delay to wait after a failed attempt, `None` when no attempt follows.
    pub fn delay_after_failure(&self) -> Option<Duration> {
        if self.is_exhausted() {
            None
        } else {
            Some(self.policy.delay())
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.policy.max_attempts, Some(max) if self.made >= max)
    }

    pub fn made(&self) -> u32 {
        self.made
    }

    pub fn limit(&self) -> Option<u32> {
        self.policy.max_attempts
    }
}
