//! Reconnect backoff and block bookkeeping.
//!
//! Three independent brakes on reconnection:
//!
//! - **Attempt budget**: transient failures schedule a retry after an
//!   exponentially growing, capped delay; past `max_attempts` automatic
//!   retries stop until an explicit `connect()`.
//! - **Capacity block**: a timed window during which no attempt is made.
//! - **Auth block**: sticky; only `reset()` clears it.

use std::time::Duration;

use crate::env::Timestamp;

/// Delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on any single retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Automatic retries per failure streak.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Exponential backoff policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first retry; doubled for every further attempt.
    pub base_delay: Duration,
    /// Cap applied after doubling.
    pub max_delay: Duration,
    /// Retries allowed before giving up. Zero disables automatic retries.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (1-based).
    ///
    /// `base_delay * 2^(attempt - 1)`, saturating, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Mutable backoff state owned by the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff<I> {
    attempts: u32,
    blocked_until: Option<I>,
    auth_blocked: bool,
}

impl<I> Default for Backoff<I> {
    fn default() -> Self {
        Self { attempts: 0, blocked_until: None, auth_blocked: false }
    }
}

impl<I: Timestamp> Backoff<I> {
    /// Fresh state: no attempts, no blocks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries consumed in the current failure streak.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// End of the active capacity window, if any.
    pub fn blocked_until(&self) -> Option<I> {
        self.blocked_until
    }

    /// Whether an authentication failure is suppressing reconnection.
    pub fn is_auth_blocked(&self) -> bool {
        self.auth_blocked
    }

    /// Consume one retry from the budget.
    ///
    /// Returns the delay to wait before the retry, or `None` once the budget
    /// is exhausted.
    pub fn next_retry(&mut self, config: &BackoffConfig) -> Option<Duration> {
        if self.attempts >= config.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(config.delay_for_attempt(self.attempts))
    }

    /// Forget the failure streak (after a successful connect or an explicit
    /// `connect()` call).
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
    }

    /// Set the sticky authentication block.
    pub fn block_auth(&mut self) {
        self.auth_blocked = true;
    }

    /// Start a capacity window ending at `until`.
    pub fn block_until(&mut self, until: I) {
        self.blocked_until = Some(until);
    }

    /// Time left in the capacity window, or `None` if no window is active at
    /// `now`.
    pub fn capacity_remaining(&self, now: I) -> Option<Duration> {
        match self.blocked_until {
            Some(until) if until > now => Some(until - now),
            _ => None,
        }
    }

    /// Drop the capacity window.
    pub fn clear_capacity(&mut self) {
        self.blocked_until = None;
    }

    /// Clear everything, including the auth block.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
