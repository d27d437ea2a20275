//! Bounded exponential backoff for SQLite lock contention.

use std::time::Duration;

use super::DatabaseError;

/// Errors that may wrap a transient `SQLITE_BUSY` / `SQLITE_LOCKED`.
pub trait Retryable {
    fn is_busy(&self) -> bool;
}

impl Retryable for DatabaseError {
    fn is_busy(&self) -> bool {
        DatabaseError::is_busy(self)
    }
}

/// How often and how patiently a contended transaction is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound for a single backoff sleep.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Sleep before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}
