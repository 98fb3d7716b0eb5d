//! Exponential-backoff retry decisions.
//!
//! Stateless, like the rest of the decision logic: the policy looks at the
//! job's current retry count and says whether to schedule another attempt.
//! Applying the decision to the store is the caller's job.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Outcome of consulting the policy for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after `delay`; `retry_count` is the new count.
    Requeue { retry_count: u32, delay: Duration },
    /// No retries left.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Decide for a job that has already been retried `retry_count` times.
    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        if retry_count >= self.max_retries {
            return RetryDecision::Exhausted;
        }
        let next = retry_count + 1;
        RetryDecision::Requeue {
            retry_count: next,
            delay: self.delay_for(next),
        }
    }

    /// delay = base_delay * 2^retry_count, capped at `max_delay`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Wall-clock time at which a requeued job becomes runnable again.
    pub fn due_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
