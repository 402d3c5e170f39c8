//! Shared retry policy: exponential backoff with jitter.
//!
//! The policy is a pure function of `(attempt, error kind, job kind)`;
//! the worker pool applies the decision, the policy never touches the
//! queue itself.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::job::JobKind;

/// Uniform jitter applied to every computed backoff, as a fraction of
/// the nominal delay (±20 %).
const JITTER_FRACTION: f64 = 0.2;

/// Outcome of applying the retry policy to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue with `scheduled_for = now + delay` and `attempt + 1`.
    Retry { after: Duration },
    /// Terminal: dead-letter the job.
    GiveUp,
}

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    pub base: Duration,
    /// Maximum total attempts (first run included) unless overridden
    /// per job kind.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Effective attempt cap for a job kind.
    ///
    /// EmailSend tolerates more transient SMTP failures; AlertCheck is
    /// never retried because the next scheduled evaluation supersedes it.
    pub fn max_attempts_for(&self, kind: JobKind) -> u32 {
        match kind {
            JobKind::EmailSend => 5,
            JobKind::AlertCheck => 1,
            _ => self.max_attempts,
        }
    }

    /// Nominal backoff before the retry following 0-based `attempt`,
    /// without jitter: `base * 2^attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base.saturating_mul(factor)
    }

    /// Backoff with uniform ±20 % jitter applied.
    pub fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let nominal = self.backoff(attempt).as_secs_f64();
        let scale = rand::rng().random_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
        Duration::from_secs_f64(nominal * scale)
    }

    /// Decide what to do after 0-based `attempt` failed with `error`.
    pub fn decide(&self, attempt: u32, error: ErrorKind, kind: JobKind) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::GiveUp;
        }
        if attempt + 1 >= self.max_attempts_for(kind) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            after: self.backoff_with_jitter(attempt),
        }
    }
}
