//! Bounded retry policy for modem steps that may need several tries

use std::time::Duration;
use tokio::time::sleep;

/// How many times to try and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Start counting attempts against this policy
    pub fn start(&self) -> Retry {
        Retry {
            policy: *self,
            attempts: 0,
        }
    }
}

/// Typed result of a retried step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    Exhausted { attempts: u32 },
}

/// Attempt counter for one run of a `RetryPolicy`
#[derive(Debug)]
pub struct Retry {
    policy: RetryPolicy,
    attempts: u32,
}

impl Retry {
    /// Wait out the backoff (not before the first attempt) and return the
    /// 1-based number of the next attempt, or `None` once attempts are used up.
    pub async fn next_attempt(&mut self) -> Option<u32> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        if self.attempts > 0 {
            sleep(self.policy.backoff).await;
        }
        self.attempts += 1;
        Some(self.attempts)
    }

    /// Attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }
}
