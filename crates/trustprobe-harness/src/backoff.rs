//! Retry schedule for the reachability probe

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

/// Default delay before the second attempt
pub const DEFAULT_BASE_INTERVAL: Duration = Duration::from_millis(250);

/// Default number of attempts, including the first
pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;

/// Exponential backoff: wait `base * 2^attempt` after each failed attempt.
///
/// The last attempt is never followed by a wait, so the worst case total is
/// `base * (2^(max_attempts - 1) - 1)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffSchedule {
    base: Duration,
    max_attempts: u32,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_INTERVAL, DEFAULT_MAX_ATTEMPTS)
    }
}

impl BackoffSchedule {
    /// A schedule with at least one attempt
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait after the zero-based `attempt` failed, or None if it was the last.
    ///
    /// Long schedules saturate at `Duration::MAX` instead of dropping the wait.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt.saturating_add(1) >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt);
        Some(self.base.saturating_mul(factor))
    }

    /// All waits in order
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts).map_while(move |attempt| self.delay_after(attempt))
    }

    /// Sum of all waits when every attempt fails
    pub fn total_wait(&self) -> Duration {
        self.delays()
            .fold(Duration::ZERO, |total, delay| total.saturating_add(delay))
    }
}

/// Suspends the probe between attempts
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested waits and returns immediately
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every wait requested so far, in order
    pub fn recorded(&self) -> Vec<Duration> {
        self.slept.lock().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().push(duration);
    }
}
