//! Backoff strategies for message retry delays.

use crate::jitter::Jitter;
use std::time::Duration;

/// Backoff strategy for retries
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Fixed delay between retries
    Constant { delay: Duration },
    /// Linearly increasing delay
    Linear { base: Duration },
    /// Exponentially increasing delay with optional cap
    Exponential { base: Duration, max: Option<Duration> },
}

impl Backoff {
    /// Create a constant backoff strategy
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    /// Create a linear backoff strategy
    pub fn linear(base: Duration) -> Self {
        Backoff::Linear { base }
    }

    /// Create an exponential backoff strategy
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, max: None }
    }

    /// Set a maximum delay for exponential backoff
    pub fn with_max(mut self, max: Duration) -> Self {
        if let Backoff::Exponential { max: ref mut m, .. } = self {
            *m = Some(max);
        }
        self
    }

    /// Calculate the delay for a given attempt number (1-indexed)
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Linear { base } => {
                // Use checked_mul to prevent overflow
                base.checked_mul(attempt as u32)
                    .unwrap_or(Duration::from_secs(u64::MAX))
            }
            Backoff::Exponential { base, max } => {
                // Calculate 2^(attempt-1) with overflow protection
                let exponent = (attempt.saturating_sub(1)) as u32;
                let multiplier = 2u32.saturating_pow(exponent);

                let exp_delay = base.checked_mul(multiplier)
                    .unwrap_or(Duration::from_secs(u64::MAX));

                if let Some(max) = max {
                    exp_delay.min(*max)
                } else {
                    exp_delay
                }
            }
        }
    }
}

/// Combines a [`Backoff`] curve with a [`Jitter`] strategy to produce the next
/// `visible_at` delay after a failed attempt.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    backoff: Backoff,
    jitter: Jitter,
}

impl RetryBackoff {
    pub fn new(backoff: Backoff, jitter: Jitter) -> Self {
        Self { backoff, jitter }
    }

    /// Delay before the next attempt (1-indexed `attempt`, the attempt number that
    /// just failed), with jitter applied.
    pub fn next_delay(&self, attempt: usize) -> Duration {
        self.jitter.apply(self.backoff.delay(attempt))
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new(
            Backoff::exponential(Duration::from_secs(1)).with_max(Duration::from_secs(300)),
            Jitter::full(),
        )
    }
}

/// The coordinator's canonical retry-delay formula: `min(base * mult^n, max)`, where
/// `n` is the attempt that just failed. Kept as a free function rather than a
/// `Backoff` variant because the multiplier is a per-coordinator config value, not a
/// fixed curve shape, and this formula applies no jitter by default (unlike the
/// general-purpose [`Backoff`]/[`Jitter`] pair above, which remain available to
/// embedders who want jittered handler-level retry policies of their own).
pub fn canonical_retry_delay(base: Duration, multiplier: f64, max: Duration, attempt: u32) -> Duration {
    let base_millis = base.as_millis() as f64;
    let scaled = base_millis * multiplier.powi(attempt as i32);
    let capped = scaled.min(max.as_millis() as f64).max(0.0);
    Duration::from_millis(capped as u64)
}
