//! Coordinator configuration, validated at construction per the enumerated
//! constraint table.

use std::time::Duration;

/// Validated configuration for a [`crate::coordinator::Coordinator`]. Construct via
/// [`CoordinatorConfigBuilder`]; there is no public constructor that bypasses
/// validation.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,
    pub retry_backoff_multiplier: f64,
    pub message_timeout: Duration,
    pub visibility_timeout: Duration,
    pub max_queue_size: u64,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub idempotency_enabled: bool,
    pub circuit_breaker_enabled: bool,
    pub circuit_breaker_threshold: usize,
    pub circuit_breaker_timeout: Duration,
    pub drain_on_shutdown: bool,
    pub shutdown_timeout: Duration,
    pub metrics_enabled: bool,
    pub metrics_interval: Duration,
}

/// Hard ceiling on `concurrency`, matching the external interface table's reference to
/// a `maxConcurrency` bound distinct from the per-instance `concurrency` setting.
pub const MAX_CONCURRENCY: usize = 1024;

impl CoordinatorConfig {
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::default()
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfigBuilder {
    concurrency: usize,
    max_retries: u32,
    retry_backoff_base: Duration,
    retry_backoff_max: Duration,
    retry_backoff_multiplier: f64,
    message_timeout: Duration,
    visibility_timeout: Duration,
    max_queue_size: u64,
    poll_interval: Duration,
    batch_size: usize,
    idempotency_enabled: bool,
    circuit_breaker_enabled: bool,
    circuit_breaker_threshold: usize,
    circuit_breaker_timeout: Duration,
    drain_on_shutdown: bool,
    shutdown_timeout: Duration,
    metrics_enabled: bool,
    metrics_interval: Duration,
}

impl Default for CoordinatorConfigBuilder {
    fn default() -> Self {
        Self {
            concurrency: 10,
            max_retries: 3,
            retry_backoff_base: Duration::from_millis(1000),
            retry_backoff_max: Duration::from_secs(300),
            retry_backoff_multiplier: 2.0,
            message_timeout: Duration::from_secs(30),
            visibility_timeout: Duration::from_secs(60),
            max_queue_size: 10_000,
            poll_interval: Duration::from_millis(1000),
            batch_size: 10,
            idempotency_enabled: true,
            circuit_breaker_enabled: true,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(30),
            drain_on_shutdown: true,
            shutdown_timeout: Duration::from_secs(30),
            metrics_enabled: false,
            metrics_interval: Duration::from_secs(60),
        }
    }
}

macro_rules! setter {
    ($name:ident, $ty:ty) => {
        pub fn $name(mut self, value: $ty) -> Self {
            self.$name = value;
            self
        }
    };
}

impl CoordinatorConfigBuilder {
    setter!(concurrency, usize);
    setter!(max_retries, u32);
    setter!(retry_backoff_base, Duration);
    setter!(retry_backoff_max, Duration);
    setter!(retry_backoff_multiplier, f64);
    setter!(message_timeout, Duration);
    setter!(visibility_timeout, Duration);
    setter!(max_queue_size, u64);
    setter!(poll_interval, Duration);
    setter!(batch_size, usize);
    setter!(idempotency_enabled, bool);
    setter!(circuit_breaker_enabled, bool);
    setter!(circuit_breaker_threshold, usize);
    setter!(circuit_breaker_timeout, Duration);
    setter!(drain_on_shutdown, bool);
    setter!(shutdown_timeout, Duration);
    setter!(metrics_enabled, bool);
    setter!(metrics_interval, Duration);

    /// Validate the enumerated constraint table. The `visibilityTimeout > messageTimeout`
    /// cross-field check exists because a claim lease shorter than the work it covers
    /// would let the stuck-sweep reclaim a message that's still legitimately processing.
    pub fn build(self) -> crate::error::Result<CoordinatorConfig> {
        use crate::error::BufferError;

        if self.concurrency < 1 || self.concurrency > MAX_CONCURRENCY {
            return Err(BufferError::InvalidConfig(format!(
                "concurrency must be between 1 and {MAX_CONCURRENCY}, got {}",
                self.concurrency
            )));
        }
        if self.retry_backoff_max < self.retry_backoff_base {
            return Err(BufferError::InvalidConfig(
                "retry_backoff_max must be >= retry_backoff_base".into(),
            ));
        }
        if self.retry_backoff_multiplier <= 1.0 {
            return Err(BufferError::InvalidConfig("retry_backoff_multiplier must be > 1".into()));
        }
        if self.message_timeout.is_zero() {
            return Err(BufferError::InvalidConfig("message_timeout must be > 0".into()));
        }
        if self.visibility_timeout <= self.message_timeout {
            return Err(BufferError::InvalidConfig(
                "visibility_timeout must be > message_timeout".into(),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(BufferError::InvalidConfig("max_queue_size must be > 0".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(BufferError::InvalidConfig("poll_interval must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(BufferError::InvalidConfig("batch_size must be > 0".into()));
        }
        if self.circuit_breaker_threshold < 1 {
            return Err(BufferError::InvalidConfig("circuit_breaker_threshold must be >= 1".into()));
        }
        if self.circuit_breaker_timeout.is_zero() {
            return Err(BufferError::InvalidConfig("circuit_breaker_timeout must be > 0".into()));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(BufferError::InvalidConfig("shutdown_timeout must be > 0".into()));
        }
        if self.metrics_enabled && self.metrics_interval.is_zero() {
            return Err(BufferError::InvalidConfig("metrics_interval must be > 0".into()));
        }

        Ok(CoordinatorConfig {
            concurrency: self.concurrency,
            max_retries: self.max_retries,
            retry_backoff_base: self.retry_backoff_base,
            retry_backoff_max: self.retry_backoff_max,
            retry_backoff_multiplier: self.retry_backoff_multiplier,
            message_timeout: self.message_timeout,
            visibility_timeout: self.visibility_timeout,
            max_queue_size: self.max_queue_size,
            poll_interval: self.poll_interval,
            batch_size: self.batch_size,
            idempotency_enabled: self.idempotency_enabled,
            circuit_breaker_enabled: self.circuit_breaker_enabled,
            circuit_breaker_threshold: self.circuit_breaker_threshold,
            circuit_breaker_timeout: self.circuit_breaker_timeout,
            drain_on_shutdown: self.drain_on_shutdown,
            shutdown_timeout: self.shutdown_timeout,
            metrics_enabled: self.metrics_enabled,
            metrics_interval: self.metrics_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build_successfully() {
        CoordinatorConfig::builder().build().unwrap();
    }

    #[test]
    fn visibility_timeout_must_exceed_message_timeout() {
        let err = CoordinatorConfig::builder()
            .message_timeout(Duration::from_secs(30))
            .visibility_timeout(Duration::from_secs(30))
            .build()
            .unwrap_err();
        assert!(matches!(err, crate::error::BufferError::InvalidConfig(_)));
    }

    #[test]
    fn multiplier_must_exceed_one() {
        let err = CoordinatorConfig::builder().retry_backoff_multiplier(1.0).build().unwrap_err();
        assert!(matches!(err, crate::error::BufferError::InvalidConfig(_)));
    }

    #[test]
    fn concurrency_out_of_range_rejected() {
        assert!(CoordinatorConfig::builder().concurrency(0).build().is_err());
        assert!(CoordinatorConfig::builder().concurrency(MAX_CONCURRENCY + 1).build().is_err());
    }

    #[test]
    fn zero_max_queue_size_rejected() {
        assert!(CoordinatorConfig::builder().max_queue_size(0).build().is_err());
    }
}
