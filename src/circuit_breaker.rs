//! Per-(tenant, handler) circuit breakers with lock-free atomics.
//!
//! The state machine (CLOSED/OPEN/HALF_OPEN, CAS transitions, half-open call limiting)
//! is carried over directly from the resilience crate this project started from - it
//! already implements the exact transition table this buffer needs. What's new here is
//! keying: instead of one breaker per process, [`CircuitBreakerSet`] lazily creates one
//! breaker per `(tenant_id, handler_type)` pair so that one tenant's failing handler
//! can't trip the breaker for every other tenant calling the same handler type.

use crate::error::BufferError;
use crate::id::TenantId;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Clock abstraction so circuit breaker timing can be faked in tests. Deliberately
/// separate from [`crate::clock::Clock`]: breaker recovery only cares about elapsed
/// monotonic time, never wall-clock time, so it can't be skewed by a system clock
/// adjustment the way a `DateTime<Utc>`-based clock could.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Monotonic clock backed by `Instant::now()`.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, recovery_timeout: Duration::from_secs(30), half_open_max_calls: 1 }
    }
}

struct CircuitBreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    half_open_calls: AtomicUsize,
}

/// A single breaker, identified by the `(tenant_id, handler_type)` key it was created
/// under in [`CircuitBreakerSet`].
#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<CircuitBreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(CircuitBreakerState {
                state: AtomicU8::new(STATE_CLOSED),
                failure_count: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                half_open_calls: AtomicUsize::new(0),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn state(&self) -> CircuitState {
        match self.state.state.load(Ordering::Acquire) {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => unreachable!("invalid circuit breaker state"),
        }
    }

    pub fn failure_count(&self) -> usize {
        self.state.failure_count.load(Ordering::Acquire)
    }

    /// Administratively force the breaker back to CLOSED, clearing failure history.
    /// Used by the DLQ/management interface's explicit reset operation.
    pub fn reset(&self) {
        self.state.state.store(STATE_CLOSED, Ordering::Release);
        self.state.failure_count.store(0, Ordering::Release);
        self.state.opened_at_millis.store(0, Ordering::Release);
        self.state.half_open_calls.store(0, Ordering::Release);
    }

    pub async fn execute<T, Fut, Op>(
        &self,
        tenant_id: TenantId,
        handler_type: &str,
        mut operation: Op,
    ) -> Result<T, BufferError>
    where
        T: Send,
        Fut: Future<Output = Result<T, BufferError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        loop {
            let current_state = self.state.state.load(Ordering::Acquire);

            match current_state {
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let now = self.now_millis();
                    let elapsed = now.saturating_sub(opened_at);

                    if elapsed >= self.config.recovery_timeout.as_millis() as u64 {
                        match self.state.state.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                tracing::info!(
                                    tenant_id = %tenant_id,
                                    handler_type,
                                    "circuit breaker -> half-open"
                                );
                                self.state.half_open_calls.store(1, Ordering::Release);
                                break;
                            }
                            Err(STATE_HALF_OPEN) => continue,
                            Err(STATE_CLOSED) => break,
                            Err(_) => unreachable!("invalid state transition"),
                        }
                    } else {
                        return Err(BufferError::CircuitOpen {
                            tenant_id,
                            handler_type: handler_type.to_string(),
                            failure_count: self.state.failure_count.load(Ordering::Acquire),
                            retry_after: self.config.recovery_timeout - Duration::from_millis(elapsed),
                        });
                    }
                }
                STATE_HALF_OPEN => {
                    let current = self.state.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if current >= self.config.half_open_max_calls {
                        self.state.half_open_calls.fetch_sub(1, Ordering::Release);
                        return Err(BufferError::CircuitOpen {
                            tenant_id,
                            handler_type: handler_type.to_string(),
                            failure_count: self.state.failure_count.load(Ordering::Acquire),
                            retry_after: Duration::from_millis(0),
                        });
                    }
                    break;
                }
                STATE_CLOSED => break,
                _ => unreachable!("invalid circuit breaker state"),
            }
        }

        let was_half_open = self.state.state.load(Ordering::Acquire) == STATE_HALF_OPEN;
        let result = operation().await;

        if was_half_open {
            self.state.half_open_calls.fetch_sub(1, Ordering::Release);
        }

        match &result {
            Ok(_) => self.on_success(tenant_id, handler_type),
            Err(_) => self.on_failure(tenant_id, handler_type),
        }

        result
    }

    fn on_success(&self, tenant_id: TenantId, handler_type: &str) {
        let current = self.state.state.load(Ordering::Acquire);

        match current {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.failure_count.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    tracing::info!(tenant_id = %tenant_id, handler_type, "circuit breaker -> closed");
                }
            }
            STATE_CLOSED => {
                self.state.failure_count.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn on_failure(&self, tenant_id: TenantId, handler_type: &str) {
        let current = self.state.state.load(Ordering::Acquire);
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;

        match current {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.opened_at_millis.store(self.now_millis(), Ordering::Release);
                    tracing::warn!(tenant_id = %tenant_id, handler_type, failures, "circuit breaker: test failed -> open");
                }
            }
            STATE_CLOSED => {
                if failures >= self.config.failure_threshold {
                    if self
                        .state
                        .state
                        .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.state.opened_at_millis.store(self.now_millis(), Ordering::Release);
                        tracing::error!(
                            tenant_id = %tenant_id,
                            handler_type,
                            failures,
                            threshold = self.config.failure_threshold,
                            "circuit breaker -> open"
                        );
                    }
                }
            }
            _ => {}
        }
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}

/// Owns one [`CircuitBreaker`] per `(tenant_id, handler_type)` pair, created lazily on
/// first use. Keyed with `dashmap` for the same no-global-lock reason as the handler
/// registry.
pub struct CircuitBreakerSet {
    breakers: DashMap<(TenantId, String), CircuitBreaker>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerSet {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { breakers: DashMap::new(), config }
    }

    fn get_or_create(&self, tenant_id: TenantId, handler_type: &str) -> CircuitBreaker {
        self.breakers
            .entry((tenant_id, handler_type.to_string()))
            .or_insert_with(|| CircuitBreaker::new(self.config.clone()))
            .clone()
    }

    pub async fn execute<T, Fut, Op>(
        &self,
        tenant_id: TenantId,
        handler_type: &str,
        operation: Op,
    ) -> Result<T, BufferError>
    where
        T: Send,
        Fut: Future<Output = Result<T, BufferError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let breaker = self.get_or_create(tenant_id, handler_type);
        breaker.execute(tenant_id, handler_type, operation).await
    }

    /// Administratively reset the breaker for a specific tenant/handler pair, per the
    /// management interface's `reset` operation. A no-op if none has been created yet.
    pub fn reset(&self, tenant_id: TenantId, handler_type: &str) {
        if let Some(breaker) = self.breakers.get(&(tenant_id, handler_type.to_string())) {
            breaker.reset();
        }
    }

    pub fn state_of(&self, tenant_id: TenantId, handler_type: &str) -> Option<CircuitState> {
        self.breakers.get(&(tenant_id, handler_type.to_string())).map(|b| b.state())
    }
}
