//! The Work Buffer Coordinator: admission control, the polling loop, worker task
//! lifecycle, and the periodic sweeps (stuck-message release, metrics, cleanup).

use crate::backoff::canonical_retry_delay;
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerSet};
use crate::clock::{Clock, SystemClock};
use crate::config::CoordinatorConfig;
use crate::error::{BufferError, Result};
use crate::events::{BufferEvent, EventSink, MetricsSnapshot, NullSink};
use crate::handler::HandlerRegistry;
use crate::id::WorkerId;
use crate::message::{Message, MessageError, MessageState, NewMessage};
use crate::processor::{MessageProcessor, ProcessFailure};
use crate::store::{ClaimFilter, MessageStore};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What the Coordinator returns from `Enqueue`, mirroring the external interface's
/// `{messageId, type, state, duplicate?}` response shape.
#[derive(Debug, Clone)]
pub struct EnqueueAck {
    pub message: Message,
    pub duplicate: bool,
}

/// Runtime lifecycle state. `Stopped` is both the initial and final state; there is no
/// way back to `Running` from `ShuttingDown`/`Stopped` short of constructing a new
/// Coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Running,
    ShuttingDown,
}

struct Counters {
    active_workers: AtomicUsize,
    completed_total: AtomicU64,
    failed_total: AtomicU64,
    dlq_total: AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            active_workers: AtomicUsize::new(0),
            completed_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
            dlq_total: AtomicU64::new(0),
        }
    }
}

/// Options accepted by [`Coordinator::stop`].
#[derive(Debug, Clone, Copy)]
pub struct StopOptions {
    pub drain: bool,
    pub timeout: Duration,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self { drain: true, timeout: Duration::from_secs(30) }
    }
}

/// Owns the store, handler registry, and breaker set for one work buffer instance, and
/// drives admission, polling, and the periodic sweeps. `S` is generic over the store
/// backend so the same coordinator logic runs against [`crate::store::MemoryStore`] in
/// tests and [`crate::store::PostgresStore`] in production.
pub struct Coordinator<S: MessageStore + 'static> {
    store: Arc<S>,
    handlers: Arc<HandlerRegistry>,
    breakers: Arc<CircuitBreakerSet>,
    processor: Arc<MessageProcessor>,
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    worker_id: WorkerId,
    state: Arc<AsyncMutex<RunState>>,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
    tasks: Arc<AsyncMutex<Vec<JoinHandle<()>>>>,
    /// Wakes the poll loop early. `enqueue` notifies after a successful insert so a
    /// worker slot sitting idle between polls doesn't wait out a full `poll_interval`
    /// before picking up freshly admitted work.
    poll_wake: Arc<Notify>,
}

impl<S: MessageStore + 'static> Coordinator<S> {
    pub fn new(store: Arc<S>, handlers: Arc<HandlerRegistry>, config: CoordinatorConfig) -> Self {
        Self::with_sink(store, handlers, config, Arc::new(NullSink))
    }

    pub fn with_sink(
        store: Arc<S>,
        handlers: Arc<HandlerRegistry>,
        config: CoordinatorConfig,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let breaker_config = CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker_threshold,
            recovery_timeout: config.circuit_breaker_timeout,
            ..Default::default()
        };
        let breakers = Arc::new(CircuitBreakerSet::new(breaker_config));
        let processor = Arc::new(
            MessageProcessor::new(handlers.clone(), breakers.clone(), config.message_timeout)
                .with_circuit_breaker_enabled(config.circuit_breaker_enabled),
        );

        Self {
            store,
            handlers,
            breakers,
            processor,
            config,
            clock: Arc::new(SystemClock),
            sink,
            worker_id: WorkerId::new(),
            state: Arc::new(AsyncMutex::new(RunState::Stopped)),
            shutdown: CancellationToken::new(),
            counters: Arc::new(Counters::default()),
            tasks: Arc::new(AsyncMutex::new(Vec::new())),
            poll_wake: Arc::new(Notify::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn state(&self) -> RunState {
        *self.state.lock().await
    }

    /// The per-`(tenant, handler type)` breaker set backing this coordinator's
    /// processor, exposed for operators and tests that need to inspect or reset
    /// breaker state directly (e.g. the management interface's admin `Reset`).
    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerSet> {
        &self.breakers
    }

    /// Start the polling loop and periodic sweeps as independent background tasks.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state == RunState::Running {
            return Ok(());
        }
        *state = RunState::Running;
        drop(state);

        self.sink.emit(BufferEvent::Started { worker_id: self.worker_id });

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.spawn_poll_loop());
        tasks.push(self.spawn_stuck_sweep());
        tasks.push(self.spawn_cleanup_job());
        if self.config.metrics_enabled {
            tasks.push(self.spawn_metrics_emitter());
        }

        Ok(())
    }

    /// Transition to `ShuttingDown`, stop accepting new admissions, then optionally
    /// drain outstanding worker tasks up to `opts.timeout` before moving to `Stopped`.
    pub async fn stop(self: &Arc<Self>, opts: StopOptions) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state == RunState::Stopped {
                return Ok(());
            }
            *state = RunState::ShuttingDown;
        }

        self.shutdown.cancel();

        if opts.drain {
            let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().await);
            let drain = async {
                for handle in handles {
                    let _ = handle.await;
                }
            };
            if tokio::time::timeout(opts.timeout, drain).await.is_err() {
                tracing::warn!("shutdown drain timed out, remaining tasks abandoned to cancellation");
            }
        }

        *self.state.lock().await = RunState::Stopped;
        self.sink.emit(BufferEvent::Stopped { worker_id: self.worker_id });
        Ok(())
    }

    /// Admission control per the external interface: rejects while shutting down,
    /// enforces the approximate `maxQueueSize` budget, normalizes priority, and
    /// resolves idempotency conflicts to the existing record rather than erroring.
    pub async fn enqueue(&self, new: NewMessage) -> Result<EnqueueAck> {
        if self.state().await == RunState::ShuttingDown {
            return Err(BufferError::ShutdownInProgress);
        }

        let now = self.clock.now();
        let stats = self.store.get_stats(None, now).await?;
        if stats.pending >= self.config.max_queue_size {
            return Err(BufferError::QueueFull { pending: stats.pending, max_queue_size: self.config.max_queue_size });
        }

        let tenant_id = new.tenant_id;
        let mut new = new;
        if !self.config.idempotency_enabled {
            new.idempotency_key = None;
        }
        let idempotency_key = new.idempotency_key.clone();

        // Per-message `max_retries` wins when supplied; otherwise fall back to the
        // handler's declared default cap, and only to the coordinator's configured
        // default if no handler is registered yet for this type.
        let default_max_retries = self
            .handlers
            .lookup(&new.message_type)
            .map(|handler| handler.default_max_retries())
            .unwrap_or(self.config.max_retries);

        let message =
            Message::new(new, default_max_retries, now).map_err(|reason| BufferError::InvalidMessage { reason })?;

        let ack = match self.store.create(message).await {
            Ok(message) => {
                self.sink.emit(BufferEvent::Enqueued {
                    message_id: message.id,
                    message_type: message.message_type.clone(),
                    priority: message.priority,
                });
                if self.counters.active_workers.load(Ordering::Acquire) < self.config.concurrency {
                    self.poll_wake.notify_one();
                }
                EnqueueAck { message, duplicate: false }
            }
            Err(crate::error::StoreError::IdempotencyConflict { .. }) => {
                let key = idempotency_key.ok_or(BufferError::InvalidMessage {
                    reason: "idempotency conflict reported without a key".into(),
                })?;
                let existing = self
                    .store
                    .find_by_idempotency_key(tenant_id, &key)
                    .await?
                    .ok_or(BufferError::DuplicateMessage { existing_id: crate::id::MessageId::new() })?;
                EnqueueAck { message: existing, duplicate: true }
            }
            Err(other) => return Err(other.into()),
        };

        Ok(ack)
    }

    fn spawn_poll_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.poll_loop().await })
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut interval = self.config.poll_interval;
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let available = self.config.concurrency.saturating_sub(self.counters.active_workers.load(Ordering::Acquire));
            if available == 0 {
                if self.poll_sleep_or_stop(interval).await {
                    return;
                }
                continue;
            }

            let batch_limit = available.min(self.config.batch_size);
            let claimed = self
                .store
                .claim_next_batch(
                    ClaimFilter::default(),
                    batch_limit,
                    self.worker_id,
                    chrono::Duration::from_std(self.config.visibility_timeout).unwrap_or(chrono::Duration::zero()),
                    self.clock.now(),
                )
                .await;

            match claimed {
                Ok(messages) => {
                    interval = self.config.poll_interval;
                    for message in messages {
                        self.spawn_worker(message).await;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "claim_next_batch failed, backing off");
                    interval = self.config.poll_interval * 5;
                }
            }

            if self.poll_sleep_or_stop(interval).await {
                return;
            }
        }
    }

    /// Returns `true` if shutdown fired while sleeping.
    async fn sleep_or_stop(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.shutdown.cancelled() => true,
        }
    }

    /// Like [`Self::sleep_or_stop`], but also wakes early when `enqueue` signals that a
    /// message was admitted while a worker slot was free, instead of waiting out the
    /// rest of `poll_interval`.
    async fn poll_sleep_or_stop(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.poll_wake.notified() => false,
            _ = self.shutdown.cancelled() => true,
        }
    }

    async fn spawn_worker(self: &Arc<Self>, message: Message) {
        self.counters.active_workers.fetch_add(1, Ordering::AcqRel);
        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.run_worker(message).await;
            this.counters.active_workers.fetch_sub(1, Ordering::AcqRel);
        });
        self.tasks.lock().await.push(handle);
    }

    async fn run_worker(self: &Arc<Self>, message: Message) {
        self.sink.emit(BufferEvent::Processing {
            message_id: message.id,
            message_type: message.message_type.clone(),
            attempt_count: message.attempts,
        });

        let started = Instant::now();
        let result = self.processor.process(&message, self.shutdown.child_token()).await;
        let now = self.clock.now();

        match result {
            Ok(value) => {
                if let Err(err) = self.store.complete(message.id, value.clone(), now).await {
                    tracing::error!(message_id = %message.id, error = %err, "failed to persist completion");
                    return;
                }
                self.counters.completed_total.fetch_add(1, Ordering::Relaxed);
                self.sink.emit(BufferEvent::Completed {
                    message_id: message.id,
                    message_type: message.message_type.clone(),
                    result: value,
                    processing_time: started.elapsed(),
                });
            }
            Err(failure) => self.handle_failure(&message, failure, now).await,
        }
    }

    async fn handle_failure(&self, message: &Message, failure: ProcessFailure, now: chrono::DateTime<chrono::Utc>) {
        let ProcessFailure { error: err, retryable } = failure;
        let attempt = message.attempts;
        // A non-retryable classification (handler's `on_error`, or the error's own
        // `is_retryable()` for failures that never reached a handler) is advisory per
        // the handler contract: it fails fast without consuming the retry budget,
        // regardless of how many attempts remain.
        let retries_exhausted = message.retries_exhausted() || !retryable;
        let will_retry = !retries_exhausted;

        // n is the zero-indexed count of prior failures: the first failure uses n=0
        // (the base delay), matching the backoff formula's documented attempt numbering.
        let retry_delay = will_retry.then(|| {
            canonical_retry_delay(
                self.config.retry_backoff_base,
                self.config.retry_backoff_multiplier,
                self.config.retry_backoff_max,
                attempt.saturating_sub(1),
            )
        });

        let message_error = MessageError::new(err.to_string(), attempt);
        let next_visible_at = retry_delay.map(|delay| now + chrono::Duration::from_std(delay).unwrap_or_default());

        if let Err(store_err) = self.store.fail(message.id, message_error, next_visible_at, now).await {
            tracing::error!(message_id = %message.id, error = %store_err, "failed to persist failure");
            return;
        }

        self.counters.failed_total.fetch_add(1, Ordering::Relaxed);
        self.sink.emit(BufferEvent::Failed {
            message_id: message.id,
            message_type: message.message_type.clone(),
            error: err.to_string(),
            will_retry,
            retry_delay,
        });

        if retries_exhausted {
            if let Err(store_err) = self.store.dead_letter(message.id, now).await {
                tracing::error!(message_id = %message.id, error = %store_err, "failed to move message to dlq");
                return;
            }
            self.counters.dlq_total.fetch_add(1, Ordering::Relaxed);
            let reason = if message.retries_exhausted() {
                format!("Max retries ({}) exceeded", message.max_retries)
            } else {
                format!("non-retryable failure: {err}")
            };
            self.sink.emit(BufferEvent::Dlq { message_id: message.id, message_type: message.message_type.clone(), reason });
        }
    }

    fn spawn_stuck_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let interval = (this.config.visibility_timeout / 2).max(Duration::from_millis(1));
        tokio::spawn(async move {
            loop {
                if this.sleep_or_stop(interval).await {
                    return;
                }
                let now = this.clock.now();
                let older_than = now - chrono::Duration::from_std(this.config.visibility_timeout).unwrap_or_default();
                let retry_delay = chrono::Duration::from_std(this.config.retry_backoff_base).unwrap_or_default();
                match this.store.release_stale(older_than, retry_delay, now).await {
                    Ok(count) if count > 0 => tracing::info!(count, "released stuck messages"),
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "stuck message sweep failed"),
                }
            }
        })
    }

    fn spawn_cleanup_job(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let interval = Duration::from_secs(3600);
            loop {
                if this.sleep_or_stop(interval).await {
                    return;
                }
                match this.store.cleanup_expired(this.clock.now()).await {
                    Ok(count) if count > 0 => tracing::info!(count, "cleaned up expired messages"),
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "cleanup job failed"),
                }
            }
        })
    }

    fn spawn_metrics_emitter(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                if this.sleep_or_stop(this.config.metrics_interval).await {
                    return;
                }
                let now = this.clock.now();
                let queue_depth = this.store.get_stats(None, now).await.map(|s| s.pending).unwrap_or(0);
                this.sink.emit(BufferEvent::Metrics(MetricsSnapshot {
                    queue_depth,
                    active_workers: this.counters.active_workers.load(Ordering::Acquire),
                    completed_total: this.counters.completed_total.load(Ordering::Relaxed),
                    failed_total: this.counters.failed_total.load(Ordering::Relaxed),
                    dlq_total: this.counters.dlq_total.load(Ordering::Relaxed),
                }));
            }
        })
    }
}
