use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use workbuffer::prelude::*;

struct Echo;

#[async_trait]
impl MessageHandler for Echo {
    fn message_type(&self) -> &str {
        "echo"
    }

    async fn process(&self, message: &Message) -> BufferResult<serde_json::Value> {
        Ok(message.payload.clone())
    }
}

fn echo_message(tenant: TenantId) -> NewMessage {
    NewMessage {
        tenant_id: tenant,
        message_type: "echo".into(),
        payload: serde_json::json!({"n": 1}),
        priority: Priority::Normal,
        idempotency_key: None,
        max_retries: Some(3),
        metadata: Metadata::default(),
        delay: None,
        expires_at: None,
    }
}

#[tokio::test]
async fn start_enqueue_stop_drains_in_flight_work() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(HandlerRegistry::new());
    registry.register(Arc::new(Echo));
    let config = CoordinatorConfig::builder().poll_interval(Duration::from_millis(10)).build().unwrap();
    let sink = Arc::new(MemorySink::new());
    let coordinator = Arc::new(Coordinator::with_sink(store, registry, config, sink.clone()));

    coordinator.start().await.unwrap();
    assert_eq!(coordinator.state().await, RunState::Running);

    let tenant = TenantId::new();
    let ack = coordinator.enqueue(echo_message(tenant)).await.unwrap();
    assert!(!ack.duplicate);

    let mut saw_completed = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if sink.events().iter().any(|e| matches!(e, BufferEvent::Completed { .. })) {
            saw_completed = true;
            break;
        }
    }
    assert!(saw_completed, "message should complete within the polling window");

    coordinator.stop(StopOptions::default()).await.unwrap();
    assert_eq!(coordinator.state().await, RunState::Stopped);

    assert!(sink.events().iter().any(|e| matches!(e, BufferEvent::Started { .. })));
    assert!(sink.events().iter().any(|e| matches!(e, BufferEvent::Stopped { .. })));
}

struct SlowEcho;

#[async_trait]
impl MessageHandler for SlowEcho {
    fn message_type(&self) -> &str {
        "slow"
    }

    async fn process(&self, message: &Message) -> BufferResult<serde_json::Value> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(message.payload.clone())
    }
}

#[tokio::test]
async fn enqueue_during_drain_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(HandlerRegistry::new());
    registry.register(Arc::new(SlowEcho));
    let config = CoordinatorConfig::builder().poll_interval(Duration::from_millis(10)).build().unwrap();
    let coordinator = Arc::new(Coordinator::new(store, registry, config));

    coordinator.start().await.unwrap();

    let mut msg = echo_message(TenantId::new());
    msg.message_type = "slow".into();
    coordinator.enqueue(msg).await.unwrap();

    // Give the poll loop a chance to claim the slow message before we start draining.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stopping = coordinator.clone();
    let stop_handle =
        tokio::spawn(async move { stopping.stop(StopOptions { drain: true, timeout: Duration::from_secs(2) }).await });

    let mut saw_rejection = false;
    for _ in 0..50 {
        if coordinator.state().await == RunState::ShuttingDown {
            let err = coordinator.enqueue(echo_message(TenantId::new())).await.unwrap_err();
            assert!(matches!(err, BufferError::ShutdownInProgress));
            saw_rejection = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(saw_rejection, "expected to observe SHUTTING_DOWN before drain completed");

    stop_handle.await.unwrap().unwrap();
    assert_eq!(coordinator.state().await, RunState::Stopped);
}

struct AlwaysFails;

#[async_trait]
impl MessageHandler for AlwaysFails {
    fn message_type(&self) -> &str {
        "always-fails"
    }

    async fn process(&self, _message: &Message) -> BufferResult<serde_json::Value> {
        Err(BufferError::InvalidMessage { reason: "boom".into() })
    }
}

#[tokio::test]
async fn exhausted_retries_promote_to_dlq() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(HandlerRegistry::new());
    registry.register(Arc::new(AlwaysFails));
    let config = CoordinatorConfig::builder()
        .poll_interval(Duration::from_millis(10))
        .retry_backoff_base(Duration::from_millis(5))
        .retry_backoff_max(Duration::from_millis(20))
        .build()
        .unwrap();
    let sink = Arc::new(MemorySink::new());
    let coordinator = Arc::new(Coordinator::with_sink(store, registry, config, sink.clone()));
    coordinator.start().await.unwrap();

    let mut msg = echo_message(TenantId::new());
    msg.message_type = "always-fails".into();
    msg.max_retries = Some(2);
    coordinator.enqueue(msg).await.unwrap();

    let mut saw_dlq = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if sink.events().iter().any(|e| matches!(e, BufferEvent::Dlq { .. })) {
            saw_dlq = true;
            break;
        }
    }
    assert!(saw_dlq, "a non-retryable failure must promote straight to the DLQ");

    // `AlwaysFails` raises `InvalidMessage` with no transient error code, so the
    // default `on_error` classifies it `Fail` - it must not consume any of the
    // maxRetries=2 budget before landing in the DLQ.
    let failed_count = sink.events().iter().filter(|e| matches!(e, BufferEvent::Failed { will_retry: true, .. })).count();
    assert_eq!(failed_count, 0, "a non-retryable failure must not retry before exhaustion");

    let dlq_reason = sink.events().iter().find_map(|e| match e {
        BufferEvent::Dlq { reason, .. } => Some(reason.clone()),
        _ => None,
    });
    assert!(
        dlq_reason.as_deref().is_some_and(|r| r.starts_with("non-retryable failure")),
        "expected a non-retryable-failure reason, got {dlq_reason:?}"
    );

    coordinator.stop(StopOptions::default()).await.unwrap();
}

struct CountingFailure {
    calls: AtomicUsize,
}

#[async_trait]
impl MessageHandler for CountingFailure {
    fn message_type(&self) -> &str {
        "flaky-shared"
    }

    async fn process(&self, _message: &Message) -> BufferResult<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(BufferError::InvalidMessage { reason: "always broken".into() })
    }

    // Simulates a handler that considers its own failures transient, so the breaker
    // (not the retry classifier) is what needs to accumulate enough failures to trip.
    async fn on_error(&self, _message: &Message, _error: &BufferError) -> ErrorAction {
        ErrorAction::Retry
    }
}

#[tokio::test]
async fn tenant_breaker_isolation_does_not_starve_other_tenants() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(HandlerRegistry::new());
    let handler = Arc::new(CountingFailure { calls: AtomicUsize::new(0) });
    registry.register(handler.clone());
    let config = CoordinatorConfig::builder()
        .poll_interval(Duration::from_millis(10))
        .retry_backoff_base(Duration::from_millis(1))
        .retry_backoff_max(Duration::from_millis(5))
        .circuit_breaker_threshold(3)
        .circuit_breaker_timeout(Duration::from_secs(60))
        .build()
        .unwrap();
    let sink = Arc::new(MemorySink::new());
    let coordinator = Arc::new(Coordinator::with_sink(store, registry, config, sink.clone()));
    coordinator.start().await.unwrap();

    let tenant_a = TenantId::new();
    let mut msg_a = echo_message(tenant_a);
    msg_a.message_type = "flaky-shared".into();
    msg_a.max_retries = Some(10);
    coordinator.enqueue(msg_a).await.unwrap();

    // Let tenant A's breaker trip open on its own repeated failures.
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if coordinator.circuit_breakers().state_of(tenant_a, "flaky-shared") == Some(CircuitState::Open) {
            break;
        }
    }
    assert_eq!(coordinator.circuit_breakers().state_of(tenant_a, "flaky-shared"), Some(CircuitState::Open));

    let tenant_b = TenantId::new();
    let mut msg_b = echo_message(tenant_b);
    msg_b.message_type = "flaky-shared".into();
    msg_b.max_retries = Some(10);
    coordinator.enqueue(msg_b).await.unwrap();

    let mut saw_failed_from_handler = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let calls_before = handler.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        if handler.calls.load(Ordering::SeqCst) > calls_before {
            saw_failed_from_handler = true;
            break;
        }
    }
    assert!(saw_failed_from_handler, "tenant B's handler invocations must not be blocked by tenant A's open breaker");
    assert_eq!(coordinator.circuit_breakers().state_of(tenant_b, "flaky-shared"), Some(CircuitState::Closed));

    coordinator.stop(StopOptions::default()).await.unwrap();
}

#[tokio::test]
async fn queue_full_is_rejected_before_any_worker_runs() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(HandlerRegistry::new());
    registry.register(Arc::new(Echo));
    let config = CoordinatorConfig::builder().max_queue_size(1).build().unwrap();
    let coordinator = Arc::new(Coordinator::new(store, registry, config));

    let tenant = TenantId::new();
    coordinator.enqueue(echo_message(tenant)).await.unwrap();
    let err = coordinator.enqueue(echo_message(tenant)).await.unwrap_err();
    assert!(err.is_queue_full());
}
