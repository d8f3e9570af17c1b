//! Handler registration and the lifecycle contract handlers implement.

use crate::error::{BufferError, Result};
use crate::message::Message;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Network/transient error codes that `on_error`'s default implementation treats as
/// retryable. Anything else is treated as a permanent failure that should not be
/// retried just because the handler didn't say otherwise.
pub const TRANSIENT_ERROR_CODES: &[&str] =
    &["ECONNRESET", "ETIMEDOUT", "ECONNREFUSED", "EPIPE", "EAI_AGAIN"];

/// What a handler decides to do after `process` (or a prior lifecycle hook) fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Re-enqueue for another attempt, subject to `max_retries`.
    Retry,
    /// Move straight to the dead-letter queue without consuming another retry.
    DeadLetter,
    /// Treat as permanently failed; do not retry or DLQ.
    Fail,
}

/// The capability set a handler advertises to the registry and coordinator.
///
/// Default method bodies mirror the common case (no pre/post hooks, idempotent unless
/// stated otherwise) the way `rustpress_jobs`'s job handlers default most lifecycle
/// steps to no-ops and only override what matters for a given job type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// The `message_type` this handler processes. Must match the registry key it was
    /// registered under.
    fn message_type(&self) -> &str;

    /// Per-handler timeout override. `None` defers to the coordinator's configured
    /// default message timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Whether re-delivery of the same message (e.g. after a visibility timeout
    /// expiry with no ack) is safe to process again without side-effect duplication.
    fn idempotent(&self) -> bool {
        false
    }

    fn default_max_retries(&self) -> u32 {
        3
    }

    /// Structural/semantic validation before the message is admitted to processing.
    async fn validate(&self, _message: &Message) -> Result<()> {
        Ok(())
    }

    /// Runs immediately before `process`, after the circuit breaker admits the call.
    async fn before_process(&self, _message: &Message) -> Result<()> {
        Ok(())
    }

    /// Do the actual work. Returns the result payload to store alongside the message.
    async fn process(&self, message: &Message) -> Result<serde_json::Value>;

    /// Runs after a successful `process`.
    async fn after_process(&self, _message: &Message, _result: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    /// Classify a failure from `process` (or an earlier hook). The default treats
    /// known-transient network error codes as retryable and everything else as a
    /// permanent failure, matching the conservative default most job frameworks in
    /// this corpus apply when a handler doesn't opt into custom classification.
    async fn on_error(&self, _message: &Message, error: &BufferError) -> ErrorAction {
        let transient = match error {
            BufferError::Timeout { .. } | BufferError::Persistence(_) => true,
            BufferError::InvalidMessage { reason } => {
                TRANSIENT_ERROR_CODES.iter().any(|code| reason.contains(code))
            }
            _ => false,
        };

        if transient {
            ErrorAction::Retry
        } else {
            ErrorAction::Fail
        }
    }
}

/// Concurrent lookup table from message type to handler.
///
/// Backed by `dashmap` rather than a single `RwLock<HashMap<_>>` so that a lookup on
/// the processing hot path never contends with a registration happening on another
/// thread - the same rationale the circuit breaker set applies to keying breakers per
/// tenant/handler pair.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self { handlers: DashMap::new() }
    }

    /// Register a handler. Replacing an existing registration for the same message
    /// type is allowed (last-write-wins) but logged, since silently losing a handler
    /// swap is exactly the kind of surprise an operator needs to see.
    pub fn register(&self, handler: Arc<dyn MessageHandler>) {
        let message_type = handler.message_type().to_string();
        if self.handlers.insert(message_type.clone(), handler).is_some() {
            tracing::warn!(message_type = %message_type, "handler registry: replacing existing handler");
        }
    }

    pub fn lookup(&self, message_type: &str) -> Result<Arc<dyn MessageHandler>> {
        self.handlers
            .get(message_type)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BufferError::HandlerNotFound { message_type: message_type.to_string() })
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::TenantId;
    use crate::message::{Message, Metadata, NewMessage, Priority};

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        fn message_type(&self) -> &str {
            "echo"
        }

        async fn process(&self, message: &Message) -> Result<serde_json::Value> {
            Ok(message.payload.clone())
        }
    }

    fn sample_message() -> Message {
        let now = chrono::Utc::now();
        Message::new(
            NewMessage {
                tenant_id: TenantId::new(),
                message_type: "echo".into(),
                payload: serde_json::json!({"ping": true}),
                priority: Priority::Normal,
                idempotency_key: None,
                max_retries: Some(3),
                metadata: Metadata::default(),
                delay: None,
                expires_at: None,
            },
            3,
            now,
        )
        .unwrap()
    }

    #[test]
    fn lookup_fails_for_unregistered_type() {
        let registry = HandlerRegistry::new();
        let err = registry.lookup("echo").unwrap_err();
        assert!(err.is_handler_not_found());
    }

    #[test]
    fn register_then_lookup_succeeds() {
        let registry = HandlerRegistry::new();
        registry.register(Arc::new(Echo));
        assert!(registry.lookup("echo").is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn re_registering_replaces_without_error() {
        let registry = HandlerRegistry::new();
        registry.register(Arc::new(Echo));
        registry.register(Arc::new(Echo));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn default_on_error_fails_permanent_errors() {
        let handler = Echo;
        let message = sample_message();
        let err = BufferError::HandlerNotFound { message_type: "echo".into() };
        assert_eq!(handler.on_error(&message, &err).await, ErrorAction::Fail);
    }

    #[tokio::test]
    async fn default_on_error_retries_timeouts() {
        let handler = Echo;
        let message = sample_message();
        let err = BufferError::Timeout {
            message_type: "echo".into(),
            elapsed: Duration::from_secs(5),
            limit: Duration::from_secs(5),
        };
        assert_eq!(handler.on_error(&message, &err).await, ErrorAction::Retry);
    }
}
