//! Dispatches one claimed message to its handler under breaker, timeout, and
//! cancellation policy.

use crate::circuit_breaker::CircuitBreakerSet;
use crate::error::BufferError;
use crate::handler::{ErrorAction, HandlerRegistry};
use crate::message::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A failed [`MessageProcessor::process`] call, carrying both the underlying error and
/// the handler's (or breaker's) verdict on whether it's worth retrying. Callers that
/// only care about the error kind can use the forwarding predicates below; the
/// coordinator additionally consults `retryable` to decide `will_retry`/DLQ promotion.
#[derive(Debug)]
pub struct ProcessFailure {
    pub error: BufferError,
    pub retryable: bool,
}

impl std::fmt::Display for ProcessFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.error, f)
    }
}

impl std::error::Error for ProcessFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl ProcessFailure {
    pub fn is_circuit_open(&self) -> bool {
        self.error.is_circuit_open()
    }

    pub fn is_timeout(&self) -> bool {
        self.error.is_timeout()
    }

    pub fn is_cancelled(&self) -> bool {
        self.error.is_cancelled()
    }

    pub fn is_handler_not_found(&self) -> bool {
        self.error.is_handler_not_found()
    }
}

/// `?` on a bare `BufferError` (e.g. the handler lookup at the top of `process`) always
/// means "not even dispatched" - never retryable in the sense of consuming budget, but
/// also never a classification `on_error` gets a say in.
impl From<BufferError> for ProcessFailure {
    fn from(error: BufferError) -> Self {
        let retryable = error.is_retryable();
        Self { error, retryable }
    }
}

type ProcessResult = std::result::Result<serde_json::Value, ProcessFailure>;

/// Executes the processing sequence for one message. Stateless beyond the registry and
/// breaker set it was handed - a `Coordinator` owns one of these and shares it across
/// every worker task.
pub struct MessageProcessor {
    handlers: Arc<HandlerRegistry>,
    breakers: Arc<CircuitBreakerSet>,
    message_timeout: Duration,
    circuit_breaker_enabled: bool,
}

impl MessageProcessor {
    pub fn new(handlers: Arc<HandlerRegistry>, breakers: Arc<CircuitBreakerSet>, message_timeout: Duration) -> Self {
        Self { handlers, breakers, message_timeout, circuit_breaker_enabled: true }
    }

    /// Disable breaker consultation entirely, per the `circuitBreakerEnabled` config
    /// switch - the handler still runs under timeout/cancellation, it just never
    /// consults or updates a breaker.
    pub fn with_circuit_breaker_enabled(mut self, enabled: bool) -> Self {
        self.circuit_breaker_enabled = enabled;
        self
    }

    /// Run the full handler lifecycle for `message`. `parent_cancellation` composes
    /// with an internally-created timeout/shutdown token: cancelling either fires the
    /// combined signal, matching the "cancellation of any one propagates" rule.
    pub async fn process(&self, message: &Message, parent_cancellation: CancellationToken) -> ProcessResult {
        let handler = self.handlers.lookup(&message.message_type)?;

        let effective_timeout = match handler.timeout() {
            Some(handler_timeout) => handler_timeout.min(self.message_timeout),
            None => self.message_timeout,
        };

        let tenant_id = message.tenant_id;
        let handler_type = message.message_type.clone();

        let run_once = || {
            let parent_cancellation = parent_cancellation.clone();
            async {
                handler.validate(message).await?;
                handler.before_process(message).await?;

                let child_cancellation = parent_cancellation.child_token();
                let result = tokio::select! {
                    biased;
                    _ = parent_cancellation.cancelled() => {
                        child_cancellation.cancel();
                        Err(BufferError::Cancelled(message.id))
                    }
                    timed = tokio::time::timeout(effective_timeout, handler.process(message)) => {
                        match timed {
                            Ok(result) => result,
                            Err(_) => {
                                child_cancellation.cancel();
                                Err(BufferError::Timeout {
                                    message_type: message.message_type.clone(),
                                    elapsed: effective_timeout,
                                    limit: effective_timeout,
                                })
                            }
                        }
                    }
                };

                match result {
                    Ok(value) => {
                        handler.after_process(message, &value).await?;
                        Ok(value)
                    }
                    Err(err) => Err(err),
                }
            }
        };

        let outcome = if self.circuit_breaker_enabled {
            self.breakers.execute(tenant_id, &handler_type, run_once).await
        } else {
            run_once().await
        };

        match outcome {
            Ok(value) => Ok(value),
            Err(err) => {
                // The breaker already recorded this failure. `on_error` only decides
                // whether the caller should treat it as retryable, it never reopens or
                // suppresses the breaker's own bookkeeping. A breaker-open rejection
                // never reached the handler at all, so it's always worth retrying once
                // the breaker allows a probe again - `on_error` never sees it.
                let retryable = if err.is_circuit_open() {
                    true
                } else {
                    matches!(handler.on_error(message, &err).await, ErrorAction::Retry)
                };
                Err(ProcessFailure { error: err, retryable })
            }
        }
    }
}
