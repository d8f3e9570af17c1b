//! Convenient re-exports covering the common path: define a handler, build a
//! coordinator, enqueue work.
pub use crate::{
    backoff::canonical_retry_delay,
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSet, CircuitState},
    clock::{Clock, FakeClock, SystemClock},
    config::{CoordinatorConfig, CoordinatorConfigBuilder, MAX_CONCURRENCY},
    conversation::{AddMessage, ConversationBufferManager, FlushPayload, OnFlush},
    coordinator::{Coordinator, EnqueueAck, RunState, StopOptions},
    dlq::{BatchOutcome, DlqManager, RetryOptions},
    error::{BufferError, Result as BufferResult, StoreError},
    events::{BufferEvent, EventSink, LogSink, MemorySink, MetricsSnapshot, MulticastSink, NullSink},
    handler::{ErrorAction, HandlerRegistry, MessageHandler},
    id::{MessageId, TenantId, WorkerId},
    message::{Message, MessageError, MessageState, Metadata, NewMessage, Priority},
    processor::{MessageProcessor, ProcessFailure},
    sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper},
    store::{ClaimFilter, DlqFilter, ErrorPattern, MemoryStore, MessageStore, StoreResult, StoreStats},
};

#[cfg(feature = "postgres")]
pub use crate::store::PostgresStore;
