//! Event payloads emitted by the coordinator and conversation manager, and the
//! sink abstraction observers subscribe through.
//!
//! Subscriptions are process-local, matching the design notes' explicit call-out that
//! this emitter is a convenience for observers, not a durable event log.

use crate::id::{MessageId, WorkerId};
use crate::message::Priority;
use std::time::Duration;

/// One emitted occurrence. Payload keys match the enumerated set exactly so a reader
/// of this type can cross-reference the external interface listing directly.
#[derive(Debug, Clone)]
pub enum BufferEvent {
    Enqueued { message_id: MessageId, message_type: String, priority: Priority },
    Processing { message_id: MessageId, message_type: String, attempt_count: u32 },
    Completed { message_id: MessageId, message_type: String, result: serde_json::Value, processing_time: Duration },
    Failed { message_id: MessageId, message_type: String, error: String, will_retry: bool, retry_delay: Option<Duration> },
    Dlq { message_id: MessageId, message_type: String, reason: String },
    Metrics(MetricsSnapshot),
    Started { worker_id: WorkerId },
    Stopped { worker_id: WorkerId },
}

/// The `metrics` event payload. `rates`/`percentiles` are open-ended in the external
/// interface listing ("..."), represented here as the subset a coordinator can cheaply
/// compute from in-process counters without a dedicated histogram dependency.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub queue_depth: u64,
    pub active_workers: usize,
    pub completed_total: u64,
    pub failed_total: u64,
    pub dlq_total: u64,
}

/// Where a [`BufferEvent`] goes once emitted. A narrow trait so observers can be
/// swapped (logging, in-memory capture for tests, a channel to an external bus)
/// without the emitting component knowing which.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: BufferEvent);
}

/// Emits every event at `debug` (routine lifecycle) or `warn` (`Failed`/`Dlq`) via
/// `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: BufferEvent) {
        match &event {
            BufferEvent::Enqueued { message_id, message_type, priority } => {
                tracing::debug!(%message_id, message_type, ?priority, "enqueued");
            }
            BufferEvent::Processing { message_id, message_type, attempt_count } => {
                tracing::debug!(%message_id, message_type, attempt_count, "processing");
            }
            BufferEvent::Completed { message_id, message_type, processing_time, .. } => {
                tracing::debug!(%message_id, message_type, ?processing_time, "completed");
            }
            BufferEvent::Failed { message_id, message_type, error, will_retry, retry_delay } => {
                tracing::warn!(%message_id, message_type, error, will_retry, ?retry_delay, "failed");
            }
            BufferEvent::Dlq { message_id, message_type, reason } => {
                tracing::warn!(%message_id, message_type, reason, "moved to dlq");
            }
            BufferEvent::Metrics(snapshot) => {
                tracing::debug!(
                    queue_depth = snapshot.queue_depth,
                    active_workers = snapshot.active_workers,
                    completed_total = snapshot.completed_total,
                    failed_total = snapshot.failed_total,
                    dlq_total = snapshot.dlq_total,
                    "metrics"
                );
            }
            BufferEvent::Started { worker_id } => tracing::debug!(%worker_id, "started"),
            BufferEvent::Stopped { worker_id } => tracing::debug!(%worker_id, "stopped"),
        }
    }
}

/// Captures every event in order, for test assertions.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: parking_lot::Mutex<Vec<BufferEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BufferEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl Clone for BufferEvent {
    fn clone(&self) -> Self {
        match self {
            Self::Enqueued { message_id, message_type, priority } => {
                Self::Enqueued { message_id: *message_id, message_type: message_type.clone(), priority: *priority }
            }
            Self::Processing { message_id, message_type, attempt_count } => {
                Self::Processing { message_id: *message_id, message_type: message_type.clone(), attempt_count: *attempt_count }
            }
            Self::Completed { message_id, message_type, result, processing_time } => Self::Completed {
                message_id: *message_id,
                message_type: message_type.clone(),
                result: result.clone(),
                processing_time: *processing_time,
            },
            Self::Failed { message_id, message_type, error, will_retry, retry_delay } => Self::Failed {
                message_id: *message_id,
                message_type: message_type.clone(),
                error: error.clone(),
                will_retry: *will_retry,
                retry_delay: *retry_delay,
            },
            Self::Dlq { message_id, message_type, reason } => {
                Self::Dlq { message_id: *message_id, message_type: message_type.clone(), reason: reason.clone() }
            }
            Self::Metrics(snapshot) => Self::Metrics(snapshot.clone()),
            Self::Started { worker_id } => Self::Started { worker_id: *worker_id },
            Self::Stopped { worker_id } => Self::Stopped { worker_id: *worker_id },
        }
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: BufferEvent) {
        self.events.lock().push(event);
    }
}

/// Broadcasts to every registered sink, so an embedder can attach logging and
/// in-memory test capture simultaneously.
#[derive(Default)]
pub struct MulticastSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl MulticastSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Box<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for MulticastSink {
    fn emit(&self, event: BufferEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

/// Drops every event. The default when an embedder doesn't care about observability.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: BufferEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_records_events_in_order() {
        let sink = MemorySink::new();
        sink.emit(BufferEvent::Started { worker_id: WorkerId::new() });
        sink.emit(BufferEvent::Stopped { worker_id: WorkerId::new() });
        assert_eq!(sink.len(), 2);
        assert!(matches!(sink.events()[0], BufferEvent::Started { .. }));
        assert!(matches!(sink.events()[1], BufferEvent::Stopped { .. }));
    }

    #[test]
    fn multicast_sink_forwards_to_every_child() {
        let a = std::sync::Arc::new(MemorySink::new());
        let b = std::sync::Arc::new(MemorySink::new());
        let multicast = MulticastSink::new().with(Box::new(ArcSink(a.clone()))).with(Box::new(ArcSink(b.clone())));
        multicast.emit(BufferEvent::Started { worker_id: WorkerId::new() });
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    struct ArcSink(std::sync::Arc<MemorySink>);
    impl EventSink for ArcSink {
        fn emit(&self, event: BufferEvent) {
            self.0.emit(event);
        }
    }
}
