//! The durable message store abstraction and its two implementations.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

use crate::error::StoreError;
use crate::id::{MessageId, TenantId};
use crate::message::{Message, MessageState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub type StoreResult<T> = Result<T, StoreError>;

/// Filters accepted by [`MessageStore::claim_next_batch`]: only messages matching the
/// handler types a given worker pool knows how to run are claimed, so a coordinator
/// started with a partial handler registry doesn't starve messages it can't process
/// anyway while leaving them invisible to a coordinator that could.
#[derive(Debug, Clone, Default)]
pub struct ClaimFilter {
    pub message_types: Option<Vec<String>>,
    pub tenant_id: Option<TenantId>,
}

/// Filters accepted by the DLQ management interface's `list`/`count` operations.
#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub message_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

/// Aggregate counters returned by [`MessageStore::get_stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dlq: u64,
    pub total: u64,
    pub oldest_pending_age: Option<chrono::Duration>,
}

/// One error pattern bucket returned by the DLQ management interface's
/// `error_patterns` operation.
#[derive(Debug, Clone)]
pub struct ErrorPattern {
    pub code: Option<String>,
    pub message: String,
    pub count: u64,
    pub sample_message_ids: Vec<MessageId>,
}

/// Persistence boundary for the work buffer. Implementations must provide the atomic
/// claim guarantee described on [`MessageStore::claim_next_batch`] - a conditional
/// `UPDATE ... RETURNING` for Postgres, a single critical section for the in-memory
/// backend - so that invariant P1 (no double-dispatch) holds regardless of backend.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a new message. Returns `IdempotencyConflict` if an active (non-terminal)
    /// message already exists for `(tenant_id, idempotency_key)`.
    async fn create(&self, message: Message) -> StoreResult<Message>;

    async fn get(&self, id: MessageId) -> StoreResult<Message>;

    /// Resolve a pre-existing message by its idempotency key, for callers that
    /// received `IdempotencyConflict` from `create` and need to return the original
    /// record to the producer instead of a synchronous error.
    async fn find_by_idempotency_key(&self, tenant_id: TenantId, key: &str) -> StoreResult<Option<Message>>;

    /// Atomically claim up to `limit` visible, pending messages ordered by
    /// `(priority ASC, created_at ASC)`, marking them `Processing` and stamping
    /// `processing_started_at`/`processing_worker`. No two concurrent callers may
    /// observe the same message from this call.
    async fn claim_next_batch(
        &self,
        filter: ClaimFilter,
        limit: usize,
        worker: crate::id::WorkerId,
        visibility_timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Message>>;

    /// Mark a message completed, storing its result.
    async fn complete(&self, id: MessageId, result: serde_json::Value, now: DateTime<Utc>) -> StoreResult<()>;

    /// Record a failed attempt. `next_visible_at` is `Some` to re-enqueue for retry, or
    /// `None` to move straight to a terminal `Failed` state.
    async fn fail(
        &self,
        id: MessageId,
        error: crate::message::MessageError,
        next_visible_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Move a message to the dead-letter state.
    async fn dead_letter(&self, id: MessageId, now: DateTime<Utc>) -> StoreResult<()>;

    /// Re-enqueue a dead-lettered message for another attempt, resetting `attempts`.
    /// Per the design notes' open question, this intentionally breaks terminal-state
    /// stability for `Dlq` - it is the one state an operator can still revive from.
    async fn requeue_from_dlq(&self, id: MessageId, now: DateTime<Utc>) -> StoreResult<Message>;

    /// Sweep messages in `Processing` whose visibility timeout has elapsed
    /// (`processing_started_at <= older_than`) and apply the same retry-budget
    /// decision `fail` would: back to `Pending` with a `MESSAGE_TIMEOUT` error and
    /// `visible_at = now + retry_delay` if attempts remain, otherwise terminal
    /// `Failed`. Returns the count that elected to retry (matches
    /// `ReleaseStuckMessages`'s documented return value - non-retrying messages
    /// became `Failed` but are not counted).
    async fn release_stale(
        &self,
        older_than: DateTime<Utc>,
        retry_delay: chrono::Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Permanently delete expired `Completed`/`Failed` messages (`expires_at <= now`).
    /// `Dlq` records are never TTL-evicted regardless of `expires_at`.
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    async fn count_by_state(&self, tenant_id: Option<TenantId>, state: MessageState) -> StoreResult<u64>;

    /// Aggregate counters for the coordinator's metrics emitter and the management
    /// interface's `GetStats`.
    async fn get_stats(&self, tenant_id: Option<TenantId>, now: DateTime<Utc>) -> StoreResult<StoreStats>;

    /// List dead-lettered messages for the management interface, newest first.
    async fn list_dlq(&self, filter: DlqFilter, limit: u64, skip: u64) -> StoreResult<Vec<Message>>;

    async fn count_dlq(&self, filter: DlqFilter) -> StoreResult<u64>;

    /// Permanently remove a message regardless of state. Used by the management
    /// interface's `Delete`/`DeleteBatch`/`DeleteByType`/`DeleteOld` operations.
    async fn delete(&self, id: MessageId) -> StoreResult<bool>;

    async fn delete_by_type(&self, message_type: &str, state: MessageState) -> StoreResult<u64>;

    async fn delete_dlq_older_than(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;

    /// Aggregate the most common `(code, message)` pairs among `Dlq` errors, for
    /// post-mortem triage via the management interface's `GetErrorPatterns`.
    async fn error_patterns(&self, limit: u64) -> StoreResult<Vec<ErrorPattern>>;
}
