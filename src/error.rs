//! Error types for the work buffer and conversation buffer.

use crate::id::{MessageId, TenantId};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a [`crate::store::MessageStore`] implementation.
///
/// Kept separate from [`BufferError`] because a store is swappable (Postgres vs.
/// in-memory) and its failure modes shouldn't leak backend-specific detail past the
/// `Persistence` variant at the component boundary.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("message {0} not found")]
    NotFound(MessageId),

    #[error("idempotency conflict for tenant {tenant_id}, key {idempotency_key}")]
    IdempotencyConflict { tenant_id: TenantId, idempotency_key: String },

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "postgres")]
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend poisoned: {0}")]
    Poisoned(String),
}

/// The unified error type for work buffer operations.
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("message failed validation: {reason}")]
    InvalidMessage { reason: String },

    #[error("no handler registered for message type {message_type}")]
    HandlerNotFound { message_type: String },

    #[error(
        "circuit open for tenant {tenant_id}, handler {handler_type} ({failure_count} failures, retry after {retry_after:?})"
    )]
    CircuitOpen { tenant_id: TenantId, handler_type: String, failure_count: usize, retry_after: Duration },

    #[error("handler for {message_type} timed out after {elapsed:?} (limit {limit:?})")]
    Timeout { message_type: String, elapsed: Duration, limit: Duration },

    #[error("message {0} was cancelled")]
    Cancelled(MessageId),

    #[error("message {message_id} exceeded max retries ({max_retries})")]
    RetriesExhausted { message_id: MessageId, max_retries: u32 },

    #[error("coordinator is not running")]
    NotRunning,

    #[error("shutdown in progress, no new work is admitted")]
    ShutdownInProgress,

    #[error("queue full: {pending} pending messages >= max_queue_size {max_queue_size}")]
    QueueFull { pending: u64, max_queue_size: u64 },

    #[error("duplicate message for idempotency key, existing message {existing_id}")]
    DuplicateMessage { existing_id: MessageId },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl BufferError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn is_handler_not_found(&self) -> bool {
        matches!(self, Self::HandlerNotFound { .. })
    }

    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }

    pub fn is_queue_full(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }

    pub fn is_shutdown_in_progress(&self) -> bool {
        matches!(self, Self::ShutdownInProgress)
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateMessage { .. })
    }

    /// Whether retrying the operation that produced this error might succeed.
    ///
    /// Mirrors `rustpress_core::error::Error::is_retryable` - transient/backend
    /// failures are retryable, validation and terminal lifecycle states are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::CircuitOpen { .. } | Self::Persistence(_))
    }
}

pub type Result<T> = std::result::Result<T, BufferError>;
