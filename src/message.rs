//! The message entity and its supporting types.

use crate::id::{MessageId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Relative dispatch priority. Lower numeric value sorts first (`priority ASC` in the
/// Postgres store), matching the claim-order rule that critical work is dequeued ahead
/// of everything else regardless of arrival time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i16)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres", sqlx(type_name = "smallint"))]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" | "0" => Ok(Priority::Critical),
            "high" | "1" => Ok(Priority::High),
            "normal" | "2" | "" => Ok(Priority::Normal),
            "low" | "3" => Ok(Priority::Low),
            other => Err(format!("unrecognized priority: {other}")),
        }
    }
}

impl Priority {
    /// Normalize an untyped admission-time priority value the way the external
    /// interface's `Enqueue` does: an integer in `0..=3`, a case-insensitive name, or
    /// anything else (including absent/null) silently defaults to `Normal`. A typed
    /// Rust producer should just construct a `Priority` directly - this exists for a
    /// boundary that accepts untrusted/external input (e.g. a JSON admission request
    /// from an embedding service) and cannot rely on the type system to reject bad
    /// values before they arrive.
    pub fn normalize_loose(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Number(n) => n
                .as_i64()
                .and_then(|n| match n {
                    0 => Some(Priority::Critical),
                    1 => Some(Priority::High),
                    2 => Some(Priority::Normal),
                    3 => Some(Priority::Low),
                    _ => None,
                })
                .unwrap_or(Priority::Normal),
            serde_json::Value::String(s) => s.parse().unwrap_or(Priority::Normal),
            _ => Priority::Normal,
        }
    }
}

/// Lifecycle state of a message. Stored as `SMALLINT` rather than a Postgres native
/// enum so new states never require an `ALTER TYPE` migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i16)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres", sqlx(type_name = "smallint"))]
pub enum MessageState {
    Pending = 0,
    Processing = 1,
    Completed = 2,
    Failed = 3,
    Dlq = 4,
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageState::Pending => "pending",
            MessageState::Processing => "processing",
            MessageState::Completed => "completed",
            MessageState::Failed => "failed",
            MessageState::Dlq => "dlq",
        };
        write!(f, "{s}")
    }
}

impl MessageState {
    /// Terminal states no longer participate in claiming, retry, or the idempotency
    /// uniqueness window.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageState::Completed | MessageState::Failed | MessageState::Dlq)
    }
}

/// Producer- and system-supplied context that travels with a message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    pub correlation_id: Option<String>,
    pub source: Option<String>,
    pub user_id: Option<String>,
    pub tenant_id: Option<TenantId>,
    pub trace_id: Option<String>,
    #[serde(default)]
    pub custom: serde_json::Value,
}

/// A single recorded processing failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageError {
    pub message: String,
    pub code: Option<String>,
    pub stack: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub attempt_number: u32,
}

impl MessageError {
    pub fn new(message: impl Into<String>, attempt_number: u32) -> Self {
        let backtrace = std::backtrace::Backtrace::capture();
        let stack = (backtrace.status() == std::backtrace::BacktraceStatus::Captured)
            .then(|| backtrace.to_string());

        Self {
            message: message.into(),
            code: None,
            stack,
            timestamp: Utc::now(),
            attempt_number,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// The durable unit of work.
///
/// Invariants enforced by the store rather than merely documented here:
/// 1. `attempts <= max_retries + 1` once terminal.
/// 2. Exactly one worker holds a `Processing` claim at a time (enforced by the
///    conditional claim update / in-memory claim lock).
/// 3. `visible_at` is always set on transition back to `Pending`.
/// 4. `(tenant_id, idempotency_key)` is unique among non-terminal messages.
/// 5. `created_at <= updated_at` and `created_at <= expires_at` when `expires_at` is set.
/// 6. A `Completed`/`Failed`/`Dlq` message is never reclaimed.
/// 7. `errors` never exceeds `max_retries + 1` entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub tenant_id: TenantId,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub state: MessageState,
    pub idempotency_key: Option<String>,
    pub attempts: u32,
    pub max_retries: u32,
    pub visible_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_worker: Option<crate::id::WorkerId>,
    pub errors: Vec<MessageError>,
    pub result: Option<serde_json::Value>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Parameters a producer supplies when enqueuing work; everything else (`id`, `state`,
/// `attempts`, timestamps, ...) is assigned by [`Message::new`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub tenant_id: TenantId,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub idempotency_key: Option<String>,
    /// Per-message override of the retry budget. `None` defers to the handler's
    /// declared [`crate::handler::MessageHandler::default_max_retries`] (resolved by
    /// the caller, since `Message::new` has no registry to consult), falling back to
    /// the coordinator's configured default if no handler is registered yet.
    pub max_retries: Option<u32>,
    pub metadata: Metadata,
    pub delay: Option<chrono::Duration>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Construct a new pending message, validating the invariants that must hold
    /// before a row is ever written. `default_max_retries` is used only when `new`
    /// didn't supply an explicit per-message override; the caller resolves it (handler
    /// default, then coordinator config default) before calling in.
    pub fn new(new: NewMessage, default_max_retries: u32, now: DateTime<Utc>) -> Result<Self, String> {
        if new.message_type.trim().is_empty() {
            return Err("message_type must not be empty".into());
        }
        if let Some(expires_at) = new.expires_at {
            if expires_at <= now {
                return Err("expires_at must be in the future".into());
            }
        }

        let visible_at = now + new.delay.unwrap_or_else(chrono::Duration::zero);

        Ok(Self {
            id: MessageId::new(),
            tenant_id: new.tenant_id,
            message_type: new.message_type,
            payload: new.payload,
            priority: new.priority,
            state: MessageState::Pending,
            idempotency_key: new.idempotency_key,
            attempts: 0,
            max_retries: new.max_retries.unwrap_or(default_max_retries),
            visible_at,
            processing_started_at: None,
            processing_worker: None,
            errors: Vec::new(),
            result: None,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
            expires_at: new.expires_at,
        })
    }

    pub fn retries_exhausted(&self) -> bool {
        self.attempts > self.max_retries
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    /// Convenience view of the most recent processing failure, computed from `errors`
    /// rather than stored as a separate duplicated field.
    pub fn last_error(&self) -> Option<&MessageError> {
        self.errors.last()
    }
}
