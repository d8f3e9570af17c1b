#![forbid(unsafe_code)]

//! # workbuffer
//!
//! A durable, priority-ordered, retry-aware, circuit-breaker-protected work queue with
//! at-least-once delivery, plus a conversation-buffer debouncer for coalescing bursts
//! of chat-platform messages into a single logical turn.
//!
//! ## Components
//!
//! - [`message`] / [`store`] - the durable message entity and its persistence
//!   abstraction (`MemoryStore` for tests, `PostgresStore` in production).
//! - [`handler`] - the registry of handlers a message type dispatches to.
//! - [`circuit_breaker`] - per-`(tenant, handler type)` failure isolation.
//! - [`processor`] - runs one claimed message through validate/process/after-process
//!   under breaker and timeout policy.
//! - [`coordinator`] - admission control, polling, worker lifecycle, and the periodic
//!   sweeps (stuck-message release, metrics, cleanup).
//! - [`dlq`] - the dead-letter inspection/retry/delete management surface.
//! - [`conversation`] - per-sender debounce/coalesce for chat-platform bursts.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use workbuffer::prelude::*;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl MessageHandler for Echo {
//!     fn message_type(&self) -> &str {
//!         "echo"
//!     }
//!
//!     async fn process(&self, message: &Message) -> BufferResult<serde_json::Value> {
//!         Ok(message.payload.clone())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> BufferResult<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let handlers = Arc::new(HandlerRegistry::new());
//!     handlers.register(Arc::new(Echo));
//!
//!     let config = CoordinatorConfig::builder().build()?;
//!     let coordinator = Arc::new(Coordinator::new(store, handlers, config));
//!     coordinator.start().await?;
//!
//!     coordinator
//!         .enqueue(NewMessage {
//!             tenant_id: TenantId::new(),
//!             message_type: "echo".into(),
//!             payload: serde_json::json!({"hello": "world"}),
//!             priority: Priority::Normal,
//!             idempotency_key: None,
//!             max_retries: Some(3),
//!             metadata: Metadata::default(),
//!             delay: None,
//!             expires_at: None,
//!         })
//!         .await?;
//!
//!     coordinator.stop(StopOptions::default()).await?;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod conversation;
pub mod coordinator;
pub mod dlq;
pub mod error;
pub mod events;
pub mod handler;
pub mod id;
pub mod jitter;
pub mod message;
pub mod processor;
pub mod sleeper;
pub mod store;

pub mod prelude;
