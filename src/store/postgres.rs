//! Postgres-backed `MessageStore`, grounded on the `FOR UPDATE SKIP LOCKED` claim
//! pattern used by this corpus's job queue implementation.

use super::{ClaimFilter, DlqFilter, ErrorPattern, MessageStore, StoreResult, StoreStats};
use crate::error::StoreError;
use crate::id::{MessageId, TenantId, WorkerId};
use crate::message::{Message, MessageError, MessageState, Metadata, Priority};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// Embedded schema migrations. `sqlx::migrate!` is used in preference to a second
/// migration engine (e.g. `refinery`) since the crate already depends on `sqlx` for
/// every query it runs - a second engine for the same concern would be an
/// unjustified extra dependency.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    message_type: String,
    payload: serde_json::Value,
    priority: i16,
    state: i16,
    idempotency_key: Option<String>,
    attempts: i32,
    max_retries: i32,
    visible_at: DateTime<Utc>,
    processing_started_at: Option<DateTime<Utc>>,
    processing_worker: Option<uuid::Uuid>,
    errors: serde_json::Value,
    result: Option<serde_json::Value>,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

fn priority_from_i16(value: i16) -> Priority {
    match value {
        0 => Priority::Critical,
        1 => Priority::High,
        3 => Priority::Low,
        _ => Priority::Normal,
    }
}

fn state_from_i16(value: i16) -> MessageState {
    match value {
        1 => MessageState::Processing,
        2 => MessageState::Completed,
        3 => MessageState::Failed,
        4 => MessageState::Dlq,
        _ => MessageState::Pending,
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let errors: Vec<MessageError> = serde_json::from_value(row.errors)?;
        let metadata: Metadata = serde_json::from_value(row.metadata)?;

        Ok(Message {
            id: row.id.into(),
            tenant_id: row.tenant_id.into(),
            message_type: row.message_type,
            payload: row.payload,
            priority: priority_from_i16(row.priority),
            state: state_from_i16(row.state),
            idempotency_key: row.idempotency_key,
            attempts: row.attempts.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            visible_at: row.visible_at,
            processing_started_at: row.processing_started_at,
            processing_worker: row.processing_worker.map(Into::into),
            errors,
            result: row.result,
            metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
        })
    }
}

#[async_trait]
impl MessageStore for PostgresStore {
    async fn create(&self, message: Message) -> StoreResult<Message> {
        let errors = serde_json::to_value(&message.errors)?;
        let metadata = serde_json::to_value(&message.metadata)?;

        let result = sqlx::query(
            r#"
            INSERT INTO messages (
                id, tenant_id, message_type, payload, priority, state, idempotency_key,
                attempts, max_retries, visible_at, errors, result, metadata,
                created_at, updated_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(message.id.as_uuid())
        .bind(message.tenant_id.as_uuid())
        .bind(&message.message_type)
        .bind(&message.payload)
        .bind(message.priority as i16)
        .bind(message.state as i16)
        .bind(&message.idempotency_key)
        .bind(message.attempts as i32)
        .bind(message.max_retries as i32)
        .bind(message.visible_at)
        .bind(&errors)
        .bind(&message.result)
        .bind(&metadata)
        .bind(message.created_at)
        .bind(message.updated_at)
        .bind(message.expires_at)
        .execute(&self.pool)
        .await;

        if let Err(sqlx::Error::Database(db_err)) = &result {
            if db_err.is_unique_violation() {
                return Err(StoreError::IdempotencyConflict {
                    tenant_id: message.tenant_id,
                    idempotency_key: message.idempotency_key.clone().unwrap_or_default(),
                });
            }
        }
        result?;

        tracing::debug!(message_id = %message.id, message_type = %message.message_type, "message created");
        Ok(message)
    }

    async fn get(&self, id: MessageId) -> StoreResult<Message> {
        let row: Option<MessageRow> = sqlx::query_as("SELECT * FROM messages WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or(StoreError::NotFound(id))?.try_into()
    }

    async fn find_by_idempotency_key(&self, tenant_id: TenantId, key: &str) -> StoreResult<Option<Message>> {
        let row: Option<MessageRow> =
            sqlx::query_as("SELECT * FROM messages WHERE tenant_id = $1 AND idempotency_key = $2")
                .bind(tenant_id.as_uuid())
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn claim_next_batch(
        &self,
        filter: ClaimFilter,
        limit: usize,
        worker: WorkerId,
        visibility_timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Message>> {
        // Conditional UPDATE over a FOR UPDATE SKIP LOCKED subselect: two coordinators
        // racing on this query can never observe the same row, which is the atomic
        // claim guarantee the trait documents.
        let visible_at = now + visibility_timeout;
        let rows: Vec<MessageRow> = sqlx::query_as(
            r#"
            UPDATE messages
            SET state = 1, processing_started_at = $1, processing_worker = $2,
                visible_at = $3, attempts = attempts + 1, updated_at = $1
            WHERE id IN (
                SELECT id FROM messages
                WHERE state = 0
                  AND visible_at <= $1
                  AND ($4::uuid IS NULL OR tenant_id = $4)
                  AND ($5::text[] IS NULL OR message_type = ANY($5))
                ORDER BY priority ASC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $6
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(worker.as_uuid())
        .bind(visible_at)
        .bind(filter.tenant_id.map(|t| t.as_uuid()))
        .bind(filter.message_types)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn complete(&self, id: MessageId, result: serde_json::Value, now: DateTime<Utc>) -> StoreResult<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE messages
            SET state = 2, result = $2, processing_worker = NULL, expires_at = $3, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(&result)
        .bind(now + chrono::Duration::hours(24))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(StoreError::NotFound(id));
        }

        Ok(())
    }

    async fn fail(
        &self,
        id: MessageId,
        error: MessageError,
        next_visible_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let error_json = serde_json::to_value(&error)?;

        let rows_affected = match next_visible_at {
            Some(visible_at) => {
                sqlx::query(
                    r#"
                    UPDATE messages
                    SET state = 0, errors = errors || $2::jsonb, processing_worker = NULL,
                        processing_started_at = NULL, visible_at = $3, updated_at = $4
                    WHERE id = $1
                    "#,
                )
                .bind(id.as_uuid())
                .bind(&error_json)
                .bind(visible_at)
                .bind(now)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE messages
                    SET state = 3, errors = errors || $2::jsonb, processing_worker = NULL,
                        expires_at = $3, updated_at = $3
                    WHERE id = $1
                    "#,
                )
                .bind(id.as_uuid())
                .bind(&error_json)
                .bind(now + chrono::Duration::days(7))
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
        };

        if rows_affected == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn dead_letter(&self, id: MessageId, now: DateTime<Utc>) -> StoreResult<()> {
        let rows_affected = sqlx::query(
            "UPDATE messages SET state = 4, processing_worker = NULL, expires_at = NULL, updated_at = $2 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn requeue_from_dlq(&self, id: MessageId, now: DateTime<Utc>) -> StoreResult<Message> {
        let row: Option<MessageRow> = sqlx::query_as(
            r#"
            UPDATE messages
            SET state = 0, attempts = 0, errors = '[]'::jsonb, visible_at = $2, updated_at = $2
            WHERE id = $1 AND state = 4
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(StoreError::NotFound(id))?.try_into()
    }

    async fn release_stale(
        &self,
        older_than: DateTime<Utc>,
        retry_delay: chrono::Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let timeout_error = serde_json::to_value(vec![MessageError::new(
            "message timed out while processing",
            0,
        )
        .with_code("MESSAGE_TIMEOUT")])?;

        // Messages with retry budget remaining go back to Pending with a fresh
        // MESSAGE_TIMEOUT error recorded; exhausted ones go straight to Failed. One
        // statement per outcome keeps each a single atomic conditional UPDATE, mirroring
        // the claim query's own "SQL is the authority" approach.
        let retried = sqlx::query(
            r#"
            UPDATE messages
            SET state = 0, errors = errors || $4::jsonb, processing_worker = NULL,
                processing_started_at = NULL, visible_at = $2, updated_at = $2
            WHERE state = 1 AND processing_started_at <= $1 AND attempts <= max_retries
            "#,
        )
        .bind(older_than)
        .bind(now + retry_delay)
        .bind(now)
        .bind(&timeout_error)
        .execute(&self.pool)
        .await?
        .rows_affected();

        sqlx::query(
            r#"
            UPDATE messages
            SET state = 3, errors = errors || $3::jsonb, processing_worker = NULL,
                expires_at = $2, updated_at = $2
            WHERE state = 1 AND processing_started_at <= $1 AND attempts > max_retries
            "#,
        )
        .bind(older_than)
        .bind(now + chrono::Duration::days(7))
        .bind(&timeout_error)
        .execute(&self.pool)
        .await?;

        if retried > 0 {
            tracing::info!(count = retried, "released stuck messages back to pending");
        }
        Ok(retried)
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let rows_affected = sqlx::query("DELETE FROM messages WHERE state IN (2, 3) AND expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(rows_affected)
    }

    async fn count_by_state(&self, tenant_id: Option<TenantId>, state: MessageState) -> StoreResult<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM messages WHERE state = $1 AND ($2::uuid IS NULL OR tenant_id = $2)",
        )
        .bind(state as i16)
        .bind(tenant_id.map(|t| t.as_uuid()))
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }

    async fn get_stats(&self, tenant_id: Option<TenantId>, now: DateTime<Utc>) -> StoreResult<StoreStats> {
        #[derive(sqlx::FromRow)]
        struct Row {
            pending: i64,
            processing: i64,
            completed: i64,
            failed: i64,
            dlq: i64,
            oldest_pending_at: Option<DateTime<Utc>>,
        }

        let row: Row = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 0) AS pending,
                COUNT(*) FILTER (WHERE state = 1) AS processing,
                COUNT(*) FILTER (WHERE state = 2) AS completed,
                COUNT(*) FILTER (WHERE state = 3) AS failed,
                COUNT(*) FILTER (WHERE state = 4) AS dlq,
                MIN(created_at) FILTER (WHERE state = 0) AS oldest_pending_at
            FROM messages
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
            "#,
        )
        .bind(tenant_id.map(|t| t.as_uuid()))
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            pending: row.pending.max(0) as u64,
            processing: row.processing.max(0) as u64,
            completed: row.completed.max(0) as u64,
            failed: row.failed.max(0) as u64,
            dlq: row.dlq.max(0) as u64,
            total: (row.pending + row.processing + row.completed + row.failed + row.dlq).max(0) as u64,
            oldest_pending_age: row.oldest_pending_at.map(|t| now - t),
        })
    }

    async fn list_dlq(&self, filter: DlqFilter, limit: u64, skip: u64) -> StoreResult<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            r#"
            SELECT * FROM messages
            WHERE state = 4
              AND ($1::text IS NULL OR message_type = $1)
              AND ($2::timestamptz IS NULL OR updated_at >= $2)
            ORDER BY updated_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter.message_type)
        .bind(filter.since)
        .bind(limit as i64)
        .bind(skip as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn count_dlq(&self, filter: DlqFilter) -> StoreResult<u64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE state = 4
              AND ($1::text IS NULL OR message_type = $1)
              AND ($2::timestamptz IS NULL OR updated_at >= $2)
            "#,
        )
        .bind(filter.message_type)
        .bind(filter.since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }

    async fn delete(&self, id: MessageId) -> StoreResult<bool> {
        let rows_affected = sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(rows_affected > 0)
    }

    async fn delete_by_type(&self, message_type: &str, state: MessageState) -> StoreResult<u64> {
        let rows_affected = sqlx::query("DELETE FROM messages WHERE message_type = $1 AND state = $2")
            .bind(message_type)
            .bind(state as i16)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(rows_affected)
    }

    async fn delete_dlq_older_than(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let rows_affected = sqlx::query("DELETE FROM messages WHERE state = 4 AND updated_at <= $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(rows_affected)
    }

    async fn error_patterns(&self, limit: u64) -> StoreResult<Vec<ErrorPattern>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            code: Option<String>,
            message: String,
            count: i64,
            sample_ids: Vec<uuid::Uuid>,
        }

        let rows: Vec<Row> = sqlx::query_as(
            r#"
            SELECT
                last_error ->> 'code' AS code,
                last_error ->> 'message' AS message,
                COUNT(*) AS count,
                (ARRAY_AGG(id))[1:5] AS sample_ids
            FROM (
                SELECT id, errors -> (jsonb_array_length(errors) - 1) AS last_error
                FROM messages
                WHERE state = 4 AND jsonb_array_length(errors) > 0
            ) with_last_error
            GROUP BY code, message
            ORDER BY count DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ErrorPattern {
                code: r.code,
                message: r.message,
                count: r.count.max(0) as u64,
                sample_message_ids: r.sample_ids.into_iter().map(Into::into).collect(),
            })
            .collect())
    }
}
