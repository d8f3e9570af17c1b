//! In-process reference `MessageStore`, backing the crate's own tests and usable by
//! embedders who accept losing the queue across restarts.

use super::{ClaimFilter, DlqFilter, ErrorPattern, MessageStore, StoreResult, StoreStats};
use crate::error::StoreError;
use crate::id::{MessageId, TenantId, WorkerId};
use crate::message::{Message, MessageError, MessageState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct Inner {
    messages: BTreeMap<MessageId, Message>,
    idempotency_index: HashMap<(TenantId, String), MessageId>,
}

/// `parking_lot::Mutex`-guarded map. The whole claim-and-mutate step runs under one
/// lock acquisition, which is the single-process equivalent of the conditional
/// `UPDATE ... WHERE state = 'pending'` the Postgres backend uses for the same
/// atomicity guarantee.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn retries_exhausted(message: &Message) -> bool {
    message.attempts > message.max_retries
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create(&self, message: Message) -> StoreResult<Message> {
        let mut inner = self.inner.lock();

        if let Some(key) = message.idempotency_key.clone() {
            let index_key = (message.tenant_id, key);
            if let Some(existing_id) = inner.idempotency_index.get(&index_key) {
                if let Some(existing) = inner.messages.get(existing_id) {
                    if !existing.state.is_terminal() {
                        return Err(StoreError::IdempotencyConflict {
                            tenant_id: index_key.0,
                            idempotency_key: index_key.1,
                        });
                    }
                }
            }
            inner.idempotency_index.insert(index_key, message.id);
        }

        inner.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn get(&self, id: MessageId) -> StoreResult<Message> {
        self.inner.lock().messages.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn find_by_idempotency_key(&self, tenant_id: TenantId, key: &str) -> StoreResult<Option<Message>> {
        let inner = self.inner.lock();
        Ok(inner
            .idempotency_index
            .get(&(tenant_id, key.to_string()))
            .and_then(|id| inner.messages.get(id))
            .cloned())
    }

    async fn claim_next_batch(
        &self,
        filter: ClaimFilter,
        limit: usize,
        worker: WorkerId,
        visibility_timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Message>> {
        let mut inner = self.inner.lock();

        let mut candidates: Vec<MessageId> = inner
            .messages
            .values()
            .filter(|m| m.state == MessageState::Pending && m.visible_at <= now)
            .filter(|m| filter.tenant_id.map(|t| t == m.tenant_id).unwrap_or(true))
            .filter(|m| {
                filter
                    .message_types
                    .as_ref()
                    .map(|types| types.iter().any(|t| t == &m.message_type))
                    .unwrap_or(true)
            })
            .map(|m| m.id)
            .collect();

        candidates.sort_by_key(|id| {
            let m = &inner.messages[id];
            (m.priority, m.created_at)
        });
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let message = inner.messages.get_mut(&id).expect("candidate exists");
            message.state = MessageState::Processing;
            message.processing_started_at = Some(now);
            message.processing_worker = Some(worker);
            message.visible_at = now + visibility_timeout;
            message.attempts += 1;
            message.updated_at = now;
            claimed.push(message.clone());
        }

        Ok(claimed)
    }

    async fn complete(&self, id: MessageId, result: serde_json::Value, now: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let message = inner.messages.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        message.state = MessageState::Completed;
        message.result = Some(result);
        message.processing_worker = None;
        message.expires_at = Some(now + chrono::Duration::hours(24));
        message.updated_at = now;
        Ok(())
    }

    async fn fail(
        &self,
        id: MessageId,
        error: MessageError,
        next_visible_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let message = inner.messages.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        message.errors.push(error);
        message.processing_worker = None;
        message.updated_at = now;

        match next_visible_at {
            Some(visible_at) => {
                message.state = MessageState::Pending;
                message.visible_at = visible_at;
                message.processing_started_at = None;
            }
            None => {
                message.state = MessageState::Failed;
                message.expires_at = Some(now + chrono::Duration::days(7));
            }
        }

        Ok(())
    }

    async fn dead_letter(&self, id: MessageId, now: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let message = inner.messages.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        message.state = MessageState::Dlq;
        message.processing_worker = None;
        message.expires_at = None;
        message.updated_at = now;
        Ok(())
    }

    async fn requeue_from_dlq(&self, id: MessageId, now: DateTime<Utc>) -> StoreResult<Message> {
        let mut inner = self.inner.lock();
        let message = inner.messages.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if message.state != MessageState::Dlq {
            return Err(StoreError::NotFound(id));
        }
        message.state = MessageState::Pending;
        message.attempts = 0;
        message.errors.clear();
        message.visible_at = now;
        message.updated_at = now;
        Ok(message.clone())
    }

    async fn release_stale(
        &self,
        older_than: DateTime<Utc>,
        retry_delay: chrono::Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut inner = self.inner.lock();
        let mut retried = 0u64;

        let stuck: Vec<MessageId> = inner
            .messages
            .values()
            .filter(|m| {
                m.state == MessageState::Processing
                    && m.processing_started_at.map(|t| t <= older_than).unwrap_or(false)
            })
            .map(|m| m.id)
            .collect();

        for id in stuck {
            let message = inner.messages.get_mut(&id).expect("stuck candidate exists");
            let error = MessageError::new("message timed out while processing", message.attempts)
                .with_code("MESSAGE_TIMEOUT");
            message.errors.push(error);
            message.processing_worker = None;
            message.updated_at = now;

            if retries_exhausted(message) {
                message.state = MessageState::Failed;
                message.processing_started_at = None;
                message.expires_at = Some(now + chrono::Duration::days(7));
            } else {
                message.state = MessageState::Pending;
                message.processing_started_at = None;
                message.visible_at = now + retry_delay;
                retried += 1;
            }
        }

        if retried > 0 {
            tracing::info!(count = retried, "released stuck messages back to pending");
        }

        Ok(retried)
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock();
        let expired: Vec<MessageId> = inner
            .messages
            .values()
            .filter(|m| matches!(m.state, MessageState::Completed | MessageState::Failed) && m.is_expired(now))
            .map(|m| m.id)
            .collect();

        for id in &expired {
            inner.messages.remove(id);
        }
        inner.idempotency_index.retain(|_, id| !expired.contains(id));

        Ok(expired.len() as u64)
    }

    async fn count_by_state(&self, tenant_id: Option<TenantId>, state: MessageState) -> StoreResult<u64> {
        let inner = self.inner.lock();
        Ok(inner
            .messages
            .values()
            .filter(|m| m.state == state)
            .filter(|m| tenant_id.map(|t| t == m.tenant_id).unwrap_or(true))
            .count() as u64)
    }

    async fn get_stats(&self, tenant_id: Option<TenantId>, now: DateTime<Utc>) -> StoreResult<StoreStats> {
        let inner = self.inner.lock();
        let mut stats = StoreStats::default();
        let mut oldest_pending: Option<DateTime<Utc>> = None;

        for m in inner.messages.values() {
            if tenant_id.map(|t| t != m.tenant_id).unwrap_or(false) {
                continue;
            }
            stats.total += 1;
            match m.state {
                MessageState::Pending => {
                    stats.pending += 1;
                    oldest_pending = Some(oldest_pending.map_or(m.created_at, |o| o.min(m.created_at)));
                }
                MessageState::Processing => stats.processing += 1,
                MessageState::Completed => stats.completed += 1,
                MessageState::Failed => stats.failed += 1,
                MessageState::Dlq => stats.dlq += 1,
            }
        }

        stats.oldest_pending_age = oldest_pending.map(|t| now - t);
        Ok(stats)
    }

    async fn list_dlq(&self, filter: DlqFilter, limit: u64, skip: u64) -> StoreResult<Vec<Message>> {
        let inner = self.inner.lock();
        let mut matches: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| m.state == MessageState::Dlq)
            .filter(|m| filter.message_type.as_ref().map(|t| t == &m.message_type).unwrap_or(true))
            .filter(|m| filter.since.map(|since| m.updated_at >= since).unwrap_or(true))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(matches.into_iter().skip(skip as usize).take(limit as usize).collect())
    }

    async fn count_dlq(&self, filter: DlqFilter) -> StoreResult<u64> {
        let inner = self.inner.lock();
        Ok(inner
            .messages
            .values()
            .filter(|m| m.state == MessageState::Dlq)
            .filter(|m| filter.message_type.as_ref().map(|t| t == &m.message_type).unwrap_or(true))
            .filter(|m| filter.since.map(|since| m.updated_at >= since).unwrap_or(true))
            .count() as u64)
    }

    async fn delete(&self, id: MessageId) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let removed = inner.messages.remove(&id).is_some();
        inner.idempotency_index.retain(|_, existing| *existing != id);
        Ok(removed)
    }

    async fn delete_by_type(&self, message_type: &str, state: MessageState) -> StoreResult<u64> {
        let mut inner = self.inner.lock();
        let ids: Vec<MessageId> = inner
            .messages
            .values()
            .filter(|m| m.message_type == message_type && m.state == state)
            .map(|m| m.id)
            .collect();
        for id in &ids {
            inner.messages.remove(id);
        }
        inner.idempotency_index.retain(|_, id| !ids.contains(id));
        Ok(ids.len() as u64)
    }

    async fn delete_dlq_older_than(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock();
        let ids: Vec<MessageId> = inner
            .messages
            .values()
            .filter(|m| m.state == MessageState::Dlq && m.updated_at <= older_than)
            .map(|m| m.id)
            .collect();
        for id in &ids {
            inner.messages.remove(id);
        }
        Ok(ids.len() as u64)
    }

    async fn error_patterns(&self, limit: u64) -> StoreResult<Vec<ErrorPattern>> {
        let inner = self.inner.lock();
        let mut buckets: HashMap<(Option<String>, String), ErrorPattern> = HashMap::new();

        for m in inner.messages.values().filter(|m| m.state == MessageState::Dlq) {
            if let Some(last) = m.errors.last() {
                let key = (last.code.clone(), last.message.clone());
                let bucket = buckets.entry(key).or_insert_with(|| ErrorPattern {
                    code: last.code.clone(),
                    message: last.message.clone(),
                    count: 0,
                    sample_message_ids: Vec::new(),
                });
                bucket.count += 1;
                if bucket.sample_message_ids.len() < 5 {
                    bucket.sample_message_ids.push(m.id);
                }
            }
        }

        let mut patterns: Vec<ErrorPattern> = buckets.into_values().collect();
        patterns.sort_by(|a, b| b.count.cmp(&a.count));
        patterns.truncate(limit as usize);
        Ok(patterns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Metadata, NewMessage, Priority};

    fn new_message(tenant_id: TenantId, idempotency_key: Option<&str>) -> Message {
        let now = Utc::now();
        Message::new(
            NewMessage {
                tenant_id,
                message_type: "send_email".into(),
                payload: serde_json::json!({}),
                priority: Priority::Normal,
                idempotency_key: idempotency_key.map(str::to_string),
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

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        let message = new_message(tenant, None);
        let id = message.id;
        store.create(message).await.unwrap();
        let fetched = store.get(id).await.unwrap();
        assert_eq!(fetched.id, id);
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_rejected_while_active() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        store.create(new_message(tenant, Some("key-1"))).await.unwrap();

        let err = store.create(new_message(tenant, Some("key-1"))).await.unwrap_err();
        assert!(matches!(err, StoreError::IdempotencyConflict { .. }));
    }

    #[tokio::test]
    async fn find_by_idempotency_key_resolves_existing_record() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        let message = new_message(tenant, Some("key-1"));
        let id = message.id;
        store.create(message).await.unwrap();

        let found = store.find_by_idempotency_key(tenant, "key-1").await.unwrap().unwrap();
        assert_eq!(found.id, id);
    }

    #[tokio::test]
    async fn claim_batch_marks_processing_and_is_exclusive() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        let message = new_message(tenant, None);
        let id = message.id;
        store.create(message).await.unwrap();

        let now = Utc::now();
        let claimed = store
            .claim_next_batch(ClaimFilter::default(), 10, WorkerId::new(), chrono::Duration::seconds(30), now)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);

        let second_claim = store
            .claim_next_batch(ClaimFilter::default(), 10, WorkerId::new(), chrono::Duration::seconds(30), now)
            .await
            .unwrap();
        assert!(second_claim.is_empty(), "already-claimed message must not be claimed twice");
    }

    #[tokio::test]
    async fn claim_batch_orders_by_priority_first() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();

        let mut low = new_message(tenant, None);
        low.priority = Priority::Low;
        let mut critical = new_message(tenant, None);
        critical.priority = Priority::Critical;

        let low_id = low.id;
        let critical_id = critical.id;
        store.create(low).await.unwrap();
        store.create(critical).await.unwrap();

        let now = Utc::now();
        let claimed = store
            .claim_next_batch(ClaimFilter::default(), 10, WorkerId::new(), chrono::Duration::seconds(30), now)
            .await
            .unwrap();

        assert_eq!(claimed[0].id, critical_id);
        assert_eq!(claimed[1].id, low_id);
    }

    #[tokio::test]
    async fn claim_batch_breaks_same_priority_ties_by_created_at_not_visible_at() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        let now = Utc::now();

        // Same priority, but `older`'s visibility was delayed past `newer`'s - if the
        // claim order still keyed on `visible_at` it would pick `newer` first.
        let mut older = new_message(tenant, None);
        older.created_at = now - chrono::Duration::seconds(60);
        older.visible_at = now - chrono::Duration::seconds(1);

        let mut newer = new_message(tenant, None);
        newer.created_at = now - chrono::Duration::seconds(30);
        newer.visible_at = now - chrono::Duration::seconds(50);

        let older_id = older.id;
        let newer_id = newer.id;
        store.create(older).await.unwrap();
        store.create(newer).await.unwrap();

        let claimed = store
            .claim_next_batch(ClaimFilter::default(), 10, WorkerId::new(), chrono::Duration::seconds(30), now)
            .await
            .unwrap();

        assert_eq!(claimed[0].id, older_id, "earlier created_at must claim first despite a later visible_at");
        assert_eq!(claimed[1].id, newer_id);
    }

    #[tokio::test]
    async fn failed_message_with_next_visible_at_is_reenqueued() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        let message = new_message(tenant, None);
        let id = message.id;
        store.create(message).await.unwrap();

        let now = Utc::now();
        store.claim_next_batch(ClaimFilter::default(), 10, WorkerId::new(), chrono::Duration::seconds(30), now).await.unwrap();

        let retry_at = now + chrono::Duration::seconds(5);
        store.fail(id, MessageError::new("boom", 1), Some(retry_at), now).await.unwrap();

        let fetched = store.get(id).await.unwrap();
        assert_eq!(fetched.state, MessageState::Pending);
        assert_eq!(fetched.visible_at, retry_at);
        assert_eq!(fetched.errors.len(), 1);
    }

    #[tokio::test]
    async fn failed_message_past_retry_budget_becomes_terminal_with_ttl() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        let message = new_message(tenant, None);
        let id = message.id;
        store.create(message).await.unwrap();

        let now = Utc::now();
        store.fail(id, MessageError::new("boom", 4), None, now).await.unwrap();

        let fetched = store.get(id).await.unwrap();
        assert_eq!(fetched.state, MessageState::Failed);
        assert!(fetched.expires_at.is_some());
    }

    #[tokio::test]
    async fn release_stale_retries_when_budget_remains() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        let message = new_message(tenant, None);
        let id = message.id;
        store.create(message).await.unwrap();

        let claimed_at = Utc::now();
        store
            .claim_next_batch(ClaimFilter::default(), 10, WorkerId::new(), chrono::Duration::seconds(30), claimed_at)
            .await
            .unwrap();

        let later = claimed_at + chrono::Duration::minutes(10);
        let retried = store.release_stale(claimed_at, chrono::Duration::seconds(5), later).await.unwrap();
        assert_eq!(retried, 1);

        let fetched = store.get(id).await.unwrap();
        assert_eq!(fetched.state, MessageState::Pending);
        assert_eq!(fetched.errors.len(), 1);
        assert_eq!(fetched.errors[0].code.as_deref(), Some("MESSAGE_TIMEOUT"));
    }

    #[tokio::test]
    async fn release_stale_fails_terminally_once_budget_exhausted() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        let mut message = new_message(tenant, None);
        message.max_retries = 0;
        let id = message.id;
        store.create(message).await.unwrap();

        let claimed_at = Utc::now();
        store
            .claim_next_batch(ClaimFilter::default(), 10, WorkerId::new(), chrono::Duration::seconds(30), claimed_at)
            .await
            .unwrap();

        let later = claimed_at + chrono::Duration::minutes(10);
        let retried = store.release_stale(claimed_at, chrono::Duration::seconds(5), later).await.unwrap();
        assert_eq!(retried, 0, "no retry budget remains, should not count as retried");

        let fetched = store.get(id).await.unwrap();
        assert_eq!(fetched.state, MessageState::Failed);
    }

    #[tokio::test]
    async fn cleanup_never_evicts_dlq() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        let message = new_message(tenant, None);
        let id = message.id;
        store.create(message).await.unwrap();

        let now = Utc::now();
        store.dead_letter(id, now).await.unwrap();

        let far_future = now + chrono::Duration::days(3650);
        let deleted = store.cleanup_expired(far_future).await.unwrap();
        assert_eq!(deleted, 0);
        assert!(store.get(id).await.is_ok());
    }

    #[tokio::test]
    async fn requeue_from_dlq_resets_attempts() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        let message = new_message(tenant, None);
        let id = message.id;
        store.create(message).await.unwrap();

        let now = Utc::now();
        store.dead_letter(id, now).await.unwrap();
        let requeued = store.requeue_from_dlq(id, now).await.unwrap();

        assert_eq!(requeued.state, MessageState::Pending);
        assert_eq!(requeued.attempts, 0);
    }

    #[tokio::test]
    async fn list_dlq_filters_by_type_and_paginates() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        let now = Utc::now();

        for _ in 0..3 {
            let message = new_message(tenant, None);
            let id = message.id;
            store.create(message).await.unwrap();
            store.dead_letter(id, now).await.unwrap();
        }

        let all = store.list_dlq(DlqFilter::default(), 10, 0).await.unwrap();
        assert_eq!(all.len(), 3);

        let page = store.list_dlq(DlqFilter::default(), 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);

        let count = store.count_dlq(DlqFilter::default()).await.unwrap();
        assert_eq!(count, 3);
    }
}
