//! The Conversation Buffer Manager: per-sender debounce/coalesce of a burst of
//! platform messages into one logical turn.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

/// Lower bound enforced on caller-supplied `delay`, per the debounce-delay
/// configuration rule. Values below this are coerced up with a logged warning rather
/// than rejected, since a sender burst shouldn't be dropped over a config mistake.
pub const MIN_DELAY: Duration = Duration::from_millis(1000);

/// What a flush hands back to the caller: the joined text, images in arrival order,
/// and how many distinct `add_message` calls contributed text.
#[derive(Debug, Clone)]
pub struct FlushPayload {
    pub customer: String,
    pub tenant: String,
    pub combined_text: String,
    pub images: Vec<String>,
    pub message_count: usize,
}

/// Callback invoked on flush. Boxed rather than generic so `ConversationBufferManager`
/// doesn't need a type parameter per distinct caller.
pub type OnFlush = Arc<dyn Fn(FlushPayload) + Send + Sync>;

/// Parameters for one `add_message` call.
pub struct AddMessage {
    pub tenant: String,
    pub customer: String,
    pub delay: Duration,
    pub text: Option<String>,
    pub image_url: Option<String>,
    pub on_flush: OnFlush,
}

struct Entry {
    tenant: String,
    customer: String,
    texts: Vec<String>,
    images: Vec<String>,
    message_count: usize,
    last_activity: std::time::Instant,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl Entry {
    fn take_payload(&self) -> FlushPayload {
        FlushPayload {
            customer: self.customer.clone(),
            tenant: self.tenant.clone(),
            combined_text: self.texts.join(" "),
            images: self.images.clone(),
            message_count: self.message_count,
        }
    }
}

/// Debounces bursts of per-sender messages. Each sender key's entry is guarded by its
/// own `tokio::sync::Mutex` inside the `DashMap`, so operations on one sender serialize
/// while different senders proceed fully in parallel - the per-key-lock discipline the
/// concurrency model calls for.
///
/// Cancel-safety against the "cancelling a timer that already started its callback
/// must not double-flush" rule is provided by a per-entry generation counter: a timer
/// callback checks its captured generation against the entry's current generation
/// before flushing, and re-arming or cancelling bumps the generation so a stale
/// callback becomes a no-op instead of racing the new timer.
pub struct ConversationBufferManager {
    entries: DashMap<String, Arc<AsyncMutex<Option<Entry>>>>,
    next_generation: AtomicU64,
}

impl Default for ConversationBufferManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationBufferManager {
    pub fn new() -> Self {
        Self { entries: DashMap::new(), next_generation: AtomicU64::new(1) }
    }

    fn slot(&self, sender_key: &str) -> Arc<AsyncMutex<Option<Entry>>> {
        self.entries.entry(sender_key.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(None))).clone()
    }

    /// Append to (or create) the entry for `sender_key`, cancelling and re-arming its
    /// debounce timer. A strict debounce: the timer fires only after `delay` of
    /// silence following the most recent call.
    pub async fn add_message(self: &Arc<Self>, sender_key: &str, mut msg: AddMessage) {
        if msg.delay < MIN_DELAY {
            tracing::warn!(sender_key, requested_ms = msg.delay.as_millis() as u64, "delay below minimum, coercing up");
            msg.delay = MIN_DELAY;
        }

        let slot = self.slot(sender_key);
        let mut guard = slot.lock().await;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let entry = guard.get_or_insert_with(|| Entry {
            tenant: msg.tenant.clone(),
            customer: msg.customer.clone(),
            texts: Vec::new(),
            images: Vec::new(),
            message_count: 0,
            last_activity: std::time::Instant::now(),
            generation,
            timer: None,
        });

        if let Some(text) = msg.text {
            entry.texts.push(text);
            entry.message_count += 1;
        }
        if let Some(image) = msg.image_url {
            entry.images.push(image);
        }
        entry.last_activity = std::time::Instant::now();
        entry.generation = generation;

        if let Some(handle) = entry.timer.take() {
            handle.abort();
        }

        let this = self.clone();
        let sender_key_owned = sender_key.to_string();
        let on_flush = msg.on_flush;
        let delay = msg.delay;
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.fire(&sender_key_owned, generation, Some(on_flush)).await;
        }));
    }

    /// Clear the timer and destroy the entry without calling `on_flush`. A no-op if
    /// the sender has no entry, or if its flush is already in flight.
    pub async fn cancel(&self, sender_key: &str) {
        if let Some(slot) = self.entries.get(sender_key) {
            let mut guard = slot.lock().await;
            if let Some(entry) = guard.take() {
                if let Some(handle) = entry.timer {
                    handle.abort();
                }
            }
        }
    }

    /// Teardown: clear every entry without flushing.
    pub async fn clear(&self) {
        for entry in self.entries.iter() {
            let mut guard = entry.value().lock().await;
            if let Some(entry) = guard.take() {
                if let Some(handle) = entry.timer {
                    handle.abort();
                }
            }
        }
        self.entries.clear();
    }

    /// Sweep entries whose `last_activity` predates `stale_threshold`, destroying them
    /// silently (no `on_flush`) as an upper bound against senders whose timer was
    /// somehow never armed.
    pub async fn sweep_stale(&self, stale_threshold: Duration) {
        let now = std::time::Instant::now();
        let stale_keys: Vec<String> = self
            .entries
            .iter()
            .filter_map(|kv| {
                let slot = kv.value().clone();
                // try_lock: an entry mid-flush is active, not stale, and shouldn't be
                // torn down out from under its own flush.
                let guard = slot.try_lock().ok()?;
                let entry = guard.as_ref()?;
                (now.duration_since(entry.last_activity) >= stale_threshold).then(|| kv.key().clone())
            })
            .collect();

        for key in stale_keys {
            if let Some(slot) = self.entries.get(&key) {
                let mut guard = slot.lock().await;
                if let Some(entry) = guard.take() {
                    if let Some(handle) = entry.timer {
                        handle.abort();
                    }
                    tracing::debug!(sender_key = %key, "stale conversation entry swept");
                }
            }
        }
    }

    /// Shared by the timer callback (flush) and, conceptually, the stale sweep's
    /// silent destruction path - kept as one function since both must check the
    /// generation before acting and both must leave a torn-down entry in their wake.
    async fn fire(&self, sender_key: &str, generation: u64, on_flush: Option<OnFlush>) {
        let Some(slot) = self.entries.get(sender_key).map(|kv| kv.value().clone()) else {
            return;
        };
        let mut guard = slot.lock().await;

        let should_fire = matches!(guard.as_ref(), Some(entry) if entry.generation == generation);
        if !should_fire {
            return;
        }

        let entry = guard.take().expect("checked Some above");
        let payload = entry.take_payload();
        drop(guard);

        if let Some(on_flush) = on_flush {
            on_flush(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recorder() -> (OnFlush, Arc<StdMutex<Vec<FlushPayload>>>) {
        let received = Arc::new(StdMutex::new(Vec::new()));
        let clone = received.clone();
        let cb: OnFlush = Arc::new(move |payload| clone.lock().unwrap().push(payload));
        (cb, received)
    }

    #[tokio::test]
    async fn single_message_flushes_after_delay() {
        let manager = Arc::new(ConversationBufferManager::new());
        let (cb, received) = recorder();

        manager
            .add_message(
                "sender-1",
                AddMessage {
                    tenant: "acme".into(),
                    customer: "cust-1".into(),
                    delay: MIN_DELAY,
                    text: Some("hello".into()),
                    image_url: None,
                    on_flush: cb,
                },
            )
            .await;

        tokio::time::sleep(MIN_DELAY + Duration::from_millis(200)).await;
        let payloads = received.lock().unwrap().clone();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].combined_text, "hello");
        assert_eq!(payloads[0].message_count, 1);
    }

    #[tokio::test]
    async fn subsequent_calls_coalesce_and_reset_timer() {
        let manager = Arc::new(ConversationBufferManager::new());
        let (cb, received) = recorder();

        for (i, text) in ["hello", "there", "world"].iter().enumerate() {
            manager
                .add_message(
                    "sender-2",
                    AddMessage {
                        tenant: "acme".into(),
                        customer: "cust-2".into(),
                        delay: MIN_DELAY,
                        text: Some((*text).into()),
                        image_url: None,
                        on_flush: cb.clone(),
                    },
                )
                .await;
            if i < 2 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        tokio::time::sleep(MIN_DELAY + Duration::from_millis(200)).await;
        let payloads = received.lock().unwrap().clone();
        assert_eq!(payloads.len(), 1, "debounce must coalesce into a single flush");
        assert_eq!(payloads[0].combined_text, "hello there world");
        assert_eq!(payloads[0].message_count, 3);
    }

    #[tokio::test]
    async fn cancel_prevents_flush() {
        let manager = Arc::new(ConversationBufferManager::new());
        let (cb, received) = recorder();

        manager
            .add_message(
                "sender-3",
                AddMessage {
                    tenant: "acme".into(),
                    customer: "cust-3".into(),
                    delay: MIN_DELAY,
                    text: Some("hello".into()),
                    image_url: None,
                    on_flush: cb,
                },
            )
            .await;

        manager.cancel("sender-3").await;
        tokio::time::sleep(MIN_DELAY + Duration::from_millis(200)).await;
        assert!(received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delay_below_minimum_is_coerced_up() {
        let manager = Arc::new(ConversationBufferManager::new());
        let (cb, received) = recorder();

        manager
            .add_message(
                "sender-4",
                AddMessage {
                    tenant: "acme".into(),
                    customer: "cust-4".into(),
                    delay: Duration::from_millis(10),
                    text: Some("hi".into()),
                    image_url: None,
                    on_flush: cb,
                },
            )
            .await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(received.lock().unwrap().is_empty(), "must not fire before the coerced minimum delay");
    }

    #[tokio::test]
    async fn stale_sweep_destroys_without_flushing() {
        let manager = Arc::new(ConversationBufferManager::new());
        let (cb, received) = recorder();

        manager
            .add_message(
                "sender-5",
                AddMessage {
                    tenant: "acme".into(),
                    customer: "cust-5".into(),
                    delay: Duration::from_secs(600),
                    text: Some("hi".into()),
                    image_url: None,
                    on_flush: cb,
                },
            )
            .await;

        manager.sweep_stale(Duration::from_millis(0)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(received.lock().unwrap().is_empty());
        assert!(manager.entries.get("sender-5").unwrap().lock().await.is_none());
    }
}
