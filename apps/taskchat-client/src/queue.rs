//! Durable FIFO of actions waiting for delivery.
//!
//! The full queue is persisted after every mutation. Drains deliver a bounded
//! batch from the head and stop at the first failure that survives, so later
//! actions never overtake an earlier one from the same client. While the
//! queue is marked degraded, unforced drains deliver nothing further, even
//! one already in the middle of a batch.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use taskchat_proto::{Action, ClientId, MessageRecord};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::metrics;
use crate::store::{self, LocalStore, StoreError, QUEUE_KEY};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: Uuid,
    pub client_id: ClientId,
    pub action: Action,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
    pub attempts: u32,
}

/// Outcome of handing one queued action to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Accepted by the transport; the server will echo it later.
    Sent,
    /// Delivered and answered with the stored record (REST fallback).
    Confirmed(MessageRecord),
    Failed(String),
}

#[async_trait]
pub trait ActionSink: Send + Sync {
    async fn deliver(&self, item: &QueueItem) -> Delivery;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainRequest {
    /// Deliver even while the queue is marked degraded.
    pub forced: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Another drain was running, or the queue is degraded and not forced.
    pub skipped: bool,
    /// Stopped mid-batch because the queue became degraded.
    pub halted: bool,
    pub delivered: Vec<Uuid>,
    /// Records returned directly for delivered actions.
    pub confirmed: Vec<(Action, MessageRecord)>,
    /// Head item that failed and stays queued.
    pub failed: Option<Uuid>,
    pub dropped: Vec<QueueItem>,
    pub remaining: usize,
}

impl DrainReport {
    fn skipped(remaining: usize) -> Self {
        Self {
            skipped: true,
            remaining,
            ..Self::default()
        }
    }

    /// True when the batch ran and nothing is stuck at the head.
    pub fn completed(&self) -> bool {
        !self.skipped && !self.halted && self.failed.is_none()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    items: Vec<QueueItem>,
    revision: u64,
    /// Enqueued here and not yet written successfully.
    unsynced: HashSet<Uuid>,
    /// Removed here and not yet written successfully.
    retired: HashSet<Uuid>,
}

pub struct OutboundQueue {
    store: Arc<dyn LocalStore>,
    policy: RetryPolicy,
    state: Mutex<QueueState>,
    draining: AtomicBool,
    degraded: AtomicBool,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl OutboundQueue {
    /// Loads whatever a previous run left in the store.
    pub fn open(store: Arc<dyn LocalStore>, policy: RetryPolicy) -> Result<Self, StoreError> {
        let (revision, items) =
            store::read::<Vec<QueueItem>>(store.as_ref(), QUEUE_KEY)?.unwrap_or_default();
        if !items.is_empty() {
            info!(
                target = "taskchat::queue",
                pending = items.len(),
                "restored outbound queue"
            );
        }
        metrics::QUEUE_DEPTH.set(items.len() as i64);
        Ok(Self {
            store,
            policy,
            state: Mutex::new(QueueState {
                items,
                revision,
                ..QueueState::default()
            }),
            draining: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
        })
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<QueueItem> {
        self.state.lock().items.clone()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Marks whether the backing store is unreachable. Checked before every
    /// unforced delivery, including those of a drain already running.
    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Release);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn contains_action(&self, nonce: Uuid) -> bool {
        self.state
            .lock()
            .items
            .iter()
            .any(|item| item.action.nonce() == nonce)
    }

    /// Appends an action. Returns false if the same action is already queued.
    /// When the write fails the action is not queued.
    pub fn enqueue(&self, client_id: ClientId, action: Action) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let nonce = action.nonce();
        if state.items.iter().any(|item| item.action.nonce() == nonce) {
            debug!(target = "taskchat::queue", %nonce, "action already queued");
            return Ok(false);
        }
        let item = QueueItem {
            id: Uuid::new_v4(),
            client_id,
            action,
            enqueued_at: OffsetDateTime::now_utc(),
            attempts: 0,
        };
        debug!(
            target = "taskchat::queue",
            id = %item.id,
            action_type = item.action.action_type().as_str(),
            "enqueued action"
        );
        let id = item.id;
        state.unsynced.insert(id);
        state.items.push(item);
        if let Err(err) = self.persist(&mut state) {
            state.items.retain(|item| item.id != id);
            state.unsynced.remove(&id);
            metrics::QUEUE_DEPTH.set(state.items.len() as i64);
            warn!(
                target = "taskchat::queue",
                %id,
                error = %err,
                "enqueue not persisted; discarded"
            );
            return Err(err);
        }
        Ok(true)
    }

    /// Delivers up to `batch_size` items from the head, in order.
    pub async fn drain(&self, sink: &dyn ActionSink, request: DrainRequest) -> DrainReport {
        if !request.forced && self.is_degraded() {
            debug!(target = "taskchat::queue", "drain skipped while degraded");
            return DrainReport::skipped(self.len());
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(target = "taskchat::queue", "drain already in progress");
            return DrainReport::skipped(self.len());
        }
        let _guard = DrainGuard(&self.draining);

        let batch: Vec<QueueItem> = self
            .state
            .lock()
            .items
            .iter()
            .take(self.policy.batch_size)
            .cloned()
            .collect();
        let mut report = DrainReport::default();

        for (index, item) in batch.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.policy.inter_item_delay()).await;
            }
            if !request.forced && self.is_degraded() {
                debug!(target = "taskchat::queue", id = %item.id, "drain halted; degraded");
                report.halted = true;
                break;
            }
            match sink.deliver(item).await {
                Delivery::Sent => {
                    self.retire(item.id);
                    report.delivered.push(item.id);
                }
                Delivery::Confirmed(record) => {
                    self.retire(item.id);
                    report.delivered.push(item.id);
                    report.confirmed.push((item.action.clone(), record));
                }
                Delivery::Failed(reason) => match self.record_failure(item.id, &reason) {
                    Some(dropped) => report.dropped.push(dropped),
                    None => {
                        report.failed = Some(item.id);
                        break;
                    }
                },
            }
        }

        report.remaining = self.len();
        debug!(
            target = "taskchat::queue",
            delivered = report.delivered.len(),
            dropped = report.dropped.len(),
            stuck = report.failed.is_some(),
            halted = report.halted,
            remaining = report.remaining,
            "drain finished"
        );
        report
    }

    fn retire(&self, id: Uuid) {
        let mut state = self.state.lock();
        state.items.retain(|item| item.id != id);
        state.unsynced.remove(&id);
        state.retired.insert(id);
        if let Err(err) = self.persist(&mut state) {
            warn!(target = "taskchat::queue", error = %err, "failed to persist queue");
        }
    }

    /// Bumps the attempt count in place; drops the item once it exceeds the
    /// cap and returns it.
    fn record_failure(&self, id: Uuid, reason: &str) -> Option<QueueItem> {
        let mut state = self.state.lock();
        let position = state.items.iter().position(|item| item.id == id)?;
        state.items[position].attempts += 1;
        let attempts = state.items[position].attempts;

        let dropped = if attempts > self.policy.max_queue_attempts {
            let item = state.items.remove(position);
            state.unsynced.remove(&id);
            state.retired.insert(id);
            warn!(
                target = "taskchat::queue",
                id = %item.id,
                action_type = item.action.action_type().as_str(),
                attempts,
                reason,
                "dropping action after exhausting retries"
            );
            metrics::QUEUE_DROPS
                .with_label_values(&[item.action.action_type().as_str()])
                .inc();
            Some(item)
        } else {
            debug!(
                target = "taskchat::queue",
                %id,
                attempts,
                reason,
                "delivery failed; keeping at head"
            );
            None
        };
        if let Err(err) = self.persist(&mut state) {
            warn!(target = "taskchat::queue", error = %err, "failed to persist queue");
        }
        dropped
    }

    fn persist(&self, state: &mut QueueState) -> Result<(), StoreError> {
        metrics::QUEUE_DEPTH.set(state.items.len() as i64);
        let value = serde_json::to_value(&state.items)?;
        match self.store.store_if(QUEUE_KEY, state.revision, value) {
            Ok(revision) => {
                state.revision = revision;
                state.unsynced.clear();
                state.retired.clear();
                Ok(())
            }
            Err(StoreError::Conflict { expected, found, .. }) => {
                warn!(
                    target = "taskchat::queue",
                    expected, found, "queue written elsewhere; merging"
                );
                self.merge_stored(state)?;
                let value = serde_json::to_value(&state.items)?;
                state.revision = self.store.store_if(QUEUE_KEY, state.revision, value)?;
                state.unsynced.clear();
                state.retired.clear();
                metrics::QUEUE_DEPTH.set(state.items.len() as i64);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Rebuilds the local view from the stored queue: stored order first
    /// (minus what this instance removed, with local attempt counts), then
    /// items enqueued here that the store has not seen.
    fn merge_stored(&self, state: &mut QueueState) -> Result<(), StoreError> {
        let (revision, stored) =
            store::read::<Vec<QueueItem>>(self.store.as_ref(), QUEUE_KEY)?.unwrap_or_default();
        let stored_ids: HashSet<Uuid> = stored.iter().map(|item| item.id).collect();

        let mut merged: Vec<QueueItem> = stored
            .into_iter()
            .filter(|item| !state.retired.contains(&item.id))
            .map(|item| {
                state
                    .items
                    .iter()
                    .find(|local| local.id == item.id)
                    .cloned()
                    .unwrap_or(item)
            })
            .collect();
        merged.extend(
            state
                .items
                .iter()
                .filter(|item| state.unsynced.contains(&item.id) && !stored_ids.contains(&item.id))
                .cloned(),
        );

        state.items = merged;
        state.revision = revision;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct RecordingSink {
        script: Mutex<VecDeque<Delivery>>,
        seen: Mutex<Vec<Uuid>>,
    }

    impl RecordingSink {
        fn always_ok() -> Self {
            Self::scripted([])
        }

        fn scripted(outcomes: impl IntoIterator<Item = Delivery>) -> Self {
            Self {
                script: Mutex::new(outcomes.into_iter().collect()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn seen_positions(&self, items: &[QueueItem]) -> Vec<usize> {
            self.seen
                .lock()
                .iter()
                .filter_map(|id| items.iter().position(|item| item.id == *id))
                .collect()
        }
    }

    #[async_trait]
    impl ActionSink for RecordingSink {
        async fn deliver(&self, item: &QueueItem) -> Delivery {
            self.seen.lock().push(item.id);
            self.script.lock().pop_front().unwrap_or(Delivery::Sent)
        }
    }

    struct FailingSink;

    #[async_trait]
    impl ActionSink for FailingSink {
        async fn deliver(&self, _item: &QueueItem) -> Delivery {
            Delivery::Failed("socket closed".into())
        }
    }

    fn client() -> ClientId {
        ClientId::from("client-1".to_string())
    }

    fn queue_with(store: Arc<MemoryStore>) -> OutboundQueue {
        OutboundQueue::open(store, RetryPolicy::default()).expect("open queue")
    }

    fn stored_items(store: &MemoryStore) -> Vec<QueueItem> {
        store::read::<Vec<QueueItem>>(store, QUEUE_KEY)
            .unwrap()
            .map(|(_, items)| items)
            .unwrap_or_default()
    }

    #[tokio::test(start_paused = true)]
    async fn batch_of_five_then_rest_in_enqueue_order() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone());
        for n in 0..7 {
            queue
                .enqueue(client(), Action::channel_message(1, format!("m{n}")))
                .unwrap();
        }
        let all = queue.snapshot();
        let sink = RecordingSink::always_ok();

        let first = queue.drain(&sink, DrainRequest::default()).await;
        assert_eq!(first.delivered.len(), 5);
        assert_eq!(first.remaining, 2);
        assert_eq!(stored_items(&store).len(), 2);

        let second = queue.drain(&sink, DrainRequest::default()).await;
        assert_eq!(second.delivered.len(), 2);
        assert!(queue.is_empty());
        assert_eq!(sink.seen_positions(&all), vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn inter_item_delay_spaces_deliveries() {
        let queue = queue_with(Arc::new(MemoryStore::new()));
        for n in 0..3 {
            queue
                .enqueue(client(), Action::channel_message(1, format!("m{n}")))
                .unwrap();
        }
        let started = tokio::time::Instant::now();
        queue
            .drain(&RecordingSink::always_ok(), DrainRequest::default())
            .await;
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_keeps_item_at_head_and_stops_batch() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone());
        for n in 0..3 {
            queue
                .enqueue(client(), Action::channel_message(1, format!("m{n}")))
                .unwrap();
        }
        let head = queue.snapshot()[0].id;
        let sink = RecordingSink::scripted([Delivery::Failed("send returned false".into())]);

        let report = queue.drain(&sink, DrainRequest::default()).await;
        assert_eq!(report.failed, Some(head));
        assert!(report.delivered.is_empty());
        assert!(!report.completed());
        assert_eq!(sink.seen.lock().len(), 1);

        let items = stored_items(&store);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].id, head);
        assert_eq!(items[0].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn eleventh_failure_drops_item_from_persisted_queue() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone());
        queue
            .enqueue(client(), Action::direct_message(9, "are you there?"))
            .unwrap();

        for round in 1..=10 {
            let report = queue.drain(&FailingSink, DrainRequest::default()).await;
            assert!(report.dropped.is_empty(), "dropped early in round {round}");
            let items = stored_items(&store);
            assert_eq!(items[0].attempts, round);
            assert!(items[0].attempts <= RetryPolicy::default().max_queue_attempts);
        }

        let report = queue.drain(&FailingSink, DrainRequest::default()).await;
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].attempts, 11);
        assert!(queue.is_empty());
        assert!(stored_items(&store).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_drain_is_a_no_op() {
        let queue = Arc::new(queue_with(Arc::new(MemoryStore::new())));
        for n in 0..3 {
            queue
                .enqueue(client(), Action::channel_message(1, format!("m{n}")))
                .unwrap();
        }
        let sink = Arc::new(RecordingSink::always_ok());

        let running = {
            let queue = queue.clone();
            let sink = sink.clone();
            tokio::spawn(async move { queue.drain(sink.as_ref(), DrainRequest::default()).await })
        };
        // let the first drain reach its inter-item sleep
        tokio::task::yield_now().await;
        assert!(queue.is_draining());

        let second = queue.drain(sink.as_ref(), DrainRequest::default()).await;
        assert!(second.skipped);

        let first = running.await.expect("join");
        assert_eq!(first.delivered.len(), 3);
        assert_eq!(sink.seen.lock().len(), 3);
        assert!(!queue.is_draining());
    }

    #[tokio::test]
    async fn degraded_drain_requires_force() {
        let queue = queue_with(Arc::new(MemoryStore::new()));
        queue
            .enqueue(client(), Action::channel_message(1, "hi"))
            .unwrap();
        queue.set_degraded(true);
        let sink = RecordingSink::always_ok();

        let skipped = queue.drain(&sink, DrainRequest::default()).await;
        assert!(skipped.skipped);
        assert_eq!(queue.len(), 1);

        let forced = queue.drain(&sink, DrainRequest { forced: true }).await;
        assert_eq!(forced.delivered.len(), 1);
    }

    /// Marks the queue degraded as soon as the first item goes out.
    struct DegradingSink {
        queue: Arc<OutboundQueue>,
        seen: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl ActionSink for DegradingSink {
        async fn deliver(&self, item: &QueueItem) -> Delivery {
            self.seen.lock().push(item.id);
            self.queue.set_degraded(true);
            Delivery::Sent
        }
    }

    #[tokio::test(start_paused = true)]
    async fn degrading_mid_batch_halts_the_running_drain() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(queue_with(store.clone()));
        for n in 0..4 {
            queue
                .enqueue(client(), Action::channel_message(1, format!("m{n}")))
                .unwrap();
        }
        let sink = DegradingSink {
            queue: queue.clone(),
            seen: Mutex::new(Vec::new()),
        };

        let report = queue.drain(&sink, DrainRequest::default()).await;
        assert!(report.halted);
        assert!(!report.completed());
        assert_eq!(report.delivered.len(), 1);
        assert_eq!(sink.seen.lock().len(), 1);
        assert!(report.failed.is_none());

        let items = stored_items(&store);
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|item| item.attempts == 0));

        // a forced drain ignores the flag
        let forced = queue.drain(&sink, DrainRequest { forced: true }).await;
        assert!(!forced.halted);
        assert_eq!(forced.delivered.len(), 3);
        assert!(queue.is_empty());
    }

    struct BrokenStore;

    impl LocalStore for BrokenStore {
        fn load(&self, _key: &str) -> Result<Option<store::Versioned>, StoreError> {
            Ok(None)
        }

        fn store_if(
            &self,
            _key: &str,
            _expected: u64,
            _value: serde_json::Value,
        ) -> Result<u64, StoreError> {
            Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only volume",
            )))
        }

        fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_write_leaves_nothing_queued() {
        let queue = OutboundQueue::open(Arc::new(BrokenStore), RetryPolicy::default()).unwrap();
        let action = Action::channel_message(1, "lost");

        let result = queue.enqueue(client(), action.clone());
        assert!(matches!(result, Err(StoreError::Io(_))));
        assert!(queue.is_empty());
        assert!(!queue.contains_action(action.nonce()));

        let sink = RecordingSink::always_ok();
        let report = queue.drain(&sink, DrainRequest::default()).await;
        assert!(report.delivered.is_empty());
        assert!(sink.seen.lock().is_empty());
    }

    #[test]
    fn duplicate_action_is_not_enqueued_twice() {
        let queue = queue_with(Arc::new(MemoryStore::new()));
        let action = Action::channel_message(1, "once");
        assert!(queue.enqueue(client(), action.clone()).unwrap());
        assert!(!queue.enqueue(client(), action.clone()).unwrap());
        assert_eq!(queue.len(), 1);
        assert!(queue.contains_action(action.nonce()));
    }

    #[test]
    fn queue_survives_reopen() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone());
        queue
            .enqueue(client(), Action::channel_message(3, "persist me"))
            .unwrap();
        drop(queue);

        let reopened = queue_with(store);
        let items = reopened.snapshot();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].action.content(), "persist me");
        assert_eq!(items[0].client_id, client());
    }

    #[test]
    fn concurrent_writer_items_are_merged_not_lost() {
        let store = Arc::new(MemoryStore::new());
        let tab_a = queue_with(store.clone());
        let tab_b = queue_with(store.clone());

        tab_a
            .enqueue(client(), Action::channel_message(1, "from a"))
            .unwrap();
        // b still holds revision 0 and must merge instead of clobbering
        tab_b
            .enqueue(client(), Action::channel_message(1, "from b"))
            .unwrap();

        let contents: Vec<String> = stored_items(&store)
            .iter()
            .map(|item| item.action.content().to_string())
            .collect();
        assert_eq!(contents, vec!["from a", "from b"]);
        assert_eq!(tab_b.len(), 2);
    }
}
