//! In-process stores, queue and rate limiter.
//!
//! Used by tests and by single-process deployments that do not need
//! Postgres or Redis. Semantics match the Postgres/Redis implementations,
//! including the compare-and-set status write.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use relay_common::types::{
    CallbackEndpoint, CommunicationItem, Notification, NotificationStatus, RecipientIdentifier,
    SenderRateLimit,
};

use crate::error::{EngineError, Result};
use crate::ledger::StatusChange;
use crate::queue::{QueueName, Task, TaskEnvelope, TaskQueue};
use crate::rate_limit::RateLimiter;
use crate::store::{NotificationStore, ServiceConfigStore};

#[derive(Default)]
pub struct MemoryNotificationStore {
    rows: Mutex<HashMap<Uuid, Notification>>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn insert(&self, notification: &Notification) -> Result<()> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&notification.id) {
            return Err(EngineError::Validation(format!(
                "notification {} already exists",
                notification.id
            )));
        }
        rows.insert(notification.id, notification.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Notification>> {
        Ok(self.rows.lock().await.get(&id).cloned())
    }

    async fn get_status(&self, id: Uuid) -> Result<Option<NotificationStatus>> {
        Ok(self.rows.lock().await.get(&id).map(|n| n.status))
    }

    async fn get_by_reference(&self, reference: &str) -> Result<Option<Notification>> {
        let rows = self.rows.lock().await;
        let mut matches = rows
            .values()
            .filter(|n| n.reference.as_deref() == Some(reference));

        let first = matches.next().cloned();
        if matches.next().is_some() {
            return Err(EngineError::AmbiguousReference(reference.to_string()));
        }
        Ok(first)
    }

    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: NotificationStatus,
        status: NotificationStatus,
        change: &StatusChange,
        at: DateTime<Utc>,
    ) -> Result<Option<Notification>> {
        let mut rows = self.rows.lock().await;
        let Some(row) = rows.get_mut(&id) else {
            return Ok(None);
        };
        if row.status != expected {
            return Ok(None);
        }

        row.status = status;
        row.status_reason = change.reason.clone();
        if row.sent_by.is_none() {
            row.sent_by = change.sent_by.clone();
        }
        if change.reference.is_some() {
            row.reference = change.reference.clone();
        }
        if status == NotificationStatus::Sending && row.sent_at.is_none() {
            row.sent_at = Some(at);
        }
        row.updated_at = Some(at);

        Ok(Some(row.clone()))
    }

    async fn add_identifier(&self, identifier: &RecipientIdentifier) -> Result<()> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .get_mut(&identifier.notification_id)
            .ok_or(EngineError::NotFound(identifier.notification_id))?;
        row.recipient_identifiers
            .retain(|existing| existing.id_type != identifier.id_type);
        row.recipient_identifiers.push(identifier.clone());
        Ok(())
    }

    async fn set_recipient(&self, id: Uuid, recipient: &str) -> Result<()> {
        let mut rows = self.rows.lock().await;
        let row = rows.get_mut(&id).ok_or(EngineError::NotFound(id))?;
        row.recipient = Some(recipient.to_string());
        row.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn find_stale(
        &self,
        statuses: &[NotificationStatus],
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>> {
        let rows = self.rows.lock().await;
        let mut stale: Vec<Notification> = rows
            .values()
            .filter(|n| statuses.contains(&n.status) && n.created_at < older_than)
            .cloned()
            .collect();
        stale.sort_by_key(|n| n.created_at);
        stale.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(stale)
    }
}

/// Fixed service configuration, assembled with the `with_*` builders.
#[derive(Default, Clone)]
pub struct MemoryServiceConfigStore {
    items: HashMap<Uuid, CommunicationItem>,
    rate_limits: HashMap<Uuid, SenderRateLimit>,
    endpoints: HashMap<Uuid, CallbackEndpoint>,
}

impl MemoryServiceConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_communication_item(mut self, item: CommunicationItem) -> Self {
        self.items.insert(item.id, item);
        self
    }

    pub fn with_sender_rate_limit(mut self, limit: SenderRateLimit) -> Self {
        self.rate_limits.insert(limit.sender_id, limit);
        self
    }

    pub fn with_callback_endpoint(mut self, endpoint: CallbackEndpoint) -> Self {
        self.endpoints.insert(endpoint.service_id, endpoint);
        self
    }
}

#[async_trait]
impl ServiceConfigStore for MemoryServiceConfigStore {
    async fn communication_item(&self, id: Uuid) -> Result<Option<CommunicationItem>> {
        Ok(self.items.get(&id).cloned())
    }

    async fn sender_rate_limit(&self, sender_id: Uuid) -> Result<Option<SenderRateLimit>> {
        Ok(self.rate_limits.get(&sender_id).cloned())
    }

    async fn callback_endpoint(&self, service_id: Uuid) -> Result<Option<CallbackEndpoint>> {
        Ok(self.endpoints.get(&service_id).cloned())
    }
}

/// A push recorded by [`MemoryTaskQueue`].
#[derive(Debug, Clone)]
pub struct PushedTask {
    pub queue: QueueName,
    pub task: Task,
    pub delay: Duration,
}

#[derive(Default)]
struct QueueState {
    ready: HashMap<QueueName, VecDeque<TaskEnvelope>>,
    delayed: Vec<(DateTime<Utc>, TaskEnvelope)>,
    /// Popped envelopes with their pop time.
    in_flight: HashMap<Uuid, (DateTime<Utc>, TaskEnvelope)>,
    pushed: Vec<PushedTask>,
}

#[derive(Default)]
pub struct MemoryTaskQueue {
    state: Mutex<QueueState>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every push so far, in order.
    pub async fn pushed(&self) -> Vec<PushedTask> {
        self.state.lock().await.pushed.clone()
    }

    /// Popped but not yet acknowledged.
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    /// Tasks waiting, ready or delayed.
    pub async fn pending(&self) -> usize {
        let state = self.state.lock().await;
        state.ready.values().map(VecDeque::len).sum::<usize>() + state.delayed.len()
    }

    /// Pop the next task ignoring delays: ready tasks first, then the delayed
    /// task due soonest. Lets tests drive retries without sleeping.
    pub async fn take_next(&self) -> Option<TaskEnvelope> {
        let mut state = self.state.lock().await;

        let ready = QueueName::ALL
            .into_iter()
            .find_map(|q| state.ready.get_mut(&q).and_then(VecDeque::pop_front));

        let envelope = match ready {
            Some(envelope) => envelope,
            None => {
                let soonest = state
                    .delayed
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, (due, _))| *due)
                    .map(|(index, _)| index)?;
                state.delayed.remove(soonest).1
            }
        };

        state
            .in_flight
            .insert(envelope.id, (Utc::now(), envelope.clone()));
        Some(envelope)
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn push(&self, queue: QueueName, task: Task, delay: Duration) -> Result<Uuid> {
        let envelope = TaskEnvelope::new(queue, task.clone());
        let id = envelope.id;
        let mut state = self.state.lock().await;

        state.pushed.push(PushedTask { queue, task, delay });
        if delay.is_zero() {
            state.ready.entry(queue).or_default().push_back(envelope);
        } else {
            let due = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            state.delayed.push((due, envelope));
        }
        Ok(id)
    }

    async fn pop(&self, queues: &[QueueName]) -> Result<Option<TaskEnvelope>> {
        let mut state = self.state.lock().await;
        let envelope = queues
            .iter()
            .find_map(|q| state.ready.get_mut(q).and_then(VecDeque::pop_front));

        if let Some(envelope) = &envelope {
            state
                .in_flight
                .insert(envelope.id, (Utc::now(), envelope.clone()));
        }
        Ok(envelope)
    }

    async fn ack(&self, envelope: &TaskEnvelope) -> Result<()> {
        self.state.lock().await.in_flight.remove(&envelope.id);
        Ok(())
    }

    async fn promote_due(&self, queue: QueueName) -> Result<usize> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.delayed)
            .into_iter()
            .partition(|(at, envelope)| envelope.queue == queue && *at <= now);
        state.delayed = waiting;

        let promoted = due.len();
        let ready = state.ready.entry(queue).or_default();
        for (_, envelope) in due {
            ready.push_back(envelope);
        }
        Ok(promoted)
    }

    async fn requeue_stale(&self, queue: QueueName, visibility: Duration) -> Result<usize> {
        let mut state = self.state.lock().await;
        let cutoff = chrono::Duration::from_std(visibility)
            .ok()
            .and_then(|v| Utc::now().checked_sub_signed(v))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let stale: Vec<Uuid> = state
            .in_flight
            .iter()
            .filter(|(_, (popped_at, envelope))| envelope.queue == queue && *popped_at <= cutoff)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            if let Some((_, envelope)) = state.in_flight.remove(id) {
                state.ready.entry(queue).or_default().push_front(envelope);
            }
        }
        Ok(stale.len())
    }
}

/// Fixed-window sender rate limiter held in process memory.
#[derive(Default)]
pub struct MemoryRateLimiter {
    windows: Mutex<HashMap<Uuid, (Instant, i64)>>,
}

impl MemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn try_acquire(&self, limit: &SenderRateLimit) -> Result<bool> {
        if !limit.is_enabled() {
            return Ok(true);
        }

        let interval =
            Duration::from_secs(u64::try_from(limit.rate_limit_interval_secs).unwrap_or(0));
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let window = windows.entry(limit.sender_id).or_insert((now, 0));

        if now.duration_since(window.0) >= interval {
            *window = (now, 0);
        }
        window.1 += 1;
        Ok(window.1 <= i64::from(limit.rate_limit))
    }
}

#[cfg(test)]
pub(crate) fn test_notification(channel: relay_common::types::ChannelType) -> Notification {
    Notification::new(Uuid::new_v4(), channel, Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{CallbackPayload, CallbackTask};
    use relay_common::types::ChannelType;

    fn callback_task() -> Task {
        let n = test_notification(ChannelType::Email);
        Task::Callback(CallbackTask {
            service_id: n.service_id,
            payload: CallbackPayload::from_notification(&n, None),
            attempt: 1,
        })
    }

    #[tokio::test]
    async fn test_queue_delay_and_promotion() {
        let queue = MemoryTaskQueue::new();
        queue
            .push(QueueName::Retry, callback_task(), Duration::from_secs(3600))
            .await
            .unwrap();
        queue
            .push(QueueName::Retry, callback_task(), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(queue.promote_due(QueueName::Retry).await.unwrap(), 0);
        let first = queue.pop(&[QueueName::Retry]).await.unwrap().unwrap();
        assert!(queue.pop(&[QueueName::Retry]).await.unwrap().is_none());
        assert_eq!(queue.in_flight().await, 1);

        queue.ack(&first).await.unwrap();
        assert_eq!(queue.in_flight().await, 0);

        // The delayed task is still reachable without waiting.
        assert!(queue.take_next().await.is_some());
        assert_eq!(queue.pending().await, 0);
    }

    #[tokio::test]
    async fn test_pop_respects_queue_order() {
        let queue = MemoryTaskQueue::new();
        queue
            .push(QueueName::SendEmail, callback_task(), Duration::ZERO)
            .await
            .unwrap();
        queue
            .push(QueueName::Priority, callback_task(), Duration::ZERO)
            .await
            .unwrap();

        let envelope = queue
            .pop(&[QueueName::Priority, QueueName::SendEmail])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.queue, QueueName::Priority);
    }

    #[tokio::test]
    async fn test_rate_limiter_window() {
        let limiter = MemoryRateLimiter::new();
        let limit = SenderRateLimit {
            sender_id: Uuid::new_v4(),
            rate_limit: 2,
            rate_limit_interval_secs: 60,
        };
        assert!(limiter.try_acquire(&limit).await.unwrap());
        assert!(limiter.try_acquire(&limit).await.unwrap());
        assert!(!limiter.try_acquire(&limit).await.unwrap());

        let other = SenderRateLimit {
            sender_id: Uuid::new_v4(),
            ..limit
        };
        assert!(limiter.try_acquire(&other).await.unwrap());
    }

    #[tokio::test]
    async fn test_unacked_task_is_redelivered_after_visibility_timeout() {
        let queue = MemoryTaskQueue::new();
        queue
            .push(QueueName::LookupContactInfo, callback_task(), Duration::ZERO)
            .await
            .unwrap();

        let abandoned = queue.pop(&QueueName::ALL).await.unwrap().unwrap();
        assert!(queue.pop(&QueueName::ALL).await.unwrap().is_none());

        // Still within its visibility window.
        assert_eq!(
            queue
                .requeue_stale(QueueName::LookupContactInfo, Duration::from_secs(300))
                .await
                .unwrap(),
            0
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            queue
                .requeue_stale(QueueName::LookupContactInfo, Duration::from_millis(10))
                .await
                .unwrap(),
            1
        );
        assert_eq!(queue.in_flight().await, 0);

        let redelivered = queue.pop(&QueueName::ALL).await.unwrap().unwrap();
        assert_eq!(redelivered.id, abandoned.id);
        assert_eq!(redelivered.task, abandoned.task);
    }

    #[tokio::test]
    async fn test_reference_lookup_rejects_duplicates() {
        let store = MemoryNotificationStore::new();
        for _ in 0..2 {
            let mut n = test_notification(ChannelType::Sms);
            n.reference = Some("dup".to_string());
            store.insert(&n).await.unwrap();
        }
        let err = store.get_by_reference("dup").await.unwrap_err();
        assert!(matches!(err, EngineError::AmbiguousReference(_)));
        assert!(store.get_by_reference("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_stale_filters_and_orders() {
        let store = MemoryNotificationStore::new();
        let now = Utc::now();

        let mut old = test_notification(ChannelType::Sms);
        old.created_at = now - chrono::Duration::days(4);
        let mut older = test_notification(ChannelType::Sms);
        older.created_at = now - chrono::Duration::days(5);
        let mut delivered = test_notification(ChannelType::Sms);
        delivered.created_at = now - chrono::Duration::days(5);
        delivered.status = NotificationStatus::Delivered;
        let fresh = test_notification(ChannelType::Sms);

        for n in [&old, &older, &delivered, &fresh] {
            store.insert(n).await.unwrap();
        }

        let stale = store
            .find_stale(
                &[NotificationStatus::Created],
                now - chrono::Duration::days(3),
                10,
            )
            .await
            .unwrap();
        let ids: Vec<_> = stale.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![older.id, old.id]);
    }
}
