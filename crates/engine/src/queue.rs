//! At-least-once task queue with delayed delivery.
//!
//! Redis layout per queue name:
//! - `relay:queue:{name}`      ready list (LPUSH in, RPOP out)
//! - `relay:processing:{name}` sorted set of in-flight payloads scored by pop
//!   time (unix millis), entries removed on ack
//! - `relay:delayed:{name}`    sorted set scored by due time (unix millis)
//!
//! Pop, promotion and redelivery each run as one Lua script, so a task is
//! always in exactly one of the three structures. An in-flight entry older
//! than the visibility timeout is handed back to the ready list; its worker is
//! presumed dead.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::callback::CallbackTask;
use crate::error::Result;
use crate::stage::StageTask;

/// Max members moved per queue per promotion or redelivery call.
const MOVE_BATCH: i64 = 200;

/// KEYS: ready, processing. ARGV: now millis.
static POP_SCRIPT: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r#"
        local raw = redis.call('RPOP', KEYS[1])
        if raw then
            redis.call('ZADD', KEYS[2], ARGV[1], raw)
        end
        return raw
        "#,
    )
});

/// Move members scored at or below ARGV[1] from the sorted set KEYS[1] to the
/// consumer end of the ready list KEYS[2]. ARGV[2]: batch size.
static MOVE_DUE_SCRIPT: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r#"
        local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
        for _, member in ipairs(due) do
            redis.call('ZREM', KEYS[1], member)
            redis.call('RPUSH', KEYS[2], member)
        end
        return #due
        "#,
    )
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    #[serde(rename = "send-sms-tasks")]
    SendSms,
    #[serde(rename = "send-email-tasks")]
    SendEmail,
    #[serde(rename = "research-mode-tasks")]
    ResearchMode,
    #[serde(rename = "priority-tasks")]
    Priority,
    #[serde(rename = "lookup-profile-id-tasks")]
    LookupProfileId,
    #[serde(rename = "lookup-contact-info-tasks")]
    LookupContactInfo,
    #[serde(rename = "communication-item-permissions")]
    CommunicationPermissions,
    #[serde(rename = "onsite-notification-tasks")]
    OnsiteNotifications,
    #[serde(rename = "retry-tasks")]
    Retry,
    #[serde(rename = "rate-limit-retry-tasks")]
    RateLimitRetry,
    #[serde(rename = "service-callbacks")]
    ServiceCallbacks,
}

impl QueueName {
    pub const ALL: [QueueName; 11] = [
        QueueName::Priority,
        QueueName::SendSms,
        QueueName::SendEmail,
        QueueName::ResearchMode,
        QueueName::LookupProfileId,
        QueueName::LookupContactInfo,
        QueueName::CommunicationPermissions,
        QueueName::OnsiteNotifications,
        QueueName::Retry,
        QueueName::RateLimitRetry,
        QueueName::ServiceCallbacks,
    ];

    /// [`ALL`](Self::ALL) rotated to start at `offset` (modulo the length).
    ///
    /// Workers scan from a moving offset so a busy queue early in the list
    /// cannot starve the ones after it.
    pub fn rotated(offset: usize) -> [QueueName; 11] {
        let mut queues = Self::ALL;
        let len = queues.len();
        queues.rotate_left(offset % len);
        queues
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::SendSms => "send-sms-tasks",
            QueueName::SendEmail => "send-email-tasks",
            QueueName::ResearchMode => "research-mode-tasks",
            QueueName::Priority => "priority-tasks",
            QueueName::LookupProfileId => "lookup-profile-id-tasks",
            QueueName::LookupContactInfo => "lookup-contact-info-tasks",
            QueueName::CommunicationPermissions => "communication-item-permissions",
            QueueName::OnsiteNotifications => "onsite-notification-tasks",
            QueueName::Retry => "retry-tasks",
            QueueName::RateLimitRetry => "rate-limit-retry-tasks",
            QueueName::ServiceCallbacks => "service-callbacks",
        }
    }

    fn ready_key(&self) -> String {
        format!("relay:queue:{}", self.as_str())
    }

    fn processing_key(&self) -> String {
        format!("relay:processing:{}", self.as_str())
    }

    fn delayed_key(&self) -> String {
        format!("relay:delayed:{}", self.as_str())
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| format!("unknown queue '{}'", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    Stage(StageTask),
    Callback(CallbackTask),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: Uuid,
    pub queue: QueueName,
    pub enqueued_at: DateTime<Utc>,
    pub task: Task,
    /// Exact payload as popped, needed to remove it from the in-flight list.
    #[serde(skip)]
    pub raw: Option<String>,
}

impl TaskEnvelope {
    pub fn new(queue: QueueName, task: Task) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue,
            enqueued_at: Utc::now(),
            task,
            raw: None,
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue `task`, visible to consumers after `delay`.
    async fn push(&self, queue: QueueName, task: Task, delay: Duration) -> Result<Uuid>;

    /// Take the next ready task from the first non-empty queue in `queues`.
    async fn pop(&self, queues: &[QueueName]) -> Result<Option<TaskEnvelope>>;

    /// Mark a popped task as done.
    async fn ack(&self, envelope: &TaskEnvelope) -> Result<()>;

    /// Move delayed tasks whose due time has passed onto the ready list.
    async fn promote_due(&self, queue: QueueName) -> Result<usize>;

    /// Hand back tasks popped more than `visibility` ago and never acked.
    /// They go to the consumer end of the ready list.
    async fn requeue_stale(&self, queue: QueueName, visibility: Duration) -> Result<usize>;
}

/// Redis-backed task queue.
#[derive(Clone)]
pub struct RedisTaskQueue {
    redis: ConnectionManager,
}

impl RedisTaskQueue {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn push(&self, queue: QueueName, task: Task, delay: Duration) -> Result<Uuid> {
        let envelope = TaskEnvelope::new(queue, task);
        let payload = serde_json::to_string(&envelope)?;
        let mut conn = self.redis.clone();

        if delay.is_zero() {
            let _: i64 = redis::cmd("LPUSH")
                .arg(queue.ready_key())
                .arg(&payload)
                .query_async(&mut conn)
                .await?;
        } else {
            let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            let _: i64 = redis::cmd("ZADD")
                .arg(queue.delayed_key())
                .arg(due_ms)
                .arg(&payload)
                .query_async(&mut conn)
                .await?;
        }

        tracing::debug!(
            task_id = %envelope.id,
            queue = %queue,
            delay_ms = delay.as_millis() as u64,
            "Task enqueued"
        );
        Ok(envelope.id)
    }

    async fn pop(&self, queues: &[QueueName]) -> Result<Option<TaskEnvelope>> {
        let mut conn = self.redis.clone();

        for queue in queues {
            let raw: Option<String> = POP_SCRIPT
                .key(queue.ready_key())
                .key(queue.processing_key())
                .arg(Utc::now().timestamp_millis())
                .invoke_async(&mut conn)
                .await?;

            let Some(raw) = raw else { continue };

            match serde_json::from_str::<TaskEnvelope>(&raw) {
                Ok(mut envelope) => {
                    envelope.raw = Some(raw);
                    return Ok(Some(envelope));
                }
                Err(e) => {
                    tracing::error!(queue = %queue, error = %e, "Dropping malformed task payload");
                    let _: i64 = redis::cmd("ZREM")
                        .arg(queue.processing_key())
                        .arg(&raw)
                        .query_async(&mut conn)
                        .await?;
                }
            }
        }

        Ok(None)
    }

    async fn ack(&self, envelope: &TaskEnvelope) -> Result<()> {
        let raw = match &envelope.raw {
            Some(raw) => raw.clone(),
            None => serde_json::to_string(envelope)?,
        };
        let mut conn = self.redis.clone();
        let _: i64 = redis::cmd("ZREM")
            .arg(envelope.queue.processing_key())
            .arg(raw)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn promote_due(&self, queue: QueueName) -> Result<usize> {
        let mut conn = self.redis.clone();
        let promoted: usize = MOVE_DUE_SCRIPT
            .key(queue.delayed_key())
            .key(queue.ready_key())
            .arg(Utc::now().timestamp_millis())
            .arg(MOVE_BATCH)
            .invoke_async(&mut conn)
            .await?;

        if promoted > 0 {
            tracing::debug!(queue = %queue, promoted, "Promoted delayed tasks");
        }
        Ok(promoted)
    }

    async fn requeue_stale(&self, queue: QueueName, visibility: Duration) -> Result<usize> {
        let mut conn = self.redis.clone();
        let visibility_ms = i64::try_from(visibility.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(visibility_ms);

        let requeued: usize = MOVE_DUE_SCRIPT
            .key(queue.processing_key())
            .key(queue.ready_key())
            .arg(cutoff)
            .arg(MOVE_BATCH)
            .invoke_async(&mut conn)
            .await?;

        if requeued > 0 {
            tracing::warn!(queue = %queue, requeued, "Redelivered tasks past their visibility timeout");
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{DispatchMode, PlannedStage, Stage};

    #[test]
    fn test_queue_names_round_trip_through_serde() {
        for queue in QueueName::ALL {
            let json = serde_json::to_string(&queue).unwrap();
            assert_eq!(json, format!("\"{}\"", queue.as_str()));
            assert_eq!(queue.as_str().parse::<QueueName>().unwrap(), queue);
        }
    }

    #[test]
    fn test_rotated_visits_every_queue_once() {
        assert_eq!(QueueName::rotated(0), QueueName::ALL);
        assert_eq!(QueueName::rotated(11), QueueName::ALL);

        let rotated = QueueName::rotated(5);
        assert_eq!(rotated[0], QueueName::LookupContactInfo);
        assert_eq!(rotated[10], QueueName::LookupProfileId);
        for queue in QueueName::ALL {
            assert_eq!(rotated.iter().filter(|q| **q == queue).count(), 1);
        }
    }

    #[test]
    fn test_redis_keys() {
        assert_eq!(QueueName::SendSms.ready_key(), "relay:queue:send-sms-tasks");
        assert_eq!(
            QueueName::Retry.processing_key(),
            "relay:processing:retry-tasks"
        );
        assert_eq!(
            QueueName::ServiceCallbacks.delayed_key(),
            "relay:delayed:service-callbacks"
        );
    }

    #[test]
    fn test_stage_task_envelope_wire_shape() {
        let id = Uuid::new_v4();
        let task = Task::Stage(StageTask::first(
            id,
            PlannedStage {
                stage: Stage::DispatchToProvider {
                    mode: DispatchMode::Direct,
                },
                queue: QueueName::SendEmail,
            },
            vec![],
        ));
        let envelope = TaskEnvelope::new(QueueName::SendEmail, task.clone());
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["queue"], "send-email-tasks");
        assert_eq!(value["task"]["kind"], "stage");
        assert_eq!(value["task"]["current"]["stage"]["stage"], "dispatch_to_provider");
        assert_eq!(value["task"]["current"]["stage"]["mode"]["mode"], "direct");
        assert!(value.get("raw").is_none());

        let back: TaskEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(back.task, task);
        assert!(back.raw.is_none());
    }
}
