//! Task consumer.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use relay_engine::callback::CallbackTask;
use relay_engine::error::Result;
use relay_engine::executor::StageExecutor;
use relay_engine::queue::{QueueName, Task, TaskEnvelope, TaskQueue};
use relay_notifier::delivery::{CallbackDelivery, DeliveryResult};

/// Delay before a task that hit an infrastructure error runs again.
pub const INFRA_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Pops tasks across every queue and routes them to the stage executor or
/// callback delivery.
///
/// Each poll starts scanning one queue further along than the last, so every
/// queue is looked at first once per cycle of [`QueueName::ALL`].
pub struct Worker {
    id: usize,
    /// Offset into [`QueueName::ALL`] for the next poll.
    cursor: AtomicUsize,
    queue: Arc<dyn TaskQueue>,
    executor: StageExecutor,
    callbacks: CallbackDelivery,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: Arc<dyn TaskQueue>,
        executor: StageExecutor,
        callbacks: CallbackDelivery,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id,
            cursor: AtomicUsize::new(id),
            queue,
            executor,
            callbacks,
            poll_interval,
        }
    }

    /// Consume tasks until the task is cancelled.
    pub async fn run(&self) {
        tracing::info!(worker = self.id, "Worker started");

        loop {
            match self.tick().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => {
                    tracing::error!(worker = self.id, error = %e, "Queue error, backing off");
                    tokio::time::sleep(INFRA_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Handle at most one task. Returns `false` when every queue was empty.
    pub async fn tick(&self) -> Result<bool> {
        let offset = self.cursor.fetch_add(1, Ordering::Relaxed);
        let Some(envelope) = self.queue.pop(&QueueName::rotated(offset)).await? else {
            return Ok(false);
        };
        self.handle(envelope).await?;
        Ok(true)
    }

    /// Process a popped task and acknowledge it.
    ///
    /// A task whose processing fails on infrastructure is pushed again with a
    /// delay before the ack, so it is never lost.
    pub async fn handle(&self, envelope: TaskEnvelope) -> Result<()> {
        let result = match &envelope.task {
            Task::Stage(task) => self.executor.execute(task.clone()).await.map(|report| {
                tracing::debug!(
                    worker = self.id,
                    notification_id = %task.notification_id,
                    stage = %task.current.stage.kind(),
                    report = ?report,
                    "Stage task processed"
                );
            }),
            Task::Callback(task) => self.deliver_callback(task).await,
        };

        if let Err(e) = result {
            tracing::warn!(
                worker = self.id,
                task_id = %envelope.id,
                queue = %envelope.queue,
                error = %e,
                "Task failed on infrastructure error, re-queueing"
            );
            self.queue
                .push(envelope.queue, envelope.task.clone(), INFRA_RETRY_DELAY)
                .await?;
        }

        self.queue.ack(&envelope).await
    }

    async fn deliver_callback(&self, task: &CallbackTask) -> Result<()> {
        match self.callbacks.deliver(task).await? {
            DeliveryResult::Delivered | DeliveryResult::Dropped { .. } => Ok(()),
            DeliveryResult::Retry { task, delay } => {
                self.queue
                    .push(QueueName::ServiceCallbacks, Task::Callback(task), delay)
                    .await?;
                Ok(())
            }
        }
    }
}
