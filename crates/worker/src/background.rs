//! Periodic loops that run beside the task workers.

use std::sync::Arc;
use std::time::Duration;

use relay_engine::error::Result;
use relay_engine::queue::{QueueName, TaskQueue};
use relay_engine::sweep::TimeoutSweep;

/// Promote due tasks on every queue. Returns how many moved.
pub async fn promote_all(queue: &dyn TaskQueue) -> Result<usize> {
    let mut promoted = 0;
    for name in QueueName::ALL {
        promoted += queue.promote_due(name).await?;
    }
    Ok(promoted)
}

/// Run [`promote_all`] every `interval`. Runs until the task is cancelled.
pub async fn run_promoter(queue: Arc<dyn TaskQueue>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match promote_all(queue.as_ref()).await {
            Ok(0) => {}
            Ok(promoted) => tracing::debug!(promoted, "Promoted delayed tasks"),
            Err(e) => tracing::error!(error = %e, "Failed to promote delayed tasks"),
        }
    }
}

/// Redeliver tasks on every queue that were popped more than `visibility` ago
/// and never acked. Returns how many moved.
pub async fn requeue_all_stale(queue: &dyn TaskQueue, visibility: Duration) -> Result<usize> {
    let mut requeued = 0;
    for name in QueueName::ALL {
        requeued += queue.requeue_stale(name, visibility).await?;
    }
    Ok(requeued)
}

/// Run [`requeue_all_stale`] every `interval`. Runs until the task is cancelled.
pub async fn run_reaper(queue: Arc<dyn TaskQueue>, interval: Duration, visibility: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(e) = requeue_all_stale(queue.as_ref(), visibility).await {
            tracing::error!(error = %e, "Failed to redeliver abandoned tasks");
        }
    }
}

/// Run the timeout sweep every `interval`. Runs until the task is cancelled.
pub async fn run_sweeper(sweep: TimeoutSweep, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(e) = sweep.run_once().await {
            tracing::error!(error = %e, "Timeout sweep failed");
        }
    }
}
