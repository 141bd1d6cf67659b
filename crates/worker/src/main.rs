//! Relay worker binary entrypoint.

use std::sync::Arc;
use std::time::Duration;

use relay_common::config::AppConfig;
use relay_common::db::{create_pool, run_migrations};
use relay_common::redis_pool::create_redis_pool;
use relay_engine::callback::CallbackDispatcher;
use relay_engine::collaborators::Collaborators;
use relay_engine::executor::StageExecutor;
use relay_engine::ledger::StatusLedger;
use relay_engine::queue::{RedisTaskQueue, TaskQueue};
use relay_engine::rate_limit::RedisRateLimiter;
use relay_engine::retry::RetryConfig;
use relay_engine::store::{PgNotificationStore, PgServiceConfigStore, ServiceConfigStore};
use relay_engine::sweep::TimeoutSweep;
use relay_notifier::delivery::{CallbackDelivery, CallbackPolicy};
use relay_notifier::gateway::GatewayClient;
use relay_notifier::webhook::HttpCallbackTransport;

use relay_worker::background::{run_promoter, run_reaper, run_sweeper};
use relay_worker::worker::Worker;

const PROMOTE_INTERVAL: Duration = Duration::from_secs(1);
const REAP_INTERVAL: Duration = Duration::from_secs(30);
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_worker=info,relay_engine=info,relay_notifier=info".into()),
        )
        .json()
        .init();

    tracing::info!("Relay worker starting...");

    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;

    let redis = create_redis_pool(&config.redis_url).await?;

    let gateway_url = config
        .gateway_url
        .clone()
        .ok_or_else(|| anyhow::anyhow!("GATEWAY_URL environment variable is required by the worker"))?;
    let gateway = Arc::new(GatewayClient::new(gateway_url, config.gateway_api_key.clone())?);

    let queue: Arc<dyn TaskQueue> = Arc::new(RedisTaskQueue::new(redis.clone()));
    let service_config: Arc<dyn ServiceConfigStore> =
        Arc::new(PgServiceConfigStore::new(pool.clone()));
    let ledger = StatusLedger::new(Arc::new(PgNotificationStore::new(pool.clone())));

    let executor = StageExecutor::new(
        ledger.clone(),
        service_config.clone(),
        queue.clone(),
        Collaborators::new(
            gateway.clone(),
            gateway.clone(),
            gateway.clone(),
            gateway.clone(),
            gateway,
        ),
        Arc::new(RedisRateLimiter::new(redis)),
        RetryConfig::from(&config),
    );
    let delivery = CallbackDelivery::new(
        service_config.clone(),
        Arc::new(HttpCallbackTransport::new(CALLBACK_TIMEOUT)?),
        CallbackPolicy::default(),
    );
    let sweep = TimeoutSweep::new(
        ledger,
        CallbackDispatcher::new(service_config, queue.clone()),
        Duration::from_secs(config.sending_timeout_secs),
    );

    let mut tasks = tokio::task::JoinSet::new();
    for id in 0..config.worker_concurrency.max(1) {
        let worker = Worker::new(
            id,
            queue.clone(),
            executor.clone(),
            delivery.clone(),
            Duration::from_millis(config.worker_poll_interval_ms),
        );
        tasks.spawn(async move { worker.run().await });
    }
    tasks.spawn(run_promoter(queue.clone(), PROMOTE_INTERVAL));
    tasks.spawn(run_reaper(
        queue,
        REAP_INTERVAL,
        Duration::from_secs(config.task_visibility_timeout_secs),
    ));
    tasks.spawn(run_sweeper(
        sweep,
        Duration::from_secs(config.sweep_interval_secs.max(1)),
    ));

    tracing::info!(
        workers = config.worker_concurrency.max(1),
        sweep_interval_secs = config.sweep_interval_secs,
        sending_timeout_secs = config.sending_timeout_secs,
        task_visibility_timeout_secs = config.task_visibility_timeout_secs,
        "Relay worker running"
    );

    tokio::select! {
        Some(result) = tasks.join_next() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task exited unexpectedly");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    tasks.shutdown().await;
    tracing::info!("Relay worker stopped.");
    Ok(())
}
