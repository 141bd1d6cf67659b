//! Shared application state for the Axum API server.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use sqlx::PgPool;

use relay_common::config::AppConfig;
use relay_engine::callback::CallbackDispatcher;
use relay_engine::ledger::StatusLedger;
use relay_engine::queue::{RedisTaskQueue, TaskQueue};
use relay_engine::receipts::ReceiptProcessor;
use relay_engine::store::{PgNotificationStore, PgServiceConfigStore};

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: AppConfig,
    pub ledger: StatusLedger,
    pub receipts: ReceiptProcessor,
}

impl AppState {
    pub fn new(pool: PgPool, redis: ConnectionManager, config: AppConfig) -> Self {
        Self::with_queue(pool, Arc::new(RedisTaskQueue::new(redis)), config)
    }

    /// Build state over an explicit task queue. Callbacks triggered by
    /// receipts are pushed there.
    pub fn with_queue(pool: PgPool, queue: Arc<dyn TaskQueue>, config: AppConfig) -> Self {
        let ledger = StatusLedger::new(Arc::new(PgNotificationStore::new(pool.clone())));
        let callbacks =
            CallbackDispatcher::new(Arc::new(PgServiceConfigStore::new(pool.clone())), queue);
        let receipts = ReceiptProcessor::new(ledger.clone(), callbacks);

        Self {
            pool,
            config,
            ledger,
            receipts,
        }
    }
}
