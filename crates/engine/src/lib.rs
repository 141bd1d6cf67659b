//! Notification delivery engine.
//!
//! Owns the status state machine, pipeline planning, stage execution, the
//! task queue, delivery receipts and the timeout sweep. Binaries wire the
//! Postgres and Redis implementations; tests use the in-memory ones.

pub mod callback;
pub mod classifier;
pub mod collaborators;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod memory;
pub mod pipeline;
pub mod planner;
pub mod queue;
pub mod rate_limit;
pub mod receipts;
pub mod retry;
pub mod stage;
pub mod store;
pub mod sweep;

pub use error::{EngineError, Result};
