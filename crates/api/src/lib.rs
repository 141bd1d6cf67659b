//! Relay HTTP API.
//!
//! Endpoints:
//! - GET  /health: liveness plus database reachability
//! - GET  /api/notifications/{id}: status of one of the caller's notifications
//! - POST /api/receipts: provider delivery receipts

pub mod middleware;
pub mod routes;
pub mod state;
