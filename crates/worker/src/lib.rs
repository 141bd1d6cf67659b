//! Relay background worker.
//!
//! Consumes stage and callback tasks from the queues, promotes delayed
//! tasks once they are due, and runs the timeout sweep.

pub mod background;
pub mod worker;
