//! HTTP API: producer, worker and operator endpoints over the orchestrator.

pub mod app;
pub mod middleware;
