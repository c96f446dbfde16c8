//! Infrastructure layer: job store, orchestration, dispatch, reclamation,
//! workers and their HTTP collaborators.

pub mod background;
pub mod clients;
pub mod config;
pub mod dispatch;
pub mod orchestrator;
pub mod reclaimer;
pub mod store;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use background::WorkerHandle;
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError};
pub use reclaimer::{Reclaimer, ReclaimerConfig, SweepReport};
pub use store::{InMemoryJobStore, JobStore, PostgresJobStore, StoreError};
