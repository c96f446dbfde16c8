//! `assetflow-lifecycle`
//!
//! **Responsibility:** the pure rules of the video-asset lifecycle.
//!
//! - The persisted [`Job`] record and its sub-state enums
//! - Admission control under per-tier and system-wide ceilings ([`ConcurrencyGate`])
//! - The asset-migration and thumbnail state machines, including their retry policies
//! - [`TransitionEvent`], the fact published after a state change is written
//!
//! Nothing in this crate performs IO or reads the clock; callers pass `now`.

pub mod admission;
pub mod job;
pub mod migration;
pub mod thumbnail;
pub mod transition;

pub use admission::{ActiveCounts, AdmissionDecision, AdmissionPlan, ConcurrencyGate, TierCeilings};
pub use job::{
    Job, LifecycleStatus, MAX_MIGRATION_ATTEMPTS, MAX_THUMBNAIL_ATTEMPTS, MigrationRecord,
    MigrationState, NewJob, OwnerTier, PLACEHOLDER_THUMBNAIL_URL, QueueRecord, StageGuard,
    ThumbnailRecord, ThumbnailState,
};
pub use migration::{MigrationRetryPolicy, MigrationStateMachine};
pub use thumbnail::{RetrySchedule, ThumbnailRetryPolicy, ThumbnailStateMachine};
pub use transition::{StageTransition, TransitionEvent, WorkerKind};
