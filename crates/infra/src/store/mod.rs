//! Job record persistence.
//!
//! Every sub-lifecycle write goes through a compare-and-swap on
//! [`StageGuard`]: the update applies only if the row still holds the expected
//! state and attempt count. A writer that loses the race gets
//! [`CasOutcome::LostRace`] back and must treat that as "someone else moved
//! the job on", not as an error.

mod in_memory;
mod postgres;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use assetflow_core::{DomainError, JobId};
use assetflow_lifecycle::{
    ConcurrencyGate, Job, LifecycleStatus, MigrationRecord, MigrationState, StageGuard,
    ThumbnailRecord, ThumbnailState,
};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    /// A concurrent transaction touched the same rows; the caller may retry.
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result of a conditional sub-lifecycle write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write applied; carries the job as stored afterwards.
    Applied(Job),
    /// The row no longer matched the guard. Nothing was written.
    LostRace,
}

impl CasOutcome {
    pub fn applied(self) -> Option<Job> {
        match self {
            CasOutcome::Applied(job) => Some(job),
            CasOutcome::LostRace => None,
        }
    }
}

/// What admission did to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Admitted(Job),
    /// Left pending with a queue position (freshly assigned or kept).
    Queued(Job),
    /// Not pending any more; untouched.
    Unchanged(Job),
}

impl AdmissionOutcome {
    pub fn job(&self) -> &Job {
        match self {
            AdmissionOutcome::Admitted(job)
            | AdmissionOutcome::Queued(job)
            | AdmissionOutcome::Unchanged(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            AdmissionOutcome::Admitted(job)
            | AdmissionOutcome::Queued(job)
            | AdmissionOutcome::Unchanged(job) => job,
        }
    }
}

/// A producer status write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleChange {
    pub previous: LifecycleStatus,
    pub job: Job,
    /// False when the job already had the requested status.
    pub changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub total: u64,
    pub queued: u64,
    pub lifecycle: StatusCounts,
    pub migrations_active: u64,
    pub migrations_completed: u64,
    pub migrations_failed: u64,
    pub migrations_exhausted: u64,
    pub thumbnails_active: u64,
    pub thumbnails_completed: u64,
    pub thumbnails_failed: u64,
    pub undispatched: u64,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: Job) -> Result<(), StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Apply a producer status update, optionally recording the transient asset
    /// URL in the same write.
    async fn set_lifecycle_status(
        &self,
        id: JobId,
        status: LifecycleStatus,
        transient_asset_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<LifecycleChange, StoreError>;

    /// Run `id` through the gate. Counting active jobs and writing the decision
    /// happen atomically, so concurrent admissions cannot both take the last slot.
    async fn admit(
        &self,
        id: JobId,
        gate: &ConcurrencyGate,
        now: DateTime<Utc>,
    ) -> Result<AdmissionOutcome, StoreError>;

    /// Pending jobs queued behind `after_position`, lowest position first. Pass
    /// `0` for the head of the queue and the last position seen to page on.
    async fn queued(&self, after_position: i64, limit: usize) -> Result<Vec<Job>, StoreError>;

    async fn swap_migration(
        &self,
        id: JobId,
        expected: StageGuard<MigrationState>,
        next: MigrationRecord,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError>;

    async fn swap_thumbnail(
        &self,
        id: JobId,
        expected: StageGuard<ThumbnailState>,
        next: ThumbnailRecord,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError>;

    /// Record (or clear, with `None`) the last dispatch diagnostic.
    async fn set_dispatch_error(
        &self,
        id: JobId,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Jobs whose migration sits in an active state with no transition since `cutoff`.
    async fn stale_migrations(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    async fn stale_thumbnails(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    /// Failed migrations, fewest attempts first, then oldest job first.
    async fn failed_migrations(&self, limit: usize) -> Result<Vec<Job>, StoreError>;

    async fn failed_thumbnails(&self, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Jobs carrying a dispatch diagnostic.
    async fn undispatched(&self, limit: usize) -> Result<Vec<Job>, StoreError>;

    async fn stats(&self) -> Result<JobStats, StoreError>;
}

pub(crate) fn tally(jobs: &[&Job], max_migration_attempts: u32) -> JobStats {
    let mut stats = JobStats::default();
    for job in jobs {
        stats.total += 1;
        match job.lifecycle_status {
            LifecycleStatus::Pending => stats.lifecycle.pending += 1,
            LifecycleStatus::Processing => stats.lifecycle.processing += 1,
            LifecycleStatus::Completed => stats.lifecycle.completed += 1,
            LifecycleStatus::Failed => stats.lifecycle.failed += 1,
        }
        if job.queue.position.is_some() {
            stats.queued += 1;
        }
        match job.migration.state {
            s if s.is_active() => stats.migrations_active += 1,
            MigrationState::Completed => stats.migrations_completed += 1,
            MigrationState::Failed if job.migration.attempts >= max_migration_attempts => {
                stats.migrations_failed += 1;
                stats.migrations_exhausted += 1;
            }
            MigrationState::Failed => stats.migrations_failed += 1,
            _ => {}
        }
        match job.thumbnail.state {
            s if s.is_active() => stats.thumbnails_active += 1,
            ThumbnailState::Completed => stats.thumbnails_completed += 1,
            ThumbnailState::Failed => stats.thumbnails_failed += 1,
            _ => {}
        }
        if job.dispatch_error.is_some() {
            stats.undispatched += 1;
        }
    }
    stats
}
