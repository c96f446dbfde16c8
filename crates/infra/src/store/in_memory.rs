use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use assetflow_core::JobId;
use assetflow_lifecycle::{
    ActiveCounts, AdmissionPlan, ConcurrencyGate, Job, LifecycleStatus, MAX_MIGRATION_ATTEMPTS,
    MigrationRecord, MigrationState, StageGuard, ThumbnailRecord, ThumbnailState,
};

use super::{AdmissionOutcome, CasOutcome, JobStats, JobStore, LifecycleChange, StoreError, tally};

#[derive(Debug)]
struct State {
    jobs: HashMap<JobId, Job>,
    /// Last queue position handed out. Positions are never reused.
    last_position: i64,
}

/// In-memory job store for tests/dev.
///
/// Each operation runs under one lock acquisition, which gives the same
/// atomicity the Postgres store gets from row locks and transactions.
#[derive(Debug)]
pub struct InMemoryJobStore {
    state: RwLock<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State {
                jobs: HashMap::new(),
                last_position: 0,
            }),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Storage("job store lock poisoned".to_string()))
    }

    /// Jobs matching `filter`, oldest first.
    fn select<F>(&self, limit: usize, filter: F) -> Result<Vec<Job>, StoreError>
    where
        F: Fn(&Job) -> bool,
    {
        let state = self.read()?;
        let mut result: Vec<Job> = state.jobs.values().filter(|j| filter(j)).cloned().collect();
        result.sort_by_key(|j| j.created_at);
        result.truncate(limit);
        Ok(result)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn active_counts(jobs: &HashMap<JobId, Job>, job: &Job) -> ActiveCounts {
    let mut counts = ActiveCounts::default();
    for other in jobs.values() {
        if other.lifecycle_status != LifecycleStatus::Processing {
            continue;
        }
        counts.system += 1;
        if other.owner_id == job.owner_id {
            counts.owner += 1;
        }
    }
    counts
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        state.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    async fn set_lifecycle_status(
        &self,
        id: JobId,
        status: LifecycleStatus,
        transient_asset_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<LifecycleChange, StoreError> {
        let mut state = self.write()?;
        let current = state.jobs.get(&id).ok_or(StoreError::NotFound(id))?;

        // Work on a copy so a rejected transition leaves the row untouched.
        let mut job = current.clone();
        let previous = job.lifecycle_status;
        let mut changed = false;
        if let Some(url) = transient_asset_url {
            changed |= job.set_transient_asset_url(url)?;
        }
        changed |= job.apply_lifecycle_status(status, now)?;
        if changed {
            job.updated_at = now;
            state.jobs.insert(id, job.clone());
        }
        Ok(LifecycleChange {
            previous,
            job,
            changed: previous != status,
        })
    }

    async fn admit(
        &self,
        id: JobId,
        gate: &ConcurrencyGate,
        now: DateTime<Utc>,
    ) -> Result<AdmissionOutcome, StoreError> {
        let mut state = self.write()?;
        let job = state.jobs.get(&id).ok_or(StoreError::NotFound(id))?;
        let plan = gate.plan(job, active_counts(&state.jobs, job));

        let outcome = match plan {
            AdmissionPlan::NoOp => AdmissionOutcome::Unchanged(job.clone()),
            AdmissionPlan::StayQueued => AdmissionOutcome::Queued(job.clone()),
            AdmissionPlan::Admit => {
                let mut job = job.clone();
                job.admit(now);
                AdmissionOutcome::Admitted(job)
            }
            AdmissionPlan::Enqueue => {
                let mut job = job.clone();
                state.last_position += 1;
                job.enqueue(state.last_position, now);
                AdmissionOutcome::Queued(job)
            }
        };
        if matches!(plan, AdmissionPlan::Admit | AdmissionPlan::Enqueue) {
            state.jobs.insert(id, outcome.job().clone());
        }
        Ok(outcome)
    }

    async fn queued(&self, after_position: i64, limit: usize) -> Result<Vec<Job>, StoreError> {
        let state = self.read()?;
        let mut result: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| {
                j.lifecycle_status == LifecycleStatus::Pending
                    && j.queue.position.is_some_and(|p| p > after_position)
            })
            .cloned()
            .collect();
        result.sort_by_key(|j| j.queue.position);
        result.truncate(limit);
        Ok(result)
    }

    async fn swap_migration(
        &self,
        id: JobId,
        expected: StageGuard<MigrationState>,
        next: MigrationRecord,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError> {
        let mut state = self.write()?;
        let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.migration.guard() != expected {
            return Ok(CasOutcome::LostRace);
        }
        job.migration = next;
        job.updated_at = now;
        Ok(CasOutcome::Applied(job.clone()))
    }

    async fn swap_thumbnail(
        &self,
        id: JobId,
        expected: StageGuard<ThumbnailState>,
        next: ThumbnailRecord,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError> {
        let mut state = self.write()?;
        let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.thumbnail.guard() != expected {
            return Ok(CasOutcome::LostRace);
        }
        job.thumbnail = next;
        job.updated_at = now;
        Ok(CasOutcome::Applied(job.clone()))
    }

    async fn set_dispatch_error(
        &self,
        id: JobId,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.dispatch_error != error {
            job.dispatch_error = error;
            job.updated_at = now;
        }
        Ok(())
    }

    async fn stale_migrations(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        self.select(
            limit,
            |j| {
                j.migration.state.is_active()
                    && j.migration.last_attempt_at.is_none_or(|at| at < cutoff)
            },
        )
    }

    async fn stale_thumbnails(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        self.select(
            limit,
            |j| {
                j.thumbnail.state.is_active()
                    && j.thumbnail.last_attempt_at.is_none_or(|at| at < cutoff)
            },
        )
    }

    async fn failed_migrations(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let state = self.read()?;
        let mut result: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.migration.state == MigrationState::Failed)
            .cloned()
            .collect();
        result.sort_by_key(|j| (j.migration.attempts, j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn failed_thumbnails(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.select(limit, |j| j.thumbnail.state == ThumbnailState::Failed)
    }

    async fn undispatched(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.select(limit, |j| j.dispatch_error.is_some())
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let state = self.read()?;
        let jobs: Vec<&Job> = state.jobs.values().collect();
        Ok(tally(&jobs, MAX_MIGRATION_ATTEMPTS))
    }
}
