//! Job lifecycle orchestration (application-level).
//!
//! Every state change follows the same pipeline:
//!
//! ```text
//! request (producer, worker, operator, sweep)
//!   ↓
//! 1. Pure transition on the lifecycle record (assetflow-lifecycle)
//!   ↓
//! 2. Conditional write to the job store (guarded by state + attempts)
//!   ↓
//! 3. Publish the TransitionEvent (dispatcher picks up `-> pending`)
//! ```
//!
//! A lost compare-and-swap is not an error: another writer already moved the
//! job, so the caller simply stops. A failed publication is logged and never
//! rolls the write back; the periodic sweep re-arms whatever got stuck.
//!
//! Cross-stage triggers also live here:
//! - lifecycle `-> completed` arms migration and thumbnail derivation,
//! - migration `-> completed` arms thumbnail derivation again (no-op if already armed),
//! - a job leaving `processing` promotes queued jobs through the gate.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use assetflow_core::{DomainError, JobId};
use assetflow_events::EventBus;
use assetflow_lifecycle::{
    ConcurrencyGate, Job, LifecycleStatus, MigrationRecord, MigrationState, MigrationStateMachine,
    NewJob, StageTransition, ThumbnailRecord, ThumbnailState, ThumbnailStateMachine,
    TransitionEvent,
};

use crate::store::{AdmissionOutcome, CasOutcome, JobStats, JobStore, StoreError};

/// Admission retries after a serialization conflict.
const ADMISSION_ATTEMPTS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {0} changed concurrently; retry")]
    Conflict(JobId),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for OrchestratorError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(id) => OrchestratorError::NotFound(id),
            StoreError::Domain(err) => OrchestratorError::Domain(err),
            other => OrchestratorError::Store(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub gate: ConcurrencyGate,
    pub migration: MigrationStateMachine,
    pub thumbnail: ThumbnailStateMachine,
    /// Assets already under this prefix are durable and never migrated.
    pub durable_base_url: String,
    /// Upper bound on queued jobs re-evaluated per promotion pass.
    pub promotion_batch: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            gate: ConcurrencyGate::default(),
            migration: MigrationStateMachine::default(),
            thumbnail: ThumbnailStateMachine::default(),
            durable_base_url: String::new(),
            promotion_batch: 100,
        }
    }
}

/// Owns every write to the job record and the events that follow them.
pub struct Orchestrator<S: ?Sized, B> {
    store: Arc<S>,
    bus: B,
    config: OrchestratorConfig,
}

impl<S, B> Orchestrator<S, B>
where
    S: JobStore + ?Sized,
    B: EventBus<TransitionEvent>,
{
    pub fn new(store: Arc<S>, bus: B, config: OrchestratorConfig) -> Self {
        Self { store, bus, config }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn migration(&self) -> &MigrationStateMachine {
        &self.config.migration
    }

    pub fn thumbnail(&self) -> &ThumbnailStateMachine {
        &self.config.thumbnail
    }

    pub async fn get(&self, id: JobId) -> Result<Job, OrchestratorError> {
        self.store
            .get(id)
            .await?
            .ok_or(OrchestratorError::NotFound(id))
    }

    pub async fn stats(&self) -> Result<JobStats, OrchestratorError> {
        Ok(self.store.stats().await?)
    }

    /// Register a new job and run it through admission.
    pub async fn submit(&self, new: NewJob, now: DateTime<Utc>) -> Result<Job, OrchestratorError> {
        if let Some(url) = new.transient_asset_url.as_deref() {
            if url.trim().is_empty() {
                return Err(DomainError::validation("transient asset url must not be empty").into());
            }
        }
        let job = Job::new(new, now);
        let id = job.id;
        self.store.insert(job).await?;
        info!(job_id = %id, "job registered");

        Ok(self.admit(id, now).await?.into_job())
    }

    /// Ask the gate whether `id` may start processing now.
    pub async fn admit(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<AdmissionOutcome, OrchestratorError> {
        let mut last_conflict = None;
        for _ in 0..ADMISSION_ATTEMPTS {
            match self.store.admit(id, &self.config.gate, now).await {
                Ok(outcome) => {
                    match &outcome {
                        AdmissionOutcome::Admitted(job) => {
                            info!(job_id = %id, owner_id = %job.owner_id, "job admitted");
                            self.publish(TransitionEvent::new(
                                id,
                                StageTransition::Lifecycle {
                                    from: LifecycleStatus::Pending,
                                    to: LifecycleStatus::Processing,
                                },
                                now,
                            ));
                        }
                        AdmissionOutcome::Queued(job) => {
                            info!(job_id = %id, position = ?job.queue.position, "job queued");
                        }
                        AdmissionOutcome::Unchanged(_) => {}
                    }
                    return Ok(outcome);
                }
                Err(StoreError::Conflict(msg)) => {
                    debug!(job_id = %id, error = %msg, "admission conflict, retrying");
                    last_conflict = Some(msg);
                }
                Err(err) => return Err(err.into()),
            }
        }
        warn!(job_id = %id, error = ?last_conflict, "admission kept conflicting");
        Err(OrchestratorError::Conflict(id))
    }

    /// Re-run the gate over the whole queue, lowest position first, one page of
    /// `promotion_batch` jobs at a time. Once one of an owner's jobs stays queued
    /// the rest of that owner's jobs are skipped for this pass. Returns the jobs
    /// that were admitted.
    pub async fn promote_queued(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, OrchestratorError> {
        let batch = self.config.promotion_batch.max(1);
        let mut saturated = HashSet::new();
        let mut admitted = Vec::new();
        let mut after = 0;

        loop {
            let page = self.store.queued(after, batch).await?;
            let Some(last) = page.last().and_then(|job| job.queue.position) else {
                break;
            };
            let full_page = page.len() == batch;
            after = last;

            for job in page {
                if saturated.contains(&job.owner_id) {
                    continue;
                }
                match self.admit(job.id, now).await {
                    Ok(AdmissionOutcome::Admitted(job)) => admitted.push(job.id),
                    Ok(AdmissionOutcome::Queued(job)) => {
                        saturated.insert(job.owner_id);
                    }
                    Ok(AdmissionOutcome::Unchanged(_)) => {}
                    Err(err) => warn!(job_id = %job.id, error = %err, "promotion failed"),
                }
            }
            if !full_page {
                break;
            }
        }
        if !admitted.is_empty() {
            info!(count = admitted.len(), "queued jobs promoted");
        }
        Ok(admitted)
    }

    /// Apply a producer status update.
    ///
    /// Re-sending the current status is a no-op, except that `completed` re-runs
    /// the (idempotent) asset-ready triggers so a lost trigger can be replayed.
    pub async fn update_lifecycle(
        &self,
        id: JobId,
        status: LifecycleStatus,
        transient_asset_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Job, OrchestratorError> {
        let change = self
            .store
            .set_lifecycle_status(id, status, transient_asset_url, now)
            .await?;
        let mut job = change.job;

        if change.changed {
            info!(job_id = %id, from = %change.previous, to = %status, "lifecycle status changed");
            self.publish(TransitionEvent::new(
                id,
                StageTransition::Lifecycle {
                    from: change.previous,
                    to: status,
                },
                now,
            ));
            if change.previous == LifecycleStatus::Processing {
                self.promote_queued(now).await?;
            }
        }

        if job.lifecycle_status == LifecycleStatus::Completed {
            job = self.on_asset_ready(job, now).await?;
        }
        Ok(job)
    }

    /// The asset now exists at its transient location: arm migration and the
    /// first thumbnail trigger.
    async fn on_asset_ready(&self, job: Job, now: DateTime<Utc>) -> Result<Job, OrchestratorError> {
        let job = self.arm_migration(&job, now).await?.unwrap_or(job);
        let job = self.arm_thumbnail(&job, now).await?.unwrap_or(job);
        Ok(job)
    }

    /// `none -> pending` when the job has an asset that is not yet durable.
    pub async fn arm_migration(
        &self,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, OrchestratorError> {
        match self
            .config
            .migration
            .arm(job, &self.config.durable_base_url, now)
        {
            Some(next) => self.transition_migration(job, next, now).await,
            None => Ok(None),
        }
    }

    /// `none -> pending` (or placeholder regeneration) when the job has an asset.
    pub async fn arm_thumbnail(
        &self,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, OrchestratorError> {
        if job.current_asset_url().is_none() {
            return Ok(None);
        }
        match self.config.thumbnail.arm(&job.thumbnail, now) {
            Some(next) => self.transition_thumbnail(job, next, now).await,
            None => Ok(None),
        }
    }

    /// Write a migration transition computed from `job.migration`.
    ///
    /// Returns `None` when another writer got there first.
    pub async fn transition_migration(
        &self,
        job: &Job,
        next: MigrationRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, OrchestratorError> {
        self.swap_migration(job, next, false, now).await
    }

    async fn swap_migration(
        &self,
        job: &Job,
        next: MigrationRecord,
        force_remigrate: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, OrchestratorError> {
        let from = job.migration.state;
        let to = next.state;
        let updated = match self
            .store
            .swap_migration(job.id, job.migration.guard(), next, now)
            .await?
        {
            CasOutcome::Applied(updated) => updated,
            CasOutcome::LostRace => {
                debug!(job_id = %job.id, %from, %to, "migration transition lost race");
                return Ok(None);
            }
        };

        debug!(job_id = %job.id, %from, %to, attempts = updated.migration.attempts, "migration transition");
        if to == MigrationState::Failed {
            warn!(
                job_id = %job.id,
                attempts = updated.migration.attempts,
                error = ?updated.migration.error,
                exhausted = self.config.migration.policy().is_exhausted(&updated.migration),
                "migration failed"
            );
        }

        self.publish(
            TransitionEvent::new(job.id, StageTransition::Migration { from, to }, now)
                .with_asset(
                    updated.transient_asset_url.as_deref(),
                    Some(updated.asset_available_at()),
                )
                .with_force_remigrate(force_remigrate),
        );

        if to == MigrationState::Completed {
            info!(job_id = %job.id, durable_url = ?updated.durable_asset_url(), "migration completed");
            if let Some(armed) = self.arm_thumbnail(&updated, now).await? {
                return Ok(Some(armed));
            }
        }
        Ok(Some(updated))
    }

    /// Write a thumbnail transition computed from `job.thumbnail`.
    pub async fn transition_thumbnail(
        &self,
        job: &Job,
        next: ThumbnailRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, OrchestratorError> {
        let from = job.thumbnail.state;
        let to = next.state;
        let updated = match self
            .store
            .swap_thumbnail(job.id, job.thumbnail.guard(), next, now)
            .await?
        {
            CasOutcome::Applied(updated) => updated,
            CasOutcome::LostRace => {
                debug!(job_id = %job.id, %from, %to, "thumbnail transition lost race");
                return Ok(None);
            }
        };

        debug!(job_id = %job.id, %from, %to, attempts = updated.thumbnail.attempts, "thumbnail transition");
        if to == ThumbnailState::Failed {
            warn!(
                job_id = %job.id,
                attempts = updated.thumbnail.attempts,
                error = ?updated.thumbnail.error,
                "thumbnail failed"
            );
        }

        self.publish(
            TransitionEvent::new(job.id, StageTransition::Thumbnail { from, to }, now).with_asset(
                updated.current_asset_url(),
                Some(updated.asset_available_at()),
            ),
        );
        Ok(Some(updated))
    }

    /// Operator override for one job's migration: ignores cap and backoff.
    pub async fn force_retry_migration(
        &self,
        id: JobId,
        force_remigrate: bool,
        now: DateTime<Utc>,
    ) -> Result<Job, OrchestratorError> {
        let job = self.get(id).await?;
        if job.transient_asset_url.is_none() {
            return Err(DomainError::validation("job has no asset to migrate").into());
        }
        let next = self
            .config
            .migration
            .force_retry(&job.migration, force_remigrate, now)?;
        info!(job_id = %id, force_remigrate, attempts = job.migration.attempts, "manual migration retry");
        self.swap_migration(&job, next, force_remigrate, now)
            .await?
            .ok_or(OrchestratorError::Conflict(id))
    }

    /// Operator override for one job's thumbnail.
    pub async fn force_retry_thumbnail(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Job, OrchestratorError> {
        let job = self.get(id).await?;
        if job.current_asset_url().is_none() {
            return Err(DomainError::validation("job has no asset to derive a thumbnail from").into());
        }
        let next = self.config.thumbnail.force_retry(&job.thumbnail, now)?;
        info!(job_id = %id, attempts = job.thumbnail.attempts, "manual thumbnail retry");
        self.transition_thumbnail(&job, next, now)
            .await?
            .ok_or(OrchestratorError::Conflict(id))
    }

    /// Re-arm up to `limit` failed migrations, fewest attempts first then oldest.
    /// Jobs that fail to re-arm are logged and skipped.
    pub async fn retry_failed_migrations(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, OrchestratorError> {
        let failed = self.store.failed_migrations(limit).await?;
        let mut retried = Vec::with_capacity(failed.len());
        for job in failed {
            match self.force_retry_migration(job.id, false, now).await {
                Ok(_) => retried.push(job.id),
                Err(err) => warn!(job_id = %job.id, error = %err, "batch migration retry skipped"),
            }
        }
        info!(count = retried.len(), "batch migration retry");
        Ok(retried)
    }

    /// Re-publish pending sub-lifecycles of a job whose dispatch never reached
    /// a worker. Refreshes the stage timestamp so the stuck-job sweep measures
    /// from the new dispatch. No attempt is charged.
    pub async fn redispatch(&self, job: &Job, now: DateTime<Utc>) -> Result<usize, OrchestratorError> {
        self.store.set_dispatch_error(job.id, None, now).await?;
        let mut count = 0;

        if job.migration.state == MigrationState::Pending {
            let next = MigrationRecord {
                last_attempt_at: Some(now),
                ..job.migration.clone()
            };
            if self.transition_migration(job, next, now).await?.is_some() {
                count += 1;
            }
        }
        // Re-read: the migration write bumped the row.
        let job = self.get(job.id).await?;
        if job.thumbnail.state == ThumbnailState::Pending {
            let next = ThumbnailRecord {
                last_attempt_at: Some(now),
                ..job.thumbnail.clone()
            };
            if self.transition_thumbnail(&job, next, now).await?.is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    fn publish(&self, event: TransitionEvent) {
        if let Err(err) = self.bus.publish(event) {
            // Persisted already; the sweep recovers anything this loses.
            warn!(error = ?err, "failed to publish transition event");
        }
    }
}
