use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, instrument, warn};

use assetflow_events::EventBus;
use assetflow_lifecycle::{Job, MigrationState, TransitionEvent};

use super::{MigrationRequest, WorkerError, WorkerOutcome, durable_video_key};
use crate::clients::ObjectStore;
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::store::JobStore;

/// Copies a job's asset from its transient origin to the durable store.
pub struct MigrationWorker<S: ?Sized, B> {
    orchestrator: Arc<Orchestrator<S, B>>,
    objects: Option<Arc<dyn ObjectStore>>,
    timeout: Duration,
}

impl<S, B> MigrationWorker<S, B>
where
    S: JobStore + ?Sized,
    B: EventBus<TransitionEvent>,
{
    /// `objects` is `None` when no object store is configured; every invocation
    /// then fails with [`WorkerError::Config`] without touching the job.
    pub fn new(
        orchestrator: Arc<Orchestrator<S, B>>,
        objects: Option<Arc<dyn ObjectStore>>,
        timeout: Duration,
    ) -> Self {
        Self {
            orchestrator,
            objects,
            timeout,
        }
    }

    #[instrument(skip(self, request), fields(job_id = %request.job_id))]
    pub async fn run(&self, request: MigrationRequest) -> Result<WorkerOutcome, WorkerError> {
        let objects = self
            .objects
            .as_ref()
            .ok_or_else(|| WorkerError::Config("object store is not configured".to_string()))?;
        let mut job = self.orchestrator.get(request.job_id).await?;
        if request.force_remigrate && job.migration.state == MigrationState::Completed {
            job = self.rearm_completed(job).await?;
        }

        match job.migration.state {
            MigrationState::Pending => {}
            MigrationState::Completed => {
                // Re-entry after success: report the existing result, charge nothing.
                let asset_url = job.durable_asset_url().unwrap_or_default().to_string();
                return Ok(WorkerOutcome::AlreadyCompleted { asset_url });
            }
            other => {
                return Ok(WorkerOutcome::Skipped {
                    reason: format!("migration is {other}"),
                });
            }
        }

        let source = job
            .transient_asset_url
            .clone()
            .unwrap_or_else(|| request.asset_url.clone());

        let sm = self.orchestrator.migration();
        let claimed = sm.claim(&job.migration, Utc::now())?;
        let Some(job) = self
            .orchestrator
            .transition_migration(&job, claimed, Utc::now())
            .await?
        else {
            return Ok(WorkerOutcome::Skipped {
                reason: "claimed by another invocation".to_string(),
            });
        };
        let claim_seq = job.migration.claim_seq;

        let error = match tokio::time::timeout(self.timeout, self.transfer(&job, &source, &**objects)).await {
            Ok(Ok(Some(asset_url))) => {
                info!(%asset_url, "asset migrated");
                return Ok(WorkerOutcome::Completed { asset_url });
            }
            Ok(Ok(None)) => {
                return Ok(WorkerOutcome::Skipped {
                    reason: "job moved on during transfer".to_string(),
                });
            }
            Ok(Err(err)) => err,
            Err(_) => WorkerError::Transient(format!(
                "migration timed out after {}s",
                self.timeout.as_secs()
            )),
        };

        self.record_failure(&job, claim_seq, error).await
    }

    /// `forceRemigrate` on a completed job: reset it to `pending` so this
    /// invocation can claim it. Losing that reset to a concurrent writer is fine;
    /// the fresh row decides what happens next.
    async fn rearm_completed(&self, job: Job) -> Result<Job, WorkerError> {
        info!("forced re-migration of a completed job");
        match self
            .orchestrator
            .force_retry_migration(job.id, true, Utc::now())
            .await
        {
            Ok(job) => Ok(job),
            Err(OrchestratorError::Conflict(id)) => Ok(self.orchestrator.get(id).await?),
            Err(err) => Err(err.into()),
        }
    }

    /// Download, upload, verify. `Ok(None)` means a conditional write lost.
    async fn transfer(
        &self,
        job: &Job,
        source: &str,
        objects: &dyn ObjectStore,
    ) -> Result<Option<String>, WorkerError> {
        let sm = self.orchestrator.migration();

        let asset = objects.fetch(source).await?;
        let next = sm.downloaded(&job.migration, Utc::now())?;
        let Some(job) = self
            .orchestrator
            .transition_migration(job, next, Utc::now())
            .await?
        else {
            return Ok(None);
        };

        let url = objects
            .put_verified(&durable_video_key(job.id), &asset)
            .await?;
        let next = sm.complete(&job.migration, url.clone(), Utc::now())?;
        Ok(self
            .orchestrator
            .transition_migration(&job, next, Utc::now())
            .await?
            .map(|_| url))
    }

    /// Fail the claim we hold, if we still hold it.
    async fn record_failure(
        &self,
        claimed: &Job,
        claim_seq: u32,
        error: WorkerError,
    ) -> Result<WorkerOutcome, WorkerError> {
        let current = self.orchestrator.get(claimed.id).await?;
        let still_ours = matches!(
            current.migration.state,
            MigrationState::Downloading | MigrationState::Uploading
        ) && current.migration.claim_seq == claim_seq;
        if !still_ours {
            warn!(error = %error, "migration error after claim was lost; discarding");
            return Ok(WorkerOutcome::Skipped {
                reason: format!("claim lost before failure could be recorded: {error}"),
            });
        }

        let message = error.to_string();
        let next = self.orchestrator.migration().fail(
            &current.migration,
            message.clone(),
            error.is_permanent(),
            Utc::now(),
        )?;
        match self
            .orchestrator
            .transition_migration(&current, next, Utc::now())
            .await?
        {
            Some(updated) => Ok(WorkerOutcome::Failed {
                error: message,
                attempts: updated.migration.attempts,
            }),
            None => Ok(WorkerOutcome::Skipped {
                reason: format!("claim lost before failure could be recorded: {message}"),
            }),
        }
    }
}
