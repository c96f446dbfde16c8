use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use assetflow_events::EventBus;
use assetflow_lifecycle::{Job, ThumbnailState, TransitionEvent};

use super::{ThumbnailRequest, WorkerError, WorkerOutcome, thumbnail_key};
use crate::clients::{Asset, ObjectStore, TransformClient};
use crate::orchestrator::Orchestrator;
use crate::store::JobStore;

/// Derives a thumbnail from whichever asset URL is best right now.
pub struct ThumbnailWorker<S: ?Sized, B> {
    orchestrator: Arc<Orchestrator<S, B>>,
    objects: Option<Arc<dyn ObjectStore>>,
    transform: Option<Arc<dyn TransformClient>>,
    timeout: Duration,
}

impl<S, B> ThumbnailWorker<S, B>
where
    S: JobStore + ?Sized,
    B: EventBus<TransitionEvent>,
{
    pub fn new(
        orchestrator: Arc<Orchestrator<S, B>>,
        objects: Option<Arc<dyn ObjectStore>>,
        transform: Option<Arc<dyn TransformClient>>,
        timeout: Duration,
    ) -> Self {
        Self {
            orchestrator,
            objects,
            transform,
            timeout,
        }
    }

    #[instrument(skip(self, request), fields(job_id = %request.job_id))]
    pub async fn run(&self, request: ThumbnailRequest) -> Result<WorkerOutcome, WorkerError> {
        let objects = self
            .objects
            .as_ref()
            .ok_or_else(|| WorkerError::Config("object store is not configured".to_string()))?;
        let transform = self
            .transform
            .as_ref()
            .ok_or_else(|| WorkerError::Config("transform endpoint is not configured".to_string()))?;
        let job = self.orchestrator.get(request.job_id).await?;

        match job.thumbnail.state {
            ThumbnailState::Pending => {}
            ThumbnailState::Completed => {
                let asset_url = job.thumbnail.url.clone().unwrap_or_default();
                return Ok(WorkerOutcome::AlreadyCompleted { asset_url });
            }
            other => {
                return Ok(WorkerOutcome::Skipped {
                    reason: format!("thumbnail is {other}"),
                });
            }
        }

        let policy = self.orchestrator.thumbnail().policy();
        let claimed = self.orchestrator.thumbnail().claim(&job.thumbnail, Utc::now())?;
        let Some(job) = self
            .orchestrator
            .transition_thumbnail(&job, claimed, Utc::now())
            .await?
        else {
            return Ok(WorkerOutcome::Skipped {
                reason: "claimed by another invocation".to_string(),
            });
        };
        let claim_seq = job.thumbnail.claim_seq;

        // The row is fresher than the payload: prefer the durable URL if the
        // migration finished since dispatch.
        let source = job
            .current_asset_url()
            .unwrap_or(request.asset_url.as_str())
            .to_string();
        let settle = policy.settle_delay_for(request.available_since(Utc::now()), Utc::now());

        let work = async {
            if !settle.is_zero() {
                debug!(settle_ms = settle.as_millis() as u64, "waiting for asset to settle");
                tokio::time::sleep(settle).await;
            }
            self.derive(&job, &source, &**objects, &**transform).await
        };

        let error = match tokio::time::timeout(self.timeout, work).await {
            Ok(Ok(Some(asset_url))) => {
                info!(%asset_url, %source, "thumbnail generated");
                return Ok(WorkerOutcome::Completed { asset_url });
            }
            Ok(Ok(None)) => {
                return Ok(WorkerOutcome::Skipped {
                    reason: "job moved on during derivation".to_string(),
                });
            }
            Ok(Err(err)) => err,
            Err(_) => WorkerError::Transient(format!(
                "thumbnail derivation timed out after {}s",
                self.timeout.as_secs()
            )),
        };

        self.record_failure(&job, claim_seq, error).await
    }

    async fn derive(
        &self,
        job: &Job,
        source: &str,
        objects: &dyn ObjectStore,
        transform: &dyn TransformClient,
    ) -> Result<Option<String>, WorkerError> {
        let image = self.transform_with_schedule(source, transform).await?;
        let url = objects.put_verified(&thumbnail_key(job.id), &image).await?;
        let next = self
            .orchestrator
            .thumbnail()
            .complete(&job.thumbnail, url.clone(), Utc::now())?;
        Ok(self
            .orchestrator
            .transition_thumbnail(job, next, Utc::now())
            .await?
            .map(|_| url))
    }

    /// Bounded retry loop over the configured delay table, measured from the
    /// first try. Permanent errors stop the loop early.
    async fn transform_with_schedule(
        &self,
        source: &str,
        transform: &dyn TransformClient,
    ) -> Result<Asset, WorkerError> {
        let schedule = &self.orchestrator.thumbnail().policy().schedule;
        let started = tokio::time::Instant::now();
        let mut last_error = None;

        for index in 0..schedule.tries() {
            let wait = schedule.wait_before(index, started.elapsed());
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            match transform.thumbnail(source).await {
                Ok(image) => return Ok(image),
                Err(err) if err.is_permanent() => return Err(err.into()),
                Err(err) => {
                    debug!(try_index = index, error = %err, "transform try failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error
            .map(WorkerError::from)
            .unwrap_or_else(|| WorkerError::Transient("transform was never tried".to_string())))
    }

    async fn record_failure(
        &self,
        claimed: &Job,
        claim_seq: u32,
        error: WorkerError,
    ) -> Result<WorkerOutcome, WorkerError> {
        let current = self.orchestrator.get(claimed.id).await?;
        let still_ours = current.thumbnail.state == ThumbnailState::Processing
            && current.thumbnail.claim_seq == claim_seq;
        if !still_ours {
            warn!(error = %error, "thumbnail error after claim was lost; discarding");
            return Ok(WorkerOutcome::Skipped {
                reason: format!("claim lost before failure could be recorded: {error}"),
            });
        }

        let message = error.to_string();
        let next = self
            .orchestrator
            .thumbnail()
            .fail(&current.thumbnail, message.clone(), Utc::now())?;
        match self
            .orchestrator
            .transition_thumbnail(&current, next, Utc::now())
            .await?
        {
            Some(updated) => Ok(WorkerOutcome::Failed {
                error: message,
                attempts: updated.thumbnail.attempts,
            }),
            None => Ok(WorkerOutcome::Skipped {
                reason: format!("claim lost before failure could be recorded: {message}"),
            }),
        }
    }
}
