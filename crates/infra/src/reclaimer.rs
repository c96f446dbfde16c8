//! Periodic self-healing sweep over the job store.
//!
//! One sweep:
//! 1. re-publishes `pending` stages whose dispatch never reached a worker
//!    (no attempt charged),
//! 2. fails migrations stuck in an active state past the migration timeout,
//! 3. fails thumbnails stuck in an active state past the thumbnail timeout,
//! 4. re-arms failed migrations whose backoff has elapsed (attempts below cap),
//! 5. re-arms failed thumbnails whose cooldown has elapsed (attempts below cap),
//! 6. re-runs queue promotion.
//!
//! Each step goes through the orchestrator's conditional writes, so a sweep
//! racing a live worker (or another sweep) never double-charges an attempt.

use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use assetflow_events::EventBus;
use assetflow_lifecycle::{Job, MigrationState, ThumbnailState, TransitionEvent};

use crate::background::WorkerHandle;
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::store::JobStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimerConfig {
    pub interval: StdDuration,
    /// Active migration with no transition for this long is reclaimed.
    pub migration_timeout: Duration,
    pub thumbnail_timeout: Duration,
    /// Upper bound on jobs handled per step per sweep.
    pub batch_size: usize,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            interval: StdDuration::from_secs(300),
            migration_timeout: Duration::minutes(10),
            thumbnail_timeout: Duration::minutes(5),
            batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub redispatched: usize,
    pub migrations_reclaimed: usize,
    pub thumbnails_reclaimed: usize,
    pub migrations_rearmed: usize,
    pub thumbnails_rearmed: usize,
    pub promoted: usize,
}

pub struct Reclaimer<S: ?Sized, B> {
    orchestrator: Arc<Orchestrator<S, B>>,
    config: ReclaimerConfig,
}

impl<S, B> Reclaimer<S, B>
where
    S: JobStore + ?Sized + 'static,
    B: EventBus<TransitionEvent> + 'static,
{
    pub fn new(orchestrator: Arc<Orchestrator<S, B>>, config: ReclaimerConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub fn config(&self) -> &ReclaimerConfig {
        &self.config
    }

    /// Run every step once. Store queries that fail abort the sweep; a failure
    /// on a single job is logged and the sweep moves on to the next one.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, OrchestratorError> {
        let store = self.orchestrator.store();
        let limit = self.config.batch_size;
        let mut report = SweepReport::default();

        for job in store.undispatched(limit).await? {
            match self.orchestrator.redispatch(&job, now).await {
                Ok(count) => report.redispatched += count,
                Err(err) => warn!(job_id = %job.id, error = %err, "redispatch failed"),
            }
        }

        let cutoff = now - self.config.migration_timeout;
        for job in store.stale_migrations(cutoff, limit).await? {
            match self.reclaim_migration(&job, now).await {
                Ok(true) => report.migrations_reclaimed += 1,
                Ok(false) => {}
                Err(err) => warn!(job_id = %job.id, error = %err, "migration reclaim failed"),
            }
        }

        let cutoff = now - self.config.thumbnail_timeout;
        for job in store.stale_thumbnails(cutoff, limit).await? {
            match self.reclaim_thumbnail(&job, now).await {
                Ok(true) => report.thumbnails_reclaimed += 1,
                Ok(false) => {}
                Err(err) => warn!(job_id = %job.id, error = %err, "thumbnail reclaim failed"),
            }
        }

        for job in store.failed_migrations(limit).await? {
            match self.rearm_migration(&job, now).await {
                Ok(true) => report.migrations_rearmed += 1,
                Ok(false) => {}
                Err(err) => warn!(job_id = %job.id, error = %err, "migration re-arm failed"),
            }
        }

        let thumbnail = self.orchestrator.thumbnail();
        for job in store.failed_thumbnails(limit).await? {
            if !thumbnail.retry_due(&job.thumbnail, now) || job.current_asset_url().is_none() {
                continue;
            }
            match self.orchestrator.arm_thumbnail(&job, now).await {
                Ok(Some(_)) => report.thumbnails_rearmed += 1,
                Ok(None) => {}
                Err(err) => warn!(job_id = %job.id, error = %err, "thumbnail re-arm failed"),
            }
        }

        // Covers promotions lost when the job leaving `processing` could not
        // run one itself.
        report.promoted = self.orchestrator.promote_queued(now).await?.len();

        if report != SweepReport::default() {
            info!(?report, "reclaimer sweep");
        }
        Ok(report)
    }

    async fn rearm_migration(&self, job: &Job, now: DateTime<Utc>) -> Result<bool, OrchestratorError> {
        let migration = self.orchestrator.migration();
        if !migration.policy().can_retry(&job.migration, now) {
            return Ok(false);
        }
        let next = migration.retry(&job.migration, now)?;
        Ok(self
            .orchestrator
            .transition_migration(job, next, now)
            .await?
            .is_some())
    }

    async fn reclaim_migration(&self, job: &Job, now: DateTime<Utc>) -> Result<bool, OrchestratorError> {
        if job.migration.state == MigrationState::Pending && job.dispatch_error.is_some() {
            // Never reached a worker; redispatch covers it without a charge.
            return Ok(false);
        }
        let timeout_secs = self.config.migration_timeout.num_seconds();
        warn!(job_id = %job.id, state = %job.migration.state, timeout_secs, "reclaiming stuck migration");
        let next = self.orchestrator.migration().fail(
            &job.migration,
            format!("no progress in {} for {timeout_secs}s", job.migration.state),
            false,
            now,
        )?;
        Ok(self
            .orchestrator
            .transition_migration(job, next, now)
            .await?
            .is_some())
    }

    async fn reclaim_thumbnail(&self, job: &Job, now: DateTime<Utc>) -> Result<bool, OrchestratorError> {
        if job.thumbnail.state == ThumbnailState::Pending && job.dispatch_error.is_some() {
            return Ok(false);
        }
        let timeout_secs = self.config.thumbnail_timeout.num_seconds();
        warn!(job_id = %job.id, state = %job.thumbnail.state, timeout_secs, "reclaiming stuck thumbnail");
        let next = self.orchestrator.thumbnail().fail(
            &job.thumbnail,
            format!("no progress in {} for {timeout_secs}s", job.thumbnail.state),
            now,
        )?;
        Ok(self
            .orchestrator
            .transition_thumbnail(job, next, now)
            .await?
            .is_some())
    }

    /// Sweep every `interval` on a background thread, driving each sweep on
    /// `runtime`.
    pub fn spawn(self: Arc<Self>, runtime: Handle) -> std::io::Result<WorkerHandle> {
        WorkerHandle::spawn("assetflow-reclaimer", move |shutdown_rx| {
            loop {
                match shutdown_rx.recv_timeout(self.config.interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                if let Err(err) = runtime.block_on(self.sweep_once(Utc::now())) {
                    error!(error = %err, "reclaimer sweep failed");
                }
            }
        })
    }
}
