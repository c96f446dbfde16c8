//! Stateless workers performing the I/O behind migration and thumbnail
//! derivation.
//!
//! A worker is handed a job id and an asset URL, claims the job with a
//! conditional write, does its transfer inside a hard timeout and writes the
//! outcome back. Any number of invocations for the same job may overlap; only
//! the one whose claim wins does any work, and every later write it makes is
//! again conditional, so a worker that was reclaimed mid-flight cannot undo
//! whatever happened since.

mod migration;
mod thumbnail;

pub use migration::MigrationWorker;
pub use thumbnail::ThumbnailWorker;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use assetflow_core::{DomainError, JobId};

use crate::clients::{ObjectStoreError, TransformError};
use crate::orchestrator::OrchestratorError;

/// Durable key of a job's migrated video. Derived from the id alone, so a
/// duplicate upload overwrites the same object.
pub fn durable_video_key(job_id: JobId) -> String {
    format!("videos/{job_id}")
}

/// Durable key of a job's derived thumbnail.
pub fn thumbnail_key(job_id: JobId) -> String {
    format!("thumbnails/{job_id}.jpg")
}

/// Payload of a migration worker invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRequest {
    pub job_id: JobId,
    pub asset_url: String,
    /// Redo a migration that already completed.
    #[serde(default)]
    pub force_remigrate: bool,
}

/// Payload of a thumbnail worker invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailRequest {
    pub job_id: JobId,
    pub asset_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_since_migration_seconds: Option<i64>,
    /// When the asset at `asset_url` became available (migration completion or
    /// the producer finishing the upload).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_available_at: Option<DateTime<Utc>>,
}

impl ThumbnailRequest {
    pub fn available_since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.asset_available_at
            .or(self.migration_completed_at)
            .or_else(|| {
                self.time_since_migration_seconds
                    .map(|secs| now - Duration::seconds(secs))
            })
    }
}

/// What one worker invocation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkerOutcome {
    Completed { asset_url: String },
    /// Nothing to do: the stage was already completed.
    AlreadyCompleted { asset_url: String },
    /// Not ours: the stage was not pending, or another writer won a race.
    Skipped { reason: String },
    /// The attempt failed and was recorded on the job.
    Failed { error: String, attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// Network trouble, timeouts, 5xx: retrying may help.
    #[error("transient: {0}")]
    Transient(String),
    /// Missing or forbidden source, unusable input.
    #[error("permanent: {0}")]
    Permanent(String),
    /// The worker cannot run at all in this deployment.
    #[error("configuration: {0}")]
    Config(String),
}

impl WorkerError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, WorkerError::Permanent(_))
    }
}

impl From<ObjectStoreError> for WorkerError {
    fn from(value: ObjectStoreError) -> Self {
        if value.is_permanent() {
            WorkerError::Permanent(value.to_string())
        } else {
            WorkerError::Transient(value.to_string())
        }
    }
}

impl From<TransformError> for WorkerError {
    fn from(value: TransformError) -> Self {
        if value.is_permanent() {
            WorkerError::Permanent(value.to_string())
        } else {
            WorkerError::Transient(value.to_string())
        }
    }
}

impl From<OrchestratorError> for WorkerError {
    fn from(value: OrchestratorError) -> Self {
        match value {
            OrchestratorError::NotFound(id) => WorkerError::NotFound(id),
            other => WorkerError::Transient(other.to_string()),
        }
    }
}

impl From<DomainError> for WorkerError {
    fn from(value: DomainError) -> Self {
        WorkerError::Transient(value.to_string())
    }
}
