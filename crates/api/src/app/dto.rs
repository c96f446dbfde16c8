use serde::Deserialize;
use serde_json::json;

use assetflow_lifecycle::Job;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    /// Producer-chosen id; generated when absent.
    pub id: Option<String>,
    pub owner_id: String,
    pub owner_tier: String,
    pub transient_asset_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusRequest {
    pub status: String,
    pub transient_asset_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryMigrationRequest {
    #[serde(default)]
    pub force_remigrate: bool,
}

#[derive(Debug, Deserialize)]
pub struct RetryFailedQuery {
    pub limit: Option<usize>,
}

// -------------------------
// Response mapping
// -------------------------

/// One-row view of a job: every sub-state, error and diagnostic.
pub fn job_to_json(job: &Job) -> serde_json::Value {
    json!({
        "id": job.id.to_string(),
        "ownerId": job.owner_id.to_string(),
        "ownerTier": job.owner_tier.as_str(),
        "lifecycleStatus": job.lifecycle_status.as_str(),
        "transientAssetUrl": job.transient_asset_url,
        "assetUrl": job.current_asset_url(),
        "durableAssetUrl": job.durable_asset_url(),
        "migrationState": job.migration.state.as_str(),
        "migrationAttempts": job.migration.attempts,
        "migrationLastAttemptAt": job.migration.last_attempt_at,
        "migrationCompletedAt": job.migration.completed_at,
        "migrationError": job.migration.error,
        "thumbnailState": job.thumbnail.state.as_str(),
        "thumbnailAttempts": job.thumbnail.attempts,
        "thumbnailLastAttemptAt": job.thumbnail.last_attempt_at,
        "thumbnailUrl": job.thumbnail.url,
        "thumbnailGeneratedAt": job.thumbnail.generated_at,
        "thumbnailError": job.thumbnail.error,
        "queuePosition": job.queue.position,
        "queueEnteredAt": job.queue.entered_at,
        "startedAt": job.queue.started_at,
        "dispatchError": job.dispatch_error,
        "createdAt": job.created_at,
        "updatedAt": job.updated_at,
    })
}
