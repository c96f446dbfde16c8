//! Producer surface: register jobs, report lifecycle status, read one row.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

use assetflow_core::{JobId, OwnerId};
use assetflow_lifecycle::{LifecycleStatus, NewJob, OwnerTier};

use crate::app::routes::parse_job_id;
use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_job))
        .route("/:id", get(get_job))
        .route("/:id/status", post(update_status))
}

pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::CreateJobRequest>,
) -> axum::response::Response {
    let id = match body.id.as_deref() {
        Some(raw) => match parse_job_id(raw) {
            Ok(id) => id,
            Err(resp) => return resp,
        },
        None => JobId::new(),
    };
    let owner_id: OwnerId = match body.owner_id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid owner id"),
    };
    let owner_tier: OwnerTier = match body.owner_tier.parse() {
        Ok(v) => v,
        Err(e) => return errors::domain_error_to_response(e),
    };

    let new = NewJob {
        id,
        owner_id,
        owner_tier,
        transient_asset_url: body.transient_asset_url,
    };
    match services.orchestrator.submit(new, Utc::now()).await {
        Ok(job) => (StatusCode::CREATED, Json(dto::job_to_json(&job))).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.orchestrator.get(id).await {
        Ok(job) => (StatusCode::OK, Json(dto::job_to_json(&job))).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// Producer lifecycle transition. Entering `completed` fires the migration and
/// thumbnail entry conditions; leaving `processing` promotes queued jobs.
pub async fn update_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::UpdateStatusRequest>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let status: LifecycleStatus = match body.status.parse() {
        Ok(v) => v,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services
        .orchestrator
        .update_lifecycle(id, status, body.transient_asset_url.as_deref(), Utc::now())
        .await
    {
        Ok(job) => (StatusCode::OK, Json(dto::job_to_json(&job))).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}
