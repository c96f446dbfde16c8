//! Operator overrides. These ignore attempt caps and backoff windows.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde_json::json;

use crate::app::routes::parse_job_id;
use crate::app::services::AppServices;
use crate::app::{dto, errors};

const DEFAULT_BATCH_LIMIT: usize = 10;
const MAX_BATCH_LIMIT: usize = 500;

pub fn router() -> Router {
    Router::new()
        .route("/jobs/:id/retry-migration", post(retry_migration))
        .route("/jobs/:id/retry-thumbnail", post(retry_thumbnail))
        .route("/migrations/retry-failed", post(retry_failed_migrations))
        .route("/sweep", post(sweep))
}

/// Body is optional; `{"forceRemigrate": true}` redoes a completed migration.
pub async fn retry_migration(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Option<Json<dto::RetryMigrationRequest>>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let force_remigrate = body.is_some_and(|Json(b)| b.force_remigrate);

    match services
        .orchestrator
        .force_retry_migration(id, force_remigrate, Utc::now())
        .await
    {
        Ok(job) => (StatusCode::ACCEPTED, Json(dto::job_to_json(&job))).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn retry_thumbnail(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.orchestrator.force_retry_thumbnail(id, Utc::now()).await {
        Ok(job) => (StatusCode::ACCEPTED, Json(dto::job_to_json(&job))).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// Re-arm up to `limit` failed migrations, fewest attempts first then oldest.
pub async fn retry_failed_migrations(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::RetryFailedQuery>,
) -> axum::response::Response {
    let limit = query.limit.unwrap_or(DEFAULT_BATCH_LIMIT);
    if limit == 0 || limit > MAX_BATCH_LIMIT {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!("limit must be between 1 and {MAX_BATCH_LIMIT}"),
        );
    }

    match services
        .orchestrator
        .retry_failed_migrations(limit, Utc::now())
        .await
    {
        Ok(ids) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "retried": ids.len(),
                "jobIds": ids.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
            })),
        )
            .into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// Run one reclaimer sweep now.
pub async fn sweep(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.reclaimer.sweep_once(Utc::now()).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}
