//! Worker entry points, invoked by the dispatcher. Each call runs the worker
//! to completion (bounded by its own timeout) and reports the outcome.

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};

use assetflow_infra::workers::{MigrationRequest, ThumbnailRequest};

use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/migration", post(run_migration))
        .route("/thumbnail", post(run_thumbnail))
}

pub async fn run_migration(
    Extension(services): Extension<Arc<AppServices>>,
    Json(request): Json<MigrationRequest>,
) -> axum::response::Response {
    match services.migration.run(request).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => errors::worker_error_to_response(e),
    }
}

pub async fn run_thumbnail(
    Extension(services): Extension<Arc<AppServices>>,
    Json(request): Json<ThumbnailRequest>,
) -> axum::response::Response {
    match services.thumbnail.run(request).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => errors::worker_error_to_response(e),
    }
}
