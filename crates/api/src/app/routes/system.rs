use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::errors;
use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Job counts per lifecycle status and sub-state.
pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.orchestrator.stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}
