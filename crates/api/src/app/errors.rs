use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use assetflow_core::DomainError;
use assetflow_infra::{OrchestratorError, StoreError, workers::WorkerError};

pub fn orchestrator_error_to_response(err: OrchestratorError) -> axum::response::Response {
    match err {
        OrchestratorError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        OrchestratorError::Conflict(id) => json_error(
            StatusCode::CONFLICT,
            "conflict",
            format!("job {id} changed concurrently; retry"),
        ),
        OrchestratorError::Domain(e) => domain_error_to_response(e),
        OrchestratorError::Store(e) => store_error_to_response(e),
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        DomainError::Validation(_) => json_error(StatusCode::BAD_REQUEST, "validation_error", message),
        DomainError::InvalidId(_) => json_error(StatusCode::BAD_REQUEST, "invalid_id", message),
        DomainError::UnknownVariant { .. } => {
            json_error(StatusCode::BAD_REQUEST, "unknown_variant", message)
        }
        DomainError::IllegalTransition(_) => {
            json_error(StatusCode::CONFLICT, "illegal_transition", message)
        }
        DomainError::InvariantViolation(_) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", message)
        }
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        StoreError::AlreadyExists(id) => {
            json_error(StatusCode::CONFLICT, "already_exists", format!("job {id} already exists"))
        }
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        StoreError::Domain(e) => domain_error_to_response(e),
        StoreError::Storage(msg) => {
            tracing::error!(error = %msg, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

/// Errors a worker raises before it could record anything on the job.
pub fn worker_error_to_response(err: WorkerError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        WorkerError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", message),
        WorkerError::Config(_) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "worker_not_configured", message)
        }
        WorkerError::Permanent(_) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "worker_failed", message)
        }
        WorkerError::Transient(_) => json_error(StatusCode::BAD_GATEWAY, "worker_failed", message),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
