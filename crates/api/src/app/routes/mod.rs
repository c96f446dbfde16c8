pub mod admin;
pub mod jobs;
pub mod system;
pub mod workers;

use axum::http::StatusCode;

use assetflow_core::JobId;

use crate::app::errors;

/// Parse a job id path segment.
pub(crate) fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}
