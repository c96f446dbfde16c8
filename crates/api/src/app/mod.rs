//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: infrastructure wiring (store, bus, orchestrator, workers, background threads)
//! - `routes/`: HTTP routes + handlers (one file per surface)
//! - `dto.rs`: request DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<AppServices>) -> Router {
    let auth = middleware::WorkerAuth::new(services.worker_token.clone());

    // Worker and operator routes: guarded by the shared worker token.
    let protected = Router::new()
        .nest("/workers", routes::workers::router())
        .nest("/admin", routes::admin::router())
        .layer(axum::middleware::from_fn_with_state(
            auth,
            middleware::require_worker_token,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .route("/stats", get(routes::system::stats))
        .nest("/jobs", routes::jobs::router())
        .merge(protected)
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
