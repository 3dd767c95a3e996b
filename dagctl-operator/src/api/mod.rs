//! API Module
//!
//! HTTP surface of the operator: declaring projects, requesting runs and
//! reporting execution unit status on behalf of the runtime.
//! Each submodule handles endpoints for a specific kind.

pub mod error;
pub mod health;
pub mod project;
pub mod run;
pub mod unit;

use axum::{
    Router,
    routing::{get, post, put},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::service::RunMaterializer;
use crate::store::Store;

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn Store>,
    pub materializer: Arc<RunMaterializer>,
}

/// Create the main API router with all endpoints
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Project endpoints
        .route("/api/projects", get(project::list_projects))
        .route(
            "/api/projects/{namespace}/{name}",
            get(project::get_project)
                .put(project::apply_project)
                .delete(project::delete_project),
        )
        .route(
            "/api/projects/{namespace}/{name}/runs",
            post(run::submit_run),
        )
        // Run endpoints
        .route("/api/runs", get(run::list_runs))
        .route(
            "/api/runs/{namespace}/{name}",
            get(run::get_run).delete(run::delete_run),
        )
        // Execution unit endpoints
        .route("/api/units", get(unit::list_units))
        .route(
            "/api/units/{namespace}/{name}/status",
            put(unit::report_status),
        )
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
