//! Run API Handlers
//!
//! HTTP endpoints for requesting runs and inspecting their progress.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use dagctl_core::ObjectKey;
use dagctl_core::domain::run::Run;
use dagctl_core::dto::run::SubmitRun;
use serde::Deserialize;

use crate::api::ApiState;
use crate::api::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub namespace: Option<String>,
    /// Only runs of this project
    pub project: Option<String>,
}

/// POST /api/projects/{namespace}/{name}/runs
/// Request a manual or webhook run of a project
pub async fn submit_run(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(req): Json<SubmitRun>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    let key = ObjectKey::new(namespace, name);
    tracing::info!("Submitting {} run for project: {}", req.run_type.as_str(), key);

    let run = state.materializer.submit(&key, req).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

/// GET /api/runs/{namespace}/{name}
pub async fn get_run(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<Json<Run>> {
    let key = ObjectKey::new(namespace, name);
    tracing::debug!("Getting run: {}", key);

    state
        .store
        .runs()
        .get(&key)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Run {} not found", key)))
}

/// GET /api/runs
///
/// Query parameters:
/// - `namespace` (optional)
/// - `project` (optional): only runs referencing this project
pub async fn list_runs(
    State(state): State<ApiState>,
    Query(params): Query<RunsQuery>,
) -> ApiResult<Json<Vec<Run>>> {
    tracing::debug!("Listing runs");

    let mut runs = state.store.runs().list(params.namespace.as_deref()).await?;
    if let Some(project) = &params.project {
        runs.retain(|r| &r.spec.project_ref.name == project);
    }
    runs.sort_by(|a, b| a.metadata.creation_timestamp.cmp(&b.metadata.creation_timestamp));
    Ok(Json(runs))
}

/// DELETE /api/runs/{namespace}/{name}
/// Delete a run together with its execution unit
pub async fn delete_run(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let key = ObjectKey::new(namespace, name);
    tracing::info!("Deleting run: {}", key);

    if state.store.runs().delete(&key).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Run {} not found", key)))
    }
}
