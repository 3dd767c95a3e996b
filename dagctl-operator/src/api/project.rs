//! Project API Handlers
//!
//! HTTP endpoints for declaring, reading and removing projects.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use dagctl_core::domain::project::Project;
use dagctl_core::dto::project::ApplyProject;
use dagctl_core::{ObjectKey, ObjectMeta};
use serde::Deserialize;

use crate::api::ApiState;
use crate::api::error::{ApiError, ApiResult};

/// Query parameters for list endpoints
#[derive(Debug, Deserialize)]
pub struct NamespaceQuery {
    pub namespace: Option<String>,
}

/// PUT /api/projects/{namespace}/{name}
/// Create the project, or replace the declaration of an existing one
pub async fn apply_project(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(req): Json<ApplyProject>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    let key = ObjectKey::new(namespace, name);

    if req.spec.git.repository.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "spec.git.repository cannot be empty".to_string(),
        ));
    }

    match state.store.projects().get(&key).await? {
        Some(mut project) => {
            tracing::info!("Updating project: {}", key);
            project.spec = req.spec;
            project.metadata.labels = req.labels;
            let project = state.store.projects().update(project).await?;
            Ok((StatusCode::OK, Json(project)))
        }
        None => {
            tracing::info!("Creating project: {}", key);
            let mut metadata = ObjectMeta::named(key.namespace, key.name);
            metadata.labels = req.labels;
            let project = state
                .store
                .projects()
                .create(Project::new(metadata, req.spec))
                .await?;
            Ok((StatusCode::CREATED, Json(project)))
        }
    }
}

/// GET /api/projects/{namespace}/{name}
pub async fn get_project(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<Json<Project>> {
    let key = ObjectKey::new(namespace, name);
    tracing::debug!("Getting project: {}", key);

    state
        .store
        .projects()
        .get(&key)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Project {} not found", key)))
}

/// GET /api/projects
/// List projects, optionally restricted to one namespace
pub async fn list_projects(
    State(state): State<ApiState>,
    Query(params): Query<NamespaceQuery>,
) -> ApiResult<Json<Vec<Project>>> {
    tracing::debug!("Listing projects");

    let projects = state
        .store
        .projects()
        .list(params.namespace.as_deref())
        .await?;
    Ok(Json(projects))
}

/// DELETE /api/projects/{namespace}/{name}
/// Delete a project together with its runs and their units
pub async fn delete_project(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let key = ObjectKey::new(namespace, name);
    tracing::info!("Deleting project: {}", key);

    if state.store.projects().delete(&key).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Project {} not found", key)))
    }
}
