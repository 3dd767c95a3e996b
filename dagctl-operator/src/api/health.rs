//! Liveness endpoint
//!
//! Reports how many objects of each kind the store currently holds, which
//! doubles as a check that the store answers reads.

use axum::{Json, extract::State};
use serde::Serialize;

use crate::api::ApiState;
use crate::api::error::ApiResult;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub projects: usize,
    pub runs: usize,
    pub units: usize,
}

/// GET /health
pub async fn health_check(State(state): State<ApiState>) -> ApiResult<Json<Health>> {
    Ok(Json(Health {
        status: "ok",
        projects: state.store.projects().list(None).await?.len(),
        runs: state.store.runs().list(None).await?.len(),
        units: state.store.units().list(None).await?.len(),
    }))
}
