//! Execution Unit API Handlers
//!
//! The runtime polls for units to execute and reports their counters back.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use chrono::Utc;
use dagctl_core::ObjectKey;
use dagctl_core::domain::unit::{ExecutionUnit, UnitOutcome, UnitStatus};
use dagctl_core::dto::unit::ReportUnitStatus;
use serde::Deserialize;

use crate::api::ApiState;
use crate::api::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct UnitsQuery {
    pub namespace: Option<String>,
    /// Only units without an outcome yet
    #[serde(default)]
    pub pending: bool,
}

/// GET /api/units
pub async fn list_units(
    State(state): State<ApiState>,
    Query(params): Query<UnitsQuery>,
) -> ApiResult<Json<Vec<ExecutionUnit>>> {
    tracing::debug!("Listing units (pending only: {})", params.pending);

    let mut units = state.store.units().list(params.namespace.as_deref()).await?;
    if params.pending {
        units.retain(|u| u.outcome() == UnitOutcome::Running);
    }
    Ok(Json(units))
}

/// Folds a runtime report into the unit's current status
fn merge_report(current: &UnitStatus, report: ReportUnitStatus) -> UnitStatus {
    let now = Utc::now();
    let mut status = UnitStatus {
        active: report.active,
        succeeded: report.succeeded,
        failed: report.failed,
        start_time: current.start_time,
        completion_time: current.completion_time,
        message: report.message,
    };

    let outcome = UnitOutcome::classify(&status);
    if status.start_time.is_none() && (status.active > 0 || outcome != UnitOutcome::Running) {
        status.start_time = Some(now);
    }
    if status.completion_time.is_none() && outcome != UnitOutcome::Running {
        status.completion_time = Some(now);
    }
    status
}

/// PUT /api/units/{namespace}/{name}/status
/// Report execution progress of a unit
pub async fn report_status(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(req): Json<ReportUnitStatus>,
) -> ApiResult<Json<ExecutionUnit>> {
    let key = ObjectKey::new(namespace, name);

    if req.active < 0 || req.succeeded < 0 || req.failed < 0 {
        return Err(ApiError::BadRequest(
            "status counters cannot be negative".to_string(),
        ));
    }

    let mut unit = state
        .store
        .units()
        .get(&key)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Execution unit {} not found", key)))?;

    unit.status = merge_report(&unit.status, req);
    tracing::info!(
        "Unit {} reported: active={} succeeded={} failed={}",
        key,
        unit.status.active,
        unit.status.succeeded,
        unit.status.failed
    );

    let unit = state.store.units().update_status(unit).await?;
    Ok(Json(unit))
}
