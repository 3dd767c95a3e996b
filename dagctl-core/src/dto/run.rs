//! Run DTOs

use serde::{Deserialize, Serialize};

use crate::domain::run::RunType;

/// Request to start a run of a project outside its schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRun {
    #[serde(rename = "type", default)]
    pub run_type: RunType,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub ttl_seconds_after_finished: Option<i32>,
}
