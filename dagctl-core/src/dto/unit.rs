//! Execution unit DTOs

use serde::{Deserialize, Serialize};

/// Counters reported by the runtime executing a unit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportUnitStatus {
    #[serde(default)]
    pub active: i32,
    #[serde(default)]
    pub succeeded: i32,
    #[serde(default)]
    pub failed: i32,
    #[serde(default)]
    pub message: String,
}
