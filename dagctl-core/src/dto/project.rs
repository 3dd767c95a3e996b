//! Project DTOs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::project::ProjectSpec;

/// Create-or-update request for a project declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyProject {
    pub spec: ProjectSpec,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}
