//! Project domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::workload::{EnvVar, ResourceRequirements, VolumeClaimTemplate, VolumeMount};
use crate::meta::{Condition, ObjectKind, ObjectMeta, ObjectReference, Resource};

pub const DEFAULT_SUCCESSFUL_HISTORY_LIMIT: usize = 3;
pub const DEFAULT_FAILED_HISTORY_LIMIT: usize = 1;

/// A dbt project declaration
///
/// Authored by users; the operator only ever writes its status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub metadata: ObjectMeta,
    pub spec: ProjectSpec,
    #[serde(default)]
    pub status: ProjectStatus,
}

impl Project {
    pub fn new(metadata: ObjectMeta, spec: ProjectSpec) -> Self {
        Self {
            metadata,
            spec,
            status: ProjectStatus::default(),
        }
    }

    /// Whether a timer should be live for this project
    pub fn wants_schedule(&self) -> bool {
        !self.spec.suspend && !self.spec.schedule.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    pub git: GitSource,
    /// Six-field cron expression (seconds first); empty means unscheduled
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub schedule: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub profiles_config_map: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub profiles_secret: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_jobs_history_limit: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_jobs_history_limit: Option<i32>,
    #[serde(default)]
    pub suspend: bool,
    #[serde(default)]
    pub volume_claim_templates: Vec<VolumeClaimTemplate>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

impl ProjectSpec {
    pub fn successful_history_limit(&self) -> usize {
        self.successful_jobs_history_limit
            .map(|n| n.max(0) as usize)
            .unwrap_or(DEFAULT_SUCCESSFUL_HISTORY_LIMIT)
    }

    pub fn failed_history_limit(&self) -> usize {
        self.failed_jobs_history_limit
            .map(|n| n.max(0) as usize)
            .unwrap_or(DEFAULT_FAILED_HISTORY_LIMIT)
    }
}

/// Versioned source location of the dbt project
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSource {
    pub repository: String,
    #[serde(rename = "ref", default, skip_serializing_if = "String::is_empty")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssh_key_secret: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scheduled_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub active_runs: Vec<ObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ProjectPhase>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub observed_generation: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectPhase {
    Ready,
    Suspended,
    Error,
}

impl Resource for Project {
    const KIND: ObjectKind = ObjectKind::Project;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn same_spec(&self, other: &Self) -> bool {
        self.spec == other.spec
    }

    fn adopt_status(&mut self, other: Self) {
        self.status = other.status;
    }
}
