//! Execution unit domain types
//!
//! An execution unit is the supervised, container-based workload that does
//! the work of one Run. The operator only writes its spec; the runtime that
//! executes it reports status through the observation contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::workload::{EnvFromSource, EnvVar, ResourceRequirements, Volume, VolumeMount};
use crate::meta::{ObjectKind, ObjectMeta, Resource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionUnit {
    pub metadata: ObjectMeta,
    pub spec: UnitSpec,
    #[serde(default)]
    pub status: UnitStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitSpec {
    /// Preparatory steps, run to completion in order before `steps`
    #[serde(default)]
    pub init_steps: Vec<Step>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    pub restart_policy: RestartPolicy,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,
}

/// One container invocation inside a unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub env_from: Vec<EnvFromSource>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
    #[default]
    Never,
}

/// Observed state reported by the runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitStatus {
    #[serde(default)]
    pub active: i32,
    #[serde(default)]
    pub succeeded: i32,
    #[serde(default)]
    pub failed: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Outcome of a unit, derived from its counters
///
/// Success wins over failure so a unit that retried into success is
/// reported as succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Succeeded,
    Failed,
    Running,
}

impl UnitOutcome {
    pub fn classify(status: &UnitStatus) -> Self {
        if status.succeeded > 0 {
            Self::Succeeded
        } else if status.failed > 0 {
            Self::Failed
        } else {
            Self::Running
        }
    }
}

impl ExecutionUnit {
    pub fn outcome(&self) -> UnitOutcome {
        UnitOutcome::classify(&self.status)
    }
}

impl Resource for ExecutionUnit {
    const KIND: ObjectKind = ObjectKind::ExecutionUnit;

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

#[cfg(test)]
mod tests {
    use super::*;

    fn status(succeeded: i32, failed: i32) -> UnitStatus {
        UnitStatus {
            succeeded,
            failed,
            ..Default::default()
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(UnitOutcome::classify(&status(0, 0)), UnitOutcome::Running);
        assert_eq!(UnitOutcome::classify(&status(1, 0)), UnitOutcome::Succeeded);
        assert_eq!(UnitOutcome::classify(&status(0, 2)), UnitOutcome::Failed);
    }

    #[test]
    fn test_success_wins_over_failure() {
        assert_eq!(UnitOutcome::classify(&status(1, 3)), UnitOutcome::Succeeded);
    }
}
