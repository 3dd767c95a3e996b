//! Run materializer
//!
//! Converts a schedule tick, or an explicit submission, into a new Run owned
//! by its project.

use async_trait::async_trait;
use chrono::Utc;
use dagctl_core::domain::project::Project;
use dagctl_core::domain::run::{Run, RunSpec, RunType};
use dagctl_core::dto::run::SubmitRun;
use dagctl_core::meta::LocalObjectReference;
use dagctl_core::{ObjectKey, ObjectMeta, Resource};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{ReconcileError, Result};
use crate::scheduler::TickHandler;
use crate::store::{Store, StoreResult};

/// Attempts at stamping `lastScheduledTime` before giving up
const STAMP_ATTEMPTS: usize = 3;

pub struct RunMaterializer {
    store: Arc<dyn Store>,
}

/// New run for `project`, named `<project>-<suffix>` by the store
pub fn build_run(
    project: &Project,
    run_type: RunType,
    commands: Vec<String>,
    ttl_seconds_after_finished: Option<i32>,
) -> Run {
    let mut metadata = ObjectMeta::named(project.metadata.namespace.clone(), "");
    metadata.generate_name = format!("{}-", project.metadata.name);
    metadata.owner_references = vec![project.controller_ref()];

    Run::new(
        metadata,
        RunSpec {
            project_ref: LocalObjectReference {
                name: project.metadata.name.clone(),
            },
            run_type,
            commands,
            ttl_seconds_after_finished,
        },
    )
}

impl RunMaterializer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Creates a scheduled run for the project at `key`
    ///
    /// Returns `Ok(None)` when the project is gone or no longer wants a
    /// schedule; a tick can race with a suspend or a delete.
    pub async fn materialize_scheduled(&self, key: &ObjectKey) -> Result<Option<Run>> {
        let Some(project) = self.store.projects().get(key).await? else {
            debug!("Tick for {} ignored, project no longer exists", key);
            return Ok(None);
        };

        if !project.wants_schedule() {
            debug!("Tick for {} ignored, project is not scheduled", key);
            return Ok(None);
        }

        let run = build_run(
            &project,
            RunType::Scheduled,
            project.spec.commands.clone(),
            None,
        );
        let run = self.store.runs().create(run).await?;
        info!("Created scheduled run {} for project {}", run.key(), key);

        self.stamp_scheduled_time(key).await;
        Ok(Some(run))
    }

    /// Creates a run requested outside the schedule
    pub async fn submit(&self, key: &ObjectKey, request: SubmitRun) -> Result<Run> {
        if request.run_type == RunType::Scheduled {
            return Err(ReconcileError::Invalid(
                "scheduled runs are created by the project's schedule".to_string(),
            ));
        }

        let project = self
            .store
            .projects()
            .get(key)
            .await?
            .ok_or_else(|| ReconcileError::ProjectNotFound(key.clone()))?;

        let run = build_run(
            &project,
            request.run_type,
            request.commands,
            request.ttl_seconds_after_finished,
        );
        let run = self.store.runs().create(run).await?;
        info!(
            "Created {} run {} for project {}",
            run.spec.run_type.as_str(),
            run.key(),
            key
        );
        Ok(run)
    }

    /// Best effort: the run already exists, so a lost stamp is only logged
    async fn stamp_scheduled_time(&self, key: &ObjectKey) {
        for attempt in 1..=STAMP_ATTEMPTS {
            match self.try_stamp(key).await {
                Ok(()) => return,
                Err(e) if e.is_conflict() && attempt < STAMP_ATTEMPTS => {
                    debug!("Conflict stamping schedule time on {}, retrying", key);
                }
                Err(e) => {
                    warn!("Failed to record schedule time on {}: {}", key, e);
                    return;
                }
            }
        }
    }

    async fn try_stamp(&self, key: &ObjectKey) -> StoreResult<()> {
        let Some(mut project) = self.store.projects().get(key).await? else {
            return Ok(());
        };
        project.status.last_scheduled_time = Some(Utc::now());
        self.store.projects().update_status(project).await?;
        Ok(())
    }
}

#[async_trait]
impl TickHandler for RunMaterializer {
    async fn on_tick(&self, key: ObjectKey) {
        if let Err(e) = self.materialize_scheduled(&key).await {
            warn!("Scheduled run for {} was not created: {}", key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use dagctl_core::domain::project::ProjectSpec;

    async fn seed(store: &MemoryStore, suspend: bool) -> Project {
        let project = Project::new(
            ObjectMeta::named("analytics", "core"),
            ProjectSpec {
                schedule: "0 */5 * * * *".to_string(),
                commands: vec!["build".to_string()],
                suspend,
                ..Default::default()
            },
        );
        store.projects().create(project).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overlapping_ticks_each_create_a_run() {
        let store = MemoryStore::new();
        let project = seed(&store, false).await;
        let materializer = RunMaterializer::new(store.clone());

        let key = project.key();
        tokio::join!(materializer.on_tick(key.clone()), materializer.on_tick(key.clone()));

        let runs = store.runs().list(Some("analytics")).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_ne!(runs[0].metadata.name, runs[1].metadata.name);
        for run in &runs {
            assert_eq!(run.spec.run_type, RunType::Scheduled);
            assert_eq!(run.metadata.controller().unwrap().uid, project.metadata.uid);
        }
        let project = store.projects().get(&key).await.unwrap().unwrap();
        assert!(project.status.last_scheduled_time.is_some());
    }

    #[tokio::test]
    async fn test_tick_creates_owned_scheduled_run() {
        let store = MemoryStore::new();
        let project = seed(&store, false).await;
        let materializer = RunMaterializer::new(store.clone());

        materializer.on_tick(project.key()).await;

        let runs = store.runs().list(Some("analytics")).await.unwrap();
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert!(run.metadata.name.starts_with("core-"));
        assert_eq!(run.spec.run_type, RunType::Scheduled);
        assert_eq!(run.spec.commands, vec!["build"]);
        assert!(run.metadata.is_controlled_by(&project.metadata.uid));

        let project = store.projects().get(&project.key()).await.unwrap().unwrap();
        assert!(project.status.last_scheduled_time.is_some());
    }

    #[tokio::test]
    async fn test_tick_skips_suspended_and_missing_projects() {
        let store = MemoryStore::new();
        let project = seed(&store, true).await;
        let materializer = RunMaterializer::new(store.clone());

        assert!(materializer.materialize_scheduled(&project.key()).await.unwrap().is_none());
        let missing = ObjectKey::new("analytics", "gone");
        assert!(materializer.materialize_scheduled(&missing).await.unwrap().is_none());

        assert!(store.runs().list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_manual_run() {
        let store = MemoryStore::new();
        let project = seed(&store, true).await;
        let materializer = RunMaterializer::new(store.clone());

        let run = materializer
            .submit(
                &project.key(),
                SubmitRun {
                    run_type: RunType::Manual,
                    commands: vec!["seed".to_string()],
                    ttl_seconds_after_finished: Some(60),
                },
            )
            .await
            .unwrap();

        assert_eq!(run.spec.run_type, RunType::Manual);
        assert_eq!(run.spec.ttl_seconds_after_finished, Some(60));

        let err = materializer
            .submit(
                &ObjectKey::new("analytics", "gone"),
                SubmitRun {
                    run_type: RunType::Webhook,
                    commands: vec![],
                    ttl_seconds_after_finished: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::ProjectNotFound(_)));
    }
}
