//! Project reconciler
//!
//! Keeps a project's timer in step with its declaration and maintains the
//! project's status: phase, Ready condition, active runs and run history.
//!
//! Each pass first computes a `ProjectPlan` from the project and its runs,
//! then applies it. Applying a plan twice has the same effect as applying it
//! once.

use async_trait::async_trait;
use dagctl_core::domain::project::{Project, ProjectPhase, ProjectStatus};
use dagctl_core::domain::run::Run;
use dagctl_core::meta::{Condition, ConditionStatus, ObjectReference, set_condition};
use dagctl_core::{ObjectKey, Resource};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{Result, RunMaterializer};
use crate::controller::{Action, Reconciler};
use crate::scheduler::{CronTable, ScheduleError};
use crate::store::{Store, WatchEvent, WatchObject};

pub const CONDITION_READY: &str = "Ready";

/// What the project's timer entry should be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerIntent {
    Install(String),
    Suspended,
    Unscheduled,
}

impl TimerIntent {
    pub fn for_project(project: &Project) -> Self {
        if project.spec.suspend {
            Self::Suspended
        } else if project.spec.schedule.trim().is_empty() {
            Self::Unscheduled
        } else {
            Self::Install(project.spec.schedule.trim().to_string())
        }
    }
}

/// Everything one reconcile pass wants to change
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectPlan {
    pub timer: TimerIntent,
    pub active_runs: Vec<ObjectReference>,
    /// Finished runs beyond the history limits, oldest first
    pub prune: Vec<ObjectKey>,
}

impl ProjectPlan {
    pub fn new(project: &Project, runs: &[Run]) -> Self {
        let mine: Vec<&Run> = runs
            .iter()
            .filter(|r| {
                r.metadata.namespace == project.metadata.namespace
                    && r.spec.project_ref.name == project.metadata.name
            })
            .collect();

        let mut active_runs: Vec<ObjectReference> = mine
            .iter()
            .filter(|r| !r.is_finished())
            .map(|r| r.object_ref())
            .collect();
        active_runs.sort_by(|a, b| a.name.cmp(&b.name));

        // Only runs placed under the project are pruned; runs created by
        // someone else are theirs to clean up.
        let owned: Vec<&Run> = mine
            .into_iter()
            .filter(|r| r.is_finished() && r.metadata.is_controlled_by(&project.metadata.uid))
            .collect();

        let failed = |r: &&Run| r.status.phase.is_some_and(|p| p.is_failure());
        let succeeded: Vec<&Run> = owned.iter().copied().filter(|r| !failed(r)).collect();
        let failures: Vec<&Run> = owned.iter().copied().filter(failed).collect();

        let mut prune = excess(succeeded, project.spec.successful_history_limit());
        prune.extend(excess(failures, project.spec.failed_history_limit()));

        Self {
            timer: TimerIntent::for_project(project),
            active_runs,
            prune,
        }
    }
}

/// Keys of the oldest runs that push `runs` over `limit`
fn excess(mut runs: Vec<&Run>, limit: usize) -> Vec<ObjectKey> {
    if runs.len() <= limit {
        return Vec::new();
    }
    runs.sort_by_key(|r| {
        (
            r.status.completion_time.or(r.metadata.creation_timestamp),
            r.metadata.name.clone(),
        )
    });
    let count = runs.len() - limit;
    runs.into_iter().take(count).map(|r| r.key()).collect()
}

pub struct ProjectReconciler {
    store: Arc<dyn Store>,
    cron: Arc<CronTable>,
    materializer: Arc<RunMaterializer>,
    schedule_retry: Duration,
}

impl ProjectReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        cron: Arc<CronTable>,
        materializer: Arc<RunMaterializer>,
        schedule_retry: Duration,
    ) -> Self {
        Self {
            store,
            cron,
            materializer,
            schedule_retry,
        }
    }

    /// Converges the timer table; returns the install error, if any
    fn apply_timer(&self, key: &ObjectKey, intent: &TimerIntent) -> std::result::Result<(), ScheduleError> {
        match intent {
            TimerIntent::Install(expression) => {
                // Reinstalling an unchanged expression would reset the timer
                // on every status write, so leave a matching entry alone.
                if self.cron.expression(key).as_deref() == Some(expression.as_str()) {
                    return Ok(());
                }
                self.cron
                    .install(key, expression, self.materializer.clone())
                    .map(|_| ())
            }
            TimerIntent::Suspended | TimerIntent::Unscheduled => {
                self.cron.remove(key);
                Ok(())
            }
        }
    }

    async fn prune(&self, keys: &[ObjectKey]) {
        for key in keys {
            match self.store.runs().delete(key).await {
                Ok(true) => info!("Pruned run {} from history", key),
                Ok(false) => {}
                Err(e) => warn!("Failed to prune run {}: {}", key, e),
            }
        }
    }
}

/// Status the project should carry after applying `plan`
fn desired_status(
    project: &Project,
    plan: &ProjectPlan,
    timer: &std::result::Result<(), ScheduleError>,
) -> ProjectStatus {
    let generation = project.metadata.generation;
    let mut status = project.status.clone();
    status.active_runs = plan.active_runs.clone();
    status.observed_generation = generation;

    let (phase, condition) = match (&plan.timer, timer) {
        (_, Err(e)) => (
            ProjectPhase::Error,
            Condition::new(CONDITION_READY, ConditionStatus::False, "InvalidSchedule", e.to_string()),
        ),
        (TimerIntent::Suspended, _) => (
            ProjectPhase::Suspended,
            Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                "Suspended",
                "Scheduling is suspended",
            ),
        ),
        (TimerIntent::Install(expression), _) => (
            ProjectPhase::Ready,
            Condition::new(
                CONDITION_READY,
                ConditionStatus::True,
                "Scheduled",
                format!("Runs are scheduled on '{}'", expression),
            ),
        ),
        (TimerIntent::Unscheduled, _) => (
            ProjectPhase::Ready,
            Condition::new(
                CONDITION_READY,
                ConditionStatus::True,
                "Unscheduled",
                "No schedule declared; runs are created on request",
            ),
        ),
    };

    status.phase = Some(phase);
    set_condition(&mut status.conditions, condition.with_generation(generation));
    status
}

#[async_trait]
impl Reconciler for ProjectReconciler {
    fn name(&self) -> &'static str {
        "project"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(mut project) = self.store.projects().get(key).await? else {
            if self.cron.remove(key) {
                debug!("Project {} is gone, timer removed", key);
            }
            return Ok(Action::Done);
        };

        let runs = self
            .store
            .runs()
            .list(Some(&project.metadata.namespace))
            .await?;
        let mut plan = ProjectPlan::new(&project, &runs);

        self.prune(&plan.prune).await;
        plan.active_runs
            .retain(|r| !plan.prune.iter().any(|k| k.name == r.name));

        let timer = self.apply_timer(key, &plan.timer);
        if let Err(e) = &timer {
            error!("Failed to schedule project {}: {}", key, e);
        }

        let status = desired_status(&project, &plan, &timer);
        if status != project.status {
            let phase = status.phase;
            project.status = status;
            self.store.projects().update_status(project).await?;
            debug!("Project {} status written, phase {:?}", key, phase);
        }

        match timer {
            Ok(()) => Ok(Action::Done),
            Err(_) => Ok(Action::RequeueAfter(self.schedule_retry)),
        }
    }

    fn triggers(&self, event: &WatchEvent) -> Vec<ObjectKey> {
        match &event.object {
            WatchObject::Project(project) => vec![project.key()],
            WatchObject::Run(run) => vec![run.project_key()],
            WatchObject::ExecutionUnit(_) => Vec::new(),
        }
    }

    async fn keys(&self) -> Result<Vec<ObjectKey>> {
        let projects = self.store.projects().list(None).await?;
        Ok(projects.iter().map(|p| p.key()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{Duration as ChronoDuration, Utc};
    use dagctl_core::ObjectMeta;
    use dagctl_core::domain::project::ProjectSpec;
    use dagctl_core::domain::run::{RunPhase, RunType};
    use dagctl_core::meta::find_condition;

    use crate::service::materializer::build_run;

    struct Harness {
        store: Arc<MemoryStore>,
        cron: Arc<CronTable>,
        reconciler: ProjectReconciler,
    }

    fn harness() -> Harness {
        let store = MemoryStore::new();
        let cron = CronTable::new();
        let materializer = Arc::new(RunMaterializer::new(store.clone()));
        let reconciler = ProjectReconciler::new(
            store.clone(),
            cron.clone(),
            materializer,
            Duration::from_secs(60),
        );
        Harness {
            store,
            cron,
            reconciler,
        }
    }

    async fn seed(store: &MemoryStore, schedule: &str, suspend: bool) -> Project {
        let project = Project::new(
            ObjectMeta::named("analytics", "core"),
            ProjectSpec {
                schedule: schedule.to_string(),
                suspend,
                ..Default::default()
            },
        );
        store.projects().create(project).await.unwrap()
    }

    async fn fetch(store: &MemoryStore, key: &ObjectKey) -> Project {
        store.projects().get(key).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_scheduled_project_is_ready() {
        let h = harness();
        let project = seed(&h.store, "0 */5 * * * *", false).await;

        let action = h.reconciler.reconcile(&project.key()).await.unwrap();
        assert_eq!(action, Action::Done);
        assert!(h.cron.contains(&project.key()));

        let project = fetch(&h.store, &project.key()).await;
        assert_eq!(project.status.phase, Some(ProjectPhase::Ready));
        assert_eq!(project.status.observed_generation, 1);
        let ready = find_condition(&project.status.conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.reason, "Scheduled");
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let h = harness();
        let project = seed(&h.store, "0 */5 * * * *", false).await;

        h.reconciler.reconcile(&project.key()).await.unwrap();
        let entry = h.cron.entry_id(&project.key());
        let version = fetch(&h.store, &project.key()).await.metadata.resource_version;

        h.reconciler.reconcile(&project.key()).await.unwrap();

        assert_eq!(h.cron.len(), 1);
        assert_eq!(h.cron.entry_id(&project.key()), entry);
        assert_eq!(
            fetch(&h.store, &project.key()).await.metadata.resource_version,
            version
        );
    }

    #[tokio::test]
    async fn test_suspend_removes_timer() {
        let h = harness();
        let project = seed(&h.store, "0 */5 * * * *", false).await;
        h.reconciler.reconcile(&project.key()).await.unwrap();
        assert!(h.cron.contains(&project.key()));

        let mut project = fetch(&h.store, &project.key()).await;
        project.spec.suspend = true;
        h.store.projects().update(project.clone()).await.unwrap();
        h.reconciler.reconcile(&project.key()).await.unwrap();

        assert!(!h.cron.contains(&project.key()));
        let project = fetch(&h.store, &project.key()).await;
        assert_eq!(project.status.phase, Some(ProjectPhase::Suspended));
        assert_eq!(project.status.observed_generation, 2);
    }

    #[tokio::test]
    async fn test_suspend_wins_over_invalid_schedule() {
        let h = harness();
        let project = seed(&h.store, "whenever", true).await;

        let action = h.reconciler.reconcile(&project.key()).await.unwrap();

        assert_eq!(action, Action::Done);
        let project = fetch(&h.store, &project.key()).await;
        assert_eq!(project.status.phase, Some(ProjectPhase::Suspended));
    }

    #[tokio::test]
    async fn test_invalid_schedule_requeues_with_fixed_delay() {
        let h = harness();
        let project = seed(&h.store, "every five minutes", false).await;

        let action = h.reconciler.reconcile(&project.key()).await.unwrap();

        assert_eq!(action, Action::RequeueAfter(Duration::from_secs(60)));
        assert!(!h.cron.contains(&project.key()));
        let project = fetch(&h.store, &project.key()).await;
        assert_eq!(project.status.phase, Some(ProjectPhase::Error));
        let ready = find_condition(&project.status.conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.reason, "InvalidSchedule");
    }

    #[tokio::test]
    async fn test_cleared_schedule_removes_timer() {
        let h = harness();
        let project = seed(&h.store, "0 */5 * * * *", false).await;
        h.reconciler.reconcile(&project.key()).await.unwrap();

        let mut project = fetch(&h.store, &project.key()).await;
        project.spec.schedule.clear();
        h.store.projects().update(project.clone()).await.unwrap();
        h.reconciler.reconcile(&project.key()).await.unwrap();

        assert!(h.cron.is_empty());
        let project = fetch(&h.store, &project.key()).await;
        assert_eq!(project.status.phase, Some(ProjectPhase::Ready));
    }

    #[tokio::test]
    async fn test_missing_project_is_noop() {
        let h = harness();
        let action = h
            .reconciler
            .reconcile(&ObjectKey::new("analytics", "gone"))
            .await
            .unwrap();
        assert_eq!(action, Action::Done);
        assert!(h.store.projects().list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_pruning_and_active_runs() {
        let h = harness();
        let project = seed(&h.store, "", false).await;
        let base = Utc::now() - ChronoDuration::hours(1);

        let finish = |phase: RunPhase, minutes: i64| {
            let mut run = build_run(&project, RunType::Manual, vec![], None);
            run.status.phase = Some(phase);
            run.status.completion_time = Some(base + ChronoDuration::minutes(minutes));
            run
        };
        let runs = vec![
            finish(RunPhase::Succeeded, 1),
            finish(RunPhase::Succeeded, 2),
            finish(RunPhase::Succeeded, 3),
            finish(RunPhase::Succeeded, 4),
            finish(RunPhase::Failed, 5),
            finish(RunPhase::Error, 6),
        ];

        let mut oldest_success = None;
        let mut older_failure = None;
        for (i, run) in runs.into_iter().enumerate() {
            let status = run.status.clone();
            let mut created = h.store.runs().create(run).await.unwrap();
            created.status = status;
            let created = h.store.runs().update_status(created).await.unwrap();
            match i {
                0 => oldest_success = Some(created.key()),
                4 => older_failure = Some(created.key()),
                _ => {}
            }
        }
        let active = h
            .store
            .runs()
            .create(build_run(&project, RunType::Manual, vec![], None))
            .await
            .unwrap();

        h.reconciler.reconcile(&project.key()).await.unwrap();

        let remaining = h.store.runs().list(Some("analytics")).await.unwrap();
        assert_eq!(remaining.len(), 5);
        assert!(!remaining.iter().any(|r| Some(r.key()) == oldest_success));
        assert!(!remaining.iter().any(|r| Some(r.key()) == older_failure));

        let project = fetch(&h.store, &project.key()).await;
        assert_eq!(project.status.active_runs.len(), 1);
        assert_eq!(project.status.active_runs[0].name, active.metadata.name);
    }

    #[tokio::test]
    async fn test_triggers_map_runs_to_project() {
        let h = harness();
        let project = seed(&h.store, "", false).await;
        let run = build_run(&project, RunType::Manual, vec![], None);

        let event = WatchEvent {
            action: crate::store::WatchAction::Added,
            object: WatchObject::Run(run),
        };
        assert_eq!(h.reconciler.triggers(&event), vec![project.key()]);
    }
}
