//! Run reconciler
//!
//! Drives a Run through its lifecycle: launches exactly one execution unit,
//! mirrors the unit's status, classifies the outcome and rolls successful
//! completions up to the project. Finished runs with a TTL are deleted once
//! it elapses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dagctl_core::domain::project::Project;
use dagctl_core::domain::run::{Run, RunPhase};
use dagctl_core::domain::unit::{ExecutionUnit, UnitOutcome};
use dagctl_core::meta::{Condition, ConditionStatus, set_condition};
use dagctl_core::{ObjectKey, ObjectKind, Resource};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{ReconcileError, Result, UnitBuilder};
use crate::controller::{Action, Reconciler};
use crate::store::{Store, WatchEvent, WatchObject};

pub const CONDITION_COMPLETE: &str = "Complete";
pub const CONDITION_FAILED: &str = "Failed";

/// Next move for a run that already has a unit reference
#[derive(Debug, Clone, PartialEq)]
pub enum UnitObservation {
    /// The unit exists; mirror it
    Present(ExecutionUnit),
    /// The unit is absent but may still appear in the store
    Waiting(Duration),
    /// The unit stayed absent past the grace period
    Lost,
    /// The unit is absent after the run finished; nothing to do
    Retired,
}

impl UnitObservation {
    pub fn new(
        run: &Run,
        unit: Option<ExecutionUnit>,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Self {
        if let Some(unit) = unit {
            return Self::Present(unit);
        }
        if run.is_finished() {
            return Self::Retired;
        }

        let since = run
            .status
            .start_time
            .or(run.metadata.creation_timestamp)
            .unwrap_or(now);
        let elapsed = (now - since).to_std().unwrap_or_default();
        if elapsed < grace {
            Self::Waiting(grace - elapsed)
        } else {
            Self::Lost
        }
    }
}

/// Applies the unit's observed state to the run status
pub fn apply_outcome(run: &mut Run, unit: &ExecutionUnit, now: DateTime<Utc>) {
    let generation = run.metadata.generation;
    let status = &mut run.status;
    status.job_status = Some(unit.status.clone());
    // Error is final even if the unit shows up again.
    if status.phase == Some(RunPhase::Error) {
        return;
    }

    match unit.outcome() {
        UnitOutcome::Succeeded => {
            status.phase = Some(RunPhase::Succeeded);
            status.completion_time.get_or_insert(unit.status.completion_time.unwrap_or(now));
            set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_COMPLETE, ConditionStatus::True, "UnitSucceeded", "")
                    .with_generation(generation),
            );
        }
        UnitOutcome::Failed => {
            status.phase = Some(RunPhase::Failed);
            status.completion_time.get_or_insert(unit.status.completion_time.unwrap_or(now));
            set_condition(
                &mut status.conditions,
                Condition::new(
                    CONDITION_FAILED,
                    ConditionStatus::True,
                    "UnitFailed",
                    unit.status.message.clone(),
                )
                .with_generation(generation),
            );
        }
        UnitOutcome::Running => {
            status.phase = Some(RunPhase::Running);
        }
    }
}

/// Time left before a finished run should be deleted
///
/// `None` when the run has no TTL or is not finished.
pub fn ttl_remaining(run: &Run, now: DateTime<Utc>) -> Option<Duration> {
    let ttl = run.spec.ttl_seconds_after_finished?;
    let completed = run.status.completion_time.filter(|_| run.is_finished())?;
    let expires = completed + chrono::Duration::seconds(i64::from(ttl.max(0)));
    Some((expires - now).to_std().unwrap_or_default())
}

pub struct RunReconciler {
    store: Arc<dyn Store>,
    builder: UnitBuilder,
    unit_missing_grace: Duration,
}

impl RunReconciler {
    pub fn new(store: Arc<dyn Store>, builder: UnitBuilder, unit_missing_grace: Duration) -> Self {
        Self {
            store,
            builder,
            unit_missing_grace,
        }
    }

    async fn write_status(&self, run: &mut Run, original: &Run) -> Result<()> {
        if run.status != original.status {
            *run = self.store.runs().update_status(run.clone()).await?;
        }
        Ok(())
    }

    /// Creates (or adopts) the unit and records it on the run
    async fn launch(&self, mut run: Run, original: &Run, project: &Project) -> Result<Action> {
        match self.builder.launch(self.store.as_ref(), &run, project).await {
            Ok(unit) => {
                run.status.job_ref = Some(unit.object_ref());
                run.status.start_time.get_or_insert(Utc::now());
                run.status.phase = Some(RunPhase::Running);
                self.write_status(&mut run, original).await?;
                info!("Run {} started with unit {}", run.key(), unit.key());
                Ok(Action::Done)
            }
            Err(e) => {
                error!("Failed to launch unit for run {}: {}", run.key(), e);
                run.status.phase = Some(RunPhase::Error);
                set_condition(
                    &mut run.status.conditions,
                    Condition::new(CONDITION_FAILED, ConditionStatus::True, "LaunchFailed", e.to_string())
                        .with_generation(run.metadata.generation),
                );
                self.write_status(&mut run, original).await?;
                Err(e.into())
            }
        }
    }

    /// Best effort; repeated reconciles of a succeeded run retry it
    async fn roll_up(&self, project: Project, completed: DateTime<Utc>) {
        if project
            .status
            .last_successful_time
            .is_some_and(|t| t >= completed)
        {
            return;
        }

        let key = project.key();
        let mut project = project;
        project.status.last_successful_time = Some(completed);
        match self.store.projects().update_status(project).await {
            Ok(_) => debug!("Project {} last successful time set to {}", key, completed),
            Err(e) => warn!("Failed to record successful run on project {}: {}", key, e),
        }
    }
}

#[async_trait]
impl Reconciler for RunReconciler {
    fn name(&self) -> &'static str {
        "run"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(original) = self.store.runs().get(key).await? else {
            return Ok(Action::Done);
        };

        let project_key = original.project_key();
        let project = self
            .store
            .projects()
            .get(&project_key)
            .await?
            .ok_or(ReconcileError::ProjectNotFound(project_key))?;

        let mut run = original.clone();
        if run.status.phase.is_none() {
            run.status.phase = Some(RunPhase::Pending);
        }

        let Some(job_ref) = run.status.job_ref.clone() else {
            return self.launch(run, &original, &project).await;
        };

        let now = Utc::now();
        let unit = self.store.units().get(&job_ref.key()).await?;
        match UnitObservation::new(&run, unit, now, self.unit_missing_grace) {
            UnitObservation::Present(unit) => apply_outcome(&mut run, &unit, now),
            UnitObservation::Retired => {}
            UnitObservation::Waiting(remaining) => {
                debug!("Unit {} for run {} not visible yet", job_ref.key(), key);
                self.write_status(&mut run, &original).await?;
                return Ok(Action::RequeueAfter(remaining));
            }
            UnitObservation::Lost => {
                warn!("Unit {} for run {} is missing", job_ref.key(), key);
                run.status.phase = Some(RunPhase::Error);
                run.status.completion_time.get_or_insert(now);
                set_condition(
                    &mut run.status.conditions,
                    Condition::new(
                        CONDITION_FAILED,
                        ConditionStatus::True,
                        "UnitMissing",
                        format!("execution unit {} no longer exists", job_ref.key()),
                    )
                    .with_generation(run.metadata.generation),
                );
            }
        }

        let finished_now = run.is_finished() && !original.is_finished();
        self.write_status(&mut run, &original).await?;
        if finished_now {
            info!("Run {} finished with phase {:?}", key, run.status.phase);
        }

        if run.status.phase == Some(RunPhase::Succeeded) {
            if let Some(completed) = run.status.completion_time {
                self.roll_up(project, completed).await;
            }
        }

        match ttl_remaining(&run, now) {
            Some(remaining) if remaining.is_zero() => {
                self.store.runs().delete(key).await?;
                info!("Deleted run {} after its TTL elapsed", key);
                Ok(Action::Done)
            }
            Some(remaining) => Ok(Action::RequeueAfter(remaining)),
            None => Ok(Action::Done),
        }
    }

    fn triggers(&self, event: &WatchEvent) -> Vec<ObjectKey> {
        match &event.object {
            WatchObject::Run(run) => vec![run.key()],
            WatchObject::ExecutionUnit(unit) => unit
                .metadata
                .controller()
                .filter(|owner| owner.kind == ObjectKind::Run)
                .map(|owner| vec![ObjectKey::new(unit.metadata.namespace.clone(), owner.name.clone())])
                .unwrap_or_default(),
            WatchObject::Project(_) => Vec::new(),
        }
    }

    async fn keys(&self) -> Result<Vec<ObjectKey>> {
        let runs = self.store.runs().list(None).await?;
        Ok(runs.iter().map(|r| r.key()).collect())
    }
}
