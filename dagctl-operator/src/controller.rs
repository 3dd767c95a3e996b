//! Reconcile loop
//!
//! Drives a `Reconciler` from the store's change stream. Keys are queued at
//! most once, and a key is never reconciled by two workers at the same time;
//! changes that arrive mid-reconcile mark the key dirty so it runs again
//! afterwards.
//!
//! Failed reconciles are retried with per-key exponential backoff, stale
//! writes are retried immediately, and every key is periodically resynced.

use async_trait::async_trait;
use dagctl_core::ObjectKey;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::service::ReconcileError;
use crate::store::{Store, WatchEvent};

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// What to do with a key after a successful reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Done,
    RequeueAfter(Duration),
}

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError>;

    /// Keys of this reconciler's kind affected by a change
    fn triggers(&self, event: &WatchEvent) -> Vec<ObjectKey>;

    /// Every key this reconciler is responsible for
    async fn keys(&self) -> Result<Vec<ObjectKey>, ReconcileError>;
}

#[derive(Default)]
struct QueueState {
    queued: HashSet<ObjectKey>,
    active: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    failures: HashMap<ObjectKey, u32>,
    /// Pending delayed re-adds; at most one per key
    delayed: HashMap<ObjectKey, Instant>,
}

/// Deduplicating work queue
struct WorkQueue {
    state: Mutex<QueueState>,
    tx: mpsc::UnboundedSender<ObjectKey>,
}

impl WorkQueue {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ObjectKey>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            tx,
        });
        (queue, rx)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, key: ObjectKey) {
        let mut state = self.lock();
        if state.active.contains(&key) {
            state.dirty.insert(key);
        } else if state.queued.insert(key.clone()) {
            // The receiver lives as long as the controller loop.
            let _ = self.tx.send(key);
        }
    }

    /// Re-adds `key` after `delay` unless an earlier re-add is pending
    fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let deadline = Instant::now() + delay;
        {
            let mut state = self.lock();
            match state.delayed.get(&key) {
                Some(pending) if *pending <= deadline => return,
                _ => {
                    state.delayed.insert(key.clone(), deadline);
                }
            }
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let due = {
                let mut state = queue.lock();
                // Superseded by an earlier deadline.
                if state.delayed.get(&key) == Some(&deadline) {
                    state.delayed.remove(&key);
                    true
                } else {
                    false
                }
            };
            if due {
                queue.add(key);
            }
        });
    }

    fn begin(&self, key: &ObjectKey) {
        let mut state = self.lock();
        state.queued.remove(key);
        state.active.insert(key.clone());
    }

    /// Marks `key` idle; re-queues it when it changed while active
    fn finish(&self, key: &ObjectKey) {
        let rerun = {
            let mut state = self.lock();
            state.active.remove(key);
            state.dirty.remove(key)
        };
        if rerun {
            self.add(key.clone());
        }
    }

    fn forget(&self, key: &ObjectKey) {
        self.lock().failures.remove(key);
    }

    /// Records a failure and returns the delay before the next attempt
    fn backoff(&self, key: &ObjectKey) -> Duration {
        let mut state = self.lock();
        let failures = state.failures.entry(key.clone()).or_insert(0);
        *failures = failures.saturating_add(1);
        backoff_delay(*failures)
    }

    fn len(&self) -> usize {
        self.lock().queued.len()
    }
}

/// 1s doubling per consecutive failure, capped at five minutes
fn backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    BASE_BACKOFF
        .saturating_mul(1u32 << exponent)
        .min(MAX_BACKOFF)
}

pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    store: Arc<dyn Store>,
    resync_interval: Duration,
    semaphore: Arc<Semaphore>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(
        reconciler: Arc<R>,
        store: Arc<dyn Store>,
        resync_interval: Duration,
        max_concurrent: usize,
    ) -> Self {
        Self {
            reconciler,
            store,
            resync_interval,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Runs until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let name = self.reconciler.name();
        let (queue, mut rx) = WorkQueue::new();
        let mut events = self.store.watch();
        let mut resync = tokio::time::interval(self.resync_interval);

        info!("Starting {} controller (resync every {:?})", name, self.resync_interval);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = resync.tick() => {
                    self.resync(&queue).await;
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        for key in self.reconciler.triggers(&event) {
                            queue.add(key);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("{} controller missed {} change(s), resyncing", name, missed);
                        self.resync(&queue).await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Change stream closed, stopping {} controller", name);
                        break;
                    }
                },
                Some(key) = rx.recv() => {
                    let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
                        break;
                    };
                    queue.begin(&key);
                    let reconciler = Arc::clone(&self.reconciler);
                    let queue = Arc::clone(&queue);
                    tokio::spawn(async move {
                        process(reconciler.as_ref(), &queue, key).await;
                        drop(permit);
                    });
                }
            }
        }

        info!("{} controller stopped", name);
    }

    async fn resync(&self, queue: &Arc<WorkQueue>) {
        match self.reconciler.keys().await {
            Ok(keys) => {
                debug!(
                    "Resyncing {} {} key(s), {} already queued",
                    keys.len(),
                    self.reconciler.name(),
                    queue.len()
                );
                for key in keys {
                    queue.add(key);
                }
            }
            Err(e) => error!("Failed to list {} keys for resync: {}", self.reconciler.name(), e),
        }
    }
}

async fn process<R: Reconciler>(reconciler: &R, queue: &Arc<WorkQueue>, key: ObjectKey) {
    let name = reconciler.name();
    let result = reconciler.reconcile(&key).await;
    queue.finish(&key);

    match result {
        Ok(Action::Done) => queue.forget(&key),
        Ok(Action::RequeueAfter(delay)) => {
            queue.forget(&key);
            queue.add_after(key, delay);
        }
        Err(e) if e.is_conflict() => {
            debug!("Conflict reconciling {} {}, retrying: {}", name, key, e);
            queue.add(key);
        }
        Err(e) => {
            let delay = queue.backoff(&key);
            error!("Failed to reconcile {} {} (retry in {:?}): {}", name, key, delay, e);
            queue.add_after(key, delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnitDefaults;
    use crate::scheduler::CronTable;
    use crate::service::{ProjectReconciler, RunMaterializer, RunReconciler, UnitBuilder};
    use crate::store::{MemoryStore, StoreError};
    use dagctl_core::{ObjectKind, ObjectMeta, Resource};
    use dagctl_core::domain::project::{Project, ProjectSpec};
    use dagctl_core::domain::run::{RunPhase, RunType};
    use dagctl_core::domain::unit::UnitStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_backoff_delay() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(5), Duration::from_secs(16));
        assert_eq!(backoff_delay(20), MAX_BACKOFF);
        assert_eq!(backoff_delay(u32::MAX), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_queue_deduplicates() {
        let (queue, mut rx) = WorkQueue::new();
        let key = ObjectKey::new("analytics", "core");

        queue.add(key.clone());
        queue.add(key.clone());
        assert_eq!(rx.recv().await, Some(key.clone()));
        assert!(rx.try_recv().is_err());

        queue.begin(&key);
        queue.add(key.clone());
        assert!(rx.try_recv().is_err());

        queue.finish(&key);
        assert_eq!(rx.recv().await, Some(key));
    }

    #[tokio::test]
    async fn test_delayed_requeues_merge() {
        let (queue, mut rx) = WorkQueue::new();
        let key = ObjectKey::new("analytics", "core");

        queue.add_after(key.clone(), Duration::from_millis(50));
        queue.add_after(key.clone(), Duration::from_millis(80));
        queue.add_after(key.clone(), Duration::from_millis(60));
        assert_eq!(queue.lock().delayed.len(), 1);

        let delivered = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert_eq!(delivered.unwrap(), Some(key.clone()));
        queue.begin(&key);
        queue.finish(&key);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
        assert!(queue.lock().delayed.is_empty());
    }

    #[tokio::test]
    async fn test_earlier_deadline_replaces_pending_requeue() {
        let (queue, mut rx) = WorkQueue::new();
        let key = ObjectKey::new("analytics", "core");

        queue.add_after(key.clone(), Duration::from_millis(400));
        queue.add_after(key.clone(), Duration::from_millis(20));

        let delivered = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert_eq!(delivered.unwrap(), Some(key.clone()));
        queue.begin(&key);
        queue.finish(&key);

        // The superseded timer fires without re-adding the key.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
    }

    /// Fails with `error` on the first call, then succeeds
    struct FlakyReconciler {
        calls: AtomicUsize,
        error: fn(&ObjectKey) -> ReconcileError,
    }

    #[async_trait]
    impl Reconciler for FlakyReconciler {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err((self.error)(key));
            }
            Ok(Action::Done)
        }

        fn triggers(&self, _event: &WatchEvent) -> Vec<ObjectKey> {
            Vec::new()
        }

        async fn keys(&self) -> Result<Vec<ObjectKey>, ReconcileError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_conflict_retries_immediately_without_backoff() {
        let (queue, mut rx) = WorkQueue::new();
        let key = ObjectKey::new("analytics", "core");
        let reconciler = FlakyReconciler {
            calls: AtomicUsize::new(0),
            error: |key| {
                ReconcileError::Store(StoreError::Conflict {
                    kind: ObjectKind::Project,
                    key: key.clone(),
                })
            },
        };

        queue.begin(&key);
        process(&reconciler, &queue, key.clone()).await;
        assert_eq!(rx.try_recv().ok(), Some(key.clone()));
        assert!(queue.lock().failures.is_empty());
        assert!(queue.lock().delayed.is_empty());

        queue.begin(&key);
        process(&reconciler, &queue, key.clone()).await;
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 2);
        assert!(rx.try_recv().is_err());
        assert!(queue.lock().failures.is_empty());
    }

    #[tokio::test]
    async fn test_failure_backs_off() {
        let (queue, mut rx) = WorkQueue::new();
        let key = ObjectKey::new("analytics", "core");
        let reconciler = FlakyReconciler {
            calls: AtomicUsize::new(0),
            error: |key| ReconcileError::ProjectNotFound(key.clone()),
        };

        queue.begin(&key);
        process(&reconciler, &queue, key.clone()).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.lock().failures.get(&key), Some(&1));
        assert_eq!(queue.lock().delayed.len(), 1);

        let retried = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await;
        assert_eq!(retried.unwrap(), Some(key.clone()));
        queue.begin(&key);
        process(&reconciler, &queue, key.clone()).await;
        assert!(queue.lock().failures.is_empty());
    }

    struct CountingReconciler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Reconciler for CountingReconciler {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn reconcile(&self, _key: &ObjectKey) -> Result<Action, ReconcileError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Action::Done)
        }

        fn triggers(&self, event: &WatchEvent) -> Vec<ObjectKey> {
            vec![event.object.key()]
        }

        async fn keys(&self) -> Result<Vec<ObjectKey>, ReconcileError> {
            Ok(vec![ObjectKey::new("analytics", "core")])
        }
    }

    async fn eventually(mut check: impl AsyncFnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while tokio::time::Instant::now() < deadline {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_controller_resyncs_and_stops() {
        let store = MemoryStore::new();
        let reconciler = Arc::new(CountingReconciler {
            calls: AtomicUsize::new(0),
        });
        let controller = Controller::new(reconciler.clone(), store, Duration::from_secs(300), 2);
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(controller.run(shutdown));

        assert!(eventually(async || reconciler.calls.load(Ordering::SeqCst) >= 1).await);

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_scheduled_run_end_to_end() {
        let store = MemoryStore::new();
        let cron = CronTable::new();
        let materializer = Arc::new(RunMaterializer::new(store.clone()));
        let projects = Arc::new(ProjectReconciler::new(
            store.clone(),
            cron.clone(),
            materializer,
            Duration::from_secs(60),
        ));
        let runs = Arc::new(RunReconciler::new(
            store.clone(),
            UnitBuilder::new(UnitDefaults::default()),
            Duration::from_secs(10),
        ));

        let (stop, shutdown) = watch::channel(false);
        let resync = Duration::from_secs(300);
        tokio::spawn(Controller::new(projects, store.clone(), resync, 2).run(shutdown.clone()));
        tokio::spawn(Controller::new(runs, store.clone(), resync, 2).run(shutdown));

        let project = store
            .projects()
            .create(Project::new(
                ObjectMeta::named("analytics", "core"),
                ProjectSpec {
                    schedule: "* * * * * *".to_string(),
                    commands: vec!["build".to_string()],
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        // A tick creates a run, and the run controller launches its unit.
        assert!(
            eventually(async || !store.units().list(None).await.unwrap().is_empty()).await
        );

        // Stop further ticks before reporting the outcome.
        let mut suspended = store.projects().get(&project.key()).await.unwrap().unwrap();
        suspended.spec.suspend = true;
        store.projects().update(suspended).await.unwrap();
        assert!(eventually(async || !cron.contains(&project.key())).await);

        let mut unit = store.units().list(None).await.unwrap().remove(0);
        assert_eq!(unit.spec.steps[0].command, vec!["dbt", "build"]);
        let owner = unit.metadata.controller().unwrap().name.clone();
        unit.status = UnitStatus {
            succeeded: 1,
            ..Default::default()
        };
        store.units().update_status(unit).await.unwrap();

        let run_key = ObjectKey::new("analytics", owner);
        assert!(
            eventually(async || {
                store
                    .runs()
                    .get(&run_key)
                    .await
                    .unwrap()
                    .is_some_and(|r| r.status.phase == Some(RunPhase::Succeeded))
            })
            .await
        );

        let run = store.runs().get(&run_key).await.unwrap().unwrap();
        assert_eq!(run.spec.run_type, RunType::Scheduled);
        assert!(
            eventually(async || {
                store
                    .projects()
                    .get(&project.key())
                    .await
                    .unwrap()
                    .is_some_and(|p| p.status.last_successful_time.is_some())
            })
            .await
        );

        stop.send(true).unwrap();
        cron.shutdown();
    }
}
