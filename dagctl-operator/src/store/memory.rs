//! In-memory store
//!
//! Holds every object behind one mutex so cascading deletes and the owner
//! index stay consistent with the object tables. Change events are published
//! after the lock is released.

use async_trait::async_trait;
use chrono::Utc;
use dagctl_core::domain::project::Project;
use dagctl_core::domain::run::Run;
use dagctl_core::domain::unit::ExecutionUnit;
use dagctl_core::{ObjectKey, ObjectKind, Resource};
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{Repository, Store, StoreError, StoreResult, WatchAction, WatchEvent, WatchObject};

const EVENT_BUFFER: usize = 1024;
const GENERATED_SUFFIX_LEN: usize = 5;

/// Store backed by process memory
pub struct MemoryStore {
    projects: Collection<Project>,
    runs: Collection<Run>,
    units: Collection<ExecutionUnit>,
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            events,
        });

        Arc::new(Self {
            projects: Collection::new(shared.clone()),
            runs: Collection::new(shared.clone()),
            units: Collection::new(shared.clone()),
            shared,
        })
    }

    /// Number of dependents recorded for an owner UID
    pub fn dependent_count(&self, owner_uid: &str) -> usize {
        self.shared
            .lock()
            .dependents
            .get(owner_uid)
            .map_or(0, HashSet::len)
    }
}

impl Store for MemoryStore {
    fn projects(&self) -> &dyn Repository<Project> {
        &self.projects
    }

    fn runs(&self) -> &dyn Repository<Run> {
        &self.runs
    }

    fn units(&self) -> &dyn Repository<ExecutionUnit> {
        &self.units
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.shared.events.subscribe()
    }
}

struct Shared {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, events: Vec<WatchEvent>) {
        for event in events {
            // No subscribers is fine; nothing is watching yet.
            let _ = self.events.send(event);
        }
    }
}

#[derive(Default)]
struct State {
    projects: HashMap<ObjectKey, Project>,
    runs: HashMap<ObjectKey, Run>,
    units: HashMap<ObjectKey, ExecutionUnit>,
    /// Owner UID -> objects holding an owner edge to it
    dependents: HashMap<String, HashSet<(ObjectKind, ObjectKey)>>,
    revision: u64,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn index_owners<R: Resource>(&mut self, object: &R) {
        for owner in &object.meta().owner_references {
            self.dependents
                .entry(owner.uid.clone())
                .or_default()
                .insert((R::KIND, object.key()));
        }
    }

    fn unindex_owners<R: Resource>(&mut self, object: &R) {
        for owner in &object.meta().owner_references {
            if let Some(set) = self.dependents.get_mut(&owner.uid) {
                set.remove(&(R::KIND, object.key()));
                if set.is_empty() {
                    self.dependents.remove(&owner.uid);
                }
            }
        }
    }

    fn remove_one<R: Stored>(&mut self, key: &ObjectKey) -> Option<(String, WatchObject)> {
        let object = R::table(self).remove(key)?;
        self.unindex_owners(&object);
        let uid = object.meta().uid.clone();
        Some((uid, object.into_watch()))
    }

    /// Removes `root` and everything reachable through the owner index
    fn cascade_delete(&mut self, root: (ObjectKind, ObjectKey)) -> Vec<WatchEvent> {
        let mut events = Vec::new();
        let mut pending = vec![root];

        while let Some((kind, key)) = pending.pop() {
            let removed = match kind {
                ObjectKind::Project => self.remove_one::<Project>(&key),
                ObjectKind::Run => self.remove_one::<Run>(&key),
                ObjectKind::ExecutionUnit => self.remove_one::<ExecutionUnit>(&key),
            };

            let Some((uid, object)) = removed else {
                continue;
            };

            if let Some(children) = self.dependents.remove(&uid) {
                pending.extend(children);
            }

            events.push(WatchEvent {
                action: WatchAction::Deleted,
                object,
            });
        }

        events
    }
}

/// Per-kind glue between the generic repository and the shared state
trait Stored: Resource + PartialEq {
    fn table(state: &mut State) -> &mut HashMap<ObjectKey, Self>;

    fn into_watch(self) -> WatchObject;
}

impl Stored for Project {
    fn table(state: &mut State) -> &mut HashMap<ObjectKey, Self> {
        &mut state.projects
    }

    fn into_watch(self) -> WatchObject {
        WatchObject::Project(self)
    }
}

impl Stored for Run {
    fn table(state: &mut State) -> &mut HashMap<ObjectKey, Self> {
        &mut state.runs
    }

    fn into_watch(self) -> WatchObject {
        WatchObject::Run(self)
    }
}

impl Stored for ExecutionUnit {
    fn table(state: &mut State) -> &mut HashMap<ObjectKey, Self> {
        &mut state.units
    }

    fn into_watch(self) -> WatchObject {
        WatchObject::ExecutionUnit(self)
    }
}

struct Collection<R> {
    shared: Arc<Shared>,
    _kind: PhantomData<fn() -> R>,
}

impl<R> Collection<R> {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            _kind: PhantomData,
        }
    }
}

fn generated_name(prefix: &str) -> String {
    let suffix: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(GENERATED_SUFFIX_LEN)
        .collect();
    format!("{}{}", prefix, suffix)
}

#[async_trait]
impl<R: Stored> Repository<R> for Collection<R> {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<R>> {
        let mut state = self.shared.lock();
        Ok(R::table(&mut state).get(key).cloned())
    }

    async fn list(&self, namespace: Option<&str>) -> StoreResult<Vec<R>> {
        let mut state = self.shared.lock();
        let mut objects: Vec<R> = R::table(&mut state)
            .values()
            .filter(|o| namespace.is_none_or(|ns| o.meta().namespace == ns))
            .cloned()
            .collect();
        objects.sort_by_key(|o| o.key());
        Ok(objects)
    }

    async fn create(&self, mut object: R) -> StoreResult<R> {
        let created = {
            let mut state = self.shared.lock();

            let meta = object.meta_mut();
            if meta.namespace.is_empty() {
                return Err(StoreError::Invalid("namespace is required".to_string()));
            }
            if meta.name.is_empty() {
                if meta.generate_name.is_empty() {
                    return Err(StoreError::Invalid(
                        "either name or generateName is required".to_string(),
                    ));
                }
                let mut name = generated_name(&meta.generate_name);
                let mut key = ObjectKey::new(meta.namespace.clone(), name.clone());
                while R::table(&mut state).contains_key(&key) {
                    name = generated_name(&meta.generate_name);
                    key = ObjectKey::new(meta.namespace.clone(), name.clone());
                }
                object.meta_mut().name = name;
            }

            let key = object.key();
            if R::table(&mut state).contains_key(&key) {
                return Err(StoreError::AlreadyExists { kind: R::KIND, key });
            }

            let revision = state.next_revision();
            let meta = object.meta_mut();
            meta.uid = Uuid::new_v4().to_string();
            meta.resource_version = revision;
            meta.generation = 1;
            meta.creation_timestamp = Some(Utc::now());

            state.index_owners(&object);
            R::table(&mut state).insert(key, object.clone());
            object
        };

        self.shared.publish(vec![WatchEvent {
            action: WatchAction::Added,
            object: created.clone().into_watch(),
        }]);
        Ok(created)
    }

    async fn update(&self, object: R) -> StoreResult<R> {
        let updated = {
            let mut state = self.shared.lock();
            let key = object.key();
            let stored = R::table(&mut state)
                .get(&key)
                .cloned()
                .ok_or_else(|| StoreError::NotFound { kind: R::KIND, key: key.clone() })?;

            if stored.meta().resource_version != object.meta().resource_version {
                return Err(StoreError::Conflict { kind: R::KIND, key });
            }

            let mut next = object;
            {
                let (meta, prior) = (next.meta_mut(), stored.meta());
                meta.uid = prior.uid.clone();
                meta.creation_timestamp = prior.creation_timestamp;
                meta.generation = prior.generation;
            }
            if !next.same_spec(&stored) {
                next.meta_mut().generation += 1;
            }
            next.adopt_status(stored.clone());

            if next == stored {
                return Ok(stored);
            }

            next.meta_mut().resource_version = state.next_revision();
            state.unindex_owners(&stored);
            state.index_owners(&next);
            R::table(&mut state).insert(key, next.clone());
            next
        };

        self.shared.publish(vec![WatchEvent {
            action: WatchAction::Modified,
            object: updated.clone().into_watch(),
        }]);
        Ok(updated)
    }

    async fn update_status(&self, object: R) -> StoreResult<R> {
        let updated = {
            let mut state = self.shared.lock();
            let key = object.key();
            let stored = R::table(&mut state)
                .get(&key)
                .cloned()
                .ok_or_else(|| StoreError::NotFound { kind: R::KIND, key: key.clone() })?;

            if stored.meta().resource_version != object.meta().resource_version {
                return Err(StoreError::Conflict { kind: R::KIND, key });
            }

            let mut next = stored.clone();
            next.adopt_status(object);
            if next == stored {
                return Ok(stored);
            }

            next.meta_mut().resource_version = state.next_revision();
            R::table(&mut state).insert(key, next.clone());
            next
        };

        self.shared.publish(vec![WatchEvent {
            action: WatchAction::Modified,
            object: updated.clone().into_watch(),
        }]);
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<bool> {
        let events = {
            let mut state = self.shared.lock();
            if !R::table(&mut state).contains_key(key) {
                return Ok(false);
            }
            state.cascade_delete((R::KIND, key.clone()))
        };

        self.shared.publish(events);
        Ok(true)
    }
}
