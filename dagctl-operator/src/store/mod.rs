//! Store layer
//!
//! The storage/watch substrate the reconcilers run against: typed
//! repositories with optimistic concurrency, a separate status channel,
//! cascading deletes along ownership edges and a change stream.
//!
//! All repositories are trait-based so reconcilers never depend on a concrete
//! backend.

mod memory;

use async_trait::async_trait;
use dagctl_core::domain::project::Project;
use dagctl_core::domain::run::Run;
use dagctl_core::domain::unit::ExecutionUnit;
use dagctl_core::{ObjectKey, ObjectKind, Resource};
use thiserror::Error;
use tokio::sync::broadcast;

pub use memory::MemoryStore;

/// Store error type
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: ObjectKind, key: ObjectKey },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: ObjectKind, key: ObjectKey },

    /// The write carried a stale resource version
    #[error("{kind} {key} was modified concurrently")]
    Conflict { kind: ObjectKind, key: ObjectKey },

    #[error("invalid object: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Typed access to one kind of object
#[async_trait]
pub trait Repository<R: Resource>: Send + Sync {
    /// Fetches an object; a missing object is `Ok(None)`
    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<R>>;

    /// Lists objects, optionally restricted to one namespace
    async fn list(&self, namespace: Option<&str>) -> StoreResult<Vec<R>>;

    /// Creates an object, honouring `generate_name` when `name` is empty
    async fn create(&self, object: R) -> StoreResult<R>;

    /// Writes metadata and spec; the stored status is preserved
    async fn update(&self, object: R) -> StoreResult<R>;

    /// Writes status only; the stored spec and metadata are preserved
    async fn update_status(&self, object: R) -> StoreResult<R>;

    /// Deletes an object and, transitively, everything it owns
    ///
    /// Returns false when the object did not exist.
    async fn delete(&self, key: &ObjectKey) -> StoreResult<bool>;
}

/// Change notification delivered to watchers
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub object: WatchObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub enum WatchObject {
    Project(Project),
    Run(Run),
    ExecutionUnit(ExecutionUnit),
}

impl WatchObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            WatchObject::Project(_) => ObjectKind::Project,
            WatchObject::Run(_) => ObjectKind::Run,
            WatchObject::ExecutionUnit(_) => ObjectKind::ExecutionUnit,
        }
    }

    pub fn key(&self) -> ObjectKey {
        match self {
            WatchObject::Project(p) => p.key(),
            WatchObject::Run(r) => r.key(),
            WatchObject::ExecutionUnit(u) => u.key(),
        }
    }
}

/// The full substrate: one repository per kind plus a change stream
pub trait Store: Send + Sync + 'static {
    fn projects(&self) -> &dyn Repository<Project>;

    fn runs(&self) -> &dyn Repository<Run>;

    fn units(&self) -> &dyn Repository<ExecutionUnit>;

    /// Subscribes to all subsequent changes
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}
