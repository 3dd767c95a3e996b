//! Service layer
//!
//! Business logic of the operator. Reconcilers converge stored objects
//! toward their declarations; the materializer and the builder produce the
//! objects those reconcilers depend on.
//!
//! Every service talks to the store through the `Store` trait only.

pub mod builder;
pub mod materializer;
pub mod project;
pub mod run;

use dagctl_core::ObjectKey;
use thiserror::Error;

use crate::store::StoreError;

pub use builder::{BuildError, UnitBuilder};
pub use materializer::RunMaterializer;
pub use project::ProjectReconciler;
pub use run::RunReconciler;

/// Service error type
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A run references a project that does not exist
    #[error("project {0} not found")]
    ProjectNotFound(ObjectKey),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("invalid request: {0}")]
    Invalid(String),
}

impl ReconcileError {
    /// Stale writes are retried by re-running the reconcile, never reported
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Store(e) => e.is_conflict(),
            Self::Build(BuildError::Store(e)) => e.is_conflict(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
