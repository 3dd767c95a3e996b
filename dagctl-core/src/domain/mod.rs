//! Core domain types
//!
//! This module contains the declarative objects reconciled by the operator.
//! Projects and Runs are user-facing; execution units are produced by the
//! operator and observed back from the runtime that executes them.

pub mod project;
pub mod run;
pub mod unit;
pub mod workload;
