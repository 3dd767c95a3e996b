//! Dagctl Core
//!
//! Core types and abstractions for the dagctl dbt operator.
//!
//! This crate contains:
//! - Object metadata: identity, ownership edges and conditions shared by every kind
//! - Domain types: Project, Run and ExecutionUnit declarations with their status
//! - DTOs: Request bodies for the operator's HTTP surface

pub mod domain;
pub mod dto;
pub mod meta;

pub use meta::{ObjectKey, ObjectKind, ObjectMeta, Resource};
