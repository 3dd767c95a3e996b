//! dbt project operator
//!
//! Reconciles declared dbt projects into scheduled runs and each run into a
//! single execution unit, over a storage/watch substrate.

pub mod api;
pub mod config;
pub mod controller;
pub mod scheduler;
pub mod service;
pub mod store;
