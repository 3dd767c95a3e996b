//! Data Transfer Objects for the operator's HTTP surface
//!
//! Request bodies sent by users, webhooks and the execution runtime. Responses
//! are the domain objects themselves.

pub mod project;
pub mod run;
pub mod unit;
