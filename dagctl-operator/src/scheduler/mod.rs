//! Scheduler layer for the operator
//!
//! This layer owns the timers that turn a project's cron expression into
//! periodic ticks. It knows nothing about runs; whatever should happen on a
//! tick is supplied as a `TickHandler`.

pub mod cron_table;

pub use cron_table::{CronTable, ScheduleError, TickHandler};
