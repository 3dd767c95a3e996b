//! Cron scheduling table
//!
//! Maps a project identity to its single live timer. Entries are keyed by
//! identity, never by expression, so installing a new expression for a
//! project supersedes the old timer.
//!
//! The table is touched by reconcilers and read by nothing else; timer tasks
//! only hold the handler and their own key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use dagctl_core::ObjectKey;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Scheduling errors
#[derive(Debug, Clone, Error)]
pub enum ScheduleError {
    #[error("invalid schedule '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },
}

/// Receives the ticks of an installed timer
///
/// Each tick runs on its own task, so a slow handler never delays the next
/// tick and two ticks for the same key may overlap.
#[async_trait]
pub trait TickHandler: Send + Sync + 'static {
    async fn on_tick(&self, key: ObjectKey);
}

struct TimerEntry {
    id: Uuid,
    expression: String,
    handle: JoinHandle<()>,
}

/// Process-wide table of live timers, one per project
#[derive(Default)]
pub struct CronTable {
    entries: Mutex<HashMap<ObjectKey, TimerEntry>>,
}

/// Parses a six-field (seconds first) cron expression
pub fn parse_schedule(expression: &str) -> Result<Schedule, ScheduleError> {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() != 6 {
        return Err(ScheduleError::InvalidExpression {
            expression: expression.to_string(),
            reason: "expected six fields: sec min hour day-of-month month day-of-week".to_string(),
        });
    }

    Schedule::from_str(trimmed).map_err(|e| ScheduleError::InvalidExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

impl CronTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ObjectKey, TimerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the timer for `key` with one firing on `expression`
    ///
    /// Any previous entry is removed first. On a parse failure nothing is
    /// installed, so the key ends up without a timer.
    pub fn install(
        &self,
        key: &ObjectKey,
        expression: &str,
        handler: Arc<dyn TickHandler>,
    ) -> Result<Uuid, ScheduleError> {
        let mut entries = self.lock();

        if let Some(previous) = entries.remove(key) {
            previous.handle.abort();
            debug!("Removed timer {} for {}", previous.id, key);
        }

        let schedule = parse_schedule(expression)?;
        let id = Uuid::new_v4();
        let handle = tokio::spawn(run_timer(key.clone(), schedule, handler));

        entries.insert(
            key.clone(),
            TimerEntry {
                id,
                expression: expression.to_string(),
                handle,
            },
        );

        info!("Installed timer {} for {} on '{}'", id, key, expression);
        Ok(id)
    }

    /// Removes the timer for `key`; a no-op when there is none
    pub fn remove(&self, key: &ObjectKey) -> bool {
        match self.lock().remove(key) {
            Some(entry) => {
                entry.handle.abort();
                info!("Removed timer {} for {}", entry.id, key);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn entry_id(&self, key: &ObjectKey) -> Option<Uuid> {
        self.lock().get(key).map(|e| e.id)
    }

    pub fn expression(&self, key: &ObjectKey) -> Option<String> {
        self.lock().get(key).map(|e| e.expression.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Aborts every timer; used when the control loop stops
    pub fn shutdown(&self) {
        let mut entries = self.lock();
        let count = entries.len();
        for (_, entry) in entries.drain() {
            entry.handle.abort();
        }
        if count > 0 {
            info!("Cron table shut down, {} timer(s) stopped", count);
        }
    }
}

impl Drop for CronTable {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_timer(key: ObjectKey, schedule: Schedule, handler: Arc<dyn TickHandler>) {
    let mut last_fire: Option<DateTime<Utc>> = None;

    loop {
        // The wall clock and tokio's monotonic clock can disagree slightly, so
        // never look for the next fire before the one just delivered.
        let now = Utc::now();
        let after = last_fire.map_or(now, |last| last.max(now));

        let Some(next) = schedule.after(&after).next() else {
            warn!("Schedule for {} has no upcoming fire times", key);
            return;
        };

        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;
        last_fire = Some(next);

        debug!("Timer for {} fired at {}", key, next);
        let handler = Arc::clone(&handler);
        let tick_key = key.clone();
        tokio::spawn(async move {
            handler.on_tick(tick_key).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingHandler {
        ticks: AtomicUsize,
    }

    #[async_trait]
    impl TickHandler for CountingHandler {
        async fn on_tick(&self, _key: ObjectKey) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn key() -> ObjectKey {
        ObjectKey::new("analytics", "core")
    }

    #[test]
    fn test_parse_schedule() {
        assert!(parse_schedule("0 */5 * * * *").is_ok());
        assert!(parse_schedule(" 0 0 12 * * Mon-Fri ").is_ok());
        assert!(parse_schedule("*/5 * * * *").is_err());
        assert!(parse_schedule("not a schedule").is_err());
        assert!(parse_schedule("61 * * * * *").is_err());
    }

    #[tokio::test]
    async fn test_install_twice_keeps_one_entry() {
        let table = CronTable::new();
        let handler = Arc::new(CountingHandler::default());

        let first = table.install(&key(), "0 */5 * * * *", handler.clone()).unwrap();
        let second = table.install(&key(), "0 */5 * * * *", handler).unwrap();

        assert_eq!(table.len(), 1);
        assert_ne!(first, second);
        assert_eq!(table.entry_id(&key()), Some(second));
    }

    #[tokio::test]
    async fn test_new_expression_supersedes_old() {
        let table = CronTable::new();
        let handler = Arc::new(CountingHandler::default());

        table.install(&key(), "0 */5 * * * *", handler.clone()).unwrap();
        table.install(&key(), "0 0 * * * *", handler).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.expression(&key()).as_deref(), Some("0 0 * * * *"));
    }

    #[tokio::test]
    async fn test_failed_install_leaves_no_entry() {
        let table = CronTable::new();
        let handler = Arc::new(CountingHandler::default());

        table.install(&key(), "0 */5 * * * *", handler.clone()).unwrap();
        let err = table.install(&key(), "every five minutes", handler).unwrap_err();

        assert!(matches!(err, ScheduleError::InvalidExpression { .. }));
        assert!(!table.contains(&key()));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let table = CronTable::new();
        let handler = Arc::new(CountingHandler::default());

        table.install(&key(), "0 */5 * * * *", handler).unwrap();
        assert!(table.remove(&key()));
        assert!(!table.remove(&key()));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_timer_delivers_ticks() {
        let table = CronTable::new();
        let handler = Arc::new(CountingHandler::default());

        table.install(&key(), "* * * * * *", handler.clone()).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while handler.ticks.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(handler.ticks.load(Ordering::SeqCst) >= 1);

        table.shutdown();
        assert!(table.is_empty());
    }
}
