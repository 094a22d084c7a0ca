//! Background SLA sweep.
//!
//! Periodically loads open tasks whose deadline has passed, flags them as
//! overdue and writes them back.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info};

use super::mark_overdue;
use crate::error::{Error, Result};
use crate::storage::TaskStore;

/// Default sweep interval (in milliseconds).
const SWEEP_INTERVAL_MS: u64 = 60_000;

pub struct SlaMonitor {
    store: Arc<dyn TaskStore>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    sweep_interval_ms: u64,
}

impl SlaMonitor {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            shutdown_tx: None,
            handle: None,
            sweep_interval_ms: SWEEP_INTERVAL_MS,
        }
    }

    /// Set custom sweep interval.
    pub fn with_sweep_interval(mut self, ms: u64) -> Self {
        self.sweep_interval_ms = ms.max(1);
        self
    }

    /// Flag everything overdue at `now`. Returns the ids that changed.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        sweep(self.store.as_ref(), now).await
    }

    /// Start the background sweep task.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let store = self.store.clone();
        let sweep_interval = self.sweep_interval_ms;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(sweep_interval));

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("SLA monitor received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = sweep(store.as_ref(), Utc::now()).await {
                            error!("Error sweeping task SLAs: {}", e);
                        }
                    }
                }
            }
        });

        self.handle = Some(handle);
        info!(
            "SLA monitor started with {}ms sweep interval",
            self.sweep_interval_ms
        );
    }

    /// Stop the background sweep task.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        if let Some(handle) = self.handle.take() {
            handle.await.map_err(|e| Error::Internal(e.to_string()))?;
        }

        info!("SLA monitor stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

async fn sweep(store: &dyn TaskStore, now: DateTime<Utc>) -> Result<Vec<String>> {
    let mut candidates = store.overdue_candidates(now).await?;
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let changed = mark_overdue(&mut candidates, now);
    for task in candidates.iter().filter(|t| changed.contains(&t.id)) {
        store.save_task(task).await?;
        crate::metrics::record_task_overdue();
    }

    if !changed.is_empty() {
        debug!(count = changed.len(), "Marked tasks overdue");
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use crate::tasks::{Task, TaskStatus};
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn test_sweep_marks_overdue() {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let late = Task::new("Call back").with_sla_hours(1.0).unwrap();
        let fresh = Task::new("Send quote").with_sla_hours(24.0).unwrap();
        storage.save_task(&late).await.unwrap();
        storage.save_task(&fresh).await.unwrap();

        let monitor = SlaMonitor::new(storage.clone());
        let later = Utc::now() + ChronoDuration::hours(2);
        let changed = monitor.sweep_once(later).await.unwrap();
        assert_eq!(changed, vec![late.id.clone()]);

        let stored = storage.get_task(&late.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Overdue);
        let stored = storage.get_task(&fresh.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);

        // Second sweep finds nothing new
        assert!(monitor.sweep_once(later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let mut monitor = SlaMonitor::new(storage).with_sweep_interval(10);
        assert!(!monitor.is_running());

        monitor.start();
        assert!(monitor.is_running());
        tokio::time::sleep(Duration::from_millis(30)).await;

        monitor.stop().await.unwrap();
        assert!(!monitor.is_running());
    }
}
