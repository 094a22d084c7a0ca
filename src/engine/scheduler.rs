//! Wake-up scheduler for runs parked at delay nodes.
//!
//! Polls the run store for waiting runs whose `wake_at` has passed and hands
//! each one to the executor. On start it also picks up runs a previous process
//! left mid-flight.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::FlowExecutor;
use crate::error::{Error, Result};

/// Default poll interval (in milliseconds).
const POLL_INTERVAL_MS: u64 = 1000;

type InFlight = Arc<Mutex<HashSet<String>>>;

pub struct WakeupScheduler {
    executor: FlowExecutor,
    in_flight: InFlight,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    poll_interval_ms: u64,
}

impl WakeupScheduler {
    pub fn new(executor: FlowExecutor) -> Self {
        Self {
            executor,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            shutdown_tx: None,
            handle: None,
            poll_interval_ms: POLL_INTERVAL_MS,
        }
    }

    /// Set custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms.max(1);
        self
    }

    /// Resume everything due now and wait for those runs to settle.
    ///
    /// Returns how many runs were dispatched.
    pub async fn poll_once(&self) -> Result<usize> {
        let handles = dispatch_due(&self.executor, &self.in_flight).await?;
        let count = handles.len();
        for handle in handles {
            handle.await.map_err(|e| Error::Internal(e.to_string()))?;
        }
        Ok(count)
    }

    /// Resume runs that were `Running` or `PendingTrigger` when the last
    /// process stopped, and wait for them.
    pub async fn recover(&self) -> Result<usize> {
        let handles = dispatch_interrupted(&self.executor, &self.in_flight).await?;
        let count = handles.len();
        for handle in handles {
            handle.await.map_err(|e| Error::Internal(e.to_string()))?;
        }
        Ok(count)
    }

    /// Start the background poll task.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let executor = self.executor.clone();
        let in_flight = self.in_flight.clone();
        let poll_interval = self.poll_interval_ms;

        let handle = tokio::spawn(async move {
            match dispatch_interrupted(&executor, &in_flight).await {
                Ok(handles) if !handles.is_empty() => {
                    info!("Recovering {} interrupted runs", handles.len());
                }
                Ok(_) => {}
                Err(e) => error!("Error loading interrupted runs: {}", e),
            }

            let mut ticker = interval(Duration::from_millis(poll_interval));

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Wake-up scheduler received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = dispatch_due(&executor, &in_flight).await {
                            error!("Error polling due runs: {}", e);
                        }
                    }
                }
            }
        });

        self.handle = Some(handle);
        info!(
            "Wake-up scheduler started with {}ms poll interval",
            self.poll_interval_ms
        );
    }

    /// Stop the background poll task. Runs already dispatched keep going.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        if let Some(handle) = self.handle.take() {
            handle.await.map_err(|e| Error::Internal(e.to_string()))?;
        }

        info!("Wake-up scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Runs dispatched and not yet settled.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

async fn dispatch_due(executor: &FlowExecutor, in_flight: &InFlight) -> Result<Vec<JoinHandle<()>>> {
    let due = executor.due_runs(Utc::now()).await?;
    if !due.is_empty() {
        debug!(count = due.len(), "Found due runs");
    }
    Ok(dispatch(executor, in_flight, due.into_iter().map(|r| r.id)).await)
}

async fn dispatch_interrupted(
    executor: &FlowExecutor,
    in_flight: &InFlight,
) -> Result<Vec<JoinHandle<()>>> {
    let interrupted = executor.interrupted_runs().await?;
    Ok(dispatch(executor, in_flight, interrupted.into_iter().map(|r| r.id)).await)
}

/// Spawn one resume per run id not already being handled.
async fn dispatch(
    executor: &FlowExecutor,
    in_flight: &InFlight,
    run_ids: impl Iterator<Item = String>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for run_id in run_ids {
        if !in_flight.lock().await.insert(run_id.clone()) {
            continue;
        }

        let executor = executor.clone();
        let in_flight = in_flight.clone();
        handles.push(tokio::spawn(async move {
            match executor.resume(&run_id).await {
                Ok(run) => debug!(run_id = %run_id, status = %run.status, "Run resumed"),
                // Another worker got there first
                Err(Error::Conflict(_)) => {
                    debug!(run_id = %run_id, "Run already claimed elsewhere")
                }
                Err(e) => warn!(run_id = %run_id, "Failed to resume run: {}", e),
            }
            in_flight.lock().await.remove(&run_id);
        }));
    }
    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionRegistry;
    use crate::engine::TriggerEvent;
    use crate::flow::{NodeType, PlaybookConnection, PlaybookFlow, PlaybookNode};
    use crate::storage::{FlowRun, FlowStore, RunStatus, RunStore, SqliteStorage, StoredFlow};
    use chrono::Duration as ChronoDuration;
    use serde_json::{json, Map};

    fn delay_flow() -> PlaybookFlow {
        let mut flow = PlaybookFlow::new("flow-delay", "nurture");
        flow.nodes = vec![
            PlaybookNode::new("t", NodeType::Trigger, "Lead created"),
            PlaybookNode::new("d", NodeType::Delay, "Wait").with_config(json!({"seconds": 3600})),
            PlaybookNode::new("a", NodeType::Action, "Tag").with_config(json!({
                "action": "update_record", "fields": {"nurtured": true}
            })),
            PlaybookNode::new("e", NodeType::End, "Done"),
        ];
        flow.connections = vec![
            PlaybookConnection::new("c1", "t", "d"),
            PlaybookConnection::new("c2", "d", "a"),
            PlaybookConnection::new("c3", "a", "e"),
        ];
        flow
    }

    async fn setup() -> (FlowExecutor, SqliteStorage, PlaybookFlow) {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let flow = delay_flow();
        storage
            .save_flow(&StoredFlow::from_flow(&flow, true).unwrap())
            .await
            .unwrap();
        let executor = FlowExecutor::with_storage(ActionRegistry::new(), storage.clone());
        (executor, storage, flow)
    }

    #[tokio::test]
    async fn test_poll_resumes_due_runs_only() {
        let (executor, storage, flow) = setup().await;
        let event = TriggerEvent::new("lead.created", Map::new());
        let first = executor.fire(&flow, &event).await.unwrap().remove(0);
        let second = executor.fire(&flow, &event).await.unwrap().remove(0);

        let mut due = storage.get_run(&first.id).await.unwrap().unwrap();
        due.wake_at = Some(Utc::now() - ChronoDuration::seconds(5));
        storage.update_run(&mut due).await.unwrap();

        let scheduler = WakeupScheduler::new(executor);
        assert_eq!(scheduler.poll_once().await.unwrap(), 1);

        let first = storage.get_run(&first.id).await.unwrap().unwrap();
        assert_eq!(first.status, RunStatus::Completed);
        assert_eq!(first.context["nurtured"], true);

        let second = storage.get_run(&second.id).await.unwrap().unwrap();
        assert_eq!(second.status, RunStatus::Waiting);
        assert_eq!(scheduler.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_recover_interrupted_runs() {
        let (executor, storage, flow) = setup().await;
        let mut run = FlowRun::new(&flow, "t", Map::new());
        run.status = RunStatus::Running;
        run.current_node = Some("a".to_string());
        storage.create_run(&run).await.unwrap();

        let scheduler = WakeupScheduler::new(executor);
        assert_eq!(scheduler.recover().await.unwrap(), 1);

        let run = storage.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let (executor, _storage, _flow) = setup().await;
        let mut scheduler = WakeupScheduler::new(executor).with_poll_interval(10);
        assert!(!scheduler.is_running());

        scheduler.start();
        assert!(scheduler.is_running());
        tokio::time::sleep(Duration::from_millis(30)).await;

        scheduler.stop().await.unwrap();
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_background_loop_wakes_run() {
        let (executor, storage, flow) = setup().await;
        let event = TriggerEvent::new("lead.created", Map::new());
        let run = executor.fire(&flow, &event).await.unwrap().remove(0);

        let mut due = storage.get_run(&run.id).await.unwrap().unwrap();
        due.wake_at = Some(Utc::now() - ChronoDuration::seconds(1));
        storage.update_run(&mut due).await.unwrap();

        let mut scheduler = WakeupScheduler::new(executor).with_poll_interval(10);
        scheduler.start();

        let mut status = RunStatus::Waiting;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = storage.get_run(&run.id).await.unwrap().unwrap().status;
            if status.is_terminal() {
                break;
            }
        }
        scheduler.stop().await.unwrap();
        assert_eq!(status, RunStatus::Completed);
    }
}
