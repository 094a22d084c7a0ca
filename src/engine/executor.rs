//! Flow executor.
//!
//! Drives a run node by node and checkpoints it after every node. Delay nodes
//! park the run as `Waiting`; the wake-up scheduler calls [`FlowExecutor::resume`]
//! once the delay is due.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

use super::CancellationRegistry;
use crate::actions::{apply_output, ActionContext, ActionOutput, ActionRegistry};
use crate::conditions::{ConditionEvaluator, ConditionGroup, Context, Guard};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::fields::FieldRegistry;
use crate::flow::{validate, FailureStrategy, NodeType, PlaybookConnection, PlaybookFlow, PlaybookNode};
use crate::metrics;
use crate::shutdown::ShutdownCoordinator;
use crate::storage::{
    FlowRun, FlowStore, RunStatus, RunStep, RunStore, SqliteStorage, StepStatus,
};

/// An incoming event that may start runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub name: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl TriggerEvent {
    pub fn new(name: &str, payload: Map<String, Value>) -> Self {
        Self {
            name: name.to_string(),
            payload,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TriggerConfig {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    conditions: Option<ConditionGroup>,
}

/// Where the driver goes after a node.
enum Transition {
    Next(String),
    Retry,
    Suspend(DateTime<Utc>),
    Finish(RunStatus),
}

impl Transition {
    fn follow(next: Option<&PlaybookConnection>) -> Self {
        match next {
            Some(conn) => Transition::Next(conn.target.clone()),
            None => Transition::Finish(RunStatus::Completed),
        }
    }
}

struct NodeOutcome {
    transition: Transition,
    status: StepStatus,
    output: Option<Value>,
    attempts: u32,
    error: Option<String>,
}

impl NodeOutcome {
    fn completed(transition: Transition, output: Option<Value>) -> Self {
        Self {
            transition,
            status: StepStatus::Completed,
            output,
            attempts: 1,
            error: None,
        }
    }
}

/// Result of edge selection out of a branching node.
pub struct EdgeChoice<'f> {
    pub connection: Option<&'f PlaybookConnection>,
    /// The node's own condition result, if it has a conditions group
    pub branch: Option<bool>,
}

/// Active (non-suspended) time of a run while it is being driven. Kept for
/// reporting only; the run timeout is measured from `started_at`.
struct ActiveClock {
    base_ms: u64,
    since: Instant,
}

impl ActiveClock {
    fn start(base_ms: u64) -> Self {
        Self {
            base_ms,
            since: Instant::now(),
        }
    }

    fn total_ms(&self) -> u64 {
        self.base_ms
            .saturating_add(self.since.elapsed().as_millis() as u64)
    }
}

/// Executes playbook runs.
#[derive(Clone)]
pub struct FlowExecutor {
    evaluator: ConditionEvaluator,
    actions: Arc<ActionRegistry>,
    flows: Arc<dyn FlowStore>,
    runs: Arc<dyn RunStore>,
    cancellations: CancellationRegistry,
    settings: EngineConfig,
    shutdown: Option<ShutdownCoordinator>,
}

impl FlowExecutor {
    pub fn new(actions: ActionRegistry, flows: Arc<dyn FlowStore>, runs: Arc<dyn RunStore>) -> Self {
        Self {
            evaluator: ConditionEvaluator::new(Arc::new(FieldRegistry::builtin())),
            actions: Arc::new(actions),
            flows,
            runs,
            cancellations: CancellationRegistry::new(),
            settings: EngineConfig::default(),
            shutdown: None,
        }
    }

    /// Executor backed by one SQLite database for flows and runs.
    pub fn with_storage(actions: ActionRegistry, storage: SqliteStorage) -> Self {
        let storage = Arc::new(storage);
        Self::new(actions, storage.clone(), storage)
    }

    pub fn with_evaluator(mut self, evaluator: ConditionEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_settings(mut self, settings: EngineConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_cancellations(mut self, cancellations: CancellationRegistry) -> Self {
        self.cancellations = cancellations;
        self
    }

    /// In-flight runs stop at the next node boundary once shutdown is
    /// requested and stay `Running` for recovery.
    pub fn with_shutdown(mut self, shutdown: ShutdownCoordinator) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    /// Start a run for every trigger of `flow` that matches `event`, and drive
    /// each one until it finishes or suspends.
    #[instrument(
        name = "flow.fire",
        skip(self, flow, event),
        fields(flow_id = %flow.id, event = %event.name)
    )]
    pub async fn fire(&self, flow: &PlaybookFlow, event: &TriggerEvent) -> Result<Vec<FlowRun>> {
        let report = validate(flow);
        if !report.is_valid {
            return Err(Error::Validation(report.errors));
        }

        let mut started = Vec::new();
        for trigger in flow.triggers() {
            if trigger.is_disabled() {
                continue;
            }
            let config: TriggerConfig = node_config(trigger)?;
            if config.event.as_deref().is_some_and(|e| e != event.name) {
                continue;
            }

            let mut run = FlowRun::new(flow, &trigger.id, seed_context(flow, event));
            if let Some(group) = &config.conditions {
                match self.evaluator.evaluate_group(group, &run.context).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(trigger = %trigger.id, "Trigger conditions not met");
                        continue;
                    }
                    Err(e) => {
                        // Recorded on a failed run rather than read as "no match"
                        warn!(trigger = %trigger.id, "Trigger condition failed: {}", e);
                        run.fail(&e, Some(trigger.id.as_str()));
                        self.runs.create_run(&run).await?;
                        metrics::record_run_finished(&run.status.to_string());
                        started.push(run);
                        continue;
                    }
                }
            }

            self.runs.create_run(&run).await?;
            metrics::record_run_started();
            info!(run_id = %run.id, trigger = %trigger.id, "Run started");
            started.push(self.drive(flow, run).await?);
        }

        Ok(started)
    }

    /// Fire a stored flow by name. Only active flows accept events.
    pub async fn fire_by_name(&self, name: &str, event: &TriggerEvent) -> Result<Vec<FlowRun>> {
        let stored = self
            .flows
            .get_flow(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Flow '{}'", name)))?;
        if !stored.active {
            return Err(Error::Validation(vec![format!(
                "Flow '{}' is not active",
                name
            )]));
        }
        self.fire(&stored.flow()?, event).await
    }

    /// Continue a run: past its delay when `Waiting` and due, or from its
    /// checkpointed node when it was left `Running` or `PendingTrigger`.
    #[instrument(name = "run.resume", skip(self))]
    pub async fn resume(&self, run_id: &str) -> Result<FlowRun> {
        let run = self.load_run(run_id).await?;
        let flow = self.load_flow(&run.flow_id).await?;
        self.resume_run(&flow, run).await
    }

    /// Like [`resume`](Self::resume) with the flow already at hand.
    pub async fn resume_with_flow(&self, flow: &PlaybookFlow, run_id: &str) -> Result<FlowRun> {
        let run = self.load_run(run_id).await?;
        self.resume_run(flow, run).await
    }

    async fn resume_run(&self, flow: &PlaybookFlow, mut run: FlowRun) -> Result<FlowRun> {
        match run.status {
            RunStatus::Waiting => {
                if run.wake_at.is_some_and(|wake_at| wake_at > Utc::now()) {
                    debug!(run_id = %run.id, "Run is not due yet");
                    return Ok(run);
                }
                let delay_id = run.current_node.clone().ok_or_else(|| {
                    Error::Internal(format!("Waiting run '{}' has no current node", run.id))
                })?;
                let next = flow.outgoing(&delay_id).first().map(|c| c.target.clone());

                run.status = RunStatus::Running;
                run.wake_at = None;
                run.current_node = next;
                self.runs.update_run(&mut run).await?;

                let step = RunStep::start(&run.id, &delay_id, NodeType::Delay.as_str()).complete(
                    StepStatus::Completed,
                    Some(json!({ "resumedAt": Utc::now().to_rfc3339() })),
                );
                self.runs.save_step(&step).await?;
                info!(run_id = %run.id, "Run resumed after delay");
                self.drive(flow, run).await
            }
            RunStatus::Running | RunStatus::PendingTrigger => {
                info!(run_id = %run.id, node = ?run.current_node, "Recovering interrupted run");
                self.drive(flow, run).await
            }
            _ => Ok(run),
        }
    }

    /// Cancel a run.
    ///
    /// Runs driven in this process stop at their next node boundary; parked or
    /// orphaned runs are cancelled in the store directly. Returns false when
    /// the run had already finished.
    #[instrument(name = "run.cancel", skip(self))]
    pub async fn cancel(&self, run_id: &str) -> Result<bool> {
        if self.cancellations.request_cancel(run_id).await {
            info!("Cancellation requested for in-flight run");
            return Ok(true);
        }

        let mut run = self.load_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(false);
        }
        run.finish(RunStatus::Cancelled);
        self.runs.update_run(&mut run).await?;
        metrics::record_run_finished(&run.status.to_string());
        info!("Run cancelled");
        Ok(true)
    }

    /// Waiting runs whose delay has elapsed at `now`.
    pub async fn due_runs(&self, now: DateTime<Utc>) -> Result<Vec<FlowRun>> {
        self.runs.due_runs(now).await
    }

    /// Runs left mid-flight by a previous process.
    pub async fn interrupted_runs(&self) -> Result<Vec<FlowRun>> {
        let mut runs = self.runs.runs_in_status(RunStatus::Running).await?;
        runs.extend(self.runs.runs_in_status(RunStatus::PendingTrigger).await?);

        let mut orphaned = Vec::with_capacity(runs.len());
        for run in runs {
            if !self.cancellations.is_registered(&run.id).await {
                orphaned.push(run);
            }
        }
        Ok(orphaned)
    }

    /// Pick the outgoing edge of a trigger or condition node.
    ///
    /// Guarded edges are tried in declaration order, unguarded ones match,
    /// and the `isDefault` edge is the fallback. `connection` is `None` only
    /// when the node has no outgoing edges at all.
    pub async fn select_edge<'f>(
        &self,
        flow: &'f PlaybookFlow,
        node: &PlaybookNode,
        ctx: &Context,
    ) -> Result<EdgeChoice<'f>> {
        let outgoing = flow.outgoing(&node.id);
        let branch = match node_conditions(node)? {
            Some(group) => Some(self.evaluator.evaluate_group(&group, ctx).await?),
            None => None,
        };
        if outgoing.is_empty() {
            return Ok(EdgeChoice {
                connection: None,
                branch,
            });
        }

        for conn in outgoing.iter().copied().filter(|c| !c.is_default_edge()) {
            let matched = match conn.guard() {
                Some(text) => {
                    Guard::parse(text)?
                        .matches(&self.evaluator, ctx, branch)
                        .await?
                }
                None => true,
            };
            if matched {
                return Ok(EdgeChoice {
                    connection: Some(conn),
                    branch,
                });
            }
        }

        match outgoing.iter().copied().find(|c| c.is_default_edge()) {
            Some(conn) => Ok(EdgeChoice {
                connection: Some(conn),
                branch,
            }),
            None => Err(Error::NoMatchingBranch {
                node_id: node.id.clone(),
            }),
        }
    }

    #[instrument(
        name = "run.drive",
        skip(self, flow, run),
        fields(run_id = %run.id, flow_id = %flow.id)
    )]
    async fn drive(&self, flow: &PlaybookFlow, run: FlowRun) -> Result<FlowRun> {
        let run_id = run.id.clone();
        let cancel = self.cancellations.register(&run_id).await;
        metrics::inc_active_runs();

        let result = self.drive_inner(flow, run, &cancel).await;

        metrics::dec_active_runs();
        self.cancellations.unregister(&run_id).await;

        match &result {
            Ok(run) if run.status.is_terminal() => {
                metrics::record_run_finished(&run.status.to_string());
                info!(status = %run.status, "Run finished");
            }
            Ok(run) => debug!(status = %run.status, "Run parked"),
            Err(e) => error!("Run driver aborted: {}", e),
        }
        result
    }

    async fn drive_inner(
        &self,
        flow: &PlaybookFlow,
        mut run: FlowRun,
        cancel: &AtomicBool,
    ) -> Result<FlowRun> {
        let clock = ActiveClock::start(run.active_ms);
        let deadline = run_deadline(&run, flow.settings.timeout);
        let max_flow_retries = flow
            .settings
            .max_flow_retries
            .min(self.settings.max_flow_retries);

        run.status = RunStatus::Running;
        self.checkpoint(&mut run, &clock).await?;

        let mut steps = 0usize;
        loop {
            if cancel.load(Ordering::SeqCst) {
                info!("Run cancelled at node boundary");
                run.finish(RunStatus::Cancelled);
                self.checkpoint(&mut run, &clock).await?;
                return Ok(run);
            }
            if self
                .shutdown
                .as_ref()
                .is_some_and(|s| s.is_shutdown_requested())
            {
                info!("Shutdown requested, leaving run for recovery");
                self.checkpoint(&mut run, &clock).await?;
                return Ok(run);
            }
            if deadline.is_some_and(|d| Utc::now() >= d) {
                let err = Error::Timeout(run_timeout_message(flow.settings.timeout));
                let node_id = run.current_node.clone();
                run.fail(&err, node_id.as_deref());
                self.checkpoint(&mut run, &clock).await?;
                return Ok(run);
            }
            steps += 1;
            if steps > self.settings.max_steps_per_run {
                let err = Error::Internal(format!(
                    "Run exceeded {} node visits",
                    self.settings.max_steps_per_run
                ));
                let node_id = run.current_node.clone();
                run.fail(&err, node_id.as_deref());
                self.checkpoint(&mut run, &clock).await?;
                return Ok(run);
            }

            let Some(node_id) = run.current_node.clone() else {
                run.finish(RunStatus::Completed);
                self.checkpoint(&mut run, &clock).await?;
                return Ok(run);
            };
            let Some(node) = flow.node(&node_id) else {
                let err = Error::Graph(format!("Node '{}' not found in flow", node_id));
                run.fail(&err, Some(node_id.as_str()));
                self.checkpoint(&mut run, &clock).await?;
                return Ok(run);
            };

            let step = RunStep::start(&run.id, &node.id, node.node_type.as_str());
            let outcome = self
                .execute_node(flow, node, &mut run, cancel, max_flow_retries)
                .await;

            match outcome {
                Ok(outcome) => {
                    let mut step = step.complete(outcome.status, outcome.output);
                    step.attempts = outcome.attempts;
                    step.error = outcome.error;

                    match outcome.transition {
                        Transition::Next(next) => {
                            run.current_node = Some(next);
                        }
                        Transition::Retry => {}
                        Transition::Suspend(wake_at) => {
                            run.status = RunStatus::Waiting;
                            run.wake_at = Some(wake_at);
                            self.checkpoint(&mut run, &clock).await?;
                            self.runs.save_step(&step).await?;
                            info!(node_id = %node.id, %wake_at, "Run suspended at delay");
                            return Ok(run);
                        }
                        Transition::Finish(status) => {
                            if status == RunStatus::Failed {
                                run.error = Some(format!("Ended at failure node '{}'", node.id));
                            }
                            run.finish(status);
                            self.checkpoint(&mut run, &clock).await?;
                            self.runs.save_step(&step).await?;
                            return Ok(run);
                        }
                    }

                    self.checkpoint(&mut run, &clock).await?;
                    self.runs.save_step(&step).await?;
                }
                Err(Error::Cancelled(reason)) => {
                    info!(node_id = %node.id, "Run cancelled: {}", reason);
                    run.finish(RunStatus::Cancelled);
                    self.checkpoint(&mut run, &clock).await?;
                    self.runs
                        .save_step(&step.complete(StepStatus::Skipped, None))
                        .await?;
                    return Ok(run);
                }
                Err(e) => {
                    error!(node_id = %node.id, code = e.code(), "Node failed: {}", e);
                    run.fail(&e, Some(node.id.as_str()));
                    self.checkpoint(&mut run, &clock).await?;
                    self.runs.save_step(&step.failed(&e)).await?;
                    return Ok(run);
                }
            }
        }
    }

    async fn execute_node(
        &self,
        flow: &PlaybookFlow,
        node: &PlaybookNode,
        run: &mut FlowRun,
        cancel: &AtomicBool,
        max_flow_retries: u32,
    ) -> Result<NodeOutcome> {
        let next = || flow.outgoing(&node.id).first().copied();

        if node.is_disabled() && matches!(node.node_type, NodeType::Action | NodeType::Delay) {
            debug!(node_id = %node.id, "Skipping disabled node");
            let mut outcome = NodeOutcome::completed(Transition::follow(next()), None);
            outcome.status = StepStatus::Skipped;
            outcome.attempts = 0;
            return Ok(outcome);
        }

        match node.node_type {
            NodeType::Trigger | NodeType::Condition => {
                let choice = self.select_edge(flow, node, &run.context).await?;
                let output = json!({
                    "branch": choice.branch,
                    "connection": choice.connection.map(|c| c.id.clone()),
                });
                let transition = match choice.connection {
                    Some(conn) => Transition::Next(conn.target.clone()),
                    None if node.node_type == NodeType::Trigger => {
                        Transition::Finish(RunStatus::Completed)
                    }
                    None => {
                        return Err(Error::NoMatchingBranch {
                            node_id: node.id.clone(),
                        })
                    }
                };
                run.node_outputs.insert(node.id.clone(), output.clone());
                Ok(NodeOutcome::completed(transition, Some(output)))
            }
            NodeType::Action => {
                self.execute_action_node(flow, node, run, cancel, max_flow_retries)
                    .await
            }
            NodeType::Delay => {
                let duration = delay_duration(node)?;
                if duration.is_zero() {
                    return Ok(NodeOutcome::completed(Transition::follow(next()), None));
                }
                let wake_at = ChronoDuration::from_std(duration)
                    .ok()
                    .and_then(|d| Utc::now().checked_add_signed(d))
                    .ok_or_else(|| {
                        Error::Config(format!("Delay on node '{}' is too long", node.id))
                    })?;
                let mut outcome = NodeOutcome::completed(
                    Transition::Suspend(wake_at),
                    Some(json!({ "wakeAt": wake_at.to_rfc3339() })),
                );
                outcome.status = StepStatus::Waiting;
                Ok(outcome)
            }
            NodeType::End => {
                let status = match node.data.config.get("finalStatus").and_then(Value::as_str) {
                    Some("failed") => RunStatus::Failed,
                    _ => RunStatus::Completed,
                };
                Ok(NodeOutcome::completed(
                    Transition::Finish(status),
                    Some(json!({ "finalStatus": status.to_string() })),
                ))
            }
        }
    }

    async fn execute_action_node(
        &self,
        flow: &PlaybookFlow,
        node: &PlaybookNode,
        run: &mut FlowRun,
        cancel: &AtomicBool,
        max_flow_retries: u32,
    ) -> Result<NodeOutcome> {
        let config = &node.data.config;
        let action = config
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Config(format!("Action node '{}' has no action", node.id)))?;
        let output_key = config.get("outputKey").and_then(Value::as_str);
        let per_attempt = action_timeout(node, self.settings.action_timeout_seconds)?;
        let deadline = run_deadline(run, flow.settings.timeout);

        let (result, attempts) = self
            .execute_action(flow, node, action, run, per_attempt, deadline, cancel)
            .await;

        let err = match result {
            Ok(output) => {
                apply_output(&mut run.context, &output, output_key);
                run.node_outputs.insert(node.id.clone(), output.data.clone());
                let next = flow.outgoing(&node.id).first().copied();
                let mut outcome =
                    NodeOutcome::completed(Transition::follow(next), Some(output.data));
                outcome.attempts = attempts;
                return Ok(outcome);
            }
            Err(e @ Error::Cancelled(_)) => return Err(e),
            Err(e) => e,
        };

        let transition = match flow.settings.failure_strategy {
            FailureStrategy::Stop => None,
            FailureStrategy::Continue => flow
                .outgoing(&node.id)
                .into_iter()
                .find(|c| c.is_default_edge())
                .map(|conn| {
                    warn!(node_id = %node.id, "Action failed, continuing along default edge: {}", err);
                    Transition::Next(conn.target.clone())
                }),
            FailureStrategy::Retry if run.flow_retries < max_flow_retries => {
                run.flow_retries += 1;
                warn!(
                    node_id = %node.id,
                    "Action failed, flow retry {}/{}: {}",
                    run.flow_retries,
                    max_flow_retries,
                    err
                );
                Some(Transition::Retry)
            }
            FailureStrategy::Retry => None,
        };

        match transition {
            Some(transition) => {
                run.node_outputs.insert(
                    node.id.clone(),
                    json!({ "error": err.to_string(), "code": err.code() }),
                );
                Ok(NodeOutcome {
                    transition,
                    status: StepStatus::Failed,
                    output: None,
                    attempts,
                    error: Some(err.to_string()),
                })
            }
            None => Err(err),
        }
    }

    /// Run one action with per-attempt timeout and exponential backoff.
    ///
    /// Returns the result and the number of attempts made.
    #[allow(clippy::too_many_arguments)]
    #[instrument(
        name = "action.execute",
        skip_all,
        fields(run_id = %run.id, node_id = %node.id, action = %action)
    )]
    async fn execute_action(
        &self,
        flow: &PlaybookFlow,
        node: &PlaybookNode,
        action: &str,
        run: &FlowRun,
        per_attempt: Duration,
        deadline: Option<DateTime<Utc>>,
        cancel: &AtomicBool,
    ) -> (Result<ActionOutput>, u32) {
        let max_attempts = flow.settings.retry_count.saturating_add(1);
        let ctx = ActionContext::new(&run.id, &flow.id, &node.id, run.context.clone());

        let mut attempt = 1u32;
        loop {
            if cancel.load(Ordering::SeqCst) {
                return (
                    Err(Error::Cancelled(format!("Run '{}' cancelled", run.id))),
                    attempt - 1,
                );
            }

            let mut limit = per_attempt;
            if let Some(deadline) = deadline {
                let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
                if remaining.is_zero() {
                    return (
                        Err(Error::Timeout(run_timeout_message(flow.settings.timeout))),
                        attempt - 1,
                    );
                }
                limit = limit.min(remaining);
            }

            let started = Instant::now();
            let result = match timeout(limit, self.actions.execute(action, &node.data.config, &ctx))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!(
                    "Action '{}' on node '{}' timed out after {}ms",
                    action,
                    node.id,
                    limit.as_millis()
                ))),
            };

            match result {
                Ok(output) => {
                    metrics::record_action(action, "success", started.elapsed());
                    debug!(attempt, "Action succeeded");
                    return (Ok(output), attempt);
                }
                Err(e) => {
                    let status = if matches!(e, Error::Timeout(_)) {
                        "timeout"
                    } else {
                        "failed"
                    };
                    metrics::record_action(action, status, started.elapsed());

                    if !e.is_retryable() || attempt >= max_attempts {
                        return (Err(into_action_error(&node.id, e)), attempt);
                    }

                    let delay = backoff_delay(
                        self.settings.retry_base_delay_ms,
                        self.settings.retry_max_delay_ms,
                        attempt,
                    );
                    warn!(
                        "Action '{}' attempt {}/{} failed: {}. Retrying in {}ms",
                        action,
                        attempt,
                        max_attempts,
                        e,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn checkpoint(&self, run: &mut FlowRun, clock: &ActiveClock) -> Result<()> {
        run.active_ms = clock.total_ms();
        self.runs.update_run(run).await
    }

    async fn load_run(&self, run_id: &str) -> Result<FlowRun> {
        self.runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Run '{}'", run_id)))
    }

    async fn load_flow(&self, flow_id: &str) -> Result<PlaybookFlow> {
        self.flows
            .get_flow_by_id(flow_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Flow '{}'", flow_id)))?
            .flow()
    }
}

/// Flow variables, then the event payload, then the event name.
fn seed_context(flow: &PlaybookFlow, event: &TriggerEvent) -> Context {
    let mut ctx = flow.variables.clone();
    for (key, value) in &event.payload {
        ctx.insert(key.clone(), value.clone());
    }
    ctx.insert("event".to_string(), Value::String(event.name.clone()));
    ctx
}

fn node_config<T: DeserializeOwned + Default>(node: &PlaybookNode) -> Result<T> {
    if node.data.config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(node.data.config.clone())
        .map_err(|e| Error::Config(format!("Invalid config on node '{}': {}", node.id, e)))
}

fn node_conditions(node: &PlaybookNode) -> Result<Option<ConditionGroup>> {
    match node.data.config.get("conditions") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
            Error::Config(format!("Invalid conditions on node '{}': {}", node.id, e))
        }),
    }
}

/// `{ "seconds": n }` or `{ "amount": n, "unit": "minutes" }`.
fn delay_duration(node: &PlaybookNode) -> Result<Duration> {
    let config = &node.data.config;
    let invalid = || {
        Error::Config(format!(
            "Delay node '{}' needs `seconds` or `amount` and `unit`",
            node.id
        ))
    };

    let seconds = match config.get("seconds") {
        Some(value) => value.as_f64().ok_or_else(invalid)?,
        None => {
            let amount = config
                .get("amount")
                .and_then(Value::as_f64)
                .ok_or_else(invalid)?;
            let unit = config
                .get("unit")
                .and_then(Value::as_str)
                .unwrap_or("seconds");
            let factor = match unit.trim_end_matches('s') {
                "second" => 1.0,
                "minute" => 60.0,
                "hour" => 3600.0,
                "day" => 86_400.0,
                _ => {
                    return Err(Error::Config(format!(
                        "Unknown delay unit '{}' on node '{}'",
                        unit, node.id
                    )))
                }
            };
            amount * factor
        }
    };

    if !seconds.is_finite() || seconds < 0.0 {
        return Err(invalid());
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| Error::Config(format!("Delay on node '{}' is too long", node.id)))
}

/// Per-attempt limit from `timeoutSeconds`, falling back to the engine default.
fn action_timeout(node: &PlaybookNode, default_secs: u64) -> Result<Duration> {
    let Some(seconds) = node
        .data
        .config
        .get("timeoutSeconds")
        .and_then(Value::as_f64)
        .filter(|s| s.is_finite() && *s > 0.0)
    else {
        return Ok(Duration::from_secs(default_secs));
    };
    Duration::try_from_secs_f64(seconds).map_err(|_| {
        Error::Config(format!(
            "timeoutSeconds {} on node '{}' is out of range",
            seconds, node.id
        ))
    })
}

/// Wall-clock deadline for the whole run. `None` when the flow has no timeout
/// or the deadline is beyond the representable range.
fn run_deadline(run: &FlowRun, timeout_secs: u64) -> Option<DateTime<Utc>> {
    if timeout_secs == 0 {
        return None;
    }
    let secs = i64::try_from(timeout_secs).ok()?;
    ChronoDuration::try_seconds(secs).and_then(|d| run.started_at.checked_add_signed(d))
}

/// `base * 2^(attempt-1)`, capped.
pub(crate) fn backoff_delay(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    Duration::from_millis(base_ms.saturating_mul(1u64 << shift).min(max_ms))
}

fn run_timeout_message(timeout_seconds: u64) -> String {
    format!("Run exceeded its {} second timeout", timeout_seconds)
}

/// Failures surfaced from an action keep their class when it is already
/// meaningful; everything else becomes an action error on the node.
fn into_action_error(node_id: &str, err: Error) -> Error {
    match err {
        Error::Timeout(_)
        | Error::ActionExecution { .. }
        | Error::Cancelled(_)
        | Error::Config(_) => err,
        other => Error::action(node_id, other.to_string()),
    }
}
