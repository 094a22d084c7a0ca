use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use saler_flow::actions::ActionRegistry;
use saler_flow::analytics::{segment_by, summarize, RunRecord};
use saler_flow::conditions::{ConditionEvaluator, DefaultExternalChecks};
use saler_flow::config::Config;
use saler_flow::engine::{FlowExecutor, TriggerEvent, WakeupScheduler};
use saler_flow::fields::FieldRegistry;
use saler_flow::flow::{export_flow, import_flow_file, validate};
use saler_flow::shutdown::ShutdownCoordinator;
use saler_flow::storage::{
    FlowRun, FlowStore, RunQuery, RunStatus, RunStore, SqliteStorage, StepStatus, StoredFlow,
};
use saler_flow::tasks::SlaMonitor;
use tracing::info;

/// Page size used when reading a flow's full run history.
const HISTORY_PAGE: usize = 1000;

#[derive(Parser)]
#[command(name = "saler")]
#[command(about = "Saler playbook flow engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (merged over ~/.config/saler/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a flow file without storing it
    Validate {
        /// Path to flow JSON/YAML export
        file: String,
    },
    /// Store a flow from file
    Import {
        file: String,
        /// Activate the flow so it accepts events
        #[arg(long)]
        activate: bool,
    },
    /// Export a stored flow
    Export {
        name: String,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<String>,
    },
    /// List stored flows
    List,
    /// Fire an event at a flow and drive the runs it starts
    Fire {
        name: String,
        #[arg(short, long)]
        event: String,
        /// JSON object merged into the run context
        #[arg(short, long)]
        payload: Option<String>,
    },
    /// Show recent runs of a flow
    Runs {
        name: String,
        /// Status filter: pending_trigger|running|waiting|completed|failed|cancelled
        #[arg(long)]
        status: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show a run with its per-node steps
    Trace { run_id: String },
    /// Cancel a run
    Cancel { run_id: String },
    /// Resume delayed runs and sweep task SLAs until stopped
    Worker {
        /// Print Prometheus metrics on exit
        #[arg(long)]
        print_metrics: bool,
    },
    /// Success rate, ROI and segment breakdown for a flow
    Analytics {
        name: String,
        /// Segment by: source|temperature|priority|assignee
        #[arg(long)]
        by: Option<String>,
    },
    /// Database integrity check
    Db,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    saler_flow::telemetry::init_tracing(&config.logging)?;

    match cli.command {
        Commands::Validate { file } => cmd_validate(&file)?,
        Commands::Import { file, activate } => cmd_import(&config, &file, activate).await?,
        Commands::Export { name, output } => cmd_export(&config, &name, output.as_deref()).await?,
        Commands::List => cmd_list(&config).await?,
        Commands::Fire {
            name,
            event,
            payload,
        } => cmd_fire(&config, &name, &event, payload.as_deref()).await?,
        Commands::Runs {
            name,
            status,
            limit,
        } => cmd_runs(&config, &name, status.as_deref(), limit).await?,
        Commands::Trace { run_id } => cmd_trace(&config, &run_id).await?,
        Commands::Cancel { run_id } => cmd_cancel(&config, &run_id).await?,
        Commands::Worker { print_metrics } => cmd_worker(&config, print_metrics).await?,
        Commands::Analytics { name, by } => cmd_analytics(&config, &name, by.as_deref()).await?,
        Commands::Db => cmd_db_check(&config).await?,
    }

    Ok(())
}

// ============================================================================
// Flow Commands
// ============================================================================

fn cmd_validate(file: &str) -> anyhow::Result<()> {
    let path = Path::new(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", file);
    }

    let flow = import_flow_file(path)?;
    let report = validate(&flow);
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_valid {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_import(config: &Config, file: &str, activate: bool) -> anyhow::Result<()> {
    let path = Path::new(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", file);
    }

    let flow = import_flow_file(path)?;
    let report = validate(&flow);
    if activate && !report.is_valid {
        anyhow::bail!(
            "Flow '{}' is invalid and cannot be activated:\n  {}",
            flow.name,
            report.errors.join("\n  ")
        );
    }

    let storage = get_storage(config)?;
    storage.save_flow(&StoredFlow::from_flow(&flow, activate)?).await?;

    println!("✓ Flow '{}' stored", flow.name);
    println!();
    println!("  Nodes: {}", flow.nodes.len());
    println!("  Connections: {}", flow.connections.len());
    println!("  Active: {}", if activate { "yes" } else { "no" });
    for warning in &report.warnings {
        println!("  ⚠ {}", warning);
    }
    Ok(())
}

async fn cmd_export(config: &Config, name: &str, output: Option<&str>) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let flow = load_stored(&storage, name).await?.flow()?;
    let exported = export_flow(&flow)?;

    match output {
        Some(path) => {
            let path = Path::new(path);
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(path, exported)?;
            println!("✓ Exported '{}' to {}", name, path.display());
        }
        None => println!("{}", exported),
    }
    Ok(())
}

async fn cmd_list(config: &Config) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let flows = storage.list_flows().await?;

    if flows.is_empty() {
        println!("No flows found.");
        println!();
        println!("Store one with: saler import <flow.json> --activate");
        return Ok(());
    }

    println!("{:<30} {:<8} {:<20}", "NAME", "ACTIVE", "UPDATED");
    println!("{}", "-".repeat(60));
    for flow in flows {
        println!(
            "{:<30} {:<8} {:<20}",
            flow.name,
            if flow.active { "yes" } else { "no" },
            flow.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

// ============================================================================
// Run Commands
// ============================================================================

async fn cmd_fire(
    config: &Config,
    name: &str,
    event: &str,
    payload: Option<&str>,
) -> anyhow::Result<()> {
    let payload = match payload {
        Some(raw) => match serde_json::from_str(raw)? {
            serde_json::Value::Object(map) => map,
            _ => anyhow::bail!("Payload must be a JSON object"),
        },
        None => serde_json::Map::new(),
    };

    let storage = get_storage(config)?;
    let executor = build_executor(config, storage);
    let runs = executor
        .fire_by_name(name, &TriggerEvent::new(event, payload))
        .await?;

    if runs.is_empty() {
        println!("No trigger of '{}' matched event '{}'", name, event);
        return Ok(());
    }
    for run in &runs {
        print_run(run);
    }
    Ok(())
}

async fn cmd_runs(
    config: &Config,
    name: &str,
    status: Option<&str>,
    limit: usize,
) -> anyhow::Result<()> {
    let status = status
        .map(|s| s.parse::<RunStatus>())
        .transpose()
        .map_err(|e| anyhow::anyhow!(e))?;

    let storage = get_storage(config)?;
    let stored = load_stored(&storage, name).await?;
    let runs = storage
        .query_runs(&RunQuery {
            flow_id: Some(stored.id),
            status,
            limit,
            offset: 0,
        })
        .await?;

    if runs.is_empty() {
        println!("No runs found for '{}'", name);
        return Ok(());
    }

    println!(
        "{:<38} {:<16} {:<16} {:<20}",
        "RUN", "STATUS", "NODE", "STARTED"
    );
    println!("{}", "-".repeat(92));
    for run in runs {
        println!(
            "{:<38} {:<16} {:<16} {:<20}",
            run.id,
            run.status.to_string(),
            run.current_node.as_deref().unwrap_or("-"),
            run.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn cmd_trace(config: &Config, run_id: &str) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let trace = storage
        .get_run_trace(run_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Run not found: {}", run_id))?;

    print_run(&trace.run);
    println!();
    for step in &trace.steps {
        let marker = match step.status {
            StepStatus::Completed => "✓",
            StepStatus::Failed => "✗",
            StepStatus::Waiting => "…",
            StepStatus::Skipped => "-",
        };
        println!(
            "  {} {:<16} {:<10} attempts={}{}",
            marker,
            step.node_id,
            step.node_type,
            step.attempts,
            step.error
                .as_deref()
                .map(|e| format!("  error: {}", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn cmd_cancel(config: &Config, run_id: &str) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let executor = build_executor(config, storage);

    if executor.cancel(run_id).await? {
        println!("✓ Run {} cancelled", run_id);
    } else {
        println!("Run {} had already finished", run_id);
    }
    Ok(())
}

async fn cmd_worker(config: &Config, print_metrics: bool) -> anyhow::Result<()> {
    saler_flow::metrics::init_metrics()?;

    let storage = get_storage(config)?;
    let shutdown = ShutdownCoordinator::new();
    shutdown.listen_for_signals();

    let executor = build_executor(config, storage.clone()).with_shutdown(shutdown.clone());

    let mut scheduler =
        WakeupScheduler::new(executor).with_poll_interval(config.worker.poll_interval_ms);
    let mut sla = SlaMonitor::new(Arc::new(storage))
        .with_sweep_interval(config.worker.sla_sweep_interval_seconds.saturating_mul(1000));

    scheduler.start();
    sla.start();
    info!("Worker running, press Ctrl+C to stop");

    shutdown.wait_for_shutdown().await;

    scheduler.stop().await?;
    sla.stop().await?;

    // Let dispatched runs reach their next checkpoint
    for _ in 0..50 {
        if scheduler.in_flight().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    if print_metrics {
        print!("{}", saler_flow::metrics::render_metrics());
    }
    info!("Worker stopped");
    Ok(())
}

async fn cmd_analytics(config: &Config, name: &str, by: Option<&str>) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let stored = load_stored(&storage, name).await?;

    let mut records = Vec::new();
    let mut offset = 0;
    loop {
        let page = storage
            .query_runs(&RunQuery {
                flow_id: Some(stored.id.clone()),
                status: None,
                limit: HISTORY_PAGE,
                offset,
            })
            .await?;
        let len = page.len();
        records.extend(page.iter().map(RunRecord::from_run));
        if len < HISTORY_PAGE {
            break;
        }
        offset += len;
    }

    let mut report = serde_json::json!({
        "flow": name,
        "metrics": summarize(&records),
    });
    if let Some(dimension) = by {
        report["segments"] = serde_json::to_value(segment_by(&records, dimension))?;
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_db_check(config: &Config) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let health = storage.check_health().await?;

    println!("Integrity check: {}", health.integrity_check);
    println!("Journal mode: {}", health.journal_mode);
    println!("Busy timeout: {}ms", health.busy_timeout_ms);

    if health.integrity_check.eq_ignore_ascii_case("ok") {
        println!("✓ Database health check passed");
        Ok(())
    } else {
        anyhow::bail!("Database health check failed")
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn get_storage(config: &Config) -> anyhow::Result<SqliteStorage> {
    Ok(SqliteStorage::open(&config.storage.resolved_database_path())?)
}

fn build_executor(config: &Config, storage: SqliteStorage) -> FlowExecutor {
    let external = DefaultExternalChecks::new(
        Duration::from_secs(config.external.api_timeout_seconds),
        config.external.ai_endpoint.clone(),
    );
    let evaluator = ConditionEvaluator::new(Arc::new(FieldRegistry::builtin()))
        .with_external(Arc::new(external));
    let actions = ActionRegistry::builtin(
        config.external.messaging_endpoint.clone(),
        Some(Arc::new(storage.clone())),
    );

    FlowExecutor::with_storage(actions, storage)
        .with_evaluator(evaluator)
        .with_settings(config.engine.clone())
}

async fn load_stored(storage: &SqliteStorage, name: &str) -> anyhow::Result<StoredFlow> {
    storage
        .get_flow(name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Flow not found: {}", name))
}

fn print_run(run: &FlowRun) {
    println!("Run {} [{}]", run.id, run.status);
    if let Some(node) = &run.current_node {
        println!("  Node: {}", node);
    }
    if let Some(wake_at) = run.wake_at {
        println!("  Wakes at: {}", wake_at.to_rfc3339());
    }
    if let Some(error) = &run.error {
        println!(
            "  Error: {} ({})",
            error,
            run.error_code.as_deref().unwrap_or("UNKNOWN")
        );
    }
}
