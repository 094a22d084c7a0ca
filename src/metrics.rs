//! Prometheus metrics for saler.
//!
//! ## Metrics
//!
//! ### Counters
//! - `saler_runs_started_total` - Runs started by a trigger
//! - `saler_runs_finished_total` - Runs reaching a terminal state, by status
//! - `saler_actions_executed_total` - Action attempts by action and status
//! - `saler_condition_errors_total` - External condition check failures by kind
//! - `saler_tasks_overdue_total` - Tasks flagged by the SLA sweep
//!
//! ### Histograms
//! - `saler_action_duration_seconds` - Action attempt duration by action
//!
//! ### Gauges
//! - `saler_active_runs` - Runs currently being driven

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{Error, Result};

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder.
///
/// Safe to call more than once; later calls return the first handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Internal(format!("Failed to install Prometheus recorder: {}", e)))?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Render current metrics in Prometheus text format.
pub fn render_metrics() -> String {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => handle.render(),
        None => "# Metrics not initialized\n".to_string(),
    }
}

// =============================================================================
// Run Metrics
// =============================================================================

pub fn record_run_started() {
    counter!("saler_runs_started_total").increment(1);
}

pub fn record_run_finished(status: &str) {
    counter!(
        "saler_runs_finished_total",
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn inc_active_runs() {
    gauge!("saler_active_runs").increment(1.0);
}

pub fn dec_active_runs() {
    gauge!("saler_active_runs").decrement(1.0);
}

// =============================================================================
// Action Metrics
// =============================================================================

/// Record one action attempt.
pub fn record_action(action: &str, status: &str, duration: Duration) {
    counter!(
        "saler_actions_executed_total",
        "action" => action.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        "saler_action_duration_seconds",
        "action" => action.to_string()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Condition / Task Metrics
// =============================================================================

pub fn record_condition_error(kind: &str) {
    counter!(
        "saler_condition_errors_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn record_task_overdue() {
    counter!("saler_tasks_overdue_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_never_empty() {
        // Other tests may already have installed the recorder
        let result = render_metrics();
        assert!(!result.is_empty());
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_run_started();
        record_action("send_message", "success", Duration::from_millis(3));
        record_condition_error("api");
    }
}
