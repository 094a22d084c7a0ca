//! Read-only rollups over finished runs.
//!
//! Percentages are on a 0-100 scale. Any ratio with a zero denominator is
//! reported as 0.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::{FlowRun, RunStatus};

/// Dimensions a run can be segmented by.
pub const DIMENSIONS: [&str; 4] = ["source", "temperature", "priority", "assignee"];

const UNKNOWN_SEGMENT: &str = "unknown";

/// The slice of a run that analytics needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub revenue: f64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub converted: bool,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
}

impl RunRecord {
    pub fn from_run(run: &FlowRun) -> Self {
        let dimensions = DIMENSIONS
            .iter()
            .filter_map(|dim| {
                run.context
                    .get(*dim)
                    .and_then(dimension_value)
                    .map(|v| (dim.to_string(), v))
            })
            .collect();

        Self {
            run_id: run.id.clone(),
            status: run.status,
            revenue: run.context.get("revenue").map(as_amount).unwrap_or(0.0),
            cost: run.context.get("cost").map(as_amount).unwrap_or(0.0),
            converted: run.context.get("converted").is_some_and(is_truthy),
            dimensions,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowMetrics {
    pub total_runs: usize,
    pub successful_runs: usize,
    pub failed_runs: usize,
    pub cancelled_runs: usize,
    pub success_rate: f64,
    pub conversion_rate: f64,
    pub revenue: f64,
    pub cost: f64,
    /// `(revenue - cost) / cost * 100`
    pub roi: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMetrics {
    pub segment: String,
    pub runs: usize,
    pub success_rate: f64,
    pub revenue: f64,
}

/// Roll up terminal runs. Runs still in flight are ignored.
pub fn summarize(records: &[RunRecord]) -> FlowMetrics {
    let mut metrics = FlowMetrics::default();
    let mut converted = 0usize;

    for record in records.iter().filter(|r| r.status.is_terminal()) {
        metrics.total_runs += 1;
        match record.status {
            RunStatus::Completed => metrics.successful_runs += 1,
            RunStatus::Failed => metrics.failed_runs += 1,
            RunStatus::Cancelled => metrics.cancelled_runs += 1,
            _ => {}
        }
        if record.converted {
            converted += 1;
        }
        metrics.revenue += record.revenue;
        metrics.cost += record.cost;
    }

    metrics.success_rate = percentage(metrics.successful_runs as f64, metrics.total_runs as f64);
    metrics.conversion_rate = percentage(converted as f64, metrics.total_runs as f64);
    metrics.roi = percentage(metrics.revenue - metrics.cost, metrics.cost);
    metrics
}

/// Group terminal runs by `dimension`, most runs first.
pub fn segment_by(records: &[RunRecord], dimension: &str) -> Vec<SegmentMetrics> {
    // segment -> (runs, successful, revenue)
    let mut groups: BTreeMap<&str, (usize, usize, f64)> = BTreeMap::new();

    for record in records.iter().filter(|r| r.status.is_terminal()) {
        let segment = record
            .dimensions
            .get(dimension)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_SEGMENT);
        let entry = groups.entry(segment).or_default();
        entry.0 += 1;
        if record.status == RunStatus::Completed {
            entry.1 += 1;
        }
        entry.2 += record.revenue;
    }

    let mut segments: Vec<SegmentMetrics> = groups
        .into_iter()
        .map(|(segment, (runs, successful, revenue))| SegmentMetrics {
            segment: segment.to_string(),
            runs,
            success_rate: percentage(successful as f64, runs as f64),
            revenue,
        })
        .collect();

    segments.sort_by(|a, b| b.runs.cmp(&a.runs).then_with(|| a.segment.cmp(&b.segment)));
    segments
}

fn percentage(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator * 100.0
    }
}

fn as_amount(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
    .max(0.0)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => false,
    }
}

fn dimension_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::PlaybookFlow;
    use serde_json::json;

    fn record(status: RunStatus, revenue: f64, cost: f64, source: Option<&str>) -> RunRecord {
        let mut dimensions = BTreeMap::new();
        if let Some(source) = source {
            dimensions.insert("source".to_string(), source.to_string());
        }
        RunRecord {
            run_id: uuid::Uuid::new_v4().to_string(),
            status,
            revenue,
            cost,
            converted: status == RunStatus::Completed && revenue > 0.0,
            dimensions,
        }
    }

    #[test]
    fn test_empty_input_is_all_zero() {
        let metrics = summarize(&[]);
        assert_eq!(metrics, FlowMetrics::default());
        assert!(segment_by(&[], "source").is_empty());
    }

    #[test]
    fn test_summarize() {
        let records = vec![
            record(RunStatus::Completed, 1000.0, 100.0, Some("ads")),
            record(RunStatus::Completed, 0.0, 100.0, Some("ads")),
            record(RunStatus::Failed, 0.0, 50.0, Some("referral")),
            record(RunStatus::Cancelled, 0.0, 0.0, None),
            // Not finished, not counted
            record(RunStatus::Waiting, 500.0, 10.0, Some("ads")),
        ];
        let metrics = summarize(&records);

        assert_eq!(metrics.total_runs, 4);
        assert_eq!(metrics.successful_runs, 2);
        assert_eq!(metrics.failed_runs, 1);
        assert_eq!(metrics.cancelled_runs, 1);
        assert_eq!(metrics.success_rate, 50.0);
        assert_eq!(metrics.conversion_rate, 25.0);
        assert_eq!(metrics.revenue, 1000.0);
        assert_eq!(metrics.cost, 250.0);
        assert_eq!(metrics.roi, 300.0);
    }

    #[test]
    fn test_zero_cost_roi() {
        let metrics = summarize(&[record(RunStatus::Completed, 10.0, 0.0, None)]);
        assert_eq!(metrics.roi, 0.0);
        assert!(metrics.success_rate.is_finite());
    }

    #[test]
    fn test_segments_sorted_with_unknown_bucket() {
        let records = vec![
            record(RunStatus::Completed, 100.0, 0.0, Some("referral")),
            record(RunStatus::Completed, 200.0, 0.0, Some("ads")),
            record(RunStatus::Failed, 0.0, 0.0, Some("ads")),
            record(RunStatus::Failed, 0.0, 0.0, None),
        ];
        let segments = segment_by(&records, "source");

        let names: Vec<&str> = segments.iter().map(|s| s.segment.as_str()).collect();
        assert_eq!(names, vec!["ads", "referral", "unknown"]);
        assert_eq!(segments[0].runs, 2);
        assert_eq!(segments[0].success_rate, 50.0);
        assert_eq!(segments[0].revenue, 200.0);
        assert_eq!(segments[2].success_rate, 0.0);
    }

    #[test]
    fn test_record_from_run_context() {
        let flow = PlaybookFlow::new("f", "flow");
        let context = json!({
            "revenue": "1500.5",
            "cost": 200,
            "converted": "yes",
            "source": "website",
            "temperature": "hot",
            "priority": ""
        })
        .as_object()
        .cloned()
        .unwrap();
        let mut run = FlowRun::new(&flow, "t", context);
        run.finish(RunStatus::Completed);

        let record = RunRecord::from_run(&run);
        assert_eq!(record.revenue, 1500.5);
        assert_eq!(record.cost, 200.0);
        assert!(record.converted);
        assert_eq!(record.dimensions["source"], "website");
        assert_eq!(record.dimensions["temperature"], "hot");
        assert!(!record.dimensions.contains_key("priority"));
        assert!(!record.dimensions.contains_key("assignee"));
    }
}
