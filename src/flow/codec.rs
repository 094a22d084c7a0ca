//! Flow import/export.
//!
//! Exports are the flow's JSON plus an `exportedAt` / `version` envelope at
//! the top level. Imports accept exported JSON, bare flow JSON or YAML.

use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;
use serde_json::Value;

use super::types::PlaybookFlow;
use crate::error::{Error, Result};

/// Export format version written into every export.
pub const EXPORT_VERSION: &str = "1.0";

const SUPPORTED_MAJOR: &str = "1";

/// Serialize a flow for export.
pub fn export_flow(flow: &PlaybookFlow) -> Result<String> {
    let mut value = serde_json::to_value(flow)?;
    if let Value::Object(map) = &mut value {
        map.insert(
            "exportedAt".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        map.insert(
            "version".to_string(),
            Value::String(EXPORT_VERSION.to_string()),
        );
    }
    Ok(serde_json::to_string_pretty(&value)?)
}

/// Parse an exported (or hand-written) flow.
pub fn import_flow(input: &str) -> Result<PlaybookFlow> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::Parse("Empty flow definition".to_string()));
    }

    let mut value: Value = if trimmed.starts_with('{') {
        serde_json::from_str(trimmed)
            .map_err(|e| Error::Parse(format!("Invalid JSON: {}", e)))?
    } else {
        serde_yaml::from_str(trimmed)
            .map_err(|e| Error::Parse(format!("Invalid YAML: {}", e)))?
    };

    let map = value
        .as_object_mut()
        .ok_or_else(|| Error::Parse("Flow definition must be an object".to_string()))?;

    if let Some(version) = map.remove("version") {
        check_version(&version)?;
    }
    map.remove("exportedAt");

    let flow: PlaybookFlow = serde_json::from_value(value).map_err(|e| {
        let msg = e.to_string();
        match extract_missing_field(&msg) {
            Some(field) => Error::Parse(format!("Missing required field: {}", field)),
            None => Error::Parse(format!("Invalid flow: {}", msg)),
        }
    })?;

    check_integrity(&flow)?;
    Ok(flow)
}

/// Read and import a flow file.
pub fn import_flow_file(path: &Path) -> Result<PlaybookFlow> {
    let content = std::fs::read_to_string(path)?;
    import_flow(&content)
}

fn check_version(version: &Value) -> Result<()> {
    let text = match version {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(Error::Parse(format!("Invalid export version: {}", other)));
        }
    };
    let major = text.split('.').next().unwrap_or_default();
    if major != SUPPORTED_MAJOR {
        return Err(Error::Parse(format!(
            "Unsupported export version {} (expected {}.x)",
            text, SUPPORTED_MAJOR
        )));
    }
    Ok(())
}

fn check_integrity(flow: &PlaybookFlow) -> Result<()> {
    let mut ids = HashSet::new();
    for node in &flow.nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(Error::Parse(format!("Duplicate node id: {}", node.id)));
        }
    }
    for conn in &flow.connections {
        for endpoint in [&conn.source, &conn.target] {
            if !ids.contains(endpoint.as_str()) {
                return Err(Error::Parse(format!(
                    "Connection '{}' references unknown node '{}'",
                    conn.id, endpoint
                )));
            }
        }
    }
    Ok(())
}

fn extract_missing_field(error_message: &str) -> Option<&str> {
    let marker = "missing field `";
    let start = error_message.find(marker)? + marker.len();
    let rest = &error_message[start..];
    let end = rest.find('`')?;
    Some(&rest[..end])
}
