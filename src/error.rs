//! Error types for the playbook engine.
//!
//! Every variant carries a stable code so that the editor and API layers can
//! map failures to localized, actionable messages instead of raw exceptions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Flow is structurally invalid. Carries every problem found.
    #[error("Validation error: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Condition evaluation error: {0}")]
    ConditionEvaluation(String),

    #[error("Operator '{operator}' is not supported for {field_type} field '{field}'")]
    UnsupportedOperator {
        field: String,
        operator: String,
        field_type: String,
    },

    #[error("Type mismatch on field '{field}': expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: String,
        found: String,
    },

    #[error("Unknown field: {0}")]
    FieldNotFound(String),

    #[error("No matching branch out of node '{node_id}'")]
    NoMatchingBranch { node_id: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Action failed on node '{node_id}': {message}")]
    ActionExecution { node_id: String, message: String },

    #[error("Run cancelled: {0}")]
    Cancelled(String),

    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for an action failure on a node.
    pub fn action(node_id: &str, message: impl Into<String>) -> Self {
        Error::ActionExecution {
            node_id: node_id.to_string(),
            message: message.into(),
        }
    }

    /// Get the machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::ConditionEvaluation(_) => "CONDITION_EVALUATION_ERROR",
            Error::UnsupportedOperator { .. } => "UNSUPPORTED_OPERATOR",
            Error::TypeMismatch { .. } => "TYPE_MISMATCH",
            Error::FieldNotFound(_) => "FIELD_NOT_FOUND",
            Error::NoMatchingBranch { .. } => "NO_MATCHING_BRANCH",
            Error::Timeout(_) => "TIMEOUT_ERROR",
            Error::ActionExecution { .. } => "ACTION_EXECUTION_ERROR",
            Error::Cancelled(_) => "CANCELLED",
            Error::Graph(_) => "GRAPH_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Conflict(_) => "CONFLICT",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// True for failures raised while evaluating a condition.
    ///
    /// These must be recorded on the run; they are never coerced to `false`.
    pub fn is_condition_error(&self) -> bool {
        matches!(
            self,
            Error::ConditionEvaluation(_)
                | Error::UnsupportedOperator { .. }
                | Error::TypeMismatch { .. }
                | Error::FieldNotFound(_)
        )
    }

    /// Whether a retry has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            Error::Timeout(_) | Error::ActionExecution { .. } | Error::Io(_) => true,
            _ => false,
        }
    }

    /// HTTP status mapping for outward-facing surfaces.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Validation(_)
            | Error::UnsupportedOperator { .. }
            | Error::TypeMismatch { .. }
            | Error::FieldNotFound(_)
            | Error::Graph(_)
            | Error::Parse(_)
            | Error::Json(_)
            | Error::Yaml(_) => 400,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::Timeout(_) => 504,
            _ => 500,
        }
    }

    /// Get a sanitized error message safe for external consumers.
    pub fn external_message(&self) -> String {
        match self {
            Error::Storage(_) => "A storage error occurred".to_string(),
            Error::Internal(_) => "An internal error occurred".to_string(),
            Error::Database(_) => "A database error occurred".to_string(),
            Error::Io(_) => "An I/O error occurred".to_string(),
            Error::Config(_) => "The service is misconfigured".to_string(),

            Error::Http(e) => {
                if let Some(status) = e.status() {
                    format!("HTTP request failed with status {}", status.as_u16())
                } else if e.is_timeout() {
                    "HTTP request timed out".to_string()
                } else if e.is_connect() {
                    "Failed to connect to remote server".to_string()
                } else {
                    "HTTP request failed".to_string()
                }
            }

            Error::Yaml(_) => "Invalid YAML format".to_string(),
            Error::Json(_) => "Invalid JSON format".to_string(),

            other => other.to_string(),
        }
    }

    /// Render the `{ success: false, error, code, details? }` envelope.
    pub fn to_envelope(&self) -> serde_json::Value {
        let mut envelope = serde_json::json!({
            "success": false,
            "error": self.external_message(),
            "code": self.code(),
        });
        if let Error::Validation(errors) = self {
            envelope["details"] = serde_json::json!(errors);
        }
        envelope
    }
}

/// Error summary stored on a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl ErrorRecord {
    pub fn from_error(error: &Error, node_id: Option<&str>) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
            node_id: node_id.map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_envelope_includes_details() {
        let err = Error::Validation(vec!["a".into(), "b".into()]);
        let envelope = err.to_envelope();

        assert_eq!(envelope["success"], false);
        assert_eq!(envelope["code"], "VALIDATION_ERROR");
        assert_eq!(envelope["details"], serde_json::json!(["a", "b"]));
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn test_internal_errors_are_sanitized() {
        let err = Error::Storage("disk /var/lib/saler.db is full".into());
        assert!(!err.external_message().contains("/var/lib"));
        assert_eq!(err.http_status(), 500);
    }

    #[test]
    fn test_condition_errors_are_classified() {
        assert!(Error::ConditionEvaluation("x".into()).is_condition_error());
        assert!(Error::TypeMismatch {
            field: "score".into(),
            expected: "number".into(),
            found: "string".into(),
        }
        .is_condition_error());
        assert!(!Error::Timeout("x".into()).is_condition_error());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::action("a", "boom").is_retryable());
        assert!(Error::Timeout("slow".into()).is_retryable());
        assert!(!Error::Validation(vec![]).is_retryable());
        assert!(!Error::NoMatchingBranch { node_id: "c".into() }.is_retryable());
    }

    #[test]
    fn test_error_record() {
        let err = Error::NoMatchingBranch {
            node_id: "cond-1".into(),
        };
        let record = ErrorRecord::from_error(&err, Some("cond-1"));
        assert_eq!(record.code, "NO_MATCHING_BRANCH");
        assert_eq!(record.node_id.as_deref(), Some("cond-1"));
    }
}
