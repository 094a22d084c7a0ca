//! Tracing subscriber setup.
//!
//! The filter comes from `RUST_LOG` when set, then `logging.filter` from the
//! config file, then a default of `saler_flow=info`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{Error, Result};

const DEFAULT_FILTER: &str = "saler_flow=info";

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(std::env::var("RUST_LOG").ok().as_deref(), config)?;

    let fmt_layer = match config.format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(filter))
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to initialize tracing: {}", e)))
}

fn build_filter(rust_log: Option<&str>, config: &LoggingConfig) -> Result<EnvFilter> {
    let directive = rust_log
        .filter(|s| !s.trim().is_empty())
        .or(config.filter.as_deref())
        .unwrap_or(DEFAULT_FILTER);
    EnvFilter::try_new(directive)
        .map_err(|e| Error::Config(format!("Invalid log filter '{}': {}", directive, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_precedence() {
        let config = LoggingConfig {
            format: LogFormat::Text,
            filter: Some("saler_flow=debug".to_string()),
        };

        let filter = build_filter(Some("warn"), &config).unwrap();
        assert_eq!(filter.to_string(), "warn");

        let filter = build_filter(None, &config).unwrap();
        assert_eq!(filter.to_string(), "saler_flow=debug");

        let filter = build_filter(Some(""), &LoggingConfig::default()).unwrap();
        assert_eq!(filter.to_string(), DEFAULT_FILTER);
    }

    #[test]
    fn test_invalid_filter_is_config_error() {
        let config = LoggingConfig {
            format: LogFormat::Json,
            filter: Some("saler_flow=loudest".to_string()),
        };
        assert!(matches!(build_filter(None, &config), Err(Error::Config(_))));
    }
}
