//! Tracing subscriber setup
//!
//! JSON structured logs filtered by `RUST_LOG`, with a plain-text variant for
//! interactive use.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter applied when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,keystone=debug,rustls=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A global subscriber is already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event
    #[default]
    Json,
    /// Human-readable text
    Text,
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup event (e.g., "keystone-agent")
    pub service_name: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "keystone".to_string(),
            format: LogFormat::default(),
        }
    }
}

/// Install the global tracing subscriber
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
    };
    result.map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    tracing::info!(service = %config.service_name, "telemetry initialized");
    Ok(())
}
