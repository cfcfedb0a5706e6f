//! # Proxy Telemetry
//!
//! Logging and metrics for the MQTT proxy.
//!
//! ## Components
//!
//! - **Logging**: `tracing-subscriber` registry, pretty or JSON output
//! - **Metrics**: Prometheus counters in a private registry
//!
//! ## Usage
//!
//! ```rust,ignore
//! use proxy_telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(&TelemetryConfig::from_env())?;
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `MF_MQTT_ADAPTER_LOG_LEVEL` | `info` | Log level filter (`RUST_LOG` is the fallback) |
//! | `MF_MQTT_ADAPTER_JSON_LOGS` | `false` | JSON log lines |
//! | `MF_MQTT_ADAPTER_CONSOLE_OUTPUT` | `true` | Write logs to stdout |

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::{env_filter, init_logging};
pub use metrics::{encode_metrics, register_metrics, HistogramTimer};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize metrics and logging.
///
/// Returns a guard that should be held for the lifetime of the application.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    // Initialize metrics first so early log lines can already count
    register_metrics()?;
    init_logging(config)?;
    Ok(TelemetryGuard { _private: () })
}

/// Guard that keeps telemetry active.
pub struct TelemetryGuard {
    _private: (),
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("Shutting down telemetry...");
    }
}
