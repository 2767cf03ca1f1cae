//! Logging and metrics for the LIMS instance engine.

use serde::{Deserialize, Serialize};
use tracing::info;

pub mod logging;
pub mod metrics;

/// Configuration for initializing logging and metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Service name attached to the startup log line
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Log level filter (e.g., "info,lims_core=debug"); `RUST_LOG` wins when set
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// JSON instead of pretty stdout logs
    #[serde(default)]
    pub enable_json_logging: bool,
    /// Optional log file, rotated daily, always JSON
    #[serde(default)]
    pub log_file: Option<String>,
    /// Install the metrics exporter (requires the `prometheus` feature)
    #[serde(default)]
    pub enable_metrics: bool,
}

fn default_service_name() -> String {
    "lims".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_filter: default_log_filter(),
            enable_json_logging: false,
            log_file: None,
            enable_metrics: false,
        }
    }
}

/// Initialize logging and, when enabled, the metrics exporter
pub fn init(config: &MonitoringConfig) -> anyhow::Result<()> {
    logging::init_logging(config)?;

    if config.enable_metrics {
        metrics::install_exporter()?;
    }

    info!(service_name = %config.service_name, metrics = config.enable_metrics, "Monitoring initialized");
    Ok(())
}

pub use crate::logging::LogExt;
pub use crate::metrics::LimsMetrics;
