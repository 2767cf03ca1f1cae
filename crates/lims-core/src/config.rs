//! Configuration for the LIMS instance engine
//!
//! Values come from defaults, then an optional YAML file named by
//! `LIMS_CONFIG`, then `LIMS_*` environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use tracing::{info, warn};

use lims_monitoring::MonitoringConfig;

use crate::domain::euid::{max_sequence, DEFAULT_SEQUENCE_WIDTH};
use crate::CoreError;

/// EUID allocation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EuidSettings {
    /// Zero-padded digits in the sequence part
    #[serde(default = "default_sequence_width")]
    pub sequence_width: usize,
}

impl Default for EuidSettings {
    fn default() -> Self {
        Self {
            sequence_width: default_sequence_width(),
        }
    }
}

/// Workflow state engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Cache derived states
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self { cache_enabled: true }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimsConfig {
    /// Template document loaded at startup
    #[serde(default)]
    pub templates_path: Option<String>,

    /// EUID allocation
    #[serde(default)]
    pub euid: EuidSettings,

    /// Workflow state engine
    #[serde(default)]
    pub workflow: WorkflowSettings,

    /// Require `expected_version` on attribute updates
    #[serde(default)]
    pub optimistic_concurrency: bool,

    /// Compare-and-swap attempts for last-writer-wins updates
    #[serde(default = "default_max_update_retries")]
    pub max_update_retries: u32,

    /// Log level filter
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// JSON logs on stdout
    #[serde(default)]
    pub json_logs: bool,

    /// PostgreSQL connection string for the persistent store
    #[serde(default)]
    pub database_url: Option<String>,
}

fn default_sequence_width() -> usize {
    DEFAULT_SEQUENCE_WIDTH
}

fn default_true() -> bool {
    true
}

fn default_max_update_retries() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LimsConfig {
    fn default() -> Self {
        Self {
            templates_path: None,
            euid: EuidSettings::default(),
            workflow: WorkflowSettings::default(),
            optimistic_concurrency: false,
            max_update_retries: default_max_update_retries(),
            log_level: default_log_level(),
            json_logs: false,
            database_url: None,
        }
    }
}

impl LimsConfig {
    /// Load configuration from an optional file and the environment
    pub fn load() -> Result<Self, CoreError> {
        let mut config = match env::var("LIMS_CONFIG") {
            Ok(path) => {
                info!(path = %path, "Loading configuration file");
                Self::from_file(&path)?
            }
            Err(_) => Self::default(),
        };

        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::ConfigurationError(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse YAML configuration
    pub fn from_yaml(yaml: &str) -> Result<Self, CoreError> {
        serde_yaml::from_str(yaml).map_err(|e| CoreError::ConfigurationError(e.to_string()))
    }

    /// Apply `LIMS_*` overrides; unparsable values are logged and ignored
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("LIMS_TEMPLATES_PATH") {
            self.templates_path = Some(path);
        }

        if let Some(width) = lookup("LIMS_EUID_SEQUENCE_WIDTH") {
            match width.parse::<usize>() {
                Ok(width) => self.euid.sequence_width = width,
                Err(_) => warn!("Invalid LIMS_EUID_SEQUENCE_WIDTH value: {}", width),
            }
        }

        if let Some(enabled) = lookup("LIMS_WORKFLOW_CACHE_ENABLED") {
            match parse_bool(&enabled) {
                Some(enabled) => self.workflow.cache_enabled = enabled,
                None => warn!("Invalid LIMS_WORKFLOW_CACHE_ENABLED value: {}", enabled),
            }
        }

        if let Some(enabled) = lookup("LIMS_OPTIMISTIC_CONCURRENCY") {
            match parse_bool(&enabled) {
                Some(enabled) => self.optimistic_concurrency = enabled,
                None => warn!("Invalid LIMS_OPTIMISTIC_CONCURRENCY value: {}", enabled),
            }
        }

        if let Some(retries) = lookup("LIMS_MAX_UPDATE_RETRIES") {
            match retries.parse::<u32>() {
                Ok(retries) => self.max_update_retries = retries,
                Err(_) => warn!("Invalid LIMS_MAX_UPDATE_RETRIES value: {}", retries),
            }
        }

        if let Some(level) = lookup("LIMS_LOG_LEVEL") {
            self.log_level = level;
        }

        if let Some(json) = lookup("LIMS_JSON_LOGS") {
            match parse_bool(&json) {
                Some(json) => self.json_logs = json,
                None => warn!("Invalid LIMS_JSON_LOGS value: {}", json),
            }
        }

        if let Some(url) = lookup("LIMS_DATABASE_URL") {
            self.database_url = Some(url);
        }
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), CoreError> {
        max_sequence(self.euid.sequence_width)?;
        if self.max_update_retries == 0 {
            return Err(CoreError::ConfigurationError(
                "max_update_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Logging settings derived from this configuration
    pub fn monitoring_config(&self) -> MonitoringConfig {
        MonitoringConfig {
            log_filter: self.log_level.clone(),
            enable_json_logging: self.json_logs,
            ..MonitoringConfig::default()
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
