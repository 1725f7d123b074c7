pub mod templates;

pub use templates::{select_template, TaskTemplate, VolumeTemplate};

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::{DEFAULT_GPU_RESOURCE, DEFAULT_INTERNAL_PORT, DEFAULT_SERVICE_PORT};

/// Default config file location: ~/.taskpod/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".taskpod")
        .join("config.yaml")
}

/// Errors for loading the service configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Timing of the delete-then-recreate resize
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_deletion_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DeletionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            timeout_secs: default_deletion_timeout_secs(),
        }
    }
}

impl DeletionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// The complete service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Namespace tasks are created in
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Kubeconfig path; inferred from the environment when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,

    #[serde(default = "default_bind_address")]
    pub bind_addr: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Host used when building external service URLs
    #[serde(default = "default_node_host")]
    pub node_host: String,

    /// Port the task container listens on
    #[serde(default = "default_internal_port")]
    pub internal_port: u16,

    /// Port of the exposure unit inside the cluster
    #[serde(default = "default_service_port")]
    pub service_port: u16,

    /// Extended resource name GPUs are requested under
    #[serde(default = "default_gpu_resource")]
    pub gpu_resource: String,

    #[serde(default)]
    pub deletion: DeletionConfig,

    #[serde(default = "default_log_read_timeout_secs")]
    pub log_read_timeout_secs: u64,

    /// Binary used for `port-forward` in the access flow
    #[serde(default = "default_port_forward_command")]
    pub port_forward_command: String,

    #[serde(default)]
    pub templates: Vec<TaskTemplate>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            kubeconfig: None,
            bind_addr: default_bind_address(),
            port: default_port(),
            node_host: default_node_host(),
            internal_port: default_internal_port(),
            service_port: default_service_port(),
            gpu_resource: default_gpu_resource(),
            deletion: DeletionConfig::default(),
            log_read_timeout_secs: default_log_read_timeout_secs(),
            port_forward_command: default_port_forward_command(),
            templates: Vec::new(),
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_node_host() -> String {
    "localhost".to_string()
}

fn default_internal_port() -> u16 {
    DEFAULT_INTERNAL_PORT
}

fn default_service_port() -> u16 {
    DEFAULT_SERVICE_PORT
}

fn default_gpu_resource() -> String {
    DEFAULT_GPU_RESOURCE.to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_deletion_timeout_secs() -> u64 {
    60
}

fn default_log_read_timeout_secs() -> u64 {
    10
}

fn default_port_forward_command() -> String {
    "kubectl".to_string()
}

impl ServiceConfig {
    pub fn log_read_timeout(&self) -> Duration {
        Duration::from_secs(self.log_read_timeout_secs)
    }

    /// Kubeconfig path with `~` and environment variables expanded
    pub fn kubeconfig_path(&self) -> Result<Option<PathBuf>, ConfigError> {
        self.kubeconfig
            .as_deref()
            .map(|raw| {
                shellexpand::full(raw)
                    .map(|p| PathBuf::from(p.into_owned()))
                    .map_err(|e| ConfigError::Invalid(format!("kubeconfig path: {}", e)))
            })
            .transpose()
    }

    /// Reject values that would only fail later at the platform
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::Invalid("namespace must not be empty".to_string()));
        }
        if self.deletion.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "deletion.pollIntervalMs must be positive".to_string(),
            ));
        }
        if self.deletion.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "deletion.timeoutSecs must be positive".to_string(),
            ));
        }
        if self.internal_port == 0 || self.service_port == 0 {
            return Err(ConfigError::Invalid("ports must be non-zero".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parse config from YAML string
pub fn parse_config(content: &str) -> Result<ServiceConfig, ConfigError> {
    if content.trim().is_empty() {
        return Ok(ServiceConfig::default());
    }
    let config: ServiceConfig =
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load and parse a config file from disk
pub fn load_config_file(path: &Path) -> Result<ServiceConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}
