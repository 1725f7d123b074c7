use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::config::ServiceConfig;

#[derive(Parser, Debug)]
#[command(name = "taskpod")]
#[command(about = "Run and resize GPU/CPU compute tasks on a Kubernetes cluster")]
#[command(version)]
pub struct Args {
    /// Path to the YAML config file (default: ~/.taskpod/config.yaml if present)
    #[arg(short, long, value_name = "FILE", env = "TASKPOD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Validate config and print the effective settings without serving
    #[arg(long)]
    pub dry_run: bool,

    /// Path to a .env file loaded before connecting to the cluster
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Kubeconfig to use instead of the inferred one
    #[arg(long, value_name = "FILE", env = "KUBECONFIG")]
    pub kubeconfig: Option<String>,

    /// Namespace tasks are created in
    #[arg(short, long, env = "TASKPOD_NAMESPACE")]
    pub namespace: Option<String>,

    /// Override the bind address
    #[arg(long, value_name = "ADDR", env = "TASKPOD_BIND_ADDR")]
    pub bind_addr: Option<String>,

    /// Override the listen port
    #[arg(short, long, value_name = "PORT", env = "TASKPOD_PORT")]
    pub port: Option<u16>,

    /// Host placed in returned service URLs
    #[arg(long, value_name = "HOST", env = "TASKPOD_NODE_HOST")]
    pub node_host: Option<String>,

    /// Seconds to wait for a resized task's old pod to disappear
    #[arg(long, value_name = "SECS")]
    pub deletion_timeout: Option<u64>,
}

impl Args {
    /// Command-line values take precedence over the config file.
    /// Pure function - returns the merged config.
    pub fn apply_overrides(&self, mut config: ServiceConfig) -> ServiceConfig {
        if let Some(kubeconfig) = &self.kubeconfig {
            config.kubeconfig = Some(kubeconfig.clone());
        }
        if let Some(namespace) = &self.namespace {
            config.namespace = namespace.clone();
        }
        if let Some(bind_addr) = &self.bind_addr {
            config.bind_addr = bind_addr.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(node_host) = &self.node_host {
            config.node_host = node_host.clone();
        }
        if let Some(secs) = self.deletion_timeout {
            config.deletion.timeout_secs = secs;
        }
        config
    }
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

/// Format the effective configuration for `--dry-run`.
/// Pure function - returns a formatted string.
pub fn format_dry_run(config: &ServiceConfig, source: Option<&std::path::Path>) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "taskpod v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));
    match source {
        Some(path) => output.push_str(&format!("Config: {}\n", path.display())),
        None => output.push_str("Config: built-in defaults\n"),
    }
    output.push_str(&format!(
        "Listen: {}:{}\n",
        config.bind_addr, config.port
    ));
    output.push_str(&format!("Namespace: {}\n", config.namespace));
    output.push_str(&format!(
        "Deletion wait: {}s (poll every {}ms)\n\n",
        config.deletion.timeout_secs, config.deletion.poll_interval_ms
    ));

    output.push_str(&format!("Templates ({}):\n", config.templates.len()));
    for template in &config.templates {
        let prefix = if template.image_prefix.is_empty() {
            "*"
        } else {
            template.image_prefix.as_str()
        };
        output.push_str(&format!(
            "  - {} [{}] restart={:?}\n",
            template.name, prefix, template.restart_policy
        ));
    }

    output
}
