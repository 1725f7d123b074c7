//! Notebook access: local port-forward plus token recovery

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::cluster::task::InvalidName;
use crate::cluster::{recover_token, ClusterGateway, CredentialError, TaskId};

#[derive(Error, Debug)]
pub enum AccessError {
    #[error("Invalid service name: {0}")]
    InvalidService(#[from] InvalidName),

    #[error("Failed to start port-forward: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessRequest {
    /// Local port to forward from
    pub port: u16,

    #[serde(rename = "serviceName")]
    pub service_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessResponse {
    pub url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Everything the access flow needs besides the gateway
#[derive(Debug, Clone)]
pub struct PortForward {
    pub command: String,
    pub namespace: String,
    pub service_port: u16,
    pub log_timeout: Duration,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Arguments for `<command> port-forward -n <ns> service/<name> <local>:<remote>`
pub fn port_forward_args(
    namespace: &str,
    service_name: &str,
    local_port: u16,
    service_port: u16,
) -> Vec<String> {
    vec![
        "port-forward".to_string(),
        "-n".to_string(),
        namespace.to_string(),
        format!("service/{}", service_name),
        format!("{}:{}", local_port, service_port),
    ]
}

/// Local URL, carrying the token when one was found
pub fn access_url(local_port: u16, token: &str) -> String {
    if token.is_empty() {
        format!("http://localhost:{}", local_port)
    } else {
        format!("http://localhost:{}/?token={}", local_port, token)
    }
}

// ============================================================================
// SBIO: I/O wrapper
// ============================================================================

/// Start the port-forward without waiting for it; its exit is only logged
fn spawn_port_forward(command: &str, args: &[String]) -> Result<(), AccessError> {
    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(AccessError::Spawn)?;

    let description = format!("{} {}", command, args.join(" "));
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if status.success() => debug!(command = %description, "Port-forward exited"),
            Ok(status) => warn!(command = %description, %status, "Port-forward exited with failure"),
            Err(e) => warn!(command = %description, error = %e, "Port-forward wait failed"),
        }
    });
    Ok(())
}

/// Forward `request.port` to the task's exposure unit and recover its token.
///
/// The TaskID is the service name minus its exposure suffix. A missing token
/// is not an error: the URL is returned bare.
pub async fn open_access(
    gateway: &dyn ClusterGateway,
    forward: &PortForward,
    request: &AccessRequest,
) -> Result<AccessResponse, AccessError> {
    let task_id = TaskId::from_exposure_name(&request.service_name)?;

    let args = port_forward_args(
        &forward.namespace,
        &task_id.exposure_name(),
        request.port,
        forward.service_port,
    );
    spawn_port_forward(&forward.command, &args)?;
    info!(task = %task_id, local_port = request.port, "Port-forward started");

    let token = recover_token(gateway, task_id.as_str(), forward.log_timeout).await?;
    Ok(AccessResponse {
        url: access_url(request.port, &token),
        token: (!token.is_empty()).then_some(token),
    })
}
