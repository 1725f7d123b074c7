//! Cluster Gateway - the only path from task logic to the orchestration platform
//!
//! The gateway speaks in platform-neutral terms: a *workload unit* is the
//! running container instance of a task and an *exposure unit* is the network
//! object that makes it reachable. Calls block the caller until the platform
//! answers; the gateway never buffers or retries.

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::AsyncBufRead;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::quantity::Quantity;
use super::resources::LabelSelector;

/// Errors surfaced by a gateway implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: ObjectKind, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: ObjectKind, name: String },

    #[error("Platform error: {0}")]
    Platform(String),
}

impl GatewayError {
    pub fn not_found(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Kinds of objects the gateway manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    WorkloadUnit,
    WorkloadController,
    ExposureUnit,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ObjectKind::WorkloadUnit => "workload unit",
            ObjectKind::WorkloadController => "workload controller",
            ObjectKind::ExposureUnit => "exposure unit",
        };
        f.write_str(name)
    }
}

/// A drained-on-demand log stream
pub type LogStream = Pin<Box<dyn AsyncBufRead + Send>>;

// ============================================================================
// Platform-neutral object model
// ============================================================================

/// Restart behaviour of a workload unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
    #[default]
    Always,
    Never,
}

/// CPU/GPU amounts for a container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAmounts {
    pub cpu: Quantity,
    /// Absent GPU keys are read back as zero
    pub gpu: Quantity,
}

impl ResourceAmounts {
    pub fn new(cpu: Quantity, gpu: Quantity) -> Self {
        Self { cpu, gpu }
    }
}

/// Requests and limits of a container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerResources {
    pub requests: ResourceAmounts,
    pub limits: ResourceAmounts,
}

impl ContainerResources {
    /// Requests equal to limits: no burst allowance
    pub fn guaranteed(amounts: ResourceAmounts) -> Self {
        Self {
            requests: amounts,
            limits: amounts,
        }
    }
}

/// Persistent storage mounted into a workload unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Volume name inside the unit
    pub name: String,
    /// Persistent volume claim backing the volume
    pub claim_name: String,
    /// Path inside the container
    pub mount_path: String,
}

/// One container of a workload unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub resources: ContainerResources,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

/// The runtime container instance of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadUnit {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub containers: Vec<Container>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// Platform-reported phase, e.g. "Pending", "Running", "Succeeded"
    #[serde(default)]
    pub phase: Option<String>,
}

impl WorkloadUnit {
    /// The first container, which carries the task image
    pub fn primary_container(&self) -> Option<&Container> {
        self.containers.first()
    }

    /// Whether the unit has terminated and no longer holds resources
    pub fn is_terminated(&self) -> bool {
        matches!(self.phase.as_deref(), Some("Succeeded") | Some("Failed"))
    }

    /// Sum of requested resources across every container
    pub fn requested(&self) -> ResourceAmounts {
        ResourceAmounts {
            cpu: self.containers.iter().map(|c| c.resources.requests.cpu).sum(),
            gpu: self.containers.iter().map(|c| c.resources.requests.gpu).sum(),
        }
    }

    /// Replace requests and limits on every container
    pub fn set_resources(&mut self, amounts: ResourceAmounts) {
        for container in &mut self.containers {
            container.resources = ContainerResources::guaranteed(amounts);
        }
    }

    /// Copy suitable for re-submission: platform-owned status is dropped
    pub fn as_submission(&self) -> WorkloadUnit {
        WorkloadUnit {
            phase: None,
            ..self.clone()
        }
    }
}

/// Network front for a workload unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureUnit {
    pub name: String,
    /// Labels a workload unit must carry to receive traffic
    pub selector: BTreeMap<String, String>,
    /// Port the exposure unit listens on inside the cluster
    pub port: u16,
    /// Port on the workload unit that traffic is forwarded to
    pub target_port: u16,
    /// Externally reachable port, assigned by the platform
    #[serde(default)]
    pub node_port: Option<u16>,
}

/// Allocatable resources of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub name: String,
    pub allocatable: ResourceAmounts,
}

impl NodeCapacity {
    pub fn new(name: impl Into<String>, cpu: Quantity, gpu: Quantity) -> Self {
        Self {
            name: name.into(),
            allocatable: ResourceAmounts::new(cpu, gpu),
        }
    }
}

// ============================================================================
// SBIO: Trait for abstraction (allows test doubles)
// ============================================================================

#[async_trait]
pub trait ClusterGateway: Send + Sync {
    async fn create_workload_unit(&self, unit: &WorkloadUnit)
        -> Result<WorkloadUnit, GatewayError>;

    async fn get_workload_unit(&self, name: &str) -> Result<WorkloadUnit, GatewayError>;

    /// Units in the task namespace, optionally filtered by labels
    async fn list_workload_units(
        &self,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<WorkloadUnit>, GatewayError>;

    /// Units across every namespace, for capacity accounting
    async fn list_running_workload_units(&self) -> Result<Vec<WorkloadUnit>, GatewayError>;

    async fn delete_workload_unit(&self, name: &str) -> Result<(), GatewayError>;

    /// Delete a higher-level object managing units of this name, if any
    async fn delete_workload_controller(&self, name: &str) -> Result<(), GatewayError>;

    async fn create_exposure_unit(&self, unit: &ExposureUnit)
        -> Result<ExposureUnit, GatewayError>;

    async fn get_exposure_unit(&self, name: &str) -> Result<ExposureUnit, GatewayError>;

    async fn delete_exposure_unit(&self, name: &str) -> Result<(), GatewayError>;

    async fn list_nodes(&self) -> Result<Vec<NodeCapacity>, GatewayError>;

    async fn stream_logs(&self, workload_unit: &str) -> Result<LogStream, GatewayError>;
}

// ============================================================================
// SBIO: In-memory implementation for testing (no I/O)
// ============================================================================
