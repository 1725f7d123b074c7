//! Task Lifecycle Manager - create, resize, delete and list tasks
//!
//! A task is a pair of cluster objects sharing one TaskID:
//! - a workload unit named `<id>` labelled `app=<id>`
//! - an exposure unit named `<id>-service` selecting `app=<id>`
//!
//! The workload unit is created first and the exposure unit second, with no
//! rollback in between: a unit without an exposure is a valid, observable
//! state (List reports it with no node port). Resize replaces the workload
//! unit through delete-then-recreate, since the platform cannot change the
//! resources of a running unit; the exposure unit reattaches by selector.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::try_join_all;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::gateway::{
    ClusterGateway, Container, ContainerResources, ExposureUnit, GatewayError, ObjectKind,
    ResourceAmounts, WorkloadUnit,
};
use super::locks::TaskLocks;
use super::quantity::Quantity;
use super::task::{
    CreatedTask, InvalidName, PendingResize, ResizePhase, TaskId, TaskRecord, TaskSpec,
};
use super::waiter::{DeletionWaiter, WaitError};
use super::{APP_LABEL, DEFAULT_INTERNAL_PORT, DEFAULT_SERVICE_PORT};
use crate::config::{select_template, ServiceConfig, TaskTemplate};

/// Errors from task lifecycle operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Invalid task name: {0}")]
    InvalidName(#[from] InvalidName),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task '{0}' not found")]
    NotFound(String),

    #[error("Task '{0}' already exists")]
    AlreadyExists(String),

    #[error("Timed out after {waited:?} waiting for the old workload unit of '{task}' to be deleted (resize left in phase {phase})")]
    DeletionTimeout {
        task: String,
        waited: std::time::Duration,
        phase: ResizePhase,
    },

    #[error("Resize of '{0}' was cancelled")]
    Cancelled(String),

    #[error(transparent)]
    Platform(GatewayError),
}

impl TaskError {
    fn from_gateway(task: &TaskId, err: GatewayError) -> Self {
        match err {
            GatewayError::NotFound { .. } => TaskError::NotFound(task.to_string()),
            GatewayError::AlreadyExists { .. } => TaskError::AlreadyExists(task.to_string()),
            other => TaskError::Platform(other),
        }
    }
}

/// What a delete actually removed; absent objects are not errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub task_id: TaskId,
    pub controller_removed: bool,
    pub workload_unit_removed: bool,
    pub exposure_unit_removed: bool,
}

/// Settings the lifecycle manager needs from the service configuration
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub internal_port: u16,
    pub service_port: u16,
    /// Host used in returned service URLs
    pub node_host: String,
    pub templates: Vec<TaskTemplate>,
    pub waiter: DeletionWaiter,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            internal_port: DEFAULT_INTERNAL_PORT,
            service_port: DEFAULT_SERVICE_PORT,
            node_host: "localhost".to_string(),
            templates: Vec::new(),
            waiter: DeletionWaiter::default(),
        }
    }
}

impl From<&ServiceConfig> for LifecycleSettings {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            internal_port: config.internal_port,
            service_port: config.service_port,
            node_host: config.node_host.clone(),
            templates: config.templates.clone(),
            waiter: DeletionWaiter::new(
                config.deletion.poll_interval(),
                config.deletion.timeout(),
            ),
        }
    }
}

/// A resize that has started and not yet completed
#[derive(Debug, Clone)]
struct InFlightResize {
    pending: PendingResize,
    image: String,
}

// ============================================================================
// SBIO: Pure object builders (no I/O)
// ============================================================================

/// Build the workload unit for a new task
pub fn workload_unit_for(
    id: &TaskId,
    spec: &TaskSpec,
    template: &TaskTemplate,
    internal_port: u16,
) -> WorkloadUnit {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_string(), id.to_string());

    WorkloadUnit {
        name: id.to_string(),
        namespace: None,
        labels,
        containers: vec![Container {
            name: id.to_string(),
            image: spec.image.clone(),
            command: template.command.clone(),
            port: Some(internal_port),
            resources: ContainerResources::guaranteed(ResourceAmounts::new(
                spec.cpu_request,
                spec.gpu_request,
            )),
            volume_mounts: template.volume_mount(id.as_str()).into_iter().collect(),
        }],
        restart_policy: template.restart_policy,
        phase: None,
    }
}

/// Build the exposure unit fronting a task; the external port is left to the platform
pub fn exposure_unit_for(id: &TaskId, service_port: u16, internal_port: u16) -> ExposureUnit {
    let mut selector = BTreeMap::new();
    selector.insert(APP_LABEL.to_string(), id.to_string());

    ExposureUnit {
        name: id.exposure_name(),
        selector,
        port: service_port,
        target_port: internal_port,
        node_port: None,
    }
}

fn validate_resources(cpu: Quantity, gpu: Quantity) -> Result<(), TaskError> {
    if !gpu.is_whole() {
        return Err(TaskError::Validation(format!(
            "GPU count must be a whole number, got {}",
            gpu
        )));
    }
    if cpu.is_zero() {
        return Err(TaskError::Validation(
            "CPU request must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

// ============================================================================
// Lifecycle manager
// ============================================================================

/// Owns the create / resize / delete / list transitions of tasks
#[derive(Clone)]
pub struct TaskLifecycleManager {
    gateway: Arc<dyn ClusterGateway>,
    settings: Arc<LifecycleSettings>,
    locks: TaskLocks,
    resizes: Arc<DashMap<TaskId, InFlightResize>>,
}

impl TaskLifecycleManager {
    pub fn new(gateway: Arc<dyn ClusterGateway>, settings: LifecycleSettings) -> Self {
        Self {
            gateway,
            settings: Arc::new(settings),
            locks: TaskLocks::new(),
            resizes: Arc::new(DashMap::new()),
        }
    }

    pub fn gateway(&self) -> &Arc<dyn ClusterGateway> {
        &self.gateway
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Create the workload unit and then the exposure unit of a new task
    pub async fn create(&self, spec: &TaskSpec) -> Result<CreatedTask, TaskError> {
        let id = TaskId::parse(&spec.name)?;
        if spec.image.trim().is_empty() {
            return Err(TaskError::Validation("image name is required".to_string()));
        }
        validate_resources(spec.cpu_request, spec.gpu_request)?;

        let _guard = self.locks.acquire(id.as_str()).await;

        let template = select_template(&self.settings.templates, &spec.image);
        let unit = workload_unit_for(&id, spec, &template, self.settings.internal_port);

        info!(
            task = %id,
            image = %spec.image,
            cpu = %spec.cpu_request,
            gpu = %spec.gpu_request,
            template = %template.name,
            "Creating workload unit"
        );
        self.gateway
            .create_workload_unit(&unit)
            .await
            .map_err(|e| TaskError::from_gateway(&id, e))?;

        let exposure =
            exposure_unit_for(&id, self.settings.service_port, self.settings.internal_port);
        let created = match self.gateway.create_exposure_unit(&exposure).await {
            Ok(created) => created,
            Err(e) => {
                warn!(
                    task = %id,
                    error = %e,
                    "Exposure unit creation failed; workload unit left running without one"
                );
                return Err(TaskError::from_gateway(&id, e));
            }
        };

        let node_port = created.node_port.ok_or_else(|| {
            TaskError::Platform(GatewayError::Platform(format!(
                "no external port assigned to '{}'",
                created.name
            )))
        })?;

        info!(task = %id, node_port, "Task created");
        Ok(CreatedTask {
            service_url: format!("http://{}:{}", self.settings.node_host, node_port),
            task_id: id,
            node_port,
        })
    }

    /// Replace a task's workload unit with one carrying new CPU/GPU amounts.
    ///
    /// Walks `Resizing -> WaitingForDeletion -> Recreating`. A failure leaves
    /// the phase it stopped in visible through List as `pendingResize`;
    /// nothing is reconciled automatically.
    pub async fn resize(
        &self,
        name: &str,
        cpu: Quantity,
        gpu: Quantity,
        cancel: &CancellationToken,
    ) -> Result<TaskId, TaskError> {
        let id = TaskId::parse(name)?;
        validate_resources(cpu, gpu)?;

        let _guard = self.locks.acquire(id.as_str()).await;

        let mut unit = match self.gateway.get_workload_unit(id.as_str()).await {
            Ok(unit) => unit,
            Err(e) if e.is_not_found() => return Err(TaskError::NotFound(id.to_string())),
            Err(e) => return Err(TaskError::Platform(e)),
        };

        let image = unit
            .primary_container()
            .map(|c| c.image.clone())
            .unwrap_or_default();
        self.enter_phase(&id, ResizePhase::Resizing, cpu, gpu, &image);
        unit.set_resources(ResourceAmounts::new(cpu, gpu));
        let replacement = unit.as_submission();

        self.enter_phase(&id, ResizePhase::WaitingForDeletion, cpu, gpu, &image);
        match self.gateway.delete_workload_unit(id.as_str()).await {
            Ok(()) => debug!(task = %id, "Old workload unit deletion requested"),
            Err(e) if e.is_not_found() => debug!(task = %id, "Old workload unit already gone"),
            Err(e) => {
                // old unit untouched, nothing to inspect
                self.resizes.remove(&id);
                return Err(TaskError::Platform(e));
            }
        }

        if let Err(e) = self
            .settings
            .waiter
            .await_deletion(self.gateway.as_ref(), id.as_str(), cancel)
            .await
        {
            warn!(task = %id, error = %e, "Resize stopped while waiting for deletion");
            return Err(match e {
                WaitError::Timeout { waited, .. } => TaskError::DeletionTimeout {
                    task: id.to_string(),
                    waited,
                    phase: ResizePhase::WaitingForDeletion,
                },
                WaitError::Cancelled(_) => TaskError::Cancelled(id.to_string()),
                WaitError::Platform(e) => TaskError::Platform(e),
            });
        }

        self.enter_phase(&id, ResizePhase::Recreating, cpu, gpu, &image);
        self.gateway
            .create_workload_unit(&replacement)
            .await
            .map_err(|e| {
                warn!(task = %id, error = %e, "Recreating workload unit failed");
                TaskError::from_gateway(&id, e)
            })?;

        self.resizes.remove(&id);
        info!(task = %id, cpu = %cpu, gpu = %gpu, "Task resized");
        Ok(id)
    }

    /// Remove the managing controller, the workload unit and the exposure unit.
    ///
    /// Absent objects count as deleted, so repeating a delete succeeds. Any
    /// other failure stops the remaining steps.
    pub async fn delete(&self, name: &str) -> Result<DeleteOutcome, TaskError> {
        let id = TaskId::parse(name)?;
        let _guard = self.locks.acquire(id.as_str()).await;

        let controller_removed = Self::removed(
            &id,
            ObjectKind::WorkloadController,
            self.gateway.delete_workload_controller(id.as_str()).await,
        )?;
        let workload_unit_removed = Self::removed(
            &id,
            ObjectKind::WorkloadUnit,
            self.gateway.delete_workload_unit(id.as_str()).await,
        )?;
        let exposure_unit_removed = Self::removed(
            &id,
            ObjectKind::ExposureUnit,
            self.gateway.delete_exposure_unit(&id.exposure_name()).await,
        )?;

        self.resizes.remove(&id);
        info!(
            task = %id,
            controller_removed,
            workload_unit_removed,
            exposure_unit_removed,
            "Task deleted"
        );

        Ok(DeleteOutcome {
            task_id: id,
            controller_removed,
            workload_unit_removed,
            exposure_unit_removed,
        })
    }

    fn removed(
        id: &TaskId,
        kind: ObjectKind,
        result: Result<(), GatewayError>,
    ) -> Result<bool, TaskError> {
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => {
                debug!(task = %id, %kind, "Nothing to delete");
                Ok(false)
            }
            Err(e) => Err(TaskError::Platform(e)),
        }
    }

    /// Every workload unit joined to its exposure unit by name
    pub async fn list(&self) -> Result<Vec<TaskRecord>, TaskError> {
        let units = self
            .gateway
            .list_workload_units(None)
            .await
            .map_err(TaskError::Platform)?;

        let mut records = try_join_all(units.iter().map(|unit| self.record_for(unit))).await?;

        // Resizes whose old unit is gone but whose replacement never arrived
        let orphaned: Vec<(TaskId, InFlightResize)> = self
            .resizes
            .iter()
            .filter(|entry| !records.iter().any(|r| r.name == entry.key().as_str()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (id, resize) in orphaned {
            let node_port = self.node_port(&id.exposure_name()).await?;
            records.push(TaskRecord {
                name: id.to_string(),
                image: resize.image,
                cpus: resize.pending.target_cpu,
                gpus: resize.pending.target_gpu,
                node_port,
                phase: None,
                pending_resize: Some(resize.pending),
            });
        }

        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Bare task names, for pickers that only need identifiers
    pub async fn task_names(&self) -> Result<Vec<String>, TaskError> {
        let mut names: Vec<String> = self
            .gateway
            .list_workload_units(None)
            .await
            .map_err(TaskError::Platform)?
            .into_iter()
            .map(|u| u.name)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn record_for(&self, unit: &WorkloadUnit) -> Result<TaskRecord, TaskError> {
        let exposure_name = format!("{}{}", unit.name, super::EXPOSURE_SUFFIX);
        let node_port = self.node_port(&exposure_name).await?;
        let requested = unit.requested();
        let pending_resize = TaskId::parse(&unit.name)
            .ok()
            .and_then(|id| self.resizes.get(&id).map(|r| r.pending.clone()));

        Ok(TaskRecord {
            name: unit.name.clone(),
            image: unit
                .primary_container()
                .map(|c| c.image.clone())
                .unwrap_or_default(),
            cpus: requested.cpu,
            gpus: requested.gpu,
            node_port,
            phase: unit.phase.clone(),
            pending_resize,
        })
    }

    async fn node_port(&self, exposure_name: &str) -> Result<Option<u16>, TaskError> {
        match self.gateway.get_exposure_unit(exposure_name).await {
            Ok(exposure) => Ok(exposure.node_port),
            Err(e) if e.is_not_found() => {
                debug!(exposure = exposure_name, "No exposure unit for workload unit");
                Ok(None)
            }
            Err(e) => Err(TaskError::Platform(e)),
        }
    }

    fn enter_phase(&self, id: &TaskId, phase: ResizePhase, cpu: Quantity, gpu: Quantity, image: &str) {
        debug!(task = %id, %phase, "Resize phase");
        let started_at = self
            .resizes
            .get(id)
            .map(|r| r.pending.started_at)
            .unwrap_or_else(Utc::now);
        self.resizes.insert(
            id.clone(),
            InFlightResize {
                pending: PendingResize {
                    phase,
                    target_cpu: cpu,
                    target_gpu: gpu,
                    started_at,
                },
                image: image.to_string(),
            },
        );
    }
}
