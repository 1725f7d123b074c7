//! # Task cluster layer
//!
//! Everything between the HTTP surface and the orchestration platform.
//!
//! ## Components
//!
//! - **Cluster Gateway** (`gateway`, `platform`): typed access to workload
//!   units, exposure units, nodes and logs
//! - **Resource Accountant** (`resources`): cluster-wide CPU/GPU capacity
//! - **Task Lifecycle Manager** (`lifecycle`, `task`, `locks`): create,
//!   resize, delete and list tasks
//! - **Deletion Waiter** (`waiter`): blocks until a unit is really gone
//! - **Credential Extractor** (`credentials`): access tokens from startup logs
//!
//! ```text
//!   HTTP handlers
//!        │
//!        ▼
//! ┌──────────────────┐   ┌─────────────────────┐
//! │ TaskLifecycle    │   │ ResourceAccountant  │
//! │ Manager          │   │                     │
//! └──────────────────┘   └─────────────────────┘
//!        │     DeletionWaiter      │
//!        ▼                         ▼
//! ┌─────────────────────────────────────────────┐
//! │ ClusterGateway (KubeGateway / MockGateway)  │
//! └─────────────────────────────────────────────┘
//! ```

pub mod credentials;
pub mod gateway;
pub mod lifecycle;
pub mod locks;
pub mod platform;
pub mod quantity;
pub mod resources;
pub mod task;
pub mod waiter;

pub use credentials::{extract_token, recover_token, CredentialError};
pub use gateway::{ClusterGateway, ExposureUnit, GatewayError, NodeCapacity, WorkloadUnit};
pub use lifecycle::{DeleteOutcome, LifecycleSettings, TaskError, TaskLifecycleManager};
pub use locks::TaskLocks;
pub use platform::{create_client, KubeGateway};
pub use quantity::{Quantity, QuantityError};
pub use resources::{CapacityReport, ClusterCapacity, LabelSelector, OperationStatus, ResourceAccountant};
pub use task::{CreatedTask, PendingResize, ResizePhase, TaskId, TaskRecord, TaskSpec};
pub use waiter::{DeletionWaiter, WaitError};

/// Port the task container listens on
pub const DEFAULT_INTERNAL_PORT: u16 = 8888;

/// Port of the exposure unit inside the cluster
pub const DEFAULT_SERVICE_PORT: u16 = 80;

/// Extended resource name GPUs are requested under
pub const DEFAULT_GPU_RESOURCE: &str = "nvidia.com/gpu";

/// Exposure-unit name is `<TaskID><EXPOSURE_SUFFIX>`
pub const EXPOSURE_SUFFIX: &str = "-service";

/// Label key linking a workload unit to its exposure unit
pub const APP_LABEL: &str = "app";
