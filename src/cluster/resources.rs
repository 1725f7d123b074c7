//! Shared resource types and cluster-wide capacity accounting

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::gateway::{ClusterGateway, GatewayError, NodeCapacity, WorkloadUnit};
use super::quantity::Quantity;

/// Label selector for filtering resources
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    /// Match exact labels
    #[serde(rename = "matchLabels")]
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Check if labels match this selector
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Render as a platform label query, e.g. `app=my-task,tier=gpu`
    pub fn to_query(&self) -> String {
        self.match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Status of an operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStatus {
    /// Success or failure
    pub success: bool,

    /// Status message
    pub message: String,

    /// Details (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl OperationStatus {
    /// Create success status
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            details: None,
        }
    }

    /// Create failure status
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            details: None,
        }
    }

    /// Add details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

// ============================================================================
// Capacity accounting
// ============================================================================

/// Cluster-wide CPU/GPU bookkeeping, derived at query time and never cached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterCapacity {
    pub allocatable_cpu: Quantity,
    pub allocatable_gpu: Quantity,
    pub used_cpu: Quantity,
    pub used_gpu: Quantity,
}

impl ClusterCapacity {
    /// Free CPU; negative when the cluster is over-committed
    pub fn free_cpu(&self) -> Quantity {
        self.allocatable_cpu - self.used_cpu
    }

    /// Free GPU; negative when the cluster is over-committed
    pub fn free_gpu(&self) -> Quantity {
        self.allocatable_gpu - self.used_gpu
    }

    /// Field-wise sum
    pub fn combine(self, other: ClusterCapacity) -> ClusterCapacity {
        ClusterCapacity {
            allocatable_cpu: self.allocatable_cpu + other.allocatable_cpu,
            allocatable_gpu: self.allocatable_gpu + other.allocatable_gpu,
            used_cpu: self.used_cpu + other.used_cpu,
            used_gpu: self.used_gpu + other.used_gpu,
        }
    }

    pub fn report(&self) -> CapacityReport {
        CapacityReport {
            free_gpus: self.free_gpu().whole_units(),
            total_allocatable_gpus: self.allocatable_gpu.whole_units(),
            total_used_gpus: self.used_gpu.whole_units(),
            free_cpus: self.free_cpu().as_f64(),
            total_allocatable_cpus: self.allocatable_cpu.as_f64(),
            total_used_cpus: self.used_cpu.as_f64(),
        }
    }
}

/// Wire shape of a capacity query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityReport {
    #[serde(rename = "freeGPUs")]
    pub free_gpus: i64,
    #[serde(rename = "totalAllocatableGPUs")]
    pub total_allocatable_gpus: i64,
    #[serde(rename = "totalUsedGPUs")]
    pub total_used_gpus: i64,
    #[serde(rename = "freeCPUs")]
    pub free_cpus: f64,
    #[serde(rename = "totalAllocatableCPUs")]
    pub total_allocatable_cpus: f64,
    #[serde(rename = "totalUsedCPUs")]
    pub total_used_cpus: f64,
}

/// Sum allocatable capacity over nodes and requests over live workload units.
/// Pure function - terminated units hold no resources and are skipped.
pub fn tally(nodes: &[NodeCapacity], units: &[WorkloadUnit]) -> ClusterCapacity {
    let allocatable_cpu = nodes.iter().map(|n| n.allocatable.cpu).sum();
    let allocatable_gpu = nodes.iter().map(|n| n.allocatable.gpu).sum();

    let live = || units.iter().filter(|u| !u.is_terminated());
    let used_cpu = live().map(|u| u.requested().cpu).sum();
    let used_gpu = live().map(|u| u.requested().gpu).sum();

    ClusterCapacity {
        allocatable_cpu,
        allocatable_gpu,
        used_cpu,
        used_gpu,
    }
}

/// Computes allocatable vs. used CPU/GPU from live cluster state
#[derive(Clone)]
pub struct ResourceAccountant {
    gateway: Arc<dyn ClusterGateway>,
}

impl ResourceAccountant {
    pub fn new(gateway: Arc<dyn ClusterGateway>) -> Self {
        Self { gateway }
    }

    /// Two full-cluster queries per call; read-only
    pub async fn compute_capacity(&self) -> Result<ClusterCapacity, GatewayError> {
        let nodes = self.gateway.list_nodes().await?;
        let units = self.gateway.list_running_workload_units().await?;
        let capacity = tally(&nodes, &units);
        debug!(
            nodes = nodes.len(),
            units = units.len(),
            free_cpu = %capacity.free_cpu(),
            free_gpu = %capacity.free_gpu(),
            "Computed cluster capacity"
        );
        Ok(capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::gateway::mock::MockGateway;
    use crate::cluster::gateway::{Container, ContainerResources, ResourceAmounts, RestartPolicy};

    fn unit(name: &str, cpu: &str, gpu: &str, phase: &str) -> WorkloadUnit {
        WorkloadUnit {
            name: name.to_string(),
            namespace: Some("kube-system".to_string()),
            labels: BTreeMap::new(),
            containers: vec![Container {
                name: name.to_string(),
                image: "busybox".to_string(),
                command: None,
                port: None,
                resources: ContainerResources::guaranteed(ResourceAmounts::new(
                    cpu.parse().unwrap(),
                    gpu.parse().unwrap(),
                )),
                volume_mounts: vec![],
            }],
            restart_policy: RestartPolicy::Always,
            phase: Some(phase.to_string()),
        }
    }

    fn node(name: &str, cpu: &str, gpu: &str) -> NodeCapacity {
        NodeCapacity::new(name, cpu.parse().unwrap(), gpu.parse().unwrap())
    }

    fn app_selector(value: &str) -> LabelSelector {
        let mut match_labels = BTreeMap::new();
        match_labels.insert("app".to_string(), value.to_string());
        LabelSelector { match_labels }
    }

    #[test]
    fn test_label_selector_matches() {
        let selector = app_selector("my-task");

        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "my-task".to_string());
        labels.insert("tier".to_string(), "gpu".to_string());

        assert!(selector.matches(&labels));
        assert_eq!(selector.to_query(), "app=my-task");
    }

    #[test]
    fn test_label_selector_no_match() {
        let selector = app_selector("my-task");

        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "other".to_string());

        assert!(!selector.matches(&labels));
    }

    #[test]
    fn test_operation_status() {
        let success = OperationStatus::success("Task deleted");
        assert!(success.success);

        let failure = OperationStatus::failure("Task not found");
        assert!(!failure.success);
    }

    #[test]
    fn test_tally_sums_nodes_and_units() {
        let nodes = vec![node("a", "4", "2"), node("b", "3900m", "0")];
        let units = vec![unit("x", "1", "1", "Running"), unit("y", "500m", "0", "Pending")];

        let capacity = tally(&nodes, &units);
        assert_eq!(capacity.allocatable_cpu.millis(), 7900);
        assert_eq!(capacity.allocatable_gpu, Quantity::from_units(2));
        assert_eq!(capacity.used_cpu.millis(), 1500);
        assert_eq!(capacity.free_gpu(), Quantity::from_units(1));
    }

    #[test]
    fn test_tally_skips_terminated_units() {
        let nodes = vec![node("a", "4", "1")];
        let units = vec![unit("done", "2", "1", "Succeeded")];
        let capacity = tally(&nodes, &units);
        assert_eq!(capacity.used_cpu, Quantity::ZERO);
        assert_eq!(capacity.used_gpu, Quantity::ZERO);
    }

    #[test]
    fn test_over_commitment_reports_negative_free() {
        let nodes = vec![node("a", "2", "1")];
        let units = vec![unit("x", "3", "2", "Running")];
        let report = tally(&nodes, &units).report();
        assert_eq!(report.free_gpus, -1);
        assert_eq!(report.free_cpus, -1.0);
    }

    #[test]
    fn test_tally_is_additive_over_partitions() {
        let node_a = node("a", "8", "4");
        let node_b = node("b", "2500m", "1");
        let units_a = vec![unit("x", "2", "1", "Running"), unit("y", "250m", "0", "Running")];
        let units_b = vec![unit("z", "1", "1", "Running")];

        let whole = tally(
            &[node_a.clone(), node_b.clone()],
            &[units_a.clone(), units_b.clone()].concat(),
        );
        let parts = tally(&[node_a.clone()], &units_a).combine(tally(&[node_b.clone()], &units_b));
        assert_eq!(whole, parts);

        // order of nodes and units does not matter
        let reversed = tally(
            &[node_b, node_a],
            &[units_b, units_a].concat(),
        );
        assert_eq!(whole, reversed);
    }

    #[test]
    fn test_tally_of_largest_requests_does_not_overflow() {
        let nodes = vec![node("a", "1000000000", "1000000000")];
        let units = vec![
            unit("x", "1000000000", "1000000000", "Running"),
            unit("y", "1000000000", "1000000000", "Running"),
        ];
        let capacity = tally(&nodes, &units);
        assert_eq!(capacity.used_cpu.millis(), 2 * Quantity::MAX.millis());
        assert_eq!(capacity.free_gpu(), Quantity::ZERO - Quantity::MAX);
        assert_eq!(capacity.report().free_gpus, -1_000_000_000);
    }

    #[test]
    fn test_report_field_names() {
        let report = tally(&[node("a", "4", "2")], &[]).report();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["freeGPUs"], 2);
        assert_eq!(json["totalAllocatableCPUs"], 4.0);
        assert_eq!(json["totalUsedCPUs"], 0.0);
    }

    #[tokio::test]
    async fn test_compute_capacity_includes_foreign_units() {
        let gateway = MockGateway::new()
            .with_node("gpu-node", "16", "4")
            .with_foreign_unit(unit("coredns", "100m", "0", "Running"));
        let accountant = ResourceAccountant::new(Arc::new(gateway));

        let capacity = accountant.compute_capacity().await.unwrap();
        assert_eq!(capacity.used_cpu.millis(), 100);
        assert_eq!(capacity.free_gpu(), Quantity::from_units(4));
    }
}
