//! Kubernetes implementation of the Cluster Gateway
//!
//! Workload units are Pods, exposure units are NodePort Services and the
//! workload controller is a Deployment of the same name. Nodes report their
//! allocatable CPU and GPU amounts.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    Container as PodContainer, ContainerPort, Node, PersistentVolumeClaimVolumeSource, Pod,
    PodSpec, ResourceRequirements, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount as PodVolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as PlatformQuantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info};

use super::gateway::{
    ClusterGateway, Container, ContainerResources, ExposureUnit, GatewayError, LogStream,
    NodeCapacity, ObjectKind, ResourceAmounts, RestartPolicy, VolumeMount, WorkloadUnit,
};
use super::quantity::Quantity;
use super::resources::LabelSelector;

/// Default connection timeout for API server calls
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default read timeout for API server calls
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Field selector excluding pods that no longer hold resources
const ACTIVE_POD_SELECTOR: &str = "status.phase!=Succeeded,status.phase!=Failed";

/// Create a client from an explicit kubeconfig, or infer one from the
/// environment (in-cluster service account or `~/.kube/config`).
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, GatewayError> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                GatewayError::Platform(format!(
                    "failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| GatewayError::Platform(format!("failed to load kubeconfig: {}", e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| GatewayError::Platform(format!("failed to infer config: {}", e)))?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

    Client::try_from(config)
        .map_err(|e| GatewayError::Platform(format!("failed to create client: {}", e)))
}

fn map_error(err: kube::Error, kind: ObjectKind, name: &str) -> GatewayError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => GatewayError::not_found(kind, name),
        kube::Error::Api(ae) if ae.code == 409 => GatewayError::AlreadyExists {
            kind,
            name: name.to_string(),
        },
        other => GatewayError::Platform(format!("{} '{}': {}", kind, name, other)),
    }
}

fn list_error(err: kube::Error, what: &str) -> GatewayError {
    GatewayError::Platform(format!("listing {}: {}", what, err))
}

// ============================================================================
// SBIO: Pure conversions (no I/O)
// ============================================================================

fn amounts_to_map(
    amounts: ResourceAmounts,
    gpu_resource: &str,
) -> BTreeMap<String, PlatformQuantity> {
    let mut map = BTreeMap::new();
    map.insert("cpu".to_string(), PlatformQuantity(amounts.cpu.to_string()));
    if !amounts.gpu.is_zero() {
        map.insert(
            gpu_resource.to_string(),
            PlatformQuantity(amounts.gpu.to_string()),
        );
    }
    map
}

fn amounts_from_map(
    map: Option<&BTreeMap<String, PlatformQuantity>>,
    gpu_resource: &str,
) -> ResourceAmounts {
    let read = |key: &str| {
        map.and_then(|m| m.get(key))
            .map(|q| Quantity::parse_lenient(&q.0))
            .unwrap_or_default()
    };
    ResourceAmounts::new(read("cpu"), read(gpu_resource))
}

/// Render a workload unit as a Pod in `namespace`
pub fn pod_from_unit(unit: &WorkloadUnit, namespace: &str, gpu_resource: &str) -> Pod {
    let containers = unit
        .containers
        .iter()
        .map(|c| PodContainer {
            name: c.name.clone(),
            image: Some(c.image.clone()),
            command: c.command.clone(),
            ports: c.port.map(|p| {
                vec![ContainerPort {
                    container_port: i32::from(p),
                    ..Default::default()
                }]
            }),
            resources: Some(ResourceRequirements {
                requests: Some(amounts_to_map(c.resources.requests, gpu_resource)),
                limits: Some(amounts_to_map(c.resources.limits, gpu_resource)),
                ..Default::default()
            }),
            volume_mounts: (!c.volume_mounts.is_empty()).then(|| {
                c.volume_mounts
                    .iter()
                    .map(|m| PodVolumeMount {
                        name: m.name.clone(),
                        mount_path: m.mount_path.clone(),
                        ..Default::default()
                    })
                    .collect()
            }),
            ..Default::default()
        })
        .collect();

    let volumes: Vec<Volume> = unit
        .containers
        .iter()
        .flat_map(|c| c.volume_mounts.iter())
        .map(|m| Volume {
            name: m.name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: m.claim_name.clone(),
                read_only: None,
            }),
            ..Default::default()
        })
        .collect();

    let restart_policy = match unit.restart_policy {
        RestartPolicy::Always => "Always",
        RestartPolicy::Never => "Never",
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(unit.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(unit.labels.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers,
            restart_policy: Some(restart_policy.to_string()),
            volumes: (!volumes.is_empty()).then_some(volumes),
            ..Default::default()
        }),
        status: None,
    }
}

/// Read a Pod back into a workload unit; missing resource keys read as zero
pub fn unit_from_pod(pod: &Pod, gpu_resource: &str) -> WorkloadUnit {
    let spec = pod.spec.as_ref();
    let claims: BTreeMap<String, String> = spec
        .and_then(|s| s.volumes.as_ref())
        .map(|volumes| {
            volumes
                .iter()
                .filter_map(|v| {
                    v.persistent_volume_claim
                        .as_ref()
                        .map(|pvc| (v.name.clone(), pvc.claim_name.clone()))
                })
                .collect()
        })
        .unwrap_or_default();

    let containers = spec
        .map(|s| {
            s.containers
                .iter()
                .map(|c| {
                    let resources = c.resources.as_ref();
                    Container {
                        name: c.name.clone(),
                        image: c.image.clone().unwrap_or_default(),
                        command: c.command.clone(),
                        port: c
                            .ports
                            .as_ref()
                            .and_then(|ports| ports.first())
                            .and_then(|p| u16::try_from(p.container_port).ok()),
                        resources: ContainerResources {
                            requests: amounts_from_map(
                                resources.and_then(|r| r.requests.as_ref()),
                                gpu_resource,
                            ),
                            limits: amounts_from_map(
                                resources.and_then(|r| r.limits.as_ref()),
                                gpu_resource,
                            ),
                        },
                        volume_mounts: c
                            .volume_mounts
                            .iter()
                            .flatten()
                            .filter_map(|m| {
                                claims.get(&m.name).map(|claim| VolumeMount {
                                    name: m.name.clone(),
                                    claim_name: claim.clone(),
                                    mount_path: m.mount_path.clone(),
                                })
                            })
                            .collect(),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let restart_policy = match spec.and_then(|s| s.restart_policy.as_deref()) {
        Some("Never") => RestartPolicy::Never,
        _ => RestartPolicy::Always,
    };

    WorkloadUnit {
        name: pod.metadata.name.clone().unwrap_or_default(),
        namespace: pod.metadata.namespace.clone(),
        labels: pod.metadata.labels.clone().unwrap_or_default(),
        containers,
        restart_policy,
        phase: pod.status.as_ref().and_then(|s| s.phase.clone()),
    }
}

/// Render an exposure unit as a NodePort Service in `namespace`
pub fn service_from_exposure(exposure: &ExposureUnit, namespace: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(exposure.name.clone()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            selector: Some(exposure.selector.clone()),
            ports: Some(vec![ServicePort {
                protocol: Some("TCP".to_string()),
                port: i32::from(exposure.port),
                target_port: Some(IntOrString::Int(i32::from(exposure.target_port))),
                node_port: exposure.node_port.map(i32::from),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Read a Service back into an exposure unit
pub fn exposure_from_service(service: &Service) -> ExposureUnit {
    let spec = service.spec.as_ref();
    let port = spec
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| ports.first());

    ExposureUnit {
        name: service.metadata.name.clone().unwrap_or_default(),
        selector: spec.and_then(|s| s.selector.clone()).unwrap_or_default(),
        port: port
            .and_then(|p| u16::try_from(p.port).ok())
            .unwrap_or_default(),
        target_port: port
            .and_then(|p| match &p.target_port {
                Some(IntOrString::Int(n)) => u16::try_from(*n).ok(),
                _ => None,
            })
            .unwrap_or_default(),
        node_port: port
            .and_then(|p| p.node_port)
            .and_then(|n| u16::try_from(n).ok()),
    }
}

/// Allocatable CPU and GPU of a node; absent keys read as zero
pub fn node_capacity(node: &Node, gpu_resource: &str) -> NodeCapacity {
    let allocatable = node.status.as_ref().and_then(|s| s.allocatable.as_ref());
    NodeCapacity {
        name: node.metadata.name.clone().unwrap_or_default(),
        allocatable: amounts_from_map(allocatable, gpu_resource),
    }
}

// ============================================================================
// SBIO: I/O wrapper
// ============================================================================

/// Gateway backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
    namespace: String,
    gpu_resource: String,
}

impl KubeGateway {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        gpu_resource: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            gpu_resource: gpu_resource.into(),
        }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn create_workload_unit(
        &self,
        unit: &WorkloadUnit,
    ) -> Result<WorkloadUnit, GatewayError> {
        let pod = pod_from_unit(unit, &self.namespace, &self.gpu_resource);
        let created = self
            .pods()
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| map_error(e, ObjectKind::WorkloadUnit, &unit.name))?;
        info!(pod = %unit.name, namespace = %self.namespace, "Created pod");
        Ok(unit_from_pod(&created, &self.gpu_resource))
    }

    async fn get_workload_unit(&self, name: &str) -> Result<WorkloadUnit, GatewayError> {
        let pod = self
            .pods()
            .get(name)
            .await
            .map_err(|e| map_error(e, ObjectKind::WorkloadUnit, name))?;
        Ok(unit_from_pod(&pod, &self.gpu_resource))
    }

    async fn list_workload_units(
        &self,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<WorkloadUnit>, GatewayError> {
        let params = match selector {
            Some(selector) => ListParams::default().labels(&selector.to_query()),
            None => ListParams::default(),
        };
        let pods = self
            .pods()
            .list(&params)
            .await
            .map_err(|e| list_error(e, "pods"))?;
        Ok(pods
            .items
            .iter()
            .map(|p| unit_from_pod(p, &self.gpu_resource))
            .collect())
    }

    async fn list_running_workload_units(&self) -> Result<Vec<WorkloadUnit>, GatewayError> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = pods
            .list(&ListParams::default().fields(ACTIVE_POD_SELECTOR))
            .await
            .map_err(|e| list_error(e, "pods in all namespaces"))?;
        debug!(count = list.items.len(), "Listed active pods");
        Ok(list
            .items
            .iter()
            .map(|p| unit_from_pod(p, &self.gpu_resource))
            .collect())
    }

    async fn delete_workload_unit(&self, name: &str) -> Result<(), GatewayError> {
        self.pods()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_error(e, ObjectKind::WorkloadUnit, name))?;
        debug!(pod = name, "Pod deletion requested");
        Ok(())
    }

    async fn delete_workload_controller(&self, name: &str) -> Result<(), GatewayError> {
        self.deployments()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_error(e, ObjectKind::WorkloadController, name))?;
        debug!(deployment = name, "Deployment deletion requested");
        Ok(())
    }

    async fn create_exposure_unit(
        &self,
        unit: &ExposureUnit,
    ) -> Result<ExposureUnit, GatewayError> {
        let service = service_from_exposure(unit, &self.namespace);
        let created = self
            .services()
            .create(&PostParams::default(), &service)
            .await
            .map_err(|e| map_error(e, ObjectKind::ExposureUnit, &unit.name))?;
        let exposure = exposure_from_service(&created);
        info!(service = %unit.name, node_port = ?exposure.node_port, "Created service");
        Ok(exposure)
    }

    async fn get_exposure_unit(&self, name: &str) -> Result<ExposureUnit, GatewayError> {
        let service = self
            .services()
            .get(name)
            .await
            .map_err(|e| map_error(e, ObjectKind::ExposureUnit, name))?;
        Ok(exposure_from_service(&service))
    }

    async fn delete_exposure_unit(&self, name: &str) -> Result<(), GatewayError> {
        self.services()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_error(e, ObjectKind::ExposureUnit, name))?;
        debug!(service = name, "Service deletion requested");
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeCapacity>, GatewayError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes
            .list(&ListParams::default())
            .await
            .map_err(|e| list_error(e, "nodes"))?;
        Ok(list
            .items
            .iter()
            .map(|n| node_capacity(n, &self.gpu_resource))
            .collect())
    }

    async fn stream_logs(&self, workload_unit: &str) -> Result<LogStream, GatewayError> {
        let logs = self
            .pods()
            .log_stream(workload_unit, &LogParams::default())
            .await
            .map_err(|e| map_error(e, ObjectKind::WorkloadUnit, workload_unit))?;
        Ok(Box::pin(logs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeStatus, PodStatus};

    const GPU: &str = "nvidia.com/gpu";

    fn unit() -> WorkloadUnit {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "my-task".to_string());
        WorkloadUnit {
            name: "my-task".to_string(),
            namespace: None,
            labels,
            containers: vec![Container {
                name: "my-task".to_string(),
                image: "jupyter/base".to_string(),
                command: None,
                port: Some(8888),
                resources: ContainerResources::guaranteed(ResourceAmounts::new(
                    Quantity::from_units(2),
                    Quantity::from_units(1),
                )),
                volume_mounts: vec![VolumeMount {
                    name: "my-task-data".to_string(),
                    claim_name: "datasets".to_string(),
                    mount_path: "/data".to_string(),
                }],
            }],
            restart_policy: RestartPolicy::Always,
            phase: None,
        }
    }

    #[test]
    fn test_pod_from_unit() {
        let pod = pod_from_unit(&unit(), "research", GPU);
        assert_eq!(pod.metadata.namespace.as_deref(), Some("research"));

        let spec = pod.spec.as_ref().unwrap();
        let resources = spec.containers[0].resources.as_ref().unwrap();
        let requests = resources.requests.as_ref().unwrap();
        assert_eq!(requests["cpu"].0, "2");
        assert_eq!(requests[GPU].0, "1");
        assert_eq!(resources.requests, resources.limits);
        assert_eq!(
            spec.volumes.as_ref().unwrap()[0]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "datasets"
        );
    }

    #[test]
    fn test_zero_gpu_key_omitted() {
        let mut unit = unit();
        unit.set_resources(ResourceAmounts::new(Quantity::from_millis(500), Quantity::ZERO));
        let pod = pod_from_unit(&unit, "default", GPU);
        let requests = pod.spec.unwrap().containers[0]
            .resources
            .clone()
            .unwrap()
            .requests
            .unwrap();
        assert_eq!(requests["cpu"].0, "500m");
        assert!(!requests.contains_key(GPU));
    }

    #[test]
    fn test_unit_from_pod_reads_back() {
        let mut pod = pod_from_unit(&unit(), "default", GPU);
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });

        let read = unit_from_pod(&pod, GPU);
        assert_eq!(read.name, "my-task");
        assert_eq!(read.phase.as_deref(), Some("Running"));
        assert_eq!(read.requested().gpu, Quantity::from_units(1));
        assert_eq!(read.containers[0].volume_mounts, unit().containers[0].volume_mounts);
        assert_eq!(read.containers[0].port, Some(8888));
    }

    #[test]
    fn test_missing_resources_read_as_zero() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("bare".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![PodContainer {
                    name: "bare".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: None,
        };
        let read = unit_from_pod(&pod, GPU);
        assert_eq!(read.requested(), ResourceAmounts::default());
    }

    #[test]
    fn test_service_round_trip_keeps_node_port() {
        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), "my-task".to_string());
        let exposure = ExposureUnit {
            name: "my-task-service".to_string(),
            selector,
            port: 80,
            target_port: 8888,
            node_port: Some(30123),
        };

        let service = service_from_exposure(&exposure, "default");
        assert_eq!(
            service.spec.as_ref().unwrap().type_.as_deref(),
            Some("NodePort")
        );
        assert_eq!(exposure_from_service(&service), exposure);
    }

    #[test]
    fn test_node_capacity() {
        let mut allocatable = BTreeMap::new();
        allocatable.insert("cpu".to_string(), PlatformQuantity("7910m".to_string()));
        allocatable.insert(GPU.to_string(), PlatformQuantity("4".to_string()));
        let node = Node {
            metadata: ObjectMeta {
                name: Some("gpu-node-1".to_string()),
                ..Default::default()
            },
            spec: None,
            status: Some(NodeStatus {
                allocatable: Some(allocatable),
                ..Default::default()
            }),
        };

        let capacity = node_capacity(&node, GPU);
        assert_eq!(capacity.allocatable.cpu, Quantity::from_millis(7910));
        assert_eq!(capacity.allocatable.gpu, Quantity::from_units(4));
    }

    #[test]
    fn test_map_error_codes() {
        let api_error = |code: u16| {
            kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "boom".to_string(),
                reason: "Test".to_string(),
                code,
            })
        };

        assert!(map_error(api_error(404), ObjectKind::WorkloadUnit, "a").is_not_found());
        assert!(matches!(
            map_error(api_error(409), ObjectKind::ExposureUnit, "a-service"),
            GatewayError::AlreadyExists { .. }
        ));
        assert!(matches!(
            map_error(api_error(500), ObjectKind::WorkloadUnit, "a"),
            GatewayError::Platform(_)
        ));
    }
}
