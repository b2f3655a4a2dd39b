//! Core data models for the allocation agent

use crate::quantity::Quantity;
use crate::resources::{ResourceList, ResourceName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Annotation recording where a pod definition came from
pub const CONFIG_SOURCE_ANNOTATION: &str = "kubernetes.io/config.source";

/// Config source value for pods delivered through the cluster API
pub const API_SERVER_SOURCE: &str = "api";

/// Config source value for pods defined by a manifest file on the node
pub const FILE_SOURCE: &str = "file";

/// Unique identifier of a pod
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PodUid(String);

impl PodUid {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PodUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PodUid {
    fn from(uid: &str) -> Self {
        Self(uid.to_string())
    }
}

impl From<String> for PodUid {
    fn from(uid: String) -> Self {
        Self(uid)
    }
}

/// Requested and limited resources of a container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: ResourceList,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: ResourceList,
}

impl ResourceRequirements {
    pub fn new(requests: ResourceList, limits: ResourceList) -> Self {
        Self { requests, limits }
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.limits.is_empty()
    }
}

/// Whether changing a resource in place requires a container restart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceResizeRestartPolicy {
    NotRequired,
    RestartContainer,
}

/// Resize policy for a single resource of a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResizePolicy {
    pub resource_name: ResourceName,
    pub restart_policy: ResourceResizeRestartPolicy,
}

/// Container-level restart policy; only meaningful on init containers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerRestartPolicy {
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resize_policy: Vec<ContainerResizePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<ContainerRestartPolicy>,
}

impl Container {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resources: ResourceRequirements::default(),
            resize_policy: Vec::new(),
            restart_policy: None,
        }
    }

    pub fn with_requests(mut self, requests: ResourceList) -> Self {
        self.resources.requests = requests;
        self
    }

    pub fn with_limits(mut self, limits: ResourceList) -> Self {
        self.resources.limits = limits;
        self
    }

    pub fn with_resize_policy(
        mut self,
        resource_name: ResourceName,
        restart_policy: ResourceResizeRestartPolicy,
    ) -> Self {
        self.resize_policy.push(ContainerResizePolicy {
            resource_name,
            restart_policy,
        });
        self
    }

    /// Mark as a restartable init container (sidecar)
    pub fn restartable(mut self) -> Self {
        self.restart_policy = Some(ContainerRestartPolicy::Always);
        self
    }

    pub fn is_restartable(&self) -> bool {
        self.restart_policy == Some(ContainerRestartPolicy::Always)
    }

    /// Restart policy declared for resizing the given resource, if any
    pub fn resize_restart_policy(
        &self,
        resource: ResourceName,
    ) -> Option<ResourceResizeRestartPolicy> {
        self.resize_policy
            .iter()
            .find(|p| p.resource_name == resource)
            .map(|p| p.restart_policy)
    }
}

/// Which list of the pod spec a container belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Init,
    Regular,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

/// Pod quality-of-service class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QosClass {
    Guaranteed,
    Burstable,
    BestEffort,
}

impl fmt::Display for QosClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QosClass::Guaranteed => write!(f, "Guaranteed"),
            QosClass::Burstable => write!(f, "Burstable"),
            QosClass::BestEffort => write!(f, "BestEffort"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    /// QoS class as last reported on the pod; computed from the spec when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos_class: Option<QosClass>,
}

/// A pod scheduled to this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    pub uid: PodUid,
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Pod {
    pub fn new(
        uid: impl Into<PodUid>,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            uid: uid.into(),
            name: name.into(),
            namespace: namespace.into(),
            annotations: BTreeMap::new(),
            generation: 1,
            spec: PodSpec::default(),
            status: PodStatus::default(),
        }
    }

    pub fn with_container(mut self, container: Container) -> Self {
        self.spec.containers.push(container);
        self
    }

    pub fn with_init_container(mut self, container: Container) -> Self {
        self.spec.init_containers.push(container);
        self
    }

    /// `namespace/name`, for log fields and messages
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Static pods come from a node-local source rather than the cluster API
    pub fn is_static(&self) -> bool {
        self.annotations
            .get(CONFIG_SOURCE_ANNOTATION)
            .map(|source| source != API_SERVER_SOURCE)
            .unwrap_or(false)
    }

    pub fn priority(&self) -> i32 {
        self.spec.priority.unwrap_or(0)
    }

    /// Init containers followed by regular containers
    pub fn containers(&self) -> impl Iterator<Item = (ContainerKind, &Container)> {
        self.spec
            .init_containers
            .iter()
            .map(|c| (ContainerKind::Init, c))
            .chain(self.spec.containers.iter().map(|c| (ContainerKind::Regular, c)))
    }

    pub fn containers_mut(&mut self) -> impl Iterator<Item = &mut Container> {
        self.spec
            .init_containers
            .iter_mut()
            .chain(self.spec.containers.iter_mut())
    }

    pub fn find_container(&self, name: &str) -> Option<&Container> {
        self.containers().map(|(_, c)| c).find(|c| c.name == name)
    }
}

/// Whether a container of the given kind may be resized in place
///
/// Regular containers and restartable init containers run for the lifetime of
/// the pod; ordinary init containers run to completion and are never resized.
pub fn is_resizable_container(container: &Container, kind: ContainerKind) -> bool {
    match kind {
        ContainerKind::Regular => true,
        ContainerKind::Init => container.is_restartable(),
    }
}

/// State of a container as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Unknown,
}

/// Resources the runtime currently enforces on a container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<Quantity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub state: ContainerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ContainerResources>,
}

impl ContainerStatus {
    pub fn new(name: impl Into<String>, state: ContainerState) -> Self {
        Self {
            name: name.into(),
            state,
            resources: None,
        }
    }
}

/// Runtime view of a pod's containers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimePodStatus {
    pub uid: PodUid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
}

impl RuntimePodStatus {
    pub fn new(pod: &Pod) -> Self {
        Self {
            uid: pod.uid.clone(),
            name: pod.name.clone(),
            namespace: pod.namespace.clone(),
            container_statuses: Vec::new(),
        }
    }

    pub fn find_container_status(&self, name: &str) -> Option<&ContainerStatus> {
        self.container_statuses.iter().find(|s| s.name == name)
    }
}

/// Swap behavior applied to a container's memory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapBehavior {
    #[default]
    NoSwap,
    LimitedSwap,
}
