//! Node-local views used by the allocation manager
//!
//! The registry of pods bound to this node, the node's schedulable resources
//! and the swap configuration of the container runtime.

use crate::allocation::{ContainerRuntime, NodeCapacityProvider, NodeResources, PodSource, Result};
use crate::models::{Container, Pod, PodUid, QosClass, SwapBehavior};
use crate::quantity::Quantity;
use crate::resources::{pod_qos, resource_list, ResourceListExt, ResourceName};
use dashmap::DashMap;
use tracing::debug;

/// Registry of pods bound to this node
#[derive(Debug, Default)]
pub struct PodRegistry {
    /// Map of pod uid -> latest desired pod
    pods: DashMap<PodUid, Pod>,
}

impl PodRegistry {
    pub fn new() -> Self {
        Self {
            pods: DashMap::new(),
        }
    }

    /// Insert or replace a pod, returning the previous version
    pub fn upsert(&self, pod: Pod) -> Option<Pod> {
        debug!(pod_uid = %pod.uid, pod = %pod.key(), "Registering pod");
        self.pods.insert(pod.uid.clone(), pod)
    }

    pub fn remove(&self, uid: &PodUid) -> Option<Pod> {
        debug!(pod_uid = %uid, "Unregistering pod");
        self.pods.remove(uid).map(|(_, pod)| pod)
    }

    pub fn get(&self, uid: &PodUid) -> Option<Pod> {
        self.pods.get(uid).map(|r| r.clone())
    }

    /// All registered pods, ordered by uid
    pub fn list(&self) -> Vec<Pod> {
        let mut pods: Vec<Pod> = self.pods.iter().map(|r| r.value().clone()).collect();
        pods.sort_by(|a, b| a.uid.cmp(&b.uid));
        pods
    }

    pub fn uids(&self) -> Vec<PodUid> {
        self.pods.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }
}

impl PodSource for PodRegistry {
    fn pod(&self, uid: &PodUid) -> Option<Pod> {
        self.get(uid)
    }

    fn active_pods(&self) -> Vec<Pod> {
        self.list()
    }
}

/// Fixed node resources, read from configuration
#[derive(Debug, Clone)]
pub struct StaticNodeResources {
    resources: NodeResources,
}

impl StaticNodeResources {
    pub fn new(resources: NodeResources) -> Self {
        Self { resources }
    }

    /// Allocatable equal to capacity
    pub fn from_quantities(cpu: Quantity, memory: Quantity, max_pods: i64) -> Self {
        let allocatable = resource_list([
            (ResourceName::Cpu, cpu),
            (ResourceName::Memory, memory),
            (ResourceName::Pods, Quantity::new(max_pods)),
        ]);
        Self::new(NodeResources {
            capacity: allocatable.clone(),
            allocatable,
        })
    }
}

impl NodeCapacityProvider for StaticNodeResources {
    fn node_resources(&self) -> Result<NodeResources> {
        Ok(self.resources.clone())
    }
}

/// Swap configuration of the node
///
/// With limited swap, only containers of Burstable pods whose memory request
/// differs from their limit may use swap.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeSwapConfig {
    pub behavior: SwapBehavior,
}

impl NodeSwapConfig {
    pub fn new(behavior: SwapBehavior) -> Self {
        Self { behavior }
    }
}

impl ContainerRuntime for NodeSwapConfig {
    fn swap_behavior(&self, pod: &Pod, container: &Container) -> SwapBehavior {
        if self.behavior == SwapBehavior::NoSwap || pod_qos(pod) != QosClass::Burstable {
            return SwapBehavior::NoSwap;
        }

        let request = container.resources.requests.memory();
        match container.resources.limits.get(&ResourceName::Memory) {
            Some(limit) if *limit == request => SwapBehavior::NoSwap,
            _ => SwapBehavior::LimitedSwap,
        }
    }
}
