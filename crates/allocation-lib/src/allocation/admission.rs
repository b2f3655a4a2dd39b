//! Resize and admission feasibility checks
//!
//! Everything here is a pure function of the pods involved and a node
//! snapshot; the manager supplies both and applies the verdict.

use super::ContainerRuntime;
use crate::models::{
    is_resizable_container, Container, Pod, QosClass, ResourceResizeRestartPolicy, SwapBehavior,
};
use crate::resources::{pod_qos, pod_requests, ResourceList, ResourceListExt, ResourceName};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const STATIC_POD_RESIZE_MESSAGE: &str = "In-place resize of static-pods is not supported";
pub const SWAP_RESIZE_MESSAGE: &str = "In-place resize of containers with swap is not supported";

/// CPU manager policy that pins exclusive cores to Guaranteed pods
pub const CPU_MANAGER_STATIC_POLICY: &str = "static";
/// Memory manager policy that pins NUMA memory to Guaranteed pods
pub const MEMORY_MANAGER_STATIC_POLICY: &str = "Static";

/// Snapshot of the node's schedulable resources
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResources {
    pub allocatable: ResourceList,
    #[serde(default)]
    pub capacity: ResourceList,
}

/// Node-level resource manager policies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub cpu_manager_policy: String,
    pub memory_manager_policy: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            cpu_manager_policy: "none".to_string(),
            memory_manager_policy: "None".to_string(),
        }
    }
}

/// Result of evaluating a desired resize
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResizeOutcome {
    /// Desired resources already match the allocation
    Unchanged,
    /// The resize was admitted and recorded
    Allocated,
    /// The resize does not fit right now
    Deferred(String),
    /// The resize can never fit as requested
    Infeasible(String),
}

impl ResizeOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ResizeOutcome::Unchanged => "unchanged",
            ResizeOutcome::Allocated => "allocated",
            ResizeOutcome::Deferred(_) => "deferred",
            ResizeOutcome::Infeasible(_) => "infeasible",
        }
    }
}

/// Verdict of the capacity checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResizeFit {
    Fit,
    Deferred(String),
    Infeasible(String),
}

/// Why a pod could not be admitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmitFailure {
    pub reason: String,
    pub message: String,
}

/// Admission decision for a pod joining the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodAdmission {
    Admitted,
    Rejected(AdmitFailure),
}

impl PodAdmission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, PodAdmission::Admitted)
    }
}

/// Static pods cannot be resized in place
pub fn is_in_place_resize_allowed(pod: &Pod) -> Result<(), String> {
    if pod.is_static() {
        return Err(STATIC_POD_RESIZE_MESSAGE.to_string());
    }
    Ok(())
}

/// Reject memory request changes on swap-enabled containers unless the
/// container is restarted to apply them
///
/// Sidecars (restartable init containers) are checked like regular containers.
pub fn disallow_resize_for_swappable_containers(
    runtime: &dyn ContainerRuntime,
    desired: &Pod,
    allocated: &Pod,
) -> Option<String> {
    let allocated_containers: HashMap<&str, _> = resizable_containers(allocated)
        .map(|c| (c.name.as_str(), c))
        .collect();

    for desired_container in resizable_containers(desired) {
        let Some(allocated_container) = allocated_containers.get(desired_container.name.as_str())
        else {
            continue;
        };

        let desired_memory = desired_container.resources.requests.memory();
        let allocated_memory = allocated_container.resources.requests.memory();
        if desired_memory == allocated_memory {
            continue;
        }

        let restarts_on_memory_resize = allocated_container
            .resize_restart_policy(ResourceName::Memory)
            == Some(ResourceResizeRestartPolicy::RestartContainer);
        if restarts_on_memory_resize {
            continue;
        }

        let desired_swap = runtime.swap_behavior(desired, desired_container);
        let allocated_swap = runtime.swap_behavior(allocated, allocated_container);
        if desired_swap != SwapBehavior::NoSwap || allocated_swap != SwapBehavior::NoSwap {
            return Some(SWAP_RESIZE_MESSAGE.to_string());
        }
    }
    None
}

fn resizable_containers(pod: &Pod) -> impl Iterator<Item = &Container> {
    pod.containers()
        .filter(|(kind, container)| is_resizable_container(container, *kind))
        .map(|(_, container)| container)
}

/// Guaranteed pods with exclusively pinned CPUs or memory cannot change size
pub fn check_resource_manager_policies(pod: &Pod, config: &NodeConfig) -> Result<(), String> {
    if pod_qos(pod) != QosClass::Guaranteed {
        return Ok(());
    }
    if config.cpu_manager_policy == CPU_MANAGER_STATIC_POLICY {
        return Err(
            "Resize is infeasible for Guaranteed Pods alongside CPU Manager static policy"
                .to_string(),
        );
    }
    if config.memory_manager_policy == MEMORY_MANAGER_STATIC_POLICY {
        return Err(
            "Resize is infeasible for Guaranteed Pods alongside Memory Manager static policy"
                .to_string(),
        );
    }
    Ok(())
}

/// Whether the desired pod asks for more cpu or memory than its allocation
pub fn is_resize_increasing_requests(allocated: &Pod, desired: &Pod) -> bool {
    let old = pod_requests(allocated);
    let new = pod_requests(desired);
    new.memory() > old.memory() || new.cpu() > old.cpu()
}

/// Amount of a resource in the unit used by messages: millicores for cpu,
/// whole units otherwise
fn scalar(name: ResourceName, list: &ResourceList) -> i64 {
    let quantity = list.quantity(name);
    match name {
        ResourceName::Cpu => quantity.milli_value(),
        _ => quantity.value(),
    }
}

/// Check a pod against node allocatable together with the already admitted pods
pub fn can_admit_pod(
    other_pods: &[Pod],
    pod: &Pod,
    allocatable: &ResourceList,
) -> Result<(), AdmitFailure> {
    let requested = pod_requests(pod);
    let mut used = ResourceList::new();
    for other in other_pods {
        used.add_list(&pod_requests(other));
    }

    for name in ResourceName::COMPUTE {
        let want = scalar(name, &requested);
        if want == 0 {
            continue;
        }
        let in_use = scalar(name, &used);
        let capacity = scalar(name, allocatable);
        if want > capacity - in_use {
            return Err(insufficient(name, want, in_use, capacity));
        }
    }

    if let Some(max_pods) = allocatable.get(&ResourceName::Pods) {
        let in_use = other_pods.len() as i64;
        let capacity = max_pods.value();
        if in_use + 1 > capacity {
            return Err(insufficient(ResourceName::Pods, 1, in_use, capacity));
        }
    }

    Ok(())
}

fn insufficient(name: ResourceName, requested: i64, used: i64, capacity: i64) -> AdmitFailure {
    AdmitFailure {
        reason: format!("OutOf{}", name),
        message: format!(
            "Node didn't have enough resource: {}, requested: {}, used: {}, capacity: {}",
            name, requested, used, capacity
        ),
    }
}

/// Decide whether a request-increasing resize fits on the node
///
/// Only the resources whose pod-level request grows are checked; a resource
/// that stays flat or shrinks never blocks the resize. Exceeding node
/// allocatable can never succeed; exceeding what is left after the other pods
/// may succeed once they shrink or leave.
pub fn can_resize_pod(
    other_pods: &[Pod],
    allocated: &Pod,
    desired: &Pod,
    node: &NodeResources,
) -> ResizeFit {
    let old = pod_requests(allocated);
    let new = pod_requests(desired);
    let growing = |name: ResourceName| new.quantity(name) > old.quantity(name);

    for name in [ResourceName::Memory, ResourceName::Cpu] {
        if !growing(name) {
            continue;
        }
        let requested = scalar(name, &new);
        let capacity = scalar(name, &node.allocatable);
        if requested > capacity {
            return ResizeFit::Infeasible(format!(
                "Node didn't have enough capacity: {}, requested: {}, capacity: {}",
                name, requested, capacity
            ));
        }
    }

    let mut used = ResourceList::new();
    for other in other_pods {
        used.add_list(&pod_requests(other));
    }
    for name in ResourceName::COMPUTE {
        if !growing(name) {
            continue;
        }
        let requested = scalar(name, &new);
        let in_use = scalar(name, &used);
        let capacity = scalar(name, &node.allocatable);
        if requested > capacity - in_use {
            return ResizeFit::Deferred(insufficient(name, requested, in_use, capacity).message);
        }
    }

    ResizeFit::Fit
}
