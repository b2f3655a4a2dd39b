//! Pod resource allocation and in-place resize management
//!
//! This module provides:
//! - Allocation and actuation state, in memory or checkpointed to disk
//! - Resize admission against node allocatable and the other admitted pods
//! - A prioritized queue of pending resizes with retry
//! - Detection of resizes the runtime is still applying

mod admission;
mod checkpoint;
mod error;
mod manager;
mod progress;
mod queue;
mod retry_loop;
mod state;

#[cfg(test)]
mod tests;

pub use admission::{
    can_admit_pod, can_resize_pod, check_resource_manager_policies,
    disallow_resize_for_swappable_containers, is_in_place_resize_allowed,
    is_resize_increasing_requests, AdmitFailure, NodeConfig, NodeResources, PodAdmission,
    ResizeFit, ResizeOutcome, CPU_MANAGER_STATIC_POLICY, MEMORY_MANAGER_STATIC_POLICY,
    STATIC_POD_RESIZE_MESSAGE, SWAP_RESIZE_MESSAGE,
};
pub use checkpoint::{CheckpointState, ACTUATED_CHECKPOINT, ALLOCATED_CHECKPOINT};
pub use error::{AllocationError, Result};
pub use manager::{
    update_pod_from_allocation, AllocationManager, AllocationManagerBuilder, RetryTrigger,
    StateWriteErrors,
};
pub use progress::is_pod_resize_in_progress;
pub use queue::{compare_resize_priority, PendingResizeQueue, ResizePriorityKey};
pub use retry_loop::{ResizeRetryConfig, ResizeRetryHandle, ResizeRetryLoop};
pub use state::{AllocationState, MemoryState, PodResourceInfo, PodResourceInfoMap};

use crate::models::{Container, Pod, PodUid, SwapBehavior};
use tokio::sync::mpsc;
use tracing::debug;

/// Source of the node's schedulable resources
pub trait NodeCapacityProvider: Send + Sync {
    fn node_resources(&self) -> Result<NodeResources>;
}

/// Runtime facts needed for resize decisions
pub trait ContainerRuntime: Send + Sync {
    /// Swap behavior the runtime applies to a container of a pod
    fn swap_behavior(&self, pod: &Pod, container: &Container) -> SwapBehavior;
}

/// Lookup of the pods currently bound to this node
pub trait PodSource: Send + Sync {
    fn pod(&self, uid: &PodUid) -> Option<Pod>;

    /// Pods that are admitted and not terminated
    fn active_pods(&self) -> Vec<Pod>;
}

/// Requests that a pod be re-synced so the runtime applies new resources
pub trait PodSyncTrigger: Send + Sync {
    fn trigger_pod_sync(&self, pod: &Pod);
}

/// A pod whose desired runtime state changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSyncEvent {
    pub uid: PodUid,
    pub name: String,
    pub namespace: String,
    pub generation: i64,
}

impl PodSyncEvent {
    pub fn for_pod(pod: &Pod) -> Self {
        Self {
            uid: pod.uid.clone(),
            name: pod.name.clone(),
            namespace: pod.namespace.clone(),
            generation: pod.generation,
        }
    }
}

impl PodSyncTrigger for mpsc::UnboundedSender<PodSyncEvent> {
    fn trigger_pod_sync(&self, pod: &Pod) {
        if self.send(PodSyncEvent::for_pod(pod)).is_err() {
            debug!(pod_uid = %pod.uid, "Pod sync receiver dropped");
        }
    }
}
