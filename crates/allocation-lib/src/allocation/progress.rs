//! Detection of resizes the runtime has not finished applying

use crate::models::{
    is_resizable_container, ContainerState, Pod, ResourceRequirements, RuntimePodStatus,
};
use crate::resources::{ResourceList, ResourceListExt, ResourceName};

/// Whether any running, resizable container still differs from its allocation
///
/// `actuated` looks up what the runtime last confirmed for a container. A
/// container never reported as actuated compares as empty resources.
pub fn is_pod_resize_in_progress<F>(
    allocated_pod: &Pod,
    status: &RuntimePodStatus,
    actuated: F,
) -> bool
where
    F: Fn(&str) -> Option<ResourceRequirements>,
{
    allocated_pod
        .containers()
        .filter(|(kind, container)| is_resizable_container(container, *kind))
        .any(|(_, container)| {
            let running = status
                .find_container_status(&container.name)
                .map(|s| s.state == ContainerState::Running)
                .unwrap_or(false);
            if !running {
                return false;
            }

            let actuated = actuated(&container.name).unwrap_or_default();
            !same_compute(&container.resources.requests, &actuated.requests)
                || !same_compute(&container.resources.limits, &actuated.limits)
        })
}

fn same_compute(a: &ResourceList, b: &ResourceList) -> bool {
    ResourceName::COMPUTE
        .iter()
        .all(|name| a.quantity(*name) == b.quantity(*name))
}
