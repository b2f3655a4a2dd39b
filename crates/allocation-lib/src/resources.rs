//! Resource lists and pod-level resource accounting

use crate::models::{Pod, QosClass};
use crate::quantity::Quantity;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Name of a node resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceName {
    Cpu,
    Memory,
    Pods,
}

impl ResourceName {
    /// Resources that determine a pod's QoS class
    pub const COMPUTE: [ResourceName; 2] = [ResourceName::Cpu, ResourceName::Memory];
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceName::Cpu => write!(f, "cpu"),
            ResourceName::Memory => write!(f, "memory"),
            ResourceName::Pods => write!(f, "pods"),
        }
    }
}

/// Quantities keyed by resource name
pub type ResourceList = BTreeMap<ResourceName, Quantity>;

/// Arithmetic over resource lists; a missing entry counts as zero
pub trait ResourceListExt {
    fn quantity(&self, name: ResourceName) -> Quantity;

    fn cpu(&self) -> Quantity {
        self.quantity(ResourceName::Cpu)
    }

    fn memory(&self) -> Quantity {
        self.quantity(ResourceName::Memory)
    }

    /// Add every entry of `other` into this list
    fn add_list(&mut self, other: &ResourceList);

    /// Raise every entry to at least the value in `other`
    fn max_list(&mut self, other: &ResourceList);
}

impl ResourceListExt for ResourceList {
    fn quantity(&self, name: ResourceName) -> Quantity {
        self.get(&name).copied().unwrap_or(Quantity::ZERO)
    }

    fn add_list(&mut self, other: &ResourceList) {
        for (name, quantity) in other {
            *self.entry(*name).or_insert(Quantity::ZERO) += *quantity;
        }
    }

    fn max_list(&mut self, other: &ResourceList) {
        for (name, quantity) in other {
            let entry = self.entry(*name).or_insert(*quantity);
            if *quantity > *entry {
                *entry = *quantity;
            }
        }
    }
}

/// Build a resource list from `(name, quantity)` pairs
pub fn resource_list<I>(entries: I) -> ResourceList
where
    I: IntoIterator<Item = (ResourceName, Quantity)>,
{
    entries.into_iter().collect()
}

/// Effective resource requests of a pod
///
/// Regular containers and restartable init containers run side by side, so
/// their requests add up. Each ordinary init container runs alone next to the
/// restartable init containers started before it; the pod needs the larger of
/// the two totals for every resource.
pub fn pod_requests(pod: &Pod) -> ResourceList {
    let mut requests = ResourceList::new();
    for container in &pod.spec.containers {
        requests.add_list(&container.resources.requests);
    }

    let mut restartable_init = ResourceList::new();
    let mut init_peak = ResourceList::new();
    for container in &pod.spec.init_containers {
        let running = if container.is_restartable() {
            requests.add_list(&container.resources.requests);
            restartable_init.add_list(&container.resources.requests);
            restartable_init.clone()
        } else {
            let mut total = container.resources.requests.clone();
            total.add_list(&restartable_init);
            total
        };
        init_peak.max_list(&running);
    }

    requests.max_list(&init_peak);
    requests
}

/// QoS class of a pod, preferring the class reported in its status
pub fn pod_qos(pod: &Pod) -> QosClass {
    pod.status.qos_class.unwrap_or_else(|| compute_pod_qos(pod))
}

/// Compute the QoS class from container requests and limits
pub fn compute_pod_qos(pod: &Pod) -> QosClass {
    let mut requests = ResourceList::new();
    let mut limits = ResourceList::new();
    let mut is_guaranteed = true;

    for (_, container) in pod.containers() {
        for name in ResourceName::COMPUTE {
            if let Some(q) = container.resources.requests.get(&name).filter(|q| !q.is_zero()) {
                *requests.entry(name).or_insert(Quantity::ZERO) += *q;
            }
        }

        let mut limits_found = BTreeSet::new();
        for name in ResourceName::COMPUTE {
            if let Some(q) = container.resources.limits.get(&name).filter(|q| !q.is_zero()) {
                limits_found.insert(name);
                *limits.entry(name).or_insert(Quantity::ZERO) += *q;
            }
        }
        if limits_found.len() != ResourceName::COMPUTE.len() {
            is_guaranteed = false;
        }
    }

    if requests.is_empty() && limits.is_empty() {
        return QosClass::BestEffort;
    }

    if is_guaranteed {
        is_guaranteed = requests
            .iter()
            .all(|(name, request)| limits.get(name) == Some(request));
    }

    if is_guaranteed && requests.len() == limits.len() {
        QosClass::Guaranteed
    } else {
        QosClass::Burstable
    }
}
