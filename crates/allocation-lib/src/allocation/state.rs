//! Per-pod resource records
//!
//! The same state shape backs both the allocation store (what was granted to
//! each container) and the actuation tracker (what the runtime confirmed it
//! applied). Each comes in a volatile and a checkpointed variant.

use super::error::Result;
use crate::models::{Pod, PodUid, ResourceRequirements};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

/// Resource requirements of every container of one pod, keyed by container name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodResourceInfo {
    #[serde(default)]
    pub container_resources: BTreeMap<String, ResourceRequirements>,
}

impl PodResourceInfo {
    /// Snapshot of the resources declared by every container of a pod
    pub fn from_pod(pod: &Pod) -> Self {
        Self {
            container_resources: pod
                .containers()
                .map(|(_, c)| (c.name.clone(), c.resources.clone()))
                .collect(),
        }
    }
}

pub type PodResourceInfoMap = HashMap<PodUid, PodResourceInfo>;

/// Storage for per-pod, per-container resource requirements
///
/// Writes replace whole pod records; a failed write leaves the previous state
/// visible.
pub trait AllocationState: Send + Sync {
    fn container_resources(&self, uid: &PodUid, container: &str) -> Option<ResourceRequirements>;

    fn pod_resource_info(&self, uid: &PodUid) -> Option<PodResourceInfo>;

    /// Consistent copy of all records
    fn pod_resource_info_map(&self) -> PodResourceInfoMap;

    fn set_pod_resource_info(&self, uid: &PodUid, info: PodResourceInfo) -> Result<()>;

    fn remove_pod(&self, uid: &PodUid) -> Result<()>;

    /// Remove every pod not present in `remaining`
    fn remove_orphaned_pods(&self, remaining: &HashSet<PodUid>) -> Result<()>;

    fn set_container_resources(
        &self,
        uid: &PodUid,
        container: &str,
        resources: ResourceRequirements,
    ) -> Result<()> {
        let mut info = self.pod_resource_info(uid).unwrap_or_default();
        info.container_resources
            .insert(container.to_string(), resources);
        self.set_pod_resource_info(uid, info)
    }

    fn pod_count(&self) -> usize {
        self.pod_resource_info_map().len()
    }
}

/// Volatile state, lost on restart
#[derive(Debug, Default)]
pub struct MemoryState {
    pods: RwLock<PodResourceInfoMap>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_pods(pods: PodResourceInfoMap) -> Self {
        Self {
            pods: RwLock::new(pods),
        }
    }

    pub(crate) fn replace(&self, pods: PodResourceInfoMap) {
        *self.pods.write().unwrap_or_else(PoisonError::into_inner) = pods;
    }
}

impl AllocationState for MemoryState {
    fn container_resources(&self, uid: &PodUid, container: &str) -> Option<ResourceRequirements> {
        self.pods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uid)
            .and_then(|info| info.container_resources.get(container))
            .cloned()
    }

    fn pod_resource_info(&self, uid: &PodUid) -> Option<PodResourceInfo> {
        self.pods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uid)
            .cloned()
    }

    fn pod_resource_info_map(&self) -> PodResourceInfoMap {
        self.pods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_pod_resource_info(&self, uid: &PodUid, info: PodResourceInfo) -> Result<()> {
        self.pods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uid.clone(), info);
        Ok(())
    }

    fn remove_pod(&self, uid: &PodUid) -> Result<()> {
        self.pods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uid);
        Ok(())
    }

    fn remove_orphaned_pods(&self, remaining: &HashSet<PodUid>) -> Result<()> {
        self.pods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|uid, _| remaining.contains(uid));
        Ok(())
    }

    fn pod_count(&self) -> usize {
        self.pods.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
