//! Allocation manager
//!
//! Owns the allocation and actuation state, the pending resize queue and the
//! resize conditions of every pod on the node. All mutations are serialized by
//! a single lock; reads go straight to the state stores.

use super::admission::{
    can_admit_pod, can_resize_pod, check_resource_manager_policies,
    disallow_resize_for_swappable_containers, is_in_place_resize_allowed,
    is_resize_increasing_requests, NodeConfig, NodeResources, PodAdmission, ResizeFit,
    ResizeOutcome,
};
use super::checkpoint::{CheckpointState, ACTUATED_CHECKPOINT, ALLOCATED_CHECKPOINT};
use super::error::{AllocationError, Result};
use super::progress;
use super::queue::{PendingResizeQueue, ResizePriorityKey};
use super::state::{AllocationState, MemoryState, PodResourceInfo};
use super::{ContainerRuntime, NodeCapacityProvider, PodSource, PodSyncTrigger};
use crate::models::{Container, Pod, PodUid, QosClass, ResourceRequirements, RuntimePodStatus};
use crate::node::NodeSwapConfig;
use crate::observability::{AllocationMetrics, StructuredLogger};
use crate::resources::pod_qos;
use crate::status::{conditions_equivalent, ResizeReason, ResizeStatusStore};
use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Event that caused pending resizes to be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryTrigger {
    PodUpdated,
    ResizeCompleted,
    PodsRemoved,
    Periodic,
}

impl RetryTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryTrigger::PodUpdated => "pod_updated",
            RetryTrigger::ResizeCompleted => "resize_completed",
            RetryTrigger::PodsRemoved => "pods_removed",
            RetryTrigger::Periodic => "periodic",
        }
    }
}

impl fmt::Display for RetryTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overlay recorded allocations onto a pod
///
/// Returns the pod itself, borrowed, when no container differs from its
/// allocation; otherwise an updated copy. Containers without an allocation
/// keep their spec resources.
pub fn update_pod_from_allocation<'a>(
    pod: &'a Pod,
    allocation: Option<&PodResourceInfo>,
) -> (Cow<'a, Pod>, bool) {
    let Some(allocation) = allocation else {
        return (Cow::Borrowed(pod), false);
    };

    if !pod
        .containers()
        .any(|(_, c)| differing_allocation(allocation, c).is_some())
    {
        return (Cow::Borrowed(pod), false);
    }

    let mut updated = pod.clone();
    for container in updated.containers_mut() {
        if let Some(resources) = differing_allocation(allocation, container) {
            container.resources = resources.clone();
        }
    }
    (Cow::Owned(updated), true)
}

fn differing_allocation<'a>(
    allocation: &'a PodResourceInfo,
    container: &Container,
) -> Option<&'a ResourceRequirements> {
    allocation
        .container_resources
        .get(&container.name)
        .filter(|resources| **resources != container.resources)
}

/// Stand-in pod for an allocation whose pod is not registered
fn pod_from_allocation(uid: PodUid, allocation: PodResourceInfo) -> Pod {
    let mut pod = Pod::new(uid, "", "");
    pod.spec.containers = allocation
        .container_resources
        .into_iter()
        .map(|(name, resources)| {
            let mut container = Container::new(name);
            container.resources = resources;
            container
        })
        .collect();
    pod
}

/// Node-local allocation manager
pub struct AllocationManager {
    allocated: Box<dyn AllocationState>,
    actuated: Box<dyn AllocationState>,
    /// Serializes every mutation; guards the pending resize queue
    allocation_lock: Mutex<PendingResizeQueue>,
    status: Arc<ResizeStatusStore>,
    node: Arc<dyn NodeCapacityProvider>,
    runtime: Arc<dyn ContainerRuntime>,
    pods: Arc<dyn PodSource>,
    sync_trigger: Option<Arc<dyn PodSyncTrigger>>,
    node_config: NodeConfig,
    sources_ready: AtomicBool,
    /// Last failed write of each store, cleared by the next successful one
    write_errors: RwLock<StateWriteErrors>,
    metrics: AllocationMetrics,
    logger: StructuredLogger,
}

/// Outstanding checkpoint write failures of the two state stores
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateWriteErrors {
    pub allocated: Option<String>,
    pub actuated: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Store {
    Allocated,
    Actuated,
}

impl AllocationManager {
    pub fn builder() -> AllocationManagerBuilder {
        AllocationManagerBuilder::new()
    }

    fn lock(&self) -> MutexGuard<'_, PendingResizeQueue> {
        self.allocation_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the outcome of a state write before handing it back
    fn track<T>(&self, store: Store, result: Result<T>) -> Result<T> {
        let error = match &result {
            Ok(_) => None,
            Err(e) => {
                self.metrics.inc_checkpoint_errors();
                warn!(error = %e, store = ?store, "Failed to persist allocation state");
                Some(e.to_string())
            }
        };
        let mut errors = self
            .write_errors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match store {
            Store::Allocated => errors.allocated = error,
            Store::Actuated => errors.actuated = error,
        }
        result
    }

    /// Write failures not yet followed by a successful write
    pub fn state_write_errors(&self) -> StateWriteErrors {
        self.write_errors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn status(&self) -> &Arc<ResizeStatusStore> {
        &self.status
    }

    pub fn node_config(&self) -> &NodeConfig {
        &self.node_config
    }

    pub fn set_sources_ready(&self, ready: bool) {
        self.sources_ready.store(ready, Ordering::SeqCst);
    }

    pub fn sources_ready(&self) -> bool {
        self.sources_ready.load(Ordering::SeqCst)
    }

    // ----- Allocation store -----

    /// Record the resources of every container of `pod` as allocated
    pub fn set_allocated_resources(&self, pod: &Pod) -> Result<()> {
        let _guard = self.lock();
        self.store_allocation(pod)
    }

    fn store_allocation(&self, pod: &Pod) -> Result<()> {
        self.track(
            Store::Allocated,
            self.allocated
                .set_pod_resource_info(&pod.uid, PodResourceInfo::from_pod(pod)),
        )?;
        self.metrics.set_allocated_pods(self.allocated.pod_count());
        Ok(())
    }

    pub fn get_container_resource_allocation(
        &self,
        uid: &PodUid,
        container: &str,
    ) -> Option<ResourceRequirements> {
        self.allocated.container_resources(uid, container)
    }

    /// Allocation of every container of the pod
    pub fn get_pod_allocation(&self, uid: &PodUid) -> Option<PodResourceInfo> {
        self.allocated.pod_resource_info(uid)
    }

    /// Whether any allocation was recorded for the pod
    pub fn has_allocation(&self, uid: &PodUid) -> bool {
        self.allocated.pod_resource_info(uid).is_some()
    }

    pub fn allocated_pod_count(&self) -> usize {
        self.allocated.pod_count()
    }

    /// The pod as allocated; see [`update_pod_from_allocation`]
    pub fn update_pod_from_allocation<'a>(&self, pod: &'a Pod) -> (Cow<'a, Pod>, bool) {
        let allocation = self.allocated.pod_resource_info(&pod.uid);
        update_pod_from_allocation(pod, allocation.as_ref())
    }

    /// Drop every record of a pod; unknown pods are a no-op
    ///
    /// Queue entry and conditions go only once the allocation is gone, so a
    /// failed write leaves the pod's resize state intact.
    pub fn remove_pod(&self, uid: &PodUid) -> Result<()> {
        let mut queue = self.lock();
        self.track(Store::Allocated, self.allocated.remove_pod(uid))?;
        let actuated = self.track(Store::Actuated, self.actuated.remove_pod(uid));
        self.metrics.set_allocated_pods(self.allocated.pod_count());

        queue.remove(uid);
        self.metrics.set_pending_resizes(queue.len());
        self.status.remove_pod(uid);
        debug!(pod_uid = %uid, "Removed pod allocation");
        actuated
    }

    /// Drop every pod not in `remaining`
    pub fn remove_orphaned_pods(&self, remaining: &HashSet<PodUid>) -> Result<()> {
        let mut queue = self.lock();
        let orphans: Vec<PodUid> = self
            .allocated
            .pod_resource_info_map()
            .into_keys()
            .filter(|uid| !remaining.contains(uid))
            .collect();

        self.track(Store::Allocated, self.allocated.remove_orphaned_pods(remaining))?;
        let actuated = self.track(Store::Actuated, self.actuated.remove_orphaned_pods(remaining));
        self.metrics.set_allocated_pods(self.allocated.pod_count());

        queue.retain(|uid| remaining.contains(uid));
        self.metrics.set_pending_resizes(queue.len());
        for uid in &orphans {
            self.status.remove_pod(uid);
        }
        if !orphans.is_empty() {
            info!(count = orphans.len(), "Removed orphaned pod allocations");
        }
        actuated
    }

    /// Admit a pod joining the node, recording its allocation if it fits
    ///
    /// A pod that already has an allocation is evaluated at its allocated
    /// resources rather than its spec.
    pub fn admit_pod(&self, pod: &Pod) -> Result<PodAdmission> {
        let node = self.node.node_resources()?;
        let _guard = self.lock();

        let (allocated_pod, _) = self.update_pod_from_allocation(pod);
        let others = self.allocated_pods_except(&pod.uid);
        match can_admit_pod(&others, &allocated_pod, &node.allocatable) {
            Ok(()) => {
                self.store_allocation(&allocated_pod)?;
                debug!(pod_uid = %pod.uid, pod = %pod.key(), "Pod admitted");
                Ok(PodAdmission::Admitted)
            }
            Err(failure) => {
                self.logger.log_pod_rejected(
                    pod.uid.as_str(),
                    &pod.key(),
                    &failure.reason,
                    &failure.message,
                );
                Ok(PodAdmission::Rejected(failure))
            }
        }
    }

    /// Every allocated pod other than `uid`, at its allocated resources
    ///
    /// Pods the pod source does not know yet (restored from a checkpoint) are
    /// rebuilt from their allocation alone, counting every container as a
    /// regular one. Registered pods without an allocation are not counted.
    fn allocated_pods_except(&self, uid: &PodUid) -> Vec<Pod> {
        self.allocated
            .pod_resource_info_map()
            .into_iter()
            .filter(|(other, _)| other != uid)
            .map(|(other, allocation)| match self.pods.pod(&other) {
                Some(pod) => update_pod_from_allocation(&pod, Some(&allocation))
                    .0
                    .into_owned(),
                None => pod_from_allocation(other, allocation),
            })
            .collect()
    }

    // ----- Actuation tracker -----

    /// Record what the runtime applied
    ///
    /// With a container, only that container is recorded. Without one, every
    /// container of `allocated_pod` is recorded as applied.
    pub fn set_actuated_resources(
        &self,
        allocated_pod: &Pod,
        container: Option<&Container>,
    ) -> Result<()> {
        let _guard = self.lock();
        let result = match container {
            Some(container) => self.actuated.set_container_resources(
                &allocated_pod.uid,
                &container.name,
                container.resources.clone(),
            ),
            None => self.actuated.set_pod_resource_info(
                &allocated_pod.uid,
                PodResourceInfo::from_pod(allocated_pod),
            ),
        };
        self.track(Store::Actuated, result)
    }

    /// Resources last applied to a container; `None` if never reported
    pub fn get_actuated_resources(
        &self,
        uid: &PodUid,
        container: &str,
    ) -> Option<ResourceRequirements> {
        self.actuated.container_resources(uid, container)
    }

    /// Actuated resources of every reported container of the pod
    pub fn get_pod_actuation(&self, uid: &PodUid) -> Option<PodResourceInfo> {
        self.actuated.pod_resource_info(uid)
    }

    // ----- Resize evaluation -----

    /// Evaluate a desired resize against the node snapshot and apply the verdict
    ///
    /// Callers hold the allocation lock.
    fn handle_pod_resources_resize(
        &self,
        pod: &Pod,
        node: &NodeResources,
    ) -> Result<ResizeOutcome> {
        let start = Instant::now();
        let outcome = self.evaluate_resize(pod, node);
        self.metrics
            .observe_resize_evaluation(start.elapsed().as_secs_f64());
        if let Ok(outcome) = &outcome {
            self.metrics.inc_resize_outcome(outcome.label());
        }
        outcome
    }

    fn evaluate_resize(&self, pod: &Pod, node: &NodeResources) -> Result<ResizeOutcome> {
        let (allocated_pod, updated) = self.update_pod_from_allocation(pod);
        if !updated {
            self.status.clear_pending(&pod.uid);
            return Ok(ResizeOutcome::Unchanged);
        }

        if let Err(message) = is_in_place_resize_allowed(pod) {
            return Ok(self.mark_infeasible(pod, message));
        }
        if let Some(message) =
            disallow_resize_for_swappable_containers(self.runtime.as_ref(), pod, &allocated_pod)
        {
            return Ok(self.mark_infeasible(pod, message));
        }
        if let Err(message) = check_resource_manager_policies(pod, &self.node_config) {
            return Ok(self.mark_infeasible(pod, message));
        }

        let fit = if is_resize_increasing_requests(&allocated_pod, pod) {
            let others = self.allocated_pods_except(&pod.uid);
            can_resize_pod(&others, &allocated_pod, pod, node)
        } else {
            ResizeFit::Fit
        };

        match fit {
            ResizeFit::Fit => {
                self.store_allocation(pod)?;
                self.status.clear_pending(&pod.uid);
                // Restart the in-progress condition at the new generation
                self.status.clear_in_progress(&pod.uid);
                self.status.set_in_progress(&pod.uid, "", pod.generation);
                self.logger
                    .log_resize_allocated(pod.uid.as_str(), &pod.key(), pod.generation);
                Ok(ResizeOutcome::Allocated)
            }
            ResizeFit::Deferred(message) => {
                self.status
                    .set_pending(&pod.uid, ResizeReason::Deferred, message.clone(), pod.generation);
                self.logger
                    .log_resize_deferred(pod.uid.as_str(), &pod.key(), &message);
                Ok(ResizeOutcome::Deferred(message))
            }
            ResizeFit::Infeasible(message) => Ok(self.mark_infeasible(pod, message)),
        }
    }

    fn mark_infeasible(&self, pod: &Pod, message: String) -> ResizeOutcome {
        self.status
            .set_pending(&pod.uid, ResizeReason::Infeasible, message.clone(), pod.generation);
        self.logger
            .log_resize_infeasible(pod.uid.as_str(), &pod.key(), &message);
        ResizeOutcome::Infeasible(message)
    }

    /// Whether the desired pod asks for more cpu or memory than is allocated
    pub fn is_resize_increasing_requests(&self, pod: &Pod) -> bool {
        let (allocated_pod, updated) = self.update_pod_from_allocation(pod);
        updated && is_resize_increasing_requests(&allocated_pod, pod)
    }

    // ----- Pending resize queue -----

    /// Queue a pod for resize evaluation; re-queuing is a no-op
    pub fn push_pending_resize(&self, uid: PodUid) {
        let mut queue = self.lock();
        if queue.push(uid.clone()) {
            debug!(pod_uid = %uid, "Queued pending resize");
        }
        self.sort_pending_resizes(&mut queue);
        self.metrics.set_pending_resizes(queue.len());
    }

    fn sort_pending_resizes(&self, queue: &mut PendingResizeQueue) {
        queue.sort_by_key_fn(|uid| self.resize_priority_key(uid));
    }

    fn resize_priority_key(&self, uid: &PodUid) -> Option<ResizePriorityKey> {
        let pod = self.pods.pod(uid)?;
        Some(ResizePriorityKey {
            increasing: self.is_resize_increasing_requests(&pod),
            priority: pod.priority(),
            guaranteed: pod_qos(&pod) == QosClass::Guaranteed,
            pending_since: self.status.pending_since(uid),
        })
    }

    pub fn has_pending_resizes(&self) -> bool {
        !self.lock().is_empty()
    }

    /// Queued pods in retry order
    pub fn pending_resizes(&self) -> Vec<PodUid> {
        self.lock().uids().to_vec()
    }

    /// Re-evaluate every queued resize in priority order
    ///
    /// Deferred resizes and resizes that failed to persist stay queued.
    /// Returns the pods whose resize was allocated.
    pub fn retry_pending_resizes(&self, trigger: RetryTrigger) -> Vec<Pod> {
        if !self.sources_ready() {
            debug!(trigger = %trigger, "Pod sources not ready, skipping resize retry");
            return Vec::new();
        }

        // Fetch before locking; capacity lookups may be slow
        let node = match self.node.node_resources() {
            Ok(node) => node,
            Err(e) => {
                warn!(error = %e, trigger = %trigger, "Cannot retry pending resizes");
                return Vec::new();
            }
        };

        let mut queue = self.lock();
        let mut still_pending = Vec::new();
        let mut allocated = Vec::new();

        for uid in queue.take() {
            let Some(pod) = self.pods.pod(&uid) else {
                debug!(pod_uid = %uid, "Dropping pending resize of unknown pod");
                continue;
            };

            let old_conditions = self.status.conditions(&uid);
            let was_deferred = self.status.is_deferred(&uid);

            let result = self.handle_pod_resources_resize(&pod, &node);
            let resize_allocated = matches!(result, Ok(ResizeOutcome::Allocated));
            match result {
                Err(e) => {
                    warn!(pod_uid = %uid, error = %e, "Resize evaluation failed, will retry");
                    still_pending.push(uid.clone());
                }
                Ok(_) if self.status.is_deferred(&uid) => still_pending.push(uid.clone()),
                Ok(ResizeOutcome::Allocated) => {
                    if was_deferred {
                        self.metrics.inc_deferred_accepted(trigger.as_str());
                    }
                    allocated.push(pod.clone());
                }
                Ok(_) => {}
            }

            let conditions_changed =
                !conditions_equivalent(&old_conditions, &self.status.conditions(&uid));
            if resize_allocated || conditions_changed {
                if let Some(sync) = &self.sync_trigger {
                    sync.trigger_pod_sync(&pod);
                }
            }
        }

        queue.extend(still_pending);
        self.metrics.set_pending_resizes(queue.len());
        if !allocated.is_empty() {
            info!(trigger = %trigger, count = allocated.len(), "Allocated pending resizes");
        }
        allocated
    }

    // ----- Progress monitor -----

    /// Whether the runtime is still applying the pod's allocation
    pub fn is_pod_resize_in_progress(
        &self,
        allocated_pod: &Pod,
        status: &RuntimePodStatus,
    ) -> bool {
        progress::is_pod_resize_in_progress(allocated_pod, status, |name| {
            self.actuated.container_resources(&allocated_pod.uid, name)
        })
    }

    /// Refresh the in-progress condition from the runtime status
    ///
    /// When a resize completes, freed room may let deferred resizes through,
    /// so the queue is retried.
    pub fn check_pod_resize_in_progress(&self, allocated_pod: &Pod, status: &RuntimePodStatus) {
        let completed = {
            let _guard = self.lock();
            if self.is_pod_resize_in_progress(allocated_pod, status) {
                self.status
                    .set_in_progress(&allocated_pod.uid, "", allocated_pod.generation);
                false
            } else {
                self.status.clear_in_progress(&allocated_pod.uid)
            }
        };

        if completed {
            self.logger
                .log_resize_completed(allocated_pod.uid.as_str(), &allocated_pod.key());
            self.retry_pending_resizes(RetryTrigger::ResizeCompleted);
        }
    }
}

/// Builder for [`AllocationManager`]
pub struct AllocationManagerBuilder {
    node: Option<Arc<dyn NodeCapacityProvider>>,
    pods: Option<Arc<dyn PodSource>>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    sync_trigger: Option<Arc<dyn PodSyncTrigger>>,
    status: Option<Arc<ResizeStatusStore>>,
    state_dir: Option<PathBuf>,
    node_config: NodeConfig,
    node_name: String,
    sources_ready: bool,
}

impl AllocationManagerBuilder {
    pub fn new() -> Self {
        Self {
            node: None,
            pods: None,
            runtime: None,
            sync_trigger: None,
            status: None,
            state_dir: None,
            node_config: NodeConfig::default(),
            node_name: "unknown".to_string(),
            sources_ready: true,
        }
    }

    pub fn node(mut self, node: Arc<dyn NodeCapacityProvider>) -> Self {
        self.node = Some(node);
        self
    }

    pub fn pods(mut self, pods: Arc<dyn PodSource>) -> Self {
        self.pods = Some(pods);
        self
    }

    /// Runtime used for swap lookups; defaults to a node without swap
    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn sync_trigger(mut self, trigger: Arc<dyn PodSyncTrigger>) -> Self {
        self.sync_trigger = Some(trigger);
        self
    }

    /// Share an existing condition store
    pub fn status(mut self, status: Arc<ResizeStatusStore>) -> Self {
        self.status = Some(status);
        self
    }

    /// Checkpoint state under `dir`; without it state is kept in memory only
    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn node_config(mut self, config: NodeConfig) -> Self {
        self.node_config = config;
        self
    }

    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = name.into();
        self
    }

    /// Whether pending resizes may be retried right away
    pub fn sources_ready(mut self, ready: bool) -> Self {
        self.sources_ready = ready;
        self
    }

    pub fn build(self) -> Result<AllocationManager> {
        let node = self.node.ok_or(AllocationError::MissingComponent("node capacity provider"))?;
        let pods = self.pods.ok_or(AllocationError::MissingComponent("pod source"))?;

        let (allocated, actuated): (Box<dyn AllocationState>, Box<dyn AllocationState>) =
            match &self.state_dir {
                Some(dir) => (
                    Box::new(CheckpointState::open(dir, ALLOCATED_CHECKPOINT)?),
                    Box::new(CheckpointState::open(dir, ACTUATED_CHECKPOINT)?),
                ),
                None => (Box::new(MemoryState::new()), Box::new(MemoryState::new())),
            };

        let metrics = AllocationMetrics::new();
        metrics.set_allocated_pods(allocated.pod_count());
        metrics.set_pending_resizes(0);

        Ok(AllocationManager {
            allocated,
            actuated,
            allocation_lock: Mutex::new(PendingResizeQueue::new()),
            status: self.status.unwrap_or_default(),
            node,
            runtime: self
                .runtime
                .unwrap_or_else(|| Arc::new(NodeSwapConfig::default())),
            pods,
            sync_trigger: self.sync_trigger,
            node_config: self.node_config,
            sources_ready: AtomicBool::new(self.sources_ready),
            write_errors: RwLock::new(StateWriteErrors::default()),
            metrics,
            logger: StructuredLogger::new(self.node_name),
        })
    }
}

impl Default for AllocationManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
