use super::*;
use crate::models::{
    ContainerState, ContainerStatus, QosClass, ResourceRequirements, ResourceResizeRestartPolicy,
    RuntimePodStatus, CONFIG_SOURCE_ANNOTATION, FILE_SOURCE,
};
use crate::node::{PodRegistry, StaticNodeResources};
use crate::quantity::Quantity;
use crate::resources::{resource_list, ResourceList, ResourceName};
use crate::status::{ResizeConditionType, ResizeReason};
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

fn q(s: &str) -> Quantity {
    s.parse().unwrap()
}

fn cpu_mem(cpu: &str, memory: &str) -> ResourceList {
    resource_list([(ResourceName::Cpu, q(cpu)), (ResourceName::Memory, q(memory))])
}

fn cpu_only(cpu: &str) -> ResourceList {
    resource_list([(ResourceName::Cpu, q(cpu))])
}

/// 4 cpu / 4Gi allocatable out of 8 cpu / 8Gi
fn test_node() -> Arc<StaticNodeResources> {
    Arc::new(StaticNodeResources::new(NodeResources {
        allocatable: resource_list([
            (ResourceName::Cpu, q("4")),
            (ResourceName::Memory, q("4Gi")),
            (ResourceName::Pods, q("40")),
        ]),
        capacity: resource_list([
            (ResourceName::Cpu, q("8")),
            (ResourceName::Memory, q("8Gi")),
            (ResourceName::Pods, q("40")),
        ]),
    }))
}

struct Harness {
    manager: AllocationManager,
    registry: Arc<PodRegistry>,
    syncs: mpsc::UnboundedReceiver<PodSyncEvent>,
}

impl Harness {
    fn new(pods: &[Pod]) -> Self {
        Self::build(pods, |builder| builder)
    }

    fn build(
        pods: &[Pod],
        configure: impl FnOnce(AllocationManagerBuilder) -> AllocationManagerBuilder,
    ) -> Self {
        let registry = Arc::new(PodRegistry::new());
        for pod in pods {
            registry.upsert(pod.clone());
        }
        let (tx, syncs) = mpsc::unbounded_channel();
        let builder = AllocationManager::builder()
            .node(test_node())
            .pods(registry.clone())
            .sync_trigger(Arc::new(tx))
            .node_name("test-node");
        let manager = configure(builder).build().unwrap();
        Self {
            manager,
            registry,
            syncs,
        }
    }

    fn sync_triggered(&mut self) -> bool {
        let mut triggered = false;
        while self.syncs.try_recv().is_ok() {
            triggered = true;
        }
        triggered
    }
}

/// Runtime status with every container running
fn running_status(pod: &Pod) -> RuntimePodStatus {
    let mut status = RuntimePodStatus::new(pod);
    status.container_statuses = pod
        .containers()
        .map(|(_, c)| ContainerStatus::new(c.name.clone(), ContainerState::Running))
        .collect();
    status
}

fn fixture_pods() -> (Pod, Pod, Pod) {
    let pod1 = Pod::new("1111", "pod1", "ns1")
        .with_container(Container::new("c1").with_requests(cpu_mem("1", "1Gi")));
    let pod2 = Pod::new("2222", "pod2", "ns2").with_init_container(
        Container::new("c1-init")
            .restartable()
            .with_requests(cpu_mem("1", "1Gi")),
    );
    let mut pod3 = pod1.clone();
    pod3.uid = PodUid::from("3333");
    pod3.name = "pod3".to_string();
    pod3.namespace = "ns2".to_string();
    (pod1, pod2, pod3)
}

fn resized_container(pod: &mut Pod, sidecar: bool) -> &mut Container {
    if sidecar {
        &mut pod.spec.init_containers[0]
    } else {
        &mut pod.spec.containers[0]
    }
}

#[derive(Debug, Clone)]
enum Expected {
    NoConditions,
    InProgress,
    Pending(ResizeReason, &'static str),
}

#[derive(Debug, Clone)]
struct ResizeCase {
    name: &'static str,
    original_requests: ResourceList,
    new_requests: ResourceList,
    original_limits: ResourceList,
    new_limits: ResourceList,
    new_resources_allocated: bool,
    expected_requests: ResourceList,
    expected_limits: ResourceList,
    expected: Expected,
    expect_sync: bool,
    static_pod: bool,
}

fn case(
    name: &'static str,
    original_requests: ResourceList,
    new_requests: ResourceList,
    expected_requests: ResourceList,
    expected: Expected,
) -> ResizeCase {
    ResizeCase {
        name,
        original_requests,
        new_requests,
        original_limits: ResourceList::new(),
        new_limits: ResourceList::new(),
        new_resources_allocated: false,
        expected_requests,
        expected_limits: ResourceList::new(),
        expected,
        expect_sync: true,
        static_pod: false,
    }
}

fn run_resize_case(tc: &ResizeCase, sidecar: bool) {
    let label = format!("{}/sidecar={}", tc.name, sidecar);
    let (pod1, pod2, pod3) = fixture_pods();

    let mut original = if sidecar { pod2.clone() } else { pod1.clone() };
    if tc.static_pod {
        original
            .annotations
            .insert(CONFIG_SOURCE_ANNOTATION.to_string(), FILE_SOURCE.to_string());
    }
    resized_container(&mut original, sidecar).resources =
        ResourceRequirements::new(tc.original_requests.clone(), tc.original_limits.clone());

    let mut desired = original.clone();
    resized_container(&mut desired, sidecar).resources =
        ResourceRequirements::new(tc.new_requests.clone(), tc.new_limits.clone());

    let status = running_status(&original);
    let mut h = Harness::new(&[pod1.clone(), pod2.clone(), pod3.clone()]);
    h.registry.upsert(desired.clone());
    for other in [&pod1, &pod2, &pod3] {
        if other.uid != original.uid {
            h.manager.set_allocated_resources(other).unwrap();
        }
    }

    let to_allocate = if tc.new_resources_allocated {
        &desired
    } else {
        &original
    };
    h.manager.set_allocated_resources(to_allocate).unwrap();
    h.manager.set_actuated_resources(&original, None).unwrap();

    h.manager.push_pending_resize(original.uid.clone());
    h.manager.retry_pending_resizes(RetryTrigger::PodUpdated);
    let (allocated_pod, _) = h.manager.update_pod_from_allocation(&desired);
    h.manager.check_pod_resize_in_progress(&allocated_pod, &status);

    let uid = &desired.uid;
    let kept_original =
        h.manager.status().is_infeasible(uid) || h.manager.status().is_deferred(uid);
    let mut updated = if kept_original {
        original.clone()
    } else {
        desired.clone()
    };
    let container = resized_container(&mut updated, sidecar).clone();
    assert_eq!(container.resources.requests, tc.expected_requests, "{}: spec requests", label);
    assert_eq!(container.resources.limits, tc.expected_limits, "{}: spec limits", label);

    let allocation = h
        .manager
        .get_container_resource_allocation(uid, &container.name)
        .unwrap_or_else(|| panic!("{}: missing container allocation", label));
    assert_eq!(allocation.requests, tc.expected_requests, "{}: stored requests", label);
    assert_eq!(allocation.limits, tc.expected_limits, "{}: stored limits", label);

    let conditions = h.manager.status().conditions(uid);
    match &tc.expected {
        Expected::NoConditions => assert!(conditions.is_empty(), "{}: {:?}", label, conditions),
        Expected::InProgress => {
            assert_eq!(conditions.len(), 1, "{}: {:?}", label, conditions);
            assert_eq!(conditions[0].condition_type, ResizeConditionType::PodResizeInProgress);
            assert_eq!(conditions[0].reason, None, "{}", label);
        }
        Expected::Pending(reason, message) => {
            assert_eq!(conditions.len(), 1, "{}: {:?}", label, conditions);
            assert_eq!(conditions[0].condition_type, ResizeConditionType::PodResizePending);
            assert_eq!(conditions[0].reason, Some(*reason), "{}", label);
            assert!(
                conditions[0].message.contains(message),
                "{}: message {:?} should contain {:?}",
                label,
                conditions[0].message,
                message
            );
        }
    }

    assert_eq!(h.sync_triggered(), tc.expect_sync, "{}: pod sync", label);
}

#[test]
fn test_handle_pod_resources_resize() {
    let cases = vec![
        case(
            "Request CPU and memory decrease",
            cpu_mem("1", "1Gi"),
            cpu_mem("500m", "500Mi"),
            cpu_mem("500m", "500Mi"),
            Expected::InProgress,
        ),
        case(
            "Request CPU increase, memory decrease",
            cpu_mem("1", "1Gi"),
            cpu_mem("1500m", "500Mi"),
            cpu_mem("1500m", "500Mi"),
            Expected::InProgress,
        ),
        case(
            "Request CPU decrease, memory increase",
            cpu_mem("1", "1Gi"),
            cpu_mem("500m", "1500Mi"),
            cpu_mem("500m", "1500Mi"),
            Expected::InProgress,
        ),
        case(
            "Request CPU and memory increase beyond current capacity",
            cpu_mem("1", "1Gi"),
            cpu_mem("2500m", "2500Mi"),
            cpu_mem("1", "1Gi"),
            Expected::Pending(ResizeReason::Deferred, ""),
        ),
        case(
            "Request CPU decrease and memory increase beyond current capacity",
            cpu_mem("1", "1Gi"),
            cpu_mem("500m", "2500Mi"),
            cpu_mem("1", "1Gi"),
            Expected::Pending(
                ResizeReason::Deferred,
                "Node didn't have enough resource: memory",
            ),
        ),
        case(
            "Request memory increase beyond node capacity",
            cpu_mem("1", "1Gi"),
            cpu_mem("1", "4500Mi"),
            cpu_mem("1", "1Gi"),
            Expected::Pending(
                ResizeReason::Infeasible,
                "Node didn't have enough capacity: memory, requested: 4718592000, \
                 capacity: 4294967296",
            ),
        ),
        case(
            "Request CPU increase beyond node capacity",
            cpu_mem("1", "1Gi"),
            cpu_mem("5000m", "1Gi"),
            cpu_mem("1", "1Gi"),
            Expected::Pending(
                ResizeReason::Infeasible,
                "Node didn't have enough capacity: cpu, requested: 5000, capacity: 4000",
            ),
        ),
        ResizeCase {
            new_resources_allocated: true,
            expect_sync: false,
            ..case(
                "CPU increase in progress",
                cpu_mem("1", "1Gi"),
                cpu_mem("1500m", "1Gi"),
                cpu_mem("1500m", "1Gi"),
                Expected::InProgress,
            )
        },
        ResizeCase {
            expect_sync: false,
            ..case(
                "No resize",
                cpu_mem("1", "1Gi"),
                cpu_mem("1", "1Gi"),
                cpu_mem("1", "1Gi"),
                Expected::NoConditions,
            )
        },
        ResizeCase {
            static_pod: true,
            ..case(
                "static pod",
                cpu_mem("1", "1Gi"),
                cpu_mem("500m", "500Mi"),
                cpu_mem("1", "1Gi"),
                Expected::Pending(ResizeReason::Infeasible, STATIC_POD_RESIZE_MESSAGE),
            )
        },
        case(
            "Increase CPU from min shares",
            cpu_only("2m"),
            cpu_only("1"),
            cpu_only("1"),
            Expected::InProgress,
        ),
        case(
            "Decrease CPU to min shares",
            cpu_only("1"),
            cpu_only("2m"),
            cpu_only("2m"),
            Expected::InProgress,
        ),
        ResizeCase {
            original_limits: cpu_only("10m"),
            new_limits: cpu_only("20m"),
            expected_limits: cpu_only("20m"),
            ..case(
                "Increase CPU from min limit",
                cpu_only("10m"),
                cpu_only("10m"),
                cpu_only("10m"),
                Expected::InProgress,
            )
        },
        ResizeCase {
            original_limits: cpu_only("20m"),
            new_limits: cpu_only("10m"),
            expected_limits: cpu_only("10m"),
            ..case(
                "Decrease CPU to min limit",
                cpu_only("10m"),
                cpu_only("10m"),
                cpu_only("10m"),
                Expected::InProgress,
            )
        },
    ];

    for tc in &cases {
        for sidecar in [false, true] {
            run_resize_case(tc, sidecar);
        }
    }
}

const NO_SWAP_CONTAINER: &str = "test-container-noswap";
const SWAP_CONTAINER: &str = "test-container-limitedswap";

/// Runtime whose swap behavior is decided by container name
struct NamedSwapRuntime;

impl ContainerRuntime for NamedSwapRuntime {
    fn swap_behavior(&self, _pod: &Pod, container: &Container) -> SwapBehavior {
        if container.name == SWAP_CONTAINER {
            SwapBehavior::LimitedSwap
        } else {
            SwapBehavior::NoSwap
        }
    }
}

#[test]
fn test_handle_pod_resources_resize_with_swap() {
    struct SwapCase {
        name: &'static str,
        container: &'static str,
        memory_policy: ResourceResizeRestartPolicy,
        sidecar: bool,
        expected_requests: ResourceList,
        expected: Expected,
    }

    let cases = [
        SwapCase {
            name: "NoSwap memory decrease with RestartContainer",
            container: NO_SWAP_CONTAINER,
            memory_policy: ResourceResizeRestartPolicy::RestartContainer,
            sidecar: false,
            expected_requests: cpu_mem("500m", "500Mi"),
            expected: Expected::InProgress,
        },
        SwapCase {
            name: "LimitedSwap memory change with RestartContainer",
            container: SWAP_CONTAINER,
            memory_policy: ResourceResizeRestartPolicy::RestartContainer,
            sidecar: false,
            expected_requests: cpu_mem("500m", "500Mi"),
            expected: Expected::InProgress,
        },
        SwapCase {
            name: "LimitedSwap memory change with NotRequired",
            container: SWAP_CONTAINER,
            memory_policy: ResourceResizeRestartPolicy::NotRequired,
            sidecar: false,
            expected_requests: cpu_mem("1", "1Gi"),
            expected: Expected::Pending(ResizeReason::Infeasible, SWAP_RESIZE_MESSAGE),
        },
        SwapCase {
            name: "LimitedSwap sidecar memory change with NotRequired",
            container: SWAP_CONTAINER,
            memory_policy: ResourceResizeRestartPolicy::NotRequired,
            sidecar: true,
            expected_requests: cpu_mem("1", "1Gi"),
            expected: Expected::Pending(ResizeReason::Infeasible, SWAP_RESIZE_MESSAGE),
        },
        SwapCase {
            name: "LimitedSwap sidecar memory change with RestartContainer",
            container: SWAP_CONTAINER,
            memory_policy: ResourceResizeRestartPolicy::RestartContainer,
            sidecar: true,
            expected_requests: cpu_mem("500m", "500Mi"),
            expected: Expected::InProgress,
        },
    ];

    for tc in &cases {
        let container = Container::new(tc.container)
            .with_requests(cpu_mem("1", "1Gi"))
            .with_resize_policy(ResourceName::Memory, tc.memory_policy);
        let original = if tc.sidecar {
            Pod::new("2222", "pod2", "ns2").with_init_container(container.restartable())
        } else {
            Pod::new("1111", "pod1", "ns1").with_container(container)
        };
        let mut desired = original.clone();
        resized_container(&mut desired, tc.sidecar).resources.requests = cpu_mem("500m", "500Mi");

        let h = Harness::build(&[desired.clone()], |b| b.runtime(Arc::new(NamedSwapRuntime)));
        h.manager.set_allocated_resources(&original).unwrap();
        h.manager.set_actuated_resources(&original, None).unwrap();

        h.manager.push_pending_resize(original.uid.clone());
        h.manager.retry_pending_resizes(RetryTrigger::PodUpdated);
        let (allocated_pod, _) = h.manager.update_pod_from_allocation(&desired);
        h.manager
            .check_pod_resize_in_progress(&allocated_pod, &running_status(&original));

        let allocation = h
            .manager
            .get_container_resource_allocation(&desired.uid, tc.container)
            .unwrap();
        assert_eq!(allocation.requests, tc.expected_requests, "{}", tc.name);

        let conditions = h.manager.status().conditions(&desired.uid);
        assert_eq!(conditions.len(), 1, "{}: {:?}", tc.name, conditions);
        match &tc.expected {
            Expected::InProgress => assert_eq!(
                conditions[0].condition_type,
                ResizeConditionType::PodResizeInProgress,
                "{}",
                tc.name
            ),
            Expected::Pending(reason, message) => {
                assert_eq!(conditions[0].reason, Some(*reason), "{}", tc.name);
                assert_eq!(conditions[0].message, *message, "{}", tc.name);
            }
            Expected::NoConditions => unreachable!(),
        }
    }
}

fn update_test_pod() -> Pod {
    let requirements = |cpu_req: i64, mem_req: i64, cpu_lim: i64, mem_lim: i64| {
        ResourceRequirements::new(
            resource_list([
                (ResourceName::Cpu, Quantity::from_millis(cpu_req)),
                (ResourceName::Memory, Quantity::new(mem_req)),
            ]),
            resource_list([
                (ResourceName::Cpu, Quantity::from_millis(cpu_lim)),
                (ResourceName::Memory, Quantity::new(mem_lim)),
            ]),
        )
    };

    let mut c1 = Container::new("c1");
    c1.resources = requirements(100, 200, 300, 400);
    let mut c2 = Container::new("c2");
    c2.resources = requirements(500, 600, 700, 800);
    let mut sidecar = Container::new("c1-restartable-init").restartable();
    sidecar.resources = requirements(200, 300, 400, 500);
    let mut init = Container::new("c1-init");
    init.resources = requirements(500, 600, 700, 800);

    Pod::new("12345", "test", "default")
        .with_container(c1)
        .with_container(c2)
        .with_init_container(sidecar)
        .with_init_container(init)
}

#[test]
fn test_update_pod_from_allocation() {
    let pod = update_test_pod();
    let mut resized = pod.clone();
    resized.spec.containers[0]
        .resources
        .requests
        .insert(ResourceName::Cpu, Quantity::from_millis(200));
    resized.spec.init_containers[0]
        .resources
        .requests
        .insert(ResourceName::Cpu, Quantity::from_millis(300));

    let missing_container = PodResourceInfo {
        container_resources: [("c2".to_string(), pod.spec.containers[1].resources.clone())]
            .into_iter()
            .collect(),
    };

    let unchanged: Vec<(&str, Option<PodResourceInfo>)> = vec![
        ("steady state", Some(PodResourceInfo::from_pod(&pod))),
        ("no allocations", None),
        ("missing container allocation", Some(missing_container)),
    ];
    for (name, allocation) in &unchanged {
        let (allocated, updated) = update_pod_from_allocation(&pod, allocation.as_ref());
        assert!(!updated, "{}", name);
        assert!(
            matches!(allocated, Cow::Borrowed(p) if std::ptr::eq(p, &pod)),
            "{}: expected the same pod back",
            name
        );
    }

    let allocation = PodResourceInfo::from_pod(&resized);
    let (allocated, updated) = update_pod_from_allocation(&pod, Some(&allocation));
    assert!(updated);
    assert_eq!(allocated.as_ref(), &resized);
    assert_ne!(allocated.as_ref(), &pod);
}

#[test]
fn test_is_resize_increasing_requests() {
    let cases: Vec<(&str, Vec<(usize, ResourceList)>, bool)> = vec![
        ("increase requests, one container", vec![(0, cpu_mem("1500m", "1500Mi"))], true),
        ("decrease requests, one container", vec![(0, cpu_mem("500m", "500Mi"))], false),
        ("increase cpu, decrease memory", vec![(0, cpu_mem("1500m", "500Mi"))], true),
        ("increase memory, decrease cpu", vec![(0, cpu_mem("500m", "1500Mi"))], true),
        (
            "increase one container, decrease another, net neutral",
            vec![(0, cpu_mem("1500m", "1500Mi")), (1, cpu_mem("500m", "500Mi"))],
            false,
        ),
        (
            "decrease requests, two containers",
            vec![(0, cpu_mem("500m", "500Mi")), (1, cpu_mem("500m", "500Mi"))],
            false,
        ),
        ("remove requests", vec![(0, ResourceList::new())], false),
        ("add requests to empty container", vec![(2, cpu_mem("1", "1Gi"))], true),
        ("add requests to unset container", vec![(3, cpu_mem("1", "1Gi"))], true),
    ];

    for (name, new_requests, expected) in cases {
        let mut pod = Pod::new("1111", "pod1", "ns1")
            .with_container(Container::new("c1").with_requests(cpu_mem("1", "1Gi")))
            .with_container(Container::new("c2").with_requests(cpu_mem("1", "1Gi")))
            .with_container(Container::new("c3").with_requests(ResourceList::new()))
            .with_container(Container::new("c4"));
        let h = Harness::new(&[pod.clone()]);
        h.manager.set_allocated_resources(&pod).unwrap();

        for (index, requests) in new_requests {
            pod.spec.containers[index].resources.requests = requests;
        }
        assert_eq!(h.manager.is_resize_increasing_requests(&pod), expected, "{}", name);
    }
}

#[test]
fn test_sort_pending_resizes() {
    let originals: Vec<Pod> = (0..6)
        .map(|i| {
            Pod::new(i.to_string(), format!("pod{}", i), format!("ns{}", i))
                .with_container(
                    Container::new(format!("c{}", i)).with_requests(cpu_mem("1", "1Gi")),
                )
        })
        .collect();

    // pod 0 shrinks; every other pod grows
    let mut modified = originals.clone();
    modified[0].spec.containers[0].resources.requests = cpu_mem("500m", "500Mi");
    for pod in modified.iter_mut().skip(1) {
        pod.spec.containers[0].resources.requests = cpu_mem("1500m", "1500Mi");
    }
    modified[1].spec.priority = Some(100);
    modified[2].status.qos_class = Some(QosClass::Guaranteed);

    let h = Harness::new(&originals);
    for pod in &originals {
        h.manager.set_allocated_resources(pod).unwrap();
    }
    for pod in &modified {
        h.registry.upsert(pod.clone());
    }

    // pod 3 has been deferred longer than pod 4; pod 5 was never evaluated
    let status = h.manager.status().clone();
    status.set_pending(&modified[3].uid, ResizeReason::Deferred, "some-message", 1);
    std::thread::sleep(std::time::Duration::from_millis(5));
    status.set_pending(&modified[4].uid, ResizeReason::Deferred, "some-message", 1);

    let expected: Vec<PodUid> = modified.iter().map(|p| p.uid.clone()).collect();

    for pod in &modified {
        h.manager.push_pending_resize(pod.uid.clone());
    }
    assert_eq!(h.manager.pending_resizes(), expected);

    // Same pods and conditions, pushed in reverse
    let reversed = AllocationManager::builder()
        .node(test_node())
        .pods(h.registry.clone())
        .status(status)
        .build()
        .unwrap();
    for pod in &originals {
        reversed.set_allocated_resources(pod).unwrap();
    }
    for pod in modified.iter().rev() {
        reversed.push_pending_resize(pod.uid.clone());
    }
    assert_eq!(reversed.pending_resizes(), expected);
}

#[test]
fn test_push_pending_resize_is_idempotent() {
    let (pod1, _, _) = fixture_pods();
    let h = Harness::new(&[pod1.clone()]);
    h.manager.push_pending_resize(pod1.uid.clone());
    h.manager.push_pending_resize(pod1.uid.clone());
    assert_eq!(h.manager.pending_resizes(), vec![pod1.uid.clone()]);
}

#[test]
fn test_deferred_resize_allocated_after_completed_resize() {
    let (pod1, _, pod3) = fixture_pods();
    let big = Pod::new("4444", "big", "ns3")
        .with_container(Container::new("c1").with_requests(cpu_mem("2", "1Gi")));
    let mut h = Harness::new(&[pod1.clone(), pod3.clone(), big.clone()]);
    for pod in [&pod1, &pod3, &big] {
        h.manager.set_allocated_resources(pod).unwrap();
        h.manager.set_actuated_resources(pod, None).unwrap();
    }

    // pod1 shrinks; the runtime has not applied it yet
    let mut shrunk = pod1.clone();
    shrunk.spec.containers[0].resources.requests = cpu_mem("500m", "1Gi");
    h.registry.upsert(shrunk.clone());
    h.manager.push_pending_resize(shrunk.uid.clone());
    assert_eq!(h.manager.retry_pending_resizes(RetryTrigger::PodUpdated).len(), 1);
    h.manager
        .check_pod_resize_in_progress(&shrunk, &running_status(&shrunk));
    assert!(h.manager.status().resize_state(&shrunk.uid) == crate::status::ResizeState::InProgress);

    // pod3 wants 1500m more than the remaining 500m
    let mut grown = pod3.clone();
    grown.spec.containers[0].resources.requests = cpu_mem("2", "1Gi");
    h.registry.upsert(grown.clone());
    h.manager.push_pending_resize(grown.uid.clone());
    assert!(h.manager.retry_pending_resizes(RetryTrigger::PodUpdated).is_empty());
    assert!(h.manager.status().is_deferred(&grown.uid));
    assert!(h.sync_triggered());

    // Free room without retrying, then report pod1 as resized
    h.registry.remove(&big.uid);
    h.manager.remove_pod(&big.uid).unwrap();
    h.manager.set_actuated_resources(&shrunk, None).unwrap();
    h.manager
        .check_pod_resize_in_progress(&shrunk, &running_status(&shrunk));

    assert!(h.manager.status().conditions(&shrunk.uid).is_empty());
    assert!(!h.manager.has_pending_resizes());
    assert_eq!(
        h.manager
            .get_container_resource_allocation(&grown.uid, "c1")
            .unwrap()
            .requests,
        cpu_mem("2", "1Gi")
    );
    assert_eq!(
        h.manager.status().resize_state(&grown.uid),
        crate::status::ResizeState::InProgress
    );
    assert!(h.sync_triggered());
}

#[test]
fn test_retry_skipped_until_sources_ready() {
    let (pod1, _, _) = fixture_pods();
    let mut h = Harness::build(&[pod1.clone()], |b| b.sources_ready(false));
    h.manager.set_allocated_resources(&pod1).unwrap();

    let mut desired = pod1.clone();
    desired.spec.containers[0].resources.requests = cpu_mem("500m", "500Mi");
    h.registry.upsert(desired.clone());
    h.manager.push_pending_resize(desired.uid.clone());

    assert!(h.manager.retry_pending_resizes(RetryTrigger::Periodic).is_empty());
    assert!(h.manager.has_pending_resizes());
    assert!(h.manager.status().conditions(&desired.uid).is_empty());
    assert!(!h.sync_triggered());

    h.manager.set_sources_ready(true);
    assert_eq!(h.manager.retry_pending_resizes(RetryTrigger::Periodic).len(), 1);
    assert!(!h.manager.has_pending_resizes());
    assert!(h.sync_triggered());
}

#[test]
fn test_pending_resize_of_unknown_pod_is_dropped() {
    let h = Harness::new(&[]);
    h.manager.push_pending_resize(PodUid::from("gone"));
    assert!(h.manager.retry_pending_resizes(RetryTrigger::Periodic).is_empty());
    assert!(!h.manager.has_pending_resizes());
}

#[test]
fn test_admit_pod() {
    let (pod1, pod2, pod3) = fixture_pods();
    let h = Harness::new(&[pod1.clone(), pod2.clone(), pod3.clone()]);
    for pod in [&pod1, &pod2, &pod3] {
        assert!(h.manager.admit_pod(pod).unwrap().is_admitted());
    }
    assert_eq!(h.manager.allocated_pod_count(), 3);

    let too_big = Pod::new("5555", "big", "ns")
        .with_container(Container::new("c").with_requests(cpu_mem("1500m", "100Mi")));
    h.registry.upsert(too_big.clone());
    match h.manager.admit_pod(&too_big).unwrap() {
        PodAdmission::Rejected(failure) => {
            assert_eq!(failure.reason, "OutOfcpu");
            assert!(failure.message.contains("requested: 1500, used: 3000, capacity: 4000"));
        }
        PodAdmission::Admitted => panic!("pod should not fit"),
    }
    assert!(!h.manager.has_allocation(&too_big.uid));
}

#[test]
fn test_admit_pod_uses_existing_allocation() {
    let (pod1, _, _) = fixture_pods();
    let h = Harness::new(&[pod1.clone()]);
    h.manager.set_allocated_resources(&pod1).unwrap();

    // Desired resources changed while the agent was down
    let mut desired = pod1.clone();
    desired.spec.containers[0].resources.requests = cpu_mem("3", "1Gi");
    h.registry.upsert(desired.clone());

    assert!(h.manager.admit_pod(&desired).unwrap().is_admitted());
    assert_eq!(
        h.manager
            .get_container_resource_allocation(&desired.uid, "c1")
            .unwrap()
            .requests,
        cpu_mem("1", "1Gi")
    );
}

#[test]
fn test_remove_pod_clears_all_records() {
    let (pod1, _, _) = fixture_pods();
    let h = Harness::new(&[pod1.clone()]);
    h.manager.set_allocated_resources(&pod1).unwrap();
    h.manager.set_actuated_resources(&pod1, None).unwrap();
    h.manager
        .status()
        .set_pending(&pod1.uid, ResizeReason::Deferred, "waiting", 1);
    h.manager.push_pending_resize(pod1.uid.clone());

    h.manager.remove_pod(&pod1.uid).unwrap();

    assert!(!h.manager.has_allocation(&pod1.uid));
    assert!(h.manager.get_actuated_resources(&pod1.uid, "c1").is_none());
    assert!(h.manager.status().conditions(&pod1.uid).is_empty());
    assert!(!h.manager.has_pending_resizes());

    // Removing again is a no-op
    h.manager.remove_pod(&pod1.uid).unwrap();
}

#[test]
fn test_remove_orphaned_pods() {
    let (pod1, pod2, pod3) = fixture_pods();
    let h = Harness::new(&[pod1.clone(), pod2.clone(), pod3.clone()]);
    for pod in [&pod1, &pod2, &pod3] {
        h.manager.set_allocated_resources(pod).unwrap();
        h.manager.set_actuated_resources(pod, None).unwrap();
    }
    h.manager.push_pending_resize(pod2.uid.clone());

    let remaining: HashSet<PodUid> = [pod1.uid.clone(), pod3.uid.clone()].into_iter().collect();
    h.manager.remove_orphaned_pods(&remaining).unwrap();

    assert!(h.manager.has_allocation(&pod1.uid));
    assert!(!h.manager.has_allocation(&pod2.uid));
    assert!(h.manager.get_actuated_resources(&pod2.uid, "c1-init").is_none());
    assert!(h.manager.has_allocation(&pod3.uid));
    assert!(!h.manager.has_pending_resizes());
}

#[test]
fn test_set_actuated_single_container() {
    let pod = Pod::new("1", "p", "ns")
        .with_container(Container::new("a").with_requests(cpu_only("100m")))
        .with_container(Container::new("b").with_requests(cpu_only("200m")));
    let h = Harness::new(&[pod.clone()]);

    h.manager
        .set_actuated_resources(&pod, Some(&pod.spec.containers[1]))
        .unwrap();
    assert!(h.manager.get_actuated_resources(&pod.uid, "a").is_none());
    assert_eq!(
        h.manager.get_actuated_resources(&pod.uid, "b").unwrap().requests,
        cpu_only("200m")
    );

    // Running container "a" was never actuated, so the pod is still resizing
    assert!(h.manager.is_pod_resize_in_progress(&pod, &running_status(&pod)));
    h.manager.set_actuated_resources(&pod, None).unwrap();
    assert!(!h.manager.is_pod_resize_in_progress(&pod, &running_status(&pod)));
}

#[test]
fn test_guaranteed_pod_with_static_cpu_policy_is_infeasible() {
    let original = Pod::new("1", "p", "ns").with_container(
        Container::new("c")
            .with_requests(cpu_mem("1", "1Gi"))
            .with_limits(cpu_mem("1", "1Gi")),
    );
    let mut desired = original.clone();
    desired.spec.containers[0].resources =
        ResourceRequirements::new(cpu_mem("500m", "1Gi"), cpu_mem("500m", "1Gi"));

    let h = Harness::build(&[desired.clone()], |b| {
        b.node_config(NodeConfig {
            cpu_manager_policy: CPU_MANAGER_STATIC_POLICY.to_string(),
            ..NodeConfig::default()
        })
    });
    h.manager.set_allocated_resources(&original).unwrap();
    h.manager.push_pending_resize(desired.uid.clone());
    h.manager.retry_pending_resizes(RetryTrigger::PodUpdated);

    assert!(h.manager.status().is_infeasible(&desired.uid));
    assert!(!h.manager.has_pending_resizes());
    assert_eq!(
        h.manager
            .get_container_resource_allocation(&desired.uid, "c")
            .unwrap()
            .requests,
        cpu_mem("1", "1Gi")
    );
}

#[test]
fn test_shrinking_resource_not_checked_against_capacity() {
    // Allocatable memory dropped below what the pod already holds
    let node = Arc::new(StaticNodeResources::new(NodeResources {
        allocatable: resource_list([
            (ResourceName::Cpu, q("4")),
            (ResourceName::Memory, q("2Gi")),
            (ResourceName::Pods, q("40")),
        ]),
        capacity: resource_list([(ResourceName::Cpu, q("8")), (ResourceName::Memory, q("8Gi"))]),
    }));
    let original = Pod::new("1111", "pod1", "ns1")
        .with_container(Container::new("c1").with_requests(cpu_mem("1", "3Gi")));
    let mut desired = original.clone();
    desired.spec.containers[0].resources.requests = cpu_mem("2", "2500Mi");

    let h = Harness::build(&[desired.clone()], |b| b.node(node));
    h.manager.set_allocated_resources(&original).unwrap();
    h.manager.push_pending_resize(desired.uid.clone());
    assert_eq!(h.manager.retry_pending_resizes(RetryTrigger::PodUpdated).len(), 1);

    assert_eq!(
        h.manager.status().resize_state(&desired.uid),
        crate::status::ResizeState::InProgress
    );
    assert_eq!(
        h.manager
            .get_container_resource_allocation(&desired.uid, "c1")
            .unwrap()
            .requests,
        cpu_mem("2", "2500Mi")
    );
}

#[test]
fn test_admission_counts_restored_allocations() {
    let dir = TempDir::new().unwrap();
    let restored = Pod::new("1111", "restored", "ns1")
        .with_container(Container::new("c1").with_requests(cpu_mem("3", "1Gi")));
    {
        let h = Harness::build(&[restored.clone()], |b| b.state_dir(dir.path()));
        assert!(h.manager.admit_pod(&restored).unwrap().is_admitted());
    }

    // After a restart the restored pod has not been registered again yet
    let h = Harness::build(&[], |b| b.state_dir(dir.path()));
    let newcomer = Pod::new("2222", "newcomer", "ns2")
        .with_container(Container::new("c1").with_requests(cpu_mem("2", "1Gi")));
    h.registry.upsert(newcomer.clone());

    match h.manager.admit_pod(&newcomer).unwrap() {
        PodAdmission::Rejected(failure) => {
            assert_eq!(failure.reason, "OutOfcpu");
            assert!(failure.message.contains("requested: 2000, used: 3000, capacity: 4000"));
        }
        PodAdmission::Admitted => panic!("restored allocation was not counted"),
    }
    assert!(!h.manager.has_allocation(&newcomer.uid));
}

#[test]
fn test_admission_ignores_registered_pods_without_allocation() {
    let (pod1, _, _) = fixture_pods();
    let waiting = Pod::new("9999", "waiting", "ns")
        .with_container(Container::new("c1").with_requests(cpu_mem("3500m", "1Gi")));
    let h = Harness::new(&[waiting.clone(), pod1.clone()]);

    assert!(h.manager.admit_pod(&pod1).unwrap().is_admitted());
    assert!(!h.manager.has_allocation(&waiting.uid));
}

/// Replace the state directory with a plain file so checkpoint writes fail
fn break_state_dir(dir: &std::path::Path) {
    std::fs::remove_dir_all(dir).unwrap();
    std::fs::write(dir, b"").unwrap();
}

#[test]
fn test_failed_allocation_write_keeps_resize_queued() {
    let root = TempDir::new().unwrap();
    let state_dir = root.path().join("state");
    let (pod1, _, _) = fixture_pods();
    let mut desired = pod1.clone();
    desired.spec.containers[0].resources.requests = cpu_mem("500m", "500Mi");

    let mut h = Harness::build(&[desired.clone()], |b| b.state_dir(&state_dir));
    h.manager.set_allocated_resources(&pod1).unwrap();
    assert_eq!(h.manager.state_write_errors(), StateWriteErrors::default());
    break_state_dir(&state_dir);

    h.manager.push_pending_resize(desired.uid.clone());
    assert!(h.manager.retry_pending_resizes(RetryTrigger::PodUpdated).is_empty());

    assert_eq!(
        h.manager
            .get_container_resource_allocation(&desired.uid, "c1")
            .unwrap()
            .requests,
        cpu_mem("1", "1Gi")
    );
    assert!(h.manager.status().conditions(&desired.uid).is_empty());
    assert_eq!(h.manager.pending_resizes(), vec![desired.uid.clone()]);
    assert!(!h.sync_triggered());

    let errors = h.manager.state_write_errors();
    assert!(errors.allocated.is_some());
    assert!(errors.actuated.is_none());
}

#[test]
fn test_failed_remove_keeps_resize_state() {
    let root = TempDir::new().unwrap();
    let state_dir = root.path().join("state");
    let (pod1, _, _) = fixture_pods();

    let h = Harness::build(&[pod1.clone()], |b| b.state_dir(&state_dir));
    h.manager.set_allocated_resources(&pod1).unwrap();
    h.manager
        .status()
        .set_pending(&pod1.uid, ResizeReason::Deferred, "waiting", 1);
    h.manager.push_pending_resize(pod1.uid.clone());
    break_state_dir(&state_dir);

    assert!(h.manager.remove_pod(&pod1.uid).is_err());
    assert!(h.manager.has_allocation(&pod1.uid));
    assert!(h.manager.status().is_deferred(&pod1.uid));
    assert!(h.manager.has_pending_resizes());
}

#[test]
fn test_checkpointed_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let (pod1, _, _) = fixture_pods();
    let mut resized = pod1.clone();
    resized.spec.containers[0].resources.requests = cpu_mem("500m", "500Mi");

    {
        let h = Harness::build(&[pod1.clone()], |b| b.state_dir(dir.path()));
        h.manager.set_allocated_resources(&resized).unwrap();
        h.manager.set_actuated_resources(&pod1, None).unwrap();
    }
    assert!(dir.path().join(ALLOCATED_CHECKPOINT).exists());
    assert!(dir.path().join(ACTUATED_CHECKPOINT).exists());

    let h = Harness::build(&[pod1.clone()], |b| b.state_dir(dir.path()));
    assert_eq!(h.manager.allocated_pod_count(), 1);
    assert_eq!(
        h.manager
            .get_container_resource_allocation(&pod1.uid, "c1")
            .unwrap()
            .requests,
        cpu_mem("500m", "500Mi")
    );
    assert_eq!(
        h.manager.get_actuated_resources(&pod1.uid, "c1").unwrap().requests,
        cpu_mem("1", "1Gi")
    );

    // The restored allocation still differs from what the runtime applied
    let (allocated, updated) = h.manager.update_pod_from_allocation(&pod1);
    assert!(updated);
    assert!(h.manager.is_pod_resize_in_progress(&allocated, &running_status(&pod1)));
}

#[test]
fn test_corrupt_checkpoint_fails_build() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(ALLOCATED_CHECKPOINT), b"not a checkpoint").unwrap();

    let registry = Arc::new(PodRegistry::new());
    let result = AllocationManager::builder()
        .node(test_node())
        .pods(registry)
        .state_dir(dir.path())
        .build();
    assert!(matches!(result, Err(AllocationError::CorruptCheckpoint { .. })));
}

#[test]
fn test_builder_requires_components() {
    let result = AllocationManager::builder().node(test_node()).build();
    assert!(matches!(result, Err(AllocationError::MissingComponent(_))));
}
