//! Observability infrastructure for the allocation agent
//!
//! Provides:
//! - Prometheus metrics (resize outcomes, pending queue depth, checkpoint errors)
//! - Structured JSON logging of resize decisions with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for resize evaluation latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.00005, 0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AllocationMetricsInner> = OnceLock::new();

struct AllocationMetricsInner {
    resize_outcomes: IntCounterVec,
    pending_resizes: IntGauge,
    allocated_pods: IntGauge,
    checkpoint_errors: IntCounter,
    deferred_resizes_accepted: IntCounterVec,
    resize_evaluation_seconds: Histogram,
}

impl AllocationMetricsInner {
    fn new() -> Self {
        Self {
            resize_outcomes: register_int_counter_vec!(
                "allocation_agent_resize_outcomes_total",
                "Resize evaluations by outcome",
                &["outcome"]
            )
            .expect("Failed to register resize_outcomes_total"),

            pending_resizes: register_int_gauge!(
                "allocation_agent_pending_resizes",
                "Number of pods waiting in the pending resize queue"
            )
            .expect("Failed to register pending_resizes"),

            allocated_pods: register_int_gauge!(
                "allocation_agent_allocated_pods",
                "Number of pods with a recorded allocation"
            )
            .expect("Failed to register allocated_pods"),

            checkpoint_errors: register_int_counter!(
                "allocation_agent_checkpoint_errors_total",
                "Failed writes of allocation or actuation state"
            )
            .expect("Failed to register checkpoint_errors_total"),

            deferred_resizes_accepted: register_int_counter_vec!(
                "allocation_agent_deferred_resizes_accepted_total",
                "Deferred resizes later allocated, by the event that triggered the retry",
                &["trigger"]
            )
            .expect("Failed to register deferred_resizes_accepted_total"),

            resize_evaluation_seconds: register_histogram!(
                "allocation_agent_resize_evaluation_seconds",
                "Time spent evaluating a single resize request",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register resize_evaluation_seconds"),
        }
    }
}

/// Allocation metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the same
/// underlying metrics.
#[derive(Clone)]
pub struct AllocationMetrics {
    _private: (),
}

impl Default for AllocationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocationMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AllocationMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AllocationMetricsInner {
        GLOBAL_METRICS.get_or_init(AllocationMetricsInner::new)
    }

    pub fn inc_resize_outcome(&self, outcome: &str) {
        self.inner()
            .resize_outcomes
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn set_pending_resizes(&self, count: usize) {
        self.inner().pending_resizes.set(count as i64);
    }

    pub fn set_allocated_pods(&self, count: usize) {
        self.inner().allocated_pods.set(count as i64);
    }

    pub fn inc_checkpoint_errors(&self) {
        self.inner().checkpoint_errors.inc();
    }

    pub fn inc_deferred_accepted(&self, trigger: &str) {
        self.inner()
            .deferred_resizes_accepted
            .with_label_values(&[trigger])
            .inc();
    }

    pub fn observe_resize_evaluation(&self, duration_secs: f64) {
        self.inner().resize_evaluation_seconds.observe(duration_secs);
    }
}

/// Structured logger for allocation events
///
/// One event per resize decision, with consistent fields, so decisions can be
/// audited from the JSON log stream alone.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn log_resize_allocated(&self, pod_uid: &str, pod: &str, generation: i64) {
        info!(
            event = "resize_allocated",
            node = %self.node_name,
            pod_uid = %pod_uid,
            pod = %pod,
            generation = generation,
            "Pod resize allocated"
        );
    }

    pub fn log_resize_deferred(&self, pod_uid: &str, pod: &str, message: &str) {
        info!(
            event = "resize_deferred",
            node = %self.node_name,
            pod_uid = %pod_uid,
            pod = %pod,
            message = %message,
            "Pod resize deferred"
        );
    }

    pub fn log_resize_infeasible(&self, pod_uid: &str, pod: &str, message: &str) {
        warn!(
            event = "resize_infeasible",
            node = %self.node_name,
            pod_uid = %pod_uid,
            pod = %pod,
            message = %message,
            "Pod resize infeasible"
        );
    }

    pub fn log_resize_completed(&self, pod_uid: &str, pod: &str) {
        info!(
            event = "resize_completed",
            node = %self.node_name,
            pod_uid = %pod_uid,
            pod = %pod,
            "Pod resize completed"
        );
    }

    pub fn log_pod_rejected(&self, pod_uid: &str, pod: &str, reason: &str, message: &str) {
        warn!(
            event = "pod_rejected",
            node = %self.node_name,
            pod_uid = %pod_uid,
            pod = %pod,
            reason = %reason,
            message = %message,
            "Pod admission rejected"
        );
    }

    pub fn log_startup(&self, version: &str, state_dir: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            state_dir = %state_dir,
            "Allocation agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Allocation agent shutting down"
        );
    }
}
