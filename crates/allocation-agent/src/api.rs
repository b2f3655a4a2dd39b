//! HTTP API for health checks, Prometheus metrics and pod allocation

use allocation_lib::{
    allocation::{PodAdmission, PodResourceInfo, ResizeRetryHandle},
    health::{ComponentStatus, HealthRegistry},
    observability::AllocationMetrics,
    status::{ResizeCondition, ResizeState},
    AllocationError, AllocationManager, Pod, PodRegistry, PodUid, RetryTrigger, RuntimePodStatus,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: AllocationMetrics,
    pub manager: Arc<AllocationManager>,
    pub registry: Arc<PodRegistry>,
    /// Wakes the background retry loop; retries run inline when absent
    pub retry: Option<ResizeRetryHandle>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: AllocationMetrics,
        manager: Arc<AllocationManager>,
        registry: Arc<PodRegistry>,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            manager,
            registry,
            retry: None,
        }
    }

    pub fn with_retry_handle(mut self, handle: ResizeRetryHandle) -> Self {
        self.retry = Some(handle);
        self
    }

    /// Wake the retry loop, or retry here when there is none
    async fn request_retry(&self, trigger: RetryTrigger) -> ApiResult<()> {
        let queued = self
            .retry
            .as_ref()
            .map(|handle| handle.request(trigger))
            .unwrap_or(false);
        if !queued {
            let manager = self.manager.clone();
            blocking(move || Ok(manager.retry_pending_resizes(trigger))).await?;
        }
        Ok(())
    }

    /// Mirror checkpoint write failures into the state store components
    async fn report_state_writes(&self) {
        self.health_registry
            .report_state_writes(&self.manager.state_write_errors())
            .await;
    }
}

/// Run allocation work on the blocking pool
///
/// The manager serializes mutations behind a std mutex and checkpoint writes
/// fsync, so neither may run on an async worker.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> ApiResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
}

/// Errors returned by the pod endpoints
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("pod {0} not found")]
    PodNotFound(PodUid),

    #[error("container {container} not found in pod {uid}")]
    ContainerNotFound { uid: PodUid, container: String },

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            ApiError::PodNotFound(_) | ApiError::ContainerNotFound { .. } => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Allocation(e) => {
                error!(error = %e, "Allocation state error");
                (StatusCode::INTERNAL_SERVER_ERROR, "allocation_error")
            }
            ApiError::Internal(e) => {
                error!(error = %e, "Allocation task failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };
        let body = ErrorResponse {
            error: error.to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Allocation view of a single pod
#[derive(Debug, Serialize, Deserialize)]
pub struct PodAllocationResponse {
    pub uid: PodUid,
    pub resize_state: ResizeState,
    pub conditions: Vec<ResizeCondition>,
    pub allocated: Option<PodResourceInfo>,
    pub actuated: Option<PodResourceInfo>,
}

/// Admission rejection
#[derive(Debug, Serialize, Deserialize)]
pub struct RejectionResponse {
    pub uid: PodUid,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActuatedRequest {
    /// Limit the report to one container; the whole pod otherwise
    #[serde(default)]
    pub container: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PendingResizesResponse {
    pub pending: Vec<PodUid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SourcesReadyResponse {
    pub ready: bool,
    pub pods: usize,
    pub allocated_pods: usize,
}

fn allocation_view(manager: &AllocationManager, uid: &PodUid) -> PodAllocationResponse {
    PodAllocationResponse {
        uid: uid.clone(),
        resize_state: manager.status().resize_state(uid),
        conditions: manager.status().conditions(uid),
        allocated: manager.get_pod_allocation(uid),
        actuated: manager.get_pod_actuation(uid),
    }
}

/// Health check response - returns 200 if healthy, 503 if degraded/unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let manager = state.manager.clone();
    let counts = blocking(move || {
        Ok((manager.pending_resizes().len(), manager.allocated_pod_count()))
    })
    .await;
    match counts {
        Ok((pending, allocated)) => {
            state.metrics.set_pending_resizes(pending);
            state.metrics.set_allocated_pods(allocated);
        }
        Err(e) => error!(error = %e, "Failed to refresh allocation gauges"),
    }

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Admit a new pod, or queue a resize for a pod that already has an allocation
async fn put_pod(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
    Json(pod): Json<Pod>,
) -> ApiResult<Response> {
    let uid = PodUid::new(uid);
    if pod.uid != uid {
        return Err(ApiError::BadRequest(format!(
            "pod uid {} does not match path {}",
            pod.uid, uid
        )));
    }

    let worker = state.clone();
    let result = blocking(move || apply_pod(&worker, pod)).await;
    state.report_state_writes().await;
    result
}

fn apply_pod(state: &AppState, pod: Pod) -> ApiResult<Response> {
    let uid = pod.uid.clone();
    let manager = &state.manager;
    if !manager.has_allocation(&uid) {
        state.registry.upsert(pod.clone());
        return match manager.admit_pod(&pod)? {
            PodAdmission::Admitted => Ok((
                StatusCode::CREATED,
                Json(allocation_view(manager, &uid)),
            )
                .into_response()),
            PodAdmission::Rejected(failure) => {
                state.registry.remove(&uid);
                Ok((
                    StatusCode::CONFLICT,
                    Json(RejectionResponse {
                        uid,
                        reason: failure.reason,
                        message: failure.message,
                    }),
                )
                    .into_response())
            }
        };
    }

    state.registry.upsert(pod.clone());
    let (_, resize_requested) = manager.update_pod_from_allocation(&pod);
    if resize_requested {
        manager.push_pending_resize(uid.clone());
        manager.retry_pending_resizes(RetryTrigger::PodUpdated);
    }
    Ok((StatusCode::OK, Json(allocation_view(manager, &uid))).into_response())
}

async fn delete_pod(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
) -> ApiResult<StatusCode> {
    let uid = PodUid::new(uid);
    let worker = state.clone();
    let removed = blocking(move || {
        worker.registry.remove(&uid);
        Ok(worker.manager.remove_pod(&uid)?)
    })
    .await;
    state.report_state_writes().await;
    removed?;

    state.request_retry(RetryTrigger::PodsRemoved).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_allocation(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
) -> ApiResult<Json<PodAllocationResponse>> {
    let uid = PodUid::new(uid);
    if !state.manager.has_allocation(&uid) {
        return Err(ApiError::PodNotFound(uid));
    }
    Ok(Json(allocation_view(&state.manager, &uid)))
}

/// Allocated view of a registered pod
fn allocated_pod(state: &AppState, uid: &PodUid) -> ApiResult<Pod> {
    let pod = state
        .registry
        .get(uid)
        .ok_or_else(|| ApiError::PodNotFound(uid.clone()))?;
    let (allocated, _) = state.manager.update_pod_from_allocation(&pod);
    Ok(allocated.into_owned())
}

/// The runtime applied the allocation of a pod or one of its containers
async fn post_actuated(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
    body: Option<Json<ActuatedRequest>>,
) -> ApiResult<Json<PodAllocationResponse>> {
    let uid = PodUid::new(uid);
    let request = body.map(|Json(r)| r).unwrap_or_default();

    let worker = state.clone();
    let result = blocking(move || {
        let pod = allocated_pod(&worker, &uid)?;
        let container = match &request.container {
            Some(name) => Some(pod.find_container(name).ok_or_else(|| {
                ApiError::ContainerNotFound {
                    uid: uid.clone(),
                    container: name.clone(),
                }
            })?),
            None => None,
        };
        worker.manager.set_actuated_resources(&pod, container)?;
        Ok(allocation_view(&worker.manager, &uid))
    })
    .await;
    state.report_state_writes().await;
    result.map(Json)
}

/// Runtime status report; refreshes the in-progress condition
async fn post_status(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
    Json(status): Json<RuntimePodStatus>,
) -> ApiResult<Json<PodAllocationResponse>> {
    let uid = PodUid::new(uid);
    if status.uid != uid {
        return Err(ApiError::BadRequest(format!(
            "status uid {} does not match path {}",
            status.uid, uid
        )));
    }

    let worker = state.clone();
    let result = blocking(move || {
        let pod = allocated_pod(&worker, &uid)?;
        worker.manager.check_pod_resize_in_progress(&pod, &status);
        Ok(allocation_view(&worker.manager, &uid))
    })
    .await;
    state.report_state_writes().await;
    result.map(Json)
}

async fn pending_resizes(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<PendingResizesResponse>> {
    let manager = state.manager.clone();
    let pending = blocking(move || Ok(manager.pending_resizes())).await?;
    Ok(Json(PendingResizesResponse { pending }))
}

/// Pod sources delivered every pod: drop orphans and start retrying
async fn sources_ready(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<SourcesReadyResponse>> {
    let worker = state.clone();
    let result = blocking(move || {
        let remaining: HashSet<PodUid> = worker.registry.uids().into_iter().collect();
        worker.manager.remove_orphaned_pods(&remaining)?;
        worker.manager.set_sources_ready(true);
        Ok(remaining.len())
    })
    .await;
    state.report_state_writes().await;
    let pods = result?;
    info!(pods, "Pod sources ready");

    state.request_retry(RetryTrigger::Periodic).await?;
    Ok(Json(SourcesReadyResponse {
        ready: true,
        pods,
        allocated_pods: state.manager.allocated_pod_count(),
    }))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/pods/:uid", put(put_pod).delete(delete_pod))
        .route("/v1/pods/:uid/allocation", get(get_allocation))
        .route("/v1/pods/:uid/actuated", post(post_actuated))
        .route("/v1/pods/:uid/status", post(post_status))
        .route("/v1/resizes/pending", get(pending_resizes))
        .route("/v1/sources/ready", post(sources_ready))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
