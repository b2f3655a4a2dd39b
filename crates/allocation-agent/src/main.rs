//! Allocation Agent - node-local pod resource allocation
//!
//! This binary runs as a DaemonSet on each Kubernetes node, admitting pods
//! against node allocatable and managing in-place resizes.

use allocation_agent::{api, config};
use allocation_lib::{
    allocation::{PodSyncEvent, ResizeRetryConfig, ResizeRetryLoop},
    health::{components, HealthRegistry},
    observability::{AllocationMetrics, StructuredLogger},
    AllocationManager, NodeSwapConfig, PodRegistry,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting allocation-agent");

    let config = config::AgentConfig::load()?;
    info!(
        node_name = %config.node_name,
        state_dir = %config.state_dir.display(),
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    let metrics = AllocationMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);

    let registry = Arc::new(PodRegistry::new());
    let (sync_tx, sync_rx) = mpsc::unbounded_channel();

    let manager = AllocationManager::builder()
        .node(Arc::new(config.node_resources()?))
        .pods(registry.clone())
        .runtime(Arc::new(NodeSwapConfig::new(config.swap_behavior)))
        .sync_trigger(Arc::new(sync_tx))
        .node_config(config.node_config())
        .node_name(&config.node_name)
        .state_dir(&config.state_dir)
        .sources_ready(!config.wait_for_pod_sources)
        .build();
    let manager = match manager {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            health_registry
                .set_unhealthy(components::ALLOCATION_STATE, e.to_string())
                .await;
            return Err(e).context("failed to load allocation state");
        }
    };
    health_registry.register(components::ALLOCATION_STATE).await;
    health_registry.register(components::ACTUATION_STATE).await;
    logger.log_startup(AGENT_VERSION, &config.state_dir.display().to_string());

    let (shutdown_tx, _) = broadcast::channel(1);

    let (retry_loop, retry_handle) = ResizeRetryLoop::new(
        manager.clone(),
        ResizeRetryConfig {
            interval: config.retry_interval(),
        },
    );
    let retry_task = tokio::spawn(
        retry_loop
            .with_health(health_registry.clone())
            .run(shutdown_tx.subscribe()),
    );

    tokio::spawn(log_pod_syncs(sync_rx));
    tokio::spawn(log_condition_updates(
        manager.status().subscribe(),
        shutdown_tx.subscribe(),
    ));

    let app_state = Arc::new(
        api::AppState::new(
            health_registry.clone(),
            metrics.clone(),
            manager.clone(),
            registry,
        )
        .with_retry_handle(retry_handle),
    );

    // State is loaded; ready to serve
    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            logger.log_shutdown("SIGINT received");
        }
        result = api_handle => {
            logger.log_shutdown("API server stopped");
            result??;
        }
    }

    info!("Shutting down");
    let _ = shutdown_tx.send(());
    if let Err(e) = retry_task.await {
        warn!(error = %e, "Resize retry loop did not stop cleanly");
    }

    Ok(())
}

/// Pod syncs are carried out by the runtime side; record each request
async fn log_pod_syncs(mut rx: mpsc::UnboundedReceiver<PodSyncEvent>) {
    while let Some(event) = rx.recv().await {
        info!(
            pod_uid = %event.uid,
            pod = %format!("{}/{}", event.namespace, event.name),
            generation = event.generation,
            "Pod sync requested"
        );
    }
}

async fn log_condition_updates(
    mut updates: broadcast::Receiver<allocation_lib::status::ConditionUpdate>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => debug!(
                    pod_uid = %update.uid,
                    resize_state = %update.state,
                    conditions = update.conditions.len(),
                    "Resize conditions changed"
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Condition update subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.recv() => break,
        }
    }
}
