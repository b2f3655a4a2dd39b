//! Background retry of pending resizes
//!
//! Pending resizes are retried on a fixed period and whenever another part of
//! the agent requests it (pods removed, resize completed).

use super::manager::{AllocationManager, RetryTrigger};
use crate::health::{components, HealthRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ResizeRetryConfig {
    /// Period between unconditional retries (default: 10 seconds)
    pub interval: Duration,
}

impl Default for ResizeRetryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

/// Requests an out-of-band retry
#[derive(Debug, Clone)]
pub struct ResizeRetryHandle {
    tx: mpsc::UnboundedSender<RetryTrigger>,
}

impl ResizeRetryHandle {
    /// Ask the loop to retry soon; returns false once the loop has stopped
    pub fn request(&self, trigger: RetryTrigger) -> bool {
        self.tx.send(trigger).is_ok()
    }
}

pub struct ResizeRetryLoop {
    manager: Arc<AllocationManager>,
    config: ResizeRetryConfig,
    health: Option<HealthRegistry>,
    rx: mpsc::UnboundedReceiver<RetryTrigger>,
}

impl ResizeRetryLoop {
    pub fn new(
        manager: Arc<AllocationManager>,
        config: ResizeRetryConfig,
    ) -> (Self, ResizeRetryHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let retry_loop = Self {
            manager,
            config,
            health: None,
            rx,
        };
        (retry_loop, ResizeRetryHandle { tx })
    }

    /// Report liveness through the health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting resize retry loop"
        );
        if let Some(health) = &self.health {
            health.register(components::RESIZE_RETRY).await;
        }

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.retry(RetryTrigger::Periodic).await;
                    self.report_state_writes().await;
                }
                Some(trigger) = self.rx.recv() => {
                    self.retry(trigger).await;
                    self.report_state_writes().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down resize retry loop");
                    break;
                }
            }
        }

        if let Some(health) = &self.health {
            health
                .set_unhealthy(components::RESIZE_RETRY, "retry loop stopped")
                .await;
        }
    }

    async fn retry(&self, trigger: RetryTrigger) {
        if !self.manager.has_pending_resizes() {
            return;
        }

        let manager = Arc::clone(&self.manager);
        let allocated =
            tokio::task::spawn_blocking(move || manager.retry_pending_resizes(trigger)).await;

        match allocated {
            Ok(pods) => {
                debug!(trigger = %trigger, allocated = pods.len(), "Resize retry complete");
                if let Some(health) = &self.health {
                    health.set_healthy(components::RESIZE_RETRY).await;
                }
            }
            Err(e) => {
                if let Some(health) = &self.health {
                    let message = format!("retry task failed: {}", e);
                    health.set_degraded(components::RESIZE_RETRY, message).await;
                }
            }
        }
    }

    async fn report_state_writes(&self) {
        if let Some(health) = &self.health {
            health
                .report_state_writes(&self.manager.state_write_errors())
                .await;
        }
    }
}
