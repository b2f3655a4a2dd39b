//! Agent configuration

use allocation_lib::allocation::NodeConfig;
use allocation_lib::{Quantity, StaticNodeResources, SwapBehavior};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the optional configuration file
pub const CONFIG_PATH_ENV: &str = "ALLOCATION_AGENT_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "/etc/allocation-agent/config";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health, metrics and pod endpoints
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Directory holding the allocation and actuation checkpoints
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Period between retries of pending resizes, in seconds
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    /// Allocatable CPU of the node
    #[serde(default = "default_node_cpu")]
    pub node_cpu: String,

    /// Allocatable memory of the node
    #[serde(default = "default_node_memory")]
    pub node_memory: String,

    #[serde(default = "default_node_max_pods")]
    pub node_max_pods: i64,

    #[serde(default = "default_cpu_manager_policy")]
    pub cpu_manager_policy: String,

    #[serde(default = "default_memory_manager_policy")]
    pub memory_manager_policy: String,

    #[serde(default)]
    pub swap_behavior: SwapBehavior,

    /// Hold resize retries until pod sources report they are synced
    #[serde(default = "default_wait_for_pod_sources")]
    pub wait_for_pod_sources: bool,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/allocation-agent")
}

fn default_retry_interval() -> u64 {
    10
}

fn default_node_cpu() -> String {
    "4".to_string()
}

fn default_node_memory() -> String {
    "8Gi".to_string()
}

fn default_node_max_pods() -> i64 {
    110
}

fn default_cpu_manager_policy() -> String {
    NodeConfig::default().cpu_manager_policy
}

fn default_memory_manager_policy() -> String {
    NodeConfig::default().memory_manager_policy
}

fn default_wait_for_pod_sources() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            api_port: default_api_port(),
            state_dir: default_state_dir(),
            retry_interval_secs: default_retry_interval(),
            node_cpu: default_node_cpu(),
            node_memory: default_node_memory(),
            node_max_pods: default_node_max_pods(),
            cpu_manager_policy: default_cpu_manager_policy(),
            memory_manager_policy: default_memory_manager_policy(),
            swap_behavior: SwapBehavior::default(),
            wait_for_pod_sources: default_wait_for_pod_sources(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from the config file and environment
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    /// Load from `path` (missing file allowed), overridden by `AGENT_*` variables
    pub fn load_from(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("AGENT"))
            .build()?;

        config
            .try_deserialize()
            .with_context(|| format!("invalid agent configuration in {}", path))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// Node resources as configured; allocatable equals capacity
    pub fn node_resources(&self) -> Result<StaticNodeResources> {
        let cpu: Quantity = self
            .node_cpu
            .parse()
            .with_context(|| format!("invalid node_cpu {:?}", self.node_cpu))?;
        let memory: Quantity = self
            .node_memory
            .parse()
            .with_context(|| format!("invalid node_memory {:?}", self.node_memory))?;
        Ok(StaticNodeResources::from_quantities(cpu, memory, self.node_max_pods))
    }

    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            cpu_manager_policy: self.cpu_manager_policy.clone(),
            memory_manager_policy: self.memory_manager_policy.clone(),
        }
    }
}
