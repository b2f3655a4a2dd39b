//! Library for node-local pod resource allocation
//!
//! This crate provides the core functionality for:
//! - Recording allocated and actuated container resources, with checkpoints
//! - Admitting pods and in-place resizes against node allocatable
//! - Queuing and retrying deferred resizes
//! - Tracking resize conditions and runtime progress
//! - Health checks and observability

pub mod allocation;
pub mod health;
pub mod models;
pub mod node;
pub mod observability;
pub mod quantity;
pub mod resources;
pub mod status;

pub use allocation::{AllocationError, AllocationManager, RetryTrigger};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use node::{NodeSwapConfig, PodRegistry, StaticNodeResources};
pub use observability::{AllocationMetrics, StructuredLogger};
pub use quantity::Quantity;
pub use resources::{ResourceList, ResourceName};
