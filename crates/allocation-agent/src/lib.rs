//! Allocation agent
//!
//! Configuration and the HTTP surface of the node allocation agent; the
//! binary wires them to an [`allocation_lib::AllocationManager`].

pub mod api;
pub mod config;
