#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The routing engine behind the ferry controller.
//!
//! Everything in this crate is independent of Kubernetes: hub gateways and the
//! topology solver that orders hubs along a data path, the chain planner that
//! turns such a path into per-hub relay descriptors, the per-hub port
//! allocator, status conditions, and the coalescing trigger that drives the
//! reconcile loop.

pub mod chain;
pub mod conditions;
pub mod gateway;
pub mod ports;
pub mod topology;
pub mod trigger;

pub use self::{
    chain::{Chain, ChainError, Chains, ServiceRef},
    conditions::{Condition, ConditionStatus, Conditions},
    gateway::{Gateway, HubGateway, Way},
    ports::{Peer, PortAllocator, PortBindings, PortError, UnusedPorts},
    topology::{Topology, TopologyError},
    trigger::Trigger,
};

pub const CONTROLLER_NAME: &str = "ferryproxy.io/controller";
