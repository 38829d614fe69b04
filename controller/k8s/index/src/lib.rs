//! Ferry controller indexes
//!
//! The controller watches the control-plane cluster for `Hub`, `Secret`, `RoutePolicy` and `Route`
//! resources, and each member hub for its `Service`s, its tunnel `Endpoints` and, when bridging is
//! enabled, its MCS `ServiceExport`/`ServiceImport` resources. Every watch feeds a [`Cache`], which
//! pokes the reconcile [`Trigger`](ferry_controller_core::Trigger) whenever anything changes.
//!
//! ```text
//! [ ServiceExport/Import ] -> [ RoutePolicy ] -> [ Route ] -> [ ConfigMap, Service, Endpoints ]
//! ```
//!
//! Readers only ever see copies of cached objects; the caches are mutated exclusively by their
//! watches.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cache;
pub mod expand;
pub mod hub;
pub mod mcs;
#[cfg(test)]
mod mock;
pub mod projection;
mod resource_id;
pub mod store;
pub mod tunnel;

pub use self::{
    cache::{Cache, EventHandler, SharedCache},
    hub::{Registry, RegistryConfig},
    projection::{Diff, Projected, Projection},
    resource_id::ResourceId,
    store::{Applied, Object, StoreError},
    tunnel::{TunnelClient, TunnelError},
};
