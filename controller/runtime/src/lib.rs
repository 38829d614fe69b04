#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use ferry_controller_core as core;
pub use ferry_controller_k8s_api as k8s;
pub use ferry_controller_k8s_index as index;
pub use ferry_controller_k8s_status as status;

mod args;
mod health;
mod metrics;
#[cfg(test)]
mod mock;
mod reconcile;
mod sync;

pub use self::{
    args::Args,
    health::{Probe, Prober},
    metrics::SyncMetrics,
    reconcile::{HubObject, Hubs, Outcome, Resource, RouteError, RouteReconciler},
    sync::{Syncer, SyncerConfig},
};
