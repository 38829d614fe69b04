#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod controller;
#[cfg(test)]
mod mock;
mod statuses;

pub use self::{
    controller::{Controller, ControllerMetrics, Kind, Target, Update},
    statuses::{
        hub_status, policy_status, route_status, Ledger, Statuses, PHASE_NOT_READY, PHASE_PENDING,
        PHASE_READY,
    },
};
