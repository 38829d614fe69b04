#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod hub;
pub mod labels;
pub mod mcs;
pub mod route;
pub mod route_policy;
pub mod status;

pub use self::{
    hub::{Hub, HubSpec, HubStatus},
    labels::Labels,
    mcs::{ServiceExport, ServiceImport},
    route::{Route, RouteSpec, RouteStatus},
    route_policy::{RoutePolicy, RoutePolicySpec, RoutePolicyStatus},
    status::Condition,
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{
            ConfigMap, EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Secret, Service,
            ServicePort, ServiceSpec,
        },
    },
    apimachinery::pkg::{apis::meta::v1::OwnerReference, util::intstr::IntOrString},
    NamespaceResourceScope,
};
pub use kube::{
    api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams, Resource, ResourceExt},
    runtime::watcher,
    Client, Error,
};
