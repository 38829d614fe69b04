use crate::{
    core::{chain, Chain, ChainError, Chains, Peer, PortError, ServiceRef, Topology, TopologyError},
    index::{self, store, Applied, Object, Projected, Projection, StoreError},
    k8s::{
        labels, ConfigMap, EndpointPort, EndpointSubset, Endpoints, IntOrString, ObjectMeta,
        ResourceExt, Route, Service, ServicePort, ServiceSpec,
    },
};

/// The data key of a relay ConfigMap.
pub const TUNNEL_KEY: &str = "tunnel";

/// What the route reconciler needs from the hub registry.
#[async_trait::async_trait]
pub trait Hubs: Send + Sync {
    fn topology(&self) -> Topology;

    fn get_service(&self, hub: &str, namespace: &str, name: &str) -> Option<Service>;

    fn tunnel_endpoints(&self, hub: &str) -> Option<Endpoints>;

    /// Returns `peer`'s port on `hub`, allocating one if necessary.
    async fn allocate(&self, hub: &str, peer: &Peer) -> Result<i32, RouteError>;

    async fn apply(&self, obj: &HubObject) -> Result<Applied, StoreError>;

    /// Returns false if the object was already gone.
    async fn delete(&self, obj: &HubObject) -> Result<bool, StoreError>;
}

/// An object the reconciler writes into a specific hub.
#[derive(Clone, Debug)]
pub struct HubObject {
    pub hub: String,
    pub resource: Resource,
}

#[derive(Clone, Debug)]
pub enum Resource {
    ConfigMap(ConfigMap),
    Service(Service),
    Endpoints(Endpoints),
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("hub {0} is not connected")]
    NotConnected(String),

    #[error("service {0} does not exist")]
    MissingService(String),

    #[error("service {0} has no TCP ports")]
    NoPorts(String),

    #[error("failed to encode chains: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Projects routes onto hubs as relay ConfigMaps plus an import-side Service
/// and Endpoints.
#[derive(Debug)]
pub struct RouteReconciler {
    tunnel_namespace: String,
    baseline: Projection<HubObject>,
}

/// What became of one route during a sync.
#[derive(Debug)]
pub struct Outcome {
    pub route: Route,
    pub result: Result<usize, RouteError>,
}

// === impl RouteReconciler ===

impl RouteReconciler {
    pub fn new(tunnel_namespace: impl Into<String>) -> Self {
        Self {
            tunnel_namespace: tunnel_namespace.into(),
            baseline: Projection::default(),
        }
    }

    /// The number of objects written on the last pass.
    pub fn len(&self) -> usize {
        self.baseline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baseline.is_empty()
    }

    /// Converges every hub onto the objects `routes` call for.
    ///
    /// Routes that cannot be planned are dropped from this pass. Objects that
    /// fail to apply are retried on the next pass and keep their previously
    /// written version in the baseline; objects that fail to delete stay in
    /// the baseline so their deletion is retried.
    pub async fn reconcile<H: Hubs>(&mut self, hubs: &H, routes: &[Route]) -> Vec<Outcome> {
        let topology = hubs.topology();

        let mut desired = Vec::new();
        let mut outcomes = Vec::with_capacity(routes.len());
        for route in routes {
            let result = match self.plan(hubs, &topology, route).await {
                Ok((objs, ports)) => {
                    desired.extend(objs);
                    Ok(ports)
                }
                Err(error) => {
                    tracing::info!(route = %route.name_any(), %error, "Skipping route");
                    Err(error)
                }
            };
            outcomes.push(Outcome {
                route: route.clone(),
                result,
            });
        }

        let diff = self.baseline.diff(desired);
        let mut written = diff.unchanged;
        for obj in diff.apply {
            match hubs.apply(&obj).await {
                Ok(applied) => {
                    tracing::debug!(hub = %obj.hub, object = %obj.uniq_name(), ?applied);
                    written.push(obj);
                }
                Err(error) => {
                    tracing::warn!(
                        hub = %obj.hub,
                        object = %obj.uniq_name(),
                        %error,
                        "Failed to apply"
                    );
                    // The hub still holds whatever was last written.
                    if let Some(prior) = self.baseline.get(&obj.uniq_name()) {
                        written.push(prior.clone());
                    }
                }
            }
        }
        for obj in diff.delete {
            if let Err(error) = hubs.delete(&obj).await {
                tracing::warn!(
                    hub = %obj.hub,
                    object = %obj.uniq_name(),
                    %error,
                    "Failed to delete"
                );
                written.push(obj);
            }
        }
        self.baseline.commit(written);

        outcomes
    }

    async fn plan<H: Hubs>(
        &self,
        hubs: &H,
        topology: &Topology,
        route: &Route,
    ) -> Result<(Vec<HubObject>, usize), RouteError> {
        let route_name = route.name_any();
        let export = &route.spec.export;
        let import = &route.spec.import;

        let path = topology.solve(&export.hub_name, &import.hub_name)?;

        let origin = ServiceRef::new(&export.service.namespace, &export.service.name);
        let svc = hubs
            .get_service(&export.hub_name, &origin.namespace, &origin.name)
            .ok_or_else(|| RouteError::MissingService(export.to_string()))?;
        let ports = tcp_ports(&svc);
        if ports.is_empty() {
            return Err(RouteError::NoPorts(export.to_string()));
        }

        let mut chains = Chains::new();
        let mut bound = Vec::with_capacity(ports.len());
        for port in ports {
            let peer = Peer::new(&export.hub_name, &origin.namespace, &origin.name, port.port);
            let peer_port = hubs.allocate(&import.hub_name, &peer).await?;
            let name = format!("{route_name}-{}", port.port);
            let planned = chain::Plan {
                name: &name,
                origin: &origin,
                origin_port: port.port,
                peer_port,
                path: &path,
            }
            .build(topology)?;
            for (hub, cs) in planned {
                chains.entry(hub).or_default().extend(cs);
            }
            bound.push((port, peer_port));
        }

        let mut objs = Vec::with_capacity(chains.len() + 2);
        let relay_labels = self.relay_labels(route);
        for (hub, cs) in chains {
            objs.push(HubObject {
                resource: Resource::ConfigMap(self.relay(&route_name, &relay_labels, &cs)?),
                hub,
            });
        }

        let labels = import_labels(route, &bound);
        let destination = ServiceRef::new(&import.service.namespace, &import.service.name);
        let addresses = hubs
            .tunnel_endpoints(&import.hub_name)
            .and_then(|ep| ep.subsets)
            .unwrap_or_default()
            .into_iter()
            .flat_map(|s| s.addresses.unwrap_or_default())
            .collect::<Vec<_>>();
        objs.push(HubObject {
            hub: import.hub_name.clone(),
            resource: Resource::Service(import_service(&destination, &labels, &bound)),
        });
        objs.push(HubObject {
            hub: import.hub_name.clone(),
            resource: Resource::Endpoints(import_endpoints(
                &destination,
                &labels,
                &bound,
                addresses,
            )),
        });
        Ok((objs, bound.len()))
    }

    fn relay(
        &self,
        route_name: &str,
        labels: &labels::Map,
        chains: &[Chain],
    ) -> Result<ConfigMap, RouteError> {
        Ok(ConfigMap {
            metadata: ObjectMeta {
                namespace: Some(self.tunnel_namespace.clone()),
                name: Some(format!("{route_name}-{TUNNEL_KEY}")),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            data: Some(
                std::iter::once((TUNNEL_KEY.to_string(), chain::to_json(chains)?)).collect(),
            ),
            ..Default::default()
        })
    }

    fn relay_labels(&self, route: &Route) -> labels::Map {
        let mut labels = store::managed_labels();
        let export = &route.spec.export;
        labels.insert(labels::EXPORTED_FROM.to_string(), export.hub_name.clone());
        labels.insert(
            labels::EXPORTED_FROM_NAMESPACE.to_string(),
            export.service.namespace.clone(),
        );
        labels.insert(
            labels::EXPORTED_FROM_NAME.to_string(),
            export.service.name.clone(),
        );
        labels.insert(
            labels::IMPORTED_TO.to_string(),
            route.spec.import.hub_name.clone(),
        );
        labels
    }
}

fn tcp_ports(svc: &Service) -> Vec<ServicePort> {
    svc.spec
        .iter()
        .flat_map(|spec| spec.ports.iter().flatten())
        .filter(|p| p.protocol.as_deref().unwrap_or("TCP") == "TCP")
        .cloned()
        .collect()
}

fn import_labels(route: &Route, bound: &[(ServicePort, i32)]) -> labels::Map {
    let export = &route.spec.export;
    let ports = bound
        .iter()
        .map(|(p, _)| p.port.to_string())
        .collect::<Vec<_>>()
        .join("-");
    let mut labels = store::managed_labels();
    labels.insert(labels::EXPORTED_FROM.to_string(), export.hub_name.clone());
    labels.insert(
        labels::EXPORTED_FROM_NAMESPACE.to_string(),
        export.service.namespace.clone(),
    );
    labels.insert(
        labels::EXPORTED_FROM_NAME.to_string(),
        export.service.name.clone(),
    );
    labels.insert(labels::EXPORTED_FROM_PORTS.to_string(), ports);
    labels.insert(
        labels::IMPORTED_TO.to_string(),
        route.spec.import.hub_name.clone(),
    );
    labels
}

fn import_meta(destination: &ServiceRef, labels: &labels::Map) -> ObjectMeta {
    ObjectMeta {
        namespace: Some(destination.namespace.clone()),
        name: Some(destination.name.clone()),
        labels: Some(labels.clone()),
        ..Default::default()
    }
}

fn import_service(
    destination: &ServiceRef,
    labels: &labels::Map,
    bound: &[(ServicePort, i32)],
) -> Service {
    Service {
        metadata: import_meta(destination, labels),
        spec: Some(ServiceSpec {
            ports: Some(
                bound
                    .iter()
                    .map(|(port, peer_port)| ServicePort {
                        name: port.name.clone(),
                        port: port.port,
                        target_port: Some(IntOrString::Int(*peer_port)),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        status: None,
    }
}

fn import_endpoints(
    destination: &ServiceRef,
    labels: &labels::Map,
    bound: &[(ServicePort, i32)],
    addresses: Vec<crate::k8s::EndpointAddress>,
) -> Endpoints {
    // A subset must hold at least one address.
    let subsets = if addresses.is_empty() {
        None
    } else {
        Some(vec![EndpointSubset {
            addresses: Some(addresses),
            ports: Some(
                bound
                    .iter()
                    .map(|(port, peer_port)| EndpointPort {
                        name: port.name.clone(),
                        port: *peer_port,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }])
    };
    Endpoints {
        metadata: import_meta(destination, labels),
        subsets,
    }
}

// === impl HubObject ===

impl HubObject {
    pub fn kind(&self) -> &'static str {
        match self.resource {
            Resource::ConfigMap(_) => "ConfigMap",
            Resource::Service(_) => "Service",
            Resource::Endpoints(_) => "Endpoints",
        }
    }

    fn meta(&self) -> &ObjectMeta {
        match &self.resource {
            Resource::ConfigMap(o) => &o.metadata,
            Resource::Service(o) => &o.metadata,
            Resource::Endpoints(o) => &o.metadata,
        }
    }
}

impl Projected for HubObject {
    fn uniq_name(&self) -> String {
        let meta = self.meta();
        format!(
            "{}/{}/{}/{}",
            self.hub,
            self.kind(),
            meta.namespace.as_deref().unwrap_or_default(),
            meta.name.as_deref().unwrap_or_default()
        )
    }

    fn same_content(&self, other: &Self) -> bool {
        self.hub == other.hub
            && match (&self.resource, &other.resource) {
                (Resource::ConfigMap(a), Resource::ConfigMap(b)) => Object::same_content(a, b),
                (Resource::Service(a), Resource::Service(b)) => Object::same_content(a, b),
                (Resource::Endpoints(a), Resource::Endpoints(b)) => Object::same_content(a, b),
                _ => false,
            }
    }
}

// === impl Registry ===

#[async_trait::async_trait]
impl Hubs for index::Registry {
    fn topology(&self) -> Topology {
        index::Registry::topology(self)
    }

    fn get_service(&self, hub: &str, namespace: &str, name: &str) -> Option<Service> {
        index::Registry::get_service(self, hub, namespace, name)
    }

    fn tunnel_endpoints(&self, hub: &str) -> Option<Endpoints> {
        index::Registry::tunnel_endpoints(self, hub)
    }

    async fn allocate(&self, hub: &str, peer: &Peer) -> Result<i32, RouteError> {
        let ports = self
            .ports(hub)
            .ok_or_else(|| RouteError::NotConnected(hub.to_string()))?;
        Ok(ports.get(peer).await?)
    }

    async fn apply(&self, obj: &HubObject) -> Result<Applied, StoreError> {
        let Some(client) = self.client(&obj.hub) else {
            return Err(not_connected(obj));
        };
        match &obj.resource {
            Resource::ConfigMap(o) => store::apply(&client, o).await,
            Resource::Service(o) => store::apply(&client, o).await,
            Resource::Endpoints(o) => store::apply(&client, o).await,
        }
    }

    async fn delete(&self, obj: &HubObject) -> Result<bool, StoreError> {
        let Some(client) = self.client(&obj.hub) else {
            return Err(not_connected(obj));
        };
        match &obj.resource {
            Resource::ConfigMap(o) => store::delete(&client, o).await,
            Resource::Service(o) => store::delete(&client, o).await,
            Resource::Endpoints(o) => store::delete(&client, o).await,
        }
    }
}

fn not_connected(obj: &HubObject) -> StoreError {
    StoreError::NotConnected(obj.hub.clone())
}
