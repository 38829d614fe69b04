//! The hub registry.
//!
//! Each `Hub` resource in the control-plane namespace names a member cluster. Its credentials live
//! in two secrets next to it: `<hub>-kubeconfig` holds the kubeconfig used to reach the hub's API
//! server and `<hub>-identity` holds the SSH identity peers present to its tunnel. The registry
//! maintains one client per hub, rebuilding it only when the kubeconfig changes, and runs the
//! hub's watches for as long as the client is current.

use crate::{
    cache::{Cache, EventHandler, ManagedOnly, SharedCache},
    tunnel::{TunnelClient, TUNNEL_SERVICE},
};
use ahash::AHashMap as HashMap;
use anyhow::Context;
use base64::Engine;
use ferry_controller_core::{
    conditions, Condition, Conditions, Gateway, HubGateway, Peer, PortAllocator, Topology,
    Trigger, Way,
};
use ferry_controller_k8s_api::{
    self as k8s,
    hub::{HubSpecGateway, HubSpecGatewayWay},
    labels, watcher, Api, Client, Endpoints, Hub, Labels, ResourceExt, Secret, Service,
    ServiceExport, ServiceImport,
};
use futures::prelude::*;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    runtime::WatchStreamExt,
};
use parking_lot::{Mutex, RwLock};
use std::{collections::BTreeMap, fmt::Debug, sync::Arc};
use tokio::{task::JoinHandle, time};
use tracing::{info_span, Instrument};

pub const KUBECONFIG_KEY: &str = "kubeconfig";
pub const IDENTITY_KEY: &str = "identity";

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// The control-plane namespace holding hubs, secrets, policies and routes.
    pub namespace: String,
    pub tunnel_namespace: String,
    pub control_plane_hub: String,
    pub probe_timeout: time::Duration,
}

/// Tracks every hub along with the clients and watches needed to reach it.
pub struct Registry {
    config: RegistryConfig,
    local: Client,
    trigger: Trigger,
    conditions: Arc<Conditions>,
    hubs: SharedCache<Hub>,
    secrets: SharedCache<Secret>,
    members: RwLock<HashMap<String, Arc<Member>>>,
}

/// A hub the registry holds a client for.
struct Member {
    kubeconfig: Option<Vec<u8>>,
    client: Client,
    tunnel: TunnelClient,
    ports: Arc<PortAllocator<TunnelClient>>,
    services: SharedCache<Service>,
    tunnel_endpoints: SharedCache<Endpoints>,
    watches: Vec<JoinHandle<()>>,
    mcs: Mutex<Option<Mcs>>,
}

/// MCS watches, run only while a hub carries the `mcs=true` label.
struct Mcs {
    exports: SharedCache<ServiceExport>,
    imports: SharedCache<ServiceImport>,
    watches: Vec<JoinHandle<()>>,
}

/// Seeds a hub's port bindings from the services the controller projected
/// onto it, and releases them when those services go away.
struct PortLoader {
    hub: String,
    ports: Arc<PortAllocator<TunnelClient>>,
}

// === impl Registry ===

impl Registry {
    pub fn new(
        config: RegistryConfig,
        local: Client,
        trigger: Trigger,
        conditions: Arc<Conditions>,
    ) -> Self {
        let hubs = Cache::default().with_handler(trigger.clone()).shared();
        let secrets = Cache::default().with_handler(trigger.clone()).shared();
        Self {
            config,
            local,
            trigger,
            conditions,
            hubs,
            secrets,
            members: Default::default(),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// The cache fed by the control-plane `Hub` watch.
    pub fn hub_cache(&self) -> SharedCache<Hub> {
        self.hubs.clone()
    }

    /// The cache fed by the control-plane `Secret` watch.
    pub fn secret_cache(&self) -> SharedCache<Secret> {
        self.secrets.clone()
    }

    pub fn conditions(&self) -> &Arc<Conditions> {
        &self.conditions
    }

    /// Reconciles members against the current hubs and secrets.
    ///
    /// A hub's client and watches are rebuilt only when its kubeconfig bytes
    /// change; everything else about a hub is read fresh on each call.
    pub async fn refresh(&self) {
        let hubs = self.hubs.read().list_namespaced(&self.config.namespace);

        for hub in &hubs {
            let name = hub.name_unchecked();
            let kubeconfig = self.secret_data(&format!("{name}-kubeconfig"), KUBECONFIG_KEY);

            let current = self.members.read().get(&name).cloned();
            let member = match current {
                Some(member) if member.kubeconfig == kubeconfig => member,
                _ => match self.connect(&name, kubeconfig).await {
                    Ok(member) => {
                        tracing::info!(hub = %name, "Connected");
                        self.conditions.set(
                            &name,
                            Condition::new(conditions::CONNECTED, true, "Connected", ""),
                        );
                        let member = Arc::new(member);
                        self.members.write().insert(name.clone(), member.clone());
                        self.trigger.request();
                        member
                    }
                    Err(error) => {
                        tracing::warn!(hub = %name, %error, "Failed to connect");
                        self.conditions.set(
                            &name,
                            Condition::new(
                                conditions::CONNECTED,
                                false,
                                "Disconnected",
                                format!("{error:#}"),
                            ),
                        );
                        self.members.write().remove(&name);
                        continue;
                    }
                },
            };

            let mcs = Labels::from(hub.metadata.labels.clone()).get(labels::MCS) == Some("true");
            member.set_mcs(&name, mcs, &self.trigger);
        }

        let removed = {
            let mut members = self.members.write();
            let stale = members
                .keys()
                .filter(|name| !hubs.iter().any(|h| h.name_unchecked() == **name))
                .cloned()
                .collect::<Vec<_>>();
            for name in &stale {
                members.remove(name);
            }
            stale
        };
        for name in removed {
            tracing::info!(hub = %name, "Removed");
            self.conditions.delete(&name);
        }
    }

    async fn connect(&self, name: &str, kubeconfig: Option<Vec<u8>>) -> anyhow::Result<Member> {
        let client = match &kubeconfig {
            Some(bytes) => client_from_kubeconfig(bytes).await?,
            None if name == self.config.control_plane_hub => self.local.clone(),
            None => anyhow::bail!(
                "secret {}/{name}-kubeconfig has no {KUBECONFIG_KEY:?} key",
                self.config.namespace
            ),
        };
        Ok(Member::start(name, kubeconfig, client, &self.config, &self.trigger))
    }

    fn secret_data(&self, secret: &str, key: &str) -> Option<Vec<u8>> {
        let secret = self.secrets.read().get(&self.config.namespace, secret)?;
        secret.data?.remove(key).map(|bytes| bytes.0)
    }

    fn member(&self, hub: &str) -> Option<Arc<Member>> {
        self.members.read().get(hub).cloned()
    }

    /// Lists hubs in the control-plane namespace, ordered by name.
    pub fn list_hubs(&self) -> Vec<Hub> {
        self.hubs.read().list_namespaced(&self.config.namespace)
    }

    /// Names the hubs the registry currently holds a client for.
    pub fn connected(&self) -> Vec<String> {
        let mut names = self.members.read().keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Snapshots every hub's gateways and identity.
    pub fn topology(&self) -> Topology {
        let mut topology = Topology::default();
        for hub in self.list_hubs() {
            let name = hub.name_unchecked();
            if let Some(identity) = self.secret_data(&format!("{name}-identity"), IDENTITY_KEY) {
                topology.set_identity(
                    &name,
                    base64::engine::general_purpose::URL_SAFE.encode(identity),
                );
            }
            topology.insert_hub(name, hub_gateway(&hub.spec));
        }
        topology
    }

    pub fn client(&self, hub: &str) -> Option<Client> {
        self.member(hub).map(|m| m.client.clone())
    }

    pub fn tunnel(&self, hub: &str) -> Option<TunnelClient> {
        self.member(hub).map(|m| m.tunnel.clone())
    }

    pub fn ports(&self, hub: &str) -> Option<Arc<PortAllocator<TunnelClient>>> {
        self.member(hub).map(|m| m.ports.clone())
    }

    pub fn list_services(&self, hub: &str) -> Vec<Service> {
        self.member(hub)
            .map(|m| m.services.read().list())
            .unwrap_or_default()
    }

    pub fn get_service(&self, hub: &str, namespace: &str, name: &str) -> Option<Service> {
        self.member(hub)?.services.read().get(namespace, name)
    }

    /// The `ferry-tunnel` endpoints in `hub`'s tunnel namespace.
    pub fn tunnel_endpoints(&self, hub: &str) -> Option<Endpoints> {
        self.member(hub)?
            .tunnel_endpoints
            .read()
            .get(&self.config.tunnel_namespace, TUNNEL_SERVICE)
    }

    /// Lists MCS exports and imports by hub, for hubs with bridging enabled.
    ///
    /// Objects outside `namespace` are skipped; `None` lists every namespace.
    #[allow(clippy::type_complexity)]
    pub fn list_mcs(
        &self,
        namespace: Option<&str>,
    ) -> (
        BTreeMap<String, Vec<ServiceExport>>,
        BTreeMap<String, Vec<ServiceImport>>,
    ) {
        let members = self
            .members
            .read()
            .iter()
            .map(|(name, m)| (name.clone(), m.clone()))
            .collect::<Vec<_>>();

        let mut exports = BTreeMap::new();
        let mut imports = BTreeMap::new();
        for (name, member) in members {
            if let Some(mcs) = member.mcs.lock().as_ref() {
                let (hub_exports, hub_imports) = match namespace {
                    Some(ns) => (
                        mcs.exports.read().list_namespaced(ns),
                        mcs.imports.read().list_namespaced(ns),
                    ),
                    None => (mcs.exports.read().list(), mcs.imports.read().list()),
                };
                exports.insert(name.clone(), hub_exports);
                imports.insert(name, hub_imports);
            }
        }
        (exports, imports)
    }
}

impl Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("members", &self.connected())
            .finish()
    }
}

// === impl Member ===

impl Member {
    fn start(
        name: &str,
        kubeconfig: Option<Vec<u8>>,
        client: Client,
        config: &RegistryConfig,
        trigger: &Trigger,
    ) -> Self {
        let tunnel = TunnelClient::for_hub(
            name,
            &config.control_plane_hub,
            &config.tunnel_namespace,
            config.probe_timeout,
        );
        let ports = Arc::new(PortAllocator::new(tunnel.clone()));

        let services = Cache::default()
            .with_handler(trigger.clone())
            .with_handler(ManagedOnly(PortLoader {
                hub: name.to_string(),
                ports: ports.clone(),
            }))
            .shared();
        let tunnel_endpoints = Cache::default().with_handler(trigger.clone()).shared();

        let services_watch = tokio::spawn(
            kubert::index::namespaced(
                services.clone(),
                events(Api::<Service>::all(client.clone()), watcher::Config::default()),
            )
            .instrument(info_span!("services", hub = %name)),
        );
        let endpoints_watch = tokio::spawn(
            kubert::index::namespaced(
                tunnel_endpoints.clone(),
                events(
                    Api::<Endpoints>::namespaced(client.clone(), &config.tunnel_namespace),
                    watcher::Config::default().fields(&format!("metadata.name={TUNNEL_SERVICE}")),
                ),
            )
            .instrument(info_span!("endpoints", hub = %name)),
        );

        Self {
            kubeconfig,
            client,
            tunnel,
            ports,
            services,
            tunnel_endpoints,
            watches: vec![services_watch, endpoints_watch],
            mcs: Mutex::new(None),
        }
    }

    fn set_mcs(&self, name: &str, enabled: bool, trigger: &Trigger) {
        let mut mcs = self.mcs.lock();
        match (enabled, mcs.is_some()) {
            (true, false) => {
                tracing::info!(hub = %name, "Watching MCS resources");
                *mcs = Some(Mcs::start(name, &self.client, trigger));
            }
            (false, true) => {
                tracing::info!(hub = %name, "Stopped watching MCS resources");
                *mcs = None;
                trigger.request();
            }
            _ => {}
        }
    }
}

impl Drop for Member {
    fn drop(&mut self) {
        for watch in &self.watches {
            watch.abort();
        }
    }
}

// === impl Mcs ===

impl Mcs {
    fn start(name: &str, client: &Client, trigger: &Trigger) -> Self {
        let exports = Cache::default().with_handler(trigger.clone()).shared();
        let imports = Cache::default().with_handler(trigger.clone()).shared();

        let span = info_span!("mcs", hub = %name);
        let watches = vec![
            tokio::spawn(
                kubert::index::namespaced(
                    exports.clone(),
                    events(Api::<ServiceExport>::all(client.clone()), Default::default()),
                )
                .instrument(span.clone()),
            ),
            tokio::spawn(
                kubert::index::namespaced(
                    imports.clone(),
                    events(Api::<ServiceImport>::all(client.clone()), Default::default()),
                )
                .instrument(span),
            ),
        ];

        Self {
            exports,
            imports,
            watches,
        }
    }
}

impl Drop for Mcs {
    fn drop(&mut self) {
        for watch in &self.watches {
            watch.abort();
        }
    }
}

// === impl PortLoader ===

impl PortLoader {
    fn bindings(svc: &Service) -> Vec<(Peer, i32)> {
        let svc_labels = Labels::from(svc.metadata.labels.clone());
        let (Some(cluster), Some(namespace), Some(name)) = (
            svc_labels.get(labels::EXPORTED_FROM),
            svc_labels.get(labels::EXPORTED_FROM_NAMESPACE),
            svc_labels.get(labels::EXPORTED_FROM_NAME),
        ) else {
            return Vec::new();
        };

        svc.spec
            .iter()
            .flat_map(|spec| spec.ports.iter().flatten())
            .filter_map(|port| match port.target_port {
                Some(k8s::IntOrString::Int(target)) => {
                    Some((Peer::new(cluster, namespace, name, port.port), target))
                }
                _ => None,
            })
            .collect()
    }

    fn load(&self, svc: &Service) {
        for (peer, port) in Self::bindings(svc) {
            if let Err(error) = self.ports.load(peer, port) {
                tracing::info!(hub = %self.hub, %error, "Ignoring projected port");
            }
        }
    }
}

impl EventHandler<Service> for PortLoader {
    fn on_add(&self, svc: &Service) {
        self.load(svc);
    }

    fn on_update(&self, _: &Service, svc: &Service) {
        self.load(svc);
    }

    fn on_delete(&self, svc: &Service) {
        for (peer, port) in Self::bindings(svc) {
            if self.ports.lookup(&peer) == Some(port) {
                let _ = self.ports.delete(&peer);
                tracing::debug!(hub = %self.hub, %peer, port, "Released port");
            }
        }
    }
}

fn events<K>(
    api: Api<K>,
    config: watcher::Config,
) -> impl Stream<Item = watcher::Event<K>> + Send + 'static
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + Debug + Send + 'static,
{
    watcher(api, config)
        .default_backoff()
        .filter_map(|event| async move {
            match event {
                Ok(event) => Some(event),
                Err(error) => {
                    tracing::info!(%error, "Watch failed");
                    None
                }
            }
        })
}

async fn client_from_kubeconfig(bytes: &[u8]) -> anyhow::Result<Client> {
    let yaml = std::str::from_utf8(bytes).context("kubeconfig is not UTF-8")?;
    let kubeconfig = Kubeconfig::from_yaml(yaml).context("invalid kubeconfig")?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context("failed to load kubeconfig")?;
    Client::try_from(config).context("failed to build client")
}

fn hub_gateway(spec: &k8s::HubSpec) -> HubGateway {
    spec.override_
        .iter()
        .fold(HubGateway::new(gateway(&spec.gateway)), |gw, (peer, over)| {
            gw.with_override(peer, gateway(over))
        })
}

fn gateway(spec: &HubSpecGateway) -> Gateway {
    Gateway {
        reachable: spec.reachable,
        address: spec.address.clone(),
        navigation: ways(&spec.navigation),
        reception: ways(&spec.reception),
    }
}

fn ways(ways: &[HubSpecGatewayWay]) -> Vec<Way> {
    ways.iter()
        .filter_map(|way| match (&way.hub_name, &way.proxy) {
            (Some(hub), _) if !hub.is_empty() => Some(Way::Hub(hub.clone())),
            (_, Some(proxy)) if !proxy.is_empty() => Some(Way::Proxy(proxy.clone())),
            _ => None,
        })
        .collect()
}
