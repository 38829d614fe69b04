//! Plans the relays that carry a single service port across a hub path.
//!
//! Each adjacent pair of hubs along the path is joined by one SSH segment. The
//! segment is hosted by whichever side can dial the other's SSH listener; a
//! hub in the middle of the path meets its neighbours through a Unix socket
//! under `/dev/shm`. Once every segment is built, segments that meet on the
//! same socket are folded together so that each hub runs as few relays as
//! possible.

use crate::{
    gateway::Way,
    topology::{Topology, TopologyError},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single relay run by a hub's tunnel.
///
/// The tunnel listens on `bind[0]`, optionally through the layers in
/// `bind[1..]`, and dials `proxy[0]` through the layers in `proxy[1..]`. The
/// last layer in each list is the first one dialed from the hub itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    pub bind: Vec<String>,
    pub proxy: Vec<String>,
}

/// Relays keyed by the hub that runs them.
pub type Chains = BTreeMap<String, Vec<Chain>>;

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
}

/// The inputs needed to plan one service port.
#[derive(Clone, Debug)]
pub struct Plan<'a> {
    /// Names the relay's rendezvous sockets; must be unique per hub.
    pub name: &'a str,
    pub origin: &'a ServiceRef,
    pub origin_port: i32,
    pub peer_port: i32,
    pub path: &'a [String],
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("a hub path needs at least two hubs, got {0}")]
    EmptyPath(usize),

    #[error("neither {export} nor {import} is reachable by the other")]
    Unreachable { export: String, import: String },

    #[error("hub {0} is reachable but has no gateway address")]
    MissingAddress(String),

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

const UNIX_PREFIX: &str = "unix://";

// === impl Chain ===

impl Chain {
    fn bind_only(&self) -> Option<&str> {
        match self.bind.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    fn proxy_only(&self) -> Option<&str> {
        match self.proxy.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }
}

// === impl ServiceRef ===

impl ServiceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn authority(&self, port: i32) -> String {
        format!("{}.{}.svc:{port}", self.name, self.namespace)
    }
}

impl std::fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl Plan ===

impl Plan<'_> {
    /// Builds every segment along the path and folds them into per-hub
    /// relays.
    pub fn build(&self, topology: &Topology) -> Result<Chains, ChainError> {
        let mut chains = self.segments(topology)?;
        merge(self.path, &mut chains);
        Ok(chains)
    }

    fn unix_socket(&self) -> String {
        format!("{UNIX_PREFIX}/dev/shm/{}.socks", self.name)
    }

    fn segments(&self, topology: &Topology) -> Result<Chains, ChainError> {
        let path = self.path;
        if path.len() < 2 {
            return Err(ChainError::EmptyPath(path.len()));
        }
        let last = path.len() - 1;

        let mut chains = Chains::new();
        for (i, pair) in path.windows(2).enumerate() {
            let (export, import) = (&pair[0], &pair[1]);
            let e_gw = topology.gateway_of(export, import)?;
            let i_gw = topology.gateway_of(import, export)?;

            let bind = if i + 1 < last {
                self.unix_socket()
            } else {
                format!("0.0.0.0:{}", self.peer_port)
            };
            let dial = if i > 0 {
                self.unix_socket()
            } else {
                self.origin.authority(self.origin_port)
            };

            if e_gw.reachable {
                if e_gw.address.is_empty() {
                    return Err(ChainError::MissingAddress(export.clone()));
                }
                let mut proxy = vec![dial, ssh(&e_gw.address, topology.identity_of(export))];
                proxy.extend(proxies(&e_gw.reception, &i_gw.navigation));
                chains.entry(import.clone()).or_default().push(Chain {
                    bind: vec![bind],
                    proxy,
                });
            } else if i_gw.reachable {
                if i_gw.address.is_empty() {
                    return Err(ChainError::MissingAddress(import.clone()));
                }
                let mut bind = vec![bind, ssh(&i_gw.address, topology.identity_of(import))];
                bind.extend(proxies(&i_gw.reception, &e_gw.navigation));
                chains.entry(export.clone()).or_default().push(Chain {
                    bind,
                    proxy: vec![dial],
                });
            } else {
                return Err(ChainError::Unreachable {
                    export: export.clone(),
                    import: import.clone(),
                });
            }
        }

        Ok(chains)
    }
}

/// Folds relays that meet on a shared Unix socket and drops hubs left without
/// relays.
///
/// Merging is idempotent: a second pass over its own output changes nothing.
pub fn merge(path: &[String], chains: &mut Chains) {
    fold_repeaters(chains);
    fold_exports(path, chains);
    fold_imports(path, chains);
    chains.retain(|_, cs| !cs.is_empty());
}

/// A hub that neither neighbour can reach both accepts the upstream segment
/// and hosts the downstream one; fuse the two relays at their shared socket.
fn fold_repeaters(chains: &mut Chains) {
    for cs in chains.values_mut() {
        if let [first, second] = cs.as_slice() {
            let shared = match (first.bind.first(), second.proxy.first()) {
                (Some(bind), Some(proxy)) => bind == proxy,
                _ => false,
            };
            if shared {
                let fused = Chain {
                    bind: second
                        .bind
                        .iter()
                        .chain(first.bind.iter().skip(1))
                        .cloned()
                        .collect(),
                    proxy: first
                        .proxy
                        .iter()
                        .chain(second.proxy.iter().skip(1))
                        .cloned()
                        .collect(),
                };
                *cs = vec![fused];
            }
        }
    }
}

/// When consecutive hubs each dial the previous one, the downstream hub can
/// dial straight through: it absorbs the upstream dial layers and the
/// upstream relay is dropped.
fn fold_exports(path: &[String], chains: &mut Chains) {
    for pair in path.windows(2) {
        let (upstream, downstream) = (&pair[0], &pair[1]);
        let Some(absorbed) = single(chains, upstream)
            .zip(single(chains, downstream))
            .and_then(|(up, down)| {
                let socket = up.bind_only().filter(|b| b.starts_with(UNIX_PREFIX))?;
                if down.proxy.first().map(String::as_str) != Some(socket) {
                    return None;
                }
                Some(
                    up.proxy
                        .iter()
                        .chain(down.proxy.iter().skip(1))
                        .cloned()
                        .collect::<Vec<_>>(),
                )
            })
        else {
            continue;
        };

        chains.remove(upstream);
        if let Some(down) = chains.get_mut(downstream).and_then(|cs| cs.first_mut()) {
            down.proxy = absorbed;
        }
    }
}

/// The mirror of [`fold_exports`]: when consecutive hubs each bind through
/// the next one, the upstream hub can bind straight through.
fn fold_imports(path: &[String], chains: &mut Chains) {
    for pair in path.windows(2).rev() {
        let (upstream, downstream) = (&pair[0], &pair[1]);
        let Some(absorbed) = single(chains, upstream)
            .zip(single(chains, downstream))
            .and_then(|(up, down)| {
                let socket = down.proxy_only().filter(|p| p.starts_with(UNIX_PREFIX))?;
                if up.bind.first().map(String::as_str) != Some(socket) {
                    return None;
                }
                Some(
                    down.bind
                        .iter()
                        .chain(up.bind.iter().skip(1))
                        .cloned()
                        .collect::<Vec<_>>(),
                )
            })
        else {
            continue;
        };

        chains.remove(downstream);
        if let Some(up) = chains.get_mut(upstream).and_then(|cs| cs.first_mut()) {
            up.bind = absorbed;
        }
    }
}

fn single<'c>(chains: &'c Chains, hub: &str) -> Option<&'c Chain> {
    match chains.get(hub).map(Vec::as_slice) {
        Some([only]) => Some(only),
        _ => None,
    }
}

fn ssh(address: &str, identity: &str) -> String {
    format!("ssh://{address}?identity_data={identity}")
}

fn proxies<'w>(first: &'w [Way], then: &'w [Way]) -> impl Iterator<Item = String> + 'w {
    first
        .iter()
        .chain(then)
        .filter_map(Way::proxy)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}

/// Renders a hub's relays the way the tunnel reads them.
pub fn to_json(chains: &[Chain]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(chains)
}
