use crate::gateway::{Gateway, HubGateway};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};

/// A point-in-time view of every registered hub's gateways and identities.
///
/// The topology is built from the hub registry at the start of each sync so
/// that solving and planning never observe concurrent hub updates.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    hubs: HashMap<String, HubGateway>,
    identities: HashMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("hub name must not be empty")]
    EmptyHubName,

    #[error("export and import hub are both {0}")]
    SameHub(String),

    #[error("hub {0} is not registered")]
    UnknownHub(String),
}

// === impl Topology ===

impl Topology {
    pub fn insert_hub(&mut self, name: impl Into<String>, gateway: HubGateway) {
        self.hubs.insert(name.into(), gateway);
    }

    /// Records the encoded identity used to authenticate to `name`'s SSH listener.
    pub fn set_identity(&mut self, name: impl Into<String>, identity: impl Into<String>) {
        self.identities.insert(name.into(), identity.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hubs.contains_key(name)
    }

    pub fn hub_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.hubs.keys().map(String::as_str)
    }

    /// Resolves the gateway `hub` presents to `peer`, honoring per-peer
    /// overrides.
    pub fn gateway_of(&self, hub: &str, peer: &str) -> Result<&Gateway, TopologyError> {
        self.hubs
            .get(hub)
            .map(|gw| gw.for_peer(peer))
            .ok_or_else(|| TopologyError::UnknownHub(hub.to_string()))
    }

    pub fn identity_of(&self, hub: &str) -> &str {
        self.identities.get(hub).map(String::as_str).unwrap_or("")
    }

    /// Computes the sequence of hubs traversed by data flowing from `export`
    /// to `import`.
    ///
    /// Hubs are inserted between adjacent entries according to reachability
    /// and navigation/reception hints; this is not a shortest-path search. The
    /// returned sequence always starts with `export`, ends with `import`, and
    /// holds no duplicates. When neither side of an adjacency is reachable and
    /// no hints apply, the sequence is returned as-is and the chain planner
    /// reports the gap.
    pub fn solve(&self, export: &str, import: &str) -> Result<Vec<String>, TopologyError> {
        if export.is_empty() || import.is_empty() {
            return Err(TopologyError::EmptyHubName);
        }
        if export == import {
            return Err(TopologyError::SameHub(export.to_string()));
        }
        for hub in [export, import] {
            if !self.contains(hub) {
                return Err(TopologyError::UnknownHub(hub.to_string()));
            }
        }

        let mut ways = vec![export.to_string(), import.to_string()];
        let mut seen = [export.to_string(), import.to_string()]
            .into_iter()
            .collect::<HashSet<_>>();

        let mut i = 0;
        while i + 1 < ways.len() {
            let e = &ways[i];
            let im = &ways[i + 1];
            let e_gw = self.gateway_of(e, im)?;
            let i_gw = self.gateway_of(im, e)?;

            let insert = if e_gw.reachable {
                i_gw.navigation_hubs()
                    .chain(e_gw.reception_hubs().collect::<Vec<_>>().into_iter().rev())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            } else if i_gw.reachable {
                i_gw.reception_hubs()
                    .chain(e_gw.navigation_hubs().collect::<Vec<_>>().into_iter().rev())
                    .map(str::to_string)
                    .collect()
            } else if i_gw.navigation.is_empty() && e_gw.navigation.is_empty() {
                tracing::debug!(export = %e, import = %im, "No way between hubs");
                break;
            } else {
                i_gw.navigation_hubs()
                    .chain(e_gw.navigation_hubs().collect::<Vec<_>>().into_iter().rev())
                    .map(str::to_string)
                    .collect()
            };

            // Each hub is inserted directly after `ways[i]`, so the hints end
            // up in reverse order along the data path.
            for hub in insert {
                if !self.contains(&hub) {
                    return Err(TopologyError::UnknownHub(hub));
                }
                if seen.insert(hub.clone()) {
                    ways.insert(i + 1, hub);
                }
            }

            i += 1;
        }

        Ok(ways)
    }
}
