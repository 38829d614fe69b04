use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::fmt;

/// A service port exported from a hub, as seen by an importing hub.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Peer {
    pub cluster: String,
    pub namespace: String,
    pub name: String,
    pub port: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("cannot bind {peer} to port {port}: {existing}")]
    DuplicatePeer {
        peer: Peer,
        port: i32,
        existing: String,
    },

    #[error("{0} is not bound to a port")]
    Unbound(Peer),

    #[error("no unused port found for {0}")]
    Exhausted(Peer),

    #[error("failed to fetch an unused port: {0}")]
    Unused(String),
}

/// A source of candidate ports on an import hub.
#[async_trait::async_trait]
pub trait UnusedPorts {
    async fn next_unused(&self) -> Result<i32, PortError>;
}

/// The bijection between exported peers and local ports on one import hub.
#[derive(Debug, Default)]
pub struct PortBindings {
    peer_to_port: HashMap<Peer, i32>,
    port_to_peer: HashMap<i32, Peer>,
}

/// Allocates ports on an import hub for the peers it imports.
#[derive(Debug)]
pub struct PortAllocator<U> {
    bindings: RwLock<PortBindings>,
    unused: U,
}

/// How many candidates to try before giving up on a peer.
const MAX_CANDIDATES: usize = 16;

// === impl Peer ===

impl Peer {
    pub fn new(
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        port: i32,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: namespace.into(),
            name: name.into(),
            port,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}",
            self.cluster, self.namespace, self.name, self.port
        )
    }
}

// === impl PortBindings ===

impl PortBindings {
    pub fn get(&self, peer: &Peer) -> Option<i32> {
        self.peer_to_port.get(peer).copied()
    }

    pub fn peer(&self, port: i32) -> Option<&Peer> {
        self.port_to_peer.get(&port)
    }

    pub fn len(&self) -> usize {
        self.peer_to_port.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peer_to_port.is_empty()
    }

    /// Binds `peer` to `port`.
    ///
    /// Loading a binding that already exists is a no-op. Fails, leaving the
    /// existing bindings intact, if either the peer or the port is bound to
    /// something else.
    pub fn load(&mut self, peer: Peer, port: i32) -> Result<(), PortError> {
        match (self.peer_to_port.get(&peer), self.port_to_peer.get(&port)) {
            (None, None) => {
                self.port_to_peer.insert(port, peer.clone());
                self.peer_to_port.insert(peer, port);
                Ok(())
            }
            (Some(&bound), Some(owner)) if bound == port && *owner == peer => Ok(()),
            (Some(&bound), _) if bound != port => Err(PortError::DuplicatePeer {
                peer,
                port,
                existing: format!("peer is bound to port {bound}"),
            }),
            (_, Some(owner)) => {
                let existing = format!("port is bound to {owner}");
                Err(PortError::DuplicatePeer {
                    peer,
                    port,
                    existing,
                })
            }
            (Some(_), None) => Err(PortError::DuplicatePeer {
                peer,
                port,
                existing: "bindings are inconsistent".to_string(),
            }),
        }
    }

    /// Releases `peer`'s port.
    pub fn delete(&mut self, peer: &Peer) -> Result<i32, PortError> {
        let port = self
            .peer_to_port
            .remove(peer)
            .ok_or_else(|| PortError::Unbound(peer.clone()))?;
        self.port_to_peer.remove(&port);
        Ok(port)
    }

    #[cfg(test)]
    fn is_bijective(&self) -> bool {
        self.peer_to_port.len() == self.port_to_peer.len()
            && self
                .peer_to_port
                .iter()
                .all(|(peer, port)| self.port_to_peer.get(port) == Some(peer))
    }
}

// === impl PortAllocator ===

impl<U: UnusedPorts> PortAllocator<U> {
    pub fn new(unused: U) -> Self {
        Self {
            bindings: RwLock::new(PortBindings::default()),
            unused,
        }
    }

    /// Returns `peer`'s port, allocating an unused one if it has none.
    pub async fn get(&self, peer: &Peer) -> Result<i32, PortError> {
        if let Some(port) = self.bindings.read().get(peer) {
            return Ok(port);
        }

        for _ in 0..MAX_CANDIDATES {
            let port = self.unused.next_unused().await?;
            let mut bindings = self.bindings.write();
            // The peer may have been bound while waiting for a candidate.
            if let Some(port) = bindings.get(peer) {
                return Ok(port);
            }
            if bindings.peer(port).is_some() {
                tracing::debug!(%peer, port, "Candidate port already bound");
                continue;
            }
            bindings.load(peer.clone(), port)?;
            tracing::debug!(%peer, port, "Allocated port");
            return Ok(port);
        }

        Err(PortError::Exhausted(peer.clone()))
    }

    pub fn load(&self, peer: Peer, port: i32) -> Result<(), PortError> {
        self.bindings.write().load(peer, port)
    }

    pub fn delete(&self, peer: &Peer) -> Result<i32, PortError> {
        self.bindings.write().delete(peer)
    }

    pub fn lookup(&self, peer: &Peer) -> Option<i32> {
        self.bindings.read().get(peer)
    }

    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }
}
