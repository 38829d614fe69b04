use ahash::AHashMap as HashMap;

/// A hop hint: either a peer hub that must be traversed or a raw proxy URL
/// (`socks5://...`, `http://...`) to dial through.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Way {
    Hub(String),
    Proxy(String),
}

/// Describes how a hub can be reached by a peer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Gateway {
    /// Whether the hub's SSH listener can be dialed by the peer.
    pub reachable: bool,

    /// The `host:port` of the hub's SSH listener.
    pub address: String,

    /// Intermediaries this hub uses to reach a peer's SSH listener, from the
    /// near side.
    pub navigation: Vec<Way>,

    /// Intermediaries a peer must traverse to reach this hub's SSH listener,
    /// from the near side.
    pub reception: Vec<Way>,
}

/// A hub's default gateway along with per-peer overrides.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HubGateway {
    pub default: Gateway,
    pub overrides: HashMap<String, Gateway>,
}

// === impl Way ===

impl Way {
    pub fn hub_name(&self) -> Option<&str> {
        match self {
            Self::Hub(name) => Some(name),
            Self::Proxy(_) => None,
        }
    }

    pub fn proxy(&self) -> Option<&str> {
        match self {
            Self::Proxy(url) => Some(url),
            Self::Hub(_) => None,
        }
    }
}

// === impl Gateway ===

impl Gateway {
    pub fn reachable(address: impl Into<String>) -> Self {
        Self {
            reachable: true,
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn unreachable() -> Self {
        Self::default()
    }

    pub fn with_navigation(mut self, ways: impl IntoIterator<Item = Way>) -> Self {
        self.navigation = ways.into_iter().collect();
        self
    }

    pub fn with_reception(mut self, ways: impl IntoIterator<Item = Way>) -> Self {
        self.reception = ways.into_iter().collect();
        self
    }

    /// Iterates over the hub names in the navigation list.
    pub(crate) fn navigation_hubs(&self) -> impl Iterator<Item = &str> + '_ {
        self.navigation.iter().filter_map(Way::hub_name)
    }

    /// Iterates over the hub names in the reception list.
    pub(crate) fn reception_hubs(&self) -> impl Iterator<Item = &str> + '_ {
        self.reception.iter().filter_map(Way::hub_name)
    }
}

// === impl HubGateway ===

impl HubGateway {
    pub fn new(default: Gateway) -> Self {
        Self {
            default,
            overrides: HashMap::default(),
        }
    }

    pub fn with_override(mut self, peer: impl Into<String>, gateway: Gateway) -> Self {
        self.overrides.insert(peer.into(), gateway);
        self
    }

    /// Resolves the gateway this hub presents to `peer`.
    pub fn for_peer(&self, peer: &str) -> &Gateway {
        self.overrides.get(peer).unwrap_or(&self.default)
    }
}
