use std::{collections::BTreeMap, sync::Arc};

pub const EXPORTED_FROM: &str = "traffic.ferryproxy.io/exported-from";
pub const EXPORTED_FROM_NAMESPACE: &str = "traffic.ferryproxy.io/exported-from-namespace";
pub const EXPORTED_FROM_NAME: &str = "traffic.ferryproxy.io/exported-from-name";
pub const EXPORTED_FROM_PORTS: &str = "traffic.ferryproxy.io/exported-from-ports";
pub const IMPORTED_TO: &str = "traffic.ferryproxy.io/imported-to";

pub const MANAGED_BY: &str = "ferryproxy.io/managed-by";
pub const MANAGED_BY_FERRY: &str = "ferry";

pub const GENERATED: &str = "ferryproxy.io/generated";
pub const GENERATED_ROUTE: &str = "true";
pub const GENERATED_TUNNEL: &str = "tunnel";

pub const GENERATED_BY: &str = "generated-by";
pub const GENERATED_BY_FERRY: &str = "ferry";

/// Enables MCS bridging on a hub when set to `true`.
pub const MCS: &str = "mcs";

pub type Map = BTreeMap<String, String>;

/// A shared, immutable set of labels.
#[derive(Clone, Debug, Eq, Default)]
pub struct Labels(Arc<Map>);

/// Selects resources whose labels hold every key/value pair.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Selector {
    match_labels: Map,
}

// === impl Selector ===

impl Selector {
    pub fn from_map(match_labels: Map) -> Self {
        Self { match_labels }
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }

    /// Merges `other` into this selector; `other` wins on conflicting keys.
    pub fn merge(mut self, other: &Map) -> Self {
        self.match_labels
            .extend(other.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.0.get(k) == Some(v))
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

// === impl Labels ===

impl Labels {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_managed(&self) -> bool {
        self.get(MANAGED_BY) == Some(MANAGED_BY_FERRY)
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl<T: AsRef<Map>> std::cmp::PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}
