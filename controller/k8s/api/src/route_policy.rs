use super::status::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declares a join between services: every export rule is paired with every
/// import rule on a different hub.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "traffic.ferryproxy.io",
    version = "v1alpha2",
    kind = "RoutePolicy",
    status = "RoutePolicyStatus",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Routes","type":"integer","jsonPath":".status.routeCount"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RoutePolicySpec {
    #[serde(default)]
    pub exports: Vec<RoutePolicySpecRule>,

    #[serde(default)]
    pub imports: Vec<RoutePolicySpecRule>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoutePolicySpecRule {
    /// Rules with an empty hub name are ignored.
    #[serde(default)]
    pub hub_name: String,

    #[serde(default)]
    pub service: RoutePolicySpecRuleService,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoutePolicySpecRuleService {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoutePolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_count: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synchronization_timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

// === impl RoutePolicySpecRule ===

impl RoutePolicySpecRule {
    pub fn hub(hub_name: impl Into<String>) -> Self {
        Self {
            hub_name: hub_name.into(),
            service: Default::default(),
        }
    }

    pub fn service(mut self, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        self.service.namespace = namespace.into();
        self.service.name = name.into();
        self
    }

    pub fn labels(mut self, labels: impl IntoIterator<Item = (String, String)>) -> Self {
        self.service.labels = labels.into_iter().collect();
        self
    }
}
