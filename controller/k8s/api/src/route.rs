use super::status::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Exposes one service from an export hub as a service on an import hub.
///
/// Routes are normally generated from a `RoutePolicy`, but may also be
/// authored directly.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "traffic.ferryproxy.io",
    version = "v1alpha2",
    kind = "Route",
    status = "RouteStatus",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Export","type":"string","jsonPath":".status.export"}"#,
    printcolumn = r#"{"name":"Import","type":"string","jsonPath":".status.import"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    pub import: RouteSpecRule,
    pub export: RouteSpecRule,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpecRule {
    pub hub_name: String,
    pub service: RouteSpecRuleService,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpecRuleService {
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synchronization_timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

// === impl RouteSpecRule ===

impl RouteSpecRule {
    pub fn new(
        hub_name: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            hub_name: hub_name.into(),
            service: RouteSpecRuleService {
                namespace: namespace.into(),
                name: name.into(),
            },
        }
    }
}

impl std::fmt::Display for RouteSpecRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}/{}",
            self.hub_name, self.service.namespace, self.service.name
        )
    }
}
