use super::status::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A member cluster participating in the mesh.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "traffic.ferryproxy.io",
    version = "v1alpha2",
    kind = "Hub",
    status = "HubStatus",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Last-Synchronized","type":"date","jsonPath":".status.lastSynchronizationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HubSpec {
    /// The default way peers reach this hub.
    #[serde(default)]
    pub gateway: HubSpecGateway,

    /// Per-peer replacements for the default gateway, keyed by peer hub name.
    #[serde(
        default,
        rename = "override",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub override_: BTreeMap<String, HubSpecGateway>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HubSpecGateway {
    /// Whether peers can dial this hub's SSH listener.
    #[serde(default)]
    pub reachable: bool,

    /// The `host:port` of this hub's SSH listener.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,

    /// Intermediaries this hub traverses to reach a peer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub navigation: Vec<HubSpecGatewayWay>,

    /// Intermediaries a peer traverses to reach this hub.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reception: Vec<HubSpecGatewayWay>,
}

/// Exactly one of `hubName` or `proxy` is set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HubSpecGatewayWay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HubStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synchronization_timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
