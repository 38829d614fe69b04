use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A status condition as it appears on ferry resources.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    /// RFC 3339 timestamp of the last status flip.
    #[serde(default)]
    pub last_transition_time: String,
}
