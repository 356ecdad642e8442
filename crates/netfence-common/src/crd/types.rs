//! Status condition shared by netfence resources

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reporting whether a resource is realized on the backend
pub const CONDITION_READY: &str = "Ready";

/// Tri-state condition status, serialized as the Kubernetes strings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Not evaluated yet
    #[default]
    Unknown,
}

/// One entry of `status.conditions`
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. [`CONDITION_READY`]
    #[serde(rename = "type")]
    pub type_: String,

    /// Whether the condition holds
    pub status: ConditionStatus,

    /// CamelCase reason for the last transition
    pub reason: String,

    /// Human-readable detail
    pub message: String,

    /// Resource generation the condition was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// When the condition was last written
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// `Ready` condition computed from `generation`, stamped now
    pub fn ready(
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        generation: Option<i64>,
    ) -> Self {
        Self {
            type_: CONDITION_READY.to_string(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation: generation,
            last_transition_time: Utc::now(),
        }
    }
}
