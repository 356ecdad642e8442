//! SecurityPolicy Custom Resource Definition
//!
//! A SecurityPolicy declares distributed-firewall intent for pods and VMs in
//! one namespace. The operator translates it into a backend security policy,
//! its ordered rules, and the groups those rules reference.
//!
//! ## Scope
//!
//! `appliedTo` can be set on the policy, on individual rules, or both. A rule
//! without its own `appliedTo` inherits the policy scope; when neither level
//! sets one the policy is rejected.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// SecurityPolicy declares firewall rules enforced by the networking backend.
///
/// Example:
/// ```yaml
/// apiVersion: netfence.dev/v1alpha1
/// kind: SecurityPolicy
/// metadata:
///   name: web-allow
///   namespace: shop
/// spec:
///   priority: 10
///   appliedTo:
///     - podSelector:
///         app: web
///   rules:
///     - name: allow-http
///       action: Allow
///       direction: In
///       sources:
///         - podSelector:
///             app: frontend
///       ports:
///         - protocol: TCP
///           port: 80
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "netfence.dev",
    version = "v1alpha1",
    kind = "SecurityPolicy",
    namespaced,
    status = "SecurityPolicyStatus",
    shortname = "sp",
    printcolumn = r#"{"name":"Priority","type":"integer","jsonPath":".spec.priority"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicySpec {
    /// Evaluation priority relative to other policies (lower = earlier)
    #[serde(default)]
    pub priority: i32,

    /// Workloads the whole policy applies to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_to: Vec<PolicyTarget>,

    /// Ordered firewall rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<SecurityPolicyRule>,
}

/// Workloads selected by label
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTarget {
    /// Pods in the policy namespace whose labels match all entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<BTreeMap<String, String>>,

    /// Virtual machines in the policy namespace whose labels match all entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_selector: Option<BTreeMap<String, String>>,
}

impl PolicyTarget {
    /// A target selecting nothing is meaningless and rejected at build time
    pub fn is_empty(&self) -> bool {
        self.pod_selector.is_none() && self.vm_selector.is_none()
    }
}

/// Traffic peer for rule sources and destinations
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyPeer {
    /// Pods whose labels match all entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<BTreeMap<String, String>>,

    /// Virtual machines whose labels match all entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_selector: Option<BTreeMap<String, String>>,

    /// Restrict pod/VM selection to namespaces with these labels.
    ///
    /// Without it, selection is limited to the policy namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<BTreeMap<String, String>>,
}

/// Action taken when a rule matches
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RuleAction {
    /// Permit the traffic
    #[default]
    Allow,
    /// Silently drop the traffic
    Drop,
    /// Drop the traffic and notify the sender
    Reject,
}

/// Traffic direction relative to the applied-to workloads
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RuleDirection {
    /// Ingress traffic
    #[default]
    In,
    /// Egress traffic
    Out,
}

/// L4 protocol of a rule port
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PortProtocol {
    /// TCP
    #[default]
    TCP,
    /// UDP
    UDP,
}

/// A destination port or port range
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicyPort {
    /// L4 protocol
    #[serde(default)]
    pub protocol: PortProtocol,

    /// Destination port (start of the range when `endPort` is set)
    pub port: u16,

    /// Inclusive end of the port range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_port: Option<u16>,
}

/// One firewall rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicyRule {
    /// Optional display name; defaults to `<policy>-<index>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// What to do with matching traffic
    #[serde(default)]
    pub action: RuleAction,

    /// Which direction the rule matches
    #[serde(default)]
    pub direction: RuleDirection,

    /// Workloads this rule applies to (overrides the policy-level scope)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_to: Vec<PolicyTarget>,

    /// Allowed sources; empty matches any source
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<PolicyPeer>,

    /// Allowed destinations; empty matches any destination
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destinations: Vec<PolicyPeer>,

    /// Destination ports; empty matches any port
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<SecurityPolicyPort>,
}

/// SecurityPolicy status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicyStatus {
    /// Current phase
    #[serde(default)]
    pub phase: SecurityPolicyPhase,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Generation last realized on the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// SecurityPolicy phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SecurityPolicyPhase {
    /// Not yet realized on the backend
    #[default]
    Pending,
    /// Policy, rules and groups realized on the backend
    Ready,
    /// Translation or realization failed
    Failed,
}

impl std::fmt::Display for SecurityPolicyPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}
