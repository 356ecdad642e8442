//! Security policy and rule objects

use std::fmt::Write;

use serde::{Deserialize, Serialize};

use super::{BackendObject, Tag};
use crate::deterministic_hash;

/// Group path value matching any endpoint
pub const ANY: &str = "ANY";

fn security_policy_resource_type() -> String {
    "SecurityPolicy".to_string()
}

fn rule_resource_type() -> String {
    "Rule".to_string()
}

fn service_entry_resource_type() -> String {
    "L4PortSetServiceEntry".to_string()
}

/// Backend security policy
///
/// `rules` is embedded on the wire but mirrored in its own local store, so
/// the policy fingerprint deliberately leaves it out.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Policy {
    /// Identity (`sp_<uid>`)
    pub id: String,
    /// Display name
    #[serde(default)]
    pub display_name: String,
    /// Object type discriminator
    #[serde(default = "security_policy_resource_type")]
    pub resource_type: String,
    /// Group paths the policy is enforced on; empty means no policy-level scope
    #[serde(default)]
    pub scope: Vec<String>,
    /// Ordering relative to other policies
    #[serde(default)]
    pub sequence_number: i64,
    /// Ordered rules
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Tags, including the owner tag
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Deletion intent
    #[serde(default)]
    pub marked_for_delete: bool,
    /// System-managed revision counter
    #[serde(rename = "_revision", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            id: String::new(),
            display_name: String::new(),
            resource_type: security_policy_resource_type(),
            scope: Vec::new(),
            sequence_number: 0,
            rules: Vec::new(),
            tags: Vec::new(),
            marked_for_delete: false,
            revision: None,
        }
    }
}

impl BackendObject for Policy {
    const KIND: &'static str = "policy";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> &[Tag] {
        &self.tags
    }

    fn marked_for_delete(&self) -> bool {
        self.marked_for_delete
    }

    fn set_marked_for_delete(&mut self, marked: bool) {
        self.marked_for_delete = marked;
    }

    fn fingerprint(&self) -> String {
        let mut input = String::new();
        let _ = write!(
            input,
            "id={};name={};scope={:?};seq={};tags={:?}",
            self.id,
            self.display_name,
            self.scope,
            self.sequence_number,
            sorted_tags(&self.tags),
        );
        deterministic_hash(&input)
    }
}

/// Rule direction as the backend spells it
#[allow(clippy::upper_case_acronyms, non_camel_case_types)]
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum RuleDirection {
    /// Ingress
    #[default]
    IN,
    /// Egress
    OUT,
    /// Both directions
    IN_OUT,
}

/// Rule action as the backend spells it
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum RuleAction {
    /// Permit
    #[default]
    ALLOW,
    /// Silently drop
    DROP,
    /// Drop and notify
    REJECT,
}

/// L4 port-set service entry embedded in a rule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceEntry {
    /// Entry identity, unique within the rule
    pub id: String,
    /// Object type discriminator
    #[serde(default = "service_entry_resource_type")]
    pub resource_type: String,
    /// "TCP" or "UDP"
    pub l4_protocol: String,
    /// Ports or ranges ("80", "8000-8080")
    #[serde(default)]
    pub destination_ports: Vec<String>,
}

impl ServiceEntry {
    /// Create an L4 port-set entry
    pub fn l4(id: impl Into<String>, protocol: impl Into<String>, ports: Vec<String>) -> Self {
        Self {
            id: id.into(),
            resource_type: service_entry_resource_type(),
            l4_protocol: protocol.into(),
            destination_ports: ports,
        }
    }
}

/// Backend firewall rule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    /// Identity (`sp_<uid>_<index>`)
    pub id: String,
    /// Display name
    #[serde(default)]
    pub display_name: String,
    /// Object type discriminator
    #[serde(default = "rule_resource_type")]
    pub resource_type: String,
    /// Traffic direction
    #[serde(default)]
    pub direction: RuleDirection,
    /// Action on match
    #[serde(default)]
    pub action: RuleAction,
    /// Source group paths, or [`ANY`]
    #[serde(default)]
    pub source_groups: Vec<String>,
    /// Destination group paths, or [`ANY`]
    #[serde(default)]
    pub destination_groups: Vec<String>,
    /// Port sets matched by this rule; empty matches any
    #[serde(default)]
    pub service_entries: Vec<ServiceEntry>,
    /// Group paths the rule is enforced on, or [`ANY`] to inherit the policy scope
    #[serde(default)]
    pub scope: Vec<String>,
    /// Ordering within the policy
    #[serde(default)]
    pub sequence_number: i64,
    /// Tags, including the owner tag
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Deletion intent
    #[serde(default)]
    pub marked_for_delete: bool,
    /// System-managed revision counter
    #[serde(rename = "_revision", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
}

impl Default for Rule {
    fn default() -> Self {
        Self {
            id: String::new(),
            display_name: String::new(),
            resource_type: rule_resource_type(),
            direction: RuleDirection::default(),
            action: RuleAction::default(),
            source_groups: Vec::new(),
            destination_groups: Vec::new(),
            service_entries: Vec::new(),
            scope: Vec::new(),
            sequence_number: 0,
            tags: Vec::new(),
            marked_for_delete: false,
            revision: None,
        }
    }
}

impl BackendObject for Rule {
    const KIND: &'static str = "rule";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> &[Tag] {
        &self.tags
    }

    fn marked_for_delete(&self) -> bool {
        self.marked_for_delete
    }

    fn set_marked_for_delete(&mut self, marked: bool) {
        self.marked_for_delete = marked;
    }

    fn fingerprint(&self) -> String {
        let mut input = String::new();
        let _ = write!(
            input,
            "id={};name={};dir={:?};action={:?};src={:?};dst={:?};svc={:?};scope={:?};seq={};tags={:?}",
            self.id,
            self.display_name,
            self.direction,
            self.action,
            self.source_groups,
            self.destination_groups,
            self.service_entries
                .iter()
                .map(|s| (&s.id, &s.l4_protocol, &s.destination_ports))
                .collect::<Vec<_>>(),
            self.scope,
            self.sequence_number,
            sorted_tags(&self.tags),
        );
        deterministic_hash(&input)
    }
}

/// Tags are a set on the backend; listing order is not guaranteed
pub(super) fn sorted_tags(tags: &[Tag]) -> Vec<&Tag> {
    let mut sorted: Vec<&Tag> = tags.iter().collect();
    sorted.sort();
    sorted
}
