//! Group objects (membership expressions referenced by policies and rules)

use std::fmt::Write;

use serde::{Deserialize, Serialize};

use super::policy::sorted_tags;
use super::{BackendObject, Tag};
use crate::deterministic_hash;

fn group_resource_type() -> String {
    "Group".to_string()
}

/// One term of a group membership expression
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "resource_type")]
pub enum GroupExpression {
    /// Match members whose `key` satisfies `operator value`
    Condition {
        /// Member type ("SegmentPort", "VirtualMachine")
        member_type: String,
        /// Attribute matched ("Tag")
        key: String,
        /// Comparison ("EQUALS")
        operator: String,
        /// Expected value; tags are encoded as `scope|tag`
        value: String,
    },
    /// Joins the surrounding conditions
    ConjunctionOperator {
        /// "AND" or "OR"
        conjunction_operator: String,
    },
}

impl GroupExpression {
    /// Tag-equality condition on members of `member_type`
    pub fn tag_equals(member_type: &str, scope: &str, tag: &str) -> Self {
        Self::Condition {
            member_type: member_type.to_string(),
            key: "Tag".to_string(),
            operator: "EQUALS".to_string(),
            value: format!("{}|{}", scope, tag),
        }
    }

    /// AND conjunction
    pub fn and() -> Self {
        Self::ConjunctionOperator {
            conjunction_operator: "AND".to_string(),
        }
    }

    /// OR conjunction
    pub fn or() -> Self {
        Self::ConjunctionOperator {
            conjunction_operator: "OR".to_string(),
        }
    }
}

/// Backend group
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Group {
    /// Identity (`sp_<uid>_scope`, `sp_<uid>_<index>_src`, ...)
    pub id: String,
    /// Display name
    #[serde(default)]
    pub display_name: String,
    /// Object type discriminator
    #[serde(default = "group_resource_type")]
    pub resource_type: String,
    /// Membership expression
    #[serde(default)]
    pub expression: Vec<GroupExpression>,
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

impl Default for Group {
    fn default() -> Self {
        Self {
            id: String::new(),
            display_name: String::new(),
            resource_type: group_resource_type(),
            expression: Vec::new(),
            tags: Vec::new(),
            marked_for_delete: false,
            revision: None,
        }
    }
}

impl Group {
    /// Policy path of this group within `domain`
    pub fn path(&self, domain: &str) -> String {
        format!("/infra/domains/{}/groups/{}", domain, self.id)
    }
}

impl BackendObject for Group {
    const KIND: &'static str = "group";

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
            "id={};name={};expr={:?};tags={:?}",
            self.id,
            self.display_name,
            self.expression,
            sorted_tags(&self.tags),
        );
        deterministic_hash(&input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expression_wire_format_is_tagged() {
        let group = Group {
            id: "sp_u_scope".to_string(),
            expression: vec![
                GroupExpression::tag_equals("SegmentPort", "app", "web"),
                GroupExpression::and(),
                GroupExpression::tag_equals("SegmentPort", "netfence/namespace", "shop"),
            ],
            ..Default::default()
        };

        let json = serde_json::to_value(&group).unwrap();
        assert_eq!(json["resource_type"], "Group");
        assert_eq!(json["expression"][0]["resource_type"], "Condition");
        assert_eq!(json["expression"][0]["value"], "app|web");
        assert_eq!(json["expression"][1]["resource_type"], "ConjunctionOperator");
        assert_eq!(json["expression"][1]["conjunction_operator"], "AND");

        let back: Group = serde_json::from_value(json).unwrap();
        assert_eq!(back, group);
    }

    #[test]
    fn fingerprint_changes_with_membership() {
        let a = Group {
            id: "g".to_string(),
            expression: vec![GroupExpression::tag_equals("SegmentPort", "app", "web")],
            ..Default::default()
        };
        let mut b = a.clone();
        b.expression = vec![GroupExpression::tag_equals("SegmentPort", "app", "db")];
        assert_ne!(a.fingerprint(), b.fingerprint());

        let mut c = a.clone();
        c.revision = Some(2);
        assert_eq!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn path_is_domain_scoped() {
        let g = Group {
            id: "sp_u_scope".to_string(),
            ..Default::default()
        };
        assert_eq!(g.path("default"), "/infra/domains/default/groups/sp_u_scope");
    }
}
