//! Hierarchical patch envelope
//!
//! The backend realizes a whole subtree from a single `PATCH /infra` call:
//! `Infra → ChildDomain → Domain → [ChildGroup…, ChildSecurityPolicy]`.
//! Groups are listed before the policy so the backend resolves group paths
//! referenced by rules within the same request.

use serde::{Deserialize, Serialize};

use super::{Group, Policy};

/// Root of a hierarchical patch
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Infra {
    /// Always "Infra"
    pub resource_type: String,
    /// Domain subtrees
    pub children: Vec<ChildDomain>,
}

/// Wrapper placing a domain under `Infra`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChildDomain {
    /// Always "ChildDomain"
    pub resource_type: String,
    /// The wrapped domain is never deleted through this path
    pub marked_for_delete: bool,
    /// The domain subtree
    #[serde(rename = "Domain")]
    pub domain: Domain,
}

/// Policy domain
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Domain {
    /// Domain identity
    pub id: String,
    /// Always "Domain"
    pub resource_type: String,
    /// Groups and policies in this domain
    pub children: Vec<DomainChild>,
}

/// Child objects of a domain
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "resource_type")]
pub enum DomainChild {
    /// A group
    ChildGroup {
        /// Mirrors the wrapped group's deletion intent
        marked_for_delete: bool,
        /// The group
        #[serde(rename = "Group")]
        group: Group,
    },
    /// A security policy with its embedded rules
    ChildSecurityPolicy {
        /// Mirrors the wrapped policy's deletion intent
        marked_for_delete: bool,
        /// The policy
        #[serde(rename = "SecurityPolicy")]
        security_policy: Policy,
    },
}

impl Infra {
    /// Wrap one policy and its groups into a hierarchical patch for `domain`
    pub fn wrap_security_policy(domain: &str, policy: Policy, groups: Vec<Group>) -> Self {
        let mut children: Vec<DomainChild> = groups
            .into_iter()
            .map(|group| DomainChild::ChildGroup {
                marked_for_delete: group.marked_for_delete,
                group,
            })
            .collect();
        children.push(DomainChild::ChildSecurityPolicy {
            marked_for_delete: policy.marked_for_delete,
            security_policy: policy,
        });

        Self {
            resource_type: "Infra".to_string(),
            children: vec![ChildDomain {
                resource_type: "ChildDomain".to_string(),
                marked_for_delete: false,
                domain: Domain {
                    id: domain.to_string(),
                    resource_type: "Domain".to_string(),
                    children,
                },
            }],
        }
    }

    /// The single policy carried by this patch, if any
    pub fn security_policy(&self) -> Option<&Policy> {
        self.children
            .iter()
            .flat_map(|d| d.domain.children.iter())
            .find_map(|c| match c {
                DomainChild::ChildSecurityPolicy {
                    security_policy, ..
                } => Some(security_policy),
                _ => None,
            })
    }

    /// Groups carried by this patch, in request order
    pub fn groups(&self) -> Vec<&Group> {
        self.children
            .iter()
            .flat_map(|d| d.domain.children.iter())
            .filter_map(|c| match c {
                DomainChild::ChildGroup { group, .. } => Some(group),
                _ => None,
            })
            .collect()
    }
}
