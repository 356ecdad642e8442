//! Networking backend object model
//!
//! These types mirror the backend's policy API objects as they appear on the
//! wire (snake_case fields, `_revision`, `resource_type`). They are what the
//! local stores hold and what the hierarchical patch carries.
//!
//! Every kind implements [`BackendObject`], which gives the reconciliation
//! core a uniform view: identity, owner tag, deletion intent, and a content
//! fingerprint that ignores system-managed fields.

mod group;
mod infra;
mod policy;

pub use group::{Group, GroupExpression};
pub use infra::{ChildDomain, Domain, DomainChild, Infra};
pub use policy::{Policy, Rule, RuleAction, RuleDirection, ServiceEntry, ANY};

use serde::{Deserialize, Serialize};

use crate::TAG_SCOPE_SECURITY_POLICY_UID;

/// A scope/tag pair attached to a backend object
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    /// Tag scope (the key)
    #[serde(default)]
    pub scope: String,
    /// Tag value
    #[serde(default)]
    pub tag: String,
}

impl Tag {
    /// Create a tag
    pub fn new(scope: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            tag: tag.into(),
        }
    }
}

/// Uniform view of a backend object used by the stores and the diff engine
pub trait BackendObject: Clone + Send + Sync + 'static {
    /// Kind name used in logs and errors ("policy", "rule", "group")
    const KIND: &'static str;

    /// Backend identity, unique per kind
    fn id(&self) -> &str;

    /// Tags attached to the object
    fn tags(&self) -> &[Tag];

    /// Whether the object carries deletion intent
    fn marked_for_delete(&self) -> bool;

    /// Set or clear deletion intent
    fn set_marked_for_delete(&mut self, marked: bool);

    /// Digest of the functional fields.
    ///
    /// Excludes `_revision` and `marked_for_delete` so an object listed from
    /// the backend compares equal to the same object freshly built.
    fn fingerprint(&self) -> String;

    /// Value of the owner tag (UID of the owning SecurityPolicy)
    fn owner(&self) -> Option<&str> {
        self.tags()
            .iter()
            .find(|t| t.scope == TAG_SCOPE_SECURITY_POLICY_UID)
            .map(|t| t.tag.as_str())
    }
}
