//! SecurityPolicy reconciliation
//!
//! [`SecurityPolicyService`] projects a SecurityPolicy onto the backend with
//! one hierarchical patch per reconciliation. It reads existing state from
//! the local stores rather than the backend, diffs it against the freshly
//! built graph, writes only what changed or went stale, and updates the
//! stores after the backend accepted the patch.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, error, info, instrument};

use netfence_common::crd::SecurityPolicy;
use netfence_common::model::{BackendObject, Group, Infra, Policy, Rule};
use netfence_common::{Error, Result, ENFORCE_REVISION_CHECK, MARKED_FOR_DELETE};

use crate::assemble::{assemble, mark_for_delete};
use crate::builder::PolicyBuilder;
use crate::client::PolicyBackend;
use crate::compare::{compare_resource, compare_resources};
use crate::sync::{sync_stores, PolicyStores};

/// What to remove from the backend
#[derive(Clone, Debug)]
pub enum DeleteTarget {
    /// A resource being deleted; its graph is rebuilt and removed
    Resource(Arc<SecurityPolicy>),
    /// Everything owned by this SecurityPolicy UID, as found in the stores
    Owner(String),
}

/// Reconciles SecurityPolicy resources against the networking backend
pub struct SecurityPolicyService {
    backend: Arc<dyn PolicyBackend>,
    builder: PolicyBuilder,
    stores: PolicyStores,
}

impl SecurityPolicyService {
    /// Create a service with empty stores
    pub fn new(backend: Arc<dyn PolicyBackend>, builder: PolicyBuilder) -> Self {
        Self {
            backend,
            builder,
            stores: PolicyStores::new(),
        }
    }

    /// Create a service and warm its stores from the backend
    ///
    /// Must complete before any reconciliation is serviced.
    pub async fn initialize(backend: Arc<dyn PolicyBackend>, builder: PolicyBuilder) -> Result<Self> {
        let service = Self::new(backend, builder);
        sync_stores(Arc::clone(&service.backend), &service.stores).await?;
        info!(
            policies = service.stores.policies.len(),
            rules = service.stores.rules.len(),
            groups = service.stores.groups.len(),
            "security policy stores initialized"
        );
        Ok(service)
    }

    /// Local mirrors of backend state
    pub fn stores(&self) -> &PolicyStores {
        &self.stores
    }

    /// Bring the backend in line with `cr`
    ///
    /// No backend call is made when policy, rules and groups are unchanged.
    #[instrument(skip(self, cr), fields(policy = %cr.name_any(), namespace = %cr.namespace().unwrap_or_default()))]
    pub async fn create_or_update(&self, cr: &SecurityPolicy) -> Result<()> {
        let (mut desired_policy, desired_groups) = self.builder.build(cr).inspect_err(|e| {
            error!(error = %e, "failed to build security policy");
        })?;

        if desired_policy.scope.is_empty() {
            info!("security policy has no policy-level appliedTo");
        }

        let uid = owner_of(&desired_policy)?;
        let existing_policy = self.stores.policies.get(&desired_policy.id);
        let existing_rules = self.stores.rules.list_by_index(&uid);
        let existing_groups = self.stores.groups.list_by_index(&uid);

        let desired_rules = std::mem::take(&mut desired_policy.rules);
        let policy_changed = compare_resource(existing_policy.as_ref(), &desired_policy);
        let rule_diff = compare_resources(existing_rules, desired_rules);
        let group_diff = compare_resources(existing_groups, desired_groups);

        if !policy_changed && rule_diff.is_empty() && group_diff.is_empty() {
            info!(id = %desired_policy.id, "security policy, rules and groups unchanged, skipping");
            return Ok(());
        }

        let rules_touched = !rule_diff.is_empty();
        let groups_touched = !group_diff.is_empty();
        debug!(
            policy_changed,
            changed_rules = rule_diff.changed.len(),
            stale_rules = rule_diff.stale.len(),
            changed_groups = group_diff.changed.len(),
            stale_groups = group_diff.stale.len(),
            "computed security policy diff"
        );

        let final_policy = match existing_policy {
            Some(existing) if !policy_changed => existing,
            _ => desired_policy,
        };
        let final_rules = assemble(rule_diff);
        let final_groups = assemble(group_diff);

        self.patch(&final_policy, &final_rules, &final_groups).await?;

        if policy_changed {
            self.stores.policies.apply(final_policy.clone());
        }
        if rules_touched {
            for rule in final_rules {
                self.stores.rules.apply(rule);
            }
        }
        if groups_touched {
            for group in final_groups {
                self.stores.groups.apply(group);
            }
        }

        info!(id = %final_policy.id, "security policy created or updated");
        Ok(())
    }

    /// Remove a policy with its rules and groups from the backend
    #[instrument(skip(self, target))]
    pub async fn delete(&self, target: DeleteTarget) -> Result<()> {
        let (mut policy, rules, groups) = match target {
            DeleteTarget::Resource(cr) => {
                let (mut policy, groups) = self.builder.build(&cr).inspect_err(|e| {
                    error!(error = %e, "failed to build security policy");
                })?;
                let rules = std::mem::take(&mut policy.rules);
                let uid = owner_of(&policy)?;

                // Objects left over from an earlier spec go too
                let rules = with_stored(rules, self.stores.rules.list_by_index(&uid));
                let groups = with_stored(groups, self.stores.groups.list_by_index(&uid));
                (policy, rules, groups)
            }
            DeleteTarget::Owner(uid) => {
                let Some(policy) = self.stores.policies.list_by_index(&uid).into_iter().next()
                else {
                    info!(uid = %uid, "security policy already gone");
                    return Ok(());
                };
                let groups = self.stores.groups.list_by_index(&uid);
                if groups.is_empty() {
                    debug!(uid = %uid, "no groups indexed for security policy");
                }
                (policy, self.stores.rules.list_by_index(&uid), groups)
            }
        };

        policy.set_marked_for_delete(MARKED_FOR_DELETE);
        let rules = mark_for_delete(rules);
        let groups = mark_for_delete(groups);

        self.patch(&policy, &rules, &groups).await?;

        self.stores.policies.apply(policy.clone());
        for group in groups {
            self.stores.groups.apply(group);
        }
        for rule in rules {
            self.stores.rules.apply(rule);
        }

        info!(id = %policy.id, "security policy deleted");
        Ok(())
    }

    /// Create or replace standalone groups one at a time
    ///
    /// Stops at the first backend failure; groups written before it stay
    /// stored.
    #[instrument(skip(self, groups), fields(count = groups.len()))]
    pub async fn create_or_update_groups(&self, groups: Vec<Group>) -> Result<()> {
        for group in groups {
            self.backend
                .patch_group(self.builder.domain(), &group)
                .await?;
            debug!(group = %group.id, "added group to store");
            self.stores.groups.put(group);
        }
        info!("groups created or updated");
        Ok(())
    }

    /// Owner UIDs with at least one policy or group in the stores
    pub fn list_owned_identities(&self) -> BTreeSet<String> {
        let mut owners = self.stores.groups.list_index_values();
        owners.extend(self.stores.policies.list_index_values());
        owners
    }

    /// One hierarchical patch carrying the policy, its rules and the groups
    async fn patch(&self, policy: &Policy, rules: &[Rule], groups: &[Group]) -> Result<()> {
        let mut wire_policy = policy.clone();
        wire_policy.rules = rules.to_vec();
        let infra = Infra::wrap_security_policy(self.builder.domain(), wire_policy, groups.to_vec());

        self.backend
            .patch_infra(&infra, ENFORCE_REVISION_CHECK)
            .await
            .inspect_err(|e| error!(error = %e, id = %policy.id, "hierarchical patch failed"))
    }
}

fn owner_of(policy: &Policy) -> Result<String> {
    policy
        .owner()
        .map(str::to_string)
        .ok_or_else(|| Error::internal_with_context("security policy", format!("{} has no owner tag", policy.id)))
}

/// Built objects followed by stored ones the build no longer produces
fn with_stored<T: BackendObject>(mut built: Vec<T>, stored: Vec<T>) -> Vec<T> {
    let ids: HashSet<String> = built.iter().map(|o| o.id().to_string()).collect();
    built.extend(stored.into_iter().filter(|o| !ids.contains(o.id())));
    built
}
