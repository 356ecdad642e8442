//! SecurityPolicy to backend object graph
//!
//! A pure translation of one custom resource into the policy (with its rules
//! embedded) and the groups the policy and rules reference. Identities derive
//! from the resource UID only, so rebuilding an unchanged resource produces
//! objects that diff as equal to what the backend already holds.

use std::collections::BTreeMap;

use kube::ResourceExt;

use netfence_common::crd::{
    PolicyPeer, PolicyTarget, PortProtocol, RuleAction as CrdAction,
    RuleDirection as CrdDirection, SecurityPolicy, SecurityPolicyPort, SecurityPolicyRule,
};
use netfence_common::model::{
    Group, GroupExpression, Policy, Rule, RuleAction, RuleDirection, ServiceEntry, Tag, ANY,
};
use netfence_common::{
    Error, Result, TAG_SCOPE_CLUSTER, TAG_SCOPE_NAMESPACE, TAG_SCOPE_SECURITY_POLICY_NAME,
    TAG_SCOPE_SECURITY_POLICY_UID,
};

/// Member type for pod endpoints (logical segment ports)
const MEMBER_POD: &str = "SegmentPort";

/// Member type for virtual machines
const MEMBER_VM: &str = "VirtualMachine";

/// Tag scope prefix under which namespace labels are mirrored onto ports
pub const TAG_SCOPE_NAMESPACE_LABEL_PREFIX: &str = "netfence/ns-label/";

/// Translates SecurityPolicy resources into backend objects for one cluster
#[derive(Clone, Debug)]
pub struct PolicyBuilder {
    cluster: String,
    domain: String,
}

/// Identity and metadata shared by every object built from one resource
struct Owner<'a> {
    name: &'a str,
    namespace: &'a str,
    tags: Vec<Tag>,
}

impl PolicyBuilder {
    /// Create a builder tagging objects with `cluster` and placing groups in `domain`
    pub fn new(cluster: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            domain: domain.into(),
        }
    }

    /// Backend domain groups are created in
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Build the policy (rules embedded) and its groups
    pub fn build(&self, cr: &SecurityPolicy) -> Result<(Policy, Vec<Group>)> {
        let name = cr.metadata.name.as_deref().unwrap_or_default();
        let uid = cr
            .uid()
            .ok_or_else(|| Error::build_for_field(name, "metadata.uid", "uid is required"))?;
        if name.is_empty() {
            return Err(Error::build_for_field(name, "metadata.name", "name is required"));
        }
        let namespace = cr
            .namespace()
            .ok_or_else(|| Error::build_for_field(name, "metadata.namespace", "namespace is required"))?;

        let owner = Owner {
            name,
            namespace: &namespace,
            tags: vec![
                Tag::new(TAG_SCOPE_CLUSTER, self.cluster.as_str()),
                Tag::new(TAG_SCOPE_NAMESPACE, namespace.as_str()),
                Tag::new(TAG_SCOPE_SECURITY_POLICY_NAME, name),
                Tag::new(TAG_SCOPE_SECURITY_POLICY_UID, uid.as_str()),
            ],
        };

        let mut groups = Vec::new();
        let policy_id = format!("sp_{}", uid);

        let mut scope = Vec::new();
        if !cr.spec.applied_to.is_empty() {
            let group = self.target_group(
                &owner,
                format!("{}_scope", policy_id),
                &cr.spec.applied_to,
                "spec.appliedTo",
            )?;
            scope.push(group.path(&self.domain));
            groups.push(group);
        }
        let has_policy_scope = !scope.is_empty();

        let mut rules = Vec::with_capacity(cr.spec.rules.len());
        for (index, rule) in cr.spec.rules.iter().enumerate() {
            rules.push(self.build_rule(
                &owner,
                &policy_id,
                index,
                rule,
                has_policy_scope,
                &mut groups,
            )?);
        }

        let policy = Policy {
            id: policy_id,
            display_name: format!("{}-{}", namespace, name),
            scope,
            sequence_number: i64::from(cr.spec.priority),
            rules,
            tags: owner.tags.clone(),
            ..Default::default()
        };

        Ok((policy, groups))
    }

    fn build_rule(
        &self,
        owner: &Owner<'_>,
        policy_id: &str,
        index: usize,
        rule: &SecurityPolicyRule,
        has_policy_scope: bool,
        groups: &mut Vec<Group>,
    ) -> Result<Rule> {
        let rule_id = format!("{}_{}", policy_id, index);
        let field = format!("spec.rules[{}]", index);

        let scope = if !rule.applied_to.is_empty() {
            let group = self.target_group(
                owner,
                format!("{}_scope", rule_id),
                &rule.applied_to,
                &format!("{}.appliedTo", field),
            )?;
            let path = group.path(&self.domain);
            groups.push(group);
            vec![path]
        } else if has_policy_scope {
            vec![ANY.to_string()]
        } else {
            return Err(Error::build_for_field(
                owner.name,
                format!("{}.appliedTo", field),
                "appliedTo must be set on the rule when the policy has none",
            ));
        };

        let source_groups = self.peer_refs(
            owner,
            format!("{}_src", rule_id),
            &rule.sources,
            &format!("{}.sources", field),
            groups,
        )?;
        let destination_groups = self.peer_refs(
            owner,
            format!("{}_dst", rule_id),
            &rule.destinations,
            &format!("{}.destinations", field),
            groups,
        )?;

        let service_entries = rule
            .ports
            .iter()
            .enumerate()
            .map(|(i, port)| service_entry(owner.name, &field, i, port))
            .collect::<Result<Vec<_>>>()?;

        Ok(Rule {
            display_name: rule
                .name
                .clone()
                .unwrap_or_else(|| format!("{}-{}", owner.name, index)),
            id: rule_id,
            direction: match rule.direction {
                CrdDirection::In => RuleDirection::IN,
                CrdDirection::Out => RuleDirection::OUT,
            },
            action: match rule.action {
                CrdAction::Allow => RuleAction::ALLOW,
                CrdAction::Drop => RuleAction::DROP,
                CrdAction::Reject => RuleAction::REJECT,
            },
            source_groups,
            destination_groups,
            service_entries,
            scope,
            sequence_number: index as i64,
            tags: owner.tags.clone(),
            ..Default::default()
        })
    }

    /// Group for an `appliedTo` list
    fn target_group(
        &self,
        owner: &Owner<'_>,
        id: String,
        targets: &[PolicyTarget],
        field: &str,
    ) -> Result<Group> {
        let mut criteria = Vec::new();
        for (i, target) in targets.iter().enumerate() {
            if target.is_empty() {
                return Err(Error::build_for_field(
                    owner.name,
                    format!("{}[{}]", field, i),
                    "target must set podSelector or vmSelector",
                ));
            }
            if let Some(labels) = &target.pod_selector {
                criteria.push(pod_criterion(&self.cluster, owner.namespace, labels, None));
            }
            if let Some(labels) = &target.vm_selector {
                criteria.push(vm_criterion(owner.name, labels, &format!("{}[{}]", field, i))?);
            }
        }
        Ok(self.group(owner, id, criteria))
    }

    /// Group paths for rule peers, or `ANY` when there are none
    fn peer_refs(
        &self,
        owner: &Owner<'_>,
        id: String,
        peers: &[PolicyPeer],
        field: &str,
        groups: &mut Vec<Group>,
    ) -> Result<Vec<String>> {
        if peers.is_empty() {
            return Ok(vec![ANY.to_string()]);
        }

        let mut criteria = Vec::new();
        for (i, peer) in peers.iter().enumerate() {
            let peer_field = format!("{}[{}]", field, i);
            match (&peer.pod_selector, &peer.vm_selector, &peer.namespace_selector) {
                (None, None, None) => {
                    return Err(Error::build_for_field(
                        owner.name,
                        peer_field,
                        "peer must set podSelector, vmSelector or namespaceSelector",
                    ));
                }
                (pods, vms, namespaces) => {
                    if pods.is_some() || namespaces.is_some() {
                        let empty = BTreeMap::new();
                        let labels = pods.as_ref().unwrap_or(&empty);
                        criteria.push(pod_criterion(
                            &self.cluster,
                            owner.namespace,
                            labels,
                            namespaces.as_ref(),
                        ));
                    }
                    if let Some(labels) = vms {
                        criteria.push(vm_criterion(owner.name, labels, &peer_field)?);
                    }
                }
            }
        }

        let group = self.group(owner, id, criteria);
        let path = group.path(&self.domain);
        groups.push(group);
        Ok(vec![path])
    }

    fn group(&self, owner: &Owner<'_>, id: String, criteria: Vec<Vec<GroupExpression>>) -> Group {
        let mut expression = Vec::new();
        for criterion in criteria.into_iter().filter(|c| !c.is_empty()) {
            if !expression.is_empty() {
                expression.push(GroupExpression::or());
            }
            expression.extend(criterion);
        }
        Group {
            display_name: id.clone(),
            id,
            expression,
            tags: owner.tags.clone(),
            ..Default::default()
        }
    }
}

/// Join conditions with AND
fn conjoin(conditions: Vec<GroupExpression>) -> Vec<GroupExpression> {
    let mut out = Vec::with_capacity(conditions.len() * 2);
    for (i, condition) in conditions.into_iter().enumerate() {
        if i > 0 {
            out.push(GroupExpression::and());
        }
        out.push(condition);
    }
    out
}

/// Pods matching `labels`, restricted to the resource's namespace unless a
/// namespace selector widens the match
///
/// With no pod labels and an empty namespace selector every pod of the
/// cluster matches.
fn pod_criterion(
    cluster: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    namespace_selector: Option<&BTreeMap<String, String>>,
) -> Vec<GroupExpression> {
    let mut conditions: Vec<GroupExpression> = labels
        .iter()
        .map(|(k, v)| GroupExpression::tag_equals(MEMBER_POD, k, v))
        .collect();

    match namespace_selector {
        None => conditions.push(GroupExpression::tag_equals(
            MEMBER_POD,
            TAG_SCOPE_NAMESPACE,
            namespace,
        )),
        Some(ns_labels) => conditions.extend(ns_labels.iter().map(|(k, v)| {
            GroupExpression::tag_equals(
                MEMBER_POD,
                &format!("{}{}", TAG_SCOPE_NAMESPACE_LABEL_PREFIX, k),
                v,
            )
        })),
    }
    if conditions.is_empty() {
        conditions.push(GroupExpression::tag_equals(MEMBER_POD, TAG_SCOPE_CLUSTER, cluster));
    }

    conjoin(conditions)
}

fn vm_criterion(
    policy: &str,
    labels: &BTreeMap<String, String>,
    field: &str,
) -> Result<Vec<GroupExpression>> {
    if labels.is_empty() {
        return Err(Error::build_for_field(
            policy,
            format!("{}.vmSelector", field),
            "vmSelector must match at least one label",
        ));
    }
    Ok(conjoin(
        labels
            .iter()
            .map(|(k, v)| GroupExpression::tag_equals(MEMBER_VM, k, v))
            .collect(),
    ))
}

fn service_entry(
    policy: &str,
    rule_field: &str,
    index: usize,
    port: &SecurityPolicyPort,
) -> Result<ServiceEntry> {
    let field = format!("{}.ports[{}]", rule_field, index);
    if port.port == 0 {
        return Err(Error::build_for_field(policy, field, "port must be non-zero"));
    }

    let range = match port.end_port {
        Some(end) if end < port.port => {
            return Err(Error::build_for_field(
                policy,
                field,
                format!("endPort {} is below port {}", end, port.port),
            ));
        }
        Some(end) if end > port.port => format!("{}-{}", port.port, end),
        _ => port.port.to_string(),
    };

    let protocol = match port.protocol {
        PortProtocol::TCP => "TCP",
        PortProtocol::UDP => "UDP",
    };

    Ok(ServiceEntry::l4(
        format!("port_{}", index),
        protocol,
        vec![range],
    ))
}
