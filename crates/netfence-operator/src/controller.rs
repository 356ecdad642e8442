//! SecurityPolicy controller implementation
//!
//! Reconciles SecurityPolicy resources through [`SecurityPolicyService`]: a
//! finalizer holds each resource until its backend objects are removed, and
//! a periodic garbage collector removes backend objects whose owning
//! resource disappeared while the operator was not watching.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use netfence_common::crd::{
    Condition, ConditionStatus, SecurityPolicy, SecurityPolicyPhase, SecurityPolicyStatus,
};
use netfence_common::{Error, SECURITY_POLICY_FINALIZER};
use netfence_policy::{DeleteTarget, SecurityPolicyService};

/// Field manager used for patches issued by the controller
const FIELD_MANAGER: &str = "netfence-controller";

/// Requeue delay after a failed reconciliation
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

// =============================================================================
// Kubernetes client abstraction
// =============================================================================

/// Trait abstracting Kubernetes client operations for SecurityPolicy
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyKubeClient: Send + Sync {
    /// Add the controller finalizer to a SecurityPolicy
    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Remove the controller finalizer from a SecurityPolicy
    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Replace the status of a SecurityPolicy
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &SecurityPolicyStatus,
    ) -> Result<(), Error>;

    /// UIDs of every SecurityPolicy currently in the cluster
    async fn list_live_uids(&self) -> Result<BTreeSet<String>, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<SecurityPolicy> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patch_finalizers(
        &self,
        name: &str,
        namespace: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });

        self.api(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }
}

#[async_trait]
impl PolicyKubeClient for KubeClientImpl {
    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let policy = self.api(namespace).get(name).await?;
        let mut finalizers = policy.metadata.finalizers.unwrap_or_default();

        if finalizers.iter().any(|f| f == SECURITY_POLICY_FINALIZER) {
            return Ok(());
        }
        finalizers.push(SECURITY_POLICY_FINALIZER.to_string());

        self.patch_finalizers(name, namespace, finalizers).await
    }

    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let policy = match self.api(namespace).get(name).await {
            Ok(policy) => policy,
            // Already gone, nothing holds it
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let finalizers: Vec<String> = policy
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != SECURITY_POLICY_FINALIZER)
            .collect();

        self.patch_finalizers(name, namespace, finalizers).await
    }

    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &SecurityPolicyStatus,
    ) -> Result<(), Error> {
        let status_patch = serde_json::json!({
            "status": status
        });

        self.api(namespace)
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await?;

        Ok(())
    }

    async fn list_live_uids(&self) -> Result<BTreeSet<String>, Error> {
        let api: Api<SecurityPolicy> = Api::all(self.client.clone());
        let policies = api.list(&ListParams::default()).await?;
        Ok(policies.items.iter().filter_map(|p| p.uid()).collect())
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Shared state for the SecurityPolicy controller
pub struct PolicyContext {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn PolicyKubeClient>,
    /// Reconciliation core holding the backend stores
    pub service: Arc<SecurityPolicyService>,
}

impl PolicyContext {
    /// Create a controller context backed by a real Kubernetes client
    pub fn new(client: Client, service: Arc<SecurityPolicyService>) -> Self {
        Self {
            kube: Arc::new(KubeClientImpl::new(client)),
            service,
        }
    }

    /// Create a context for testing with a mock Kubernetes client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn PolicyKubeClient>, service: Arc<SecurityPolicyService>) -> Self {
        Self { kube, service }
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile a SecurityPolicy
///
/// Deleting resources have their backend objects removed before the
/// finalizer is released. Otherwise the backend is brought in line with the
/// spec and the status is set to Ready. A spec that cannot be translated is
/// marked Failed and waits for the next change rather than retrying.
#[instrument(skip(policy, ctx), fields(policy = %policy.name_any(), namespace = %policy.namespace().unwrap_or_default()))]
pub async fn reconcile(policy: Arc<SecurityPolicy>, ctx: Arc<PolicyContext>) -> Result<Action, Error> {
    let name = policy.name_any();
    let namespace = policy.namespace().unwrap_or_default();
    debug!("reconciling security policy");

    if policy.metadata.deletion_timestamp.is_some() {
        return handle_deletion(policy, &ctx).await;
    }

    if !has_finalizer(&policy) {
        info!("adding finalizer");
        ctx.kube.add_finalizer(&name, &namespace).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    match ctx.service.create_or_update(&policy).await {
        Ok(()) => {
            let status = ready_status(&policy);
            if needs_status_update(&policy, &status) {
                ctx.kube.patch_status(&name, &namespace, &status).await?;
            }
            Ok(Action::await_change())
        }
        Err(e @ Error::Build { .. }) => {
            warn!(error = %e, "security policy is invalid");
            let status = failed_status(&policy, &e.to_string());
            if needs_status_update(&policy, &status) {
                ctx.kube.patch_status(&name, &namespace, &status).await?;
            }
            Ok(Action::await_change())
        }
        Err(e) => Err(e),
    }
}

/// Error policy for the SecurityPolicy controller
pub fn error_policy(policy: Arc<SecurityPolicy>, error: &Error, _ctx: Arc<PolicyContext>) -> Action {
    error!(
        ?error,
        policy = %policy.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}

async fn handle_deletion(policy: Arc<SecurityPolicy>, ctx: &PolicyContext) -> Result<Action, Error> {
    if !has_finalizer(&policy) {
        return Ok(Action::await_change());
    }

    let name = policy.name_any();
    let namespace = policy.namespace().unwrap_or_default();
    let uid = policy.uid();

    match ctx
        .service
        .delete(DeleteTarget::Resource(Arc::clone(&policy)))
        .await
    {
        Ok(()) => {}
        // A spec that never built can still own objects from an earlier version
        Err(Error::Build { message, .. }) => {
            warn!(%message, "cannot rebuild deleted security policy, deleting by owner");
            if let Some(uid) = uid {
                ctx.service.delete(DeleteTarget::Owner(uid)).await?;
            }
        }
        Err(e) => return Err(e),
    }

    info!("backend objects removed, releasing finalizer");
    ctx.kube.remove_finalizer(&name, &namespace).await?;
    Ok(Action::await_change())
}

fn has_finalizer(policy: &SecurityPolicy) -> bool {
    policy
        .finalizers()
        .iter()
        .any(|f| f == SECURITY_POLICY_FINALIZER)
}

fn ready_status(policy: &SecurityPolicy) -> SecurityPolicyStatus {
    SecurityPolicyStatus {
        phase: SecurityPolicyPhase::Ready,
        message: None,
        observed_generation: policy.metadata.generation,
        conditions: vec![Condition::ready(
            ConditionStatus::True,
            "Realized",
            "security policy applied to the backend",
            policy.metadata.generation,
        )],
    }
}

fn failed_status(policy: &SecurityPolicy, message: &str) -> SecurityPolicyStatus {
    SecurityPolicyStatus {
        phase: SecurityPolicyPhase::Failed,
        message: Some(message.to_string()),
        observed_generation: policy.metadata.generation,
        conditions: vec![Condition::ready(
            ConditionStatus::False,
            "InvalidSpec",
            message,
            policy.metadata.generation,
        )],
    }
}

/// Skip no-op status writes; each one would trigger another reconcile
fn needs_status_update(policy: &SecurityPolicy, desired: &SecurityPolicyStatus) -> bool {
    match &policy.status {
        Some(current) => {
            current.phase != desired.phase
                || current.message != desired.message
                || current.observed_generation != desired.observed_generation
        }
        None => true,
    }
}

// =============================================================================
// Garbage collection
// =============================================================================

/// Delete backend objects whose owning SecurityPolicy no longer exists
///
/// Returns the number of owners removed. A failure for one owner is logged
/// and does not stop the pass.
///
/// Owned identities are read before live UIDs, so a resource realized after
/// the owned snapshot is never collected.
pub async fn collect_garbage(ctx: &PolicyContext) -> Result<usize, Error> {
    let owned = ctx.service.list_owned_identities();
    let live = ctx.kube.list_live_uids().await?;
    let mut removed = 0;

    for owner in owned.difference(&live) {
        if ctx.service.stores().policies.list_by_index(owner).is_empty() {
            // Delete by owner is a no-op without a policy to carry the patch
            debug!(uid = %owner, "orphaned groups have no security policy; skipping");
            continue;
        }
        match ctx.service.delete(DeleteTarget::Owner(owner.clone())).await {
            Ok(()) => {
                info!(uid = %owner, "removed orphaned security policy");
                removed += 1;
            }
            Err(e) => warn!(uid = %owner, error = %e, "failed to remove orphaned security policy"),
        }
    }

    Ok(removed)
}

/// Run [`collect_garbage`] every `interval` until the task is dropped
pub async fn run_garbage_collector(ctx: Arc<PolicyContext>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match collect_garbage(&ctx).await {
            Ok(0) => debug!("garbage collection found nothing to remove"),
            Ok(removed) => info!(removed, "garbage collection pass complete"),
            Err(e) => error!(error = %e, "garbage collection pass failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use netfence_common::crd::{
        PolicyTarget, SecurityPolicyPort, SecurityPolicyRule, SecurityPolicySpec,
    };
    use netfence_common::model::{Group, Infra, Policy, Rule, Tag};
    use netfence_common::TAG_SCOPE_SECURITY_POLICY_UID;
    use netfence_policy::{PolicyBackend, PolicyBuilder, PolicyStores};

    // =========================================================================
    // Test fixtures
    // =========================================================================

    /// Backend that records patches, optionally failing them with a status
    #[derive(Default)]
    struct FakeBackend {
        fail_status: Option<u16>,
        patches: Mutex<Vec<Infra>>,
    }

    impl FakeBackend {
        fn failing(status: u16) -> Self {
            Self {
                fail_status: Some(status),
                ..Default::default()
            }
        }

        fn patches(&self) -> Vec<Infra> {
            self.patches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PolicyBackend for FakeBackend {
        async fn list_security_policies(&self) -> Result<Vec<Policy>, Error> {
            Ok(Vec::new())
        }

        async fn list_rules(&self) -> Result<Vec<Rule>, Error> {
            Ok(Vec::new())
        }

        async fn list_groups(&self) -> Result<Vec<Group>, Error> {
            Ok(Vec::new())
        }

        async fn patch_infra(&self, infra: &Infra, _: bool) -> Result<(), Error> {
            if let Some(status) = self.fail_status {
                return Err(Error::backend_status("patch infra", status, "injected"));
            }
            self.patches.lock().unwrap().push(infra.clone());
            Ok(())
        }

        async fn patch_group(&self, _: &str, _: &Group) -> Result<(), Error> {
            Ok(())
        }
    }

    fn security_policy(finalized: bool) -> SecurityPolicy {
        SecurityPolicy {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("shop".to_string()),
                uid: Some("u1".to_string()),
                generation: Some(2),
                finalizers: finalized.then(|| vec![SECURITY_POLICY_FINALIZER.to_string()]),
                ..Default::default()
            },
            spec: SecurityPolicySpec {
                applied_to: vec![PolicyTarget {
                    pod_selector: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
                    vm_selector: None,
                }],
                ..Default::default()
            },
            status: None,
        }
    }

    fn deleting(mut policy: SecurityPolicy) -> SecurityPolicy {
        policy.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        policy
    }

    fn context(kube: MockPolicyKubeClient, backend: Arc<FakeBackend>) -> Arc<PolicyContext> {
        let service = SecurityPolicyService::new(backend, PolicyBuilder::new("c1", "default"));
        Arc::new(PolicyContext::for_testing(Arc::new(kube), Arc::new(service)))
    }

    fn own(ctx: &PolicyContext, uid: &str) {
        own_in(ctx.service.stores(), uid);
    }

    fn own_in(stores: &PolicyStores, uid: &str) {
        let tags = vec![Tag::new(TAG_SCOPE_SECURITY_POLICY_UID, uid)];
        stores.policies.put(Policy {
            id: format!("sp_{}", uid),
            tags: tags.clone(),
            ..Default::default()
        });
        stores.groups.put(Group {
            id: format!("sp_{}_scope", uid),
            tags,
            ..Default::default()
        });
    }

    // =========================================================================
    // Reconcile stories
    // =========================================================================

    #[tokio::test]
    async fn new_policy_gets_finalizer_before_backend_write() {
        let mut kube = MockPolicyKubeClient::new();
        kube.expect_add_finalizer()
            .withf(|name, ns| name == "web" && ns == "shop")
            .times(1)
            .returning(|_, _| Ok(()));
        let backend = Arc::new(FakeBackend::default());

        let action = reconcile(
            Arc::new(security_policy(false)),
            context(kube, Arc::clone(&backend)),
        )
        .await
        .unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
        assert!(backend.patches().is_empty());
    }

    #[tokio::test]
    async fn applied_policy_is_marked_ready() {
        let mut kube = MockPolicyKubeClient::new();
        kube.expect_patch_status()
            .withf(|_, _, status| {
                status.phase == SecurityPolicyPhase::Ready && status.observed_generation == Some(2)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let backend = Arc::new(FakeBackend::default());

        let action = reconcile(
            Arc::new(security_policy(true)),
            context(kube, Arc::clone(&backend)),
        )
        .await
        .unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(backend.patches().len(), 1);
    }

    #[tokio::test]
    async fn ready_status_is_not_rewritten() {
        let mut kube = MockPolicyKubeClient::new();
        kube.expect_patch_status().never();

        let mut policy = security_policy(true);
        policy.status = Some(ready_status(&policy));

        reconcile(Arc::new(policy), context(kube, Arc::default()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn invalid_spec_is_marked_failed_without_retry() {
        let mut kube = MockPolicyKubeClient::new();
        kube.expect_patch_status()
            .withf(|_, _, status| {
                status.phase == SecurityPolicyPhase::Failed
                    && status.message.as_deref().is_some_and(|m| m.contains("port"))
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let backend = Arc::new(FakeBackend::default());

        let mut policy = security_policy(true);
        policy.spec.rules = vec![SecurityPolicyRule {
            ports: vec![SecurityPolicyPort {
                port: 0,
                ..Default::default()
            }],
            ..Default::default()
        }];

        let action = reconcile(Arc::new(policy), context(kube, Arc::clone(&backend)))
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        assert!(backend.patches().is_empty());
    }

    #[tokio::test]
    async fn backend_failure_is_returned_for_requeue() {
        let ctx = context(MockPolicyKubeClient::new(), Arc::new(FakeBackend::failing(503)));
        let policy = Arc::new(security_policy(true));

        let err = reconcile(Arc::clone(&policy), Arc::clone(&ctx))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(error_policy(policy, &err, ctx), Action::requeue(ERROR_REQUEUE));
    }

    #[tokio::test]
    async fn deletion_removes_backend_objects_then_finalizer() {
        let mut kube = MockPolicyKubeClient::new();
        kube.expect_remove_finalizer()
            .times(1)
            .returning(|_, _| Ok(()));
        let backend = Arc::new(FakeBackend::default());

        let action = reconcile(
            Arc::new(deleting(security_policy(true))),
            context(kube, Arc::clone(&backend)),
        )
        .await
        .unwrap();

        assert_eq!(action, Action::await_change());
        let patches = backend.patches();
        assert_eq!(patches.len(), 1);
        assert!(patches[0]
            .security_policy()
            .is_some_and(|p| p.marked_for_delete));
    }

    #[tokio::test]
    async fn unbuildable_deleted_policy_is_removed_by_owner() {
        let mut kube = MockPolicyKubeClient::new();
        kube.expect_remove_finalizer()
            .times(1)
            .returning(|_, _| Ok(()));
        let backend = Arc::new(FakeBackend::default());
        let ctx = context(kube, Arc::clone(&backend));
        own(&ctx, "u1");

        let mut policy = deleting(security_policy(true));
        policy.spec.applied_to.clear();
        policy.spec.rules = vec![SecurityPolicyRule::default()];

        reconcile(Arc::new(policy), Arc::clone(&ctx)).await.unwrap();

        assert_eq!(backend.patches().len(), 1);
        assert!(ctx.service.list_owned_identities().is_empty());
    }

    #[tokio::test]
    async fn failed_backend_delete_keeps_finalizer() {
        let mut kube = MockPolicyKubeClient::new();
        kube.expect_remove_finalizer().never();

        let result = reconcile(
            Arc::new(deleting(security_policy(true))),
            context(kube, Arc::new(FakeBackend::failing(503))),
        )
        .await;

        assert!(result.is_err());
    }

    // =========================================================================
    // Garbage collection stories
    // =========================================================================

    #[tokio::test]
    async fn orphaned_owners_are_collected() {
        let mut kube = MockPolicyKubeClient::new();
        kube.expect_list_live_uids()
            .returning(|| Ok(BTreeSet::from(["live".to_string()])));
        let backend = Arc::new(FakeBackend::default());
        let ctx = context(kube, Arc::clone(&backend));
        own(&ctx, "live");
        own(&ctx, "gone");

        let removed = collect_garbage(&ctx).await.unwrap();

        assert_eq!(removed, 1);
        let patches = backend.patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(
            patches[0].security_policy().map(|p| p.id.as_str()),
            Some("sp_gone")
        );
        assert_eq!(
            ctx.service.list_owned_identities(),
            BTreeSet::from(["live".to_string()])
        );
    }

    #[tokio::test]
    async fn policy_reconciled_during_gc_survives() {
        let backend = Arc::new(FakeBackend::default());
        let service = SecurityPolicyService::new(
            Arc::clone(&backend) as Arc<dyn PolicyBackend>,
            PolicyBuilder::new("c1", "default"),
        );
        let stores = service.stores().clone();

        // The resource is created and realized after the live listing ran
        let mut kube = MockPolicyKubeClient::new();
        kube.expect_list_live_uids().returning(move || {
            own_in(&stores, "new");
            Ok(BTreeSet::new())
        });
        let ctx = PolicyContext::for_testing(Arc::new(kube), Arc::new(service));

        let removed = collect_garbage(&ctx).await.unwrap();

        assert_eq!(removed, 0);
        assert!(backend.patches().is_empty());
        assert!(ctx.service.list_owned_identities().contains("new"));
    }

    #[tokio::test]
    async fn owners_with_only_groups_are_not_counted() {
        let mut kube = MockPolicyKubeClient::new();
        kube.expect_list_live_uids().returning(|| Ok(BTreeSet::new()));
        let backend = Arc::new(FakeBackend::default());
        let ctx = context(kube, Arc::clone(&backend));
        ctx.service.stores().groups.put(Group {
            id: "sp_stray_scope".to_string(),
            tags: vec![Tag::new(TAG_SCOPE_SECURITY_POLICY_UID, "stray")],
            ..Default::default()
        });

        let removed = collect_garbage(&ctx).await.unwrap();

        assert_eq!(removed, 0);
        assert!(backend.patches().is_empty());
    }

    #[tokio::test]
    async fn gc_aborts_when_live_uids_are_unknown() {
        let mut kube = MockPolicyKubeClient::new();
        kube.expect_list_live_uids()
            .returning(|| Err(Error::internal_with_context("list_live_uids", "api server unreachable")));
        let backend = Arc::new(FakeBackend::default());
        let ctx = context(kube, Arc::clone(&backend));
        own(&ctx, "x");

        assert!(collect_garbage(&ctx).await.is_err());
        assert!(backend.patches().is_empty());
        assert!(ctx.service.list_owned_identities().contains("x"));
    }
}
