//! Initial cache warm-up
//!
//! Policies, rules and groups are listed concurrently, one task per kind,
//! each task writing only to its own store. The first failure aborts the
//! remaining tasks and waits for them to stop before it is returned, so no
//! store changes after the caller has seen the error.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, info};

use netfence_common::model::{BackendObject, Group, Policy, Rule};
use netfence_common::{Error, Result};

use crate::client::PolicyBackend;
use crate::store::{IndexedStore, SharedStore};

/// The three local mirrors of backend state
#[derive(Clone, Debug, Default)]
pub struct PolicyStores {
    /// Security policies, held without their embedded rules
    pub policies: SharedStore<Policy>,
    /// Rules of every policy
    pub rules: SharedStore<Rule>,
    /// Groups referenced by policies and rules
    pub groups: SharedStore<Group>,
}

impl PolicyStores {
    /// Create three empty stores
    pub fn new() -> Self {
        Self {
            policies: Arc::new(IndexedStore::new()),
            rules: Arc::new(IndexedStore::new()),
            groups: Arc::new(IndexedStore::new()),
        }
    }
}

/// Populate `stores` from one listing per kind
pub async fn sync_stores(backend: Arc<dyn PolicyBackend>, stores: &PolicyStores) -> Result<()> {
    let mut tasks: JoinSet<Result<(&'static str, usize)>> = JoinSet::new();

    let (b, store) = (Arc::clone(&backend), Arc::clone(&stores.policies));
    tasks.spawn(async move {
        let policies = b
            .list_security_policies()
            .await
            .map_err(|e| Error::sync(Policy::KIND, e))?;
        Ok((Policy::KIND, fill(&store, policies.into_iter().map(without_rules))))
    });

    let (b, store) = (Arc::clone(&backend), Arc::clone(&stores.rules));
    tasks.spawn(async move {
        let rules = b.list_rules().await.map_err(|e| Error::sync(Rule::KIND, e))?;
        Ok((Rule::KIND, fill(&store, rules)))
    });

    let (b, store) = (backend, Arc::clone(&stores.groups));
    tasks.spawn(async move {
        let groups = b.list_groups().await.map_err(|e| Error::sync(Group::KIND, e))?;
        Ok((Group::KIND, fill(&store, groups)))
    });

    while let Some(joined) = tasks.join_next().await {
        let outcome = joined
            .map_err(|e| Error::internal_with_context("sync", e.to_string()))
            .and_then(|result| result);

        match outcome {
            Ok((kind, count)) => info!(kind, count, "store synced"),
            Err(e) => {
                tasks.shutdown().await;
                error!(error = %e, "initial sync failed");
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Rules are mirrored in their own store
fn without_rules(mut policy: Policy) -> Policy {
    policy.rules.clear();
    policy
}

fn fill<T: BackendObject>(store: &IndexedStore<T>, objects: impl IntoIterator<Item = T>) -> usize {
    let mut count = 0;
    for obj in objects {
        store.put(obj);
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;
    use netfence_common::model::{Infra, Tag};
    use netfence_common::TAG_SCOPE_SECURITY_POLICY_UID;

    use crate::client::MockPolicyBackend;

    fn owned_rule(id: &str) -> Rule {
        Rule {
            id: id.to_string(),
            tags: vec![Tag::new(TAG_SCOPE_SECURITY_POLICY_UID, "u1")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn populates_all_three_stores() {
        let mut mock = MockPolicyBackend::new();
        mock.expect_list_security_policies().times(1).returning(|| {
            Ok(vec![Policy {
                id: "sp_u1".to_string(),
                rules: vec![owned_rule("sp_u1_0")],
                tags: vec![Tag::new(TAG_SCOPE_SECURITY_POLICY_UID, "u1")],
                ..Default::default()
            }])
        });
        mock.expect_list_rules()
            .times(1)
            .returning(|| Ok(vec![owned_rule("sp_u1_0"), owned_rule("sp_u1_1")]));
        mock.expect_list_groups().times(1).returning(|| Ok(Vec::new()));

        let stores = PolicyStores::new();
        sync_stores(Arc::new(mock), &stores).await.unwrap();

        assert_eq!(stores.policies.len(), 1);
        assert!(stores.policies.get("sp_u1").unwrap().rules.is_empty());
        assert_eq!(stores.rules.list_by_index("u1").len(), 2);
        assert!(stores.groups.is_empty());
    }

    #[tokio::test]
    async fn listing_failure_is_wrapped_with_kind() {
        let mut mock = MockPolicyBackend::new();
        mock.expect_list_security_policies()
            .returning(|| Ok(Vec::new()));
        mock.expect_list_rules().returning(|| Ok(Vec::new()));
        mock.expect_list_groups()
            .returning(|| Err(Error::backend_status("list group", 403, "forbidden")));

        let err = sync_stores(Arc::new(mock), &PolicyStores::new())
            .await
            .unwrap_err();

        assert!(matches!(&err, Error::Sync { kind, .. } if kind == "group"));
        assert_eq!(err.status(), Some(403));
        assert!(!err.is_retryable());
    }

    /// Rules wait for `release`; groups fail immediately
    #[derive(Default)]
    struct SlowRulesBackend {
        release: Notify,
        rules_listed: AtomicBool,
    }

    #[async_trait]
    impl PolicyBackend for SlowRulesBackend {
        async fn list_security_policies(&self) -> Result<Vec<Policy>> {
            Ok(Vec::new())
        }

        async fn list_rules(&self) -> Result<Vec<Rule>> {
            self.release.notified().await;
            self.rules_listed.store(true, Ordering::SeqCst);
            Ok(vec![owned_rule("late")])
        }

        async fn list_groups(&self) -> Result<Vec<Group>> {
            Err(Error::backend("list group", "connection refused"))
        }

        async fn patch_infra(&self, _: &Infra, _: bool) -> Result<()> {
            Ok(())
        }

        async fn patch_group(&self, _: &str, _: &Group) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_error_cancels_outstanding_listings() {
        let stores = PolicyStores::new();
        let backend = Arc::new(SlowRulesBackend::default());

        // Returns while the rule listing is still parked on `release`
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            sync_stores(Arc::clone(&backend) as Arc<dyn PolicyBackend>, &stores),
        )
        .await
        .expect("sync waited for the blocked rule listing");
        assert!(result.is_err());

        // An aborted task must not write after the error was returned
        backend.release.notify_waiters();
        tokio::task::yield_now().await;
        assert!(!backend.rules_listed.load(Ordering::SeqCst));
        assert!(stores.rules.is_empty());
    }
}
