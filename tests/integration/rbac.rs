use std::collections::BTreeSet;
use std::time::Duration;

use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::api::ObjectMeta;

use nginx_ingress_operator::controller::nginx_ingress_controller::{reconcile_once, Outcome};
use nginx_ingress_operator::controller::rbac::{
    cluster_role_rules, ensure_shared_rbac, ensure_subject, remove_subject, CLUSTER_ROLE_NAME,
};
use nginx_ingress_operator::retry::RetryPolicy;

use super::common::*;

const INSTANCES: usize = 8;

async fn converge_concurrently(t: &TestContext) -> anyhow::Result<()> {
    for i in 0..INSTANCES {
        t.namespace(&format!("team-{i}"));
        t.create(&format!("team-{i}"), &format!("edge-{i}"), Default::default());
    }

    let handles: Vec<_> = (0..INSTANCES)
        .map(|i| {
            let ctx = t.ctx.clone();
            tokio::spawn(async move {
                reconcile_once(ctx.as_ref(), &format!("team-{i}"), &format!("edge-{i}")).await
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await??, Outcome::Converged);
    }
    Ok(())
}

fn expected_subjects() -> BTreeSet<(String, String)> {
    (0..INSTANCES)
        .map(|i| (format!("team-{i}"), format!("edge-{i}")))
        .collect()
}

/// Concurrent first passes must not lose or duplicate any subject.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_instances_all_bound() -> anyhow::Result<()> {
    let t = TestContext::new();
    converge_concurrently(&t).await?;

    assert_eq!(t.subjects().len(), INSTANCES, "no duplicate subjects");
    assert_eq!(t.subject_set(), expected_subjects());
    assert_eq!(t.cluster().list::<ClusterRole>().len(), 1);
    assert_eq!(t.cluster().list::<ClusterRoleBinding>().len(), 1);
    Ok(())
}

/// Same as above with extra conflicts forced on the shared binding.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_instances_survive_injected_conflicts() -> anyhow::Result<()> {
    let t = TestContext::new();
    t.cluster().inject_conflicts::<ClusterRoleBinding>(5);
    converge_concurrently(&t).await?;

    assert_eq!(t.subjects().len(), INSTANCES);
    assert_eq!(t.subject_set(), expected_subjects());
    Ok(())
}

#[tokio::test]
async fn ensure_subject_is_idempotent() -> anyhow::Result<()> {
    let t = TestContext::new();
    let c = t.cluster();
    ensure_shared_rbac(c, fast_retry()).await?;

    assert!(ensure_subject(c, fast_retry(), "ingress", "edge").await?);
    let writes = c.mutations();
    assert!(!ensure_subject(c, fast_retry(), "ingress", "edge").await?);
    assert_eq!(c.mutations(), writes);
    assert_eq!(t.subjects().len(), 1);
    Ok(())
}

/// Same name in two namespaces is two distinct subjects.
#[tokio::test]
async fn subjects_are_keyed_by_namespace_and_name() -> anyhow::Result<()> {
    let t = TestContext::new();
    let c = t.cluster();
    ensure_shared_rbac(c, fast_retry()).await?;
    ensure_subject(c, fast_retry(), "a", "edge").await?;
    ensure_subject(c, fast_retry(), "b", "edge").await?;

    assert!(remove_subject(c, fast_retry(), "a", "edge").await?);
    assert_eq!(t.subjects(), vec![("b".to_string(), "edge".to_string())]);
    assert!(!remove_subject(c, fast_retry(), "a", "edge").await?);
    Ok(())
}

#[tokio::test]
async fn missing_binding_is_created_with_subject() -> anyhow::Result<()> {
    let t = TestContext::new();
    assert!(ensure_subject(t.cluster(), fast_retry(), "ingress", "edge").await?);
    assert_eq!(t.subjects(), vec![("ingress".to_string(), "edge".to_string())]);
    Ok(())
}

#[tokio::test]
async fn remove_subject_without_binding_is_noop() -> anyhow::Result<()> {
    let t = TestContext::new();
    assert!(!remove_subject(t.cluster(), fast_retry(), "ingress", "edge").await?);
    assert_eq!(t.cluster().mutations(), 0);
    Ok(())
}

/// A role left behind by an older operator gets its rules rewritten.
#[tokio::test]
async fn drifted_role_rules_are_refreshed() -> anyhow::Result<()> {
    let t = TestContext::new();
    let c = t.cluster();
    c.seed(ClusterRole {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE_NAME.to_string()),
            ..Default::default()
        },
        rules: Some(Vec::new()),
        ..Default::default()
    })?;

    ensure_shared_rbac(c, fast_retry()).await?;
    let role: ClusterRole = c.object(None, CLUSTER_ROLE_NAME).unwrap();
    assert_eq!(role.rules, Some(cluster_role_rules()));

    let writes = c.mutations();
    ensure_shared_rbac(c, fast_retry()).await?;
    assert_eq!(c.mutations(), writes, "converged role is not rewritten");
    Ok(())
}

/// Once the budget is spent the conflict surfaces to the caller.
#[tokio::test]
async fn retry_budget_exhaustion_returns_conflict() -> anyhow::Result<()> {
    let t = TestContext::new();
    let c = t.cluster();
    ensure_shared_rbac(c, fast_retry()).await?;
    c.inject_conflicts::<ClusterRoleBinding>(3);

    let policy = RetryPolicy {
        attempts: 3,
        backoff: Duration::from_millis(1),
    };
    let err = ensure_subject(c, policy, "ingress", "edge").await.unwrap_err();
    assert!(err.is_conflict());
    assert!(t.subjects().is_empty());

    // The next attempt goes through.
    assert!(ensure_subject(c, policy, "ingress", "edge").await?);
    Ok(())
}
