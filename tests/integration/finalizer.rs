use std::collections::BTreeSet;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::IngressClass;
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::ResourceExt;

use nginx_ingress_operator::controller::finalizer::{has_finalizer, FINALIZER};
use nginx_ingress_operator::controller::helpers::OWNER_NAMESPACE_LABEL;
use nginx_ingress_operator::controller::nginx_ingress_controller::{reconcile_once, Outcome};

use super::common::*;

/// Converge `ns/name` into a cluster that already has namespace `ns`.
async fn deployed(t: &TestContext, ns: &str, name: &str) -> anyhow::Result<()> {
    t.create(ns, name, Default::default());
    assert_eq!(t.reconcile(ns, name).await?, Outcome::Converged);
    Ok(())
}

#[tokio::test]
async fn delete_cleans_up_and_releases() -> anyhow::Result<()> {
    let t = TestContext::new();
    t.namespace("ingress");
    deployed(&t, "ingress", "edge").await?;

    t.delete("ingress", "edge").await;
    let pending = t.instance("ingress", "edge").unwrap();
    assert!(pending.metadata.deletion_timestamp.is_some(), "held by the finalizer");

    assert_eq!(t.reconcile("ingress", "edge").await?, Outcome::Finalized);

    let c = t.cluster();
    let ns = Some("ingress");
    assert!(t.instance("ingress", "edge").is_none());
    assert!(t.subjects().is_empty());
    assert!(c.object::<IngressClass>(None, "edge").is_none());
    assert!(c.object::<Deployment>(ns, "edge").is_none());
    assert!(c.object::<Service>(ns, "edge").is_none());
    assert!(c.object::<ConfigMap>(ns, "edge").is_none());
    assert!(c.object::<ServiceAccount>(ns, "edge").is_none());
    // The shared binding itself outlives its subjects.
    assert!(c
        .object::<ClusterRoleBinding>(None, "ingress-nginx-role")
        .is_some());

    let reasons: Vec<String> = c.events().into_iter().map(|e| e.reason).collect();
    assert_eq!(reasons, vec!["Deployed", "Finalized"]);

    assert_eq!(t.reconcile("ingress", "edge").await?, Outcome::Gone);
    Ok(())
}

/// An instance deleted before its first pass bound anything finalizes cleanly.
#[tokio::test]
async fn delete_before_subject_added() -> anyhow::Result<()> {
    let t = TestContext::new();
    t.namespace("ingress");
    let mut obj = instance("ingress", "edge", Default::default());
    obj.finalizers_mut().push(FINALIZER.to_string());
    t.cluster().seed(obj)?;

    t.delete("ingress", "edge").await;
    assert_eq!(t.reconcile("ingress", "edge").await?, Outcome::Finalized);
    assert!(t.instance("ingress", "edge").is_none());
    assert!(t.cluster().list::<ClusterRoleBinding>().is_empty());
    Ok(())
}

/// Without our marker the object is deleted immediately and there is nothing to do.
#[tokio::test]
async fn delete_without_marker_is_gone() -> anyhow::Result<()> {
    let t = TestContext::new();
    t.namespace("ingress");
    t.create("ingress", "edge", Default::default());
    t.delete("ingress", "edge").await;
    assert_eq!(t.reconcile("ingress", "edge").await?, Outcome::Gone);
    Ok(())
}

/// Another controller's finalizer keeps the object around after ours is gone.
#[tokio::test]
async fn foreign_finalizer_is_released() -> anyhow::Result<()> {
    let t = TestContext::new();
    t.namespace("ingress");
    let mut obj = instance("ingress", "edge", Default::default());
    obj.finalizers_mut().push("example.com/other".to_string());
    t.cluster().seed(obj)?;

    t.delete("ingress", "edge").await;
    assert_eq!(t.reconcile("ingress", "edge").await?, Outcome::Released);
    assert!(t.instance("ingress", "edge").is_some());
    Ok(())
}

#[tokio::test]
async fn delete_leaves_other_instances_untouched() -> anyhow::Result<()> {
    let t = TestContext::new();
    t.namespace("ingress");
    deployed(&t, "ingress", "edge-1").await?;
    deployed(&t, "ingress", "edge-2").await?;

    t.delete("ingress", "edge-1").await;
    assert_eq!(t.reconcile("ingress", "edge-1").await?, Outcome::Finalized);

    let c = t.cluster();
    assert_eq!(t.subjects(), vec![("ingress".to_string(), "edge-2".to_string())]);
    assert!(c.object::<IngressClass>(None, "edge-1").is_none());
    assert!(c.object::<IngressClass>(None, "edge-2").is_some());
    assert!(c.object::<Deployment>(Some("ingress"), "edge-1").is_none());
    assert!(c.object::<Deployment>(Some("ingress"), "edge-2").is_some());

    let writes = c.mutations();
    assert_eq!(t.reconcile("ingress", "edge-2").await?, Outcome::Converged);
    assert_eq!(c.mutations(), writes);
    Ok(())
}

/// Two same-named instances share one IngressClass name; only its labelled
/// owner may delete it.
#[tokio::test]
async fn foreign_ingress_class_is_kept() -> anyhow::Result<()> {
    let t = TestContext::new();
    t.namespace("a");
    t.namespace("b");
    deployed(&t, "a", "edge").await?;
    deployed(&t, "b", "edge").await?;

    t.delete("b", "edge").await;
    assert_eq!(t.reconcile("b", "edge").await?, Outcome::Finalized);

    let class: IngressClass = t.cluster().object(None, "edge").unwrap();
    assert_eq!(
        class.labels().get(OWNER_NAMESPACE_LABEL).map(String::as_str),
        Some("a")
    );
    assert_eq!(t.subjects(), vec![("a".to_string(), "edge".to_string())]);
    Ok(())
}

/// A failed cleanup keeps the marker so the next pass tries again.
#[tokio::test]
async fn failed_cleanup_keeps_marker() -> anyhow::Result<()> {
    let t = TestContext::new();
    t.namespace("ingress");
    deployed(&t, "ingress", "edge").await?;

    t.delete("ingress", "edge").await;
    t.cluster().inject_failures::<ClusterRoleBinding>(1);

    assert!(t.reconcile("ingress", "edge").await.is_err());
    let pending = t.instance("ingress", "edge").unwrap();
    assert!(has_finalizer(&pending));
    assert_eq!(t.subjects().len(), 1);
    assert!(t.cluster().object::<IngressClass>(None, "edge").is_some());

    assert_eq!(t.reconcile("ingress", "edge").await?, Outcome::Finalized);
    assert!(t.instance("ingress", "edge").is_none());
    assert!(t.subjects().is_empty());
    Ok(())
}

/// Conflicts on the shared binding during cleanup are retried, not surfaced.
#[tokio::test]
async fn cleanup_retries_binding_conflicts() -> anyhow::Result<()> {
    let t = TestContext::new();
    t.namespace("ingress");
    deployed(&t, "ingress", "edge-1").await?;
    deployed(&t, "ingress", "edge-2").await?;

    t.delete("ingress", "edge-1").await;
    t.cluster().inject_conflicts::<ClusterRoleBinding>(4);

    assert_eq!(t.reconcile("ingress", "edge-1").await?, Outcome::Finalized);
    assert!(t.instance("ingress", "edge-1").is_none());
    assert_eq!(t.subjects(), vec![("ingress".to_string(), "edge-2".to_string())]);
    Ok(())
}

/// Finalizes and first passes hitting the binding at the same time leave
/// exactly the live instances bound.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finalizes_race_new_subjects() -> anyhow::Result<()> {
    const N: usize = 4;
    let t = TestContext::new();
    for i in 0..N {
        let ns = format!("old-{i}");
        t.namespace(&ns);
        deployed(&t, &ns, "edge").await?;
        t.namespace(&format!("new-{i}"));
        t.create(&format!("new-{i}"), "edge", Default::default());
    }
    for i in 0..N {
        t.delete(&format!("old-{i}"), "edge").await;
    }
    t.cluster().inject_conflicts::<ClusterRoleBinding>(5);

    let handles: Vec<_> = (0..N)
        .flat_map(|i| [format!("old-{i}"), format!("new-{i}")])
        .map(|ns| {
            let ctx = t.ctx.clone();
            tokio::spawn(async move { reconcile_once(ctx.as_ref(), &ns, "edge").await })
        })
        .collect();
    for handle in handles {
        let outcome = handle.await??;
        assert!(matches!(outcome, Outcome::Finalized | Outcome::Converged));
    }

    let expected: BTreeSet<(String, String)> =
        (0..N).map(|i| (format!("new-{i}"), "edge".to_string())).collect();
    assert_eq!(t.subjects().len(), N, "no duplicate subjects");
    assert_eq!(t.subject_set(), expected);
    for i in 0..N {
        assert!(t.instance(&format!("old-{i}"), "edge").is_none());
    }
    Ok(())
}
