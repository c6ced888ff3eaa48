//! The shared ClusterRole / ClusterRoleBinding pair.
//!
//! Every instance's ServiceAccount is bound to one cluster-wide role. The
//! pair is not owned by any instance (a cluster-scoped object cannot be
//! garbage collected through a namespaced owner) and outlives all of them.
//!
//! The binding's subject list is written by every reconcile of every
//! instance, concurrently. All writes are read-modify-write cycles guarded by
//! the resourceVersion that was read and re-run on conflict, and membership
//! is checked before every append so that a retried add never duplicates.

use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use kube::api::ObjectMeta;
use tracing::{debug, info};

use crate::cluster::Cluster;
use crate::error::{Error, Result};
use crate::retry::{retry_on_conflict, RetryPolicy};

use super::child_resources::{create_if_absent, Operation};

/// Name of both the shared ClusterRole and its ClusterRoleBinding.
pub const CLUSTER_ROLE_NAME: &str = "ingress-nginx-role";

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

fn rule(api_group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

/// The fixed rule set granted to every controller pod.
///
/// Leader election rules are not restricted by resource name: each instance
/// elects through its own `<name>-lock` object.
pub fn cluster_role_rules() -> Vec<PolicyRule> {
    vec![
        rule("", &["namespaces"], &["get"]),
        rule(
            "",
            &["configmaps", "pods", "secrets", "endpoints", "services"],
            &["get", "list", "watch"],
        ),
        rule(
            "networking.k8s.io",
            &["ingresses", "ingressclasses"],
            &["get", "list", "watch"],
        ),
        rule("networking.k8s.io", &["ingresses/status"], &["update"]),
        rule("", &["configmaps"], &["get", "update", "create"]),
        rule("coordination.k8s.io", &["leases"], &["get", "update", "create"]),
        rule("", &["events"], &["create", "patch"]),
    ]
}

pub fn cluster_role() -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE_NAME.to_string()),
            ..Default::default()
        },
        rules: Some(cluster_role_rules()),
        ..Default::default()
    }
}

pub fn cluster_role_binding(subjects: Vec<Subject>) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE_NAME.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: CLUSTER_ROLE_NAME.to_string(),
        },
        subjects: if subjects.is_empty() {
            None
        } else {
            Some(subjects)
        },
    }
}

pub fn subject_for_service_account(namespace: &str, name: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace: Some(namespace.to_string()),
        api_group: None,
    }
}

/// Subject identity is (namespace, name) of a ServiceAccount.
pub fn is_service_account(subject: &Subject, namespace: &str, name: &str) -> bool {
    subject.kind == "ServiceAccount"
        && subject.name == name
        && subject.namespace.as_deref() == Some(namespace)
}

pub fn has_subject(binding: &ClusterRoleBinding, namespace: &str, name: &str) -> bool {
    binding
        .subjects
        .iter()
        .flatten()
        .any(|s| is_service_account(s, namespace, name))
}

// ── Bootstrap ────────────────────────────────────────────────────────────────

/// Make sure the role exists and carries the current rule set. Rules are
/// only rewritten when they differ, so a converged cluster sees no writes.
pub async fn ensure_cluster_role<C: Cluster>(cluster: &C, retry: RetryPolicy) -> Result<Operation> {
    if create_if_absent(cluster, &cluster_role()).await? == Operation::Created {
        return Ok(Operation::Created);
    }

    let desired = cluster_role_rules();
    retry_on_conflict(retry, "ClusterRole rules", || async {
        let Some(mut role) = cluster.get::<ClusterRole>(None, CLUSTER_ROLE_NAME).await? else {
            cluster.create(&cluster_role()).await.map_err(|e| {
                if e.is_already_exists() {
                    Error::Conflict(format!("ClusterRole {CLUSTER_ROLE_NAME}"))
                } else {
                    e
                }
            })?;
            return Ok(Operation::Created);
        };
        if role.rules.as_ref() == Some(&desired) {
            debug!("ClusterRole rules up to date");
            return Ok(Operation::Unchanged);
        }
        role.rules = Some(desired.clone());
        cluster.replace(&role).await?;
        info!(name = CLUSTER_ROLE_NAME, "refreshed ClusterRole rules");
        Ok(Operation::Updated)
    })
    .await
}

/// Create the binding with no subjects when absent.
pub async fn ensure_cluster_role_binding<C: Cluster>(cluster: &C) -> Result<Operation> {
    create_if_absent(cluster, &cluster_role_binding(Vec::new())).await
}

/// Role first, then binding: the binding must never reference a missing role.
pub async fn ensure_shared_rbac<C: Cluster>(cluster: &C, retry: RetryPolicy) -> Result<()> {
    ensure_cluster_role(cluster, retry).await?;
    ensure_cluster_role_binding(cluster).await?;
    Ok(())
}

// ── Subject membership ───────────────────────────────────────────────────────

/// Add ServiceAccount `namespace/name` to the shared binding. Returns whether
/// a write happened. Safe under any number of concurrent callers.
pub async fn ensure_subject<C: Cluster>(
    cluster: &C,
    retry: RetryPolicy,
    namespace: &str,
    name: &str,
) -> Result<bool> {
    retry_on_conflict(retry, "ClusterRoleBinding subjects", || async {
        match cluster
            .get::<ClusterRoleBinding>(None, CLUSTER_ROLE_NAME)
            .await?
        {
            None => {
                let binding =
                    cluster_role_binding(vec![subject_for_service_account(namespace, name)]);
                // Someone else created it between our read and write: re-read.
                cluster.create(&binding).await.map_err(|e| {
                    if e.is_already_exists() {
                        Error::Conflict(format!("ClusterRoleBinding {CLUSTER_ROLE_NAME}"))
                    } else {
                        e
                    }
                })?;
                info!(%namespace, %name, "created ClusterRoleBinding with subject");
                Ok(true)
            }
            Some(binding) if has_subject(&binding, namespace, name) => {
                debug!(%namespace, %name, "subject already bound");
                Ok(false)
            }
            Some(mut binding) => {
                binding
                    .subjects
                    .get_or_insert_with(Vec::new)
                    .push(subject_for_service_account(namespace, name));
                cluster.replace(&binding).await?;
                info!(%namespace, %name, "added subject to ClusterRoleBinding");
                Ok(true)
            }
        }
    })
    .await
}

/// Remove ServiceAccount `namespace/name` from the shared binding. A missing
/// binding or subject is a no-op. Other subjects are never touched.
pub async fn remove_subject<C: Cluster>(
    cluster: &C,
    retry: RetryPolicy,
    namespace: &str,
    name: &str,
) -> Result<bool> {
    retry_on_conflict(retry, "ClusterRoleBinding subjects", || async {
        let Some(mut binding) = cluster
            .get::<ClusterRoleBinding>(None, CLUSTER_ROLE_NAME)
            .await?
        else {
            debug!(%namespace, %name, "no ClusterRoleBinding, nothing to unbind");
            return Ok(false);
        };
        if !has_subject(&binding, namespace, name) {
            debug!(%namespace, %name, "subject not bound");
            return Ok(false);
        }
        binding.subjects = binding.subjects.map(|subjects| {
            subjects
                .into_iter()
                .filter(|s| !is_service_account(s, namespace, name))
                .collect()
        });
        cluster.replace(&binding).await?;
        info!(%namespace, %name, "removed subject from ClusterRoleBinding");
        Ok(true)
    })
    .await
}
