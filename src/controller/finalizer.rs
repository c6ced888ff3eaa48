//! Finalizer-gated deletion.
//!
//! An instance moves through four states, derived from two facts on the
//! object: whether our finalizer marker is present and whether a deletion
//! timestamp is set.
//!
//! ```text
//!   Active ──add marker──▶ Guarded ──deletionTimestamp──▶ Finalizing ──cleanup ok──▶ Released
//!                                                            │   ▲
//!                                                            └───┘ cleanup failed: marker kept
//! ```
//!
//! Cleanup undoes what owner references cannot: the subject on the shared
//! ClusterRoleBinding and the cluster-scoped IngressClass. Namespaced
//! children go away through garbage collection once the instance is gone.

use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::cluster::Cluster;
use crate::crd::nginx_ingress_controller::NginxIngressController;
use crate::error::Result;
use crate::retry::{retry_on_conflict, RetryPolicy};

use super::child_resources::delete_ingress_class;
use super::rbac::remove_subject;

/// Marker placed on every instance the operator has started converging.
pub const FINALIZER: &str = "nginx.ingress-operator.io/finalizer";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalizerState {
    /// No marker, not being deleted.
    Active,
    /// Marker present, not being deleted: normal reconcile.
    Guarded,
    /// Marker present, deletion requested: cleanup pending.
    Finalizing,
    /// Deletion requested and our marker is gone: nothing left for us.
    Released,
}

pub fn has_finalizer(instance: &NginxIngressController) -> bool {
    instance.finalizers().iter().any(|f| f == FINALIZER)
}

pub fn finalizer_state(instance: &NginxIngressController) -> FinalizerState {
    let deleting = instance.metadata.deletion_timestamp.is_some();
    match (deleting, has_finalizer(instance)) {
        (false, false) => FinalizerState::Active,
        (false, true) => FinalizerState::Guarded,
        (true, true) => FinalizerState::Finalizing,
        (true, false) => FinalizerState::Released,
    }
}

/// Active → Guarded. Returns the stored object so the rest of the pass works
/// on the current resourceVersion.
pub async fn add_finalizer<C: Cluster>(
    cluster: &C,
    instance: &NginxIngressController,
) -> Result<NginxIngressController> {
    let mut guarded = instance.clone();
    guarded.finalizers_mut().push(FINALIZER.to_string());
    let stored = cluster.replace(&guarded).await?;
    debug!(name = %instance.name_any(), "finalizer added");
    Ok(stored)
}

/// Finalizing → Released.
///
/// The subject is removed first, then the IngressClass; the marker is
/// dropped only after both succeeded. Any error leaves the marker in place so
/// the next pass retries the whole cleanup.
pub async fn finalize<C: Cluster>(
    cluster: &C,
    retry: RetryPolicy,
    instance: &NginxIngressController,
) -> Result<()> {
    let ns = instance.namespace().unwrap_or_default();
    let name = instance.name_any();
    info!(%name, %ns, "finalizing NginxIngressController");

    // The ServiceAccount is named after the instance.
    let sa_name = name.clone();
    remove_subject(cluster, retry, &ns, &sa_name).await?;
    delete_ingress_class(cluster, &ns, &name).await?;

    retry_on_conflict(retry, "finalizer removal", || async {
        let Some(mut current) = cluster
            .get::<NginxIngressController>(Some(ns.as_str()), &name)
            .await?
        else {
            return Ok(());
        };
        if !has_finalizer(&current) {
            return Ok(());
        }
        current.finalizers_mut().retain(|f| f != FINALIZER);
        cluster.replace(&current).await?;
        Ok(())
    })
    .await?;

    info!(%name, %ns, "finalized, owned children left to garbage collection");
    cluster
        .publish_event(
            instance,
            EventType::Normal,
            "Finalized",
            "Finalize",
            Some(format!(
                "Unbound ServiceAccount {ns}/{sa_name} and released the IngressClass"
            )),
        )
        .await;
    Ok(())
}
