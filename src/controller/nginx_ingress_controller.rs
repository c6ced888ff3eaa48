//! NginxIngressController controller: the main reconciler.
//!
//! One pass converges one instance end to end: finalizer bookkeeping,
//! namespace check, spec normalization, the shared RBAC bootstrap and
//! subject membership, then the owned Deployment, Service and ConfigMap,
//! and finally the one-time `deployed` status flag. Every step is
//! idempotent, so a failed or cancelled pass is simply re-run from the top.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, Namespace, Service, ServiceAccount},
};
use kube::{
    api::{Api, ResourceExt},
    runtime::{
        controller::{self, Action, Controller},
        events::EventType,
        watcher::Config as WatcherConfig,
    },
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, KubeCluster};
use crate::crd::nginx_ingress_controller::NginxIngressController;
use crate::error::{Error, Result};
use crate::helpers::OperatorDefaults;
use crate::normalize::normalize;
use crate::retry::RetryPolicy;

use super::child_resources;
use super::finalizer::{self, FinalizerState};
use super::rbac;

// ── Shared context passed to every reconcile call ─────────────────────────────

pub struct Context<C: Cluster = KubeCluster> {
    pub cluster: C,
    pub defaults: OperatorDefaults,
    pub retry: RetryPolicy,
    /// Upper bound on one reconcile pass.
    pub reconcile_timeout: Duration,
}

impl<C: Cluster> Context<C> {
    pub fn new(cluster: C, defaults: OperatorDefaults) -> Self {
        Self {
            cluster,
            defaults,
            retry: RetryPolicy::default(),
            reconcile_timeout: Duration::from_secs(60),
        }
    }
}

/// How a reconcile pass ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The instance no longer exists.
    Gone,
    /// Cleanup ran and the finalizer marker was removed.
    Finalized,
    /// Deletion in progress but our marker is already gone.
    Released,
    /// Namespace missing or terminating; nothing to converge.
    NamespaceUnavailable,
    /// All owned and shared objects match the spec.
    Converged,
}

// ── Controller entry point ────────────────────────────────────────────────────

/// Start the NginxIngressController controller. Returns when a shutdown
/// signal has been received and in-flight reconciles have drained.
pub async fn run(ctx: Arc<Context>, concurrency: u16) {
    let client = ctx.cluster.client().clone();
    let instances: Api<NginxIngressController> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client.clone());
    let services: Api<Service> = Api::all(client.clone());
    let configmaps: Api<ConfigMap> = Api::all(client.clone());
    let service_accounts: Api<ServiceAccount> = Api::all(client.clone());

    Controller::new(instances, WatcherConfig::default())
        .owns(deployments, WatcherConfig::default())
        .owns(services, WatcherConfig::default())
        .owns(configmaps, WatcherConfig::default())
        .owns(service_accounts, WatcherConfig::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _action)) => debug!(name = %obj.name, "reconciled"),
                Err(e) => warn!("reconcile failed: {e}"),
            }
        })
        .await;
}

// ── Reconcile ─────────────────────────────────────────────────────────────────

async fn reconcile(instance: Arc<NginxIngressController>, ctx: Arc<Context>) -> Result<Action> {
    let ns = instance.namespace().unwrap_or_default();
    let name = instance.name_any();
    match reconcile_once(ctx.as_ref(), &ns, &name).await? {
        Outcome::Converged => Ok(Action::requeue(Duration::from_secs(300))),
        _ => Ok(Action::await_change()),
    }
}

fn error_policy(instance: Arc<NginxIngressController>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = instance.name_any();
    match error {
        // Recurs until the owner edits the spec, which triggers a watch event anyway.
        Error::Validation { .. } => {
            warn!(%name, %error, "invalid spec, requeuing in 300s");
            Action::requeue(Duration::from_secs(300))
        }
        _ => {
            warn!(%name, %error, "reconcile error, requeuing in 30s");
            Action::requeue(Duration::from_secs(30))
        }
    }
}

/// One reconcile pass bounded by `ctx.reconcile_timeout`. On expiry the pass
/// is dropped at its current await point and [`Error::Timeout`] is returned.
pub async fn reconcile_once<C: Cluster>(ctx: &Context<C>, ns: &str, name: &str) -> Result<Outcome> {
    tokio::time::timeout(ctx.reconcile_timeout, converge(ctx, ns, name))
        .await
        .map_err(|_| Error::Timeout(ctx.reconcile_timeout))?
}

// ── Core reconcile logic ──────────────────────────────────────────────────────

/// Converge instance `ns/name`. Short-circuits on the first error.
pub async fn converge<C: Cluster>(ctx: &Context<C>, ns: &str, name: &str) -> Result<Outcome> {
    let cluster = &ctx.cluster;

    let Some(instance) = cluster.get::<NginxIngressController>(Some(ns), name).await? else {
        debug!(%name, %ns, "NginxIngressController not found, must have been deleted");
        return Ok(Outcome::Gone);
    };

    let instance = match finalizer::finalizer_state(&instance) {
        FinalizerState::Finalizing => {
            finalizer::finalize(cluster, ctx.retry, &instance).await?;
            return Ok(Outcome::Finalized);
        }
        FinalizerState::Released => return Ok(Outcome::Released),
        FinalizerState::Active => finalizer::add_finalizer(cluster, &instance).await?,
        FinalizerState::Guarded => instance,
    };

    // The namespace may be going away underneath us.
    let namespace = cluster.get::<Namespace>(None, ns).await?;
    let terminating = namespace
        .as_ref()
        .and_then(|n| n.status.as_ref())
        .and_then(|s| s.phase.as_deref())
        == Some("Terminating");
    if namespace.is_none() || terminating {
        info!(%name, %ns, "namespace missing or terminating, skipping reconcile");
        return Ok(Outcome::NamespaceUnavailable);
    }

    let desired = match normalize(&instance, &ctx.defaults) {
        Ok(n) => n,
        Err(e) => {
            cluster
                .publish_event(
                    &instance,
                    EventType::Warning,
                    "ValidationFailed",
                    "Reconcile",
                    Some(e.to_string()),
                )
                .await;
            return Err(e);
        }
    };

    debug!(%name, %ns, "reconciling NginxIngressController");

    // Shared RBAC and per-instance prerequisites.
    rbac::ensure_shared_rbac(cluster, ctx.retry).await?;
    child_resources::ensure_service_account(cluster, &desired).await?;
    rbac::ensure_subject(cluster, ctx.retry, ns, &desired.name).await?;
    child_resources::ensure_ingress_class(cluster, &desired).await?;

    child_resources::ensure_deployment(cluster, &desired).await?;
    child_resources::ensure_service(cluster, &desired).await?;
    child_resources::ensure_config_map(cluster, &desired).await?;

    if !instance.is_deployed() {
        cluster
            .patch_status::<NginxIngressController>(Some(ns), name, json!({ "deployed": true }))
            .await?;
        info!(%name, %ns, "NginxIngressController deployed");
        cluster
            .publish_event(
                &instance,
                EventType::Normal,
                "Deployed",
                "Reconcile",
                Some(format!("Ingress controller {ns}/{name} deployed")),
            )
            .await;
    }

    Ok(Outcome::Converged)
}
