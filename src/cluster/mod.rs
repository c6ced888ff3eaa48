//! Typed access to the cluster API.
//!
//! The reconciler talks to the cluster only through [`Cluster`], so the whole
//! convergence sequence can run against `MemoryCluster` (behind the `testing`
//! feature) in tests. API errors are classified here (NotFound /
//! AlreadyExists / Conflict) and nowhere else.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, Namespace, ObjectReference, Service, ServiceAccount},
    networking::v1::IngressClass,
    rbac::v1::{ClusterRole, ClusterRoleBinding},
};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event as KubeEvent, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use crate::crd::nginx_ingress_controller::NginxIngressController;
use crate::error::{Error, Result};

#[cfg(any(test, feature = "testing"))]
mod memory;

#[cfg(any(test, feature = "testing"))]
pub use memory::{MemoryCluster, RecordedEvent};

/// Field manager name used for status patches.
pub const FIELD_MANAGER: &str = "nginx-ingress-operator";

/// A resource type the operator reads or writes. Each type knows whether it
/// is namespaced and builds its own `Api` accordingly.
pub trait Managed:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

macro_rules! namespaced {
    ($($kind:ty),* $(,)?) => {
        $(impl Managed for $kind {
            fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                match namespace {
                    Some(ns) => Api::namespaced(client, ns),
                    None => Api::all(client),
                }
            }
        })*
    };
}

macro_rules! cluster_scoped {
    ($($kind:ty),* $(,)?) => {
        $(impl Managed for $kind {
            fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                Api::all(client)
            }
        })*
    };
}

namespaced!(NginxIngressController, Deployment, Service, ConfigMap, ServiceAccount);
cluster_scoped!(Namespace, ClusterRole, ClusterRoleBinding, IngressClass);

/// `"Kind ns/name"` or `"Kind name"`, for logs and error messages.
pub fn describe<K: Managed>(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{} {ns}/{name}", K::kind(&())),
        None => format!("{} {name}", K::kind(&())),
    }
}

/// The operations a reconcile pass needs from the cluster.
///
/// `get` maps "not found" to `Ok(None)`. `create` fails with
/// [`Error::AlreadyExists`], `replace` with [`Error::Conflict`] when the
/// object's resourceVersion is stale, and `delete` with [`Error::NotFound`].
#[async_trait]
pub trait Cluster: Send + Sync + 'static {
    async fn get<K: Managed>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>>;

    async fn create<K: Managed>(&self, obj: &K) -> Result<K>;

    async fn replace<K: Managed>(&self, obj: &K) -> Result<K>;

    async fn delete<K: Managed>(&self, namespace: Option<&str>, name: &str) -> Result<()>;

    /// Merge-patch the status subresource with `{"status": status}`.
    async fn patch_status<K: Managed>(
        &self,
        namespace: Option<&str>,
        name: &str,
        status: serde_json::Value,
    ) -> Result<()>;

    /// Publish a Kubernetes event attached to the instance.
    /// Errors are logged but never block reconciliation.
    async fn publish_event(
        &self,
        instance: &NginxIngressController,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

// ── Production implementation ────────────────────────────────────────────────

/// [`Cluster`] backed by a live API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    reporter: Reporter,
}

impl KubeCluster {
    pub fn new(client: Client, reporter: Reporter) -> Self {
        Self { client, reporter }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Build an ObjectReference from any kube Resource.
pub fn kube_object_ref<K: Resource<DynamicType = ()>>(obj: &K) -> ObjectReference {
    ObjectReference {
        api_version: Some(K::api_version(&()).to_string()),
        kind: Some(K::kind(&()).to_string()),
        name: Some(obj.name_any()),
        namespace: obj.namespace(),
        uid: obj.meta().uid.clone(),
        resource_version: obj.meta().resource_version.clone(),
        ..Default::default()
    }
}

fn namespace_of<K: Managed>(obj: &K) -> Option<String> {
    obj.meta().namespace.clone()
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get<K: Managed>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        K::api(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(e, describe::<K>(namespace, name)))
    }

    async fn create<K: Managed>(&self, obj: &K) -> Result<K> {
        let ns = namespace_of(obj);
        K::api(self.client.clone(), ns.as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(e, describe::<K>(ns.as_deref(), &obj.name_any())))
    }

    async fn replace<K: Managed>(&self, obj: &K) -> Result<K> {
        let ns = namespace_of(obj);
        let name = obj.name_any();
        K::api(self.client.clone(), ns.as_deref())
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(e, describe::<K>(ns.as_deref(), &name)))
    }

    async fn delete<K: Managed>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        K::api(self.client.clone(), namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, describe::<K>(namespace, name)))
    }

    async fn patch_status<K: Managed>(
        &self,
        namespace: Option<&str>,
        name: &str,
        status: serde_json::Value,
    ) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        K::api(self.client.clone(), namespace)
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, describe::<K>(namespace, name)))
    }

    async fn publish_event(
        &self,
        instance: &NginxIngressController,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let rec = Recorder::new(self.client.clone(), self.reporter.clone());
        let oref = kube_object_ref(instance);
        if let Err(e) = rec
            .publish(
                &KubeEvent {
                    type_,
                    reason: reason.to_string(),
                    note,
                    action: action.to_string(),
                    secondary: None,
                },
                &oref,
            )
            .await
        {
            warn!(%e, "failed to publish event");
        }
    }
}
