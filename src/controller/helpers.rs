//! Shared helpers for controller modules.
//!
//! These construct small Kubernetes API fragments reused by the desired-state
//! generators. Pure utility functions (naming, label merging, quantities)
//! live in `crate::helpers` instead.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Capabilities, EnvVar, EnvVarSource, ObjectFieldSelector, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

/// Label carrying the owning instance's namespace on cluster-scoped objects,
/// which cannot hold an owner reference to a namespaced resource.
pub const OWNER_NAMESPACE_LABEL: &str = "nginx.ingress-operator.io/owner-namespace";
/// Label carrying the owning instance's name on cluster-scoped objects.
pub const OWNER_NAME_LABEL: &str = "nginx.ingress-operator.io/owner-name";

/// Build a controller OwnerReference for any kube-rs `Resource`.
///
/// Generic over `K`: `K: Resource<DynamicType = ()>` covers every type whose
/// API metadata is known at compile time, which includes the derived CRD.
pub fn controller_owner_ref<K: Resource<DynamicType = ()>>(obj: &K) -> OwnerReference {
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: obj.name_any(),
        uid: obj.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// The immutable `{app: <name>}` selector shared by the Deployment, its pods
/// and the Service.
pub fn app_selector(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), name.to_string())])
}

/// Labels marking a cluster-scoped object as belonging to one instance.
pub fn owner_labels(namespace: &str, name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (OWNER_NAMESPACE_LABEL.to_string(), namespace.to_string()),
        (OWNER_NAME_LABEL.to_string(), name.to_string()),
    ])
}

/// True when `labels` carry the owner labels of instance `namespace/name`.
pub fn is_owned_by(labels: &BTreeMap<String, String>, namespace: &str, name: &str) -> bool {
    labels.get(OWNER_NAMESPACE_LABEL).map(String::as_str) == Some(namespace)
        && labels.get(OWNER_NAME_LABEL).map(String::as_str) == Some(name)
}

/// Container security posture for the ingress-nginx controller: non-root
/// uid 101, every capability dropped except binding privileged ports.
pub fn nginx_security_context() -> SecurityContext {
    SecurityContext {
        run_as_user: Some(101),
        allow_privilege_escalation: Some(true),
        capabilities: Some(Capabilities {
            add: Some(vec!["NET_BIND_SERVICE".to_string()]),
            drop: Some(vec!["ALL".to_string()]),
        }),
        ..Default::default()
    }
}

/// Shorthand for a plain-value `EnvVar`.
pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Build an `EnvVar` that reads its value from the pod's own metadata
/// (downward API), e.g. `metadata.namespace`.
pub fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.into(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
