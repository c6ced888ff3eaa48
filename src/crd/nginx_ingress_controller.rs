use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Spec sub-types ────────────────────────────────────────────────────────────

/// ImageSpec defines the repository, tag and pull policy of the controller image.
///
/// `pullPolicy` is kept as a raw string so an invalid value still decodes and
/// is rejected by the normalizer with a field-named error.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,
}

/// ServicePortOverride patches one port of the controller Service, matched by
/// name. Unset fields keep the base port's value; an unknown name adds a port.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServicePortOverride {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<IntOrString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,
}

/// ServiceSpec describes the Service exposing the controller. Valid types are
/// `NodePort` and `LoadBalancer`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_annotations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePortOverride>,
}

/// WorkloadSpec tunes the controller Deployment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_labels: Option<BTreeMap<String, String>>,
}

// ── CRD ───────────────────────────────────────────────────────────────────────

/// NginxIngressController is the Schema for the nginxingresscontrollers API.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "nginx.ingress-operator.io",
    version = "v1beta1",
    kind = "NginxIngressController",
    shortname = "nic",
    namespaced,
    status = "NginxIngressControllerStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name": "Class", "type": "string", "jsonPath": ".spec.ingressClass"}"#,
    printcolumn = r#"{"name": "Replicas", "type": "integer", "jsonPath": ".spec.replicas"}"#,
    printcolumn = r#"{"name": "Deployed", "type": "boolean", "jsonPath": ".status.deployed"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NginxIngressControllerSpec {
    #[serde(default)]
    pub image: ImageSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload: Option<WorkloadSpec>,

    /// Namespace to watch for Ingress resources; empty watches all namespaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch_namespace: Option<String>,

    /// Initial values of the ingress-nginx ConfigMap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_data: Option<BTreeMap<String, String>>,
}

// ── Status ────────────────────────────────────────────────────────────────────

/// NginxIngressControllerStatus defines the observed state of NginxIngressController.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NginxIngressControllerStatus {
    /// True once the operator has finished the first full deployment.
    #[serde(default)]
    pub deployed: bool,
}

impl NginxIngressController {
    pub fn is_deployed(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.deployed)
    }
}
