//! Spec normalization: fill defaults and validate enum-like fields before any
//! cluster object is touched.
//!
//! The resource stores `pullPolicy` and `service.type` as free strings; this
//! is the single place they become closed enums. A bad value is rejected with
//! a [`Error::Validation`] naming the field, never coerced.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::controller::helpers::controller_owner_ref;
use crate::crd::nginx_ingress_controller::{NginxIngressController, ServicePortOverride};
use crate::error::{Error, Result};
use crate::helpers::{non_blank, OperatorDefaults};

/// Container image pull policy, as defined by Kubernetes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

impl PullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::IfNotPresent => "IfNotPresent",
            Self::Never => "Never",
        }
    }
}

impl FromStr for PullPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Always" => Ok(Self::Always),
            "IfNotPresent" => Ok(Self::IfNotPresent),
            "Never" => Ok(Self::Never),
            other => Err(format!("image pull policy {other:?} not valid")),
        }
    }
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported Service types for the controller endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServiceType {
    #[default]
    NodePort,
    LoadBalancer,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NodePort => "NodePort",
            Self::LoadBalancer => "LoadBalancer",
        }
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NodePort" => Ok(Self::NodePort),
            "LoadBalancer" => Ok(Self::LoadBalancer),
            other => Err(format!("service type {other:?} not valid")),
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image {
    pub repository: String,
    pub tag: String,
    pub pull_policy: PullPolicy,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServiceSettings {
    pub service_type: ServiceType,
    pub extra_labels: BTreeMap<String, String>,
    pub extra_annotations: BTreeMap<String, String>,
    pub ports: Vec<ServicePortOverride>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkloadSettings {
    pub resources: ResourceRequirements,
    pub extra_labels: BTreeMap<String, String>,
}

/// A fully-defaulted, validated view of one NginxIngressController.
/// Every desired-state generator takes this and nothing else.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedController {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner: OwnerReference,

    pub image: Image,
    pub replicas: i32,
    pub ingress_class: String,
    pub watch_namespace: Option<String>,
    pub service: ServiceSettings,
    pub workload: WorkloadSettings,
    pub config_map_data: BTreeMap<String, String>,
}

/// Absent or blank selects the default. Anything else must match a variant
/// exactly, surrounding whitespace included.
fn parse_enum<T>(raw: Option<&str>, field: &str) -> Result<T>
where
    T: FromStr<Err = String> + Default,
{
    match raw {
        None => Ok(T::default()),
        Some(raw) if raw.trim().is_empty() => Ok(T::default()),
        Some(raw) => raw.parse().map_err(|msg| Error::validation(field, msg)),
    }
}

/// Fill defaults from `defaults` and validate. Pure: touches nothing but the
/// returned value.
pub fn normalize(
    instance: &NginxIngressController,
    defaults: &OperatorDefaults,
) -> Result<NormalizedController> {
    let spec = &instance.spec;

    let pull_policy: PullPolicy =
        parse_enum(spec.image.pull_policy.as_deref(), "spec.image.pullPolicy")?;
    let image = Image {
        repository: non_blank(spec.image.repository.as_deref())
            .unwrap_or(&defaults.image_repository)
            .to_string(),
        tag: non_blank(spec.image.tag.as_deref())
            .unwrap_or(&defaults.image_tag)
            .to_string(),
        pull_policy,
    };

    let replicas = spec.replicas.unwrap_or(1);
    if replicas < 0 {
        return Err(Error::validation(
            "spec.replicas",
            format!("replica count {replicas} must not be negative"),
        ));
    }

    let service_spec = spec.service.clone().unwrap_or_default();
    let service_type: ServiceType =
        parse_enum(service_spec.type_.as_deref(), "spec.service.type")?;
    let service = ServiceSettings {
        service_type,
        extra_labels: service_spec.extra_labels.unwrap_or_default(),
        extra_annotations: service_spec.extra_annotations.unwrap_or_default(),
        ports: service_spec.ports,
    };

    let workload_spec = spec.workload.clone().unwrap_or_default();
    let workload = WorkloadSettings {
        resources: workload_spec.resources.unwrap_or_default(),
        extra_labels: workload_spec.extra_labels.unwrap_or_default(),
    };

    let ingress_class = non_blank(spec.ingress_class.as_deref())
        .unwrap_or(&defaults.ingress_class)
        .to_string();

    Ok(NormalizedController {
        name: instance.name_any(),
        namespace: instance.namespace().unwrap_or_default(),
        labels: instance.labels().clone(),
        annotations: instance.annotations().clone(),
        owner: controller_owner_ref(instance),
        image,
        replicas,
        ingress_class,
        watch_namespace: non_blank(spec.watch_namespace.as_deref()).map(str::to_string),
        service,
        workload,
        config_map_data: spec.config_map_data.clone().unwrap_or_default(),
    })
}
