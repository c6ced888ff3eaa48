//! Drift detection for the controller Deployment.
//!
//! Only a fixed set of fields is tracked: replicas, image, pull policy,
//! Deployment labels, container resources and container args. Anything else
//! on the live object (status, defaults the API server filled in, fields
//! other controllers own) is left alone.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;

use crate::helpers::{generate_image, non_empty, parse_quantity};
use crate::normalize::NormalizedController;

use super::child_resources::{deployment_for, pod_args, template_labels};

fn first_container(dep: &Deployment) -> Option<&Container> {
    dep.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
}

/// Quantities compared by value, so `"1"` equals `"1000m"`. A quantity that
/// does not parse is compared as a string.
fn quantity_eq(a: Option<&Quantity>, b: Option<&Quantity>) -> bool {
    let zero = Quantity("0".to_string());
    let a = a.unwrap_or(&zero);
    let b = b.unwrap_or(&zero);
    match (parse_quantity(&a.0), parse_quantity(&b.0)) {
        (Ok(x), Ok(y)) => x == y,
        _ => a.0.trim() == b.0.trim(),
    }
}

fn quantities_eq(
    a: Option<&BTreeMap<String, Quantity>>,
    b: Option<&BTreeMap<String, Quantity>>,
) -> bool {
    let empty = BTreeMap::new();
    let a = a.unwrap_or(&empty);
    let b = b.unwrap_or(&empty);
    a.keys()
        .chain(b.keys())
        .all(|k| quantity_eq(a.get(k), b.get(k)))
}

/// Semantic equality of resource requirements: every resource name in
/// either side's requests and limits must carry the same quantity, with a
/// missing entry counting as zero.
pub fn resources_equal(
    observed: Option<&ResourceRequirements>,
    desired: &ResourceRequirements,
) -> bool {
    let empty = ResourceRequirements::default();
    let observed = observed.unwrap_or(&empty);
    quantities_eq(observed.requests.as_ref(), desired.requests.as_ref())
        && quantities_eq(observed.limits.as_ref(), desired.limits.as_ref())
}

/// True when any tracked field of `observed` differs from what `n` asks for.
pub fn deployment_changed(observed: &Deployment, n: &NormalizedController) -> bool {
    let replicas = observed
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    if replicas != n.replicas {
        return true;
    }

    let Some(container) = first_container(observed) else {
        return true;
    };
    if container.image.as_deref() != Some(generate_image(&n.image.repository, &n.image.tag).as_str())
    {
        return true;
    }
    if container.image_pull_policy.as_deref() != Some(n.image.pull_policy.as_str()) {
        return true;
    }

    let labels = observed.metadata.labels.clone().unwrap_or_default();
    if labels != n.workload.extra_labels {
        return true;
    }

    if !resources_equal(container.resources.as_ref(), &n.workload.resources) {
        return true;
    }

    container.args.as_deref().unwrap_or_default() != pod_args(n).as_slice()
}

/// Write the recomputed tracked fields onto `observed`, keeping everything
/// else (resourceVersion, status, server defaults) as it was.
pub fn update_deployment(mut observed: Deployment, n: &NormalizedController) -> Deployment {
    let desired = deployment_for(n);
    let Some(desired_spec) = desired.spec else {
        return observed;
    };

    observed.metadata.labels = non_empty(n.workload.extra_labels.clone());

    let spec = observed.spec.get_or_insert_with(|| desired_spec.clone());
    spec.replicas = Some(n.replicas);
    spec.template
        .metadata
        .get_or_insert_with(ObjectMeta::default)
        .labels = Some(template_labels(n));

    let pod = spec
        .template
        .spec
        .get_or_insert_with(|| desired_spec.template.spec.clone().unwrap_or_default());
    match pod.containers.first_mut() {
        Some(container) => {
            container.image = Some(generate_image(&n.image.repository, &n.image.tag));
            container.image_pull_policy = Some(n.image.pull_policy.to_string());
            container.args = Some(pod_args(n));
            container.resources = if n.workload.resources == ResourceRequirements::default() {
                None
            } else {
                Some(n.workload.resources.clone())
            };
        }
        None => {
            pod.containers = desired_spec
                .template
                .spec
                .map(|p| p.containers)
                .unwrap_or_default();
        }
    }
    observed
}
