//! Child resource helpers: desired-state generators and ensure_* functions
//! for the per-instance objects.
//!
//! Generators are pure `(NormalizedController) -> object` functions. The
//! ensure_* functions converge one object each and report what they did.
//! They run every reconcile pass, after the shared RBAC bootstrap.

use std::collections::BTreeMap;

use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentSpec},
    core::v1::{
        ConfigMap, Container, ContainerPort, ExecAction, HTTPGetAction, Lifecycle,
        LifecycleHandler, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, Service,
        ServiceAccount, ServicePort, ServiceSpec,
    },
    networking::v1::{IngressClass, IngressClassSpec},
};
use k8s_openapi::apimachinery::pkg::{
    apis::meta::v1::LabelSelector, util::intstr::IntOrString,
};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::cluster::{describe, Cluster, Managed};
use crate::crd::nginx_ingress_controller::ServicePortOverride;
use crate::error::Result;
use crate::helpers::{generate_image, merge_labels, non_empty};
use crate::normalize::NormalizedController;

use super::diff;
use super::helpers::{
    app_selector, env, field_env, is_owned_by, nginx_security_context, owner_labels,
};

/// Path of the controller binary inside the ingress-nginx image.
pub const CONTROLLER_BINARY: &str = "/nginx-ingress-controller";
/// Prefix of the `--controller-class` value; the ingress class is appended.
pub const CONTROLLER_CLASS_PREFIX: &str = "ingress-operator.io/ingress-nginx-";

const METRICS_PORT: i32 = 10254;

/// What an ensure_* call did to the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Created,
    Updated,
    Unchanged,
}

// ── Naming ───────────────────────────────────────────────────────────────────

pub fn controller_class(ingress_class: &str) -> String {
    format!("{CONTROLLER_CLASS_PREFIX}{ingress_class}")
}

/// Container arguments in fixed order. `--watch-namespace` is appended only
/// when a namespace filter is set.
pub fn pod_args(n: &NormalizedController) -> Vec<String> {
    let name = &n.name;
    let mut args = vec![
        CONTROLLER_BINARY.to_string(),
        format!("--publish-service=$(POD_NAMESPACE)/{name}"),
        format!("--configmap=$(POD_NAMESPACE)/{name}"),
        format!("--election-id={name}-lock"),
        format!("--ingress-class={}", n.ingress_class),
        format!("--controller-class={}", controller_class(&n.ingress_class)),
    ];
    if let Some(ns) = &n.watch_namespace {
        args.push(format!("--watch-namespace={ns}"));
    }
    args
}

fn object_meta(n: &NormalizedController) -> ObjectMeta {
    ObjectMeta {
        name: Some(n.name.clone()),
        namespace: Some(n.namespace.clone()),
        owner_references: Some(vec![n.owner.clone()]),
        ..Default::default()
    }
}

/// `None` for empty requirements, matching what the API server returns for
/// an unset field.
fn resources_or_none(resources: &ResourceRequirements) -> Option<ResourceRequirements> {
    if *resources == ResourceRequirements::default() {
        None
    } else {
        Some(resources.clone())
    }
}

// ── Deployment ───────────────────────────────────────────────────────────────

pub fn deployment_for(n: &NormalizedController) -> Deployment {
    let health_probe = |failure_threshold: i32| Probe {
        failure_threshold: Some(failure_threshold),
        initial_delay_seconds: Some(10),
        http_get: Some(HTTPGetAction {
            path: Some("/healthz".to_string()),
            port: IntOrString::Int(METRICS_PORT),
            ..Default::default()
        }),
        ..Default::default()
    };
    let port = |name: &str, container_port: i32| ContainerPort {
        name: Some(name.to_string()),
        container_port,
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            labels: non_empty(n.workload.extra_labels.clone()),
            ..object_meta(n)
        },
        spec: Some(DeploymentSpec {
            replicas: Some(n.replicas),
            selector: LabelSelector {
                match_labels: Some(app_selector(&n.name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(template_labels(n)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(n.name.clone()),
                    containers: vec![Container {
                        name: n.name.clone(),
                        image: Some(generate_image(&n.image.repository, &n.image.tag)),
                        image_pull_policy: Some(n.image.pull_policy.to_string()),
                        args: Some(pod_args(n)),
                        ports: Some(vec![
                            port("http", 80),
                            port("https", 443),
                            port("metrics", METRICS_PORT),
                        ]),
                        security_context: Some(nginx_security_context()),
                        env: Some(vec![
                            field_env("POD_NAMESPACE", "metadata.namespace"),
                            field_env("POD_NAME", "metadata.name"),
                            env("LD_PRELOAD", "/usr/local/lib/libmimalloc.so"),
                        ]),
                        resources: resources_or_none(&n.workload.resources),
                        lifecycle: Some(Lifecycle {
                            pre_stop: Some(LifecycleHandler {
                                exec: Some(ExecAction {
                                    command: Some(vec!["/wait-shutdown".to_string()]),
                                }),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        liveness_probe: Some(health_probe(5)),
                        readiness_probe: Some(health_probe(3)),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Pod template labels: the selector plus the workload's extra labels.
pub fn template_labels(n: &NormalizedController) -> BTreeMap<String, String> {
    merge_labels(&app_selector(&n.name), &n.workload.extra_labels)
}

/// Create the Deployment if absent, otherwise update it only when a tracked
/// field drifted.
pub async fn ensure_deployment<C: Cluster>(
    cluster: &C,
    n: &NormalizedController,
) -> Result<Operation> {
    match cluster
        .get::<Deployment>(Some(n.namespace.as_str()), &n.name)
        .await?
    {
        None => match cluster.create(&deployment_for(n)).await {
            Ok(_) => {
                info!(name = %n.name, ns = %n.namespace, "created Deployment");
                Ok(Operation::Created)
            }
            // Created by a concurrent pass; the next pass diffs it.
            Err(e) if e.is_already_exists() => Ok(Operation::Unchanged),
            Err(e) => Err(e),
        },
        Some(observed) if diff::deployment_changed(&observed, n) => {
            info!(name = %n.name, ns = %n.namespace, "updating drifted Deployment");
            cluster.replace(&diff::update_deployment(observed, n)).await?;
            Ok(Operation::Updated)
        }
        Some(_) => {
            debug!(name = %n.name, ns = %n.namespace, "Deployment up to date");
            Ok(Operation::Unchanged)
        }
    }
}

// ── Service ──────────────────────────────────────────────────────────────────

fn base_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        protocol: Some("TCP".to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        ..Default::default()
    }
}

fn apply_override(mut port: ServicePort, o: &ServicePortOverride) -> ServicePort {
    if let Some(protocol) = &o.protocol {
        port.protocol = Some(protocol.clone());
    }
    if let Some(p) = o.port {
        port.port = p;
    }
    if let Some(target) = &o.target_port {
        port.target_port = Some(target.clone());
    }
    if let Some(node_port) = o.node_port {
        port.node_port = Some(node_port);
    }
    port
}

/// Merge port overrides into `current`, keyed by name.
///
/// The `http` (80) and `https` (443) base ports are added when missing. A
/// matching override replaces only the fields it sets; an unmatched one is
/// appended as a new port. Fields the cluster filled in on `current` (such
/// as allocated node ports) survive unless overridden.
pub fn merge_ports(current: &[ServicePort], overrides: &[ServicePortOverride]) -> Vec<ServicePort> {
    let mut ports = current.to_vec();
    for (name, port) in [("http", 80), ("https", 443)] {
        if !ports.iter().any(|p| p.name.as_deref() == Some(name)) {
            ports.push(base_port(name, port));
        }
    }
    for o in overrides {
        match ports
            .iter()
            .position(|p| p.name.as_deref() == Some(o.name.as_str()))
        {
            Some(i) => {
                let merged = apply_override(ports[i].clone(), o);
                ports[i] = merged;
            }
            None => ports.push(apply_override(
                ServicePort {
                    name: Some(o.name.clone()),
                    ..Default::default()
                },
                o,
            )),
        }
    }
    ports
}

/// Bring `svc` to the desired Service state without touching fields the
/// operator does not manage (clusterIP, allocated node ports, ...).
pub fn mutate_service(svc: &mut Service, n: &NormalizedController) {
    svc.metadata.labels = non_empty(merge_labels(&n.labels, &n.service.extra_labels));
    svc.metadata.annotations = non_empty(merge_labels(
        &n.annotations,
        &n.service.extra_annotations,
    ));
    svc.metadata.owner_references = Some(vec![n.owner.clone()]);

    let spec = svc.spec.get_or_insert_with(ServiceSpec::default);
    spec.selector = Some(app_selector(&n.name));
    spec.type_ = Some(n.service.service_type.to_string());
    let current = spec.ports.take().unwrap_or_default();
    spec.ports = Some(merge_ports(&current, &n.service.ports));
}

pub fn service_for(n: &NormalizedController) -> Service {
    let mut svc = Service {
        metadata: object_meta(n),
        ..Default::default()
    };
    mutate_service(&mut svc, n);
    svc
}

pub async fn ensure_service<C: Cluster>(cluster: &C, n: &NormalizedController) -> Result<Operation> {
    create_or_update(cluster, &n.namespace, &n.name, |svc: &mut Service| {
        mutate_service(svc, n)
    })
    .await
}

// ── ConfigMap ────────────────────────────────────────────────────────────────

pub fn mutate_config_map(cm: &mut ConfigMap, n: &NormalizedController) {
    cm.metadata.owner_references = Some(vec![n.owner.clone()]);
    cm.data = non_empty(n.config_map_data.clone());
}

pub fn config_map_for(n: &NormalizedController) -> ConfigMap {
    let mut cm = ConfigMap {
        metadata: object_meta(n),
        ..Default::default()
    };
    mutate_config_map(&mut cm, n);
    cm
}

pub async fn ensure_config_map<C: Cluster>(
    cluster: &C,
    n: &NormalizedController,
) -> Result<Operation> {
    create_or_update(cluster, &n.namespace, &n.name, |cm: &mut ConfigMap| {
        mutate_config_map(cm, n)
    })
    .await
}

// ── ServiceAccount / IngressClass ────────────────────────────────────────────

pub fn service_account_for(n: &NormalizedController) -> ServiceAccount {
    ServiceAccount {
        metadata: object_meta(n),
        ..Default::default()
    }
}

/// Cluster-scoped, so it carries owner labels instead of an owner reference.
pub fn ingress_class_for(n: &NormalizedController) -> IngressClass {
    IngressClass {
        metadata: ObjectMeta {
            name: Some(n.name.clone()),
            labels: Some(owner_labels(&n.namespace, &n.name)),
            ..Default::default()
        },
        spec: Some(IngressClassSpec {
            controller: Some(controller_class(&n.ingress_class)),
            parameters: None,
        }),
    }
}

pub async fn ensure_service_account<C: Cluster>(
    cluster: &C,
    n: &NormalizedController,
) -> Result<Operation> {
    create_if_absent(cluster, &service_account_for(n)).await
}

pub async fn ensure_ingress_class<C: Cluster>(
    cluster: &C,
    n: &NormalizedController,
) -> Result<Operation> {
    create_if_absent(cluster, &ingress_class_for(n)).await
}

/// Delete the instance's IngressClass unless it is labelled as belonging to
/// a different instance. An absent class is not an error.
pub async fn delete_ingress_class<C: Cluster>(
    cluster: &C,
    namespace: &str,
    name: &str,
) -> Result<()> {
    let Some(class) = cluster.get::<IngressClass>(None, name).await? else {
        debug!(%name, "IngressClass already absent");
        return Ok(());
    };
    let labels = class.labels();
    if !labels.is_empty() && !is_owned_by(labels, namespace, name) {
        debug!(%name, "IngressClass belongs to another owner, leaving it");
        return Ok(());
    }
    match cluster.delete::<IngressClass>(None, name).await {
        Ok(()) => {
            info!(%name, "deleted IngressClass");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

// ── Generic create/update plumbing ───────────────────────────────────────────

/// Create `obj` unless an object of that name already exists. A lost create
/// race (AlreadyExists) counts as success.
pub async fn create_if_absent<C: Cluster, K: Managed>(cluster: &C, obj: &K) -> Result<Operation> {
    let ns = obj.namespace();
    let name = obj.name_any();
    if cluster.get::<K>(ns.as_deref(), &name).await?.is_some() {
        return Ok(Operation::Unchanged);
    }
    match cluster.create(obj).await {
        Ok(_) => {
            info!(object = %describe::<K>(ns.as_deref(), &name), "created");
            Ok(Operation::Created)
        }
        Err(e) if e.is_already_exists() => Ok(Operation::Unchanged),
        Err(e) => Err(e),
    }
}

/// Fetch `namespace/name`, run `mutate` over it (or over a fresh object when
/// absent) and write the result back only if it changed.
pub async fn create_or_update<C, K, F>(
    cluster: &C,
    namespace: &str,
    name: &str,
    mutate: F,
) -> Result<Operation>
where
    C: Cluster,
    K: Managed + Default + PartialEq,
    F: Fn(&mut K),
{
    let what = describe::<K>(Some(namespace), name);
    match cluster.get::<K>(Some(namespace), name).await? {
        None => {
            let mut obj = K::default();
            obj.meta_mut().name = Some(name.to_string());
            obj.meta_mut().namespace = Some(namespace.to_string());
            mutate(&mut obj);
            match cluster.create(&obj).await {
                Ok(_) => {
                    info!(object = %what, "created");
                    Ok(Operation::Created)
                }
                Err(e) if e.is_already_exists() => {
                    debug!(object = %what, "created concurrently");
                    Ok(Operation::Unchanged)
                }
                Err(e) => Err(e),
            }
        }
        Some(observed) => {
            let mut desired = observed.clone();
            mutate(&mut desired);
            if desired == observed {
                debug!(object = %what, "up to date");
                return Ok(Operation::Unchanged);
            }
            cluster.replace(&desired).await?;
            info!(object = %what, "updated");
            Ok(Operation::Updated)
        }
    }
}
