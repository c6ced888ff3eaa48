//! Shared test harness and helpers.
//!
//! Every test builds its own `MemoryCluster`, so tests are isolated and can
//! run in parallel. Namespaces are seeded explicitly because the reconciler
//! refuses to converge into a missing one.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Namespace, NamespaceStatus};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::api::ObjectMeta;
use tracing_subscriber::EnvFilter;

use nginx_ingress_operator::cluster::{Cluster, MemoryCluster};
use nginx_ingress_operator::controller::nginx_ingress_controller::{
    reconcile_once, Context, Outcome,
};
use nginx_ingress_operator::controller::rbac::CLUSTER_ROLE_NAME;
use nginx_ingress_operator::crd::nginx_ingress_controller::{
    NginxIngressController, NginxIngressControllerSpec,
};
use nginx_ingress_operator::error::Result;
use nginx_ingress_operator::helpers::OperatorDefaults;
use nginx_ingress_operator::retry::RetryPolicy;

/// Short backoff so conflict-heavy tests stay fast; enough attempts that a
/// handful of concurrent writers plus injected conflicts never exhaust it.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        attempts: 32,
        backoff: Duration::from_millis(1),
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn,nginx_ingress_operator=debug"))
        .with_test_writer()
        .try_init();
}

pub fn namespace(name: &str, phase: Option<&str>) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: phase.map(|p| NamespaceStatus {
            phase: Some(p.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn instance(ns: &str, name: &str, spec: NginxIngressControllerSpec) -> NginxIngressController {
    NginxIngressController {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

/// One cluster plus the reconcile context wrapped around it.
pub struct TestContext {
    pub ctx: Arc<Context<MemoryCluster>>,
}

impl TestContext {
    pub fn new() -> Self {
        init_tracing();
        let mut ctx = Context::new(MemoryCluster::new(), OperatorDefaults::default());
        ctx.retry = fast_retry();
        ctx.reconcile_timeout = Duration::from_secs(10);
        Self { ctx: Arc::new(ctx) }
    }

    /// Change the per-pass timeout. Only valid while no pass holds the context.
    pub fn set_timeout(&mut self, timeout: Duration) {
        Arc::get_mut(&mut self.ctx)
            .expect("context is shared")
            .reconcile_timeout = timeout;
    }

    pub fn cluster(&self) -> &MemoryCluster {
        &self.ctx.cluster
    }

    /// Seed an active namespace.
    pub fn namespace(&self, ns: &str) {
        self.cluster().seed(namespace(ns, Some("Active"))).unwrap();
    }

    /// Seed an instance as if a user had just applied it.
    pub fn create(&self, ns: &str, name: &str, spec: NginxIngressControllerSpec) {
        self.cluster().seed(instance(ns, name, spec)).unwrap();
    }

    pub async fn reconcile(&self, ns: &str, name: &str) -> Result<Outcome> {
        reconcile_once(self.ctx.as_ref(), ns, name).await
    }

    pub async fn delete(&self, ns: &str, name: &str) {
        self.cluster()
            .delete::<NginxIngressController>(Some(ns), name)
            .await
            .unwrap();
    }

    /// Replace the stored spec, as a user edit would.
    pub async fn edit(&self, ns: &str, name: &str, edit: impl FnOnce(&mut NginxIngressControllerSpec)) {
        let mut current: NginxIngressController =
            self.cluster().object(Some(ns), name).unwrap();
        edit(&mut current.spec);
        self.cluster().replace(&current).await.unwrap();
    }

    pub fn instance(&self, ns: &str, name: &str) -> Option<NginxIngressController> {
        self.cluster().object(Some(ns), name)
    }

    /// Subjects of the shared binding as (namespace, name) pairs.
    pub fn subjects(&self) -> Vec<(String, String)> {
        self.cluster()
            .object::<ClusterRoleBinding>(None, CLUSTER_ROLE_NAME)
            .and_then(|b| b.subjects)
            .unwrap_or_default()
            .into_iter()
            .map(|s| (s.namespace.unwrap_or_default(), s.name))
            .collect()
    }

    pub fn subject_set(&self) -> BTreeSet<(String, String)> {
        self.subjects().into_iter().collect()
    }
}
