//! nginx-ingress-operator: converges `NginxIngressController` resources into
//! ingress-nginx Deployments, Services and ConfigMaps, and keeps one shared
//! ClusterRoleBinding listing the ServiceAccount of every live instance.

pub mod cluster;
pub mod controller;
pub mod crd;
pub mod error;
pub mod helpers;
pub mod normalize;
pub mod retry;
