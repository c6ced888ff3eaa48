pub mod child_resources;
pub mod diff;
pub mod finalizer;
pub mod helpers;
pub mod nginx_ingress_controller;
pub mod rbac;
