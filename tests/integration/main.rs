//! Integration tests driving the full reconcile pass against `MemoryCluster`.
//!
//! Each submodule tests a specific area of concern. The shared harness and
//! helpers live in `common.rs`.
//!
//! Run with: `cargo test --test integration`

mod common;

mod finalizer;
mod rbac;
