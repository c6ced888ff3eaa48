//! In-memory [`Cluster`] used by the test suite.
//!
//! Models the parts of API server behaviour the reconciler depends on:
//! resourceVersion checks on replace, AlreadyExists on create, deletion
//! timestamps while finalizers remain, owner-reference garbage collection and
//! status preserved across spec replaces. Conflicts, transient failures and
//! stalled reads can be injected per kind.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde_json::{json, Value};

use super::{describe, Cluster, Managed};
use crate::crd::nginx_ingress_controller::NginxIngressController;
use crate::error::{Error, Result};

type Key = (String, String, String);

/// An event recorded by [`MemoryCluster::publish_event`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub object: String,
    pub warning: bool,
    pub reason: String,
    pub note: Option<String>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    revision: u64,
    mutations: u64,
    conflicts: BTreeMap<String, u32>,
    failures: BTreeMap<String, u32>,
    stalls: BTreeMap<String, u32>,
    events: Vec<RecordedEvent>,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn take(counter: &mut BTreeMap<String, u32>, kind: &str) -> bool {
        match counter.get_mut(kind) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    /// Remove an object and, transitively, everything it owns.
    fn remove_cascading(&mut self, key: &Key) {
        let mut gone: BTreeSet<String> = BTreeSet::new();
        if let Some(obj) = self.objects.remove(key) {
            if let Some(uid) = obj.pointer("/metadata/uid").and_then(Value::as_str) {
                gone.insert(uid.to_string());
            }
        }
        while !gone.is_empty() {
            let orphans: Vec<Key> = self
                .objects
                .iter()
                .filter(|(_, obj)| owner_uids(obj).iter().any(|uid| gone.contains(uid)))
                .map(|(k, _)| k.clone())
                .collect();
            gone.clear();
            for k in orphans {
                if let Some(obj) = self.objects.remove(&k) {
                    if let Some(uid) = obj.pointer("/metadata/uid").and_then(Value::as_str) {
                        gone.insert(uid.to_string());
                    }
                }
            }
        }
    }
}

fn owner_uids(obj: &Value) -> Vec<String> {
    obj.pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .map(|refs| {
            refs.iter()
                .filter_map(|r| r.get("uid").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn has_finalizers(obj: &Value) -> bool {
    obj.pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .is_some_and(|f| !f.is_empty())
}

fn resource_version(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
}

fn key_for<K: Managed>(namespace: Option<&str>, name: &str) -> Key {
    (
        K::kind(&()).to_string(),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

fn unavailable(what: String) -> Error {
    Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("injected failure for {what}"),
        reason: "ServiceUnavailable".to_string(),
        code: 503,
    }))
}

/// Thread-safe in-memory object store implementing [`Cluster`].
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an object as pre-existing cluster state. Not counted as a mutation.
    pub fn seed<K: Managed>(&self, obj: K) -> Result<K> {
        let mut state = self.lock();
        let key = key_for::<K>(obj.meta().namespace.as_deref(), &obj.name_any());
        let mut value = serde_json::to_value(&obj)?;
        let rv = state.next_revision();
        if value.pointer("/metadata/uid").is_none() {
            value["metadata"]["uid"] = json!(format!("uid-{rv}"));
        }
        value["metadata"]["resourceVersion"] = json!(rv);
        state.objects.insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    /// Read an object back for assertions.
    pub fn object<K: Managed>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        self.lock()
            .objects
            .get(&key_for::<K>(namespace, name))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// All stored objects of one kind.
    pub fn list<K: Managed>(&self) -> Vec<K> {
        let kind = K::kind(&()).to_string();
        self.lock()
            .objects
            .iter()
            .filter(|((k, _, _), _)| *k == kind)
            .filter_map(|(_, v)| serde_json::from_value(v.clone()).ok())
            .collect()
    }

    /// Number of successful writes since construction.
    pub fn mutations(&self) -> u64 {
        self.lock().mutations
    }

    /// Make the next `n` replaces of kind `K` fail with a conflict.
    pub fn inject_conflicts<K: Managed>(&self, n: u32) {
        *self
            .lock()
            .conflicts
            .entry(K::kind(&()).to_string())
            .or_default() += n;
    }

    /// Make the next `n` writes of kind `K` fail with a 503.
    pub fn inject_failures<K: Managed>(&self, n: u32) {
        *self
            .lock()
            .failures
            .entry(K::kind(&()).to_string())
            .or_default() += n;
    }

    /// Make the next `n` reads of kind `K` never complete.
    pub fn inject_stalls<K: Managed>(&self, n: u32) {
        *self
            .lock()
            .stalls
            .entry(K::kind(&()).to_string())
            .or_default() += n;
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.lock().events.clone()
    }
}

#[async_trait]
impl Cluster for MemoryCluster {
    async fn get<K: Managed>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        tokio::task::yield_now().await;
        let stalled = State::take(&mut self.lock().stalls, &K::kind(&()));
        if stalled {
            std::future::pending::<()>().await;
        }
        let value = self
            .lock()
            .objects
            .get(&key_for::<K>(namespace, name))
            .cloned();
        match value {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    async fn create<K: Managed>(&self, obj: &K) -> Result<K> {
        tokio::task::yield_now().await;
        let ns = obj.meta().namespace.clone();
        let name = obj.name_any();
        let what = describe::<K>(ns.as_deref(), &name);
        let key = key_for::<K>(ns.as_deref(), &name);

        let mut state = self.lock();
        if State::take(&mut state.failures, &key.0) {
            return Err(unavailable(what));
        }
        if state.objects.contains_key(&key) {
            return Err(Error::AlreadyExists(what));
        }
        let mut value = serde_json::to_value(obj)?;
        let rv = state.next_revision();
        if value.pointer("/metadata/uid").is_none() {
            value["metadata"]["uid"] = json!(format!("uid-{rv}"));
        }
        value["metadata"]["resourceVersion"] = json!(rv);
        state.objects.insert(key, value.clone());
        state.mutations += 1;
        Ok(serde_json::from_value(value)?)
    }

    async fn replace<K: Managed>(&self, obj: &K) -> Result<K> {
        tokio::task::yield_now().await;
        let ns = obj.meta().namespace.clone();
        let name = obj.name_any();
        let what = describe::<K>(ns.as_deref(), &name);
        let key = key_for::<K>(ns.as_deref(), &name);

        let mut state = self.lock();
        if State::take(&mut state.failures, &key.0) {
            return Err(unavailable(what));
        }
        let Some(stored) = state.objects.get(&key).cloned() else {
            return Err(Error::NotFound(what));
        };
        if State::take(&mut state.conflicts, &key.0) {
            return Err(Error::Conflict(what));
        }
        let mut value = serde_json::to_value(obj)?;
        if let Some(incoming) = resource_version(&value) {
            if Some(incoming) != resource_version(&stored) {
                return Err(Error::Conflict(what));
            }
        }

        // Server-owned fields survive a spec replace.
        value["metadata"]["uid"] = stored["metadata"]["uid"].clone();
        match stored.get("status") {
            Some(status) => value["status"] = status.clone(),
            None => {
                if let Some(map) = value.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        if let Some(ts) = stored.pointer("/metadata/deletionTimestamp") {
            value["metadata"]["deletionTimestamp"] = ts.clone();
            if !has_finalizers(&value) {
                state.remove_cascading(&key);
                state.mutations += 1;
                return Ok(serde_json::from_value(value)?);
            }
        }

        let rv = state.next_revision();
        value["metadata"]["resourceVersion"] = json!(rv);
        state.objects.insert(key, value.clone());
        state.mutations += 1;
        Ok(serde_json::from_value(value)?)
    }

    async fn delete<K: Managed>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        tokio::task::yield_now().await;
        let what = describe::<K>(namespace, name);
        let key = key_for::<K>(namespace, name);

        let mut state = self.lock();
        if State::take(&mut state.failures, &key.0) {
            return Err(unavailable(what));
        }
        let Some(stored) = state.objects.get(&key).cloned() else {
            return Err(Error::NotFound(what));
        };
        if has_finalizers(&stored) {
            if stored.pointer("/metadata/deletionTimestamp").is_none() {
                let mut value = stored;
                value["metadata"]["deletionTimestamp"] = serde_json::to_value(Time(Utc::now()))?;
                value["metadata"]["resourceVersion"] = json!(state.next_revision());
                state.objects.insert(key, value);
                state.mutations += 1;
            }
            return Ok(());
        }
        state.remove_cascading(&key);
        state.mutations += 1;
        Ok(())
    }

    async fn patch_status<K: Managed>(
        &self,
        namespace: Option<&str>,
        name: &str,
        status: Value,
    ) -> Result<()> {
        tokio::task::yield_now().await;
        let what = describe::<K>(namespace, name);
        let key = key_for::<K>(namespace, name);

        let mut state = self.lock();
        if State::take(&mut state.failures, &key.0) {
            return Err(unavailable(what));
        }
        let rv = state.next_revision();
        let Some(stored) = state.objects.get_mut(&key) else {
            return Err(Error::NotFound(what));
        };
        let mut merged = stored.get("status").cloned().unwrap_or_else(|| json!({}));
        if let (Some(into), Some(from)) = (merged.as_object_mut(), status.as_object()) {
            for (k, v) in from {
                into.insert(k.clone(), v.clone());
            }
        }
        stored["status"] = merged;
        stored["metadata"]["resourceVersion"] = json!(rv);
        state.mutations += 1;
        Ok(())
    }

    async fn publish_event(
        &self,
        instance: &NginxIngressController,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        let object = describe::<NginxIngressController>(
            instance.meta().namespace.as_deref(),
            &instance.name_any(),
        );
        self.lock().events.push(RecordedEvent {
            object,
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            note,
        });
    }
}
