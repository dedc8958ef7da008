//! In-memory repositories for tests
//!
//! `MemoryPodRepository` mimics the API server's optimistic concurrency:
//! every write bumps `resourceVersion` and a replace carrying a stale version
//! is rejected with `Conflict`. It also records every value the order
//! annotation has taken.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionCondition, CustomResourceDefinitionStatus,
};
use kube::core::ErrorResponse;
use ordertask_core::domain::task::OrderTaskStatus;
use ordertask_core::layout::ORDER_ANNOTATION;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;

use super::tasks::status_patch;
use super::{CrdRepository, PodRepository, TaskRepository};
use crate::error::RepositoryError;

pub fn api_error(code: u16, reason: &str) -> RepositoryError {
    RepositoryError::Api(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("injected {}", reason),
        reason: reason.to_string(),
        code,
    }))
}

fn marker_of(pod: &Pod) -> Option<String> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ORDER_ANNOTATION))
        .cloned()
}

type Key = (String, String);

#[derive(Default)]
struct PodState {
    pods: HashMap<Key, Pod>,
    version: u64,
    create_calls: u32,
    hidden_gets: u32,
    conflicts: u32,
    history: HashMap<Key, Vec<String>>,
}

impl PodState {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

#[derive(Default)]
pub struct MemoryPodRepository {
    state: Mutex<PodState>,
}

impl MemoryPodRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(namespace: &str, name: &str) -> Key {
        (namespace.to_string(), name.to_string())
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.state
            .lock()
            .unwrap()
            .pods
            .get(&Self::key(namespace, name))
            .cloned()
    }

    pub fn pod_count(&self) -> usize {
        self.state.lock().unwrap().pods.len()
    }

    pub fn create_calls(&self) -> u32 {
        self.state.lock().unwrap().create_calls
    }

    /// Every value the order annotation has held, in write order
    pub fn marker_history(&self, namespace: &str, name: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .history
            .get(&Self::key(namespace, name))
            .cloned()
            .unwrap_or_default()
    }

    /// Makes the next `count` gets report the pod as missing
    pub fn hide_next_gets(&self, count: u32) {
        self.state.lock().unwrap().hidden_gets = count;
    }

    /// Makes the next `count` replaces lose against a concurrent writer
    pub fn inject_conflicts(&self, count: u32) {
        self.state.lock().unwrap().conflicts = count;
    }

    /// Mutates a stored pod the way the kubelet updates status
    pub fn update(&self, namespace: &str, name: &str, f: impl FnOnce(&mut Pod)) {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        if let Some(pod) = state.pods.get_mut(&Self::key(namespace, name)) {
            f(pod);
            pod.metadata.resource_version = Some(version);
        }
    }
}

#[async_trait]
impl PodRepository for MemoryPodRepository {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Pod>, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        if state.hidden_gets > 0 {
            state.hidden_gets -= 1;
            return Ok(None);
        }
        Ok(state.pods.get(&Self::key(namespace, name)).cloned())
    }

    async fn create(&self, namespace: &str, pod: &Pod) -> Result<Pod, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;

        let name = pod.metadata.name.clone().unwrap_or_default();
        let key = Self::key(namespace, &name);
        if state.pods.contains_key(&key) {
            return Err(RepositoryError::AlreadyExists { kind: "Pod", name });
        }

        let mut stored = pod.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.resource_version = Some(state.next_version());
        if let Some(marker) = marker_of(&stored) {
            state.history.entry(key.clone()).or_default().push(marker);
        }
        state.pods.insert(key, stored.clone());
        Ok(stored)
    }

    async fn replace(&self, namespace: &str, pod: &Pod) -> Result<Pod, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let name = pod.metadata.name.clone().unwrap_or_default();
        let key = Self::key(namespace, &name);

        if state.conflicts > 0 {
            state.conflicts -= 1;
            let version = state.next_version();
            if let Some(stored) = state.pods.get_mut(&key) {
                stored.metadata.resource_version = Some(version);
            }
            return Err(RepositoryError::Conflict { kind: "Pod", name });
        }

        let Some(current) = state.pods.get(&key) else {
            return Err(api_error(404, "NotFound"));
        };
        if current.metadata.resource_version != pod.metadata.resource_version {
            return Err(RepositoryError::Conflict { kind: "Pod", name });
        }

        let previous = marker_of(current);
        let mut stored = pod.clone();
        stored.metadata.resource_version = Some(state.next_version());
        let next = marker_of(&stored);
        if next != previous {
            if let Some(marker) = next {
                state.history.entry(key.clone()).or_default().push(marker);
            }
        }
        state.pods.insert(key, stored.clone());
        Ok(stored)
    }
}

/// Task status store applying patches with JSON merge-patch semantics
#[derive(Default)]
pub struct MemoryTaskRepository {
    tasks: Mutex<HashMap<String, Value>>,
    fail: Mutex<bool>,
}

impl MemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_patches(&self) {
        *self.fail.lock().unwrap() = true;
    }

    pub fn last_status(&self, name: &str) -> Option<OrderTaskStatus> {
        let tasks = self.tasks.lock().unwrap();
        let status = tasks.get(name)?.get("status")?.clone();
        Some(serde_json::from_value(status).unwrap())
    }
}

/// RFC 7386 merge: `null` removes a key, objects merge, anything else replaces
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(entries) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(fields) = target {
        for (key, value) in entries {
            if value.is_null() {
                fields.remove(key);
            } else {
                merge_patch(fields.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn patch_status(
        &self,
        _namespace: &str,
        name: &str,
        status: &OrderTaskStatus,
    ) -> Result<(), RepositoryError> {
        if *self.fail.lock().unwrap() {
            return Err(api_error(500, "InternalError"));
        }

        let mut tasks = self.tasks.lock().unwrap();
        let stored = tasks.entry(name.to_string()).or_insert(Value::Null);
        merge_patch(stored, &status_patch(status));
        Ok(())
    }
}

#[derive(Default)]
struct CrdState {
    crds: HashMap<String, CustomResourceDefinition>,
    polls: u32,
    establish_after: Option<u32>,
    fail_delete: bool,
    deletes: u32,
}

/// CRD store whose definitions become Established after a number of polls
#[derive(Default)]
pub struct MemoryCrdRepository {
    state: Mutex<CrdState>,
}

impl MemoryCrdRepository {
    /// Definitions never report Established
    pub fn never_established() -> Self {
        Self::default()
    }

    /// Definitions report Established from the `polls`-th get onwards
    pub fn established_after(polls: u32) -> Self {
        let repo = Self::default();
        repo.state.lock().unwrap().establish_after = Some(polls);
        repo
    }

    pub fn fail_deletes(&self) {
        self.state.lock().unwrap().fail_delete = true;
    }

    pub fn insert(&self, crd: CustomResourceDefinition) {
        let name = crd.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().crds.insert(name, crd);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().unwrap().crds.contains_key(name)
    }

    pub fn deletes(&self) -> u32 {
        self.state.lock().unwrap().deletes
    }
}

#[async_trait]
impl CrdRepository for MemoryCrdRepository {
    async fn create(&self, crd: &CustomResourceDefinition) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let name = crd.metadata.name.clone().unwrap_or_default();
        if state.crds.contains_key(&name) {
            return Err(RepositoryError::AlreadyExists {
                kind: "CustomResourceDefinition",
                name,
            });
        }
        state.crds.insert(name, crd.clone());
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<CustomResourceDefinition>, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        state.polls += 1;
        let established = state.establish_after.is_some_and(|n| state.polls >= n);

        Ok(state.crds.get(name).cloned().map(|mut crd| {
            if established {
                crd.status = Some(CustomResourceDefinitionStatus {
                    conditions: Some(vec![CustomResourceDefinitionCondition {
                        type_: "Established".to_string(),
                        status: "True".to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                });
            }
            crd
        }))
    }

    async fn delete(&self, name: &str) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        state.deletes += 1;
        if state.fail_delete {
            return Err(api_error(500, "InternalError"));
        }
        state.crds.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordertask_core::domain::task::TaskPhase;

    #[tokio::test]
    async fn test_status_patch_clears_absent_fields() {
        let repo = MemoryTaskRepository::new();
        let failed = OrderTaskStatus {
            phase: TaskPhase::Pending,
            current_step: Some(1),
            pod_name: Some("order-task-a".to_string()),
            message: Some("cannot build pod".to_string()),
            ..Default::default()
        };
        repo.patch_status("jobs", "a", &failed).await.unwrap();

        let running = OrderTaskStatus {
            phase: TaskPhase::Running,
            ..Default::default()
        };
        repo.patch_status("jobs", "a", &running).await.unwrap();

        let stored = repo.last_status("a").unwrap();
        assert_eq!(stored.phase, TaskPhase::Running);
        assert_eq!(stored.current_step, None);
        assert_eq!(stored.message, None);
        // skipped when absent, so the earlier value stays
        assert_eq!(stored.pod_name.as_deref(), Some("order-task-a"));
    }
}
