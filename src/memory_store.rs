// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! In-memory object store.
//!
//! Behaves like a tiny API server for the two kinds the reconciler uses:
//! objects get a uid and a resource version, status writes are conditional
//! on the resource version, creates collide on existing names, and deleting
//! a Dummy cascades to the pods it controls. Tests drive pod lifecycle
//! changes through the `set_*`/`mark_*` helpers and can inject failures into
//! any operation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodStatus as K8sPodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::chrono::Utc;
use kube::ResourceExt;

use crate::crd::{Dummy, DummySpec};
use crate::error::{Error, Result};
use crate::store::{ObjectKey, Store, DUMMY_KIND, POD_KIND};

/// Store operations, used to target injected faults and read call counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// [`Store::get_dummy`]
    GetDummy,
    /// [`Store::get_pod`]
    GetPod,
    /// [`Store::create_pod`]
    CreatePod,
    /// [`Store::update_dummy_status`]
    UpdateDummyStatus,
}

/// Failure injected into the next call of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The store is unreachable.
    Unavailable,
    /// The write loses an optimistic-concurrency race.
    Conflict,
    /// The object is reported missing, as a stale cache would.
    NotFound,
}

#[derive(Default)]
struct State {
    dummies: BTreeMap<ObjectKey, Dummy>,
    pods: BTreeMap<ObjectKey, Pod>,
    faults: HashMap<StoreOp, VecDeque<Fault>>,
    calls: HashMap<StoreOp, usize>,
    status_writes: usize,
    pod_creates: usize,
    next_version: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    /// Counts the call and pops an injected fault, if any.
    fn enter(&mut self, op: StoreOp, kind: &'static str, key: &ObjectKey) -> Result<()> {
        *self.calls.entry(op).or_default() += 1;
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            None => Ok(()),
            Some(Fault::Unavailable) => Err(Error::transient(format!(
                "injected failure on {op:?} for {kind} {key}"
            ))),
            Some(Fault::Conflict) => Err(Error::Conflict {
                kind,
                key: key.clone(),
                message: format!("injected conflict on {op:?}"),
            }),
            Some(Fault::NotFound) => Err(Error::NotFound {
                kind,
                key: key.clone(),
            }),
        }
    }
}

/// [`Store`] kept entirely in process memory.
pub struct MemoryStore {
    state: Mutex<State>,
    initial_pod_phase: Option<String>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store whose new pods report phase `Pending`.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            initial_pod_phase: Some("Pending".to_string()),
        }
    }

    /// Sets the phase reported by freshly created pods. `None` leaves the
    /// pod without a status.
    pub fn with_initial_pod_phase(mut self, phase: Option<&str>) -> Self {
        self.initial_pod_phase = phase.map(str::to_string);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates a Dummy and returns it as stored.
    pub fn insert_dummy(&self, namespace: &str, name: &str, message: &str) -> Dummy {
        let mut state = self.lock();
        let version = state.next_version();
        let mut dummy = Dummy::new(
            name,
            DummySpec {
                message: message.to_string(),
            },
        );
        dummy.metadata.namespace = Some(namespace.to_string());
        dummy.metadata.uid = Some(format!("dummy-uid-{version}"));
        dummy.metadata.resource_version = Some(version);
        state
            .dummies
            .insert(ObjectKey::new(namespace, name), dummy.clone());
        dummy
    }

    /// Replaces the message of a stored Dummy, as a user edit would.
    pub fn set_message(&self, key: &ObjectKey, message: &str) -> bool {
        let mut state = self.lock();
        let version = state.next_version();
        match state.dummies.get_mut(key) {
            Some(dummy) => {
                dummy.spec.message = message.to_string();
                dummy.metadata.resource_version = Some(version);
                true
            }
            None => false,
        }
    }

    /// Deletes a Dummy and, like the garbage collector, every pod it controls.
    pub fn delete_dummy(&self, key: &ObjectKey) -> Option<Dummy> {
        let mut state = self.lock();
        let dummy = state.dummies.remove(key)?;
        let uid = dummy.uid();
        state.pods.retain(|_, pod| {
            !pod
                .owner_references()
                .iter()
                .any(|owner| Some(&owner.uid) == uid.as_ref())
        });
        Some(dummy)
    }

    /// Sets the phase of a stored pod, as the kubelet would.
    pub fn set_pod_phase(&self, key: &ObjectKey, phase: &str) -> bool {
        let mut state = self.lock();
        let version = state.next_version();
        match state.pods.get_mut(key) {
            Some(pod) => {
                pod.status.get_or_insert_with(K8sPodStatus::default).phase =
                    Some(phase.to_string());
                pod.metadata.resource_version = Some(version);
                true
            }
            None => false,
        }
    }

    /// Sets the deletion timestamp of a stored pod without removing it.
    pub fn mark_pod_terminating(&self, key: &ObjectKey) -> bool {
        let mut state = self.lock();
        let version = state.next_version();
        match state.pods.get_mut(key) {
            Some(pod) => {
                pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
                pod.metadata.resource_version = Some(version);
                true
            }
            None => false,
        }
    }

    /// Removes a pod outright.
    pub fn remove_pod(&self, key: &ObjectKey) -> Option<Pod> {
        self.lock().pods.remove(key)
    }

    /// Makes the next call of `op` fail with `fault`. Faults queue up.
    pub fn inject(&self, op: StoreOp, fault: Fault) {
        self.lock().faults.entry(op).or_default().push_back(fault);
    }

    /// Returns a copy of a stored Dummy.
    pub fn dummy(&self, key: &ObjectKey) -> Option<Dummy> {
        self.lock().dummies.get(key).cloned()
    }

    /// Returns a copy of a stored pod.
    pub fn pod(&self, key: &ObjectKey) -> Option<Pod> {
        self.lock().pods.get(key).cloned()
    }

    /// Number of stored pods.
    pub fn pod_count(&self) -> usize {
        self.lock().pods.len()
    }

    /// Number of calls made to `op`, failed ones included.
    pub fn calls(&self, op: StoreOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of successful status writes.
    pub fn status_writes(&self) -> usize {
        self.lock().status_writes
    }

    /// Number of successful pod creations.
    pub fn pod_creates(&self) -> usize {
        self.lock().pod_creates
    }

    /// Number of successful writes of any kind.
    pub fn writes(&self) -> usize {
        let state = self.lock();
        state.status_writes + state.pod_creates
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_dummy(&self, key: &ObjectKey) -> Result<Dummy> {
        let mut state = self.lock();
        state.enter(StoreOp::GetDummy, DUMMY_KIND, key)?;
        state.dummies.get(key).cloned().ok_or_else(|| Error::NotFound {
            kind: DUMMY_KIND,
            key: key.clone(),
        })
    }

    async fn get_pod(&self, key: &ObjectKey) -> Result<Pod> {
        let mut state = self.lock();
        state.enter(StoreOp::GetPod, POD_KIND, key)?;
        state.pods.get(key).cloned().ok_or_else(|| Error::NotFound {
            kind: POD_KIND,
            key: key.clone(),
        })
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        let key = ObjectKey::of(pod)?;
        let mut state = self.lock();
        state.enter(StoreOp::CreatePod, POD_KIND, &key)?;
        if state.pods.contains_key(&key) {
            return Err(Error::Conflict {
                kind: POD_KIND,
                key,
                message: "AlreadyExists".to_string(),
            });
        }

        let version = state.next_version();
        let mut stored = pod.clone();
        stored.metadata.uid = Some(format!("pod-uid-{version}"));
        stored.metadata.resource_version = Some(version);
        stored.status = self.initial_pod_phase.as_ref().map(|phase| K8sPodStatus {
            phase: Some(phase.clone()),
            ..K8sPodStatus::default()
        });

        state.pods.insert(key, stored.clone());
        state.pod_creates += 1;
        Ok(stored)
    }

    async fn update_dummy_status(&self, dummy: &Dummy) -> Result<Dummy> {
        let key = ObjectKey::of(dummy)?;
        let mut state = self.lock();
        state.enter(StoreOp::UpdateDummyStatus, DUMMY_KIND, &key)?;
        let version = state.next_version();

        let stored = state.dummies.get_mut(&key).ok_or_else(|| Error::NotFound {
            kind: DUMMY_KIND,
            key: key.clone(),
        })?;
        if stored.metadata.resource_version != dummy.metadata.resource_version {
            return Err(Error::Conflict {
                kind: DUMMY_KIND,
                key,
                message: format!(
                    "resource version {:?} is stale, current is {:?}",
                    dummy.metadata.resource_version, stored.metadata.resource_version
                ),
            });
        }

        stored.status = dummy.status.clone();
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        state.status_writes += 1;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ObjectKey {
        ObjectKey::new("default", "test-dummy")
    }

    #[tokio::test]
    async fn test_status_write_requires_current_version() {
        let store = MemoryStore::new();
        let dummy = store.insert_dummy("default", "test-dummy", "hello");

        let updated = store.update_dummy_status(&dummy).await.unwrap();
        assert_ne!(updated.resource_version(), dummy.resource_version());

        let err = store.update_dummy_status(&dummy).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.status_writes(), 1);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let store = MemoryStore::new();
        store.insert_dummy("default", "test-dummy", "hello");
        store.inject(StoreOp::GetDummy, Fault::Unavailable);
        store.inject(StoreOp::GetDummy, Fault::Conflict);

        assert!(matches!(
            store.get_dummy(&key()).await,
            Err(Error::Transient(_))
        ));
        assert!(store.get_dummy(&key()).await.unwrap_err().is_conflict());
        assert!(store.get_dummy(&key()).await.is_ok());
        assert_eq!(store.calls(StoreOp::GetDummy), 3);
    }

    #[tokio::test]
    async fn test_missing_objects_are_not_found() {
        let store = MemoryStore::new();
        assert!(store.get_dummy(&key()).await.unwrap_err().is_not_found());
        assert!(store.get_pod(&key()).await.unwrap_err().is_not_found());
        assert!(!store.set_pod_phase(&key(), "Running"));
    }
}
