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

//! Typed access to the cluster object store.
//!
//! The reconciler touches exactly two kinds, so the store exposes a small
//! closed set of operations instead of a generic client. [`KubeStore`] backs
//! it with the Kubernetes API; [`crate::memory_store::MemoryStore`] backs it
//! with an in-process map for tests.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crate::crd::Dummy;
use crate::error::{Error, Result};

/// Kind name used in errors and logs for the owner resource.
pub const DUMMY_KIND: &str = "Dummy";

/// Kind name used in errors and logs for the child resource.
pub const POD_KIND: &str = "Pod";

/// Namespace and name of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace of the object.
    pub namespace: String,
    /// Name of the object.
    pub name: String,
}

impl ObjectKey {
    /// Creates a key from a namespace and a name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Builds the key of a namespaced resource.
    ///
    /// Fails if the resource has no namespace set.
    pub fn of<K: ResourceExt>(obj: &K) -> Result<Self> {
        let namespace = obj.namespace().ok_or_else(|| {
            Error::invalid_object(format!("{} has no namespace", obj.name_any()))
        })?;
        Ok(Self::new(namespace, obj.name_any()))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Operations the reconciler needs from the cluster store.
///
/// Implementations must report a missing object as [`Error::NotFound`] and a
/// stale or colliding write as [`Error::Conflict`]. Any other failure is
/// opaque to the caller.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// Reads a Dummy.
    async fn get_dummy(&self, key: &ObjectKey) -> Result<Dummy>;

    /// Reads a pod.
    async fn get_pod(&self, key: &ObjectKey) -> Result<Pod>;

    /// Creates a pod and returns it as stored.
    async fn create_pod(&self, pod: &Pod) -> Result<Pod>;

    /// Replaces the status subresource of a Dummy.
    ///
    /// The write is conditional on the Dummy's resource version. Returns the
    /// stored object, whose resource version must be used for any later
    /// write.
    async fn update_dummy_status(&self, dummy: &Dummy) -> Result<Dummy>;
}

/// [`Store`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Creates a store using the given client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dummies(&self, namespace: &str) -> Api<Dummy> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get_dummy(&self, key: &ObjectKey) -> Result<Dummy> {
        self.dummies(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| Error::from_kube(DUMMY_KIND, key, e))
    }

    async fn get_pod(&self, key: &ObjectKey) -> Result<Pod> {
        self.pods(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| Error::from_kube(POD_KIND, key, e))
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        let key = ObjectKey::of(pod)?;
        self.pods(&key.namespace)
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| Error::from_kube(POD_KIND, &key, e))
    }

    async fn update_dummy_status(&self, dummy: &Dummy) -> Result<Dummy> {
        let key = ObjectKey::of(dummy)?;
        let data = serde_json::to_vec(dummy)?;
        self.dummies(&key.namespace)
            .replace_status(&key.name, &PostParams::default(), data)
            .await
            .map_err(|e| Error::from_kube(DUMMY_KIND, &key, e))
    }
}
