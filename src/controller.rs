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

//! Core controller traits and types.
//!
//! [`Controller`] is the interface the controller manager runs.
//! [`DummyController`] implements it by driving a `kube::runtime`
//! controller, which acts as the dispatcher for [`crate::reconciler::Reconciler`]:
//! it watches Dummies and the pods they own, serializes passes per object
//! and requeues failed passes with the context's backoff.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::controller::{self, Action};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use thiserror::Error;

pub use tokio_util::sync::CancellationToken;

use crate::controller_context::ControllerContext;
use crate::crd::Dummy;
use crate::error::Error;
use crate::store::ObjectKey;

/// Errors that can occur when running a controller.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// The controller could not start.
    #[error("controller {name} failed to start: {source}")]
    StartFailed {
        /// Name of the controller.
        name: String,
        /// Underlying failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The controller failed while running.
    #[error("controller {name} runtime error: {source}")]
    Runtime {
        /// Name of the controller.
        name: String,
        /// Underlying failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

/// A long-running control loop managed by the controller manager.
///
/// # Lifecycle
///
/// 1. The controller is registered with the manager
/// 2. [`Controller::run`] is called with a cancellation token
/// 3. The controller runs until the token is cancelled or an error occurs
/// 4. [`Controller::shutdown`] is called to clean up resources
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// Returns the canonical name of this controller.
    ///
    /// Used in logs and as the health check name.
    fn name(&self) -> &str;

    /// Runs the controller's main loop until `cancel` fires or a fatal
    /// error occurs. Returns `Ok(())` on cancellation.
    async fn run(&self, cancel: CancellationToken) -> Result<()>;

    /// Reports whether the controller is functioning.
    ///
    /// Polled by the readiness endpoint. Defaults to healthy.
    fn health_check(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async { true })
    }

    /// Graceful shutdown hook, called after [`Controller::run`] returns.
    fn shutdown(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

/// Canonical name of the Dummy controller.
pub const DUMMY_CONTROLLER_NAME: &str = "dummy";

/// Reconcile entry point for the `kube::runtime` controller.
///
/// The watched object is only used for its key; the reconciler re-reads the
/// Dummy so every pass works on fresh state.
pub async fn reconcile(
    dummy: Arc<Dummy>,
    ctx: Arc<ControllerContext>,
) -> std::result::Result<Action, Error> {
    let key = ObjectKey::of(dummy.as_ref())?;
    let outcome = ctx.reconciler.reconcile(&key).await?;
    ctx.backoff.reset(&key);
    Ok(outcome.into())
}

/// Requeues a failed Dummy with per-object exponential backoff.
pub fn error_policy(dummy: Arc<Dummy>, error: &Error, ctx: Arc<ControllerContext>) -> Action {
    let key = ObjectKey::new(
        dummy.namespace().unwrap_or_default(),
        dummy.name_any(),
    );
    let delay = ctx.backoff.next_delay(&key);
    tracing::warn!(
        dummy = %key,
        error = %error,
        conflict = error.is_conflict(),
        not_found = error.is_not_found(),
        retry_in = ?delay,
        "reconciliation failed"
    );
    Action::requeue(delay)
}

/// Logs one item of the controller stream.
///
/// A requeue for an object that has left the cache means the Dummy was
/// deleted, so its retry state is dropped.
pub fn observe_result(
    ctx: &ControllerContext,
    result: std::result::Result<(ObjectRef<Dummy>, Action), controller::Error<Error, watcher::Error>>,
) {
    match result {
        Ok((obj, action)) => {
            tracing::debug!(dummy = %obj, ?action, "reconciled");
        }
        Err(controller::Error::ObjectNotFound(obj)) => {
            let key = ObjectKey::new(obj.namespace.unwrap_or_default(), obj.name);
            tracing::debug!(dummy = %key, "dummy is gone, dropping its backoff");
            ctx.backoff.reset(&key);
        }
        Err(e) => {
            tracing::debug!(error = %e, "reconcile loop error");
        }
    }
}

/// Controller for Dummy resources.
pub struct DummyController {
    client: Client,
    ctx: Arc<ControllerContext>,
    namespace: Option<String>,
    concurrency: u16,
    watching: AtomicBool,
}

impl DummyController {
    /// Creates a controller watching all namespaces.
    pub fn new(client: Client, ctx: ControllerContext) -> Self {
        Self {
            client,
            ctx: Arc::new(ctx),
            namespace: None,
            concurrency: 0,
            watching: AtomicBool::new(false),
        }
    }

    /// Restricts the watch to one namespace.
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    /// Limits the number of concurrent reconciliations. Zero means unbounded.
    pub fn with_concurrency(mut self, concurrency: u16) -> Self {
        self.concurrency = concurrency;
        self
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope, DynamicType = ()>,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl Controller for DummyController {
    fn name(&self) -> &str {
        DUMMY_CONTROLLER_NAME
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let dummies: Api<Dummy> = self.api();
        let pods: Api<Pod> = self.api();

        // Fail fast when the CRD is not installed instead of retrying forever.
        if let Err(e) = dummies.list(&kube::api::ListParams::default().limit(1)).await {
            return Err(ControllerError::StartFailed {
                name: DUMMY_CONTROLLER_NAME.to_string(),
                source: Box::new(e),
            });
        }

        tracing::info!(
            namespace = self.namespace.as_deref().unwrap_or("*"),
            concurrency = self.concurrency,
            "starting dummy controller"
        );

        let ctx = self.ctx.clone();
        let controller = controller::Controller::new(dummies, watcher::Config::default())
            .owns(pods, watcher::Config::default())
            .with_config(controller::Config::default().concurrency(self.concurrency))
            .run(reconcile, error_policy, self.ctx.clone())
            .for_each(move |result| {
                observe_result(&ctx, result);
                futures::future::ready(())
            });

        self.watching.store(true, Ordering::SeqCst);
        tokio::select! {
            _ = controller => {
                tracing::warn!("dummy controller stream ended");
            }
            _ = cancel.cancelled() => {
                tracing::info!("dummy controller shutting down");
            }
        }
        self.watching.store(false, Ordering::SeqCst);

        Ok(())
    }

    fn health_check(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        let watching = self.watching.load(Ordering::SeqCst);
        Box::pin(async move { watching })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DummySpec;
    use crate::memory_store::MemoryStore;
    use std::time::Duration;

    fn watched_dummy(store: &MemoryStore) -> Arc<Dummy> {
        Arc::new(store.insert_dummy("default", "test-dummy", "hello"))
    }

    #[tokio::test]
    async fn test_reconcile_adapter_awaits_change() {
        let store = Arc::new(MemoryStore::new());
        let dummy = watched_dummy(&store);
        let ctx = Arc::new(ControllerContext::with_store(store.clone()));

        let action = reconcile(dummy, ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(store.pod_count(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_adapter_rejects_cluster_scoped_object() {
        let store = Arc::new(MemoryStore::new());
        let ctx = Arc::new(ControllerContext::with_store(store.clone()));
        let dummy = Arc::new(Dummy::new("orphan", DummySpec::default()));

        let err = reconcile(dummy, ctx).await.unwrap_err();
        assert!(matches!(err, Error::InvalidObject(_)));
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_error_policy_backs_off_until_success() {
        let store = Arc::new(MemoryStore::new());
        let dummy = watched_dummy(&store);
        let ctx = Arc::new(ControllerContext::with_store(store.clone()));
        let key = ObjectKey::new("default", "test-dummy");
        let err = Error::transient("connection refused");

        let first = error_policy(dummy.clone(), &err, ctx.clone());
        let second = error_policy(dummy.clone(), &err, ctx.clone());
        assert_eq!(ctx.backoff.failures(&key), 2);
        assert_ne!(first, Action::await_change());
        assert_ne!(first, second);

        reconcile(dummy, ctx.clone()).await.unwrap();
        assert_eq!(ctx.backoff.failures(&key), 0);
    }

    #[tokio::test]
    async fn test_deleted_dummy_drops_backoff() {
        let store = Arc::new(MemoryStore::new());
        let dummy = watched_dummy(&store);
        let ctx = Arc::new(ControllerContext::with_store(store.clone()));
        let key = ObjectKey::new("default", "test-dummy");
        let err = Error::transient("connection refused");

        for _ in 0..3 {
            error_policy(dummy.clone(), &err, ctx.clone());
        }
        assert_eq!(ctx.backoff.failures(&key), 3);

        let gone = ObjectRef::<Dummy>::new("test-dummy").within("default").erase();
        observe_result(&ctx, Err(controller::Error::ObjectNotFound(gone)));
        assert_eq!(ctx.backoff.failures(&key), 0);

        // A recreated Dummy with the same key starts at the base delay.
        let delay = ctx.backoff.next_delay(&key);
        assert!(delay < Duration::from_millis(1100), "{delay:?}");
    }

    #[tokio::test]
    async fn test_other_stream_errors_keep_backoff() {
        let store = Arc::new(MemoryStore::new());
        let dummy = watched_dummy(&store);
        let ctx = Arc::new(ControllerContext::with_store(store));
        let key = ObjectKey::new("default", "test-dummy");

        error_policy(dummy, &Error::transient("connection refused"), ctx.clone());
        let failed = controller::Error::ReconcilerFailed(
            Error::transient("connection refused"),
            ObjectRef::<Dummy>::new("test-dummy").within("default").erase(),
        );
        observe_result(&ctx, Err(failed));
        assert_eq!(ctx.backoff.failures(&key), 1);
    }
}
