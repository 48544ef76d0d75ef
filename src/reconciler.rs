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

//! Dummy reconciliation.
//!
//! One pass reads the Dummy, echoes `spec.message` into the status, makes
//! sure the Dummy's pod exists and projects the pod's lifecycle into
//! `status.podStatus`. Every write re-asserts derived state, so passes can
//! run redundantly; a pass over a converged Dummy issues no writes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Container, ContainerPort, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::Action;
use kube::Resource;
use tracing::{debug, info, instrument};

use crate::crd::{Dummy, DummyStatus, PodStatus};
use crate::error::{Error, Result};
use crate::store::{ObjectKey, Store};

/// Image run by every Dummy pod.
pub const DEFAULT_POD_IMAGE: &str = "nginx:alpine";

/// Name of the pod's only container port.
pub const DEFAULT_PORT_NAME: &str = "http";

/// Number of the pod's only container port.
pub const DEFAULT_CONTAINER_PORT: i32 = 80;

/// Label carrying the owning Dummy's name.
pub const APP_LABEL: &str = "app";

/// Shape of the pod created for each Dummy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodTemplate {
    /// Container image.
    pub image: String,
    /// Name of the container port.
    pub port_name: String,
    /// Container port number, exposed over TCP.
    pub container_port: i32,
}

impl Default for PodTemplate {
    fn default() -> Self {
        Self {
            image: DEFAULT_POD_IMAGE.to_string(),
            port_name: DEFAULT_PORT_NAME.to_string(),
            container_port: DEFAULT_CONTAINER_PORT,
        }
    }
}

impl PodTemplate {
    /// Builds the pod owned by `dummy`.
    ///
    /// The pod shares the Dummy's name and namespace and carries a controller
    /// owner reference, so the garbage collector removes it with the Dummy.
    pub fn desired_pod(&self, dummy: &Dummy) -> Result<Pod> {
        let key = ObjectKey::of(dummy)?;
        let owner = dummy.controller_owner_ref(&()).ok_or_else(|| {
            Error::invalid_object(format!("dummy {key} has no uid for an owner reference"))
        })?;

        Ok(Pod {
            metadata: ObjectMeta {
                name: Some(key.name.clone()),
                namespace: Some(key.namespace),
                labels: Some(BTreeMap::from([(APP_LABEL.to_string(), key.name.clone())])),
                owner_references: Some(vec![owner]),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: key.name,
                    image: Some(self.image.clone()),
                    ports: Some(vec![ContainerPort {
                        name: Some(self.port_name.clone()),
                        protocol: Some("TCP".to_string()),
                        container_port: self.container_port,
                        ..ContainerPort::default()
                    }]),
                    ..Container::default()
                }],
                ..PodSpec::default()
            }),
            status: None,
        })
    }
}

/// What the dispatcher should do after a successful pass.
///
/// Passes are level-triggered and never ask for a requeue themselves; the
/// fields exist so the dispatcher contract is explicit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Re-run the pass immediately.
    pub requeue: bool,
    /// Re-run the pass after this delay.
    pub requeue_after: Option<Duration>,
}

impl From<ReconcileOutcome> for Action {
    fn from(outcome: ReconcileOutcome) -> Self {
        match outcome {
            ReconcileOutcome {
                requeue_after: Some(delay),
                ..
            } => Action::requeue(delay),
            ReconcileOutcome { requeue: true, .. } => Action::requeue(Duration::ZERO),
            _ => Action::await_change(),
        }
    }
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

/// Projects an observed pod onto `status.podStatus`.
///
/// A deletion timestamp wins over any phase. A running pod reports
/// `Running`. A pending pod only moves an empty status forward, and
/// anything else keeps `current`, so a known state is never downgraded.
pub fn observed_pod_status(pod: &Pod, current: PodStatus) -> PodStatus {
    if pod.metadata.deletion_timestamp.is_some() {
        return PodStatus::Removing;
    }
    match pod_phase(pod) {
        Some("Running") => PodStatus::Running,
        Some("Pending") if current.is_unknown() => PodStatus::Pending,
        _ => current,
    }
}

/// Reconciles Dummies against an injected [`Store`].
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store>,
    template: PodTemplate,
}

impl Reconciler {
    /// Creates a reconciler with the default pod template.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_template(store, PodTemplate::default())
    }

    /// Creates a reconciler that builds pods from `template`.
    pub fn with_template(store: Arc<dyn Store>, template: PodTemplate) -> Self {
        Self { store, template }
    }

    /// Returns the pod template.
    pub fn template(&self) -> &PodTemplate {
        &self.template
    }

    /// Runs one reconciliation pass for the Dummy at `key`.
    ///
    /// A missing Dummy is success: its pod goes away through the owner
    /// reference. Every other store failure is returned unchanged and the
    /// pass stops at that step.
    #[instrument(skip(self), fields(dummy = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let mut dummy = match self.store.get_dummy(key).await {
            Ok(dummy) => dummy,
            Err(e) if e.is_not_found() => {
                info!("dummy not found, assuming it was deleted");
                return Ok(ReconcileOutcome::default());
            }
            Err(e) => return Err(e),
        };

        let status = dummy.status_or_default();
        info!(
            message = %dummy.spec.message,
            spec_echo = %status.spec_echo,
            pod_status = %status.pod_status,
            "observed dummy"
        );

        if status.spec_echo != dummy.spec.message {
            let echoed = DummyStatus {
                spec_echo: dummy.spec.message.clone(),
                ..status
            };
            dummy = self.write_status(dummy, echoed).await?;
        }

        self.converge_pod(dummy).await?;
        Ok(ReconcileOutcome::default())
    }

    async fn converge_pod(&self, mut dummy: Dummy) -> Result<()> {
        let desired = self.template.desired_pod(&dummy)?;
        let pod_key = ObjectKey::of(&desired)?;

        let pod = match self.store.get_pod(&pod_key).await {
            Ok(pod) => pod,
            Err(e) if e.is_not_found() => {
                info!(pod = %pod_key, image = %self.template.image, "creating pod");
                let created = self.store.create_pod(&desired).await?;
                if pod_phase(&created) == Some("Pending") {
                    let pending = DummyStatus {
                        pod_status: PodStatus::Pending,
                        ..dummy.status_or_default()
                    };
                    dummy = self.write_status(dummy, pending).await?;
                }
                created
            }
            Err(e) => return Err(e),
        };

        let status = dummy.status_or_default();
        let observed = DummyStatus {
            pod_status: observed_pod_status(&pod, status.pod_status),
            ..status
        };
        self.write_status(dummy, observed).await?;
        Ok(())
    }

    /// Writes `status` if it differs from the Dummy's current status and
    /// returns the Dummy as stored.
    async fn write_status(&self, mut dummy: Dummy, status: DummyStatus) -> Result<Dummy> {
        if dummy.status_or_default() == status {
            debug!("status unchanged");
            return Ok(dummy);
        }
        debug!(
            spec_echo = %status.spec_echo,
            pod_status = %status.pod_status,
            "updating status"
        );
        dummy.status = Some(status);
        self.store.update_dummy_status(&dummy).await
    }
}
