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

//! Liveness and readiness endpoints.
//!
//! - `/healthz` answers `ok` while the process serves requests.
//! - `/readyz` answers `ok` only when every registered controller reports
//!   healthy, `503` otherwise.
//! - `/readyz/verbose` returns the per-controller result as JSON.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::http::StatusCode;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::controller::Controller;

/// Health of a single controller or of the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Healthy.
    Healthy,
    /// Unhealthy.
    Unhealthy,
}

impl From<bool> for HealthStatus {
    fn from(healthy: bool) -> Self {
        if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Readiness report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall status.
    pub status: HealthStatus,

    /// Status per controller name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub checks: BTreeMap<String, HealthStatus>,
}

/// Controllers whose health gates readiness.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    controllers: Arc<RwLock<Vec<Arc<dyn Controller>>>>,
}

impl HealthRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a controller to the readiness checks.
    pub async fn register(&self, controller: Arc<dyn Controller>) {
        self.controllers.write().await.push(controller);
    }

    /// Polls every registered controller.
    pub async fn check_all(&self) -> HealthReport {
        let controllers = self.controllers.read().await;
        let mut checks = BTreeMap::new();
        for controller in controllers.iter() {
            let healthy = controller.health_check().await;
            checks.insert(controller.name().to_string(), HealthStatus::from(healthy));
        }

        let healthy = checks.values().all(|s| *s == HealthStatus::Healthy);
        HealthReport {
            status: healthy.into(),
            checks,
        }
    }

    /// Returns the number of registered controllers.
    pub async fn len(&self) -> usize {
        self.controllers.read().await.len()
    }

    /// Returns true if no controller is registered.
    pub async fn is_empty(&self) -> bool {
        self.controllers.read().await.is_empty()
    }
}

/// HTTP server for the health endpoints.
///
/// The listener is bound in [`HealthServer::bind`], so a taken port is
/// reported before anything is spawned.
pub struct HealthServer {
    registry: HealthRegistry,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl HealthServer {
    /// Binds the listener for a server reporting on `registry`.
    pub async fn bind(
        registry: HealthRegistry,
        bind_address: &str,
        bind_port: u16,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind((bind_address, bind_port)).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            registry,
            listener,
            local_addr,
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves requests until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        tracing::info!("health server listening on {}", self.local_addr);

        loop {
            let (stream, _) = tokio::select! {
                accepted = self.listener.accept() => accepted?,
                _ = cancel.cancelled() => {
                    tracing::debug!("health server stopped");
                    return Ok(());
                }
            };
            let registry = self.registry.clone();
            let io = TokioIo::new(stream);

            tokio::task::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let registry = registry.clone();
                    async move { Ok::<_, hyper::Error>(route(req.uri().path(), &registry).await) }
                });
                if let Err(e) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await
                {
                    tracing::debug!(error = %e, "health connection error");
                }
            });
        }
    }

    /// Runs the server in a background task, logging a failure.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run(cancel).await {
                tracing::error!(error = %e, "health server failed");
            }
        })
    }
}

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

async fn route(path: &str, registry: &HealthRegistry) -> Response<Full<Bytes>> {
    match path {
        "/healthz" => respond(StatusCode::OK, "text/plain", "ok"),
        "/readyz" => match registry.check_all().await.status {
            HealthStatus::Healthy => respond(StatusCode::OK, "text/plain", "ok"),
            HealthStatus::Unhealthy => {
                respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "not ready")
            }
        },
        "/readyz/verbose" => {
            let report = registry.check_all().await;
            let status = match report.status {
                HealthStatus::Healthy => StatusCode::OK,
                HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
            };
            let json = serde_json::to_string(&report).unwrap_or_default();
            respond(status, "application/json", json)
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{CancellationToken, Result};
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use std::future::Future;
    use std::pin::Pin;

    struct StaticController {
        name: &'static str,
        healthy: bool,
    }

    #[async_trait]
    impl Controller for StaticController {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, _cancel: CancellationToken) -> Result<()> {
            Ok(())
        }

        fn health_check(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
            let healthy = self.healthy;
            Box::pin(async move { healthy })
        }
    }

    async fn body(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_empty_registry_is_ready() {
        let registry = HealthRegistry::new();
        assert!(registry.is_empty().await);
        assert_eq!(registry.check_all().await.status, HealthStatus::Healthy);

        let response = route("/readyz", &registry).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_one_unhealthy_controller_fails_readiness() {
        let registry = HealthRegistry::new();
        registry
            .register(Arc::new(StaticController { name: "dummy", healthy: true }))
            .await;
        registry
            .register(Arc::new(StaticController { name: "stuck", healthy: false }))
            .await;
        assert_eq!(registry.len().await, 2);

        let report = registry.check_all().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.checks.get("dummy"), Some(&HealthStatus::Healthy));
        assert_eq!(report.checks.get("stuck"), Some(&HealthStatus::Unhealthy));

        let response = route("/readyz", &registry).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = route("/readyz/verbose", &registry).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json: serde_json::Value = serde_json::from_str(&body(response).await).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["checks"]["stuck"], "unhealthy");
    }

    #[tokio::test]
    async fn test_liveness_and_unknown_paths() {
        let registry = HealthRegistry::new();
        registry
            .register(Arc::new(StaticController { name: "stuck", healthy: false }))
            .await;

        let response = route("/healthz", &registry).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, "ok");

        let response = route("/metrics", &registry).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bind_reports_taken_port() {
        let first = HealthServer::bind(HealthRegistry::new(), "127.0.0.1", 0)
            .await
            .unwrap();
        let port = first.local_addr().port();

        let err = HealthServer::bind(HealthRegistry::new(), "127.0.0.1", port)
            .await
            .err()
            .expect("port is already bound");
        assert_eq!(err.kind(), std::io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn test_server_stops_on_cancel() {
        let server = HealthServer::bind(HealthRegistry::new(), "127.0.0.1", 0)
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let handle = server.spawn(cancel.clone());

        cancel.cancel();
        handle.await.unwrap();
    }
}
