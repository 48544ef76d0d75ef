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

//! Controller manager - runs the controllers and the health server.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::OperatorConfig;
use crate::controller::{Controller, ControllerError, Result};
use crate::health::{HealthRegistry, HealthServer};

/// Name reported when the health server fails to start.
const HEALTH_SERVER_NAME: &str = "health-server";

/// The controller manager.
///
/// Owns the registered controllers and the root cancellation token. On
/// [`ControllerManager::run`] it starts the health server, runs every
/// controller concurrently and, once shutdown is requested, gives them
/// `shutdownTimeout` to stop.
pub struct ControllerManager {
    /// Configuration for this instance.
    config: Arc<OperatorConfig>,

    /// Registered controllers, in registration order.
    controllers: Vec<Arc<dyn Controller>>,

    /// Readiness checks backed by the controllers.
    health: HealthRegistry,

    /// Root cancellation token for shutdown.
    shutdown_token: CancellationToken,

    /// Controllers that are currently running.
    running_controllers: Arc<tokio::sync::RwLock<HashSet<String>>>,

    /// Whether to serve the health endpoints.
    serve_health: bool,
}

impl ControllerManager {
    /// Creates a new controller manager.
    pub fn new(config: OperatorConfig) -> Self {
        Self {
            config: Arc::new(config),
            controllers: Vec::new(),
            health: HealthRegistry::new(),
            shutdown_token: CancellationToken::new(),
            running_controllers: Arc::new(tokio::sync::RwLock::new(HashSet::new())),
            serve_health: true,
        }
    }

    /// Disables the health server. Used when the port is not available,
    /// for example in tests.
    pub fn without_health_server(mut self) -> Self {
        self.serve_health = false;
        self
    }

    /// Adds a controller.
    pub fn register_controller(&mut self, controller: Arc<dyn Controller>) -> &mut Self {
        self.controllers.push(controller);
        self
    }

    /// Returns the names of the registered controllers.
    pub fn controller_names(&self) -> Vec<String> {
        self.controllers.iter().map(|c| c.name().to_string()).collect()
    }

    /// Returns the health registry.
    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// Returns the shutdown cancellation token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Initiates a graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("initiating graceful shutdown");
        self.shutdown_token.cancel();
    }

    /// Runs the controller manager until every controller has stopped or
    /// shutdown is requested.
    pub async fn run(&self) -> Result<()> {
        if self.controllers.is_empty() {
            tracing::warn!("no controllers registered, exiting");
            return Ok(());
        }

        for controller in &self.controllers {
            self.health.register(controller.clone()).await;
        }

        let health_server = if self.serve_health {
            let server = HealthServer::bind(
                self.health.clone(),
                &self.config.generic.healthz_bind_address,
                self.config.generic.healthz_bind_port,
            )
            .await
            .map_err(|e| ControllerError::StartFailed {
                name: HEALTH_SERVER_NAME.to_string(),
                source: Box::new(e),
            })?;
            Some(server.spawn(self.shutdown_token.child_token()))
        } else {
            None
        };

        let result = self.run_controllers().await;

        if let Some(handle) = health_server {
            handle.abort();
        }
        result
    }

    /// Runs all controllers concurrently.
    async fn run_controllers(&self) -> Result<()> {
        let mut join_set = JoinSet::new();

        for controller in self.controllers.iter().cloned() {
            let name = controller.name().to_string();
            let cancel = self.shutdown_token.clone();
            let running = self.running_controllers.clone();

            join_set.spawn(async move {
                tracing::info!(controller = %name, "starting controller");
                running.write().await.insert(name.clone());

                let result = controller.run(cancel).await;

                running.write().await.remove(&name);
                if let Err(e) = controller.shutdown().await {
                    tracing::warn!(controller = %name, error = %e, "controller shutdown hook failed");
                }

                match result {
                    Ok(()) => {
                        tracing::info!(controller = %name, "controller terminated successfully");
                    }
                    Err(ref e) => {
                        tracing::error!(controller = %name, error = %e, "controller terminated with error");
                    }
                }

                (name, result)
            });
        }

        let finished = tokio::select! {
            result = join_all(&mut join_set) => Some(result),
            _ = self.shutdown_token.cancelled() => None,
        };

        match finished {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                self.shutdown_token.cancel();
                self.drain(&mut join_set).await;
                Err(e)
            }
            None => {
                tracing::info!("shutdown signal received, waiting for controllers to stop");
                self.drain(&mut join_set).await;
                Ok(())
            }
        }
    }

    /// Waits for the remaining controllers, up to the shutdown timeout.
    async fn drain(&self, join_set: &mut JoinSet<(String, Result<()>)>) {
        let deadline = tokio::time::Instant::now() + self.config.generic.shutdown_timeout;

        while !join_set.is_empty() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                let running = self.running_controllers.read().await;
                tracing::warn!(
                    controllers = ?running.iter().collect::<Vec<_>>(),
                    "shutdown timeout reached, controllers still running"
                );
                join_set.abort_all();
                break;
            }

            tokio::select! {
                result = join_set.join_next() => {
                    match result {
                        Some(Ok((name, Ok(())))) => {
                            tracing::debug!(controller = %name, "controller stopped");
                        }
                        Some(Ok((name, Err(e)))) => {
                            tracing::warn!(controller = %name, error = %e, "controller stopped with error");
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "controller task failed");
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(remaining.min(Duration::from_secs(1))) => {
                    let running = self.running_controllers.read().await;
                    if !running.is_empty() {
                        tracing::debug!(
                            controllers = ?running.iter().collect::<Vec<_>>(),
                            "still waiting for controllers"
                        );
                    }
                }
            }
        }
    }
}

/// Waits for every controller, returning the first failure.
async fn join_all(join_set: &mut JoinSet<(String, Result<()>)>) -> Result<()> {
    while let Some(result) = join_set.join_next().await {
        match result {
            Ok((name, Ok(()))) => {
                tracing::debug!(controller = %name, "controller finished");
            }
            Ok((_, Err(e))) => return Err(e),
            Err(e) => {
                if e.is_panic() {
                    tracing::error!("controller task panicked");
                }
                return Err(ControllerError::Runtime {
                    name: "unknown".to_string(),
                    source: e.into(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Runs until cancelled and records that its shutdown hook ran.
    struct WaitingController {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Controller for WaitingController {
        fn name(&self) -> &str {
            "waiting"
        }

        async fn run(&self, cancel: CancellationToken) -> Result<()> {
            cancel.cancelled().await;
            Ok(())
        }

        fn shutdown(
            &self,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
            self.stopped.store(true, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    struct FailingController;

    #[async_trait]
    impl Controller for FailingController {
        fn name(&self) -> &str {
            "failing"
        }

        async fn run(&self, _cancel: CancellationToken) -> Result<()> {
            Err(ControllerError::StartFailed {
                name: "failing".to_string(),
                source: "crd not installed".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_empty_manager_returns() {
        let manager = ControllerManager::new(OperatorConfig::default()).without_health_server();
        assert!(manager.run().await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_stops_controllers() {
        let stopped = Arc::new(AtomicBool::new(false));
        let mut manager = ControllerManager::new(OperatorConfig::default()).without_health_server();
        manager.register_controller(Arc::new(WaitingController {
            stopped: stopped.clone(),
        }));
        assert_eq!(manager.controller_names(), vec!["waiting".to_string()]);

        let token = manager.shutdown_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        manager.run().await.unwrap();
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(manager.health().len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_controller_stops_the_others() {
        let stopped = Arc::new(AtomicBool::new(false));
        let mut manager = ControllerManager::new(OperatorConfig::default()).without_health_server();
        manager
            .register_controller(Arc::new(WaitingController {
                stopped: stopped.clone(),
            }))
            .register_controller(Arc::new(FailingController));

        let err = manager.run().await.unwrap_err();
        assert!(matches!(err, ControllerError::StartFailed { .. }));
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_taken_health_port_fails_startup() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = OperatorConfig::default();
        config.generic.healthz_bind_address = "127.0.0.1".to_string();
        config.generic.healthz_bind_port = held.local_addr().unwrap().port();

        let stopped = Arc::new(AtomicBool::new(false));
        let mut manager = ControllerManager::new(config);
        manager.register_controller(Arc::new(WaitingController {
            stopped: stopped.clone(),
        }));

        let err = manager.run().await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::StartFailed { ref name, .. } if name == "health-server"
        ));
        assert!(!stopped.load(Ordering::SeqCst));
    }
}
